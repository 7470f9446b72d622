//! Skeleton metadata and packed bone poses.

use avv_codec::PosQuat128;

use super::read_util::ByteReader;
use crate::util::{Aabb, Error, Quat, Result, Vec3};

/// Fixed size of a bone name field.
pub const BONE_NAME_LEN: usize = 32;

/// Static bone information from the skeleton meta container.
#[derive(Debug, Clone, PartialEq)]
pub struct BoneInfo {
    /// Parent bone index, `-1` for roots.
    pub parent: i32,
    pub name: String,
}

/// Decoded bone positions and rotations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkeletonPose {
    pub skeleton_index: u32,
    pub bounds: Aabb,
    pub positions: Vec<Vec3>,
    pub rotations: Vec<Quat>,
}

impl SkeletonPose {
    pub fn bone_count(&self) -> usize {
        self.positions.len()
    }
}

/// Skeleton declared in the container metadata, with its reference pose.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Skeleton {
    pub bones: Vec<BoneInfo>,
    pub reference_pose: SkeletonPose,
}

impl Skeleton {
    pub fn skeleton_index(&self) -> u32 {
        self.reference_pose.skeleton_index
    }

    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    /// Index of the bone named `name`.
    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|b| b.name == name)
    }
}

/// Parse a skeleton meta payload.
pub(crate) fn parse_skeleton(r: &mut ByteReader<'_>) -> Result<Skeleton> {
    let skeleton_index = r.u32()?;
    let bone_count = r.counted(4 + BONE_NAME_LEN)?;

    let mut bones = Vec::with_capacity(bone_count as usize);
    for _ in 0..bone_count {
        let parent = r.i32()?;
        let raw = r.bytes(BONE_NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(BONE_NAME_LEN);
        bones.push(BoneInfo {
            parent,
            name: String::from_utf8_lossy(&raw[..end]).into_owned(),
        });
    }

    let reference_pose = parse_pose(r, skeleton_index, bone_count)?;
    Ok(Skeleton {
        bones,
        reference_pose,
    })
}

/// Parse `aabb` + `bone_count` packed position/rotation pairs.
pub(crate) fn parse_pose(
    r: &mut ByteReader<'_>,
    skeleton_index: u32,
    bone_count: u32,
) -> Result<SkeletonPose> {
    let bounds = r.aabb()?;
    let needed = bone_count as usize * 16;
    if needed > r.remaining() {
        return Err(Error::eof(r.offset(), needed, r.remaining()));
    }

    let min = bounds.min.to_array();
    let max = bounds.max.to_array();
    let mut positions = Vec::with_capacity(bone_count as usize);
    let mut rotations = Vec::with_capacity(bone_count as usize);
    for _ in 0..bone_count {
        let packed = PosQuat128::unpack(r.u64()?, r.u64()?);
        positions.push(Vec3::from_array(packed.position(min, max)));
        rotations.push(Quat::from_array(packed.rotation()));
    }

    Ok(SkeletonPose {
        skeleton_index,
        bounds,
        positions,
        rotations,
    })
}
