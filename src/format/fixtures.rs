//! Small synthetic streams for unit tests.

use super::import::{import_avv, ImportOptions};
use super::package::Package;
use super::writer::{AvvWriter, FrameBuilder, SegmentBuilder, TextureBuilder};
use crate::util::{Aabb, Vec3};

pub(crate) const VERTICES: usize = 4;

/// One quad per segment; every frame carries colors, even frames a luma texture.
pub(crate) fn stream(frames_per_segment: &[u32]) -> Vec<u8> {
    let bounds = Aabb::new(Vec3::ZERO, Vec3::ONE);
    let mut writer = AvvWriter::new();
    let mut frame_index = 0u16;
    for (s, &count) in frames_per_segment.iter().enumerate() {
        let offset = s as f32;
        let positions = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, offset.min(1.0)),
            Vec3::new(1.0, 1.0, 1.0),
        ];
        let segment = SegmentBuilder::new()
            .pos16(bounds, &positions)
            .tris16(&[0, 1, 2, 2, 1, 3])
            .uvs16(&[[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]])
            .build();
        let frames = (0..count)
            .map(|_| {
                let mut frame = FrameBuilder::new().colors565(&[frame_index; VERTICES]);
                if frame_index % 2 == 0 {
                    frame = frame.texture(&TextureBuilder::luma8(&[frame_index as u8; 4]));
                }
                frame_index += 1;
                frame.build()
            })
            .collect();
        writer.add_segment(segment, frames);
    }
    writer.to_bytes()
}

pub(crate) fn package(frames_per_segment: &[u32]) -> Package {
    import_avv(&stream(frames_per_segment), &ImportOptions::default()).expect("fixture imports")
}
