//! Shared fixtures for integration tests.

#![allow(dead_code)]

use avv::format::{AvvWriter, FrameBuilder, SegmentBuilder, TextureBuilder};
use avv::pool::MemoryPool;
use avv::reader::{AvvReader, ReaderConfig, ReaderState, Request};
use avv::util::{Aabb, Vec3};

/// A clip with one quad per segment. Frame `i` has colors `[i; 4]`, and a
/// luma texture when `i` is even.
pub fn clip(frames_per_segment: &[u32]) -> Vec<u8> {
    let bounds = Aabb::new(Vec3::ZERO, Vec3::ONE);
    let mut writer = AvvWriter::new();
    let mut frame = 0u16;
    for &count in frames_per_segment {
        let segment = SegmentBuilder::new()
            .pos16(bounds, &[Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::ONE])
            .tris16(&[0, 1, 2, 2, 1, 3])
            .build();
        let frames = (0..count)
            .map(|_| {
                let mut builder = FrameBuilder::new().colors565(&[frame; 4]);
                if frame % 2 == 0 {
                    builder = builder.texture(&TextureBuilder::luma8(&[frame as u8; 4]));
                }
                frame += 1;
                builder.build()
            })
            .collect();
        writer.add_segment(segment, frames);
    }
    writer.to_bytes()
}

pub fn reader() -> AvvReader {
    AvvReader::new(MemoryPool::new(), ReaderConfig::default())
}

/// Update until the reader is idle, collecting finished requests.
pub fn drain(reader: &AvvReader) -> Vec<Request> {
    let mut out = Vec::new();
    for _ in 0..100_000 {
        reader.update();
        while let Some(request) = reader.get_finished_request() {
            out.push(request);
        }
        if reader.pending_count() == 0 && reader.state() == ReaderState::Ready {
            break;
        }
        std::thread::yield_now();
    }
    out
}
