//! Units of work flowing through the pipeline and the GPU-facing record layouts.

use crate::config::BATCH_METADATA_BYTES;
use crate::data::source::PointSource;
use glam::DVec3;
use std::sync::Arc;

/// Axis-aligned box in f64. The empty box uses +/- infinity sentinels so the
/// first `expand_point` snaps it onto the point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: DVec3::INFINITY,
        max: DVec3::NEG_INFINITY,
    };

    #[inline]
    pub fn new(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    #[inline]
    pub fn expand_point(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn union(self, other: Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    #[inline]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn half_size(&self) -> DVec3 {
        self.size() * 0.5
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a DVec3>) -> Aabb {
        points.into_iter().fold(Aabb::EMPTY, |mut acc, p| {
            acc.expand_point(*p);
            acc
        })
    }
}

/// A contiguous slice of a load task, the unit of one rasterizer workgroup.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// First point relative to the owning load task.
    pub task_offset: u64,
    /// First point relative to the owning source.
    pub source_offset: u64,
    /// First point in the global index space.
    pub point_offset: u64,
    pub num_points: u64,
    pub source_index: u32,
    /// Box of the batch's points, relative to the source's minimum corner.
    pub bounds: Aabb,
}

/// One 64-byte record of the batch metadata buffer.
/// Must match the `Batch` struct read by the rasterizer's compute shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BatchMetadata {
    pub _reserved: u32,
    /// Batch box, relative to the owning source's minimum corner.
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub num_points: u32,
    /// First point of the batch in the global index space.
    pub point_offset: u32,
    pub source_index: u32,
    pub _pad: [u32; 6],
}

const _: () = assert!(std::mem::size_of::<BatchMetadata>() == BATCH_METADATA_BYTES as usize);

impl BatchMetadata {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            _reserved: 0,
            min: batch.bounds.min.as_vec3().to_array(),
            max: batch.bounds.max.as_vec3().to_array(),
            num_points: batch.num_points as u32,
            point_offset: batch.point_offset as u32,
            source_index: batch.source_index,
            _pad: [0; 6],
        }
    }
}

/// Read `num_points` points of `source`, starting at `first_point`.
#[derive(Debug, Clone)]
pub struct LoadTask {
    pub source: Arc<PointSource>,
    pub first_point: u64,
    pub num_points: u64,
}

impl LoadTask {
    /// Where the task's first point lands in the global index space.
    #[inline]
    pub fn point_offset(&self) -> u64 {
        self.source.sparse_point_offset + self.first_point
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.source.generation
    }
}

/// Encoded attributes of one load task, waiting for the render thread.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub source: Arc<PointSource>,
    pub point_offset: u64,
    pub num_points: u64,
    pub num_batches: u64,
    /// Coarsest tier: bits 20..30 of each quantized axis.
    pub xyz_low: Vec<u32>,
    pub xyz_med: Vec<u32>,
    /// Finest tier: bits 0..10 of each quantized axis.
    pub xyz_high: Vec<u32>,
    pub colors: Vec<u32>,
    pub batches: Vec<BatchMetadata>,
}

impl UploadTask {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.source.generation
    }

    /// The four per-point attribute streams in buffer order.
    pub fn attribute_bytes(&self) -> [&[u8]; 4] {
        [
            bytemuck::cast_slice(&self.xyz_low),
            bytemuck::cast_slice(&self.xyz_med),
            bytemuck::cast_slice(&self.xyz_high),
            bytemuck::cast_slice(&self.colors),
        ]
    }

    #[inline]
    pub fn batch_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.batches)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }
}
