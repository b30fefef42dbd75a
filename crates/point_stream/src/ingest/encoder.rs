//! Batch decomposition and the 10/10/10-bit tiered position encoding.
//!
//! Every position is quantized to 30 bits per axis relative to the box of its
//! own batch, then split into three 10-bit tiers:
//!
//! | tier   | bits of Q | buffer     |
//! |--------|-----------|------------|
//! | `low`  | 20..30    | `xyz_low`  |
//! | `med`  | 10..20    | `xyz_med`  |
//! | `high` | 0..10     | `xyz_high` |
//!
//! Each tier word packs the three axes as `x | y << 10 | z << 20`. A renderer
//! reading only `xyz_low` gets 10-bit precision, adding `xyz_med` gives 20 bits,
//! all three reproduce Q exactly.

use crate::config::POINTS_PER_BATCH;
use crate::data::{Aabb, Batch, BatchMetadata, LoadTask, PointBlock, ReadPoints, UploadTask};
use crate::error::{Result, StreamError};
use glam::DVec3;
use std::time::Instant;

pub const STEPS_30BIT: u32 = 1 << 30;
pub const MASK_30BIT: u32 = STEPS_30BIT - 1;
pub const MASK_10BIT: u32 = (1 << 10) - 1;

/// Fixed-point position of `c` inside `[min, min + size]`, in `0..2^30`.
/// A degenerate axis (zero extent) maps everything to 0.
#[inline]
pub fn quantize_axis(c: f64, min: f64, size: f64) -> u32 {
    if !(size > 0.0) {
        return 0;
    }
    let q = ((c - min) / size * STEPS_30BIT as f64).floor();
    q.clamp(0.0, MASK_30BIT as f64) as u32
}

#[inline]
pub fn quantize(p: DVec3, bounds: &Aabb) -> [u32; 3] {
    let size = bounds.size();
    [
        quantize_axis(p.x, bounds.min.x, size.x),
        quantize_axis(p.y, bounds.min.y, size.y),
        quantize_axis(p.z, bounds.min.z, size.z),
    ]
}

/// `[low, med, high]` 10-bit fields of a 30-bit value.
#[inline]
pub fn split_tiers(q: u32) -> [u32; 3] {
    [(q >> 20) & MASK_10BIT, (q >> 10) & MASK_10BIT, q & MASK_10BIT]
}

#[inline]
pub fn join_tiers(low: u32, med: u32, high: u32) -> u32 {
    high | (med << 10) | (low << 20)
}

#[inline]
pub fn pack_tier(x: u32, y: u32, z: u32) -> u32 {
    (x & MASK_10BIT) | ((y & MASK_10BIT) << 10) | ((z & MASK_10BIT) << 20)
}

#[inline]
pub fn unpack_tier(word: u32) -> [u32; 3] {
    [word & MASK_10BIT, (word >> 10) & MASK_10BIT, (word >> 20) & MASK_10BIT]
}

/// 16-bit samples are reduced to 8 bits; 8-bit samples pass through.
#[inline]
pub fn downsample_channel(c: u16) -> u32 {
    if c > 255 {
        c as u32 / 256
    } else {
        c as u32
    }
}

#[inline]
pub fn pack_color([r, g, b]: [u16; 3]) -> u32 {
    downsample_channel(r) | (downsample_channel(g) << 8) | (downsample_channel(b) << 16)
}

/// Split a load task into batches of `POINTS_PER_BATCH`; the last may be short.
pub fn plan_batches(task: &LoadTask) -> Vec<Batch> {
    let num_batches = task.num_points.div_ceil(POINTS_PER_BATCH);
    let point_offset = task.point_offset();
    let mut batches = Vec::with_capacity(num_batches as usize);

    let mut processed = 0u64;
    while processed < task.num_points {
        let num_points = POINTS_PER_BATCH.min(task.num_points - processed);
        batches.push(Batch {
            task_offset: processed,
            source_offset: task.first_point + processed,
            point_offset: point_offset + processed,
            num_points,
            source_index: task.source.index,
            bounds: Aabb::EMPTY,
        });
        processed += num_points;
    }

    batches
}

/// Read the task's points and encode them.
pub fn encode(task: &LoadTask) -> Result<UploadTask> {
    let started = Instant::now();
    let block = task.source.read_block(task.first_point, task.num_points)?;

    if block.len() as u64 != task.num_points || block.colors.len() != block.len() {
        return Err(StreamError::io(
            &task.source.name,
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "expected {} points, read {} positions / {} colors",
                    task.num_points,
                    block.len(),
                    block.colors.len()
                ),
            ),
        ));
    }

    let upload = encode_block(task, &block);

    log::debug!(
        "encoded {} points ({} batches) of '{}' at {} in {:.1} ms",
        upload.num_points,
        upload.num_batches,
        task.source.name,
        upload.point_offset,
        started.elapsed().as_secs_f64() * 1e3
    );

    Ok(upload)
}

/// Encode an already decoded block. `block` must hold exactly the task's points.
pub fn encode_block(task: &LoadTask, block: &PointBlock) -> UploadTask {
    let n = task.num_points as usize;
    let origin = task.source.bounds.min;
    let mut batches = plan_batches(task);

    let mut xyz_low = vec![0u32; n];
    let mut xyz_med = vec![0u32; n];
    let mut xyz_high = vec![0u32; n];
    let mut colors = vec![0u32; n];
    let mut metadata = Vec::with_capacity(batches.len());

    for batch in &mut batches {
        let start = batch.task_offset as usize;
        let end = start + batch.num_points as usize;
        let positions = &block.positions[start..end];

        for p in positions {
            batch.bounds.expand_point(*p - origin);
        }

        for (i, p) in positions.iter().enumerate() {
            let index = start + i;
            let [qx, qy, qz] = quantize(*p - origin, &batch.bounds);
            let [lx, mx, hx] = split_tiers(qx);
            let [ly, my, hy] = split_tiers(qy);
            let [lz, mz, hz] = split_tiers(qz);

            xyz_low[index] = pack_tier(lx, ly, lz);
            xyz_med[index] = pack_tier(mx, my, mz);
            xyz_high[index] = pack_tier(hx, hy, hz);
            colors[index] = pack_color(block.colors[index]);
        }

        metadata.push(BatchMetadata::from_batch(batch));
    }

    UploadTask {
        source: task.source.clone(),
        point_offset: task.point_offset(),
        num_points: task.num_points,
        num_batches: batches.len() as u64,
        xyz_low,
        xyz_med,
        xyz_high,
        colors,
        batches: metadata,
    }
}
