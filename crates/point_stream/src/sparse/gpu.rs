//! wgpu backend.
//!
//! wgpu has no sparse buffer residency, so each logical buffer is a row of
//! fixed-size segments that are created on first commit. A segment is one page.
//! The rasterizer binds the segments it needs through [`WgpuSparseBuffer::segments`].

use super::{check_commit, page_span, SparseAllocator, SparseBuffer};
use crate::error::{Result, StreamError};
use roaring::RoaringBitmap;
use std::ops::Range;
use std::sync::Arc;

/// Largest segment the allocator will ask for.
pub const MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Device and queue shared by every sparse buffer.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: wgpu::AdapterInfo,
}

impl GpuContext {
    /// Create a device without a surface.
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| StreamError::Gpu("no suitable GPU adapter".into()))?;

        // Large storage buffers need the adapter's own limits, not the defaults.
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("point_stream device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| StreamError::Gpu(e.to_string()))?;

        let adapter_info = adapter.get_info();
        log::info!("using adapter {} ({:?})", adapter_info.name, adapter_info.backend);

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }

    /// Blocking variant of [`GpuContext::new_headless`].
    pub fn new_headless_blocking() -> Result<Self> {
        pollster::block_on(Self::new_headless())
    }
}

#[derive(Clone)]
pub struct WgpuAllocator {
    gpu: GpuContext,
    segment_size: u64,
}

impl WgpuAllocator {
    /// `segment_size` is clamped to the device's storage binding limit and
    /// rounded down to the copy alignment.
    pub fn new(gpu: GpuContext, segment_size: u64) -> Result<Self> {
        let limits = gpu.device.limits();
        let limit = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        let segment_size = segment_size.min(limit).min(MAX_SEGMENT_SIZE);
        let segment_size = segment_size - segment_size % wgpu::COPY_BUFFER_ALIGNMENT;

        if segment_size == 0 {
            return Err(StreamError::InvalidConfig("segment size rounds to zero".into()));
        }

        Ok(Self { gpu, segment_size })
    }

    #[inline]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

impl SparseAllocator for WgpuAllocator {
    type Buffer = WgpuSparseBuffer;

    fn allocate(&self, label: &str, capacity: u64) -> Result<WgpuSparseBuffer> {
        let count = capacity.div_ceil(self.segment_size);
        if count > u32::MAX as u64 {
            return Err(StreamError::InvalidConfig(format!(
                "{}: {} segments of {} bytes exceed the addressable range",
                label, count, self.segment_size
            )));
        }

        Ok(WgpuSparseBuffer {
            label: label.to_string(),
            device: self.gpu.device.clone(),
            queue: self.gpu.queue.clone(),
            capacity,
            segment_size: self.segment_size,
            segments: Vec::new(),
            committed: RoaringBitmap::new(),
        })
    }
}

pub struct WgpuSparseBuffer {
    label: String,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    capacity: u64,
    segment_size: u64,
    segments: Vec<Option<wgpu::Buffer>>,
    committed: RoaringBitmap,
}

impl WgpuSparseBuffer {
    #[inline]
    fn segment_len(&self, segment: u64) -> u64 {
        let len = self.segment_size.min(self.capacity - segment * self.segment_size);
        len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
    }

    /// Committed segments with their byte offset in the logical buffer.
    pub fn segments(&self) -> impl Iterator<Item = (u64, &wgpu::Buffer)> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter_map(move |(i, s)| s.as_ref().map(|b| (i as u64 * self.segment_size, b)))
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }
}

impl SparseBuffer for WgpuSparseBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn page_size(&self) -> u64 {
        self.segment_size
    }

    fn commit(&mut self, range: Range<u64>) -> Result<()> {
        check_commit(&range, self.segment_size, self.capacity)?;
        let span = page_span(range.start, range.end - range.start, self.segment_size);

        if self.segments.len() < span.end as usize {
            self.segments.resize_with(span.end as usize, || None);
        }

        for segment in span {
            if !self.committed.insert(segment as u32) {
                continue;
            }
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{} [{}]", self.label, segment)),
                size: self.segment_len(segment),
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            self.segments[segment as usize] = Some(buffer);
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if offset + len > self.capacity {
            return Err(StreamError::CapacityExceeded {
                offset,
                count: len,
                capacity: self.capacity,
            });
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(StreamError::Gpu(format!(
                "{}: unaligned write of {} bytes at {}",
                self.label, len, offset
            )));
        }

        let mut cursor = offset;
        let mut rest = bytes;
        while !rest.is_empty() {
            let segment = cursor / self.segment_size;
            let within = cursor - segment * self.segment_size;
            let buffer = self
                .segments
                .get(segment as usize)
                .and_then(|s| s.as_ref())
                .ok_or(StreamError::Uncommitted { offset, len })?;
            let n = (rest.len() as u64).min(self.segment_size - within) as usize;
            self.queue.write_buffer(buffer, within, &rest[..n]);
            rest = &rest[n..];
            cursor += n as u64;
        }
        Ok(())
    }

    fn committed_bytes(&self) -> u64 {
        self.committed
            .iter()
            .map(|s| self.segment_size.min(self.capacity - s as u64 * self.segment_size))
            .sum()
    }

    fn decommit_all(&mut self) {
        for buffer in self.segments.drain(..).flatten() {
            buffer.destroy();
        }
        self.committed.clear();
    }
}
