//! Registered point sources and the two ways of reading their points.

use crate::data::types::Aabb;
use crate::error::{Result, StreamError};
use glam::DVec3;
use lasrec::{LasHeader, RecordView};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Color used for formats that carry no RGB.
pub const WHITE_RGB: [u16; 3] = [u16::MAX; 3];

/// Decoded points of one contiguous range of a source.
#[derive(Debug, Clone, Default)]
pub struct PointBlock {
    /// Absolute positions in the source's coordinate system.
    pub positions: Vec<DVec3>,
    /// 8- or 16-bit channel samples, one triple per position.
    pub colors: Vec<[u16; 3]>,
}

impl PointBlock {
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Capability shared by every ingestion strategy.
pub trait ReadPoints {
    fn read_block(&self, first: u64, count: u64) -> Result<PointBlock>;
}

/// A LAS file on disk, described by its parsed header.
#[derive(Debug, Clone)]
pub struct LasFile {
    pub path: PathBuf,
    pub header: LasHeader,
}

impl ReadPoints for LasFile {
    fn read_block(&self, first: u64, count: u64) -> Result<PointBlock> {
        let bytes = lasrec::read_point_bytes(&self.path, &self.header, first, count)
            .map_err(|e| StreamError::io(&self.path, e))?;
        let view = RecordView::new(&bytes, &self.header).map_err(|e| StreamError::io(&self.path, e))?;

        let scale = DVec3::from_array(self.header.scale);
        let offset = DVec3::from_array(self.header.offset);

        let mut block = PointBlock {
            positions: Vec::with_capacity(view.len()),
            colors: Vec::with_capacity(view.len()),
        };

        for i in 0..view.len() {
            let [x, y, z] = view.xyz_raw(i);
            let raw = DVec3::new(x as f64, y as f64, z as f64);
            block.positions.push(raw * scale + offset);
        }
        if view.has_rgb() {
            block.colors.extend((0..view.len()).filter_map(|i| view.rgb(i)));
        } else {
            block.colors.resize(view.len(), WHITE_RGB);
        }

        Ok(block)
    }
}

/// Pre-decoded points handed over by an external reader.
#[derive(Debug, Clone, Default)]
pub struct PointRecords {
    pub positions: Vec<DVec3>,
    pub colors: Option<Vec<[u16; 3]>>,
}

impl PointRecords {
    pub fn new(positions: Vec<DVec3>, colors: Vec<[u16; 3]>) -> Self {
        Self {
            positions,
            colors: Some(colors),
        }
    }

    /// Fails unless every position has a color.
    pub fn check_complete(&self, name: &str) -> Result<()> {
        match &self.colors {
            Some(colors) if colors.len() == self.positions.len() => Ok(()),
            _ => Err(StreamError::MissingAttribute {
                source_name: name.to_string(),
                attribute: "rgb",
            }),
        }
    }
}

impl ReadPoints for PointRecords {
    fn read_block(&self, first: u64, count: u64) -> Result<PointBlock> {
        let start = first as usize;
        let end = start + count as usize;
        let colors = self.colors.as_deref().unwrap_or(&[]);

        if end > self.positions.len() || end > colors.len() {
            return Err(StreamError::io(
                "<memory>",
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("range {}..{} outside of {} records", start, end, self.positions.len()),
                ),
            ));
        }

        Ok(PointBlock {
            positions: self.positions[start..end].to_vec(),
            colors: colors[start..end].to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum SourceKind {
    LasFile(LasFile),
    Records(PointRecords),
}

impl ReadPoints for SourceKind {
    fn read_block(&self, first: u64, count: u64) -> Result<PointBlock> {
        match self {
            SourceKind::LasFile(file) => file.read_block(first, count),
            SourceKind::Records(records) => records.read_block(first, count),
        }
    }
}

/// One registered source. Immutable after registration apart from progress.
#[derive(Debug)]
pub struct PointSource {
    /// Registration ordinal within the session; written into batch metadata.
    pub index: u32,
    /// Session generation the source was registered in.
    pub generation: u64,
    pub name: String,
    /// Point count after the capacity clamp.
    pub num_points: u64,
    pub num_batches: u64,
    /// First slot of this source in the global index space.
    pub sparse_point_offset: u64,
    pub bounds: Aabb,
    pub kind: SourceKind,
    points_loaded: AtomicU64,
    batches_loaded: AtomicU64,
    failed: AtomicBool,
}

impl PointSource {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: u32,
        generation: u64,
        name: String,
        num_points: u64,
        num_batches: u64,
        sparse_point_offset: u64,
        bounds: Aabb,
        kind: SourceKind,
    ) -> Self {
        Self {
            index,
            generation,
            name,
            num_points,
            num_batches,
            sparse_point_offset,
            bounds,
            kind,
            points_loaded: AtomicU64::new(0),
            batches_loaded: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn points_loaded(&self) -> u64 {
        self.points_loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn batches_loaded(&self) -> u64 {
        self.batches_loaded.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.points_loaded() >= self.num_points
    }

    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn record_upload(&self, points: u64, batches: u64) {
        self.points_loaded.fetch_add(points, Ordering::AcqRel);
        self.batches_loaded.fetch_add(batches, Ordering::AcqRel);
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

impl ReadPoints for PointSource {
    fn read_block(&self, first: u64, count: u64) -> Result<PointBlock> {
        self.kind.read_block(first, count)
    }
}
