//! Source registration and task splitting.
//!
//! Registration runs in two phases. Describing a source (parsing a header,
//! validating records) may fail and touches no shared state. Only once every
//! source of a call is described are global offsets assigned and tasks queued,
//! all under the load-queue lock.

use crate::config::POINTS_PER_BATCH;
use crate::context::StreamContext;
use crate::data::{Aabb, LasFile, LoadTask, PointRecords, PointSource, SourceKind};
use crate::error::{Result, StreamError};
use glam::DVec3;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Outcome of one registration call.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Newly registered sources, in the order they were passed.
    pub sources: Vec<Arc<PointSource>>,
    /// Union of the new sources' boxes.
    pub bounds: Aabb,
    /// `(name, declared count)` of every source whose count was clamped.
    pub clamped: Vec<(String, u64)>,
}

/// A validated source that has not been assigned global indices yet.
#[derive(Debug)]
pub struct PendingSource {
    pub name: String,
    /// Point count as declared by the source, before clamping.
    pub declared_points: u64,
    pub bounds: Aabb,
    pub kind: SourceKind,
}

fn has_las_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("las"))
        .unwrap_or(false)
}

/// Validate a file and parse its header.
pub fn describe_file(path: &Path) -> Result<PendingSource> {
    if !has_las_extension(path) {
        let reason = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("laz") => "compressed LAZ input is not supported".to_string(),
            Some(ext) => format!("unrecognized extension '.{}'", ext),
            None => "missing file extension".to_string(),
        };
        return Err(StreamError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        });
    }

    let header = lasrec::read_header(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::InvalidData => StreamError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        _ => StreamError::io(path, e),
    })?;

    if header.rgb_offset().is_none() {
        log::warn!(
            "{}: point format {} carries no RGB, points will be white",
            path.display(),
            header.point_format
        );
    }

    Ok(PendingSource {
        name: path.display().to_string(),
        declared_points: header.num_points,
        bounds: Aabb::new(DVec3::from_array(header.min), DVec3::from_array(header.max)),
        kind: SourceKind::LasFile(LasFile {
            path: path.to_path_buf(),
            header,
        }),
    })
}

/// Validate pre-decoded records. Bounds are computed from the positions.
pub fn describe_records(name: &str, records: PointRecords) -> Result<PendingSource> {
    records.check_complete(name)?;
    Ok(PendingSource {
        name: name.to_string(),
        declared_points: records.positions.len() as u64,
        bounds: Aabb::from_points(&records.positions),
        kind: SourceKind::Records(records),
    })
}

/// Cut a source into load tasks of at most `points_per_task` points.
pub fn split_into_tasks(source: &Arc<PointSource>, points_per_task: u64) -> Vec<LoadTask> {
    let mut tasks = Vec::with_capacity(source.num_points.div_ceil(points_per_task) as usize);
    let mut first_point = 0u64;
    while first_point < source.num_points {
        let num_points = points_per_task.min(source.num_points - first_point);
        tasks.push(LoadTask {
            source: source.clone(),
            first_point,
            num_points,
        });
        first_point += num_points;
    }
    tasks
}

/// Assign global offsets to `pending`, in order, and queue their tasks.
pub fn register(ctx: &StreamContext, pending: Vec<PendingSource>) -> Registration {
    let max_points = ctx.config.max_points;
    let mut registration = Registration {
        sources: Vec::with_capacity(pending.len()),
        bounds: Aabb::EMPTY,
        clamped: Vec::new(),
    };
    let mut queued = 0usize;

    {
        let mut state = ctx.load_queue.lock();
        let generation = ctx.generation();

        for p in pending {
            let num_points = p.declared_points.min(max_points);
            if num_points < p.declared_points {
                log::warn!(
                    "'{}' declares {} points, clamped to {}",
                    p.name,
                    p.declared_points,
                    max_points
                );
                registration.clamped.push((p.name.clone(), p.declared_points));
            }

            let num_batches = num_points.div_ceil(POINTS_PER_BATCH);
            let source = Arc::new(PointSource::new(
                state.totals.num_sources,
                generation,
                p.name,
                num_points,
                num_batches,
                state.totals.num_points,
                p.bounds,
                p.kind,
            ));

            state.totals.num_points += num_points;
            state.totals.num_batches += num_batches;
            state.totals.num_sources += 1;
            state.session_bounds = state.session_bounds.union(source.bounds);
            registration.bounds = registration.bounds.union(source.bounds);

            let tasks = split_into_tasks(&source, ctx.config.points_per_task);
            log::info!(
                "registered '{}': {} points, {} batches, {} tasks, global offset {}",
                source.name,
                source.num_points,
                source.num_batches,
                tasks.len(),
                source.sparse_point_offset
            );
            queued += tasks.len();
            for task in tasks {
                state.push(task);
            }

            state.sources.push(source.clone());
            registration.sources.push(source);
        }

        if !registration.sources.is_empty() {
            state.framing_bounds = registration.bounds;
        }
    }

    if queued > 0 {
        ctx.load_queue.notify();
    }

    registration
}

/// Register LAS files. Headers are parsed in parallel; if any file fails the
/// whole call fails and nothing is registered.
pub fn register_files<P: AsRef<Path> + Sync>(ctx: &StreamContext, paths: &[P]) -> Result<Registration> {
    let pending = paths
        .par_iter()
        .map(|p| describe_file(p.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(register(ctx, pending))
}

/// Collect every `.las` file below `root`, sorted by path.
pub fn find_las_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            StreamError::io(path, e.into())
        })?;
        if entry.file_type().is_file() && has_las_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

pub fn register_directory(ctx: &StreamContext, root: &Path) -> Result<Registration> {
    let files = find_las_files(root)?;
    if files.is_empty() {
        log::warn!("no .las files below {}", root.display());
    }
    register_files(ctx, &files)
}

pub fn register_records(ctx: &StreamContext, name: &str, records: PointRecords) -> Result<Registration> {
    let pending = describe_records(name, records)?;
    Ok(register(ctx, vec![pending]))
}
