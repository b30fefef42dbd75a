use glam::DVec3;
use point_stream::config::POINTS_PER_BATCH;
use point_stream::data::BatchMetadata;
use point_stream::ingest::encoder::{join_tiers, unpack_tier, STEPS_30BIT};
use point_stream::sparse::HostSparseBuffer;
use point_stream::{
    DrainOutcome, HostAllocator, PointRecords, PointStreamer, SparseBuffer, StreamConfig, StreamError,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

type HostStreamer = PointStreamer<HostSparseBuffer>;

fn streamer(max_points: u64, points_per_task: u64, threads: usize) -> HostStreamer {
    let config = StreamConfig {
        max_points,
        points_per_task,
        worker_threads: Some(threads),
        ..Default::default()
    };
    PointStreamer::new(config, &HostAllocator { page_size: 4096 }).unwrap()
}

/// Drain until nothing is queued, encoding or waiting for upload.
fn load_all(s: &mut HostStreamer) {
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        match s.drain_one_upload() {
            Ok(DrainOutcome::Idle) if s.is_idle() => return,
            Ok(DrainOutcome::Idle) => std::thread::sleep(Duration::from_millis(1)),
            Ok(_) => {}
            Err(err) => panic!("upload failed: {}", err),
        }
        assert!(Instant::now() < deadline, "pipeline did not go idle");
    }
}

fn metadata(s: &HostStreamer) -> Vec<BatchMetadata> {
    let n = s.num_batches_loaded();
    let bytes = s.buffers().batches.read(0, n * 64).unwrap();
    bytes.chunks_exact(64).map(bytemuck::pod_read_unaligned).collect()
}

fn word(buf: &HostSparseBuffer, index: u64) -> u32 {
    let b = buf.read(index * 4, 4).unwrap();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Reconstruct the absolute position of global point `index` from the buffers.
fn decode(s: &HostStreamer, records: &[BatchMetadata], index: u64) -> DVec3 {
    let meta = records
        .iter()
        .find(|m| (m.point_offset as u64..m.point_offset as u64 + m.num_points as u64).contains(&index))
        .expect("no batch owns the point");
    let source_min = s.sources()[meta.source_index as usize].bounds.min;

    let buffers = s.buffers();
    let low = unpack_tier(word(&buffers.xyz_low, index));
    let med = unpack_tier(word(&buffers.xyz_med, index));
    let high = unpack_tier(word(&buffers.xyz_high, index));

    let min = DVec3::from_array(meta.min.map(f64::from));
    let max = DVec3::from_array(meta.max.map(f64::from));
    let q = DVec3::new(
        join_tiers(low[0], med[0], high[0]) as f64,
        join_tiers(low[1], med[1], high[1]) as f64,
        join_tiers(low[2], med[2], high[2]) as f64,
    );
    source_min + min + q / STEPS_30BIT as f64 * (max - min)
}

fn write_las(dir: &Path, name: &str, minor: u8, format: u8, record_len: u16, n: usize, declared: Option<u64>) -> PathBuf {
    let path = dir.join(name);
    let pts: Vec<[i32; 3]> = (0..n as i32).map(|i| [i * 10, (i % 100) * 7, -i]).collect();
    let colors: Vec<[u16; 3]> = (0..n).map(|i| [(i % 256) as u16 * 256, 0, 65535]).collect();
    lasrec::write_file(
        &path,
        &lasrec::LasWriteSpec {
            version_minor: minor,
            point_format: format,
            bytes_per_point: record_len,
            scale: [0.01, 0.01, 0.01],
            offset: [1000.0, 2000.0, 0.0],
            points_raw: &pts,
            colors: Some(&colors[..]),
            declared_points: declared,
        },
    )
    .unwrap();
    path
}

#[test]
fn las_files_load_completely() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_las(dir.path(), "a.las", 2, 2, 26, 25_000, None);
    let b = write_las(dir.path(), "b.LAS", 4, 7, 36, 3_000, None);

    let mut s = streamer(1_000_000, 2 * POINTS_PER_BATCH, 3);
    let reg = s.register_files(&[&a, &b]).unwrap();
    assert_eq!(reg.sources.len(), 2);
    assert_eq!(reg.sources[1].sparse_point_offset, 25_000);

    load_all(&mut s);

    assert_eq!(s.num_points_loaded(), 28_000);
    assert_eq!(s.num_points(), 28_000);
    assert_eq!(s.num_batches_loaded(), s.num_batches());
    assert_eq!(s.num_batches(), 3 + 1);
    assert!(s.sources().iter().all(|src| src.is_complete() && !src.has_failed()));
    assert!(s.take_failures().is_empty());

    // Point 7 of "b": raw [70, 49, -7], 16-bit red 7 * 256.
    let records = metadata(&s);
    let p = decode(&s, &records, 25_007);
    assert!((p - DVec3::new(1000.7, 2000.49, -0.07)).abs().max_element() < 1e-3, "{:?}", p);
    assert_eq!(word(&s.buffers().colors, 25_007), 7 | 255 << 16);
}

#[test]
fn every_index_has_exactly_one_owner() {
    let mut s = streamer(1_000_000, POINTS_PER_BATCH, 4);
    let sizes = [1usize, 10_239, 10_240, 10_241, 33_333, 0, 5];
    for (i, &n) in sizes.iter().enumerate() {
        let records = PointRecords::new(
            (0..n).map(|j| DVec3::new(j as f64, i as f64, 0.0)).collect(),
            vec![[1, 1, 1]; n],
        );
        s.register_records(&format!("cloud-{}", i), records).unwrap();
    }
    load_all(&mut s);

    let total: u64 = sizes.iter().map(|&n| n as u64).sum();
    assert_eq!(s.num_points_loaded(), total);

    let mut ranges: Vec<(u64, u64)> = metadata(&s)
        .iter()
        .map(|m| (m.point_offset as u64, m.num_points as u64))
        .collect();
    ranges.sort_unstable();

    let mut next = 0;
    for (offset, n) in ranges {
        assert_eq!(offset, next, "gap or overlap at {}", offset);
        assert!(n > 0 && n <= POINTS_PER_BATCH);
        next = offset + n;
    }
    assert_eq!(next, total);
}

#[test]
fn sources_are_laid_out_in_registration_order() {
    let s = streamer(1_000_000, POINTS_PER_BATCH, 1);
    let mut expected = 0;
    for n in [3usize, 20_000, 1] {
        let reg = s
            .register_records("c", PointRecords::new(vec![DVec3::ONE; n], vec![[0; 3]; n]))
            .unwrap();
        assert_eq!(reg.sources[0].sparse_point_offset, expected);
        expected += n as u64;
    }
    assert_eq!(s.num_points(), expected);
}

#[test]
fn oversized_file_is_clamped_not_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_las(dir.path(), "big.las", 2, 3, 34, 3_000, None);

    let mut s = streamer(1_000, POINTS_PER_BATCH, 2);
    let reg = s.register_files(&[&path]).unwrap();
    assert_eq!(reg.sources[0].num_points, 1_000);
    assert_eq!(reg.clamped.len(), 1);

    load_all(&mut s);
    assert_eq!(s.num_points_loaded(), 1_000);
    assert!(s.buffers().colors.committed_bytes() <= s.buffers().colors.capacity());
}

#[test]
fn overflowing_registration_is_rejected_at_upload() {
    let mut s = streamer(1_000, POINTS_PER_BATCH, 1);
    s.register_records("a", PointRecords::new(vec![DVec3::ZERO; 800], vec![[0; 3]; 800]))
        .unwrap();
    s.register_records("b", PointRecords::new(vec![DVec3::ONE; 800], vec![[0; 3]; 800]))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut errors = Vec::new();
    loop {
        match s.drain_one_upload() {
            Ok(DrainOutcome::Idle) if s.is_idle() => break,
            Ok(_) => {}
            Err(err) => errors.push(err),
        }
        assert!(Instant::now() < deadline);
    }

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], StreamError::CapacityExceeded { offset: 800, count: 800, capacity: 1_000 }));
    assert_eq!(s.num_points_loaded(), 800);
    assert!(s.sources()[1].has_failed());
}

#[test]
fn bad_inputs_leave_the_session_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_las(dir.path(), "good.las", 2, 2, 26, 10, None);
    let laz = dir.path().join("x.laz");
    std::fs::write(&laz, b"LASF").unwrap();
    let missing = dir.path().join("missing.las");

    let s = streamer(1_000, POINTS_PER_BATCH, 1);
    assert!(matches!(
        s.register_files(&[&good, &laz]),
        Err(StreamError::UnsupportedFormat { .. })
    ));
    assert!(matches!(s.register_files(&[&good, &missing]), Err(StreamError::Io { .. })));
    assert!(matches!(
        s.register_records("nocolor", PointRecords { positions: vec![DVec3::ZERO], colors: None }),
        Err(StreamError::MissingAttribute { .. })
    ));

    assert_eq!(s.num_points(), 0);
    assert!(s.sources().is_empty());

    let reg = s.register_files(&[&good]).unwrap();
    assert_eq!(reg.sources[0].sparse_point_offset, 0);
}

#[test]
fn truncated_file_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let bad = write_las(dir.path(), "bad.las", 2, 2, 26, 100, Some(50_000));
    let good = write_las(dir.path(), "good.las", 2, 2, 26, 100, None);

    let mut s = streamer(1_000_000, POINTS_PER_BATCH, 2);
    s.register_files(&[&bad, &good]).unwrap();
    load_all(&mut s);

    let sources = s.sources();
    assert!(sources[0].has_failed());
    assert!(sources[1].is_complete());
    assert_eq!(sources[1].points_loaded(), 100);

    let failures = s.take_failures();
    assert!(!failures.is_empty());
    assert!(failures.iter().all(|f| f.source_index == 0));
}

#[test]
fn directory_is_scanned_in_path_order() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("z");
    std::fs::create_dir(&nested).unwrap();
    write_las(&nested, "c.las", 2, 2, 26, 5, None);
    write_las(dir.path(), "b.las", 2, 2, 26, 6, None);
    write_las(dir.path(), "a.las", 2, 2, 26, 7, None);
    std::fs::write(dir.path().join("notes.txt"), "not a cloud").unwrap();

    let s = streamer(1_000, POINTS_PER_BATCH, 1);
    let reg = s.register_directory(dir.path()).unwrap();
    let counts: Vec<u64> = reg.sources.iter().map(|src| src.num_points).collect();
    assert_eq!(counts, vec![7, 6, 5]);
}

#[test]
fn reset_starts_a_fresh_session() {
    let mut s = streamer(1_000_000, POINTS_PER_BATCH, 2);
    let n = 3 * POINTS_PER_BATCH as usize;
    s.register_records("a", PointRecords::new(vec![DVec3::ONE; n], vec![[0; 3]; n]))
        .unwrap();
    load_all(&mut s);
    assert!(s.buffers().committed_bytes() > 0);

    s.reset();
    assert_eq!(s.num_points(), 0);
    assert_eq!(s.num_points_loaded(), 0);
    assert_eq!(s.num_batches_loaded(), 0);
    assert_eq!(s.buffers().committed_bytes(), 0);
    assert!(s.sources().is_empty());

    let reg = s
        .register_records("b", PointRecords::new(vec![DVec3::ZERO; 10], vec![[0; 3]; 10]))
        .unwrap();
    assert_eq!(reg.sources[0].sparse_point_offset, 0);
    assert_eq!(reg.sources[0].index, 0);
    load_all(&mut s);
    assert_eq!(s.num_points_loaded(), 10);
}

#[test]
fn idle_pipeline_drains_to_nothing() {
    let mut s = streamer(1_000, POINTS_PER_BATCH, 1);
    assert!(s.is_idle());
    assert_eq!(s.drain_one_upload().unwrap(), DrainOutcome::Idle);
    assert_eq!(s.num_batches_loaded(), 0);
    s.shutdown();
    assert_eq!(s.buffers().committed_bytes(), 0);
}

#[test]
fn default_tasks_upload_a_mid_sized_file_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_las(dir.path(), "mid.las", 2, 2, 26, 25_000, None);

    let config = StreamConfig {
        max_points: 1_000_000,
        worker_threads: Some(2),
        ..Default::default()
    };
    let mut s = PointStreamer::new(config, &HostAllocator { page_size: 4096 }).unwrap();
    s.register_files(&[&path]).unwrap();
    assert_eq!(s.num_batches(), 3);

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut uploads = Vec::new();
    loop {
        match s.drain_one_upload().unwrap() {
            DrainOutcome::Idle if s.is_idle() => break,
            DrainOutcome::Uploaded { num_points, num_batches, .. } => uploads.push((num_points, num_batches)),
            _ => std::thread::sleep(Duration::from_millis(1)),
        }
        assert!(Instant::now() < deadline, "pipeline did not go idle");
    }

    assert_eq!(uploads, vec![(25_000, 3)]);
    let mut counts: Vec<u32> = metadata(&s).iter().map(|m| m.num_points).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![4_520, 10_240, 10_240]);
    // 24_999 % 256 = 167, stored as 16-bit red 167 * 256.
    assert_eq!(word(&s.buffers().colors, 24_999), 167 | 255 << 16);
}

#[test]
fn session_bounds_cover_every_registration() {
    let mut s = streamer(1_000, POINTS_PER_BATCH, 1);
    s.register_records("near", PointRecords::new(vec![DVec3::ZERO, DVec3::ONE], vec![[0; 3]; 2]))
        .unwrap();
    s.register_records("far", PointRecords::new(vec![DVec3::splat(50.0)], vec![[0; 3]]))
        .unwrap();

    assert_eq!(s.framing_bounds().min, DVec3::splat(50.0));
    assert_eq!(s.session_bounds().min, DVec3::ZERO);
    assert_eq!(s.session_bounds().max, DVec3::splat(50.0));

    s.reset();
    assert!(s.session_bounds().is_empty());
}
