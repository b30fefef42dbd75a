//! LASREC: dependency-free access to LAS public headers and point records.
//!
//! Only the fields needed to stream fixed-width point records are decoded.
//! Compressed (LAZ) payloads are not supported; the compression bit of the
//! point format byte is stripped so such headers still parse.
//!
//! Public header layout (little-endian, byte offsets):
//!   000 : [u8;4]  signature = b"LASF"
//!   024 : u8      version major
//!   025 : u8      version minor
//!   094 : u16     header size
//!   096 : u32     offset to point data
//!   104 : u8      point data format (bit 7 => compressed)
//!   105 : u16     point data record length
//!   107 : u32     legacy number of point records
//!   131 : f64[3]  scale x, y, z
//!   155 : f64[3]  offset x, y, z
//!   179 : f64     max x   187 : f64 min x
//!   195 : f64     max y   203 : f64 min y
//!   211 : f64     max z   219 : f64 min z
//!   227 : end of a 1.0 - 1.2 header
//!   247 : u64     number of point records (1.4+)
//!   375 : end of a 1.4 header
//!
//! Every record starts with i32 X, Y, Z. RGB (u16 x3) sits at a format
//! dependent offset, see [`rgb_offset`].

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const LAS_SIGNATURE: [u8; 4] = *b"LASF";

/// Header size of LAS 1.0 - 1.2 files.
pub const LEGACY_HEADER_SIZE: usize = 227;

/// Header size of LAS 1.4 files; also the most [`read_header`] ever reads.
pub const HEADER_SIZE_14: usize = 375;

/// Highest point data format defined by LAS 1.4.
pub const MAX_POINT_FORMAT: u8 = 10;

const MIN_RECORD_LEN: [u16; 11] = [20, 28, 26, 34, 57, 63, 30, 36, 38, 59, 67];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LasHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub header_size: u16,
    pub offset_to_point_data: u32,
    pub point_format: u8,
    pub bytes_per_point: u16,
    /// Point count as stored in the file. Callers apply their own capacity policy.
    pub num_points: u64,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl LasHeader {
    /// True when the point count lives in the 64-bit field at byte 247.
    #[inline]
    pub fn has_wide_count(&self) -> bool {
        uses_wide_count(self.version_major, self.version_minor)
    }

    /// Byte offset of RGB inside a record, if the format carries color.
    #[inline]
    pub fn rgb_offset(&self) -> Option<usize> {
        rgb_offset(self.point_format)
    }

    /// Absolute file offset of point `index`.
    #[inline]
    pub fn record_position(&self, index: u64) -> u64 {
        self.offset_to_point_data as u64 + index * self.bytes_per_point as u64
    }
}

#[inline(always)]
fn uses_wide_count(major: u8, minor: u8) -> bool {
    !(major == 1 && minor < 4)
}

/// Byte offset of the RGB triple inside a record of the given format.
pub fn rgb_offset(point_format: u8) -> Option<usize> {
    match point_format {
        2 => Some(20),
        3 | 5 => Some(28),
        7 | 8 | 10 => Some(30),
        _ => None,
    }
}

/// Smallest legal record length for a point format.
pub fn min_record_len(point_format: u8) -> Option<u16> {
    MIN_RECORD_LEN.get(point_format as usize).copied()
}

#[inline(always)]
fn need(buf: &[u8], want: usize) -> io::Result<()> {
    if buf.len() < want {
        Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated LAS header"))
    } else {
        Ok(())
    }
}

#[inline(always)]
fn field<const N: usize>(buf: &[u8], at: usize) -> io::Result<[u8; N]> {
    need(buf, at + N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[at..at + N]);
    Ok(out)
}

#[inline(always)]
fn u8_at(buf: &[u8], at: usize) -> io::Result<u8> {
    Ok(field::<1>(buf, at)?[0])
}

#[inline(always)]
fn u16_at(buf: &[u8], at: usize) -> io::Result<u16> {
    field(buf, at).map(u16::from_le_bytes)
}

#[inline(always)]
fn u32_at(buf: &[u8], at: usize) -> io::Result<u32> {
    field(buf, at).map(u32::from_le_bytes)
}

#[inline(always)]
fn u64_at(buf: &[u8], at: usize) -> io::Result<u64> {
    field(buf, at).map(u64::from_le_bytes)
}

#[inline(always)]
fn f64_at(buf: &[u8], at: usize) -> io::Result<f64> {
    field(buf, at).map(f64::from_le_bytes)
}

#[inline(always)]
fn f64x3_at(buf: &[u8], at: usize, stride: usize) -> io::Result<[f64; 3]> {
    Ok([
        f64_at(buf, at)?,
        f64_at(buf, at + stride)?,
        f64_at(buf, at + 2 * stride)?,
    ])
}

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

/// Parse a LAS public header from its leading bytes.
pub fn parse_header_bytes(p: &[u8]) -> io::Result<LasHeader> {
    if field::<4>(p, 0)? != LAS_SIGNATURE {
        return Err(bad("bad LAS signature"));
    }

    let version_major = u8_at(p, 24)?;
    let version_minor = u8_at(p, 25)?;
    let wide = uses_wide_count(version_major, version_minor);

    need(p, if wide { HEADER_SIZE_14 } else { LEGACY_HEADER_SIZE })?;

    let point_format = u8_at(p, 104)? % 128;
    let bytes_per_point = u16_at(p, 105)?;

    let min_len = min_record_len(point_format)
        .ok_or_else(|| bad(&format!("unknown point data format {}", point_format)))?;
    if bytes_per_point < min_len {
        return Err(bad(&format!(
            "record length {} below minimum {} for format {}",
            bytes_per_point, min_len, point_format
        )));
    }

    let num_points = if wide {
        u64_at(p, 247)?
    } else {
        u32_at(p, 107)? as u64
    };

    // Max and min are interleaved per axis: max x, min x, max y, ...
    Ok(LasHeader {
        version_major,
        version_minor,
        header_size: u16_at(p, 94)?,
        offset_to_point_data: u32_at(p, 96)?,
        point_format,
        bytes_per_point,
        num_points,
        scale: f64x3_at(p, 131, 8)?,
        offset: f64x3_at(p, 155, 8)?,
        max: f64x3_at(p, 179, 16)?,
        min: f64x3_at(p, 187, 16)?,
    })
}

/// Read and parse the header of a LAS file. Reads at most 375 bytes.
pub fn read_header<P: AsRef<Path>>(path: P) -> io::Result<LasHeader> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE_14);
    file.take(HEADER_SIZE_14 as u64).read_to_end(&mut buf)?;
    parse_header_bytes(&buf)
}

/// Read `count` raw records starting at record `first`.
#[cfg(not(feature = "mmap"))]
pub fn read_point_bytes<P: AsRef<Path>>(
    path: P,
    header: &LasHeader,
    first: u64,
    count: u64,
) -> io::Result<Vec<u8>> {
    let len = record_span(header, count)?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(header.record_position(first)))?;

    let mut bytes = vec![0u8; len];
    file.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Read `count` raw records starting at record `first` through a read-only map.
#[cfg(feature = "mmap")]
pub fn read_point_bytes<P: AsRef<Path>>(
    path: P,
    header: &LasHeader,
    first: u64,
    count: u64,
) -> io::Result<Vec<u8>> {
    let len = record_span(header, count)?;
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };

    let start = header.record_position(first) as usize;
    let end = start
        .checked_add(len)
        .ok_or_else(|| bad("record range overflow"))?;
    if end > map.len() {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated point records"));
    }
    Ok(map[start..end].to_vec())
}

fn record_span(header: &LasHeader, count: u64) -> io::Result<usize> {
    count
        .checked_mul(header.bytes_per_point as u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| bad("record range overflow"))
}

/// Borrowed view over a block of consecutive fixed-width records.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
    stride: usize,
    rgb_offset: Option<usize>,
}

impl<'a> RecordView<'a> {
    pub fn new(bytes: &'a [u8], header: &LasHeader) -> io::Result<Self> {
        let stride = header.bytes_per_point as usize;
        if stride == 0 || bytes.len() % stride != 0 {
            return Err(bad("record block is not a whole number of records"));
        }
        Ok(Self {
            bytes,
            stride,
            rgb_offset: header.rgb_offset(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn has_rgb(&self) -> bool {
        self.rgb_offset.is_some()
    }

    /// Raw integer coordinates of record `i`.
    #[inline]
    pub fn xyz_raw(&self, i: usize) -> [i32; 3] {
        let r = &self.bytes[i * self.stride..];
        [
            i32::from_le_bytes([r[0], r[1], r[2], r[3]]),
            i32::from_le_bytes([r[4], r[5], r[6], r[7]]),
            i32::from_le_bytes([r[8], r[9], r[10], r[11]]),
        ]
    }

    /// RGB channels of record `i`, as stored (8- or 16-bit values in u16 slots).
    #[inline]
    pub fn rgb(&self, i: usize) -> Option<[u16; 3]> {
        let at = i * self.stride + self.rgb_offset?;
        let r = &self.bytes[at..at + 6];
        Some([
            u16::from_le_bytes([r[0], r[1]]),
            u16::from_le_bytes([r[2], r[3]]),
            u16::from_le_bytes([r[4], r[5]]),
        ])
    }
}

/// Everything needed to write a small uncompressed LAS file.
#[derive(Debug, Clone)]
pub struct LasWriteSpec<'a> {
    /// 2 writes a 227-byte LAS 1.2 header, 4 writes a 375-byte LAS 1.4 header.
    pub version_minor: u8,
    pub point_format: u8,
    /// Record length; bytes past the format's fields are zero-filled.
    pub bytes_per_point: u16,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub points_raw: &'a [[i32; 3]],
    pub colors: Option<&'a [[u16; 3]]>,
    /// Overrides the stored point count (records written stay `points_raw.len()`).
    pub declared_points: Option<u64>,
}

pub fn write_file<P: AsRef<Path>>(path: P, spec: &LasWriteSpec<'_>) -> io::Result<()> {
    let min_len = min_record_len(spec.point_format).ok_or_else(|| bad("unknown point format"))?;
    if spec.bytes_per_point < min_len {
        return Err(bad("record length below format minimum"));
    }
    if let Some(colors) = spec.colors {
        if colors.len() != spec.points_raw.len() {
            return Err(bad("colors length != points length"));
        }
    }

    let header_size = if spec.version_minor >= 4 {
        HEADER_SIZE_14
    } else {
        LEGACY_HEADER_SIZE
    };
    let declared = spec.declared_points.unwrap_or(spec.points_raw.len() as u64);

    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for p in spec.points_raw {
        for a in 0..3 {
            let v = p[a] as f64 * spec.scale[a] + spec.offset[a];
            min[a] = min[a].min(v);
            max[a] = max[a].max(v);
        }
    }
    if spec.points_raw.is_empty() {
        min = [0.0; 3];
        max = [0.0; 3];
    }

    let mut h = vec![0u8; header_size];
    h[0..4].copy_from_slice(&LAS_SIGNATURE);
    h[24] = 1;
    h[25] = spec.version_minor;
    put(&mut h, 94, &(header_size as u16).to_le_bytes());
    put(&mut h, 96, &(header_size as u32).to_le_bytes());
    h[104] = spec.point_format;
    put(&mut h, 105, &spec.bytes_per_point.to_le_bytes());

    let legacy = if spec.version_minor >= 4 {
        u32::try_from(declared).unwrap_or(0)
    } else {
        u32::try_from(declared).unwrap_or(u32::MAX)
    };
    put(&mut h, 107, &legacy.to_le_bytes());

    for a in 0..3 {
        put(&mut h, 131 + 8 * a, &spec.scale[a].to_le_bytes());
        put(&mut h, 155 + 8 * a, &spec.offset[a].to_le_bytes());
        put(&mut h, 179 + 16 * a, &max[a].to_le_bytes());
        put(&mut h, 187 + 16 * a, &min[a].to_le_bytes());
    }

    if spec.version_minor >= 4 {
        put(&mut h, 247, &declared.to_le_bytes());
    }

    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&h)?;

    let rgb_at = rgb_offset(spec.point_format);
    let mut record = vec![0u8; spec.bytes_per_point as usize];

    for (index, point) in spec.points_raw.iter().enumerate() {
        record.fill(0);
        put(&mut record, 0, &point[0].to_le_bytes());
        put(&mut record, 4, &point[1].to_le_bytes());
        put(&mut record, 8, &point[2].to_le_bytes());

        if let (Some(at), Some(colors)) = (rgb_at, spec.colors) {
            let c = colors[index];
            put(&mut record, at, &c[0].to_le_bytes());
            put(&mut record, at + 2, &c[1].to_le_bytes());
            put(&mut record, at + 4, &c[2].to_le_bytes());
        }

        file.write_all(&record)?;
    }

    file.flush()?;

    Ok(())
}

#[inline]
fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec<'a>(minor: u8, pts: &'a [[i32; 3]], colors: Option<&'a [[u16; 3]]>) -> LasWriteSpec<'a> {
        LasWriteSpec {
            version_minor: minor,
            point_format: 2,
            bytes_per_point: 26,
            scale: [0.01, 0.01, 0.001],
            offset: [100.0, 200.0, 0.0],
            points_raw: pts,
            colors,
            declared_points: None,
        }
    }

    #[test]
    fn legacy_header_reads_narrow_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.las");
        let pts = [[0, 0, 0], [100, 200, 3000]];
        write_file(&path, &spec(2, &pts, None)).unwrap();

        let h = read_header(&path).unwrap();
        assert_eq!((h.version_major, h.version_minor), (1, 2));
        assert!(!h.has_wide_count());
        assert_eq!(h.num_points, 2);
        assert_eq!(h.offset_to_point_data as usize, LEGACY_HEADER_SIZE);
        assert_eq!(h.bytes_per_point, 26);
        assert_eq!(h.scale, [0.01, 0.01, 0.001]);
        assert_eq!(h.min, [100.0, 200.0, 0.0]);
        assert_eq!(h.max, [101.0, 202.0, 3.0]);
    }

    #[test]
    fn wide_header_prefers_64_bit_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.las");
        let pts = [[1, 2, 3]];
        let mut s = spec(4, &pts, None);
        s.declared_points = Some(5_000_000_000);
        write_file(&path, &s).unwrap();

        let h = read_header(&path).unwrap();
        assert!(h.has_wide_count());
        assert_eq!(h.num_points, 5_000_000_000);
    }

    #[test]
    fn truncated_header_is_eof() {
        let mut bytes = vec![0u8; 200];
        bytes[0..4].copy_from_slice(b"LASF");
        bytes[24] = 1;
        bytes[25] = 2;
        let err = parse_header_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

        // 1.4 needs the full 375 bytes even though 227 would do for 1.2.
        let mut bytes = vec![0u8; 300];
        bytes[0..4].copy_from_slice(b"LASF");
        bytes[24] = 1;
        bytes[25] = 4;
        let err = parse_header_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn wrong_signature_is_invalid() {
        let bytes = vec![0u8; HEADER_SIZE_14];
        let err = parse_header_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn short_record_length_is_rejected() {
        let mut bytes = vec![0u8; LEGACY_HEADER_SIZE];
        bytes[0..4].copy_from_slice(b"LASF");
        bytes[24] = 1;
        bytes[25] = 2;
        bytes[104] = 3;
        bytes[105..107].copy_from_slice(&26u16.to_le_bytes());
        let err = parse_header_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn compression_bit_is_stripped() {
        let mut bytes = vec![0u8; LEGACY_HEADER_SIZE];
        bytes[0..4].copy_from_slice(b"LASF");
        bytes[24] = 1;
        bytes[25] = 2;
        bytes[104] = 128 + 3;
        bytes[105..107].copy_from_slice(&34u16.to_le_bytes());
        let h = parse_header_bytes(&bytes).unwrap();
        assert_eq!(h.point_format, 3);
        assert_eq!(h.rgb_offset(), Some(28));
    }

    #[test]
    fn records_round_trip_through_view() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.las");
        let pts = [[1, 2, 3], [-4, 5, -6], [7, 8, 9]];
        let colors = [[10, 20, 30], [65535, 256, 0], [1, 2, 3]];
        write_file(&path, &spec(2, &pts, Some(&colors))).unwrap();

        let h = read_header(&path).unwrap();
        let bytes = read_point_bytes(&path, &h, 1, 2).unwrap();
        let view = RecordView::new(&bytes, &h).unwrap();

        assert_eq!(view.len(), 2);
        assert!(view.has_rgb());
        assert_eq!(view.xyz_raw(0), [-4, 5, -6]);
        assert_eq!(view.xyz_raw(1), [7, 8, 9]);
        assert_eq!(view.rgb(0), Some([65535, 256, 0]));
    }

    #[test]
    fn format_zero_view_has_no_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.las");
        let pts = [[1, 2, 3], [4, 5, 6]];
        let spec = LasWriteSpec {
            point_format: 0,
            bytes_per_point: 20,
            ..spec(2, &pts, None)
        };
        write_file(&path, &spec).unwrap();

        let h = read_header(&path).unwrap();
        let bytes = read_point_bytes(&path, &h, 0, 2).unwrap();
        let view = RecordView::new(&bytes, &h).unwrap();

        assert!(!view.has_rgb());
        assert_eq!(view.rgb(1), None);
        assert_eq!(view.xyz_raw(1), [4, 5, 6]);
    }

    #[test]
    fn reading_past_the_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.las");
        let pts = [[1, 2, 3]];
        write_file(&path, &spec(2, &pts, None)).unwrap();

        let h = read_header(&path).unwrap();
        let err = read_point_bytes(&path, &h, 0, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
