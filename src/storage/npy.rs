//! NPY v1.0 array files written incrementally.
//!
//! The row count is unknown while a run is in progress, so the header is first
//! written with a placeholder shape of `(i64::MAX, cols)` and patched in place
//! by [`NpyWriter::finish`]. The placeholder is the widest row count the
//! header can ever hold, so the patched header always fits the space reserved
//! for it.
//!
//! ```text
//! offset  0: \x93NUMPY            magic
//! offset  6: 0x01 0x00            version 1.0
//! offset  8: u16 LE               header length
//! offset 10: {'descr': ...}       space padded, '\n' terminated
//! offset 10 + len: f64 LE data    row-major
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::block::SampleBlock;
use crate::error::{AppResult, DaqError};

/// File signature.
pub const MAGIC: &[u8; 6] = b"\x93NUMPY";
/// Format version written and accepted.
pub const VERSION: [u8; 2] = [1, 0];
/// Offset of the header text.
pub const HEADER_OFFSET: u64 = 10;
/// File extension.
pub const EXTENSION: &str = "npy";
const ALIGNMENT: usize = 16;
const PLACEHOLDER_ROWS: u64 = i64::MAX as u64;

/// Header dictionary for a little-endian f64 C-order array.
pub fn header_dict(rows: u64, cols: usize) -> String {
    format!("{{'descr': '<f8', 'fortran_order': False, 'shape': ({rows}, {cols})}}")
}

/// Header length (dict, padding and newline) for a dict of `dict_len` bytes.
fn padded_len(dict_len: usize) -> usize {
    let unpadded = HEADER_OFFSET as usize + dict_len + 1;
    let rem = unpadded % ALIGNMENT;
    let pad = if rem == 0 { 0 } else { ALIGNMENT - rem };
    dict_len + 1 + pad
}

/// Streams whose length can be cut back.
pub trait Truncate {
    /// Drops everything past `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl Truncate for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        self.get_mut().truncate(len);
        Ok(())
    }
}

impl<W: Write + Truncate> Truncate for BufWriter<W> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.flush()?;
        self.get_mut().truncate(len)
    }
}

/// Appends blocks to an NPY stream and patches the row count at the end.
///
/// A block whose write fails leaves the writer torn: no further blocks are
/// accepted, and [`finish`](NpyWriter::finish) cuts the stream back to the
/// last complete block so the header and payload agree.
pub struct NpyWriter<W: Write + Seek> {
    inner: W,
    cols: usize,
    rows: u64,
    header_len: usize,
    torn: bool,
}

impl<W: Write + Seek> NpyWriter<W> {
    /// Writes the placeholder header. `inner` must be positioned at offset 0.
    pub fn create(mut inner: W, cols: usize) -> AppResult<Self> {
        let dict = header_dict(PLACEHOLDER_ROWS, cols);
        let header_len = padded_len(dict.len());
        let len = u16::try_from(header_len).map_err(|_| {
            DaqError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                "npy header exceeds 65535 bytes",
            ))
        })?;
        inner.write_all(MAGIC)?;
        inner.write_all(&VERSION)?;
        inner.write_all(&len.to_le_bytes())?;
        write_padded(&mut inner, &dict, header_len)?;
        debug!(cols, header_len, "npy header reserved");
        Ok(Self {
            inner,
            cols,
            rows: 0,
            header_len,
            torn: false,
        })
    }

    /// Appends `block`, column `j` multiplied by `scales[j]`.
    pub fn write_block(&mut self, block: &SampleBlock, scales: &[f64]) -> AppResult<()> {
        if self.torn {
            return Err(DaqError::Storage(io::Error::other(
                "npy stream is torn by an earlier failed write",
            )));
        }
        if block.cols() != self.cols || scales.len() != self.cols {
            return Err(DaqError::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block has {} columns and {} scales, file has {}",
                    block.cols(),
                    scales.len(),
                    self.cols
                ),
            )));
        }
        let mut bytes = Vec::with_capacity(block.values().len() * 8);
        for row in 0..block.rows() {
            for (value, scale) in block.row(row).iter().zip(scales) {
                bytes.extend_from_slice(&(value * scale).to_le_bytes());
            }
        }
        if let Err(e) = self.inner.write_all(&bytes) {
            self.torn = true;
            return Err(e.into());
        }
        self.rows += block.rows() as u64;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Columns declared in the header.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Whether a write failed part-way.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    /// Total header size including magic, version and length.
    pub fn data_offset(&self) -> u64 {
        HEADER_OFFSET + self.header_len as u64
    }

    /// Offset just past the last complete row.
    pub fn data_end(&self) -> u64 {
        self.data_offset() + self.rows * self.cols as u64 * 8
    }

    /// The underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: Write + Seek + Truncate> NpyWriter<W> {
    /// Rewrites the header with the final shape and returns the stream,
    /// positioned after the last complete row.
    pub fn finish(mut self) -> AppResult<W> {
        let dict = header_dict(self.rows, self.cols);
        if padded_len(dict.len()) > self.header_len {
            return Err(DaqError::Storage(io::Error::new(
                io::ErrorKind::InvalidData,
                "final npy header does not fit reserved space",
            )));
        }
        let end = self.data_end();
        self.inner.seek(SeekFrom::Start(HEADER_OFFSET))?;
        write_padded(&mut self.inner, &dict, self.header_len)?;
        if self.torn {
            self.inner.truncate(end)?;
            debug!(end, "partial block discarded");
        }
        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;
        debug!(rows = self.rows, cols = self.cols, "npy header patched");
        Ok(self.inner)
    }
}

fn write_padded<W: Write>(out: &mut W, dict: &str, header_len: usize) -> io::Result<()> {
    let mut header = Vec::with_capacity(header_len);
    header.extend_from_slice(dict.as_bytes());
    header.resize(header_len - 1, b' ');
    header.push(b'\n');
    out.write_all(&header)
}

/// Contents of an NPY file written by [`NpyWriter`].
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    /// Rows declared in the header.
    pub rows: usize,
    /// Columns, one per active channel.
    pub cols: usize,
    /// Header length as stored in the file.
    pub header_len: usize,
    /// Values, row-major.
    pub data: Vec<f64>,
}

impl NpyArray {
    /// Values of one row.
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Reads a 2-D `<f8` C-order array.
pub fn read_npy<R: Read>(mut input: R) -> AppResult<NpyArray> {
    let mut preamble = [0u8; HEADER_OFFSET as usize];
    input.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC || preamble[6..8] != VERSION {
        return Err(invalid("not an NPY v1.0 file"));
    }
    let header_len = usize::from(u16::from_le_bytes([preamble[8], preamble[9]]));
    let mut header = vec![0u8; header_len];
    input.read_exact(&mut header)?;
    let header = std::str::from_utf8(&header).map_err(|_| invalid("header is not UTF-8"))?;
    if !header.contains("'descr': '<f8'") || !header.contains("'fortran_order': False") {
        return Err(invalid("only C-order little-endian f64 arrays are supported"));
    }
    let (rows, cols) = parse_shape(header).ok_or_else(|| invalid("malformed shape"))?;

    let mut raw = Vec::new();
    input.read_to_end(&mut raw)?;
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(8))
        .ok_or_else(|| invalid("shape overflows"))?;
    if raw.len() != expected {
        return Err(invalid(&format!(
            "header declares {expected} data bytes, file has {}",
            raw.len()
        )));
    }
    let data = raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect();
    Ok(NpyArray {
        rows,
        cols,
        header_len,
        data,
    })
}

fn parse_shape(header: &str) -> Option<(usize, usize)> {
    let start = header.find("'shape': (")? + "'shape': (".len();
    let end = start + header[start..].find(')')?;
    let mut dims = header[start..end].split(',').map(str::trim);
    let rows = dims.next()?.parse().ok()?;
    let cols = dims.next()?.parse().ok()?;
    Some((rows, cols))
}

fn invalid(msg: &str) -> DaqError {
    DaqError::Storage(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts `budget` bytes, fails once, then accepts everything again.
    struct ShortWrites {
        inner: Cursor<Vec<u8>>,
        budget: Option<usize>,
    }

    impl Write for ShortWrites {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.budget {
                Some(0) => {
                    self.budget = None;
                    Err(io::Error::other("device full"))
                }
                Some(n) => {
                    let accepted = self.inner.write(&buf[..n.min(buf.len())])?;
                    self.budget = Some(n - accepted);
                    Ok(accepted)
                }
                None => self.inner.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for ShortWrites {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl Truncate for ShortWrites {
        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.inner.truncate(len)
        }
    }

    fn block(rows: usize, cols: usize, seq: u64) -> SampleBlock {
        let data = (0..rows * cols).map(|i| (seq * 100 + i as u64) as f64).collect();
        SampleBlock::new(rows, cols, data, seq).unwrap()
    }

    #[test]
    fn test_header_is_aligned() {
        let writer = NpyWriter::create(Cursor::new(Vec::new()), 2).unwrap();
        assert_eq!(writer.data_offset() % 16, 0);
        let bytes = writer.finish().unwrap().into_inner();
        assert_eq!(&bytes[..6], MAGIC);
        assert_eq!(bytes[6..8], [1, 0]);
        assert_eq!(bytes.len() % 16, 0);
        assert_eq!(bytes[bytes.len() - 1], b'\n');
    }

    #[test]
    fn test_placeholder_then_patched_shape() {
        let mut writer = NpyWriter::create(Cursor::new(Vec::new()), 3).unwrap();
        let placeholder = String::from_utf8_lossy(&writer.get_mut().get_ref()[10..]).to_string();
        assert!(placeholder.contains("'shape': (9223372036854775807, 3)"));

        writer.write_block(&block(4, 3, 0), &[1.0, 1.0, 1.0]).unwrap();
        writer.write_block(&block(4, 3, 1), &[1.0, 1.0, 1.0]).unwrap();
        let offset = writer.data_offset() as usize;
        let bytes = writer.finish().unwrap().into_inner();

        let header = std::str::from_utf8(&bytes[10..offset]).unwrap();
        assert!(header.starts_with("{'descr': '<f8', 'fortran_order': False, 'shape': (8, 3)}"));
        assert_eq!(bytes.len(), offset + 8 * 3 * 8);
    }

    #[test]
    fn test_scaled_round_trip() {
        let mut writer = NpyWriter::create(Cursor::new(Vec::new()), 2).unwrap();
        let first = block(3, 2, 0);
        let second = block(3, 2, 1);
        writer.write_block(&first, &[2.0, -0.5]).unwrap();
        writer.write_block(&second, &[2.0, -0.5]).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let array = read_npy(Cursor::new(bytes)).unwrap();
        assert_eq!((array.rows, array.cols), (6, 2));
        assert_eq!(array.row(0), &[first.row(0)[0] * 2.0, first.row(0)[1] * -0.5]);
        assert_eq!(array.row(5), &[second.row(2)[0] * 2.0, second.row(2)[1] * -0.5]);
    }

    #[test]
    fn test_empty_run_declares_zero_rows() {
        let bytes = NpyWriter::create(Cursor::new(Vec::new()), 2)
            .unwrap()
            .finish()
            .unwrap()
            .into_inner();
        let array = read_npy(Cursor::new(bytes)).unwrap();
        assert_eq!((array.rows, array.cols), (0, 2));
        assert!(array.data.is_empty());
    }

    #[test]
    fn test_column_mismatch_rejected() {
        let mut writer = NpyWriter::create(Cursor::new(Vec::new()), 2).unwrap();
        let err = writer.write_block(&block(2, 3, 0), &[1.0, 1.0, 1.0]);
        assert!(matches!(err, Err(DaqError::Storage(_))));
        assert_eq!(writer.rows(), 0);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let mut writer = NpyWriter::create(Cursor::new(Vec::new()), 1).unwrap();
        writer.write_block(&block(2, 1, 0), &[1.0]).unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();
        bytes.pop();
        assert!(read_npy(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_failed_write_is_cut_back_to_complete_rows() {
        let stream = ShortWrites {
            inner: Cursor::new(Vec::new()),
            budget: None,
        };
        let mut writer = NpyWriter::create(stream, 2).unwrap();
        writer.write_block(&block(3, 2, 0), &[1.0, 1.0]).unwrap();
        // half of the next block gets through before the device fails
        writer.get_mut().budget = Some(3 * 2 * 8 / 2);
        assert!(writer.write_block(&block(3, 2, 1), &[1.0, 1.0]).is_err());
        assert!(writer.is_torn());
        assert_eq!(writer.rows(), 3);
        assert!(writer.write_block(&block(3, 2, 2), &[1.0, 1.0]).is_err());

        let end = writer.data_end();
        let bytes = writer.finish().unwrap().inner.into_inner();
        assert_eq!(bytes.len() as u64, end);
        let array = read_npy(Cursor::new(bytes)).unwrap();
        assert_eq!((array.rows, array.cols), (3, 2));
        assert_eq!(array.row(2), block(3, 2, 0).row(2));
    }

    #[test]
    fn test_buffered_file_is_cut_back_after_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.npy");
        let mut writer = NpyWriter::create(BufWriter::new(File::create(&path).unwrap()), 1).unwrap();
        writer.write_block(&block(4, 1, 0), &[1.0]).unwrap();
        // stray bytes of a block that never completed
        writer.get_mut().write_all(&[0xAB; 12]).unwrap();
        writer.torn = true;
        writer.finish().unwrap().into_inner().unwrap();

        let array = read_npy(File::open(&path).unwrap()).unwrap();
        assert_eq!((array.rows, array.cols), (4, 1));
    }
}
