//! Byte-addressable access to the target file.
//!
//! Every other component reads and writes the loaded binary through the
//! [`ByteSource`] port. The memory-mapped implementation keeps access cost
//! independent of file size; the vector-backed one serves small inputs and
//! tests. Out-of-range reads yield zero bytes and record no error;
//! out-of-range writes fail.

pub mod dirty;

use crate::error::{EngineError, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub use dirty::DirtyOffsets;

/// Byte-addressable mutable store over the target file.
///
/// Reads are `&self` and safe to issue from any thread for the provided
/// implementations; writes are serialized by the caller. A write is
/// observable to every subsequent read on the same instance.
pub trait ByteSource: Send + Sync {
    /// Total length of the underlying store in bytes.
    fn len(&self) -> u64;

    /// True when the store holds no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one byte. Out-of-range offsets yield 0.
    fn read_u8(&self, offset: u64) -> u8;

    /// Fill `buf` starting at `offset`. Bytes past the end of the store
    /// are left as 0.
    fn read_into(&self, offset: u64, buf: &mut [u8]);

    /// Write one byte. Fails with [`EngineError::OutOfRange`] when
    /// `offset >= len()`.
    fn write_u8(&mut self, offset: u64, value: u8) -> Result<()>;

    /// Persist outstanding writes to the backing store.
    fn flush(&mut self) -> Result<()>;

    /// Release the backing store. Flushes first.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Memory-mapped read-write byte source.
///
/// The file handle is owned here for the lifetime of the loaded binary;
/// all other components borrow the source.
pub struct MmapByteSource {
    path: PathBuf,
    // None when the file size is zero; memmap cannot map empty files.
    map: Option<MmapMut>,
    len: u64,
}

impl MmapByteSource {
    /// Open `path` read-write and map it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        debug!(path = %path.display(), size = len, "mapping file");

        let map = if len == 0 {
            None
        } else {
            // Safety: the map is backed by a regular file we hold open and
            // the handle stays private to this source.
            Some(unsafe { MmapMut::map_mut(&file)? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for MmapByteSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_u8(&self, offset: u64) -> u8 {
        match &self.map {
            Some(map) if offset < self.len => map[offset as usize],
            _ => 0,
        }
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) {
        buf.fill(0);
        let Some(map) = &self.map else { return };
        if offset >= self.len {
            return;
        }
        let start = offset as usize;
        let avail = (self.len as usize - start).min(buf.len());
        buf[..avail].copy_from_slice(&map[start..start + avail]);
    }

    fn write_u8(&mut self, offset: u64, value: u8) -> Result<()> {
        let len = self.len;
        match &mut self.map {
            Some(map) if offset < len => {
                map[offset as usize] = value;
                Ok(())
            }
            _ => {
                warn!(offset, len, "write out of range");
                Err(EngineError::OutOfRange { offset, len })
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.map = None;
        self.len = 0;
        Ok(())
    }
}

/// In-memory byte source for small inputs and tests.
#[derive(Debug, Clone, Default)]
pub struct VecByteSource {
    data: Vec<u8>,
}

impl VecByteSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Current contents, e.g. for post-run assertions.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl ByteSource for VecByteSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_u8(&self, offset: u64) -> u8 {
        self.data.get(offset as usize).copied().unwrap_or(0)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) {
        buf.fill(0);
        if offset >= self.data.len() as u64 {
            return;
        }
        let start = offset as usize;
        let avail = (self.data.len() - start).min(buf.len());
        buf[..avail].copy_from_slice(&self.data[start..start + avail]);
    }

    fn write_u8(&mut self, offset: u64, value: u8) -> Result<()> {
        let len = self.data.len() as u64;
        match self.data.get_mut(offset as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => {
                warn!(offset, len, "write out of range");
                Err(EngineError::OutOfRange { offset, len })
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read `count` bytes at `offset` into a fresh vector.
pub fn read_vec(src: &dyn ByteSource, offset: u64, count: usize) -> Vec<u8> {
    let mut buf = vec![0u8; count];
    src.read_into(offset, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_vec_source_read_write() {
        let mut src = VecByteSource::new(vec![1, 2, 3, 4]);
        assert_eq!(src.len(), 4);
        assert_eq!(src.read_u8(0), 1);
        assert_eq!(src.read_u8(3), 4);
        // Out-of-range read yields zero.
        assert_eq!(src.read_u8(100), 0);

        src.write_u8(2, 0xAA).unwrap();
        assert_eq!(src.read_u8(2), 0xAA);

        assert!(matches!(
            src.write_u8(4, 0),
            Err(EngineError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_read_into_zero_fills_past_end() {
        let src = VecByteSource::new(vec![0xAB; 3]);
        let mut buf = [0xFFu8; 6];
        src.read_into(1, &mut buf);
        assert_eq!(buf, [0xAB, 0xAB, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mmap_source_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        file.flush().unwrap();

        let mut src = MmapByteSource::open(file.path()).unwrap();
        assert_eq!(src.len(), 64);

        src.write_u8(10, 0x5A).unwrap();
        assert_eq!(src.read_u8(10), 0x5A);
        src.flush().unwrap();

        // Out-of-range behavior matches the vector source.
        assert_eq!(src.read_u8(64), 0);
        assert!(src.write_u8(64, 0).is_err());
    }

    #[test]
    fn test_mmap_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut src = MmapByteSource::open(file.path()).unwrap();
        assert_eq!(src.len(), 0);
        assert_eq!(src.read_u8(0), 0);
        assert!(src.write_u8(0, 1).is_err());
        src.close().unwrap();
    }
}
