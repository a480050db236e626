//! Read-only backing storage for one physical file.

use std::fs;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{IoError, IoResult};

/// Bytes of one physical file: memory-mapped when opened from disk, owned
/// when built in memory.
pub enum Segment {
    /// Read-only mapping of a file on disk.
    Mapped(Mmap),
    /// An owned byte image.
    Owned(Vec<u8>),
}

impl Segment {
    /// Map the file at `path` read-only.
    pub fn map(path: &Path) -> IoResult<Self> {
        let file = fs::File::open(path).map_err(|source| IoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Segment::Owned(Vec::new()));
        }
        // SAFETY: the mapping is read-only and the validator never writes;
        // concurrent modification by another process is outside our contract.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Segment::Mapped(mmap))
    }

    /// The full contents.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Segment::Mapped(m) => m,
            Segment::Owned(v) => v,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.as_bytes().len() as u64
    }

    /// True when the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Copy `buf.len()` bytes starting at `offset`. Returns `false` when the
    /// range is not fully inside the segment.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> bool {
        let bytes = self.as_bytes();
        let Ok(start) = usize::try_from(offset) else {
            return false;
        };
        match start.checked_add(buf.len()) {
            Some(end) if end <= bytes.len() => {
                buf.copy_from_slice(&bytes[start..end]);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Mapped(m) => write!(f, "Segment::Mapped({} bytes)", m.len()),
            Segment::Owned(v) => write!(f, "Segment::Owned({} bytes)", v.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn owned_read_in_bounds() {
        let seg = Segment::Owned(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert!(seg.read_at(1, &mut buf));
        assert_eq!(buf, [2, 3, 4]);
    }

    #[test]
    fn owned_read_past_end() {
        let seg = Segment::Owned(vec![1, 2, 3]);
        let mut buf = [0u8; 2];
        assert!(!seg.read_at(2, &mut buf));
        assert!(!seg.read_at(u64::MAX, &mut buf));
    }

    #[test]
    fn map_file_and_empty_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"HDF5 bytes").unwrap();
        f.flush().unwrap();
        let seg = Segment::map(f.path()).unwrap();
        assert_eq!(seg.len(), 10);
        assert_eq!(&seg.as_bytes()[..4], b"HDF5");

        let empty = tempfile::NamedTempFile::new().unwrap();
        let seg = Segment::map(empty.path()).unwrap();
        assert!(seg.is_empty());
    }

    #[test]
    fn map_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Segment::map(&dir.path().join("nope.h5")).unwrap_err();
        assert!(matches!(err, IoError::Open { .. }));
    }
}
