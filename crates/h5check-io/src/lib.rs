//! File drivers for the h5check HDF5 validator.
//!
//! A [`Driver`] is the only way the format layer touches bytes. It exposes a
//! flat logical address space starting at the superblock, no matter whether
//! the file is a single file (sec2), a set of per-memory-type members
//! (multi), numbered fixed-size members (family), or an image already held in
//! memory.
//!
//! Logical addresses are relative to a base offset. The validator installs
//! the base once it has located the superblock signature; the driver adds it
//! before every physical read.

pub mod error;
pub mod family;
pub mod multi;
pub mod segment;

use std::path::{Path, PathBuf};

pub use error::{IoError, IoResult};
pub use family::FamilyDriver;
pub use multi::{MemoryType, MultiDriver, MultiLayout};
pub use segment::Segment;

/// Driver identifier of the family driver's information block.
pub const FAMILY_DRIVER_ID: &str = "NCSAfami";
/// Driver identifier of the multi driver's information block.
pub const MULTI_DRIVER_ID: &str = "NCSAmult";

/// Which backend a [`Driver`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// One plain file.
    Sec2,
    /// Per-memory-type member files.
    Multi,
    /// Numbered fixed-size member files.
    Family,
    /// In-memory byte image.
    Memory,
}

/// Identity of the physical file behind a driver, used to detect external
/// link cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileIdentity {
    /// Device, inode and mode of a file on a unix filesystem.
    Inode {
        /// Device number.
        device: u64,
        /// Inode number.
        inode: u64,
        /// File mode bits.
        mode: u32,
    },
    /// Canonical path on platforms without inode numbers.
    Path(PathBuf),
    /// Name of an in-memory image.
    Memory(String),
}

impl FileIdentity {
    /// Identity of the file at `path`.
    pub fn of_path(path: &Path) -> IoResult<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(path).map_err(|source| IoError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(FileIdentity::Inode {
                device: meta.dev(),
                inode: meta.ino(),
                mode: meta.mode(),
            })
        }
        #[cfg(not(unix))]
        {
            let canonical = std::fs::canonicalize(path).map_err(|source| IoError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(FileIdentity::Path(canonical))
        }
    }
}

#[derive(Debug)]
enum Backend {
    Sec2 { path: PathBuf, segment: Segment },
    Multi(MultiDriver),
    Family(FamilyDriver),
    Memory { name: String, bytes: Segment },
}

/// An open HDF5 file (or file set).
#[derive(Debug)]
pub struct Driver {
    backend: Backend,
    base: u64,
}

impl Driver {
    /// Open `path`, choosing the backend by naming convention.
    ///
    /// A path containing `%` is a family pattern. A path naming an existing
    /// file opens with sec2. Otherwise, if `<path>-s.h5` exists the multi
    /// driver is used. Anything else is an open failure for `path`.
    pub fn open(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref();
        let text = path.to_string_lossy();
        if text.contains('%') {
            return Self::family(&text);
        }
        if path.is_file() {
            return Self::sec2(path);
        }
        let super_member = multi::default_member_name(&text, MemoryType::Super);
        if Path::new(&super_member).is_file() {
            return Self::multi(&text);
        }
        Err(IoError::Open {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        })
    }

    /// Open a single plain file.
    pub fn sec2(path: impl AsRef<Path>) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let segment = Segment::map(&path)?;
        tracing::debug!(path = %path.display(), len = segment.len(), "opened sec2 file");
        Ok(Self {
            backend: Backend::Sec2 { path, segment },
            base: 0,
        })
    }

    /// Open a family file set from a printf-style pattern.
    pub fn family(pattern: &str) -> IoResult<Self> {
        Ok(Self {
            backend: Backend::Family(FamilyDriver::open(pattern)?),
            base: 0,
        })
    }

    /// Open a multi file set with the default member layout for `base`.
    pub fn multi(base: &str) -> IoResult<Self> {
        Ok(Self {
            backend: Backend::Multi(MultiDriver::open(base)?),
            base: 0,
        })
    }

    /// Wrap an in-memory image. `name` is used in messages and as identity.
    pub fn memory(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            backend: Backend::Memory {
                name: name.into(),
                bytes: Segment::Owned(bytes),
            },
            base: 0,
        }
    }

    /// Backend in use.
    pub fn kind(&self) -> DriverKind {
        match self.backend {
            Backend::Sec2 { .. } => DriverKind::Sec2,
            Backend::Multi(_) => DriverKind::Multi,
            Backend::Family(_) => DriverKind::Family,
            Backend::Memory { .. } => DriverKind::Memory,
        }
    }

    /// Base offset added to every logical address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Install the base offset (the physical address of the superblock).
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    fn physical(&self, addr: u64) -> IoResult<u64> {
        self.base
            .checked_add(addr)
            .ok_or(IoError::AddressOverflow { addr })
    }

    /// Fill `buf` from logical address `addr`.
    pub fn read_into(&self, addr: u64, buf: &mut [u8]) -> IoResult<()> {
        let phys = self.physical(addr)?;
        if phys.checked_add(buf.len() as u64).is_none() {
            return Err(IoError::AddressOverflow { addr });
        }
        match &self.backend {
            Backend::Sec2 { path, segment } => read_segment(path, segment, phys, buf),
            Backend::Memory { name, bytes } => read_segment(Path::new(name), bytes, phys, buf),
            Backend::Multi(m) => m.read_at(phys, buf),
            Backend::Family(f) => f.read_at(phys, buf),
        }
    }

    /// Read `len` bytes at logical address `addr`.
    pub fn read(&self, addr: u64, len: usize) -> IoResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Physical end of file.
    pub fn physical_eof(&self) -> u64 {
        match &self.backend {
            Backend::Sec2 { segment, .. } => segment.len(),
            Backend::Memory { bytes, .. } => bytes.len(),
            Backend::Multi(m) => m.eof(),
            Backend::Family(f) => f.eof(),
        }
    }

    /// End of file in logical addresses.
    pub fn eof(&self) -> u64 {
        self.physical_eof().saturating_sub(self.base)
    }

    /// Name of the file (or member) holding logical address `addr`.
    pub fn filename(&self, addr: u64) -> &Path {
        let phys = self.base.saturating_add(addr);
        match &self.backend {
            Backend::Sec2 { path, .. } => path,
            Backend::Memory { name, .. } => Path::new(name),
            Backend::Multi(m) => m.filename(phys),
            Backend::Family(f) => f.filename(phys),
        }
    }

    /// Name of the file as the user gave it: the sec2 path, the family
    /// pattern, the multi base name, or the image name.
    pub fn name(&self) -> &Path {
        match &self.backend {
            Backend::Sec2 { path, .. } => path,
            Backend::Memory { name, .. } => Path::new(name),
            Backend::Multi(m) => Path::new(m.base_name()),
            Backend::Family(f) => Path::new(f.pattern()),
        }
    }

    /// Identity of the physical file holding the superblock.
    pub fn identity(&self) -> IoResult<FileIdentity> {
        match &self.backend {
            Backend::Sec2 { path, .. } => FileIdentity::of_path(path),
            Backend::Memory { name, .. } => Ok(FileIdentity::Memory(name.clone())),
            Backend::Multi(m) => FileIdentity::of_path(m.super_member()),
            Backend::Family(f) => FileIdentity::of_path(f.first_member()),
        }
    }

    /// Apply a driver information block found in the superblock.
    ///
    /// Returns `Ok(true)` when the block was understood and applied,
    /// `Ok(false)` when the identifier does not match the open backend, and
    /// an error when the body is malformed.
    pub fn apply_driver_info(&mut self, id: &str, info: &[u8]) -> IoResult<bool> {
        let kind = self.kind();
        match (&mut self.backend, id) {
            (Backend::Family(f), FAMILY_DRIVER_ID) => {
                let size = info.get(..8).ok_or_else(|| IoError::DriverInfo {
                    driver: "family",
                    reason: format!("{} bytes is too short for a member size", info.len()),
                })?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(size);
                f.set_member_size(u64::from_le_bytes(raw))?;
                Ok(true)
            }
            (Backend::Multi(m), MULTI_DRIVER_ID) => {
                let layout = MultiLayout::decode(info, &m.base_name().to_string())?;
                m.relayout(&layout)?;
                Ok(true)
            }
            _ => {
                tracing::debug!(id, ?kind, "driver information not applied");
                Ok(false)
            }
        }
    }
}

fn read_segment(path: &Path, segment: &Segment, phys: u64, buf: &mut [u8]) -> IoResult<()> {
    if segment.read_at(phys, buf) {
        Ok(())
    } else {
        Err(IoError::PastEof {
            path: path.to_path_buf(),
            addr: phys,
            len: buf.len(),
            eof: segment.len(),
        })
    }
}
