//! Error and complaint types for HDF5 structure validation.
//!
//! Format problems are *complaints*: they are recorded in a
//! [`Report`](crate::report::Report) and validation carries on. When a
//! structure cannot be decoded any further, the complaint travels as
//! [`CheckError::Format`] to the caller, which records it and moves on to
//! the next sibling structure. Driver failures and internal errors end the
//! file.

use core::fmt;
use std::path::PathBuf;

use h5check_io::IoError;
use thiserror::Error;

/// Result alias used throughout the validators.
pub type CheckResult<T> = Result<T, CheckError>;

/// Structural level a complaint belongs to, mirroring the levels of the
/// HDF5 file format description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Superblock, driver information and superblock extension.
    Superblock = 0,
    /// B-trees, heaps, free-space managers, shared message tables.
    Structure = 1,
    /// Object headers and their messages.
    Message = 2,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "level {}", *self as u8)
    }
}

/// One non-conformance found in a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complaint {
    /// Structural level.
    pub level: Level,
    /// Human-readable description.
    pub description: String,
    /// Address of the offending structure, if known.
    pub address: Option<u64>,
    /// Offending value, if there is a single one.
    pub bad_value: Option<u64>,
    /// File the structure lives in, when it is not the file being checked
    /// at top level (external links) or once stamped by the report.
    pub file: Option<PathBuf>,
}

impl Complaint {
    /// New complaint without an address.
    pub fn new(level: Level, description: impl Into<String>) -> Self {
        Self {
            level,
            description: description.into(),
            address: None,
            bad_value: None,
            file: None,
        }
    }

    /// Attach the address of the offending structure.
    pub fn at(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    /// Attach the offending value.
    pub fn value(mut self, bad_value: u64) -> Self {
        self.bad_value = Some(bad_value);
        self
    }

    /// Attach the file name.
    pub fn in_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for Complaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***Error*** ({}) {}", self.level, self.description)?;
        if let Some(addr) = self.address {
            write!(f, " at address {addr}")?;
        }
        if let Some(v) = self.bad_value {
            write!(f, " (value {v})")?;
        }
        if let Some(file) = &self.file {
            write!(f, " in {}", file.display())?;
        }
        Ok(())
    }
}

/// Errors returned by validators.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The driver could not read the file. Fatal for the file.
    #[error(transparent)]
    Io(#[from] IoError),
    /// An internal invariant failed. Fatal for the file.
    #[error("internal error: {0}")]
    Internal(String),
    /// A structure could not be decoded any further. The caller records the
    /// complaint and continues with sibling structures.
    #[error("{0}")]
    Format(Box<Complaint>),
}

impl CheckError {
    /// Structure-local abort at `address`.
    pub fn format(level: Level, description: impl Into<String>, address: u64) -> Self {
        CheckError::Format(Box::new(Complaint::new(level, description).at(address)))
    }

    /// True for errors that end validation of the whole file.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CheckError::Format(_))
    }
}

impl From<Complaint> for CheckError {
    fn from(c: Complaint) -> Self {
        CheckError::Format(Box::new(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complaint_display() {
        let c = Complaint::new(Level::Structure, "bad signature")
            .at(1024)
            .value(7);
        assert_eq!(
            c.to_string(),
            "***Error*** (level 1) bad signature at address 1024 (value 7)"
        );
    }

    #[test]
    fn fatality() {
        assert!(!CheckError::format(Level::Message, "x", 0).is_fatal());
        assert!(CheckError::Internal("oops".into()).is_fatal());
        let io: CheckError = IoError::AddressOverflow { addr: 1 }.into();
        assert!(io.is_fatal());
    }

    #[test]
    fn levels_order() {
        assert!(Level::Superblock < Level::Structure);
        assert!(Level::Structure < Level::Message);
    }
}
