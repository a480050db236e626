//! Error types for the file drivers.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for driver operations.
pub type IoResult<T> = Result<T, IoError>;

/// Failures raised by a driver. Every variant is fatal for the file being read.
#[derive(Debug, Error)]
pub enum IoError {
    /// The file (or one member of a file set) could not be opened.
    #[error("unable to open {path}: {source}")]
    Open {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A read extends past the end of the backing storage.
    #[error("read of {len} bytes at address {addr:#x} runs past end of file {path} (eof {eof:#x})")]
    PastEof {
        /// Member holding the start of the read.
        path: PathBuf,
        /// Physical address of the read.
        addr: u64,
        /// Requested length.
        len: usize,
        /// End of the member.
        eof: u64,
    },

    /// A logical address plus the base offset does not fit in 64 bits.
    #[error("address {addr:#x} overflows the address space")]
    AddressOverflow {
        /// Logical address that overflowed.
        addr: u64,
    },

    /// No member of a family matched the name pattern.
    #[error("no family members match {pattern}")]
    NoMembers {
        /// The printf-style pattern.
        pattern: String,
    },

    /// No open multi member covers an address.
    #[error("no multi-file member holds address {addr:#x}")]
    NoMember {
        /// Physical address that could not be mapped.
        addr: u64,
    },

    /// Driver information stored in the file could not be applied.
    #[error("malformed {driver} driver information: {reason}")]
    DriverInfo {
        /// Driver name (`family` or `multi`).
        driver: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// Any other OS-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
