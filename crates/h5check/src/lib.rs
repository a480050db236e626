//! HDF5 file format conformance checker.
//!
//! This crate is the front end over `h5check-format`: it opens a file,
//! runs a [`Session`] over it and hands back the verdict with what was found.
//!
//! ```no_run
//! use h5check::{check_file, CheckOptions, Verdict};
//!
//! let outcome = check_file("data.h5", &CheckOptions::new().with_external_links(true));
//! for complaint in &outcome.complaints {
//!     println!("{complaint}");
//! }
//! assert_eq!(outcome.verdict, Verdict::Compliant);
//! ```

pub mod error;

use std::path::Path;

pub use error::{parse_address, AddressError};
pub use h5check_format::validator::Stats;
pub use h5check_format::{CheckOptions, CompatLevel, Complaint, Level, Verbosity, Verdict};

use h5check_format::Session;

/// Everything one check produced.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Overall result.
    pub verdict: Verdict,
    /// Complaints kept by the report, in the order they were found.
    pub complaints: Vec<Complaint>,
    /// Complaints found but not kept because the report was full.
    pub dropped: usize,
    /// Counters.
    pub stats: Stats,
    /// Fatal errors that ended a check early.
    pub fatal: Vec<String>,
}

/// Check the file at `path`, retaining complaints for the caller.
pub fn check_file(path: impl AsRef<Path>, options: &CheckOptions) -> CheckOutcome {
    let mut session = Session::new(options.clone().with_retain(true));
    let verdict = session.check_path(path.as_ref());
    let (report, stats, fatal) = session.into_parts();
    let dropped = report.dropped();
    CheckOutcome {
        verdict,
        complaints: report.into_complaints(),
        dropped,
        stats,
        fatal,
    }
}

/// A caller-sized store of `(message, address)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBuffer {
    slots: usize,
    entries: Vec<(String, Option<u64>)>,
    overflow: usize,
}

impl ErrorBuffer {
    /// Buffer holding at most `slots` entries.
    pub fn new(slots: usize) -> Self {
        Self {
            slots,
            entries: Vec::with_capacity(slots),
            overflow: 0,
        }
    }

    /// Store an entry, or count it when the buffer is full.
    pub fn push(&mut self, message: impl Into<String>, address: Option<u64>) {
        if self.entries.len() < self.slots {
            self.entries.push((message.into(), address));
        } else {
            self.overflow += 1;
        }
    }

    /// Stored entries.
    pub fn entries(&self) -> &[(String, Option<u64>)] {
        &self.entries
    }

    /// Entries that did not fit.
    pub fn overflow(&self) -> usize {
        self.overflow
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries and the overflow count.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.overflow = 0;
    }
}

/// Check the file at `path` (or only the header at `object_address`) and
/// copy every complaint into `buffer`. With `verbose`, complaints are also
/// logged as they are found.
pub fn check_into(
    path: impl AsRef<Path>,
    object_address: Option<u64>,
    verbose: bool,
    buffer: &mut ErrorBuffer,
) -> Verdict {
    let verbosity = if verbose { Verbosity::Normal } else { Verbosity::Terse };
    let options = CheckOptions::new()
        .with_object_address(object_address)
        .with_verbosity(verbosity);
    let outcome = check_file(path, &options);
    if verbose {
        for c in &outcome.complaints {
            tracing::error!("{c}");
        }
    }
    for message in outcome.fatal {
        buffer.push(message, None);
    }
    for c in outcome.complaints {
        buffer.push(c.description, c.address);
    }
    outcome.verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_buffer_bounds() {
        let mut buf = ErrorBuffer::new(2);
        buf.push("a", Some(1));
        buf.push("b", None);
        buf.push("c", Some(3));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.overflow(), 1);
        assert_eq!(buf.entries()[0], ("a".to_string(), Some(1)));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.overflow(), 0);
    }

    #[test]
    fn missing_file_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = check_file(dir.path().join("absent.h5"), &CheckOptions::new());
        assert_eq!(outcome.verdict, Verdict::Incomplete);
        assert_eq!(outcome.fatal.len(), 1);
        assert!(outcome.complaints.is_empty());
    }
}
