//! HDF5 structural conformance checks.
//!
//! Decoders for every on-disk metadata structure of the HDF5 format, each of
//! which validates what it reads and records a [`Complaint`] for every
//! violation instead of stopping at the first one. [`validator::Session`]
//! ties them together into a walk of a whole file (and the files its
//! external links name).

pub mod btree_v1;
pub mod btree_v2;
pub mod checksum;
pub mod chunk_index;
pub mod decode;
pub mod error;
pub mod file_state;
pub mod filters;
pub mod fractal_heap;
pub mod free_space;
pub mod global_heap;
pub mod local_heap;
pub mod message_type;
pub mod messages;
pub mod object_header;
pub mod options;
pub mod report;
pub mod signature;
pub mod sohm;
pub mod superblock;
pub mod symbol_table;
pub mod validator;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use error::{CheckError, CheckResult, Complaint, Level};
pub use options::{CheckOptions, CompatLevel, Verbosity};
pub use report::Report;
pub use validator::{Session, Stats, Verdict};
