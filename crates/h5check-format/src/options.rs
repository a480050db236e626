//! Run configuration, passed explicitly to every validator.

use std::path::PathBuf;

/// Library release whose format rules a file is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CompatLevel {
    /// 1.6.x: superblock v0/v1, object header v1, no link/attribute-info
    /// messages.
    V16,
    /// 1.8.x and later: the full format.
    #[default]
    V18,
}

impl CompatLevel {
    /// Parse the command-line spelling (`16` or `18`).
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            16 => Some(CompatLevel::V16),
            18 => Some(CompatLevel::V18),
            _ => None,
        }
    }
}

/// How much a run narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Only the final verdict.
    Terse,
    /// Progress and every recorded complaint.
    #[default]
    Normal,
    /// Internal traces as well.
    Debug,
}

/// Options for one validation run.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Format rules to apply.
    pub compat: CompatLevel,
    /// Narration level.
    pub verbosity: Verbosity,
    /// Validate the targets of external links.
    pub follow_external: bool,
    /// Validate only the object header at this address.
    pub object_address: Option<u64>,
    /// Maximum complaints kept in the report.
    pub report_capacity: usize,
    /// Keep complaints in the report instead of logging and discarding them
    /// at structure boundaries.
    pub retain: bool,
    /// Directories searched for external link targets, in order.
    pub ext_prefixes: Vec<PathBuf>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            compat: CompatLevel::default(),
            verbosity: Verbosity::default(),
            follow_external: false,
            object_address: None,
            report_capacity: 1024,
            retain: true,
            ext_prefixes: Vec::new(),
        }
    }
}

impl CheckOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compatibility level.
    pub fn with_compat(mut self, compat: CompatLevel) -> Self {
        self.compat = compat;
        self
    }

    /// Set verbosity.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Enable or disable external link traversal.
    pub fn with_external_links(mut self, follow: bool) -> Self {
        self.follow_external = follow;
        self
    }

    /// Check a single object header.
    pub fn with_object_address(mut self, address: Option<u64>) -> Self {
        self.object_address = address;
        self
    }

    /// Bound the number of retained complaints.
    pub fn with_report_capacity(mut self, capacity: usize) -> Self {
        self.report_capacity = capacity;
        self
    }

    /// Retain complaints for the caller.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Add an external link search directory.
    pub fn with_ext_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ext_prefixes.push(dir.into());
        self
    }

    /// Add every directory of a `:`-separated search path, as found in
    /// `HDF5_EXT_PREFIX`.
    pub fn with_ext_search_path(mut self, search_path: &str) -> Self {
        self.ext_prefixes.extend(
            search_path
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = CheckOptions::new();
        assert_eq!(o.compat, CompatLevel::V18);
        assert_eq!(o.verbosity, Verbosity::Normal);
        assert!(!o.follow_external);
        assert!(o.retain);
    }

    #[test]
    fn compat_codes() {
        assert_eq!(CompatLevel::from_code(16), Some(CompatLevel::V16));
        assert_eq!(CompatLevel::from_code(18), Some(CompatLevel::V18));
        assert_eq!(CompatLevel::from_code(110), None);
    }

    #[test]
    fn search_path_split() {
        let o = CheckOptions::new().with_ext_search_path("/a::/b/c:");
        assert_eq!(o.ext_prefixes, vec![PathBuf::from("/a"), PathBuf::from("/b/c")]);
    }
}
