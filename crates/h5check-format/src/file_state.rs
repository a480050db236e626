//! Per-file constants and the context handed to structure decoders.

use std::collections::HashSet;

use h5check_io::Driver;

use crate::decode::{is_undef, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::options::CompatLevel;
use crate::report::Report;
use crate::sohm::SohmTable;

/// Default group leaf node K.
pub const DEFAULT_SYM_LEAF_K: u16 = 4;
/// Default group internal node K.
pub const DEFAULT_GROUP_INTERNAL_K: u16 = 16;
/// Default indexed-storage internal node K.
pub const DEFAULT_ISTORE_K: u16 = 32;
/// Largest K whose node capacity of 2K still fits a 16-bit entry count.
pub const MAX_K: u16 = 0x7fff;

/// Format parameters of one file, filled in from the superblock and its
/// extension, plus the set of object headers already validated.
#[derive(Debug)]
pub struct FileState {
    /// Offset and length widths.
    pub sizes: Sizes,
    /// Superblock version.
    pub superblock_version: u8,
    /// Group leaf node K (symbol table node capacity is twice this).
    pub sym_leaf_k: u16,
    /// Group B-tree internal node K.
    pub group_internal_k: u16,
    /// Chunked dataset B-tree internal node K.
    pub istore_k: u16,
    /// Absolute address of the superblock.
    pub base_addr: u64,
    /// Superblock extension address.
    pub ext_addr: u64,
    /// End of allocated space.
    pub eoa: u64,
    /// Driver information block address.
    pub driver_addr: u64,
    /// Root group object header address.
    pub root_addr: u64,
    /// Shared message table, once decoded.
    pub sohm: Option<SohmTable>,
    visited: HashSet<u64>,
}

impl Default for FileState {
    fn default() -> Self {
        Self {
            sizes: Sizes::default(),
            superblock_version: 0,
            sym_leaf_k: DEFAULT_SYM_LEAF_K,
            group_internal_k: DEFAULT_GROUP_INTERNAL_K,
            istore_k: DEFAULT_ISTORE_K,
            base_addr: 0,
            ext_addr: crate::decode::UNDEF_ADDR,
            eoa: u64::MAX,
            driver_addr: crate::decode::UNDEF_ADDR,
            root_addr: crate::decode::UNDEF_ADDR,
            sohm: None,
            visited: HashSet::new(),
        }
    }
}

impl FileState {
    /// Fresh state with default K values.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `addr` is defined and below the end of allocated space.
    pub fn addr_valid(&self, addr: u64) -> bool {
        !is_undef(addr) && addr < self.eoa
    }

    /// True when `[addr, addr + len)` lies inside the allocated space.
    pub fn extent_valid(&self, addr: u64, len: u64) -> bool {
        !is_undef(addr)
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.eoa)
    }

    /// Mark the object header at `addr` as validated. Returns `false` when
    /// it already was.
    pub fn mark_visited(&mut self, addr: u64) -> bool {
        self.visited.insert(addr)
    }

    /// True when the header at `addr` has been validated.
    pub fn is_visited(&self, addr: u64) -> bool {
        self.visited.contains(&addr)
    }

    /// Number of distinct headers validated.
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }
}

/// Everything a structure decoder needs: the bytes, the file's parameters,
/// the complaint sink and the rules in force.
#[derive(Debug)]
pub struct FileContext<'a> {
    /// Driver for the file being checked.
    pub driver: &'a Driver,
    /// File parameters.
    pub state: &'a FileState,
    /// Complaint sink.
    pub report: &'a mut Report,
    /// Compatibility level.
    pub compat: CompatLevel,
}

impl<'a> FileContext<'a> {
    /// Offset and length widths.
    pub fn sizes(&self) -> Sizes {
        self.state.sizes
    }

    /// Record a complaint.
    pub fn record(&mut self, complaint: Complaint) {
        self.report.record(complaint);
    }

    /// Record `complaint` when `ok` is false.
    pub fn require(&mut self, ok: bool, complaint: impl FnOnce() -> Complaint) {
        if !ok {
            self.report.record(complaint());
        }
    }

    /// Read `len` bytes of the structure `what` at `addr`.
    ///
    /// An undefined address, or an extent past the end of allocated space or
    /// past the end of file, aborts the structure with a complaint instead
    /// of a fatal driver error.
    pub fn read(&self, addr: u64, len: usize, level: Level, what: &str) -> CheckResult<Vec<u8>> {
        if is_undef(addr) {
            return Err(CheckError::format(
                level,
                format!("{what}: undefined address"),
                addr,
            ));
        }
        if !self.state.extent_valid(addr, len as u64) {
            return Err(Complaint::new(
                level,
                format!("{what}: {len} bytes at this address extend beyond the end of allocated space"),
            )
            .at(addr)
            .value(self.state.eoa)
            .into());
        }
        if addr.saturating_add(len as u64) > self.driver.eof() {
            return Err(Complaint::new(
                level,
                format!("{what}: {len} bytes at this address extend beyond the end of file"),
            )
            .at(addr)
            .value(self.driver.eof())
            .into());
        }
        Ok(self.driver.read(addr, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_ranges() {
        let mut st = FileState::new();
        st.eoa = 100;
        assert!(st.addr_valid(99));
        assert!(!st.addr_valid(100));
        assert!(!st.addr_valid(crate::decode::UNDEF_ADDR));
        assert!(st.extent_valid(90, 10));
        assert!(!st.extent_valid(90, 11));
        assert!(!st.extent_valid(u64::MAX - 1, 5));
    }

    #[test]
    fn visited_at_most_once() {
        let mut st = FileState::new();
        assert!(st.mark_visited(40));
        assert!(!st.mark_visited(40));
        assert!(st.is_visited(40));
        assert_eq!(st.visited_count(), 1);
    }

    #[test]
    fn read_checks_extent_before_driver() {
        let drv = Driver::memory("ctx", vec![0u8; 64]);
        let mut st = FileState::new();
        st.eoa = 32;
        let mut report = Report::default();
        let ctx = FileContext {
            driver: &drv,
            state: &st,
            report: &mut report,
            compat: CompatLevel::V18,
        };
        assert_eq!(ctx.read(0, 16, Level::Structure, "blk").unwrap().len(), 16);
        match ctx.read(30, 4, Level::Structure, "blk") {
            Err(CheckError::Format(c)) => assert_eq!(c.address, Some(30)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ctx.read(crate::decode::UNDEF_ADDR, 1, Level::Structure, "blk"),
            Err(CheckError::Format(_))
        ));

        st.eoa = 1000;
        let ctx = FileContext {
            driver: &drv,
            state: &st,
            report: &mut report,
            compat: CompatLevel::V18,
        };
        assert!(matches!(
            ctx.read(60, 8, Level::Structure, "blk"),
            Err(CheckError::Format(_))
        ));
    }
}
