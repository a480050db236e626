//! Bounded complaint accumulator.

use std::path::PathBuf;

use crate::error::Complaint;

/// Collects complaints for one run.
///
/// Every complaint is counted. At most `capacity` are kept; the rest are
/// counted as dropped. In non-retaining mode, [`Report::flush`] logs the
/// pending complaints through `tracing` and clears them, which the
/// validators do at the end of each superblock, header, B-tree node and heap.
#[derive(Debug)]
pub struct Report {
    capacity: usize,
    retain: bool,
    pending: Vec<Complaint>,
    total: usize,
    dropped: usize,
    silent: bool,
    current_file: Option<PathBuf>,
}

impl Report {
    /// Empty report.
    pub fn new(capacity: usize, retain: bool) -> Self {
        Self {
            capacity,
            retain,
            pending: Vec::new(),
            total: 0,
            dropped: 0,
            silent: false,
            current_file: None,
        }
    }

    /// Discard flushed complaints without logging them.
    pub fn silenced(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Stamp subsequent complaints that carry no file with `file`.
    pub fn set_current_file(&mut self, file: Option<PathBuf>) -> Option<PathBuf> {
        std::mem::replace(&mut self.current_file, file)
    }

    /// Record one complaint.
    pub fn record(&mut self, mut complaint: Complaint) {
        self.total += 1;
        if complaint.file.is_none() {
            complaint.file = self.current_file.clone();
        }
        if self.pending.len() < self.capacity {
            self.pending.push(complaint);
        } else {
            self.dropped += 1;
        }
    }

    /// Record every complaint in `complaints`.
    pub fn extend(&mut self, complaints: impl IntoIterator<Item = Complaint>) {
        for c in complaints {
            self.record(c);
        }
    }

    /// Log and discard pending complaints unless retaining.
    pub fn flush(&mut self) {
        if self.retain {
            return;
        }
        if self.silent {
            self.pending.clear();
            return;
        }
        for c in self.pending.drain(..) {
            tracing::error!(level = c.level as u8, address = ?c.address, "{c}");
        }
    }

    /// Number of complaints recorded so far, kept or not.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of complaints discarded because the report was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// True when nothing has been recorded.
    pub fn is_clean(&self) -> bool {
        self.total == 0
    }

    /// Complaints currently held.
    pub fn complaints(&self) -> &[Complaint] {
        &self.pending
    }

    /// Take the held complaints.
    pub fn into_complaints(self) -> Vec<Complaint> {
        self.pending
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new(1024, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Level;

    #[test]
    fn bounded_capacity() {
        let mut r = Report::new(2, true);
        for i in 0..5 {
            r.record(Complaint::new(Level::Structure, "x").at(i));
        }
        assert_eq!(r.total(), 5);
        assert_eq!(r.complaints().len(), 2);
        assert_eq!(r.dropped(), 3);
    }

    #[test]
    fn flush_discards_unless_retaining() {
        let mut r = Report::new(8, false);
        r.record(Complaint::new(Level::Message, "a"));
        r.flush();
        assert!(r.complaints().is_empty());
        assert_eq!(r.total(), 1);
        assert!(!r.is_clean());

        let mut kept = Report::new(8, true);
        kept.record(Complaint::new(Level::Message, "a"));
        kept.flush();
        assert_eq!(kept.complaints().len(), 1);
    }

    #[test]
    fn silenced_flush_still_counts() {
        let mut r = Report::new(8, false).silenced(true);
        r.record(Complaint::new(Level::Structure, "a"));
        r.record(Complaint::new(Level::Structure, "b"));
        r.flush();
        assert!(r.complaints().is_empty());
        assert_eq!(r.total(), 2);

        let mut kept = Report::new(8, true).silenced(true);
        kept.record(Complaint::new(Level::Structure, "a"));
        kept.flush();
        assert_eq!(kept.complaints().len(), 1);
    }

    #[test]
    fn stamps_current_file() {
        let mut r = Report::default();
        r.set_current_file(Some(PathBuf::from("ext.h5")));
        r.record(Complaint::new(Level::Superblock, "a"));
        r.record(Complaint::new(Level::Superblock, "b").in_file("other.h5"));
        assert_eq!(r.complaints()[0].file, Some(PathBuf::from("ext.h5")));
        assert_eq!(r.complaints()[1].file, Some(PathBuf::from("other.h5")));
    }
}
