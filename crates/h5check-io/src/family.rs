//! Family driver: one logical file split into fixed-size numbered members.
//!
//! Members are named by a printf-style pattern such as `data%05d.h5`. A
//! logical address maps to `(address / member_size, address % member_size)`.

use std::path::{Path, PathBuf};

use crate::error::{IoError, IoResult};
use crate::segment::Segment;

/// Expand a printf-style member pattern for `index`.
///
/// Supports `%d`, `%Nd`, `%0Nd` and `%%`. Any other conversion is copied
/// through verbatim.
pub fn member_name(pattern: &str, index: u32) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                spec.push(d);
                chars.next();
            } else {
                break;
            }
        }
        match chars.next() {
            Some('d') => {
                let zero = spec.starts_with('0');
                let width: usize = spec.parse().unwrap_or(0);
                if zero {
                    out.push_str(&format!("{index:0width$}"));
                } else {
                    out.push_str(&format!("{index:width$}"));
                }
            }
            Some('%') if spec.is_empty() => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push_str(&spec);
                out.push(other);
            }
            None => {
                out.push('%');
                out.push_str(&spec);
            }
        }
    }
    out
}

/// Open family member set.
#[derive(Debug)]
pub struct FamilyDriver {
    pattern: String,
    members: Vec<(PathBuf, Segment)>,
    member_size: u64,
}

impl FamilyDriver {
    /// Open every consecutive member matching `pattern`, starting at 0.
    ///
    /// The member size defaults to the length of member 0 until
    /// [`FamilyDriver::set_member_size`] installs the size recorded in the file.
    pub fn open(pattern: &str) -> IoResult<Self> {
        let mut members = Vec::new();
        let mut index = 0u32;
        loop {
            let path = PathBuf::from(member_name(pattern, index));
            if !path.is_file() {
                break;
            }
            let seg = Segment::map(&path)?;
            members.push((path, seg));
            index += 1;
        }
        if members.is_empty() {
            return Err(IoError::NoMembers {
                pattern: pattern.to_string(),
            });
        }
        let member_size = members[0].1.len().max(1);
        tracing::debug!(pattern, members = members.len(), member_size, "opened family");
        Ok(Self {
            pattern: pattern.to_string(),
            members,
            member_size,
        })
    }

    /// The pattern this family was opened with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Number of open members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Current member size.
    pub fn member_size(&self) -> u64 {
        self.member_size
    }

    /// Install the member size recorded in the file's driver information.
    pub fn set_member_size(&mut self, size: u64) -> IoResult<()> {
        if size == 0 {
            return Err(IoError::DriverInfo {
                driver: "family",
                reason: "member size is zero".into(),
            });
        }
        let last = self.members.len() - 1;
        for (i, (path, seg)) in self.members.iter().enumerate() {
            if i < last && seg.len() != size {
                return Err(IoError::DriverInfo {
                    driver: "family",
                    reason: format!(
                        "member {} is {} bytes, expected {size}",
                        path.display(),
                        seg.len()
                    ),
                });
            }
        }
        self.member_size = size;
        Ok(())
    }

    /// Split a physical address into `(member index, offset in member)`.
    pub fn map_address(&self, addr: u64) -> (u64, u64) {
        (addr / self.member_size, addr % self.member_size)
    }

    /// Read `buf.len()` bytes at physical address `addr`, crossing member
    /// boundaries as needed.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> IoResult<()> {
        let mut done = 0usize;
        let mut cursor = addr;
        while done < buf.len() {
            let (index, offset) = self.map_address(cursor);
            let in_member = (self.member_size - offset).min((buf.len() - done) as u64) as usize;
            let member = usize::try_from(index)
                .ok()
                .and_then(|i| self.members.get(i));
            let Some((_, seg)) = member else {
                return Err(self.past_eof(addr, buf.len()));
            };
            if !seg.read_at(offset, &mut buf[done..done + in_member]) {
                return Err(self.past_eof(addr, buf.len()));
            }
            done += in_member;
            cursor += in_member as u64;
        }
        Ok(())
    }

    /// Physical end of file.
    pub fn eof(&self) -> u64 {
        let last = self.members.len() as u64 - 1;
        last * self.member_size + self.members[last as usize].1.len()
    }

    /// Member holding `addr` (the last member when past the end).
    pub fn filename(&self, addr: u64) -> &Path {
        let (index, _) = self.map_address(addr);
        let i = usize::try_from(index)
            .unwrap_or(usize::MAX)
            .min(self.members.len() - 1);
        &self.members[i].0
    }

    /// Path of member 0.
    pub fn first_member(&self) -> &Path {
        &self.members[0].0
    }

    fn past_eof(&self, addr: u64, len: usize) -> IoError {
        IoError::PastEof {
            path: self.filename(addr).to_path_buf(),
            addr,
            len,
            eof: self.eof(),
        }
    }
}
