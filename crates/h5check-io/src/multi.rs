//! Multi driver: one member file per metadata memory type.
//!
//! The default layout opens `<base>-s.h5`, `<base>-b.h5`, `<base>-r.h5`,
//! `<base>-g.h5`, `<base>-l.h5` and `<base>-o.h5`, splitting the address
//! space into six equal ranges. The superblock's `NCSAmult` driver
//! information block can remap types onto shared members and move their
//! base addresses.

use std::path::{Path, PathBuf};

use crate::error::{IoError, IoResult};
use crate::segment::Segment;

/// Metadata memory types distinguished by the multi driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryType {
    /// Superblock and driver information.
    Super = 1,
    /// B-tree nodes.
    BTree = 2,
    /// Raw data.
    Draw = 3,
    /// Global heap collections.
    GlobalHeap = 4,
    /// Local heaps.
    LocalHeap = 5,
    /// Object headers.
    ObjectHeader = 6,
}

impl MemoryType {
    /// All types in on-disk order.
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Super,
        MemoryType::BTree,
        MemoryType::Draw,
        MemoryType::GlobalHeap,
        MemoryType::LocalHeap,
        MemoryType::ObjectHeader,
    ];

    /// Decode a memory-type byte from the driver information map.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value).checked_sub(1)?).copied()
    }

    /// Zero-based slot.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Letter used in the default member name.
    pub fn letter(self) -> char {
        match self {
            MemoryType::Super => 's',
            MemoryType::BTree => 'b',
            MemoryType::Draw => 'r',
            MemoryType::GlobalHeap => 'g',
            MemoryType::LocalHeap => 'l',
            MemoryType::ObjectHeader => 'o',
        }
    }
}

/// Default member file name for `mt` given the user-supplied base name.
pub fn default_member_name(base: &str, mt: MemoryType) -> String {
    format!("{base}-{}.h5", mt.letter())
}

/// Default start address of each memory type's region.
pub fn default_member_base(mt: MemoryType) -> u64 {
    mt.index() as u64 * ((u64::MAX - 1) / 6)
}

/// Member layout recorded in (or defaulted for) a multi file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiLayout {
    /// For each type, the type whose member actually stores it.
    pub map: [MemoryType; 6],
    /// Start address of each type's region.
    pub base: [u64; 6],
    /// End of allocated space for each unique member (0 when absent).
    pub eoa: [u64; 6],
    /// Member file name (or name template) for each unique member.
    pub names: [String; 6],
}

impl MultiLayout {
    /// Layout used before driver information has been read.
    pub fn default_for(base: &str) -> Self {
        Self {
            map: MemoryType::ALL,
            base: MemoryType::ALL.map(default_member_base),
            eoa: [0; 6],
            names: MemoryType::ALL.map(|mt| default_member_name(base, mt)),
        }
    }

    /// Decode an `NCSAmult` driver information body.
    ///
    /// Layout: six map bytes (0 meaning "self"), two padding bytes, then an
    /// `(address, eoa)` pair of 8-byte little-endian values for each member
    /// that maps to itself, then the NUL-terminated names of those members,
    /// each padded to a multiple of eight bytes. Names may contain `%s`,
    /// which is replaced with `base`.
    pub fn decode(info: &[u8], base: &str) -> IoResult<Self> {
        let bad = |reason: String| IoError::DriverInfo {
            driver: "multi",
            reason,
        };
        if info.len() < 8 {
            return Err(bad(format!("{} bytes is too short for a member map", info.len())));
        }
        let mut map = MemoryType::ALL;
        for (i, mt) in MemoryType::ALL.iter().enumerate() {
            map[i] = match info[i] {
                0 => *mt,
                v => MemoryType::from_u8(v)
                    .ok_or_else(|| bad(format!("memory type {v} in map slot {i}")))?,
            };
        }
        let mut layout = Self::default_for(base);
        layout.map = map;

        let unique: Vec<MemoryType> = MemoryType::ALL
            .into_iter()
            .filter(|mt| map[mt.index()] == *mt)
            .collect();
        if unique.is_empty() {
            return Err(bad("no member maps to itself".into()));
        }

        let mut pos = 8usize;
        for mt in &unique {
            let fields = info
                .get(pos..pos + 16)
                .ok_or_else(|| bad("truncated member address table".into()))?;
            let mut addr = [0u8; 8];
            let mut eoa = [0u8; 8];
            addr.copy_from_slice(&fields[..8]);
            eoa.copy_from_slice(&fields[8..]);
            layout.base[mt.index()] = u64::from_le_bytes(addr);
            layout.eoa[mt.index()] = u64::from_le_bytes(eoa);
            pos += 16;
        }
        for mt in &unique {
            let rest = info
                .get(pos..)
                .ok_or_else(|| bad("truncated member names".into()))?;
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| bad(format!("member name for {mt:?} is not terminated")))?;
            let name = String::from_utf8_lossy(&rest[..nul]).replace("%s", base);
            layout.names[mt.index()] = name;
            pos += (nul + 1).div_ceil(8) * 8;
        }
        // Aliased types share their target's base for address resolution.
        for mt in MemoryType::ALL {
            let target = layout.map[mt.index()];
            if target != mt {
                layout.base[mt.index()] = layout.base[target.index()];
                layout.names[mt.index()] = layout.names[target.index()].clone();
            }
        }
        Ok(layout)
    }
}

#[derive(Debug)]
struct Member {
    mt: MemoryType,
    base: u64,
    path: PathBuf,
    segment: Segment,
}

/// Open multi member set.
#[derive(Debug)]
pub struct MultiDriver {
    base_name: String,
    members: Vec<Member>,
}

impl MultiDriver {
    /// Open members using the default layout for `base`.
    pub fn open(base: &str) -> IoResult<Self> {
        Self::open_layout(base, &MultiLayout::default_for(base))
    }

    /// Open the unique members named by `layout`. Missing members other
    /// than the superblock member are skipped.
    pub fn open_layout(base: &str, layout: &MultiLayout) -> IoResult<Self> {
        let mut members = Vec::new();
        for mt in MemoryType::ALL {
            if layout.map[mt.index()] != mt {
                continue;
            }
            let path = PathBuf::from(&layout.names[mt.index()]);
            if mt != MemoryType::Super && !path.is_file() {
                tracing::debug!(member = %path.display(), "multi member absent");
                continue;
            }
            let segment = Segment::map(&path)?;
            members.push(Member {
                mt,
                base: layout.base[mt.index()],
                path,
                segment,
            });
        }
        members.sort_by_key(|m| m.base);
        tracing::debug!(base, members = members.len(), "opened multi file");
        Ok(Self {
            base_name: base.to_string(),
            members,
        })
    }

    /// Reopen the member set under a layout decoded from driver information.
    pub fn relayout(&mut self, layout: &MultiLayout) -> IoResult<()> {
        *self = Self::open_layout(&self.base_name.clone(), layout)?;
        Ok(())
    }

    /// Base name the member set was opened with.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Memory types backed by an open member, in address order.
    pub fn member_types(&self) -> Vec<MemoryType> {
        self.members.iter().map(|m| m.mt).collect()
    }

    fn member_for(&self, addr: u64) -> Option<&Member> {
        self.members.iter().rev().find(|m| m.base <= addr)
    }

    /// Read `buf.len()` bytes at physical address `addr`.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> IoResult<()> {
        let member = self.member_for(addr).ok_or(IoError::NoMember { addr })?;
        if member.segment.read_at(addr - member.base, buf) {
            Ok(())
        } else {
            Err(IoError::PastEof {
                path: member.path.clone(),
                addr,
                len: buf.len(),
                eof: member.base.saturating_add(member.segment.len()),
            })
        }
    }

    /// End of the highest addressed member.
    pub fn eof(&self) -> u64 {
        self.members
            .last()
            .map(|m| m.base.saturating_add(m.segment.len()))
            .unwrap_or(0)
    }

    /// Member file holding `addr`.
    pub fn filename(&self, addr: u64) -> &Path {
        self.member_for(addr)
            .or_else(|| self.members.first())
            .map(|m| m.path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Path of the superblock member.
    pub fn super_member(&self) -> &Path {
        self.members
            .iter()
            .find(|m| m.mt == MemoryType::Super)
            .map(|m| m.path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }
}
