//! Symbol table entries and symbol table nodes (`SNOD`) of version 1 groups.

use crate::decode::{Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::local_heap::LocalHeap;
use crate::signature::{magic, matches};

/// Cached data held in an entry's scratch pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchPad {
    /// Cache type 0: nothing cached.
    None,
    /// Cache type 1: the entry is a group; B-tree and heap are cached.
    Group {
        /// Group B-tree address.
        btree_addr: u64,
        /// Local heap address.
        heap_addr: u64,
    },
    /// Cache type 2: the entry is a soft link.
    SoftLink {
        /// Heap offset of the link value.
        value_offset: u32,
    },
}

/// One symbol table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Offset of the link name in the group's local heap.
    pub name_offset: u64,
    /// Object header address.
    pub header_addr: u64,
    /// Scratch-pad contents.
    pub cache: ScratchPad,
}

impl SymbolTableEntry {
    /// Encoded size for the given widths.
    pub fn size(sizes: Sizes) -> usize {
        2 * sizes.addr_width() + 4 + 4 + 16
    }

    /// Decode one entry; a bad cache type is recorded and treated as 0.
    pub fn decode(
        d: &mut Decoder<'_>,
        sizes: Sizes,
        level: Level,
        complaints: &mut Vec<Complaint>,
    ) -> CheckResult<Self> {
        let at = d.address();
        let name_offset = d.uint(sizes.addr_width())?;
        let header_addr = d.addr(sizes)?;
        let cache_type = d.u32()?;
        d.skip(4)?;
        let scratch = d.bytes(16)?;
        let mut s = Decoder::new(scratch, at, level);
        let cache = match cache_type {
            0 => ScratchPad::None,
            // Wide offsets do not fit two addresses in the scratch pad.
            1 if 2 * sizes.addr_width() > 16 => ScratchPad::None,
            1 => ScratchPad::Group {
                btree_addr: s.addr(sizes)?,
                heap_addr: s.addr(sizes)?,
            },
            2 => ScratchPad::SoftLink {
                value_offset: s.u32()?,
            },
            other => {
                complaints.push(
                    Complaint::new(level, "symbol table entry: invalid cache type")
                        .at(at)
                        .value(u64::from(other)),
                );
                ScratchPad::None
            }
        };
        Ok(Self {
            name_offset,
            header_addr,
            cache,
        })
    }
}

/// A decoded symbol table node.
#[derive(Debug, Clone)]
pub struct SymbolNode {
    /// Node address.
    pub address: u64,
    /// Live entries.
    pub entries: Vec<SymbolTableEntry>,
}

impl SymbolNode {
    /// Encoded node size for leaf K `leaf_k`.
    pub fn size(sizes: Sizes, leaf_k: u16) -> usize {
        8 + 2 * usize::from(leaf_k) * SymbolTableEntry::size(sizes)
    }

    /// Decode and validate the node at `addr`; names are checked for strict
    /// ascending order against `heap`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64, heap: &LocalHeap) -> CheckResult<SymbolNode> {
        let sizes = ctx.sizes();
        let leaf_k = ctx.state.sym_leaf_k;
        let image = ctx.read(addr, Self::size(sizes, leaf_k), Level::Structure, "symbol table node")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::SNOD) {
            return Err(CheckError::format(
                Level::Structure,
                "symbol table node: incorrect signature",
                addr,
            ));
        }
        let version = d.u8()?;
        ctx.require(version == 1, || {
            Complaint::new(Level::Structure, "symbol table node: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        d.skip(1)?;
        let nsyms = d.u16()?;
        if u32::from(nsyms) > 2 * u32::from(leaf_k) {
            return Err(Complaint::new(
                Level::Structure,
                "symbol table node: number of symbols exceeds 2K",
            )
            .at(addr)
            .value(u64::from(nsyms))
            .into());
        }

        let mut notes = Vec::new();
        let mut entries = Vec::with_capacity(usize::from(nsyms));
        for _ in 0..nsyms {
            entries.push(SymbolTableEntry::decode(&mut d, sizes, Level::Structure, &mut notes)?);
        }
        ctx.report.extend(notes);

        let mut prev: Option<&[u8]> = None;
        for entry in &entries {
            match heap.name_at(entry.name_offset) {
                Ok(name) => {
                    if prev.is_some_and(|p| p >= name) {
                        ctx.record(
                            Complaint::new(
                                Level::Structure,
                                "symbol table node: names are not in increasing order",
                            )
                            .at(addr),
                        );
                    }
                    prev = Some(name);
                }
                Err(CheckError::Format(c)) => ctx.record(*c),
                Err(e) => return Err(e),
            }
        }
        Ok(SymbolNode {
            address: addr,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_bytes(name_off: u64, addr: u64, cache_type: u32, scratch: [u8; 16]) -> Vec<u8> {
        let mut v = name_off.to_le_bytes().to_vec();
        v.extend_from_slice(&addr.to_le_bytes());
        v.extend_from_slice(&cache_type.to_le_bytes());
        v.extend_from_slice(&[0; 4]);
        v.extend_from_slice(&scratch);
        v
    }

    #[test]
    fn decode_group_entry() {
        let mut scratch = [0u8; 16];
        scratch[..8].copy_from_slice(&136u64.to_le_bytes());
        scratch[8..].copy_from_slice(&680u64.to_le_bytes());
        let bytes = entry_bytes(0, 96, 1, scratch);
        let mut d = Decoder::new(&bytes, 0, Level::Superblock);
        let mut notes = Vec::new();
        let e = SymbolTableEntry::decode(&mut d, Sizes::default(), Level::Superblock, &mut notes).unwrap();
        assert!(notes.is_empty());
        assert_eq!(e.header_addr, 96);
        assert_eq!(
            e.cache,
            ScratchPad::Group {
                btree_addr: 136,
                heap_addr: 680
            }
        );
        assert_eq!(d.position(), SymbolTableEntry::size(Sizes::default()));
    }

    #[test]
    fn bad_cache_type_is_recorded() {
        let bytes = entry_bytes(8, 200, 7, [0; 16]);
        let mut d = Decoder::new(&bytes, 0, Level::Structure);
        let mut notes = Vec::new();
        let e = SymbolTableEntry::decode(&mut d, Sizes::default(), Level::Structure, &mut notes).unwrap();
        assert_eq!(e.cache, ScratchPad::None);
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn node_with_large_leaf_k() {
        use crate::file_state::FileState;
        use crate::options::CompatLevel;
        use crate::report::Report;
        use crate::testutil::ImageBuilder;
        use h5check_io::Driver;

        let k = 40_000;
        let mut b = ImageBuilder::new();
        let (heap_addr, offsets) = b.local_heap(&["a"]);
        let mut node = b"SNOD".to_vec();
        node.extend_from_slice(&[1, 0]);
        node.extend_from_slice(&1u16.to_le_bytes());
        node.extend_from_slice(&entry_bytes(offsets[0], 0, 0, [0; 16]));
        node.resize(SymbolNode::size(Sizes::default(), k), 0);
        let node_addr = b.put(&node);

        let drv = Driver::memory("snod", b.into_bytes());
        let mut st = FileState::new();
        st.eoa = drv.eof();
        st.sym_leaf_k = k;
        let mut report = Report::default();
        let mut ctx = FileContext {
            driver: &drv,
            state: &st,
            report: &mut report,
            compat: CompatLevel::V18,
        };
        let heap = LocalHeap::load(&mut ctx, heap_addr).unwrap();
        let node = SymbolNode::load(&mut ctx, node_addr, &heap).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert!(report.is_clean(), "{:?}", report.complaints());
    }

    #[test]
    fn node_size() {
        assert_eq!(SymbolNode::size(Sizes::default(), 4), 8 + 8 * 40);
    }
}
