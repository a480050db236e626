//! B-tree v1 (`TREE`) walking and validation.
//!
//! Node type 0 indexes a version 1 group: keys are local heap name offsets
//! and leaf children are symbol table nodes. Node type 1 indexes the chunks
//! of a dataset: keys are chunk size, filter mask and chunk offsets, and
//! leaf children are the chunks themselves.
//!
//! The walk checks every node and hands the leaf children back to the
//! caller, which validates what they point to.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::decode::{is_undef, Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::local_heap::LocalHeap;
use crate::signature::{magic, matches};

/// Node type of group B-trees.
pub const NODE_TYPE_GROUP: u8 = 0;
/// Node type of chunk B-trees.
pub const NODE_TYPE_CHUNK: u8 = 1;

/// Key of a chunk B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    /// Stored size of the chunk in bytes.
    pub size: u32,
    /// Filters skipped for this chunk.
    pub filter_mask: u32,
    /// Chunk offset in each dimension, element dimension last.
    pub offsets: Vec<u64>,
}

impl ChunkKey {
    fn decode(d: &mut Decoder<'_>, ndims: usize) -> CheckResult<Self> {
        let size = d.u32()?;
        let filter_mask = d.u32()?;
        let mut offsets = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            offsets.push(d.u64()?);
        }
        Ok(Self {
            size,
            filter_mask,
            offsets,
        })
    }

    /// Order chunks by offset, dimension by dimension.
    pub fn cmp_offsets(&self, other: &Self) -> Ordering {
        self.offsets.cmp(&other.offsets)
    }
}

/// One chunk found in a chunk B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Left key of the chunk.
    pub key: ChunkKey,
    /// Chunk address.
    pub addr: u64,
}

#[derive(Debug, Clone)]
enum Keys {
    Group(Vec<u64>),
    Chunk(Vec<ChunkKey>),
}

/// A decoded B-tree v1 node.
#[derive(Debug, Clone)]
pub struct BTreeV1Node {
    /// Node address.
    pub address: u64,
    /// Node type.
    pub node_type: u8,
    /// Level; 0 for leaves.
    pub level: u8,
    /// Left sibling, possibly undefined.
    pub left: u64,
    /// Right sibling, possibly undefined.
    pub right: u64,
    /// Child addresses.
    pub children: Vec<u64>,
    keys: Keys,
}

/// Size of a node of type `node_type` with K `k`.
pub fn node_size(sizes: Sizes, node_type: u8, k: u16, ndims: usize) -> usize {
    let key = match node_type {
        NODE_TYPE_GROUP => sizes.len_width(),
        _ => 8 + 8 * ndims,
    };
    let entries = 2 * usize::from(k);
    8 + 2 * sizes.addr_width() + (entries + 1) * key + entries * sizes.addr_width()
}

impl BTreeV1Node {
    /// Decode and check the node at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64, node_type: u8, ndims: usize) -> CheckResult<BTreeV1Node> {
        let sizes = ctx.sizes();
        let k = match node_type {
            NODE_TYPE_GROUP => ctx.state.group_internal_k,
            _ => ctx.state.istore_k,
        };
        let image = ctx.read(addr, node_size(sizes, node_type, k, ndims), Level::Structure, "B-tree v1 node")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::TREE) {
            return Err(CheckError::format(Level::Structure, "B-tree v1 node: incorrect signature", addr));
        }
        let found_type = d.u8()?;
        if found_type != node_type {
            return Err(Complaint::new(Level::Structure, "B-tree v1 node: unexpected node type")
                .at(addr)
                .value(u64::from(found_type))
                .into());
        }
        let level = d.u8()?;
        let entries = d.u16()?;
        if u32::from(entries) > 2 * u32::from(k) {
            return Err(Complaint::new(Level::Structure, "B-tree v1 node: entries exceed 2K")
                .at(addr)
                .value(u64::from(entries))
                .into());
        }
        let left = d.addr(sizes)?;
        let right = d.addr(sizes)?;
        for (what, sib) in [("left", left), ("right", right)] {
            ctx.require(is_undef(sib) || sib < ctx.state.eoa, || {
                Complaint::new(Level::Structure, format!("B-tree v1 node: invalid {what} sibling address"))
                    .at(addr)
                    .value(sib)
            });
        }

        let n = usize::from(entries);
        let mut children = Vec::with_capacity(n);
        let keys = if node_type == NODE_TYPE_GROUP {
            let mut keys = Vec::with_capacity(n + 1);
            for _ in 0..n {
                keys.push(d.length(sizes)?);
                children.push(d.addr(sizes)?);
            }
            keys.push(d.length(sizes)?);
            Keys::Group(keys)
        } else {
            let mut keys = Vec::with_capacity(n + 1);
            for _ in 0..n {
                keys.push(ChunkKey::decode(&mut d, ndims)?);
                children.push(d.addr(sizes)?);
            }
            keys.push(ChunkKey::decode(&mut d, ndims)?);
            Keys::Chunk(keys)
        };
        Ok(BTreeV1Node {
            address: addr,
            node_type,
            level,
            left,
            right,
            children,
            keys,
        })
    }

    /// Number of entries.
    pub fn entries(&self) -> usize {
        self.children.len()
    }
}

struct Walk<'h> {
    node_type: u8,
    ndims: usize,
    heap: Option<&'h LocalHeap>,
    seen: HashSet<u64>,
    symbol_nodes: Vec<u64>,
    chunks: Vec<ChunkEntry>,
}

impl Walk<'_> {
    fn visit(&mut self, ctx: &mut FileContext<'_>, addr: u64, expected_level: Option<u8>) -> CheckResult<()> {
        if !self.seen.insert(addr) {
            return Err(CheckError::format(Level::Structure, "B-tree v1: node reached twice", addr));
        }
        let node = BTreeV1Node::load(ctx, addr, self.node_type, self.ndims)?;
        if let Some(level) = expected_level {
            if node.level != level {
                return Err(Complaint::new(Level::Structure, "B-tree v1 node: unexpected level")
                    .at(addr)
                    .value(u64::from(node.level))
                    .into());
            }
        }
        self.check_key_order(ctx, &node);

        for (i, &child) in node.children.iter().enumerate() {
            if !ctx.state.addr_valid(child) {
                ctx.record(
                    Complaint::new(Level::Structure, "B-tree v1 node: invalid child address")
                        .at(addr)
                        .value(child),
                );
                continue;
            }
            if node.level > 0 {
                match self.visit(ctx, child, Some(node.level - 1)) {
                    Ok(()) => {}
                    Err(CheckError::Format(c)) => ctx.record(*c),
                    Err(e) => return Err(e),
                }
                continue;
            }
            match &node.keys {
                Keys::Group(_) => self.symbol_nodes.push(child),
                Keys::Chunk(keys) => {
                    let key = keys[i].clone();
                    ctx.require(ctx.state.extent_valid(child, u64::from(key.size)), || {
                        Complaint::new(Level::Structure, "B-tree v1: chunk extends beyond end of allocated space")
                            .at(addr)
                            .value(child)
                    });
                    self.chunks.push(ChunkEntry { key, addr: child });
                }
            }
        }
        Ok(())
    }

    fn check_key_order(&self, ctx: &mut FileContext<'_>, node: &BTreeV1Node) {
        let out_of_order = match &node.keys {
            Keys::Chunk(keys) => keys
                .windows(2)
                .take(node.entries())
                .any(|w| w[0].cmp_offsets(&w[1]) != Ordering::Less),
            Keys::Group(offsets) => {
                let Some(heap) = self.heap else {
                    return;
                };
                let mut names = Vec::with_capacity(offsets.len());
                for &off in offsets {
                    match heap.name_at(off) {
                        Ok(name) => names.push(name),
                        Err(CheckError::Format(c)) => {
                            ctx.record(*c);
                            return;
                        }
                        Err(_) => return,
                    }
                }
                // The first key of a node may be the empty name shared with
                // its left neighbour; order is strict from there on.
                names.windows(2).skip(1).any(|w| w[0] >= w[1])
                    || names.len() >= 2 && names[0] > names[1]
            }
        };
        ctx.require(!out_of_order, || {
            Complaint::new(Level::Structure, "B-tree v1 node: keys are not in increasing order").at(node.address)
        });
    }
}

/// Walk a group B-tree and return the symbol table node addresses in key
/// order. Keys are compared by the names they point to in `heap`.
pub fn walk_group(ctx: &mut FileContext<'_>, addr: u64, heap: &LocalHeap) -> CheckResult<Vec<u64>> {
    let mut walk = Walk {
        node_type: NODE_TYPE_GROUP,
        ndims: 0,
        heap: Some(heap),
        seen: HashSet::new(),
        symbol_nodes: Vec::new(),
        chunks: Vec::new(),
    };
    walk.visit(ctx, addr, None)?;
    tracing::debug!(addr, nodes = walk.seen.len(), snods = walk.symbol_nodes.len(), "walked group B-tree");
    Ok(walk.symbol_nodes)
}

/// Walk a chunk B-tree whose keys carry `ndims` offsets (dataset rank plus
/// the element dimension) and return its chunks.
pub fn walk_chunks(ctx: &mut FileContext<'_>, addr: u64, ndims: usize) -> CheckResult<Vec<ChunkEntry>> {
    let mut walk = Walk {
        node_type: NODE_TYPE_CHUNK,
        ndims,
        heap: None,
        seen: HashSet::new(),
        symbol_nodes: Vec::new(),
        chunks: Vec::new(),
    };
    walk.visit(ctx, addr, None)?;
    tracing::debug!(addr, nodes = walk.seen.len(), chunks = walk.chunks.len(), "walked chunk B-tree");
    Ok(walk.chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_state::FileState;
    use crate::options::CompatLevel;
    use crate::report::Report;
    use h5check_io::Driver;

    fn chunk_leaf(keys: &[(u32, [u64; 2])], children: &[u64], k: u16) -> Vec<u8> {
        let mut v = b"TREE".to_vec();
        v.push(NODE_TYPE_CHUNK);
        v.push(0);
        v.extend_from_slice(&(children.len() as u16).to_le_bytes());
        v.extend_from_slice(&u64::MAX.to_le_bytes());
        v.extend_from_slice(&u64::MAX.to_le_bytes());
        for (i, (size, offs)) in keys.iter().enumerate() {
            v.extend_from_slice(&size.to_le_bytes());
            v.extend_from_slice(&0u32.to_le_bytes());
            for o in offs {
                v.extend_from_slice(&o.to_le_bytes());
            }
            if let Some(c) = children.get(i) {
                v.extend_from_slice(&c.to_le_bytes());
            }
        }
        v.resize(node_size(Sizes::default(), NODE_TYPE_CHUNK, k, 2), 0);
        v
    }

    fn run(img: Vec<u8>) -> (CheckResult<Vec<ChunkEntry>>, Report) {
        run_with_k(img, 2)
    }

    fn run_with_k(img: Vec<u8>, k: u16) -> (CheckResult<Vec<ChunkEntry>>, Report) {
        let drv = Driver::memory("btree", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        st.istore_k = k;
        let mut report = Report::default();
        let res = {
            let mut ctx = FileContext {
                driver: &drv,
                state: &st,
                report: &mut report,
                compat: CompatLevel::V18,
            };
            walk_chunks(&mut ctx, 0, 2)
        };
        (res, report)
    }

    #[test]
    fn chunk_leaf_in_order() {
        let mut img = chunk_leaf(&[(16, [0, 0]), (16, [4, 0]), (0, [8, 0])], &[200, 216], 2);
        img.resize(300, 0);
        let (chunks, report) = run(img);
        let chunks = chunks.unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].addr, 216);
        assert_eq!(chunks[1].key.offsets, vec![4, 0]);
    }

    #[test]
    fn reversed_chunk_keys() {
        let mut img = chunk_leaf(&[(16, [4, 0]), (16, [0, 0]), (0, [8, 0])], &[200, 216], 2);
        img.resize(300, 0);
        let (chunks, report) = run(img);
        assert!(chunks.is_ok());
        assert!(report
            .complaints()
            .iter()
            .any(|c| c.description.contains("increasing order")));
    }

    #[test]
    fn chunk_past_eoa() {
        let mut img = chunk_leaf(&[(64, [0, 0]), (0, [4, 0])], &[260], 2);
        img.resize(300, 0);
        let (_, report) = run(img);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn too_many_entries_aborts() {
        let mut img = chunk_leaf(&[(16, [0, 0]), (0, [4, 0])], &[200], 2);
        img[6] = 5;
        img.resize(300, 0);
        let (res, _) = run(img);
        assert!(matches!(res, Err(CheckError::Format(_))));
    }

    #[test]
    fn capacity_of_large_k_is_not_truncated() {
        let k = 40_000;
        let img = chunk_leaf(&[(16, [0, 0]), (0, [4, 0])], &[200], k);
        let (chunks, report) = run_with_k(img, k);
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(chunks.unwrap().len(), 1);
    }

    #[test]
    fn key_ordering() {
        let a = ChunkKey {
            size: 1,
            filter_mask: 0,
            offsets: vec![0, 8, 0],
        };
        let b = ChunkKey {
            size: 1,
            filter_mask: 0,
            offsets: vec![4, 0, 0],
        };
        assert_eq!(a.cmp_offsets(&b), Ordering::Less);
    }
}
