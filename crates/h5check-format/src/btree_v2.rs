//! B-tree v2 (`BTHD`, `BTIN`, `BTLF`) validation, traversal and lookup.
//!
//! The header fixes the node and record sizes; from those the per-depth
//! node capacities and pointer widths are derived the same way the writer
//! derives them. A full walk checks every node and returns the records in
//! key order; [`BTreeV2::find`] descends by binary search.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::checksum::verify_trailing;
use crate::decode::{limit_enc_size, Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::signature::{magic, matches};

/// Signature, version, type and checksum.
const METADATA_PREFIX: usize = 10;
/// Largest depth accepted before the tree is considered corrupt.
const MAX_DEPTH: u16 = 64;

/// Record kind, from the header's type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// 1: huge objects, indirect, unfiltered.
    HugeIndirect,
    /// 2: huge objects, indirect, filtered.
    HugeFilteredIndirect,
    /// 3: huge objects, direct, unfiltered.
    HugeDirect,
    /// 4: huge objects, direct, filtered.
    HugeFilteredDirect,
    /// 5: links by name hash.
    LinkName,
    /// 6: links by creation order.
    LinkCreationOrder,
    /// 7: shared message index.
    SharedMessage,
    /// 8: attributes by name hash.
    AttributeName,
    /// 9: attributes by creation order.
    AttributeCreationOrder,
    /// 10: chunks, unfiltered.
    Chunk,
    /// 11: chunks, filtered.
    FilteredChunk,
}

impl RecordKind {
    /// Kind for a raw type; `None` outside 1–11.
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            1 => Self::HugeIndirect,
            2 => Self::HugeFilteredIndirect,
            3 => Self::HugeDirect,
            4 => Self::HugeFilteredDirect,
            5 => Self::LinkName,
            6 => Self::LinkCreationOrder,
            7 => Self::SharedMessage,
            8 => Self::AttributeName,
            9 => Self::AttributeCreationOrder,
            10 => Self::Chunk,
            11 => Self::FilteredChunk,
            _ => return None,
        })
    }

    /// Raw type.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::HugeIndirect => 1,
            Self::HugeFilteredIndirect => 2,
            Self::HugeDirect => 3,
            Self::HugeFilteredDirect => 4,
            Self::LinkName => 5,
            Self::LinkCreationOrder => 6,
            Self::SharedMessage => 7,
            Self::AttributeName => 8,
            Self::AttributeCreationOrder => 9,
            Self::Chunk => 10,
            Self::FilteredChunk => 11,
        }
    }
}

/// Shared message index entry, used by B-tree indexes and list indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SohmRecord {
    /// Message stored in the index's fractal heap.
    InHeap {
        /// Hash of the encoded message.
        hash: u32,
        /// Number of objects sharing it.
        refcount: u32,
        /// Fractal heap ID.
        heap_id: [u8; 8],
    },
    /// Message still stored in an object header.
    InHeader {
        /// Hash of the encoded message.
        hash: u32,
        /// Message type id.
        msg_type: u8,
        /// Index of the message within the header.
        index: u16,
        /// Header address.
        header_addr: u64,
    },
}

impl SohmRecord {
    /// Encoded size.
    pub fn size(sizes: Sizes) -> usize {
        1 + 4 + 12usize.max(4 + sizes.addr_width())
    }

    /// Decode one entry.
    pub fn decode(d: &mut Decoder<'_>, sizes: Sizes) -> CheckResult<Self> {
        let start = d.position();
        let location = d.u8()?;
        let hash = d.u32()?;
        let rec = match location {
            0 => {
                let refcount = d.u32()?;
                let mut heap_id = [0u8; 8];
                heap_id.copy_from_slice(d.bytes(8)?);
                SohmRecord::InHeap {
                    hash,
                    refcount,
                    heap_id,
                }
            }
            1 => {
                d.skip(1)?;
                let msg_type = d.u8()?;
                let index = d.u16()?;
                let header_addr = d.addr(sizes)?;
                SohmRecord::InHeader {
                    hash,
                    msg_type,
                    index,
                    header_addr,
                }
            }
            other => {
                return Err(Complaint::new(Level::Structure, "shared message record: invalid location")
                    .at(d.address())
                    .value(u64::from(other))
                    .into())
            }
        };
        d.seek(start + Self::size(sizes))?;
        Ok(rec)
    }

    /// Hash of the message.
    pub fn hash(&self) -> u32 {
        match self {
            SohmRecord::InHeap { hash, .. } | SohmRecord::InHeader { hash, .. } => *hash,
        }
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    HugeIndirect {
        addr: u64,
        len: u64,
        id: u64,
    },
    HugeFilteredIndirect {
        addr: u64,
        len: u64,
        filter_mask: u32,
        mem_size: u64,
        id: u64,
    },
    HugeDirect {
        addr: u64,
        len: u64,
    },
    HugeFilteredDirect {
        addr: u64,
        len: u64,
        filter_mask: u32,
        mem_size: u64,
    },
    LinkName {
        hash: u32,
        heap_id: Vec<u8>,
    },
    LinkCreationOrder {
        order: u64,
        heap_id: Vec<u8>,
    },
    SharedMessage(SohmRecord),
    AttributeName {
        heap_id: [u8; 8],
        flags: u8,
        order: u32,
        hash: u32,
    },
    AttributeCreationOrder {
        heap_id: [u8; 8],
        flags: u8,
        order: u32,
    },
    Chunk {
        addr: u64,
        offsets: Vec<u64>,
    },
    FilteredChunk {
        addr: u64,
        size: u64,
        filter_mask: u32,
        offsets: Vec<u64>,
    },
}

impl Record {
    /// Heap ID of records that point into a fractal heap.
    pub fn heap_id(&self) -> Option<&[u8]> {
        match self {
            Record::LinkName { heap_id, .. } | Record::LinkCreationOrder { heap_id, .. } => Some(heap_id),
            Record::AttributeName { heap_id, .. } | Record::AttributeCreationOrder { heap_id, .. } => Some(heap_id),
            Record::SharedMessage(SohmRecord::InHeap { heap_id, .. }) => Some(heap_id),
            _ => None,
        }
    }

    /// Key order. `Equal` on a hash tie of name-indexed kinds means the
    /// names must be compared.
    pub fn key_cmp(&self, other: &Record) -> Ordering {
        use Record::*;
        match (self, other) {
            (HugeIndirect { id: a, .. }, HugeIndirect { id: b, .. }) => a.cmp(b),
            (HugeFilteredIndirect { id: a, .. }, HugeFilteredIndirect { id: b, .. }) => a.cmp(b),
            (HugeDirect { addr: a, .. }, HugeDirect { addr: b, .. }) => a.cmp(b),
            (HugeFilteredDirect { addr: a, .. }, HugeFilteredDirect { addr: b, .. }) => a.cmp(b),
            (LinkName { hash: a, .. }, LinkName { hash: b, .. }) => a.cmp(b),
            (LinkCreationOrder { order: a, .. }, LinkCreationOrder { order: b, .. }) => a.cmp(b),
            (SharedMessage(a), SharedMessage(b)) => a.hash().cmp(&b.hash()),
            (AttributeName { hash: a, .. }, AttributeName { hash: b, .. }) => a.cmp(b),
            (AttributeCreationOrder { order: a, .. }, AttributeCreationOrder { order: b, .. }) => a.cmp(b),
            (Chunk { offsets: a, .. }, Chunk { offsets: b, .. }) => a.cmp(b),
            (FilteredChunk { offsets: a, .. }, FilteredChunk { offsets: b, .. }) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Record layout parameters that the header alone does not give.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordShape {
    /// Number of scaled chunk offsets in chunk records (the dataset rank).
    pub chunk_ndims: Option<usize>,
}

/// Breaks hash ties of name-indexed kinds by comparing the names.
pub type TieBreaker<'t> = dyn FnMut(&mut FileContext<'_>, &Record, &Record) -> CheckResult<Ordering> + 't;

/// Capacities of nodes at one depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Records per node.
    pub max_nrec: u64,
    /// Records in a full subtree rooted here.
    pub cum_max_nrec: u64,
    /// Bytes for a subtree record count.
    pub cum_max_nrec_size: usize,
}

/// A validated B-tree v2 header with derived sizes.
#[derive(Debug, Clone)]
pub struct BTreeV2 {
    /// Header address.
    pub address: u64,
    /// Record kind.
    pub kind: RecordKind,
    /// Node size.
    pub node_size: u32,
    /// Record size.
    pub record_size: u16,
    /// Depth; 0 when the root is a leaf.
    pub depth: u16,
    /// Split percent.
    pub split_percent: u8,
    /// Merge percent.
    pub merge_percent: u8,
    /// Root node address.
    pub root_addr: u64,
    /// Records in the root node.
    pub root_nrec: u16,
    /// Records in the whole tree.
    pub total_records: u64,
    /// Bytes for a child's record count.
    pub max_nrec_size: usize,
    /// Capacities per depth; index 0 is the leaf level.
    pub node_info: Vec<NodeInfo>,
    sizes: Sizes,
    shape: RecordShape,
}

impl BTreeV2 {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64, shape: RecordShape) -> CheckResult<BTreeV2> {
        let sizes = ctx.sizes();
        let len = 4 + 1 + 1 + 4 + 2 + 2 + 1 + 1 + sizes.addr_width() + 2 + sizes.len_width() + 4;
        let image = ctx.read(addr, len, Level::Structure, "B-tree v2 header")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::BTHD) {
            return Err(CheckError::format(Level::Structure, "B-tree v2 header: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "B-tree v2 header: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let raw_kind = d.u8()?;
        let kind = RecordKind::from_u8(raw_kind).ok_or_else(|| {
            CheckError::from(
                Complaint::new(Level::Structure, "B-tree v2 header: invalid record type")
                    .at(addr)
                    .value(u64::from(raw_kind)),
            )
        })?;
        let node_size = d.u32()?;
        let record_size = d.u16()?;
        let depth = d.u16()?;
        let split_percent = d.u8()?;
        let merge_percent = d.u8()?;
        let root_addr = d.addr(sizes)?;
        let root_nrec = d.u16()?;
        let total_records = d.length(sizes)?;
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "B-tree v2 header") {
            ctx.record(c);
        }

        if record_size == 0 || (node_size as usize) <= METADATA_PREFIX + usize::from(record_size) {
            return Err(Complaint::new(Level::Structure, "B-tree v2 header: node too small for one record")
                .at(addr)
                .value(u64::from(node_size))
                .into());
        }
        if depth > MAX_DEPTH {
            return Err(Complaint::new(Level::Structure, "B-tree v2 header: depth too large")
                .at(addr)
                .value(u64::from(depth))
                .into());
        }
        if !(1..=100).contains(&split_percent) || merge_percent >= split_percent {
            ctx.record(
                Complaint::new(Level::Structure, "B-tree v2 header: invalid split/merge percentages")
                    .at(addr)
                    .value(u64::from(split_percent)),
            );
        }
        let expected = expected_record_size(kind, sizes, shape);
        if let Some(expected) = expected {
            ctx.require(usize::from(record_size) == expected, || {
                Complaint::new(Level::Structure, "B-tree v2 header: record size does not match record type")
                    .at(addr)
                    .value(u64::from(record_size))
            });
        }
        if total_records > 0 {
            ctx.require(ctx.state.addr_valid(root_addr), || {
                Complaint::new(Level::Structure, "B-tree v2 header: invalid root node address")
                    .at(addr)
                    .value(root_addr)
            });
        }

        let (max_nrec_size, node_info) = derive_node_info(node_size, record_size, depth, sizes);
        Ok(BTreeV2 {
            address: addr,
            kind,
            node_size,
            record_size,
            depth,
            split_percent,
            merge_percent,
            root_addr,
            root_nrec,
            total_records,
            max_nrec_size,
            node_info,
            sizes,
            shape,
        })
    }

    fn pointer_size(&self, depth: u16) -> usize {
        let sub = if depth > 1 {
            self.node_info[usize::from(depth) - 1].cum_max_nrec_size
        } else {
            0
        };
        self.sizes.addr_width() + self.max_nrec_size + sub
    }

    /// Decode one record from `d`.
    pub fn decode_record(&self, d: &mut Decoder<'_>) -> CheckResult<Record> {
        let start = d.position();
        let rrec = usize::from(self.record_size);
        let sizes = self.sizes;
        let rec = match self.kind {
            RecordKind::HugeIndirect => Record::HugeIndirect {
                addr: d.addr(sizes)?,
                len: d.length(sizes)?,
                id: d.length(sizes)?,
            },
            RecordKind::HugeFilteredIndirect => Record::HugeFilteredIndirect {
                addr: d.addr(sizes)?,
                len: d.length(sizes)?,
                filter_mask: d.u32()?,
                mem_size: d.length(sizes)?,
                id: d.length(sizes)?,
            },
            RecordKind::HugeDirect => Record::HugeDirect {
                addr: d.addr(sizes)?,
                len: d.length(sizes)?,
            },
            RecordKind::HugeFilteredDirect => Record::HugeFilteredDirect {
                addr: d.addr(sizes)?,
                len: d.length(sizes)?,
                filter_mask: d.u32()?,
                mem_size: d.length(sizes)?,
            },
            RecordKind::LinkName => Record::LinkName {
                hash: d.u32()?,
                heap_id: d.bytes(rrec.saturating_sub(4))?.to_vec(),
            },
            RecordKind::LinkCreationOrder => Record::LinkCreationOrder {
                order: d.u64()?,
                heap_id: d.bytes(rrec.saturating_sub(8))?.to_vec(),
            },
            RecordKind::SharedMessage => Record::SharedMessage(SohmRecord::decode(d, sizes)?),
            RecordKind::AttributeName => {
                let mut heap_id = [0u8; 8];
                heap_id.copy_from_slice(d.bytes(8)?);
                Record::AttributeName {
                    heap_id,
                    flags: d.u8()?,
                    order: d.u32()?,
                    hash: d.u32()?,
                }
            }
            RecordKind::AttributeCreationOrder => {
                let mut heap_id = [0u8; 8];
                heap_id.copy_from_slice(d.bytes(8)?);
                Record::AttributeCreationOrder {
                    heap_id,
                    flags: d.u8()?,
                    order: d.u32()?,
                }
            }
            RecordKind::Chunk => {
                let addr = d.addr(sizes)?;
                let ndims = self
                    .shape
                    .chunk_ndims
                    .unwrap_or(rrec.saturating_sub(sizes.addr_width()) / 8);
                let mut offsets = Vec::with_capacity(ndims);
                for _ in 0..ndims {
                    offsets.push(d.u64()?);
                }
                Record::Chunk { addr, offsets }
            }
            RecordKind::FilteredChunk => {
                let addr = d.addr(sizes)?;
                let ndims = self.shape.chunk_ndims.unwrap_or(0);
                let size_len = rrec
                    .checked_sub(sizes.addr_width() + 4 + 8 * ndims)
                    .filter(|n| (1..=8).contains(n))
                    .ok_or_else(|| {
                        CheckError::format(
                            Level::Structure,
                            "B-tree v2: filtered chunk record size inconsistent with dataset rank",
                            d.address(),
                        )
                    })?;
                let size = d.uint(size_len)?;
                let filter_mask = d.u32()?;
                let mut offsets = Vec::with_capacity(ndims);
                for _ in 0..ndims {
                    offsets.push(d.u64()?);
                }
                Record::FilteredChunk {
                    addr,
                    size,
                    filter_mask,
                    offsets,
                }
            }
        };
        d.seek(start + rrec)?;
        Ok(rec)
    }

    fn load_node(
        &self,
        ctx: &mut FileContext<'_>,
        addr: u64,
        nrec: u16,
        depth: u16,
    ) -> CheckResult<(Vec<Record>, Vec<(u64, u64, u64)>)> {
        let (what, sig) = if depth == 0 {
            ("B-tree v2 leaf node", magic::BTLF)
        } else {
            ("B-tree v2 internal node", magic::BTIN)
        };
        let info = self.node_info[usize::from(depth)];
        if u64::from(nrec) > info.max_nrec {
            return Err(Complaint::new(Level::Structure, format!("{what}: too many records"))
                .at(addr)
                .value(u64::from(nrec))
                .into());
        }
        let image = ctx.read(addr, self.node_size as usize, Level::Structure, what)?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, sig) {
            return Err(CheckError::format(Level::Structure, format!("{what}: incorrect signature"), addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect version"))
                .at(addr)
                .value(u64::from(version))
        });
        let kind = d.u8()?;
        ctx.require(kind == self.kind.to_u8(), || {
            Complaint::new(Level::Structure, format!("{what}: record type differs from header"))
                .at(addr)
                .value(u64::from(kind))
        });
        let mut records = Vec::with_capacity(usize::from(nrec));
        for _ in 0..nrec {
            records.push(self.decode_record(&mut d)?);
        }
        let mut children = Vec::new();
        if depth > 0 {
            let sub_width = if depth > 1 {
                self.node_info[usize::from(depth) - 1].cum_max_nrec_size
            } else {
                0
            };
            for _ in 0..=nrec {
                let child = d.addr(self.sizes)?;
                let child_nrec = d.uint(self.max_nrec_size)?;
                let child_total = if sub_width > 0 { d.uint(sub_width)? } else { child_nrec };
                children.push((child, child_nrec, child_total));
            }
        }
        let end = d.position() + 4;
        if let Some(c) = verify_trailing(&image[..end], addr, Level::Structure, what) {
            ctx.record(c);
        }
        Ok((records, children))
    }

    /// Validate every node and return all records in key order.
    pub fn walk(&self, ctx: &mut FileContext<'_>, tie: Option<&mut TieBreaker<'_>>) -> CheckResult<Vec<Record>> {
        let mut out = Vec::new();
        if self.total_records == 0 {
            ctx.require(self.root_nrec == 0, || {
                Complaint::new(Level::Structure, "B-tree v2 header: records in root of an empty tree")
                    .at(self.address)
                    .value(u64::from(self.root_nrec))
            });
            return Ok(out);
        }
        let mut walker = Walker {
            tree: self,
            tie,
            seen: HashSet::new(),
        };
        let found = walker.visit(ctx, self.root_addr, u64::from(self.root_nrec), self.depth, None, None, &mut out)?;
        ctx.require(found == self.total_records, || {
            Complaint::new(
                Level::Structure,
                format!("B-tree v2: {found} records found, header declares {}", self.total_records),
            )
            .at(self.address)
            .value(self.total_records)
        });
        tracing::debug!(addr = self.address, kind = ?self.kind, records = out.len(), "walked B-tree v2");
        Ok(out)
    }

    /// Find the record `cmp` reports as equal; `cmp` orders the sought key
    /// against a record.
    pub fn find(
        &self,
        ctx: &mut FileContext<'_>,
        mut cmp: impl FnMut(&Record) -> Ordering,
    ) -> CheckResult<Option<Record>> {
        if self.total_records == 0 {
            return Ok(None);
        }
        let mut addr = self.root_addr;
        let mut nrec = self.root_nrec;
        let mut depth = self.depth;
        loop {
            let (records, children) = self.load_node(ctx, addr, nrec, depth)?;
            let idx = records.binary_search_by(|r| cmp(r).reverse());
            match idx {
                Ok(i) => return Ok(records.into_iter().nth(i)),
                Err(i) if depth > 0 => {
                    let (child, child_nrec, _) = children[i];
                    addr = child;
                    nrec = u16::try_from(child_nrec).map_err(|_| {
                        CheckError::format(Level::Structure, "B-tree v2: child record count too large", child)
                    })?;
                    depth -= 1;
                }
                Err(_) => return Ok(None),
            }
        }
    }
}

struct Walker<'a, 'w, 't> {
    tree: &'a BTreeV2,
    tie: Option<&'w mut TieBreaker<'t>>,
    seen: HashSet<u64>,
}

impl Walker<'_, '_, '_> {
    fn ordered(&mut self, ctx: &mut FileContext<'_>, a: &Record, b: &Record) -> CheckResult<bool> {
        match a.key_cmp(b) {
            Ordering::Less => Ok(true),
            Ordering::Greater => Ok(false),
            Ordering::Equal => match (&mut self.tie, self.tree.kind) {
                // Shared message hashes may collide without further order.
                (_, RecordKind::SharedMessage) => Ok(true),
                (Some(tie), RecordKind::LinkName | RecordKind::AttributeName) => {
                    Ok((**tie)(ctx, a, b)? == Ordering::Less)
                }
                (None, RecordKind::LinkName | RecordKind::AttributeName) => Ok(true),
                _ => Ok(false),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        ctx: &mut FileContext<'_>,
        addr: u64,
        nrec: u64,
        depth: u16,
        lower: Option<&Record>,
        upper: Option<&Record>,
        out: &mut Vec<Record>,
    ) -> CheckResult<u64> {
        if !self.seen.insert(addr) {
            return Err(CheckError::format(Level::Structure, "B-tree v2: node reached twice", addr));
        }
        let nrec = u16::try_from(nrec)
            .map_err(|_| CheckError::format(Level::Structure, "B-tree v2: record count too large", addr))?;
        let (records, children) = self.tree.load_node(ctx, addr, nrec, depth)?;

        let mut in_order = true;
        for pair in records.windows(2) {
            in_order &= self.ordered(ctx, &pair[0], &pair[1])?;
        }
        if let (Some(lo), Some(first)) = (lower, records.first()) {
            in_order &= self.ordered(ctx, lo, first)?;
        }
        if let (Some(hi), Some(last)) = (upper, records.last()) {
            in_order &= self.ordered(ctx, last, hi)?;
        }
        ctx.require(in_order, || {
            Complaint::new(Level::Structure, "B-tree v2 node: records are not in increasing order").at(addr)
        });

        let mut count = u64::from(nrec);
        if depth == 0 {
            out.extend(records);
            return Ok(count);
        }
        for (i, &(child, child_nrec, child_total)) in children.iter().enumerate() {
            let lo = if i == 0 { lower } else { records.get(i - 1) };
            let hi = records.get(i).or(upper);
            if !ctx.state.addr_valid(child) {
                ctx.record(
                    Complaint::new(Level::Structure, "B-tree v2 internal node: invalid child address")
                        .at(addr)
                        .value(child),
                );
                count += child_total;
            } else {
                match self.visit(ctx, child, child_nrec, depth - 1, lo, hi, out) {
                    Ok(found) => {
                        ctx.require(found == child_total, || {
                            Complaint::new(
                                Level::Structure,
                                "B-tree v2 internal node: child record total does not match",
                            )
                            .at(addr)
                            .value(child_total)
                        });
                        count += found;
                    }
                    Err(CheckError::Format(c)) => {
                        ctx.record(*c);
                        count += child_total;
                    }
                    Err(e) => return Err(e),
                }
            }
            if let Some(r) = records.get(i) {
                out.push(r.clone());
            }
        }
        Ok(count)
    }
}

/// Record size implied by the kind, when it does not depend on the heap.
fn expected_record_size(kind: RecordKind, sizes: Sizes, shape: RecordShape) -> Option<usize> {
    let a = sizes.addr_width();
    let l = sizes.len_width();
    Some(match kind {
        RecordKind::HugeIndirect => a + 2 * l,
        RecordKind::HugeFilteredIndirect => a + 3 * l + 4,
        RecordKind::HugeDirect => a + l,
        RecordKind::HugeFilteredDirect => a + 2 * l + 4,
        RecordKind::SharedMessage => SohmRecord::size(sizes),
        RecordKind::AttributeName => 17,
        RecordKind::AttributeCreationOrder => 13,
        RecordKind::Chunk => a + 8 * shape.chunk_ndims?,
        RecordKind::LinkName | RecordKind::LinkCreationOrder | RecordKind::FilteredChunk => return None,
    })
}

/// Per-depth capacities: leaf capacity, pointer widths and subtree totals.
pub fn derive_node_info(node_size: u32, record_size: u16, depth: u16, sizes: Sizes) -> (usize, Vec<NodeInfo>) {
    let node_size = u64::from(node_size);
    let rrec = u64::from(record_size).max(1);
    let leaf_max = node_size.saturating_sub(METADATA_PREFIX as u64) / rrec;
    let max_nrec_size = limit_enc_size(leaf_max);
    let mut info = vec![NodeInfo {
        max_nrec: leaf_max,
        cum_max_nrec: leaf_max,
        cum_max_nrec_size: 0,
    }];
    for d in 1..=usize::from(depth) {
        let sub = if d > 1 { info[d - 1].cum_max_nrec_size } else { 0 };
        let ptr = (sizes.addr_width() + max_nrec_size + sub) as u64;
        let max_nrec = node_size.saturating_sub(METADATA_PREFIX as u64 + ptr) / (rrec + ptr);
        let cum = (max_nrec + 1)
            .saturating_mul(info[d - 1].cum_max_nrec)
            .saturating_add(max_nrec);
        info.push(NodeInfo {
            max_nrec,
            cum_max_nrec: cum,
            cum_max_nrec_size: limit_enc_size(cum),
        });
    }
    (max_nrec_size, info)
}
