//! Fractal heap (`FRHP`, `FHDB`, `FHIB`): dense link and attribute storage
//! and the message store of shared message indexes.
//!
//! Managed objects live in direct blocks addressed through a doubling
//! table: row 0 and row 1 hold blocks of the starting size, each later row
//! doubles it, and rows past the largest direct block size point at child
//! indirect blocks. Huge objects are stored outside the heap and tracked by
//! a B-tree v2; tiny objects live inside their heap ID.

use std::collections::HashSet;

use crate::btree_v2::{BTreeV2, Record, RecordKind, RecordShape};
use crate::checksum::{lookup3, verify_trailing};
use crate::decode::{decode_uint, limit_enc_size, log2_gen, log2_of2, Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::filters;
use crate::free_space::{self, FreeSpaceOwner};
use crate::messages::{FilterPipeline, MessageContext};
use crate::report::Report;
use crate::signature::{magic, matches};

/// Huge object IDs are wrapped around when they run out.
pub const FLAG_HUGE_ID_WRAPPED: u8 = 0x01;
/// Direct blocks carry a checksum.
pub const FLAG_DIRECT_CHECKSUM: u8 = 0x02;

const ID_VERSION_MASK: u8 = 0xc0;
const ID_TYPE_MASK: u8 = 0x30;
const ID_TYPE_MANAGED: u8 = 0x00;
const ID_TYPE_HUGE: u8 = 0x10;
const ID_TYPE_TINY: u8 = 0x20;
const TINY_LEN_SHORT: usize = 16;
const TINY_MASK_SHORT: u8 = 0x0f;

/// The doubling table and the widths derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoublingTable {
    /// Blocks per row.
    pub width: u16,
    /// Size of blocks in rows 0 and 1.
    pub start_block_size: u64,
    /// Largest direct block size.
    pub max_direct_size: u64,
    /// Bits in a heap offset.
    pub max_index: u16,
    /// Rows in a newly created root indirect block.
    pub start_root_rows: u16,
    /// Root block address.
    pub root_addr: u64,
    /// Rows in the root indirect block; 0 when the root is a direct block.
    pub cur_root_rows: u16,
    /// log2 of the starting block size.
    pub start_bits: u32,
    /// Bits addressed by the first row.
    pub first_row_bits: u32,
    /// Rows the root indirect block can have.
    pub max_root_rows: u32,
    /// log2 of the largest direct block size.
    pub max_direct_bits: u32,
    /// Rows that hold direct blocks.
    pub max_direct_rows: u32,
    /// Heap space covered by the first row.
    pub num_id_first_row: u64,
    /// Bytes needed for an offset inside the largest direct block.
    pub max_dir_blk_off_size: usize,
    /// Block size of each row.
    pub row_block_size: Vec<u64>,
    /// Heap offset at which each row starts.
    pub row_block_off: Vec<u64>,
}

impl DoublingTable {
    fn derive(
        width: u16,
        start_block_size: u64,
        max_direct_size: u64,
        max_index: u16,
        start_root_rows: u16,
        root_addr: u64,
        cur_root_rows: u16,
    ) -> Self {
        let start_bits = log2_of2(start_block_size);
        let first_row_bits = start_bits + log2_of2(u64::from(width));
        let max_root_rows = u32::from(max_index).saturating_sub(first_row_bits) + 1;
        let max_direct_bits = log2_of2(max_direct_size);
        let max_direct_rows = max_direct_bits.saturating_sub(start_bits) + 2;
        let num_id_first_row = start_block_size.saturating_mul(u64::from(width));
        let rows = max_root_rows.max(max_direct_rows) as usize;
        let mut row_block_size = Vec::with_capacity(rows);
        let mut row_block_off = Vec::with_capacity(rows);
        let mut size = start_block_size;
        let mut off = 0u64;
        for row in 0..rows {
            row_block_size.push(size);
            row_block_off.push(off);
            off = off.saturating_add(size.saturating_mul(u64::from(width)));
            if row > 0 {
                size = size.saturating_mul(2);
            }
        }
        Self {
            width,
            start_block_size,
            max_direct_size,
            max_index,
            start_root_rows,
            root_addr,
            cur_root_rows,
            start_bits,
            first_row_bits,
            max_root_rows,
            max_direct_bits,
            max_direct_rows,
            num_id_first_row,
            max_dir_blk_off_size: limit_enc_size(max_direct_size),
            row_block_size,
            row_block_off,
        }
    }

    /// Row and column of the block holding heap offset `off`, relative to
    /// the start of an indirect block.
    pub fn lookup(&self, off: u64) -> (usize, u64) {
        if off < self.num_id_first_row {
            return (0, off / self.start_block_size.max(1));
        }
        let high_bit = log2_gen(off);
        let row = (high_bit + 1).saturating_sub(self.first_row_bits) as usize;
        let row = row.min(self.row_block_size.len().saturating_sub(1));
        let col = (off - (1u64 << high_bit)) / self.row_block_size[row].max(1);
        (row, col)
    }

    /// Rows of an indirect block whose blocks have size `block_size`.
    pub fn size_to_rows(&self, block_size: u64) -> u32 {
        (log2_of2(block_size) + 1).saturating_sub(self.first_row_bits)
    }
}

/// Filter information for heaps with an I/O pipeline.
#[derive(Debug, Clone)]
pub struct HeapFilter {
    /// On-disk size of a filtered root direct block.
    pub root_size: u64,
    /// Filter mask of the root direct block.
    pub root_mask: u32,
    /// The pipeline.
    pub pipeline: FilterPipeline,
}

/// A decoded fractal heap header.
#[derive(Debug, Clone)]
pub struct FractalHeap {
    /// Header address.
    pub address: u64,
    /// Heap ID length.
    pub id_len: u16,
    /// Flags.
    pub flags: u8,
    /// Largest managed object.
    pub max_managed_size: u32,
    /// Next huge object ID.
    pub next_huge_id: u64,
    /// B-tree v2 tracking huge objects.
    pub huge_btree_addr: u64,
    /// Free space in managed blocks.
    pub managed_free: u64,
    /// Free-space manager of managed blocks.
    pub free_space_addr: u64,
    /// Managed space in the heap.
    pub managed_space: u64,
    /// Allocated managed space.
    pub managed_alloc: u64,
    /// Direct block allocation iterator offset.
    pub iter_offset: u64,
    /// Managed objects.
    pub managed_objects: u64,
    /// Size of huge objects.
    pub huge_size: u64,
    /// Huge objects.
    pub huge_objects: u64,
    /// Size of tiny objects.
    pub tiny_size: u64,
    /// Tiny objects.
    pub tiny_objects: u64,
    /// Doubling table.
    pub dtable: DoublingTable,
    /// Filter information.
    pub filter: Option<HeapFilter>,
    /// Bytes of a heap offset in a managed ID.
    pub heap_off_size: usize,
    /// Bytes of a length in a managed ID.
    pub heap_len_size: usize,
    /// Huge objects are addressed directly by their IDs.
    pub huge_ids_direct: bool,
    /// Bytes of a huge ID.
    pub huge_id_size: usize,
    /// Largest tiny object.
    pub tiny_max_len: usize,
    /// Tiny IDs use two length bytes.
    pub tiny_len_extended: bool,
    sizes: Sizes,
}

/// Where a managed object's direct block is, found by descending the table.
#[derive(Debug, Clone, Copy)]
struct BlockRef {
    addr: u64,
    block_off: u64,
    size: u64,
    filtered: Option<(u64, u32)>,
}

/// A child slot of an indirect block.
#[derive(Debug, Clone, Copy)]
struct ChildEntry {
    addr: u64,
    filtered: Option<(u64, u32)>,
}

impl FractalHeap {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<FractalHeap> {
        let sizes = ctx.sizes();
        let (o, l) = (sizes.addr_width(), sizes.len_width());
        let base_len = 22 + 12 * l + 3 * o;
        let head = ctx.read(addr, 9, Level::Structure, "fractal heap header")?;
        let mut d = Decoder::new(&head, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FRHP) {
            return Err(CheckError::format(Level::Structure, "fractal heap header: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "fractal heap header: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let _id_len = d.u16()?;
        let filter_len = usize::from(d.u16()?);
        let extra = if filter_len > 0 { l + 4 + filter_len } else { 0 };
        let image = ctx.read(addr, base_len + extra + 4, Level::Structure, "fractal heap header")?;

        let mut d = Decoder::new(&image, addr, Level::Structure);
        d.seek(5)?;
        let id_len = d.u16()?;
        d.skip(2)?;
        let flags = d.u8()?;
        let max_managed_size = d.u32()?;
        let next_huge_id = d.length(sizes)?;
        let huge_btree_addr = d.addr(sizes)?;
        let managed_free = d.length(sizes)?;
        let free_space_addr = d.addr(sizes)?;
        let managed_space = d.length(sizes)?;
        let managed_alloc = d.length(sizes)?;
        let iter_offset = d.length(sizes)?;
        let managed_objects = d.length(sizes)?;
        let huge_size = d.length(sizes)?;
        let huge_objects = d.length(sizes)?;
        let tiny_size = d.length(sizes)?;
        let tiny_objects = d.length(sizes)?;
        let width = d.u16()?;
        let start_block_size = d.length(sizes)?;
        let max_direct_size = d.length(sizes)?;
        let max_index = d.u16()?;
        let start_root_rows = d.u16()?;
        let root_addr = d.addr(sizes)?;
        let cur_root_rows = d.u16()?;
        let filter = if filter_len > 0 {
            let root_size = d.length(sizes)?;
            let root_mask = d.u32()?;
            let raw = d.bytes(filter_len)?;
            let mut mctx = MessageContext::new(sizes, ctx.compat, d.address());
            let pipeline = FilterPipeline::decode(raw, &mut mctx);
            for c in mctx.complaints {
                ctx.record(Complaint { level: Level::Structure, ..c });
            }
            Some(HeapFilter {
                root_size,
                root_mask,
                pipeline: pipeline?,
            })
        } else {
            None
        };
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "fractal heap header") {
            ctx.record(c);
        }

        // Geometry that later offset arithmetic depends on.
        let geometry_ok = width > 0
            && width.is_power_of_two()
            && start_block_size > 0
            && start_block_size.is_power_of_two()
            && max_direct_size.is_power_of_two()
            && max_direct_size >= start_block_size
            && max_index > 0
            && max_index <= 64;
        if !geometry_ok {
            return Err(Complaint::new(Level::Structure, "fractal heap header: invalid doubling table parameters")
                .at(addr)
                .value(u64::from(width))
                .into());
        }
        let dtable = DoublingTable::derive(
            width,
            start_block_size,
            max_direct_size,
            max_index,
            start_root_rows,
            root_addr,
            cur_root_rows,
        );
        if u32::from(cur_root_rows) > dtable.max_root_rows {
            return Err(Complaint::new(Level::Structure, "fractal heap header: too many rows in the root indirect block")
                .at(addr)
                .value(u64::from(cur_root_rows))
                .into());
        }
        if u64::from(dtable.first_row_bits) > u64::from(max_index) {
            return Err(Complaint::new(Level::Structure, "fractal heap header: first row exceeds the heap size")
                .at(addr)
                .value(u64::from(max_index))
                .into());
        }

        let heap_off_size = usize::from(max_index).div_ceil(8);
        let heap_len_size = dtable
            .max_dir_blk_off_size
            .min(limit_enc_size(u64::from(max_managed_size)));
        let id_payload = usize::from(id_len).saturating_sub(1);
        let (huge_ids_direct, huge_id_size) = if filter.is_some() {
            let direct = o + 2 * l + 4;
            if id_payload >= direct {
                (true, direct)
            } else {
                (false, id_payload.min(8))
            }
        } else if id_payload >= o + l {
            (true, o + l)
        } else {
            (false, id_payload.min(8))
        };
        let (tiny_max_len, tiny_len_extended) = if id_payload <= TINY_LEN_SHORT {
            (id_payload, false)
        } else if id_payload == TINY_LEN_SHORT + 1 {
            (id_payload - 1, false)
        } else {
            (id_payload - 1, true)
        };

        let heap = FractalHeap {
            address: addr,
            id_len,
            flags,
            max_managed_size,
            next_huge_id,
            huge_btree_addr,
            managed_free,
            free_space_addr,
            managed_space,
            managed_alloc,
            iter_offset,
            managed_objects,
            huge_size,
            huge_objects,
            tiny_size,
            tiny_objects,
            dtable,
            filter,
            heap_off_size,
            heap_len_size,
            huge_ids_direct,
            huge_id_size,
            tiny_max_len,
            tiny_len_extended,
            sizes,
        };
        heap.check_header(ctx);
        Ok(heap)
    }

    fn check_header(&self, ctx: &mut FileContext<'_>) {
        let addr = self.address;
        ctx.require(self.flags & !(FLAG_HUGE_ID_WRAPPED | FLAG_DIRECT_CHECKSUM) == 0, || {
            Complaint::new(Level::Structure, "fractal heap header: reserved flags set")
                .at(addr)
                .value(u64::from(self.flags))
        });
        ctx.require(u64::from(self.max_managed_size) <= self.dtable.max_direct_size, || {
            Complaint::new(Level::Structure, "fractal heap header: managed objects larger than a direct block")
                .at(addr)
                .value(u64::from(self.max_managed_size))
        });
        ctx.require(usize::from(self.id_len) > self.heap_off_size + self.heap_len_size, || {
            Complaint::new(Level::Structure, "fractal heap header: heap ID too short for managed objects")
                .at(addr)
                .value(u64::from(self.id_len))
        });
        ctx.require(self.managed_alloc <= self.managed_space, || {
            Complaint::new(Level::Structure, "fractal heap header: allocated managed space exceeds managed space")
                .at(addr)
                .value(self.managed_alloc)
        });
        for (what, a, used) in [
            ("root block", self.dtable.root_addr, self.managed_objects > 0),
            ("huge object B-tree", self.huge_btree_addr, self.huge_objects > 0),
        ] {
            if used {
                ctx.require(ctx.state.addr_valid(a), || {
                    Complaint::new(Level::Structure, format!("fractal heap header: invalid {what} address"))
                        .at(addr)
                        .value(a)
                });
            }
        }
    }

    /// Fixed part of a direct block.
    fn direct_header_size(&self) -> usize {
        let sum = if self.flags & FLAG_DIRECT_CHECKSUM != 0 { 4 } else { 0 };
        5 + self.sizes.addr_width() + self.heap_off_size + sum
    }

    fn indirect_size(&self, nrows: usize) -> usize {
        let width = usize::from(self.dtable.width);
        let direct_rows = nrows.min(self.dtable.max_direct_rows as usize);
        let direct_entry = self.sizes.addr_width()
            + if self.filter.is_some() {
                self.sizes.len_width() + 4
            } else {
                0
            };
        5 + self.sizes.addr_width()
            + self.heap_off_size
            + direct_rows * width * direct_entry
            + (nrows - direct_rows) * width * self.sizes.addr_width()
            + 4
    }

    /// Read, unfilter and check one direct block; returns its image.
    fn load_direct(&self, ctx: &mut FileContext<'_>, block: BlockRef) -> CheckResult<Vec<u8>> {
        let what = "fractal heap direct block";
        let addr = block.addr;
        let size = usize::try_from(block.size)
            .map_err(|_| CheckError::format(Level::Structure, format!("{what}: size too large"), addr))?;
        let image = match (&self.filter, block.filtered) {
            (Some(f), Some((stored, mask))) => {
                let stored = usize::try_from(stored)
                    .map_err(|_| CheckError::format(Level::Structure, format!("{what}: size too large"), addr))?;
                let raw = ctx.read(addr, stored, Level::Structure, what)?;
                let out = filters::reverse(&f.pipeline, mask, &raw, 1, addr)?;
                if out.len() != size {
                    return Err(Complaint::new(Level::Structure, format!("{what}: unfiltered size differs from block size"))
                        .at(addr)
                        .value(out.len() as u64)
                        .into());
                }
                out
            }
            _ => ctx.read(addr, size, Level::Structure, what)?,
        };
        if image.len() < self.direct_header_size() {
            return Err(CheckError::format(Level::Structure, format!("{what}: block smaller than its header"), addr));
        }
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FHDB) {
            return Err(CheckError::format(Level::Structure, format!("{what}: incorrect signature"), addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect version"))
                .at(addr)
                .value(u64::from(version))
        });
        let owner = d.addr(self.sizes)?;
        ctx.require(owner == self.address, || {
            Complaint::new(Level::Structure, format!("{what}: heap header address does not match"))
                .at(addr)
                .value(owner)
        });
        let block_off = d.uint(self.heap_off_size)?;
        ctx.require(block_off == block.block_off, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect block offset"))
                .at(addr)
                .value(block_off)
        });
        if self.flags & FLAG_DIRECT_CHECKSUM != 0 {
            let at = d.position();
            let stored = d.u32()?;
            let mut copy = image.clone();
            copy[at..at + 4].fill(0);
            let computed = lookup3(&copy);
            ctx.require(stored == computed, || {
                Complaint::new(
                    Level::Structure,
                    format!("{what}: incorrect metadata checksum (computed {computed:#010x})"),
                )
                .at(addr)
                .value(u64::from(stored))
            });
        }
        Ok(image)
    }

    /// Read and check one indirect block; returns its child slots.
    fn load_indirect(
        &self,
        ctx: &mut FileContext<'_>,
        addr: u64,
        block_off: u64,
        nrows: usize,
    ) -> CheckResult<Vec<ChildEntry>> {
        let what = "fractal heap indirect block";
        let image = ctx.read(addr, self.indirect_size(nrows), Level::Structure, what)?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FHIB) {
            return Err(CheckError::format(Level::Structure, format!("{what}: incorrect signature"), addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect version"))
                .at(addr)
                .value(u64::from(version))
        });
        let owner = d.addr(self.sizes)?;
        ctx.require(owner == self.address, || {
            Complaint::new(Level::Structure, format!("{what}: heap header address does not match"))
                .at(addr)
                .value(owner)
        });
        let found_off = d.uint(self.heap_off_size)?;
        ctx.require(found_off == block_off, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect block offset"))
                .at(addr)
                .value(found_off)
        });
        let mut entries = Vec::with_capacity(nrows * usize::from(self.dtable.width));
        for row in 0..nrows {
            let direct = (row as u32) < self.dtable.max_direct_rows;
            for _ in 0..self.dtable.width {
                let child = d.addr(self.sizes)?;
                let filtered = if direct && self.filter.is_some() {
                    Some((d.length(self.sizes)?, d.u32()?))
                } else {
                    None
                };
                entries.push(ChildEntry { addr: child, filtered });
            }
        }
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, what) {
            ctx.record(c);
        }
        Ok(entries)
    }

    /// Validate the header's structures: every managed block, the huge
    /// object B-tree and the managed-space free-space manager.
    pub fn validate(&self, ctx: &mut FileContext<'_>) -> CheckResult<()> {
        let mut walk = BlockWalk {
            heap: self,
            seen: HashSet::new(),
            direct_blocks: 0,
        };
        let root = self.dtable.root_addr;
        if ctx.state.addr_valid(root) {
            let result = if self.dtable.cur_root_rows == 0 {
                let filtered = self.filter.as_ref().map(|f| (f.root_size, f.root_mask));
                self.load_direct(
                    ctx,
                    BlockRef {
                        addr: root,
                        block_off: 0,
                        size: self.dtable.start_block_size,
                        filtered,
                    },
                )
                .map(|_| walk.direct_blocks += 1)
            } else {
                walk.indirect(ctx, root, 0, usize::from(self.dtable.cur_root_rows))
            };
            if let Err(e) = result {
                record_or_raise(ctx, e)?;
            }
        }
        tracing::debug!(addr = self.address, direct = walk.direct_blocks, "walked fractal heap blocks");

        if ctx.state.addr_valid(self.huge_btree_addr) {
            if let Err(e) = self.validate_huge(ctx) {
                record_or_raise(ctx, e)?;
            }
        }
        if ctx.state.addr_valid(self.free_space_addr) {
            let owner = FreeSpaceOwner::FractalHeap {
                heap_addr: self.address,
                managed_space: self.managed_space,
                heap_off_size: self.heap_off_size,
            };
            if let Err(e) = free_space::validate(ctx, self.free_space_addr, owner) {
                record_or_raise(ctx, e)?;
            }
        }
        ctx.report.flush();
        Ok(())
    }

    fn huge_kind(&self) -> RecordKind {
        match (self.huge_ids_direct, self.filter.is_some()) {
            (false, false) => RecordKind::HugeIndirect,
            (false, true) => RecordKind::HugeFilteredIndirect,
            (true, false) => RecordKind::HugeDirect,
            (true, true) => RecordKind::HugeFilteredDirect,
        }
    }

    fn validate_huge(&self, ctx: &mut FileContext<'_>) -> CheckResult<()> {
        let tree = BTreeV2::load(ctx, self.huge_btree_addr, RecordShape::default())?;
        ctx.require(tree.kind == self.huge_kind(), || {
            Complaint::new(Level::Structure, "fractal heap: huge object B-tree has the wrong record type")
                .at(self.huge_btree_addr)
                .value(u64::from(tree.kind.to_u8()))
        });
        let records = tree.walk(ctx, None)?;
        ctx.require(records.len() as u64 == self.huge_objects, || {
            Complaint::new(Level::Structure, "fractal heap: huge object count does not match its B-tree")
                .at(self.address)
                .value(self.huge_objects)
        });
        for r in &records {
            let (addr, len) = match *r {
                Record::HugeIndirect { addr, len, .. }
                | Record::HugeFilteredIndirect { addr, len, .. }
                | Record::HugeDirect { addr, len }
                | Record::HugeFilteredDirect { addr, len, .. } => (addr, len),
                _ => continue,
            };
            ctx.require(ctx.state.extent_valid(addr, len), || {
                Complaint::new(Level::Structure, "fractal heap: huge object extends beyond the end of allocated space")
                    .at(self.huge_btree_addr)
                    .value(addr)
            });
        }
        Ok(())
    }

    /// Fetch the object named by `id`.
    ///
    /// Blocks read here were already checked by [`FractalHeap::validate`],
    /// so their complaints are not recorded a second time.
    pub fn read_object(&self, ctx: &mut FileContext<'_>, id: &[u8]) -> CheckResult<Vec<u8>> {
        let at = self.address;
        let first = *id
            .first()
            .ok_or_else(|| CheckError::format(Level::Structure, "fractal heap ID: empty", at))?;
        if first & ID_VERSION_MASK != 0 {
            return Err(Complaint::new(Level::Structure, "fractal heap ID: incorrect version")
                .at(at)
                .value(u64::from(first >> 6))
                .into());
        }
        let mut scratch = Report::new(0, true);
        let mut quiet = FileContext {
            driver: ctx.driver,
            state: ctx.state,
            report: &mut scratch,
            compat: ctx.compat,
        };
        match first & ID_TYPE_MASK {
            ID_TYPE_MANAGED => self.read_managed(&mut quiet, id),
            ID_TYPE_HUGE => self.read_huge(&mut quiet, id),
            ID_TYPE_TINY => self.read_tiny(id).map(<[u8]>::to_vec),
            other => Err(Complaint::new(Level::Structure, "fractal heap ID: invalid type")
                .at(at)
                .value(u64::from(other >> 4))
                .into()),
        }
    }

    /// Payload of a tiny ID.
    pub fn read_tiny<'i>(&self, id: &'i [u8]) -> CheckResult<&'i [u8]> {
        let at = self.address;
        let first = *id
            .first()
            .ok_or_else(|| CheckError::format(Level::Structure, "fractal heap tiny ID: empty ID", at))?;
        let (len, start) = if self.tiny_len_extended {
            let hi = usize::from(first & TINY_MASK_SHORT);
            let lo = usize::from(*id.get(1).ok_or_else(|| {
                CheckError::format(Level::Structure, "fractal heap tiny ID: missing extended length", at)
            })?);
            ((hi << 8 | lo) + 1, 2)
        } else {
            (usize::from(first & TINY_MASK_SHORT) + 1, 1)
        };
        if len > self.tiny_max_len || start + len > id.len() {
            return Err(Complaint::new(Level::Structure, "fractal heap tiny ID: length exceeds the ID")
                .at(at)
                .value(len as u64)
                .into());
        }
        Ok(&id[start..start + len])
    }

    fn read_managed(&self, ctx: &mut FileContext<'_>, id: &[u8]) -> CheckResult<Vec<u8>> {
        let at = self.address;
        let need = 1 + self.heap_off_size + self.heap_len_size;
        if id.len() < need {
            return Err(CheckError::format(Level::Structure, "fractal heap managed ID: too short", at));
        }
        let off = decode_uint(&id[1..1 + self.heap_off_size]).unwrap_or(u64::MAX);
        let len = decode_uint(&id[1 + self.heap_off_size..need]).unwrap_or(u64::MAX);
        if len == 0 || len > u64::from(self.max_managed_size) || off.checked_add(len).map_or(true, |e| e > self.managed_space) {
            return Err(Complaint::new(Level::Structure, "fractal heap managed ID: object outside the managed space")
                .at(at)
                .value(off)
                .into());
        }
        let block = self.locate(ctx, off)?;
        let image = self.load_direct(ctx, block)?;
        let local = (off - block.block_off) as usize;
        let end = local + len as usize;
        if local < self.direct_header_size() || end > image.len() {
            return Err(Complaint::new(Level::Structure, "fractal heap managed ID: object outside its direct block")
                .at(block.addr)
                .value(off)
                .into());
        }
        Ok(image[local..end].to_vec())
    }

    /// Descend the doubling table to the direct block holding `off`.
    fn locate(&self, ctx: &mut FileContext<'_>, off: u64) -> CheckResult<BlockRef> {
        let dt = &self.dtable;
        if dt.cur_root_rows == 0 {
            return Ok(BlockRef {
                addr: dt.root_addr,
                block_off: 0,
                size: dt.start_block_size,
                filtered: self.filter.as_ref().map(|f| (f.root_size, f.root_mask)),
            });
        }
        let mut iblock = dt.root_addr;
        let mut iblock_off = 0u64;
        let mut nrows = usize::from(dt.cur_root_rows);
        for _ in 0..=dt.max_root_rows {
            let entries = self.load_indirect(ctx, iblock, iblock_off, nrows)?;
            let (row, col) = dt.lookup(off - iblock_off);
            let idx = row * usize::from(dt.width) + col as usize;
            let entry = *entries.get(idx).ok_or_else(|| {
                CheckError::format(Level::Structure, "fractal heap: offset beyond the indirect block", iblock)
            })?;
            let child_off = iblock_off + dt.row_block_off[row] + col * dt.row_block_size[row];
            if !ctx.state.addr_valid(entry.addr) {
                return Err(CheckError::format(Level::Structure, "fractal heap: object in an unallocated block", iblock));
            }
            if (row as u32) < dt.max_direct_rows {
                return Ok(BlockRef {
                    addr: entry.addr,
                    block_off: child_off,
                    size: dt.row_block_size[row],
                    filtered: entry.filtered,
                });
            }
            iblock = entry.addr;
            iblock_off = child_off;
            nrows = dt.size_to_rows(dt.row_block_size[row]) as usize;
        }
        Err(CheckError::format(Level::Structure, "fractal heap: indirect blocks nested too deeply", iblock))
    }

    fn read_huge(&self, ctx: &mut FileContext<'_>, id: &[u8]) -> CheckResult<Vec<u8>> {
        let at = self.address;
        let mut d = Decoder::new(id, at, Level::Structure);
        d.skip(1)?;
        let (addr, len, mask, mem_size) = if self.huge_ids_direct {
            let addr = d.addr(self.sizes)?;
            let len = d.length(self.sizes)?;
            if self.filter.is_some() {
                (addr, len, d.u32()?, Some(d.length(self.sizes)?))
            } else {
                (addr, len, 0, None)
            }
        } else {
            let want = d.uint(self.huge_id_size)?;
            let tree = BTreeV2::load(ctx, self.huge_btree_addr, RecordShape::default())?;
            let found = tree.find(ctx, |r| match r {
                Record::HugeIndirect { id, .. } | Record::HugeFilteredIndirect { id, .. } => want.cmp(id),
                _ => std::cmp::Ordering::Less,
            })?;
            match found {
                Some(Record::HugeIndirect { addr, len, .. }) => (addr, len, 0, None),
                Some(Record::HugeFilteredIndirect {
                    addr,
                    len,
                    filter_mask,
                    mem_size,
                    ..
                }) => (addr, len, filter_mask, Some(mem_size)),
                _ => {
                    return Err(Complaint::new(Level::Structure, "fractal heap huge ID: not found in its B-tree")
                        .at(self.huge_btree_addr)
                        .value(want)
                        .into())
                }
            }
        };
        let n = usize::try_from(len)
            .map_err(|_| CheckError::format(Level::Structure, "fractal heap huge object: too large", addr))?;
        let raw = ctx.read(addr, n, Level::Structure, "fractal heap huge object")?;
        match (&self.filter, mem_size) {
            (Some(f), Some(mem_size)) => {
                let out = filters::reverse(&f.pipeline, mask, &raw, 1, addr)?;
                if out.len() as u64 != mem_size {
                    return Err(Complaint::new(Level::Structure, "fractal heap huge object: unfiltered size mismatch")
                        .at(addr)
                        .value(out.len() as u64)
                        .into());
                }
                Ok(out)
            }
            _ => Ok(raw),
        }
    }
}

/// Depth-first walk over the managed blocks.
struct BlockWalk<'h> {
    heap: &'h FractalHeap,
    seen: HashSet<u64>,
    direct_blocks: usize,
}

impl BlockWalk<'_> {
    fn indirect(&mut self, ctx: &mut FileContext<'_>, addr: u64, block_off: u64, nrows: usize) -> CheckResult<()> {
        if !self.seen.insert(addr) {
            return Err(CheckError::format(Level::Structure, "fractal heap: indirect block reached twice", addr));
        }
        let heap = self.heap;
        let dt = &heap.dtable;
        let entries = heap.load_indirect(ctx, addr, block_off, nrows)?;
        let width = usize::from(dt.width);
        for (i, entry) in entries.iter().enumerate() {
            if !ctx.state.addr_valid(entry.addr) {
                continue;
            }
            let (row, col) = (i / width, (i % width) as u64);
            let (Some(&row_off), Some(&row_size)) = (dt.row_block_off.get(row), dt.row_block_size.get(row)) else {
                return Err(CheckError::format(
                    Level::Structure,
                    "fractal heap: indirect block row beyond the doubling table",
                    addr,
                ));
            };
            let child_off = block_off + row_off + col * row_size;
            let result = if (row as u32) < dt.max_direct_rows {
                heap.load_direct(
                    ctx,
                    BlockRef {
                        addr: entry.addr,
                        block_off: child_off,
                        size: row_size,
                        filtered: entry.filtered,
                    },
                )
                .map(|_| self.direct_blocks += 1)
            } else {
                let child_rows = dt.size_to_rows(row_size) as usize;
                self.indirect(ctx, entry.addr, child_off, child_rows)
            };
            if let Err(e) = result {
                record_or_raise(ctx, e)?;
            }
        }
        Ok(())
    }
}

fn record_or_raise(ctx: &mut FileContext<'_>, e: CheckError) -> CheckResult<()> {
    match e {
        CheckError::Format(c) => {
            ctx.record(*c);
            Ok(())
        }
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_state::FileState;
    use crate::options::CompatLevel;
    use h5check_io::Driver;

    const START: u64 = 512;
    const WIDTH: u16 = 4;

    fn sealed(mut v: Vec<u8>) -> Vec<u8> {
        let sum = lookup3(&v);
        v.extend_from_slice(&sum.to_le_bytes());
        v
    }

    struct HeapParams {
        id_len: u16,
        flags: u8,
        root: u64,
        root_rows: u16,
        managed_space: u64,
        managed_objects: u64,
    }

    fn header(p: &HeapParams) -> Vec<u8> {
        let mut v = b"FRHP".to_vec();
        v.push(0);
        v.extend_from_slice(&p.id_len.to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes());
        v.push(p.flags);
        v.extend_from_slice(&256u32.to_le_bytes());
        let u = u64::MAX;
        for x in [0, u, 0, u, p.managed_space, p.managed_space, 0, p.managed_objects, 0, 0, 0, 0] {
            v.extend_from_slice(&x.to_le_bytes());
        }
        v.extend_from_slice(&WIDTH.to_le_bytes());
        v.extend_from_slice(&START.to_le_bytes());
        v.extend_from_slice(&(64 * 1024u64).to_le_bytes());
        v.extend_from_slice(&32u16.to_le_bytes());
        v.extend_from_slice(&1u16.to_le_bytes());
        v.extend_from_slice(&p.root.to_le_bytes());
        v.extend_from_slice(&p.root_rows.to_le_bytes());
        sealed(v)
    }

    /// Direct block of `size` bytes with `payload` right after the header.
    fn direct(heap: u64, block_off: u32, size: usize, checksum: bool, payload: &[u8]) -> Vec<u8> {
        let mut v = b"FHDB".to_vec();
        v.push(0);
        v.extend_from_slice(&heap.to_le_bytes());
        v.extend_from_slice(&block_off.to_le_bytes());
        let sum_at = v.len();
        if checksum {
            v.extend_from_slice(&[0; 4]);
        }
        v.extend_from_slice(payload);
        v.resize(size, 0);
        if checksum {
            let sum = lookup3(&v);
            v[sum_at..sum_at + 4].copy_from_slice(&sum.to_le_bytes());
        }
        v
    }

    fn run<T>(img: Vec<u8>, f: impl FnOnce(&mut FileContext<'_>) -> T) -> (T, Report) {
        let drv = Driver::memory("frhp", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        let mut report = Report::default();
        let out = {
            let mut ctx = FileContext {
                driver: &drv,
                state: &st,
                report: &mut report,
                compat: CompatLevel::V18,
            };
            f(&mut ctx)
        };
        (out, report)
    }

    fn managed_id(off: u32, len: u8) -> Vec<u8> {
        let mut id = vec![0u8];
        id.extend_from_slice(&off.to_le_bytes());
        id.push(len);
        id.push(0);
        id
    }

    fn direct_root_image(checksum: bool) -> Vec<u8> {
        let p = HeapParams {
            id_len: 7,
            flags: if checksum { FLAG_DIRECT_CHECKSUM } else { 0 },
            root: 512,
            root_rows: 0,
            managed_space: START,
            managed_objects: 1,
        };
        let mut img = header(&p);
        img.resize(512, 0);
        img.extend_from_slice(&direct(0, 0, START as usize, checksum, b"linkname"));
        img
    }

    #[test]
    fn doubling_table_derivation() {
        let dt = DoublingTable::derive(4, 512, 65536, 32, 1, 0, 0);
        assert_eq!(dt.start_bits, 9);
        assert_eq!(dt.first_row_bits, 11);
        assert_eq!(dt.max_root_rows, 22);
        assert_eq!(dt.max_direct_bits, 16);
        assert_eq!(dt.max_direct_rows, 9);
        assert_eq!(dt.num_id_first_row, 2048);
        assert_eq!(dt.max_dir_blk_off_size, 3);
        assert_eq!(&dt.row_block_size[..4], &[512, 512, 1024, 2048]);
        assert_eq!(&dt.row_block_off[..4], &[0, 2048, 4096, 8192]);
        assert_eq!(dt.lookup(100), (0, 0));
        assert_eq!(dt.lookup(2048 + 600), (1, 1));
        assert_eq!(dt.lookup(4096 + 1024), (2, 1));
        assert_eq!(dt.size_to_rows(dt.row_block_size[9]), 7);
        assert_eq!(dt.row_block_off[7], dt.row_block_size[9]);
    }

    #[test]
    fn direct_root_validates_and_reads() {
        let (out, report) = run(direct_root_image(true), |ctx| {
            let heap = FractalHeap::load(ctx, 0)?;
            assert_eq!(heap.heap_off_size, 4);
            assert_eq!(heap.heap_len_size, 2);
            heap.validate(ctx)?;
            let hdr = heap.direct_header_size() as u32;
            heap.read_object(ctx, &managed_id(hdr, 8))
        });
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(out.unwrap(), b"linkname");
    }

    #[test]
    fn direct_block_checksum_mismatch() {
        let mut img = direct_root_image(true);
        img[512 + 30] ^= 0x55;
        let (_, report) = run(img, |ctx| FractalHeap::load(ctx, 0)?.validate(ctx));
        assert_eq!(report.total(), 1);
        assert_eq!(report.complaints()[0].address, Some(512));
    }

    #[test]
    fn tiny_ids() {
        let (heap, _) = run(direct_root_image(false), |ctx| FractalHeap::load(ctx, 0));
        let heap = heap.unwrap();
        assert!(!heap.tiny_len_extended);
        assert_eq!(heap.read_tiny(&[0x22, b'a', b'b', b'c', 0, 0, 0]).unwrap(), b"abc");
        assert!(heap.read_tiny(&[0x2f, b'a', b'b']).is_err());
    }

    #[test]
    fn extended_tiny_length_overrun() {
        let p = HeapParams {
            id_len: 20,
            flags: 0,
            root: u64::MAX,
            root_rows: 0,
            managed_space: 0,
            managed_objects: 0,
        };
        let (heap, _) = run(header(&p), |ctx| FractalHeap::load(ctx, 0));
        let heap = heap.unwrap();
        assert!(heap.tiny_len_extended);
        assert_eq!(heap.tiny_max_len, 18);
        let mut id = vec![0x20, 17];
        id.extend_from_slice(&[7; 18]);
        assert_eq!(heap.read_tiny(&id).unwrap().len(), 18);
        let short = [0x20, 17, 1, 2, 3];
        assert!(matches!(heap.read_tiny(&short), Err(CheckError::Format(_))));
    }

    #[test]
    fn indirect_root_descent() {
        // Root indirect block with one row; the second column holds data.
        let p = HeapParams {
            id_len: 7,
            flags: 0,
            root: 512,
            root_rows: 1,
            managed_space: START * u64::from(WIDTH),
            managed_objects: 1,
        };
        let mut img = header(&p);
        img.resize(512, 0);
        let mut ib = b"FHIB".to_vec();
        ib.push(0);
        ib.extend_from_slice(&0u64.to_le_bytes());
        ib.extend_from_slice(&0u32.to_le_bytes());
        for a in [u64::MAX, 1024, u64::MAX, u64::MAX] {
            ib.extend_from_slice(&a.to_le_bytes());
        }
        img.extend_from_slice(&sealed(ib));
        img.resize(1024, 0);
        img.extend_from_slice(&direct(0, START as u32, START as usize, false, b"dense"));
        let (out, report) = run(img, |ctx| {
            let heap = FractalHeap::load(ctx, 0)?;
            heap.validate(ctx)?;
            let hdr = heap.direct_header_size() as u32;
            heap.read_object(ctx, &managed_id(START as u32 + hdr, 5))
        });
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(out.unwrap(), b"dense");
    }

    #[test]
    fn root_rows_beyond_doubling_table_abort() {
        // Width 4, 512-byte start blocks and 32-bit offsets allow 22 root rows.
        let p = HeapParams {
            id_len: 7,
            flags: 0,
            root: 512,
            root_rows: 23,
            managed_space: START * u64::from(WIDTH),
            managed_objects: 1,
        };
        let mut img = header(&p);
        img.resize(512, 0);
        let mut ib = b"FHIB".to_vec();
        ib.push(0);
        ib.extend_from_slice(&0u64.to_le_bytes());
        ib.extend_from_slice(&0u32.to_le_bytes());
        for i in 0..23 * usize::from(WIDTH) {
            let a: u64 = if i == 22 * usize::from(WIDTH) { 0 } else { u64::MAX };
            ib.extend_from_slice(&a.to_le_bytes());
        }
        img.extend_from_slice(&sealed(ib));
        let (out, report) = run(img, |ctx| {
            let heap = FractalHeap::load(ctx, 0)?;
            heap.validate(ctx)
        });
        match out {
            Err(CheckError::Format(c)) => {
                assert!(c.description.contains("too many rows"), "{}", c.description);
                assert_eq!(c.bad_value, Some(23));
            }
            other => panic!("expected the header to be rejected, got {other:?} {:?}", report.complaints()),
        }
    }

    #[test]
    fn bad_geometry_aborts() {
        let p = HeapParams {
            id_len: 7,
            flags: 0,
            root: u64::MAX,
            root_rows: 0,
            managed_space: 0,
            managed_objects: 0,
        };
        let mut img = header(&p);
        // Table width 3 is not a power of two.
        let width_at = 5 + 2 + 2 + 1 + 4 + 12 * 8;
        img[width_at] = 3;
        let (out, _) = run(img, |ctx| FractalHeap::load(ctx, 0).map(|_| ()));
        assert!(matches!(out, Err(CheckError::Format(_))));
    }
}
