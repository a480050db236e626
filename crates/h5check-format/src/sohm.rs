//! Shared object header messages: the master table (`SMTB`), its list
//! indexes (`SMLI`) and B-tree indexes, and the heaps holding the messages.

use crate::btree_v2::{BTreeV2, Record, RecordKind, RecordShape, SohmRecord};
use crate::checksum::verify_trailing;
use crate::decode::{Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::fractal_heap::FractalHeap;
use crate::message_type::MessageType;
use crate::signature::{magic, matches};

/// Message kinds that may be shared through the table.
pub const SHAREABLE_MASK: u16 = 0x182a;

const INDEX_LIST: u8 = 0;
const INDEX_BTREE: u8 = 1;

/// How an index stores its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Flat list in an `SMLI` block.
    List,
    /// B-tree v2 of shared message records.
    BTree,
}

/// One index of the master table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SohmIndex {
    /// Entry version.
    pub version: u8,
    /// Storage kind.
    pub kind: IndexKind,
    /// Message kinds this index holds, one bit per message type id.
    pub message_types: u16,
    /// Smallest message that is shared.
    pub min_size: u32,
    /// Largest list before conversion to a B-tree.
    pub list_max: u16,
    /// Smallest B-tree before conversion to a list.
    pub btree_min: u16,
    /// Messages in the index.
    pub num_messages: u16,
    /// List or B-tree address.
    pub index_addr: u64,
    /// Fractal heap holding the messages.
    pub heap_addr: u64,
}

impl SohmIndex {
    /// True when messages of type `mt` go to this index.
    pub fn holds(&self, mt: MessageType) -> bool {
        mt.sohm_flag().is_some_and(|f| self.message_types & f != 0)
    }
}

/// The decoded master table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SohmTable {
    /// Table address.
    pub address: u64,
    /// Indexes in table order.
    pub indexes: Vec<SohmIndex>,
}

fn index_entry_size(sizes: Sizes) -> usize {
    1 + 1 + 2 + 4 + 2 + 2 + 2 + 2 * sizes.addr_width()
}

impl SohmTable {
    /// Decode and check the master table at `addr` holding `count` indexes.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64, count: u8) -> CheckResult<SohmTable> {
        let sizes = ctx.sizes();
        let len = 4 + usize::from(count) * index_entry_size(sizes) + 4;
        let image = ctx.read(addr, len, Level::Structure, "shared message table")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::SMTB) {
            return Err(CheckError::format(Level::Structure, "shared message table: incorrect signature", addr));
        }
        let mut indexes = Vec::with_capacity(usize::from(count));
        let mut seen_types = 0u16;
        for _ in 0..count {
            let at = d.address();
            let version = d.u8()?;
            ctx.require(version == 0, || {
                Complaint::new(Level::Structure, "shared message index: incorrect version")
                    .at(at)
                    .value(u64::from(version))
            });
            let raw_kind = d.u8()?;
            let kind = match raw_kind {
                INDEX_LIST => IndexKind::List,
                INDEX_BTREE => IndexKind::BTree,
                other => {
                    ctx.record(
                        Complaint::new(Level::Structure, "shared message index: invalid index type")
                            .at(at)
                            .value(u64::from(other)),
                    );
                    IndexKind::BTree
                }
            };
            let idx = SohmIndex {
                version,
                kind,
                message_types: d.u16()?,
                min_size: d.u32()?,
                list_max: d.u16()?,
                btree_min: d.u16()?,
                num_messages: d.u16()?,
                index_addr: d.addr(sizes)?,
                heap_addr: d.addr(sizes)?,
            };
            ctx.require(idx.message_types != 0 && idx.message_types & !SHAREABLE_MASK == 0, || {
                Complaint::new(Level::Structure, "shared message index: invalid message type flags")
                    .at(at)
                    .value(u64::from(idx.message_types))
            });
            ctx.require(seen_types & idx.message_types == 0, || {
                Complaint::new(Level::Structure, "shared message index: message types overlap another index")
                    .at(at)
                    .value(u64::from(idx.message_types))
            });
            seen_types |= idx.message_types;
            ctx.require(u32::from(idx.list_max) + 1 >= u32::from(idx.btree_min), || {
                Complaint::new(Level::Structure, "shared message index: list cutoff below B-tree cutoff")
                    .at(at)
                    .value(u64::from(idx.list_max))
            });
            let consistent = match idx.kind {
                IndexKind::List => idx.num_messages <= idx.list_max,
                IndexKind::BTree => idx.num_messages >= idx.btree_min,
            };
            ctx.require(consistent, || {
                Complaint::new(Level::Structure, "shared message index: index type inconsistent with message count")
                    .at(at)
                    .value(u64::from(idx.num_messages))
            });
            indexes.push(idx);
        }
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "shared message table") {
            ctx.record(c);
        }
        Ok(SohmTable { address: addr, indexes })
    }

    /// Index holding messages of type `mt`.
    pub fn index_for(&self, mt: MessageType) -> Option<&SohmIndex> {
        self.indexes.iter().find(|i| i.holds(mt))
    }

    /// Validate every index and its heap. Problems in one index do not
    /// stop the others.
    pub fn validate(&self, ctx: &mut FileContext<'_>) -> CheckResult<()> {
        for idx in &self.indexes {
            if let Err(e) = validate_index(ctx, idx) {
                match e {
                    CheckError::Format(c) => ctx.record(*c),
                    other => return Err(other),
                }
            }
            ctx.report.flush();
        }
        Ok(())
    }
}

fn validate_index(ctx: &mut FileContext<'_>, idx: &SohmIndex) -> CheckResult<()> {
    if ctx.state.addr_valid(idx.heap_addr) {
        let heap = FractalHeap::load(ctx, idx.heap_addr)?;
        heap.validate(ctx)?;
    } else if idx.num_messages > 0 {
        ctx.record(
            Complaint::new(Level::Structure, "shared message index: invalid heap address")
                .value(idx.heap_addr),
        );
    }
    if idx.num_messages == 0 && !ctx.state.addr_valid(idx.index_addr) {
        return Ok(());
    }
    let records = match idx.kind {
        IndexKind::List => load_list(ctx, idx)?,
        IndexKind::BTree => {
            let tree = BTreeV2::load(ctx, idx.index_addr, RecordShape::default())?;
            ctx.require(tree.kind == RecordKind::SharedMessage, || {
                Complaint::new(Level::Structure, "shared message index: B-tree has the wrong record type")
                    .at(idx.index_addr)
                    .value(u64::from(tree.kind.to_u8()))
            });
            let records = tree.walk(ctx, None)?;
            ctx.require(records.len() == usize::from(idx.num_messages), || {
                Complaint::new(Level::Structure, "shared message index: B-tree record count differs from the table")
                    .at(idx.index_addr)
                    .value(records.len() as u64)
            });
            records
                .into_iter()
                .filter_map(|r| match r {
                    Record::SharedMessage(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    };
    for rec in &records {
        if let SohmRecord::InHeader {
            msg_type, header_addr, ..
        } = *rec
        {
            let mt = MessageType::from_u16(u16::from(msg_type));
            ctx.require(idx.holds(mt), || {
                Complaint::new(Level::Structure, "shared message record: message type not held by its index")
                    .at(idx.index_addr)
                    .value(u64::from(msg_type))
            });
            ctx.require(ctx.state.addr_valid(header_addr), || {
                Complaint::new(Level::Structure, "shared message record: invalid object header address")
                    .at(idx.index_addr)
                    .value(header_addr)
            });
        }
    }
    Ok(())
}

/// Decode and check a list index, returning its records.
pub fn load_list(ctx: &mut FileContext<'_>, idx: &SohmIndex) -> CheckResult<Vec<SohmRecord>> {
    let sizes = ctx.sizes();
    let addr = idx.index_addr;
    let entry = SohmRecord::size(sizes);
    let used = usize::from(idx.num_messages);
    if used > usize::from(idx.list_max) {
        return Err(CheckError::format(
            Level::Structure,
            "shared message list: more messages than the list holds",
            addr,
        ));
    }
    let image = ctx.read(addr, 4 + used * entry + 4, Level::Structure, "shared message list")?;
    let mut d = Decoder::new(&image, addr, Level::Structure);
    if !matches(d.bytes(4)?, magic::SMLI) {
        return Err(CheckError::format(Level::Structure, "shared message list: incorrect signature", addr));
    }
    let mut records = Vec::with_capacity(used);
    for _ in 0..used {
        records.push(SohmRecord::decode(&mut d, sizes)?);
    }
    if let Some(c) = verify_trailing(&image, addr, Level::Structure, "shared message list") {
        ctx.record(c);
    }
    Ok(records)
}

/// Fetch the encoded message a shared reference's heap ID names.
pub fn read_message(ctx: &mut FileContext<'_>, idx: &SohmIndex, heap_id: &[u8]) -> CheckResult<Vec<u8>> {
    let heap = FractalHeap::load(ctx, idx.heap_addr)?;
    heap.read_object(ctx, heap_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::lookup3;
    use crate::file_state::FileState;
    use crate::options::CompatLevel;
    use crate::report::Report;
    use h5check_io::Driver;

    fn sealed(mut v: Vec<u8>) -> Vec<u8> {
        let sum = lookup3(&v);
        v.extend_from_slice(&sum.to_le_bytes());
        v
    }

    fn entry(kind: u8, types: u16, list_max: u16, btree_min: u16, n: u16, index: u64, heap: u64) -> Vec<u8> {
        let mut v = vec![0, kind];
        v.extend_from_slice(&types.to_le_bytes());
        v.extend_from_slice(&50u32.to_le_bytes());
        v.extend_from_slice(&list_max.to_le_bytes());
        v.extend_from_slice(&btree_min.to_le_bytes());
        v.extend_from_slice(&n.to_le_bytes());
        v.extend_from_slice(&index.to_le_bytes());
        v.extend_from_slice(&heap.to_le_bytes());
        v
    }

    fn table(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut v = b"SMTB".to_vec();
        for e in entries {
            v.extend_from_slice(e);
        }
        sealed(v)
    }

    fn run<T>(img: Vec<u8>, f: impl FnOnce(&mut FileContext<'_>) -> T) -> (T, Report) {
        let drv = Driver::memory("smtb", img);
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

    #[test]
    fn table_entries_checked() {
        let u = u64::MAX;
        let img = table(&[
            entry(INDEX_LIST, 0x0008, 50, 40, 0, u, u),
            // Overlaps the first index, and its list cutoff is too small.
            entry(INDEX_LIST, 0x0808, 5, 40, 0, u, u),
            entry(INDEX_BTREE, 0x0002, 50, 40, 3, u, u),
        ]);
        let (t, report) = run(img, |ctx| SohmTable::load(ctx, 0, 3));
        let t = t.unwrap();
        assert_eq!(t.indexes.len(), 3);
        assert_eq!(report.total(), 3);
        assert_eq!(t.index_for(MessageType::Dataspace).unwrap().kind, IndexKind::BTree);
        assert!(t.index_for(MessageType::Attribute).is_none());
    }

    #[test]
    fn list_index_records() {
        let mut rec = vec![1];
        rec.extend_from_slice(&0xabcdu32.to_le_bytes());
        rec.extend_from_slice(&[0, 3]);
        rec.extend_from_slice(&0u16.to_le_bytes());
        rec.extend_from_slice(&0x40u64.to_le_bytes());
        rec.resize(17, 0);
        let mut list = b"SMLI".to_vec();
        list.extend_from_slice(&rec);
        let list = sealed(list);

        let u = u64::MAX;
        let mut img = table(&[entry(INDEX_LIST, 0x0008, 50, 40, 1, 64, u)]);
        img.resize(64, 0);
        img.extend_from_slice(&list);
        img.resize(128, 0);
        let (out, report) = run(img, |ctx| {
            let t = SohmTable::load(ctx, 0, 1)?;
            t.validate(ctx)?;
            load_list(ctx, &t.indexes[0])
        });
        let records = out.unwrap();
        assert_eq!(
            records,
            vec![SohmRecord::InHeader {
                hash: 0xabcd,
                msg_type: 3,
                index: 0,
                header_addr: 0x40
            }]
        );
        // Only the missing heap is reported.
        assert_eq!(report.total(), 1, "{:?}", report.complaints());
    }
}
