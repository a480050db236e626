//! Global heap collections (`GCOL`), holding variable-length data and the
//! source selections of virtual datasets.

use std::collections::HashSet;

use crate::decode::{Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::signature::{magic, matches};

/// Smallest collection the library allocates.
pub const MIN_COLLECTION_SIZE: u64 = 4096;

/// One object stored in a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeapObject {
    /// Heap object index (never 0).
    pub index: u16,
    /// Reference count.
    pub refcount: u16,
    /// File address of the object data.
    pub data_addr: u64,
    /// Object data.
    pub data: Vec<u8>,
}

/// A decoded collection.
#[derive(Debug, Clone)]
pub struct GlobalHeapCollection {
    /// Collection address.
    pub address: u64,
    /// Declared collection size, header included.
    pub size: u64,
    /// Objects in file order.
    pub objects: Vec<GlobalHeapObject>,
    /// Size of the free-space object, when present.
    pub free_space: u64,
}

fn object_header_size(sizes: Sizes) -> usize {
    8 + sizes.len_width()
}

impl GlobalHeapCollection {
    /// Decode and validate the collection at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<GlobalHeapCollection> {
        let sizes = ctx.sizes();
        let prefix_len = 8 + sizes.len_width();
        let prefix = ctx.read(addr, prefix_len, Level::Structure, "global heap collection")?;
        let mut d = Decoder::new(&prefix, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::GCOL) {
            return Err(CheckError::format(
                Level::Structure,
                "global heap collection: incorrect signature",
                addr,
            ));
        }
        let version = d.u8()?;
        ctx.require(version == 1, || {
            Complaint::new(Level::Structure, "global heap collection: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        d.skip(3)?;
        let size = d.length(sizes)?;
        if size < MIN_COLLECTION_SIZE {
            ctx.record(
                Complaint::new(Level::Structure, "global heap collection: size smaller than the minimum")
                    .at(addr)
                    .value(size),
            );
        }
        let len = usize::try_from(size)
            .ok()
            .filter(|&n| n >= prefix_len)
            .ok_or_else(|| CheckError::format(Level::Structure, "global heap collection: invalid size", addr))?;
        let image = ctx.read(addr, len, Level::Structure, "global heap collection")?;

        let mut heap = GlobalHeapCollection {
            address: addr,
            size,
            objects: Vec::new(),
            free_space: 0,
        };
        let mut d = Decoder::new(&image, addr, Level::Structure);
        d.seek(prefix_len)?;
        let mut indexes = HashSet::new();
        while d.remaining() >= object_header_size(sizes) {
            let at = d.address();
            let index = d.u16()?;
            let refcount = d.u16()?;
            d.skip(4)?;
            let obj_size = d.length(sizes)?;
            if index == 0 {
                // The free-space object covers the rest of the collection.
                let rest = (d.remaining() + object_header_size(sizes)) as u64;
                ctx.require(obj_size == rest, || {
                    Complaint::new(Level::Structure, "global heap collection: free space size does not fill the collection")
                        .at(at)
                        .value(obj_size)
                });
                heap.free_space = obj_size;
                break;
            }
            let padded = usize::try_from(obj_size)
                .ok()
                .and_then(|n| n.checked_next_multiple_of(8))
                .filter(|&n| n <= d.remaining())
                .ok_or_else(|| {
                    CheckError::from(
                        Complaint::new(Level::Structure, "global heap object: extends beyond the collection")
                            .at(at)
                            .value(obj_size),
                    )
                })?;
            if !indexes.insert(index) {
                ctx.record(
                    Complaint::new(Level::Structure, "global heap object: duplicate index")
                        .at(at)
                        .value(u64::from(index)),
                );
            }
            let data_addr = d.address();
            let data = d.bytes(padded)?[..obj_size as usize].to_vec();
            heap.objects.push(GlobalHeapObject {
                index,
                refcount,
                data_addr,
                data,
            });
        }
        tracing::debug!(addr, objects = heap.objects.len(), "validated global heap collection");
        Ok(heap)
    }

    /// Object with the given index.
    pub fn object(&self, index: u32) -> Option<&GlobalHeapObject> {
        self.objects.iter().find(|o| u32::from(o.index) == index)
    }
}

/// A reference into a global heap: collection address and object index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalHeapId {
    /// Collection address.
    pub collection: u64,
    /// Object index.
    pub index: u32,
}

impl GlobalHeapId {
    /// Encoded size.
    pub fn size(sizes: Sizes) -> usize {
        sizes.addr_width() + 4
    }

    /// Decode a heap ID.
    pub fn decode(d: &mut Decoder<'_>, sizes: Sizes) -> CheckResult<Self> {
        Ok(Self {
            collection: d.addr(sizes)?,
            index: d.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_state::FileState;
    use crate::options::CompatLevel;
    use crate::report::Report;
    use h5check_io::Driver;

    fn collection(objects: &[(u16, &[u8])], size: u64) -> Vec<u8> {
        let mut v = b"GCOL".to_vec();
        v.extend_from_slice(&[1, 0, 0, 0]);
        v.extend_from_slice(&size.to_le_bytes());
        for (index, data) in objects {
            v.extend_from_slice(&index.to_le_bytes());
            v.extend_from_slice(&1u16.to_le_bytes());
            v.extend_from_slice(&[0; 4]);
            v.extend_from_slice(&(data.len() as u64).to_le_bytes());
            v.extend_from_slice(data);
            v.resize(v.len().next_multiple_of(8), 0);
        }
        let free = size - v.len() as u64;
        v.extend_from_slice(&[0; 8]);
        v.extend_from_slice(&free.to_le_bytes());
        v.resize(size as usize, 0);
        v
    }

    fn load(img: Vec<u8>) -> (CheckResult<GlobalHeapCollection>, Report) {
        let drv = Driver::memory("gcol", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        let mut report = Report::default();
        let mut ctx = FileContext {
            driver: &drv,
            state: &st,
            report: &mut report,
            compat: CompatLevel::V18,
        };
        let out = GlobalHeapCollection::load(&mut ctx, 0);
        (out, report)
    }

    #[test]
    fn objects_and_free_space() {
        let img = collection(&[(1, &b"hello"[..]), (2, &b"world!!!!"[..])], 4096);
        let (heap, report) = load(img);
        let heap = heap.unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(heap.objects.len(), 2);
        assert_eq!(heap.object(2).unwrap().data, b"world!!!!");
        assert_eq!(heap.object(1).unwrap().data_addr, 32);
        assert_eq!(heap.free_space, 4096 - 72);
    }

    #[test]
    fn small_collection_and_duplicate_index() {
        let img = collection(&[(3, &b"a"[..]), (3, &b"b"[..])], 128);
        let (heap, report) = load(img);
        assert_eq!(heap.unwrap().objects.len(), 2);
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn oversized_object_aborts() {
        let mut img = collection(&[(1, &b"abc"[..])], 4096);
        img[24..32].copy_from_slice(&10_000u64.to_le_bytes());
        let (heap, _) = load(img);
        assert!(matches!(heap, Err(CheckError::Format(_))));
    }
}
