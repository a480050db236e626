//! Local heap: the name store of a version 1 group.

use crate::decode::{Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::signature::{magic, matches};

/// Free-list terminator written by the library.
const FREE_NULL: u64 = 1;

/// A decoded local heap with its data segment.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    /// Header address.
    pub address: u64,
    /// Size of the data segment in bytes.
    pub data_size: u64,
    /// Offset of the first free block, if any.
    pub free_head: Option<u64>,
    /// File address of the data segment.
    pub data_address: u64,
    /// Data segment contents.
    pub data: Vec<u8>,
    /// `(offset, size)` of each free block.
    pub free_blocks: Vec<(u64, u64)>,
}

/// Size of the heap header for the given widths.
pub fn header_size(sizes: Sizes) -> usize {
    8 + 2 * sizes.len_width() + sizes.addr_width()
}

impl LocalHeap {
    /// Decode and validate the heap at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<LocalHeap> {
        let sizes = ctx.sizes();
        let image = ctx.read(addr, header_size(sizes), Level::Structure, "local heap")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::HEAP) {
            return Err(CheckError::format(
                Level::Structure,
                "local heap: incorrect signature",
                addr,
            ));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "local heap: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        d.skip(3)?;
        let data_size = d.length(sizes)?;
        let free_raw = d.length(sizes)?;
        let data_address = d.addr(sizes)?;

        if !ctx.state.addr_valid(data_address) {
            return Err(Complaint::new(
                Level::Structure,
                "local heap: invalid data segment address",
            )
            .at(addr)
            .value(data_address)
            .into());
        }
        let len = usize::try_from(data_size).map_err(|_| {
            CheckError::format(Level::Structure, "local heap: data segment size too large", addr)
        })?;
        let data = ctx.read(data_address, len, Level::Structure, "local heap data segment")?;

        let free_head = (free_raw != FREE_NULL && free_raw != u64::MAX).then_some(free_raw);
        let mut heap = LocalHeap {
            address: addr,
            data_size,
            free_head,
            data_address,
            data,
            free_blocks: Vec::new(),
        };
        heap.walk_free_list(ctx, sizes);
        tracing::debug!(addr, data_size, free = heap.free_blocks.len(), "validated local heap");
        Ok(heap)
    }

    fn walk_free_list(&mut self, ctx: &mut FileContext<'_>, sizes: Sizes) {
        let min_block = 2 * sizes.len_width() as u64;
        let mut next = self.free_head;
        let mut prev_end = 0u64;
        while let Some(offset) = next {
            let header_end = offset.checked_add(min_block);
            if header_end.map_or(true, |end| end > self.data_size) {
                ctx.record(
                    Complaint::new(Level::Structure, "local heap: free block offset out of range")
                        .at(self.address)
                        .value(offset),
                );
                return;
            }
            if offset < prev_end {
                ctx.record(
                    Complaint::new(Level::Structure, "local heap: free list is not in ascending order")
                        .at(self.address)
                        .value(offset),
                );
                return;
            }
            let start = offset as usize;
            let mut d = Decoder::new(&self.data[start..], self.data_address + offset, Level::Structure);
            let (Ok(link), Ok(size)) = (d.length(sizes), d.length(sizes)) else {
                return;
            };
            if size < min_block || offset.saturating_add(size) > self.data_size {
                ctx.record(
                    Complaint::new(Level::Structure, "local heap: bad free block size")
                        .at(self.address)
                        .value(size),
                );
                return;
            }
            self.free_blocks.push((offset, size));
            prev_end = offset + size;
            next = (link != FREE_NULL && link != u64::MAX).then_some(link);
        }
    }

    /// NUL-terminated name at `offset` in the data segment.
    pub fn name_at(&self, offset: u64) -> CheckResult<&[u8]> {
        let bad = |what: &str| {
            CheckError::format(
                Level::Structure,
                format!("local heap: {what} at offset {offset}"),
                self.address,
            )
        };
        let start = usize::try_from(offset)
            .ok()
            .filter(|&s| s < self.data.len())
            .ok_or_else(|| bad("name offset beyond data segment"))?;
        let rest = &self.data[start..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("name is not NUL-terminated"))?;
        Ok(&rest[..end])
    }

    /// True when `offset` falls inside a free block.
    pub fn is_free(&self, offset: u64) -> bool {
        self.free_blocks
            .iter()
            .any(|&(start, size)| offset >= start && offset < start + size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_state::FileState;
    use crate::options::CompatLevel;
    use crate::report::Report;
    use h5check_io::Driver;

    fn heap_image(data: &[u8], free_head: u64) -> Vec<u8> {
        let mut img = b"HEAP".to_vec();
        img.extend_from_slice(&[0, 0, 0, 0]);
        img.extend_from_slice(&(data.len() as u64).to_le_bytes());
        img.extend_from_slice(&free_head.to_le_bytes());
        img.extend_from_slice(&32u64.to_le_bytes());
        img.extend_from_slice(data);
        img
    }

    fn load(img: Vec<u8>) -> (CheckResult<LocalHeap>, Report) {
        let drv = Driver::memory("heap", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        let mut report = Report::default();
        let res = {
            let mut ctx = FileContext {
                driver: &drv,
                state: &st,
                report: &mut report,
                compat: CompatLevel::V18,
            };
            LocalHeap::load(&mut ctx, 0)
        };
        (res, report)
    }

    #[test]
    fn names_and_empty_free_list() {
        let mut data = b"\0\0\0\0\0\0\0\0alpha\0\0\0beta\0\0\0\0".to_vec();
        data.resize(24, 0);
        let (heap, report) = load(heap_image(&data, FREE_NULL));
        let heap = heap.unwrap();
        assert!(report.is_clean());
        assert_eq!(heap.name_at(0).unwrap(), b"");
        assert_eq!(heap.name_at(8).unwrap(), b"alpha");
        assert_eq!(heap.name_at(16).unwrap(), b"beta");
        assert!(heap.name_at(100).is_err());
    }

    #[test]
    fn free_list_walked() {
        let mut data = vec![0u8; 48];
        data[..6].copy_from_slice(b"name\0\0");
        // Free block at 16: next = FREE_NULL, size 32.
        data[16..24].copy_from_slice(&FREE_NULL.to_le_bytes());
        data[24..32].copy_from_slice(&32u64.to_le_bytes());
        let (heap, report) = load(heap_image(&data, 16));
        let heap = heap.unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(heap.free_blocks, vec![(16, 32)]);
        assert!(heap.is_free(20));
        assert!(!heap.is_free(8));
    }

    #[test]
    fn bad_free_block_recorded() {
        let mut data = vec![0u8; 32];
        data[8..16].copy_from_slice(&FREE_NULL.to_le_bytes());
        data[16..24].copy_from_slice(&64u64.to_le_bytes());
        let (heap, report) = load(heap_image(&data, 8));
        assert!(heap.is_ok());
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn bad_signature_aborts() {
        let mut img = heap_image(&[0u8; 8], FREE_NULL);
        img[0] = b'X';
        let (heap, _) = load(img);
        assert!(matches!(heap, Err(CheckError::Format(_))));
    }
}
