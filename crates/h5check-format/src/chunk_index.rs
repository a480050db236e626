//! Chunk indexes of version 4 layouts: fixed arrays (`FAHD`, `FADB`) and
//! extensible arrays (`EAHD`, `EAIB`).
//!
//! Both store one element per chunk: the chunk address, plus its stored
//! size and filter mask when the dataset is filtered.

use crate::checksum::verify_trailing;
use crate::decode::{is_undef, log2_of2, Decoder, Sizes};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::signature::{magic, matches};

/// Client id of arrays indexing unfiltered chunks.
pub const CLIENT_CHUNKS: u8 = 0;
/// Client id of arrays indexing filtered chunks.
pub const CLIENT_FILTERED_CHUNKS: u8 = 1;

/// One array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkElement {
    /// Position in the array.
    pub index: u64,
    /// Chunk address.
    pub addr: u64,
    /// Stored size and filter mask of a filtered chunk.
    pub filtered: Option<(u64, u32)>,
}

fn check_client(ctx: &mut FileContext<'_>, what: &str, addr: u64, client: u8, element_size: u8, sizes: Sizes) {
    let expected_ok = match client {
        CLIENT_CHUNKS => usize::from(element_size) == sizes.addr_width(),
        CLIENT_FILTERED_CHUNKS => {
            let size_len = usize::from(element_size).saturating_sub(sizes.addr_width() + 4);
            (1..=8).contains(&size_len)
        }
        other => {
            ctx.record(
                Complaint::new(Level::Structure, format!("{what}: invalid client id"))
                    .at(addr)
                    .value(u64::from(other)),
            );
            return;
        }
    };
    ctx.require(expected_ok, || {
        Complaint::new(Level::Structure, format!("{what}: element size does not match the client"))
            .at(addr)
            .value(u64::from(element_size))
    });
}

fn decode_element(d: &mut Decoder<'_>, client: u8, element_size: u8, sizes: Sizes, index: u64) -> CheckResult<ChunkElement> {
    let addr = d.addr(sizes)?;
    let filtered = if client == CLIENT_FILTERED_CHUNKS {
        let size_len = usize::from(element_size).saturating_sub(sizes.addr_width() + 4);
        if !(1..=8).contains(&size_len) {
            return Err(CheckError::format(Level::Structure, "chunk index: invalid filtered element size", d.address()));
        }
        Some((d.uint(size_len)?, d.u32()?))
    } else {
        None
    };
    Ok(ChunkElement { index, addr, filtered })
}

fn check_elements(ctx: &mut FileContext<'_>, what: &str, at: u64, elements: &[ChunkElement], chunk_bytes: u64) {
    for e in elements {
        let len = e.filtered.map_or(chunk_bytes, |(size, _)| size);
        ctx.require(ctx.state.extent_valid(e.addr, len), || {
            Complaint::new(Level::Structure, format!("{what}: chunk {} extends beyond the end of allocated space", e.index))
                .at(at)
                .value(e.addr)
        });
    }
}

/// A decoded fixed array header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedArray {
    /// Header address.
    pub address: u64,
    /// Client id.
    pub client: u8,
    /// Bytes per element.
    pub element_size: u8,
    /// log2 of the elements per data block page.
    pub page_bits: u8,
    /// Number of elements.
    pub num_elements: u64,
    /// Data block address.
    pub data_block_addr: u64,
    sizes: Sizes,
}

impl FixedArray {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<FixedArray> {
        let sizes = ctx.sizes();
        let len = 8 + sizes.len_width() + sizes.addr_width() + 4;
        let image = ctx.read(addr, len, Level::Structure, "fixed array header")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FAHD) {
            return Err(CheckError::format(Level::Structure, "fixed array header: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "fixed array header: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let fa = FixedArray {
            address: addr,
            client: d.u8()?,
            element_size: d.u8()?,
            page_bits: d.u8()?,
            num_elements: d.length(sizes)?,
            data_block_addr: d.addr(sizes)?,
            sizes,
        };
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "fixed array header") {
            ctx.record(c);
        }
        check_client(ctx, "fixed array header", addr, fa.client, fa.element_size, sizes);
        if fa.page_bits == 0 || fa.page_bits >= 64 {
            return Err(Complaint::new(Level::Structure, "fixed array header: invalid page size")
                .at(addr)
                .value(u64::from(fa.page_bits))
                .into());
        }
        Ok(fa)
    }

    /// Elements per data block page.
    pub fn page_elements(&self) -> u64 {
        1u64 << self.page_bits
    }

    /// Validate the data block and its pages; returns the elements with a
    /// defined address. `chunk_bytes` is the size of an unfiltered chunk.
    pub fn elements(&self, ctx: &mut FileContext<'_>, chunk_bytes: u64) -> CheckResult<Vec<ChunkElement>> {
        if is_undef(self.data_block_addr) {
            return Ok(Vec::new());
        }
        let what = "fixed array data block";
        let addr = self.data_block_addr;
        let sizes = self.sizes;
        let esize = usize::from(self.element_size);
        let nelmts = usize::try_from(self.num_elements)
            .map_err(|_| CheckError::format(Level::Structure, format!("{what}: too many elements"), addr))?;
        let page = self.page_elements();
        let paged = self.num_elements > page;
        let npages = if paged { self.num_elements.div_ceil(page) as usize } else { 0 };
        let prefix = 6 + sizes.addr_width();
        let body = if paged {
            npages.div_ceil(8)
        } else {
            nelmts
                .checked_mul(esize)
                .ok_or_else(|| CheckError::format(Level::Structure, format!("{what}: too many elements"), addr))?
        };
        let image = ctx.read(addr, prefix + body + 4, Level::Structure, what)?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FADB) {
            return Err(CheckError::format(Level::Structure, format!("{what}: incorrect signature"), addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect version"))
                .at(addr)
                .value(u64::from(version))
        });
        let client = d.u8()?;
        ctx.require(client == self.client, || {
            Complaint::new(Level::Structure, format!("{what}: client id differs from header"))
                .at(addr)
                .value(u64::from(client))
        });
        let owner = d.addr(sizes)?;
        ctx.require(owner == self.address, || {
            Complaint::new(Level::Structure, format!("{what}: header address does not match"))
                .at(addr)
                .value(owner)
        });
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, what) {
            ctx.record(c);
        }

        let mut out = Vec::new();
        if !paged {
            for i in 0..self.num_elements {
                let e = decode_element(&mut d, self.client, self.element_size, sizes, i)?;
                if !is_undef(e.addr) {
                    out.push(e);
                }
            }
            check_elements(ctx, what, addr, &out, chunk_bytes);
            return Ok(out);
        }

        let bitmap = d.bytes(npages.div_ceil(8))?.to_vec();
        let mut page_addr = addr + (prefix + body + 4) as u64;
        for p in 0..npages {
            let first = p as u64 * page;
            let count = page.min(self.num_elements - first) as usize;
            let page_len = count * esize + 4;
            // Bit 7 of byte 0 is page 0.
            if bitmap[p / 8] & (0x80 >> (p % 8)) != 0 {
                match self.load_page(ctx, page_addr, page_len, first, count) {
                    Ok(mut elems) => {
                        check_elements(ctx, "fixed array data block page", page_addr, &elems, chunk_bytes);
                        out.append(&mut elems);
                    }
                    Err(CheckError::Format(c)) => ctx.record(*c),
                    Err(e) => return Err(e),
                }
            }
            page_addr += page_len as u64;
        }
        Ok(out)
    }

    fn load_page(
        &self,
        ctx: &mut FileContext<'_>,
        addr: u64,
        len: usize,
        first: u64,
        count: usize,
    ) -> CheckResult<Vec<ChunkElement>> {
        let what = "fixed array data block page";
        let image = ctx.read(addr, len, Level::Structure, what)?;
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, what) {
            ctx.record(c);
        }
        let mut d = Decoder::new(&image, addr, Level::Structure);
        let mut out = Vec::new();
        for i in 0..count as u64 {
            let e = decode_element(&mut d, self.client, self.element_size, self.sizes, first + i)?;
            if !is_undef(e.addr) {
                out.push(e);
            }
        }
        Ok(out)
    }
}

/// A decoded extensible array header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensibleArray {
    /// Header address.
    pub address: u64,
    /// Client id.
    pub client: u8,
    /// Bytes per element.
    pub element_size: u8,
    /// Bits needed for the largest element count.
    pub max_bits: u8,
    /// Elements stored in the index block.
    pub index_elements: u8,
    /// Minimum elements per data block.
    pub min_elements: u8,
    /// Minimum data block pointers per super block.
    pub min_pointers: u8,
    /// log2 of the elements per data block page.
    pub page_bits: u8,
    /// Secondary blocks allocated.
    pub num_super_blocks: u64,
    /// Bytes of secondary blocks.
    pub super_blocks_size: u64,
    /// Data blocks allocated.
    pub num_data_blocks: u64,
    /// Bytes of data blocks.
    pub data_blocks_size: u64,
    /// Highest element index set, plus one.
    pub max_index_set: u64,
    /// Elements realized.
    pub num_elements: u64,
    /// Index block address.
    pub index_block_addr: u64,
    sizes: Sizes,
}

impl ExtensibleArray {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<ExtensibleArray> {
        let sizes = ctx.sizes();
        let len = 12 + 6 * sizes.len_width() + sizes.addr_width() + 4;
        let image = ctx.read(addr, len, Level::Structure, "extensible array header")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::EAHD) {
            return Err(CheckError::format(Level::Structure, "extensible array header: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "extensible array header: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let ea = ExtensibleArray {
            address: addr,
            client: d.u8()?,
            element_size: d.u8()?,
            max_bits: d.u8()?,
            index_elements: d.u8()?,
            min_elements: d.u8()?,
            min_pointers: d.u8()?,
            page_bits: d.u8()?,
            num_super_blocks: d.length(sizes)?,
            super_blocks_size: d.length(sizes)?,
            num_data_blocks: d.length(sizes)?,
            data_blocks_size: d.length(sizes)?,
            max_index_set: d.length(sizes)?,
            num_elements: d.length(sizes)?,
            index_block_addr: d.addr(sizes)?,
            sizes,
        };
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "extensible array header") {
            ctx.record(c);
        }
        check_client(ctx, "extensible array header", addr, ea.client, ea.element_size, sizes);
        let geometry_ok = ea.max_bits > 0
            && ea.max_bits <= 64
            && ea.min_elements.is_power_of_two()
            && ea.min_pointers.is_power_of_two()
            && ea.min_pointers >= 2
            && u32::from(ea.max_bits) >= log2_of2(u64::from(ea.min_elements));
        if !geometry_ok {
            return Err(Complaint::new(Level::Structure, "extensible array header: invalid block parameters")
                .at(addr)
                .value(u64::from(ea.min_elements))
                .into());
        }
        ctx.require(u32::from(ea.page_bits) <= u32::from(ea.max_bits), || {
            Complaint::new(Level::Structure, "extensible array header: page size exceeds the array")
                .at(addr)
                .value(u64::from(ea.page_bits))
        });
        Ok(ea)
    }

    /// Super blocks in the whole array.
    pub fn num_super_block_slots(&self) -> usize {
        1 + (u32::from(self.max_bits) - log2_of2(u64::from(self.min_elements))) as usize
    }

    /// Data block pointers held directly by the index block.
    pub fn index_data_block_addrs(&self) -> usize {
        2 * (usize::from(self.min_pointers) - 1)
    }

    /// Super block pointers held by the index block.
    pub fn index_super_block_addrs(&self) -> usize {
        let first = 2 * log2_of2(u64::from(self.min_pointers)) as usize;
        self.num_super_block_slots().saturating_sub(first)
    }

    /// Validate the index block; returns the elements it holds directly.
    pub fn index_block(&self, ctx: &mut FileContext<'_>, chunk_bytes: u64) -> CheckResult<Vec<ChunkElement>> {
        if is_undef(self.index_block_addr) {
            return Ok(Vec::new());
        }
        let what = "extensible array index block";
        let addr = self.index_block_addr;
        let sizes = self.sizes;
        let ndblk = self.index_data_block_addrs();
        let nsblk = self.index_super_block_addrs();
        let len = 6
            + sizes.addr_width()
            + usize::from(self.index_elements) * usize::from(self.element_size)
            + (ndblk + nsblk) * sizes.addr_width()
            + 4;
        let image = ctx.read(addr, len, Level::Structure, what)?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::EAIB) {
            return Err(CheckError::format(Level::Structure, format!("{what}: incorrect signature"), addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, format!("{what}: incorrect version"))
                .at(addr)
                .value(u64::from(version))
        });
        let client = d.u8()?;
        ctx.require(client == self.client, || {
            Complaint::new(Level::Structure, format!("{what}: client id differs from header"))
                .at(addr)
                .value(u64::from(client))
        });
        let owner = d.addr(sizes)?;
        ctx.require(owner == self.address, || {
            Complaint::new(Level::Structure, format!("{what}: header address does not match"))
                .at(addr)
                .value(owner)
        });
        let mut out = Vec::new();
        for i in 0..u64::from(self.index_elements) {
            let e = decode_element(&mut d, self.client, self.element_size, sizes, i)?;
            if !is_undef(e.addr) {
                out.push(e);
            }
        }
        for kind in ["data block", "super block"] {
            let n = if kind == "data block" { ndblk } else { nsblk };
            for _ in 0..n {
                let a = d.addr(sizes)?;
                if !is_undef(a) {
                    ctx.require(a < ctx.state.eoa, || {
                        Complaint::new(Level::Structure, format!("{what}: invalid {kind} address"))
                            .at(addr)
                            .value(a)
                    });
                }
            }
        }
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, what) {
            ctx.record(c);
        }
        check_elements(ctx, what, addr, &out, chunk_bytes);
        Ok(out)
    }
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

    fn run<T>(img: Vec<u8>, f: impl FnOnce(&mut FileContext<'_>) -> T) -> (T, Report) {
        let drv = Driver::memory("array", img);
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

    fn fahd(nelmts: u64, page_bits: u8, dblk: u64) -> Vec<u8> {
        let mut v = b"FAHD".to_vec();
        v.extend_from_slice(&[0, CLIENT_CHUNKS, 8, page_bits]);
        v.extend_from_slice(&nelmts.to_le_bytes());
        v.extend_from_slice(&dblk.to_le_bytes());
        sealed(v)
    }

    fn fadb_prefix(header: u64) -> Vec<u8> {
        let mut v = b"FADB".to_vec();
        v.extend_from_slice(&[0, CLIENT_CHUNKS]);
        v.extend_from_slice(&header.to_le_bytes());
        v
    }

    #[test]
    fn fixed_array_unpaged() {
        let mut img = fahd(3, 10, 64);
        img.resize(64, 0);
        let mut db = fadb_prefix(0);
        for a in [512u64, u64::MAX, 1024] {
            db.extend_from_slice(&a.to_le_bytes());
        }
        img.extend_from_slice(&sealed(db));
        img.resize(2048, 0);
        let (out, report) = run(img, |ctx| {
            let fa = FixedArray::load(ctx, 0)?;
            fa.elements(ctx, 256)
        });
        assert!(report.is_clean(), "{:?}", report.complaints());
        let elems = out.unwrap();
        assert_eq!(elems.len(), 2);
        assert_eq!(elems[1].index, 2);
    }

    #[test]
    fn fixed_array_paged_and_out_of_range_chunk() {
        // Five elements, pages of four: two pages, only page 1 initialized.
        let mut img = fahd(5, 2, 64);
        img.resize(64, 0);
        let mut db = fadb_prefix(0);
        db.push(0b0100_0000);
        img.extend_from_slice(&sealed(db));
        let page0_len = 4 * 8 + 4;
        img.extend_from_slice(&vec![0xff; page0_len]);
        img.extend_from_slice(&sealed(4000u64.to_le_bytes().to_vec()));
        img.resize(2048, 0);
        let (out, report) = run(img, |ctx| {
            let fa = FixedArray::load(ctx, 0)?;
            fa.elements(ctx, 256)
        });
        let elems = out.unwrap();
        assert_eq!(elems.len(), 1);
        assert_eq!(elems[0].index, 4);
        assert_eq!(report.total(), 1);
        assert_eq!(report.complaints()[0].bad_value, Some(4000));
    }

    #[test]
    fn wrong_element_size_for_client() {
        let mut img = fahd(0, 10, u64::MAX);
        img[6] = 4;
        let sum = lookup3(&img[..img.len() - 4]);
        let n = img.len();
        img[n - 4..].copy_from_slice(&sum.to_le_bytes());
        let (_, report) = run(img, |ctx| FixedArray::load(ctx, 0).map(|_| ()));
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn extensible_array_counts() {
        let mut v = b"EAHD".to_vec();
        v.extend_from_slice(&[0, CLIENT_CHUNKS, 8, 32, 4, 16, 4, 10]);
        for x in [0u64, 0, 0, 0, 2, 2, 128] {
            v.extend_from_slice(&x.to_le_bytes());
        }
        let mut img = sealed(v);
        img.resize(128, 0);
        let mut ib = b"EAIB".to_vec();
        ib.extend_from_slice(&[0, CLIENT_CHUNKS]);
        ib.extend_from_slice(&0u64.to_le_bytes());
        for a in [1024u64, 1536, u64::MAX, u64::MAX] {
            ib.extend_from_slice(&a.to_le_bytes());
        }
        // 6 data block pointers, 25 super block pointers.
        for _ in 0..(6 + 25) {
            ib.extend_from_slice(&u64::MAX.to_le_bytes());
        }
        img.extend_from_slice(&sealed(ib));
        img.resize(4096, 0);
        let (out, report) = run(img, |ctx| {
            let ea = ExtensibleArray::load(ctx, 0)?;
            assert_eq!(ea.num_super_block_slots(), 29);
            assert_eq!(ea.index_data_block_addrs(), 6);
            assert_eq!(ea.index_super_block_addrs(), 25);
            ea.index_block(ctx, 512)
        });
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(out.unwrap().len(), 2);
    }
}
