//! Free-space managers: the `FSHD` header and its `FSSE` section list.
//!
//! Managers belong either to a fractal heap (sections are heap-space
//! offsets) or to the file (sections are file addresses, listed by the
//! File Space Info message).

use crate::checksum::verify_trailing;
use crate::decode::{limit_enc_size, Decoder};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::signature::{magic, matches};

/// Client id of fractal heap managers.
pub const CLIENT_FRACTAL_HEAP: u8 = 0;
/// Client id of file-space managers.
pub const CLIENT_FILE: u8 = 1;

/// Fractal heap section classes whose sections carry an indirect-block
/// locator.
const HEAP_SECT_FIRST_ROW: u8 = 1;
const HEAP_SECT_INDIRECT: u8 = 3;

/// Who owns a free-space manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpaceOwner {
    /// A fractal heap's managed space.
    FractalHeap {
        /// Heap header address.
        heap_addr: u64,
        /// Size of the heap's managed space.
        managed_space: u64,
        /// Width of heap offsets.
        heap_off_size: usize,
    },
    /// The file itself.
    File,
}

impl FreeSpaceOwner {
    fn client(self) -> u8 {
        match self {
            FreeSpaceOwner::FractalHeap { .. } => CLIENT_FRACTAL_HEAP,
            FreeSpaceOwner::File => CLIENT_FILE,
        }
    }

    /// Serialized payload size of a section of class `class`.
    fn payload_size(self, class: u8) -> usize {
        match self {
            FreeSpaceOwner::FractalHeap { heap_off_size, .. }
                if class == HEAP_SECT_FIRST_ROW || class == HEAP_SECT_INDIRECT =>
            {
                heap_off_size + 2 + 2 + 2
            }
            _ => 0,
        }
    }
}

/// One free section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSection {
    /// Offset (heap space or file address).
    pub offset: u64,
    /// Size.
    pub size: u64,
    /// Section class.
    pub class: u8,
}

/// A decoded free-space manager header.
#[derive(Debug, Clone)]
pub struct FreeSpaceHeader {
    /// Header address.
    pub address: u64,
    /// Client id.
    pub client: u8,
    /// Total space tracked.
    pub total_space: u64,
    /// Total sections.
    pub total_sections: u64,
    /// Serialized sections.
    pub serial_sections: u64,
    /// Ghost sections.
    pub ghost_sections: u64,
    /// Number of section classes.
    pub num_classes: u16,
    /// Shrink percent.
    pub shrink_percent: u16,
    /// Expand percent.
    pub expand_percent: u16,
    /// Bits in the address space.
    pub addr_bits: u16,
    /// Largest section size.
    pub max_section_size: u64,
    /// Section list address.
    pub list_addr: u64,
    /// Used size of the section list.
    pub list_size: u64,
    /// Allocated size of the section list.
    pub list_alloc: u64,
}

impl FreeSpaceHeader {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64, owner: FreeSpaceOwner) -> CheckResult<FreeSpaceHeader> {
        let sizes = ctx.sizes();
        let len = 4 + 1 + 1 + 4 * sizes.len_width() + 2 * 4 + sizes.len_width() + sizes.addr_width()
            + 2 * sizes.len_width()
            + 4;
        let image = ctx.read(addr, len, Level::Structure, "free-space header")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FSHD) {
            return Err(CheckError::format(Level::Structure, "free-space header: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "free-space header: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let hdr = FreeSpaceHeader {
            address: addr,
            client: d.u8()?,
            total_space: d.length(sizes)?,
            total_sections: d.length(sizes)?,
            serial_sections: d.length(sizes)?,
            ghost_sections: d.length(sizes)?,
            num_classes: d.u16()?,
            shrink_percent: d.u16()?,
            expand_percent: d.u16()?,
            addr_bits: d.u16()?,
            max_section_size: d.length(sizes)?,
            list_addr: d.addr(sizes)?,
            list_size: d.length(sizes)?,
            list_alloc: d.length(sizes)?,
        };
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "free-space header") {
            ctx.record(c);
        }

        ctx.require(hdr.client == owner.client(), || {
            Complaint::new(Level::Structure, "free-space header: client does not match the owner")
                .at(addr)
                .value(u64::from(hdr.client))
        });
        ctx.require(
            hdr.serial_sections.checked_add(hdr.ghost_sections) == Some(hdr.total_sections),
            || {
                Complaint::new(
                    Level::Structure,
                    "free-space header: serialized and ghost sections do not add up to the total",
                )
                .at(addr)
                .value(hdr.total_sections)
            },
        );
        ctx.require(hdr.total_sections == 0 || hdr.num_classes > 0, || {
            Complaint::new(Level::Structure, "free-space header: sections without section classes").at(addr)
        });
        ctx.require(hdr.addr_bits > 0 && hdr.addr_bits <= 64, || {
            Complaint::new(Level::Structure, "free-space header: invalid address space size")
                .at(addr)
                .value(u64::from(hdr.addr_bits))
        });
        ctx.require(hdr.list_alloc >= hdr.list_size, || {
            Complaint::new(Level::Structure, "free-space header: section list larger than its allocation")
                .at(addr)
                .value(hdr.list_size)
        });
        if hdr.serial_sections > 0 {
            ctx.require(ctx.state.addr_valid(hdr.list_addr), || {
                Complaint::new(Level::Structure, "free-space header: invalid section list address")
                    .at(addr)
                    .value(hdr.list_addr)
            });
        }
        Ok(hdr)
    }

    /// Decode and validate the section list, returning its sections.
    pub fn load_sections(&self, ctx: &mut FileContext<'_>, owner: FreeSpaceOwner) -> CheckResult<Vec<FreeSection>> {
        if self.serial_sections == 0 || !ctx.state.addr_valid(self.list_addr) {
            return Ok(Vec::new());
        }
        let sizes = ctx.sizes();
        let addr = self.list_addr;
        let len = usize::try_from(self.list_size)
            .ok()
            .filter(|&n| n >= 4 + 1 + sizes.addr_width() + 4)
            .ok_or_else(|| CheckError::format(Level::Structure, "free-space section list: invalid size", addr))?;
        let image = ctx.read(addr, len, Level::Structure, "free-space section list")?;
        let mut d = Decoder::new(&image, addr, Level::Structure);
        if !matches(d.bytes(4)?, magic::FSSE) {
            return Err(CheckError::format(Level::Structure, "free-space section list: incorrect signature", addr));
        }
        let version = d.u8()?;
        ctx.require(version == 0, || {
            Complaint::new(Level::Structure, "free-space section list: incorrect version")
                .at(addr)
                .value(u64::from(version))
        });
        let owner_addr = d.addr(sizes)?;
        ctx.require(owner_addr == self.address, || {
            Complaint::new(Level::Structure, "free-space section list: header address does not match")
                .at(addr)
                .value(owner_addr)
        });
        if let Some(c) = verify_trailing(&image, addr, Level::Structure, "free-space section list") {
            ctx.record(c);
        }

        let count_width = limit_enc_size(self.serial_sections);
        let size_width = limit_enc_size(self.max_section_size);
        let off_width = usize::from(self.addr_bits).div_ceil(8).max(1);
        let space_end = if self.addr_bits >= 64 {
            u64::MAX
        } else {
            1u64 << self.addr_bits
        };
        let end = len - 4;
        let mut sections = Vec::new();
        let mut tracked = 0u64;
        while d.position() < end {
            let count = d.uint(count_width)?;
            let size = d.uint(size_width)?;
            if count == 0 {
                ctx.record(Complaint::new(Level::Structure, "free-space section list: empty size bin").at(d.address()));
            }
            for _ in 0..count {
                let at = d.address();
                let offset = d.uint(off_width)?;
                let class = d.u8()?;
                if u16::from(class) >= self.num_classes {
                    ctx.record(
                        Complaint::new(Level::Structure, "free-space section: invalid section class")
                            .at(at)
                            .value(u64::from(class)),
                    );
                }
                d.skip(owner.payload_size(class))?;
                self.check_extent(ctx, owner, at, offset, size, space_end);
                tracked = tracked.saturating_add(size);
                sections.push(FreeSection { offset, size, class });
            }
            if d.position() > end {
                return Err(CheckError::format(
                    Level::Structure,
                    "free-space section list: sections overrun the checksum",
                    addr,
                ));
            }
        }
        ctx.require(sections.len() as u64 == self.serial_sections, || {
            Complaint::new(
                Level::Structure,
                format!(
                    "free-space section list: {} sections found, header declares {}",
                    sections.len(),
                    self.serial_sections
                ),
            )
            .at(addr)
            .value(self.serial_sections)
        });
        ctx.require(tracked <= self.total_space, || {
            Complaint::new(Level::Structure, "free-space section list: sections exceed the tracked space")
                .at(addr)
                .value(tracked)
        });
        tracing::debug!(addr, sections = sections.len(), "validated free-space sections");
        Ok(sections)
    }

    fn check_extent(
        &self,
        ctx: &mut FileContext<'_>,
        owner: FreeSpaceOwner,
        at: u64,
        offset: u64,
        size: u64,
        space_end: u64,
    ) {
        let end = offset.checked_add(size);
        let limit = match owner {
            FreeSpaceOwner::FractalHeap { managed_space, .. } => managed_space.min(space_end),
            FreeSpaceOwner::File => ctx.state.eoa.min(space_end),
        };
        ctx.require(end.is_some_and(|e| e <= limit), || {
            Complaint::new(Level::Structure, "free-space section: extends beyond the managed space")
                .at(at)
                .value(offset)
        });
    }
}

/// Validate the manager at `addr` and its sections.
pub fn validate(ctx: &mut FileContext<'_>, addr: u64, owner: FreeSpaceOwner) -> CheckResult<Vec<FreeSection>> {
    let hdr = FreeSpaceHeader::load(ctx, addr, owner)?;
    let sections = hdr.load_sections(ctx, owner)?;
    ctx.report.flush();
    Ok(sections)
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

    fn header(client: u8, serial: u64, total_space: u64, list_addr: u64, list_size: u64) -> Vec<u8> {
        let mut v = b"FSHD".to_vec();
        v.push(0);
        v.push(client);
        for x in [total_space, serial, serial, 0] {
            v.extend_from_slice(&x.to_le_bytes());
        }
        for x in [3u16, 80, 120, 32] {
            v.extend_from_slice(&x.to_le_bytes());
        }
        v.extend_from_slice(&4096u64.to_le_bytes());
        v.extend_from_slice(&list_addr.to_le_bytes());
        v.extend_from_slice(&list_size.to_le_bytes());
        v.extend_from_slice(&list_size.to_le_bytes());
        sealed(v)
    }

    /// Sections of one size bin; offsets are 4 bytes wide for 32-bit space.
    fn section_list(owner: u64, size: u16, offsets: &[(u32, u8)]) -> Vec<u8> {
        let mut v = b"FSSE".to_vec();
        v.push(0);
        v.extend_from_slice(&owner.to_le_bytes());
        v.push(offsets.len() as u8);
        v.extend_from_slice(&size.to_le_bytes());
        for (off, class) in offsets {
            v.extend_from_slice(&off.to_le_bytes());
            v.push(*class);
        }
        sealed(v)
    }

    fn run(img: Vec<u8>, owner: FreeSpaceOwner) -> (CheckResult<Vec<FreeSection>>, Report) {
        let drv = Driver::memory("fs", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        let mut report = Report::default();
        let mut ctx = FileContext {
            driver: &drv,
            state: &st,
            report: &mut report,
            compat: CompatLevel::V18,
        };
        let out = validate(&mut ctx, 0, owner);
        (out, report)
    }

    fn image(client: u8, serial: u64, sections: &[(u32, u8)]) -> Vec<u8> {
        let list = section_list(0, 256, sections);
        let mut img = header(client, serial, 1024, 128, list.len() as u64);
        img.resize(128, 0);
        img.extend_from_slice(&list);
        img.resize(2048, 0);
        img
    }

    #[test]
    fn file_sections_validate() {
        let (out, report) = run(image(CLIENT_FILE, 2, &[(512, 0), (1024, 1)]), FreeSpaceOwner::File);
        assert!(report.is_clean(), "{:?}", report.complaints());
        let sections = out.unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1], FreeSection { offset: 1024, size: 256, class: 1 });
    }

    #[test]
    fn client_mismatch_and_bad_class() {
        let owner = FreeSpaceOwner::FractalHeap {
            heap_addr: 0x40,
            managed_space: 1 << 20,
            heap_off_size: 4,
        };
        let (_, report) = run(image(CLIENT_FILE, 1, &[(512, 0)]), owner);
        assert_eq!(report.total(), 1);
        let (_, report) = run(image(CLIENT_FILE, 1, &[(512, 7)]), FreeSpaceOwner::File);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn section_beyond_eoa() {
        let (_, report) = run(image(CLIENT_FILE, 1, &[(1900, 0)]), FreeSpaceOwner::File);
        assert!(report.complaints()[0].description.contains("beyond"));
    }

    #[test]
    fn count_mismatch() {
        let (_, report) = run(image(CLIENT_FILE, 3, &[(512, 0), (800, 0)]), FreeSpaceOwner::File);
        assert_eq!(report.total(), 1);
    }
}
