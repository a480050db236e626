//! Superblock decoding and validation, versions 0 through 3.

use h5check_io::Driver;

use crate::checksum::verify_trailing;
use crate::decode::{is_undef, Decoder, Sizes, UNDEF_ADDR};
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::MAX_K;
use crate::options::CompatLevel;
use crate::report::Report;
use crate::signature::{self, HDF5_SIGNATURE};
use crate::symbol_table::{ScratchPad, SymbolTableEntry};

/// Bytes of a v0 superblock before the variable-width fields.
const V0_FIXED: usize = 24;
/// Bytes of a v1 superblock before the variable-width fields.
const V1_FIXED: usize = 28;
/// Bytes of a v2/v3 superblock before the variable-width fields.
const V2_FIXED: usize = 12;
/// Consistency flag bits allowed in a v3 superblock.
const V3_FLAGS: u8 = 0x05;

/// Decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Physical offset of the signature.
    pub signature_offset: u64,
    /// Superblock version (0–3).
    pub version: u8,
    /// Offset and length widths.
    pub sizes: Sizes,
    /// Group leaf node K (v0/v1).
    pub sym_leaf_k: Option<u16>,
    /// Group internal node K (v0/v1).
    pub group_internal_k: Option<u16>,
    /// Indexed storage internal node K (v1).
    pub istore_k: Option<u16>,
    /// File consistency flags.
    pub consistency_flags: u32,
    /// Base address.
    pub base_addr: u64,
    /// Superblock extension address (the free-space address field in v0/v1).
    pub ext_addr: u64,
    /// End of allocated space.
    pub eoa: u64,
    /// Driver information block address (v0/v1).
    pub driver_addr: u64,
    /// Root group symbol table entry (v0/v1).
    pub root_entry: Option<SymbolTableEntry>,
    /// Root group object header address.
    pub root_addr: u64,
    /// Encoded size in bytes.
    pub size: usize,
}

impl Superblock {
    /// Locate, decode and validate the superblock.
    ///
    /// Non-fatal problems are recorded in `report`. An unsupported version
    /// or an invalid offset/length width aborts with a single level-0
    /// complaint, since nothing after it can be located.
    pub fn load(driver: &Driver, report: &mut Report, compat: CompatLevel) -> CheckResult<Superblock> {
        let sig_off = signature::locate(driver)?;
        let read = |off: u64, len: usize| -> CheckResult<Vec<u8>> {
            if sig_off.saturating_add(off).saturating_add(len as u64) > driver.physical_eof() {
                return Err(CheckError::format(
                    Level::Superblock,
                    "superblock: file is too short to hold the superblock",
                    0,
                ));
            }
            Ok(driver.read(sig_off + off - driver.base(), len)?)
        };

        let head = read(0, 9)?;
        debug_assert_eq!(head[..8], HDF5_SIGNATURE);
        let version = head[8];
        tracing::info!(version, offset = sig_off, "validating superblock");
        match version {
            0 | 1 => Self::load_v0v1(version, sig_off, &read, report, compat),
            2 | 3 => Self::load_v2v3(version, sig_off, &read, report, compat),
            v => Err(Complaint::new(Level::Superblock, "superblock: invalid version")
                .at(0)
                .value(u64::from(v))
                .into()),
        }
    }

    fn check_widths(sizes: Sizes) -> CheckResult<()> {
        if !Sizes::is_valid_width(sizes.offset) {
            return Err(Complaint::new(Level::Superblock, "superblock: invalid offset size")
                .at(0)
                .value(u64::from(sizes.offset))
                .into());
        }
        if !Sizes::is_valid_width(sizes.length) {
            return Err(Complaint::new(Level::Superblock, "superblock: invalid length size")
                .at(0)
                .value(u64::from(sizes.length))
                .into());
        }
        Ok(())
    }

    fn load_v0v1(
        version: u8,
        sig_off: u64,
        read: &dyn Fn(u64, usize) -> CheckResult<Vec<u8>>,
        report: &mut Report,
        compat: CompatLevel,
    ) -> CheckResult<Superblock> {
        let fixed = if version == 0 { V0_FIXED } else { V1_FIXED };
        let head = read(0, fixed)?;
        let mut d = Decoder::new(&head, 0, Level::Superblock);
        d.skip(9)?;
        let sub_versions = [
            ("free-space", d.u8()?),
            ("root group symbol table entry", d.u8()?),
        ];
        d.skip(1)?;
        let shared_header = d.u8()?;
        let sizes = Sizes::new(d.u8()?, d.u8()?);
        Self::check_widths(sizes)?;
        d.skip(1)?;
        let leaf_k = d.u16()?;
        let internal_k = d.u16()?;
        let flags = d.u32()?;
        let (istore_k, reserved) = if version == 1 {
            (Some(d.u16()?), d.u16()?)
        } else {
            (None, 0)
        };

        for (what, v) in sub_versions.into_iter().chain([("shared header message", shared_header)]) {
            if v != 0 {
                report.record(
                    Complaint::new(Level::Superblock, format!("superblock: invalid {what} version"))
                        .at(0)
                        .value(u64::from(v)),
                );
            }
        }
        if leaf_k == 0 || leaf_k > MAX_K {
            report.record(
                Complaint::new(Level::Superblock, "superblock: invalid group leaf node K")
                    .at(0)
                    .value(u64::from(leaf_k)),
            );
        }
        if internal_k == 0 || internal_k > MAX_K {
            report.record(
                Complaint::new(Level::Superblock, "superblock: invalid group internal node K")
                    .at(0)
                    .value(u64::from(internal_k)),
            );
        }
        if flags != 0 {
            report.record(
                Complaint::new(Level::Superblock, "superblock: invalid file consistency flags")
                    .at(0)
                    .value(u64::from(flags)),
            );
        }
        if let Some(k) = istore_k.filter(|&k| k == 0 || k > MAX_K) {
            report.record(
                Complaint::new(Level::Superblock, "superblock: invalid indexed storage internal node K")
                    .at(0)
                    .value(u64::from(k)),
            );
        }
        if reserved != 0 {
            report.record(
                Complaint::new(Level::Superblock, "superblock: reserved field is not zero")
                    .at(0)
                    .value(u64::from(reserved)),
            );
        }

        let var_len = 4 * sizes.addr_width() + SymbolTableEntry::size(sizes);
        let tail = read(fixed as u64, var_len)?;
        let mut d = Decoder::new(&tail, fixed as u64, Level::Superblock);
        let base_addr = d.addr(sizes)?;
        let ext_addr = d.addr(sizes)?;
        let eoa = d.addr(sizes)?;
        let driver_addr = d.addr(sizes)?;
        let mut notes = Vec::new();
        let root_entry = SymbolTableEntry::decode(&mut d, sizes, Level::Superblock, &mut notes)?;
        report.extend(notes);

        let sb = Superblock {
            signature_offset: sig_off,
            version,
            sizes,
            sym_leaf_k: Some(leaf_k),
            group_internal_k: Some(internal_k),
            istore_k,
            consistency_flags: flags,
            base_addr,
            ext_addr,
            eoa,
            driver_addr,
            root_entry: Some(root_entry),
            root_addr: root_entry.header_addr,
            size: fixed + var_len,
        };
        sb.check_addresses(report, compat);
        if let ScratchPad::SoftLink { .. } = root_entry.cache {
            report.record(
                Complaint::new(Level::Superblock, "superblock: root group entry is cached as a soft link")
                    .at(0),
            );
        }
        Ok(sb)
    }

    fn load_v2v3(
        version: u8,
        sig_off: u64,
        read: &dyn Fn(u64, usize) -> CheckResult<Vec<u8>>,
        report: &mut Report,
        compat: CompatLevel,
    ) -> CheckResult<Superblock> {
        let head = read(0, V2_FIXED)?;
        let mut d = Decoder::new(&head, 0, Level::Superblock);
        d.skip(9)?;
        let sizes = Sizes::new(d.u8()?, d.u8()?);
        Self::check_widths(sizes)?;
        let flags = d.u8()?;

        let size = V2_FIXED + 4 * sizes.addr_width() + 4;
        let image = read(0, size)?;
        let mut d = Decoder::new(&image, 0, Level::Superblock);
        d.seek(V2_FIXED)?;
        let base_addr = d.addr(sizes)?;
        let ext_addr = d.addr(sizes)?;
        let eoa = d.addr(sizes)?;
        let root_addr = d.addr(sizes)?;

        if compat == CompatLevel::V16 {
            report.record(
                Complaint::new(
                    Level::Superblock,
                    format!("superblock: version {version} is not part of the 1.6 format"),
                )
                .at(0)
                .value(u64::from(version)),
            );
        }
        let allowed = if version == 2 { 0 } else { V3_FLAGS };
        if flags & !allowed != 0 {
            report.record(
                Complaint::new(Level::Superblock, "superblock: invalid file consistency flags")
                    .at(0)
                    .value(u64::from(flags)),
            );
        }
        if let Some(c) = verify_trailing(&image, 0, Level::Superblock, "superblock") {
            report.record(c);
        }

        let sb = Superblock {
            signature_offset: sig_off,
            version,
            sizes,
            sym_leaf_k: None,
            group_internal_k: None,
            istore_k: None,
            consistency_flags: u32::from(flags),
            base_addr,
            ext_addr,
            eoa,
            driver_addr: UNDEF_ADDR,
            root_entry: None,
            root_addr,
            size,
        };
        sb.check_addresses(report, compat);
        Ok(sb)
    }

    fn check_addresses(&self, report: &mut Report, compat: CompatLevel) {
        let complain = |report: &mut Report, what: &str, value: u64| {
            report.record(
                Complaint::new(Level::Superblock, format!("superblock: {what}"))
                    .at(0)
                    .value(value),
            );
        };
        if is_undef(self.base_addr) {
            complain(report, "undefined base address", self.base_addr);
        } else if self.base_addr != self.signature_offset {
            complain(
                report,
                "base address does not match the location of the signature",
                self.base_addr,
            );
        }
        if is_undef(self.eoa) {
            complain(report, "undefined end of file address", self.eoa);
        }
        let in_range = |a: u64| is_undef(a) || a < self.eoa;
        if !in_range(self.ext_addr) {
            complain(report, "invalid superblock extension address", self.ext_addr);
        } else if self.version < 2 && !is_undef(self.ext_addr) && compat == CompatLevel::V16 {
            complain(
                report,
                "free-space address must be undefined in the 1.6 format",
                self.ext_addr,
            );
        }
        if !in_range(self.driver_addr) {
            complain(report, "invalid driver information block address", self.driver_addr);
        }
        if is_undef(self.root_addr) || self.root_addr >= self.eoa {
            complain(report, "invalid root group object header address", self.root_addr);
        }
    }
}

/// Decoded driver information block (superblock v0/v1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoBlock {
    /// Block address.
    pub address: u64,
    /// Block version.
    pub version: u8,
    /// Eight-character driver identifier.
    pub driver_id: String,
    /// Driver-specific body.
    pub info: Vec<u8>,
}

impl DriverInfoBlock {
    /// Decode the block at logical address `addr`.
    pub fn load(driver: &Driver, addr: u64, eoa: u64, report: &mut Report) -> CheckResult<Self> {
        let bad = |what: &str| CheckError::format(Level::Superblock, format!("driver information block: {what}"), addr);
        if addr.saturating_add(16) > eoa || addr.saturating_add(16) > driver.eof() {
            return Err(bad("block extends beyond the end of file"));
        }
        let head = driver.read(addr, 16)?;
        let mut d = Decoder::new(&head, addr, Level::Superblock);
        let version = d.u8()?;
        if version != 0 {
            report.record(
                Complaint::new(Level::Superblock, "driver information block: invalid version")
                    .at(addr)
                    .value(u64::from(version)),
            );
        }
        d.skip(3)?;
        let size = d.u32()?;
        let id = d.bytes(8)?;
        let driver_id = String::from_utf8_lossy(id).into_owned();
        let body_end = addr.saturating_add(16).saturating_add(u64::from(size));
        if body_end > eoa || body_end > driver.eof() {
            return Err(Complaint::new(
                Level::Superblock,
                "driver information block: size extends beyond the end of file",
            )
            .at(addr)
            .value(u64::from(size))
            .into());
        }
        let info = driver.read(addr + 16, size as usize)?;
        Ok(Self {
            address: addr,
            version,
            driver_id,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::lookup3;

    fn v0_image(offset_size: u8) -> Vec<u8> {
        let mut b = HDF5_SIGNATURE.to_vec();
        b.extend_from_slice(&[0, 0, 0, 0, 0, offset_size, 8, 0]);
        b.extend_from_slice(&4u16.to_le_bytes());
        b.extend_from_slice(&16u16.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes()); // base
        b.extend_from_slice(&u64::MAX.to_le_bytes()); // free-space / extension
        b.extend_from_slice(&256u64.to_le_bytes()); // eoa
        b.extend_from_slice(&u64::MAX.to_le_bytes()); // driver
        b.extend_from_slice(&0u64.to_le_bytes()); // root name offset
        b.extend_from_slice(&96u64.to_le_bytes()); // root header
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&[0u8; 16]);
        b.resize(256, 0);
        b
    }

    fn v2_image(version: u8, flags: u8) -> Vec<u8> {
        let mut b = HDF5_SIGNATURE.to_vec();
        b.extend_from_slice(&[version, 8, 8, flags]);
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&u64::MAX.to_le_bytes());
        b.extend_from_slice(&128u64.to_le_bytes());
        b.extend_from_slice(&48u64.to_le_bytes());
        let cs = lookup3(&b);
        b.extend_from_slice(&cs.to_le_bytes());
        b.resize(128, 0);
        b
    }

    #[test]
    fn minimal_v0() {
        let drv = Driver::memory("sb", v0_image(8));
        let mut report = Report::default();
        let sb = Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(sb.version, 0);
        assert_eq!(sb.sizes, Sizes::new(8, 8));
        assert_eq!(sb.root_addr, 96);
        assert_eq!(sb.eoa, 256);
        assert_eq!(sb.size, 24 + 32 + 40);
    }

    #[test]
    fn group_k_beyond_node_capacity() {
        let mut img = v0_image(8);
        img[16..18].copy_from_slice(&40_000u16.to_le_bytes());
        let drv = Driver::memory("sb", img);
        let mut report = Report::default();
        let sb = Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap();
        assert_eq!(sb.sym_leaf_k, Some(40_000));
        assert_eq!(report.total(), 1);
        let c = &report.complaints()[0];
        assert!(c.description.contains("leaf node K"));
        assert_eq!(c.bad_value, Some(40_000));
    }

    #[test]
    fn invalid_offset_size_aborts() {
        let drv = Driver::memory("sb", v0_image(3));
        let mut report = Report::default();
        let err = Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap_err();
        match err {
            CheckError::Format(c) => {
                assert_eq!(c.level, Level::Superblock);
                assert!(c.description.contains("offset size"));
                assert_eq!(c.bad_value, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(report.is_clean());
    }

    #[test]
    fn v2_checksum_and_flags() {
        let drv = Driver::memory("sb", v2_image(2, 0));
        let mut report = Report::default();
        let sb = Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(sb.root_addr, 48);

        let mut img = v2_image(3, 0x05);
        let drv = Driver::memory("sb", img.clone());
        let mut report = Report::default();
        Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap();
        assert!(report.is_clean());

        img[11] ^= 0x01;
        let drv = Driver::memory("sb", img);
        let mut report = Report::default();
        Superblock::load(&drv, &mut report, CompatLevel::V18).unwrap();
        assert_eq!(report.total(), 1);
        assert!(report.complaints()[0].description.contains("checksum"));
    }

    #[test]
    fn v2_rejected_under_1_6() {
        let drv = Driver::memory("sb", v2_image(2, 0));
        let mut report = Report::default();
        Superblock::load(&drv, &mut report, CompatLevel::V16).unwrap();
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn bad_version() {
        let mut img = v0_image(8);
        img[8] = 9;
        let drv = Driver::memory("sb", img);
        let mut report = Report::default();
        assert!(Superblock::load(&drv, &mut report, CompatLevel::V18).is_err());
    }

    #[test]
    fn driver_info_block() {
        let mut img = vec![0u8; 64];
        img[0] = 0;
        img[4..8].copy_from_slice(&8u32.to_le_bytes());
        img[8..16].copy_from_slice(b"NCSAfami");
        img[16..24].copy_from_slice(&1024u64.to_le_bytes());
        let drv = Driver::memory("drv", img);
        let mut report = Report::default();
        let blk = DriverInfoBlock::load(&drv, 0, 64, &mut report).unwrap();
        assert_eq!(blk.driver_id, "NCSAfami");
        assert_eq!(blk.info, 1024u64.to_le_bytes().to_vec());
        assert!(DriverInfoBlock::load(&drv, 56, 64, &mut report).is_err());
    }
}
