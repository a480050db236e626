//! File-level messages found in the superblock extension: shared message
//! table (0x0F), B-tree K values (0x13), driver info (0x14) and file space
//! info (0x17).

use super::MessageContext;
use crate::error::CheckResult;
use crate::file_state::MAX_K;

/// Maximum number of shared message indexes.
pub const MAX_SOHM_INDEXES: u8 = 8;

/// Pointer to the shared object header message table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SohmTableMessage {
    /// `SMTB` address.
    pub table_addr: u64,
    /// Number of indexes in the table.
    pub num_indexes: u8,
}

impl SohmTableMessage {
    /// Decode a shared message table payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("shared message table", raw_version, 0..=0);
        let table_addr = d.addr(ctx.sizes)?;
        let num_indexes = d.u8()?;
        if num_indexes == 0 || num_indexes > MAX_SOHM_INDEXES {
            ctx.complain_value("shared message table: invalid number of indexes", u64::from(num_indexes));
        }
        Ok(Self {
            table_addr,
            num_indexes: num_indexes.min(MAX_SOHM_INDEXES),
        })
    }
}

/// Non-default B-tree K values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeKValues {
    /// Chunked dataset internal node K.
    pub istore_k: u16,
    /// Group internal node K.
    pub group_internal_k: u16,
    /// Group leaf node K.
    pub group_leaf_k: u16,
}

impl BTreeKValues {
    /// Decode a B-tree K values payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("B-tree 'K' values", raw_version, 0..=0);
        let k = Self {
            istore_k: d.u16()?,
            group_internal_k: d.u16()?,
            group_leaf_k: d.u16()?,
        };
        for (what, v) in [
            ("indexed storage internal", k.istore_k),
            ("group internal", k.group_internal_k),
            ("group leaf", k.group_leaf_k),
        ] {
            if v == 0 {
                ctx.complain(format!("B-tree 'K' values: {what} K is zero"));
            } else if v > MAX_K {
                ctx.complain_value(format!("B-tree 'K' values: {what} K exceeds {MAX_K}"), u64::from(v));
            }
        }
        Ok(k)
    }
}

/// Driver information stored in the superblock extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoMessage {
    /// Eight-character driver id.
    pub driver_id: [u8; 8],
    /// Driver-specific data.
    pub info: Vec<u8>,
}

impl DriverInfoMessage {
    /// Decode a driver info payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("driver info", raw_version, 0..=0);
        let mut driver_id = [0u8; 8];
        driver_id.copy_from_slice(d.bytes(8)?);
        let size = d.u16()?;
        let info = d.bytes(usize::from(size))?.to_vec();
        Ok(Self { driver_id, info })
    }

    /// Driver id as text.
    pub fn id(&self) -> String {
        String::from_utf8_lossy(&self.driver_id).into_owned()
    }
}

/// Number of persistent free-space managers listed in a v0 message.
const FS_MANAGERS_V0: usize = 6;
/// Number listed in a v1 message (small and large sections).
const FS_MANAGERS_V1: usize = 12;
/// Strategy under which free-space managers persist (v0).
const STRATEGY_ALL_PERSIST: u8 = 1;

/// File space handling strategy and persistent free-space managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpaceInfo {
    /// Encoding version.
    pub version: u8,
    /// Strategy.
    pub strategy: u8,
    /// Free-space section threshold.
    pub threshold: u64,
    /// Page size (v1).
    pub page_size: Option<u64>,
    /// Addresses of persistent free-space manager headers; undefined
    /// entries are omitted.
    pub managers: Vec<u64>,
}

impl FileSpaceInfo {
    /// Decode a file space info payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("file space info", raw_version, 0..=1);
        let strategy = d.u8()?;
        if strategy > 3 {
            ctx.complain_value("file space info: invalid strategy", u64::from(strategy));
        }
        let (persist, threshold, page_size, count) = if version == 0 {
            let threshold = d.length(ctx.sizes)?;
            (strategy == STRATEGY_ALL_PERSIST, threshold, None, FS_MANAGERS_V0)
        } else {
            let persist = d.u8()?;
            if persist > 1 {
                ctx.complain_value("file space info: invalid persist flag", u64::from(persist));
            }
            let threshold = d.length(ctx.sizes)?;
            let page_size = d.length(ctx.sizes)?;
            d.skip(2)?;
            d.length(ctx.sizes)?;
            (persist != 0, threshold, Some(page_size), FS_MANAGERS_V1)
        };
        let mut managers = Vec::new();
        if persist {
            for _ in 0..count {
                let addr = d.addr(ctx.sizes)?;
                if !crate::decode::is_undef(addr) {
                    managers.push(addr);
                }
            }
        }
        Ok(Self {
            version,
            strategy,
            threshold,
            page_size,
            managers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Sizes;
    use crate::options::CompatLevel;

    fn ctx() -> MessageContext {
        MessageContext::new(Sizes::default(), CompatLevel::V18, 0)
    }

    #[test]
    fn sohm_index_count() {
        let mut c = ctx();
        let mut p = vec![0];
        p.extend_from_slice(&0x60u64.to_le_bytes());
        p.push(9);
        let m = SohmTableMessage::decode(&p, &mut c).unwrap();
        assert_eq!(m.num_indexes, 8);
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn zero_k_values() {
        let mut c = ctx();
        let k = BTreeKValues::decode(&[0, 32, 0, 0, 0, 4, 0], &mut c).unwrap();
        assert_eq!(k.istore_k, 32);
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn oversized_k_values() {
        let mut c = ctx();
        let k = BTreeKValues::decode(&[0, 0x40, 0x9c, 16, 0, 4, 0], &mut c).unwrap();
        assert_eq!(k.istore_k, 40_000);
        assert_eq!(c.complaints.len(), 1);
        assert_eq!(c.complaints[0].bad_value, Some(40_000));
    }

    #[test]
    fn driver_info() {
        let mut c = ctx();
        let mut p = vec![0];
        p.extend_from_slice(b"NCSAfami");
        p.extend_from_slice(&8u16.to_le_bytes());
        p.extend_from_slice(&1024u64.to_le_bytes());
        let m = DriverInfoMessage::decode(&p, &mut c).unwrap();
        assert_eq!(m.id(), "NCSAfami");
        assert_eq!(m.info.len(), 8);
    }

    #[test]
    fn fs_info_v0_persist() {
        let mut c = ctx();
        let mut p = vec![0, STRATEGY_ALL_PERSIST];
        p.extend_from_slice(&1u64.to_le_bytes());
        for i in 0..6u64 {
            let a = if i == 2 { 0x2000 } else { u64::MAX };
            p.extend_from_slice(&a.to_le_bytes());
        }
        let m = FileSpaceInfo::decode(&p, &mut c).unwrap();
        assert_eq!(m.managers, vec![0x2000]);
        assert!(c.complaints.is_empty());
    }
}
