//! Group-related messages: link info (0x02), group info (0x0A), symbol
//! table (0x11) and attribute info (0x15).

use super::MessageContext;
use crate::error::CheckResult;

const TRACK_CREATION_ORDER: u8 = 0x01;
const INDEX_CREATION_ORDER: u8 = 0x02;

/// Where a new-style group keeps its dense links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Flags: bit 0 creation order tracked, bit 1 indexed.
    pub flags: u8,
    /// Maximum creation index, when tracked.
    pub max_creation_index: Option<u64>,
    /// Fractal heap holding link messages.
    pub heap_addr: u64,
    /// B-tree v2 indexing links by name (record kind 5).
    pub name_index_addr: u64,
    /// B-tree v2 indexing links by creation order (record kind 6).
    pub order_index_addr: Option<u64>,
}

impl LinkInfo {
    /// Decode a link info payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("link info", raw_version, 0..=0);
        let flags = d.u8()?;
        if flags & !(TRACK_CREATION_ORDER | INDEX_CREATION_ORDER) != 0 {
            ctx.complain_value("link info: unknown flags", u64::from(flags));
        }
        if flags & INDEX_CREATION_ORDER != 0 && flags & TRACK_CREATION_ORDER == 0 {
            ctx.complain("link info: creation order indexed but not tracked");
        }
        let max_creation_index = if flags & TRACK_CREATION_ORDER != 0 {
            Some(d.u64()?)
        } else {
            None
        };
        let heap_addr = d.addr(ctx.sizes)?;
        let name_index_addr = d.addr(ctx.sizes)?;
        let order_index_addr = if flags & INDEX_CREATION_ORDER != 0 {
            Some(d.addr(ctx.sizes)?)
        } else {
            None
        };
        Ok(Self {
            flags,
            max_creation_index,
            heap_addr,
            name_index_addr,
            order_index_addr,
        })
    }
}

/// Storage thresholds of a new-style group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    /// Most links kept compact before going dense.
    pub max_compact: Option<u16>,
    /// Fewest links kept dense before going compact.
    pub min_dense: Option<u16>,
    /// Estimated number of entries.
    pub est_entries: Option<u16>,
    /// Estimated name length.
    pub est_name_len: Option<u16>,
}

impl GroupInfo {
    /// Decode a group info payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("group info", raw_version, 0..=0);
        let flags = d.u8()?;
        if flags & !0x03 != 0 {
            ctx.complain_value("group info: unknown flags", u64::from(flags));
        }
        let (max_compact, min_dense) = if flags & 0x01 != 0 {
            let max = d.u16()?;
            let min = d.u16()?;
            if max < min {
                ctx.complain_value("group info: maximum compact links below minimum dense links", u64::from(max));
            }
            (Some(max), Some(min))
        } else {
            (None, None)
        };
        let (est_entries, est_name_len) = if flags & 0x02 != 0 {
            (Some(d.u16()?), Some(d.u16()?))
        } else {
            (None, None)
        };
        Ok(Self {
            max_compact,
            min_dense,
            est_entries,
            est_name_len,
        })
    }
}

/// Old-style group: B-tree v1 plus local heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableMessage {
    /// Group B-tree v1 address.
    pub btree_addr: u64,
    /// Local heap address.
    pub heap_addr: u64,
}

impl SymbolTableMessage {
    /// Decode a symbol table payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        Ok(Self {
            btree_addr: d.addr(ctx.sizes)?,
            heap_addr: d.addr(ctx.sizes)?,
        })
    }
}

/// Where an object keeps its dense attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeInfo {
    /// Flags: bit 0 creation order tracked, bit 1 indexed.
    pub flags: u8,
    /// Maximum creation index, when tracked.
    pub max_creation_index: Option<u16>,
    /// Fractal heap holding attribute messages.
    pub heap_addr: u64,
    /// B-tree v2 indexing attributes by name (record kind 8).
    pub name_index_addr: u64,
    /// B-tree v2 indexing attributes by creation order (record kind 9).
    pub order_index_addr: Option<u64>,
}

impl AttributeInfo {
    /// Decode an attribute info payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("attribute info", raw_version, 0..=0);
        let flags = d.u8()?;
        if flags & !(TRACK_CREATION_ORDER | INDEX_CREATION_ORDER) != 0 {
            ctx.complain_value("attribute info: unknown flags", u64::from(flags));
        }
        let max_creation_index = if flags & TRACK_CREATION_ORDER != 0 {
            Some(d.u16()?)
        } else {
            None
        };
        let heap_addr = d.addr(ctx.sizes)?;
        let name_index_addr = d.addr(ctx.sizes)?;
        let order_index_addr = if flags & INDEX_CREATION_ORDER != 0 {
            Some(d.addr(ctx.sizes)?)
        } else {
            None
        };
        Ok(Self {
            flags,
            max_creation_index,
            heap_addr,
            name_index_addr,
            order_index_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Sizes, UNDEF_ADDR};
    use crate::options::CompatLevel;

    fn ctx() -> MessageContext {
        MessageContext::new(Sizes::default(), CompatLevel::V18, 0)
    }

    #[test]
    fn link_info_empty_group() {
        let mut c = ctx();
        let mut p = vec![0, 0];
        p.extend_from_slice(&u64::MAX.to_le_bytes());
        p.extend_from_slice(&u64::MAX.to_le_bytes());
        let li = LinkInfo::decode(&p, &mut c).unwrap();
        assert_eq!(li.heap_addr, UNDEF_ADDR);
        assert_eq!(li.order_index_addr, None);
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn link_info_indexed_without_tracking() {
        let mut c = ctx();
        let mut p = vec![0, INDEX_CREATION_ORDER];
        for a in [0x100u64, 0x200, 0x300] {
            p.extend_from_slice(&a.to_le_bytes());
        }
        let li = LinkInfo::decode(&p, &mut c).unwrap();
        assert_eq!(li.order_index_addr, Some(0x300));
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn group_info_thresholds() {
        let mut c = ctx();
        let g = GroupInfo::decode(&[0, 1, 8, 0, 6, 0], &mut c).unwrap();
        assert_eq!(g.max_compact, Some(8));
        assert!(c.complaints.is_empty());
        GroupInfo::decode(&[0, 1, 2, 0, 6, 0], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn attribute_info_tracked() {
        let mut c = ctx();
        let mut p = vec![0, TRACK_CREATION_ORDER, 5, 0];
        p.extend_from_slice(&0x400u64.to_le_bytes());
        p.extend_from_slice(&0x500u64.to_le_bytes());
        let ai = AttributeInfo::decode(&p, &mut c).unwrap();
        assert_eq!(ai.max_creation_index, Some(5));
        assert_eq!(ai.name_index_addr, 0x500);
    }
}
