//! Filter pipeline message (0x0B).

use super::MessageContext;
use crate::error::CheckResult;

/// Maximum number of filters in a pipeline.
pub const MAX_FILTERS: u8 = 32;

/// Deflate (zlib).
pub const FILTER_DEFLATE: u16 = 1;
/// Byte shuffle.
pub const FILTER_SHUFFLE: u16 = 2;
/// Fletcher-32 checksum.
pub const FILTER_FLETCHER32: u16 = 3;
/// SZIP.
pub const FILTER_SZIP: u16 = 4;
/// N-bit packing.
pub const FILTER_NBIT: u16 = 5;
/// Scale-offset.
pub const FILTER_SCALEOFFSET: u16 = 6;

/// Filter may fail without failing the write.
pub const FILTER_OPTIONAL: u16 = 0x0001;

/// One filter in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    /// Filter id.
    pub id: u16,
    /// Flags.
    pub flags: u16,
    /// Optional name.
    pub name: Option<String>,
    /// Client data values.
    pub client_data: Vec<u32>,
}

/// Decoded filter pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPipeline {
    /// Encoding version.
    pub version: u8,
    /// Filters in application order.
    pub filters: Vec<FilterDescription>,
}

impl FilterPipeline {
    /// Decode a filter pipeline payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("filter pipeline", raw_version, 1..=2);
        if version == 2 {
            ctx.require_post_1_6("filter pipeline version 2");
        }
        let nfilters = d.u8()?;
        if nfilters > MAX_FILTERS {
            ctx.complain_value("filter pipeline: too many filters", u64::from(nfilters));
        }
        if version == 1 {
            d.skip(6)?;
        }

        let mut filters = Vec::with_capacity(usize::from(nfilters));
        for _ in 0..nfilters {
            let id = d.u16()?;
            let name_len = if version == 1 || id >= 256 { d.u16()? } else { 0 };
            let flags = d.u16()?;
            if flags & !FILTER_OPTIONAL != 0 {
                ctx.complain_value("filter pipeline: reserved filter flags set", u64::from(flags));
            }
            let nvalues = d.u16()?;
            if version == 1 && name_len % 8 != 0 {
                ctx.complain_value("filter pipeline: name length not a multiple of 8", u64::from(name_len));
            }
            let name = if name_len > 0 {
                let raw = d.bytes(usize::from(name_len))?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                Some(String::from_utf8_lossy(&raw[..end]).into_owned())
            } else {
                None
            };
            let mut client_data = Vec::with_capacity(usize::from(nvalues));
            for _ in 0..nvalues {
                client_data.push(d.u32()?);
            }
            if version == 1 && nvalues % 2 == 1 {
                d.skip(4)?;
            }
            filters.push(FilterDescription {
                id,
                flags,
                name,
                client_data,
            });
        }
        Ok(Self { version, filters })
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
    fn v1_deflate_with_padding() {
        let mut c = ctx();
        let mut p = vec![1, 1, 0, 0, 0, 0, 0, 0];
        p.extend_from_slice(&FILTER_DEFLATE.to_le_bytes());
        p.extend_from_slice(&8u16.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&1u16.to_le_bytes());
        p.extend_from_slice(b"deflate\0");
        p.extend_from_slice(&6u32.to_le_bytes());
        p.extend_from_slice(&[0; 4]);
        let fp = FilterPipeline::decode(&p, &mut c).unwrap();
        assert_eq!(fp.filters.len(), 1);
        assert_eq!(fp.filters[0].name.as_deref(), Some("deflate"));
        assert_eq!(fp.filters[0].client_data, vec![6]);
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn v2_short_ids_have_no_name() {
        let mut c = ctx();
        let mut p = vec![2, 2];
        for id in [FILTER_SHUFFLE, FILTER_FLETCHER32] {
            p.extend_from_slice(&id.to_le_bytes());
            p.extend_from_slice(&0u16.to_le_bytes());
            p.extend_from_slice(&0u16.to_le_bytes());
        }
        let fp = FilterPipeline::decode(&p, &mut c).unwrap();
        assert_eq!(fp.filters[1].id, FILTER_FLETCHER32);
        assert!(fp.filters.iter().all(|f| f.name.is_none()));
    }

    #[test]
    fn too_many_filters() {
        let mut c = ctx();
        let mut p = vec![2, 33];
        for _ in 0..33 {
            p.extend_from_slice(&[2, 0, 0, 0, 0, 0]);
        }
        FilterPipeline::decode(&p, &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }
}
