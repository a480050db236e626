//! Fill value messages: the old form (0x04) and the current one (0x05).

use super::MessageContext;
use crate::error::CheckResult;

/// Old fill value message: a raw value only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillValueOld {
    /// Fill value bytes.
    pub value: Vec<u8>,
}

impl FillValueOld {
    /// Decode an old fill value payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let size = d.u32()?;
        let value = d.bytes(size as usize)?.to_vec();
        Ok(Self { value })
    }
}

/// Fill value message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillValue {
    /// Encoding version (1–3).
    pub version: u8,
    /// Space allocation time (early, late, incremental).
    pub alloc_time: u8,
    /// Fill value write time (on allocation, never, if set).
    pub write_time: u8,
    /// True when the fill value is explicitly undefined (v3).
    pub undefined: bool,
    /// Fill value bytes, if stored.
    pub value: Option<Vec<u8>>,
}

const V3_ALLOC_TIME: u8 = 0x03;
const V3_WRITE_TIME_SHIFT: u8 = 2;
const V3_UNDEFINED: u8 = 0x10;
const V3_HAVE_VALUE: u8 = 0x20;

impl FillValue {
    /// Decode a fill value payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("fill value", raw_version, 1..=3);
        if version == 3 {
            ctx.require_post_1_6("fill value version 3");
            let flags = d.u8()?;
            if flags & !(V3_ALLOC_TIME | 0x0c | V3_UNDEFINED | V3_HAVE_VALUE) != 0 {
                ctx.complain_value("fill value: reserved flag bits set", u64::from(flags));
            }
            let alloc_time = flags & V3_ALLOC_TIME;
            let write_time = (flags >> V3_WRITE_TIME_SHIFT) & 0x03;
            if write_time > 2 {
                ctx.complain_value("fill value: invalid write time", u64::from(write_time));
            }
            let undefined = flags & V3_UNDEFINED != 0;
            let have = flags & V3_HAVE_VALUE != 0;
            if undefined && have {
                ctx.complain("fill value: value both undefined and present");
            }
            let value = if have {
                let size = d.u32()?;
                Some(d.bytes(size as usize)?.to_vec())
            } else {
                None
            };
            return Ok(Self {
                version,
                alloc_time,
                write_time,
                undefined,
                value,
            });
        }

        let alloc_time = d.u8()?;
        if !(1..=3).contains(&alloc_time) {
            ctx.complain_value("fill value: invalid space allocation time", u64::from(alloc_time));
        }
        let write_time = d.u8()?;
        if write_time > 2 {
            ctx.complain_value("fill value: invalid write time", u64::from(write_time));
        }
        let defined = d.u8()?;
        if defined > 1 {
            ctx.complain_value("fill value: invalid 'defined' flag", u64::from(defined));
        }
        // Version 1 always carries the size field; version 2 only when defined.
        let value = if version == 1 || defined != 0 {
            let size = d.u32()?;
            (size > 0).then(|| d.bytes(size as usize).map(<[u8]>::to_vec)).transpose()?
        } else {
            None
        };
        Ok(Self {
            version,
            alloc_time,
            write_time,
            undefined: false,
            value,
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
    fn v2_defined_value() {
        let mut c = ctx();
        let mut p = vec![2, 2, 0, 1];
        p.extend_from_slice(&4u32.to_le_bytes());
        p.extend_from_slice(&[1, 2, 3, 4]);
        let f = FillValue::decode(&p, &mut c).unwrap();
        assert_eq!(f.value.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn v2_bad_times() {
        let mut c = ctx();
        FillValue::decode(&[2, 0, 7, 0], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 2);
    }

    #[test]
    fn v3_flags() {
        let mut c = ctx();
        let f = FillValue::decode(&[3, 0x02 | 0x10], &mut c).unwrap();
        assert!(f.undefined);
        assert_eq!(f.alloc_time, 2);
        assert!(c.complaints.is_empty());

        FillValue::decode(&[3, 0x30, 0, 0, 0, 0], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn old_form() {
        let mut c = ctx();
        let f = FillValueOld::decode(&[2, 0, 0, 0, 9, 9], &mut c).unwrap();
        assert_eq!(f.value, vec![9, 9]);
    }
}
