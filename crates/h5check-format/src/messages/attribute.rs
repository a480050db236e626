//! Attribute message (0x0C).
//!
//! An attribute embeds a datatype and a dataspace, either inline or as
//! shared references, followed by the raw value.

use super::{Dataspace, Datatype, MessageContext, SharedRef};
use crate::decode::Decoder;
use crate::error::{CheckResult, Level};

const FLAG_TYPE_SHARED: u8 = 0x01;
const FLAG_SPACE_SHARED: u8 = 0x02;

/// Inline or shared embedded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Embedded<T> {
    /// Stored inside the attribute.
    Inline(T),
    /// Stored elsewhere.
    Shared(SharedRef),
}

impl<T> Embedded<T> {
    /// The inline value, if any.
    pub fn inline(&self) -> Option<&T> {
        match self {
            Embedded::Inline(v) => Some(v),
            Embedded::Shared(_) => None,
        }
    }

    /// The shared reference, if any.
    pub fn shared(&self) -> Option<SharedRef> {
        match self {
            Embedded::Inline(_) => None,
            Embedded::Shared(r) => Some(*r),
        }
    }
}

/// Decoded attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Encoding version.
    pub version: u8,
    /// Attribute name.
    pub name: String,
    /// Name character set (v3).
    pub charset: u8,
    /// Value datatype.
    pub datatype: Embedded<Datatype>,
    /// Value dataspace.
    pub dataspace: Embedded<Dataspace>,
    /// Raw value.
    pub data: Vec<u8>,
}

impl Attribute {
    /// Decode an attribute payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("attribute", raw_version, 1..=3);
        if version >= 2 {
            ctx.require_post_1_6("attribute version 2 or 3");
        }
        let flags = d.u8()?;
        if version == 1 && flags != 0 {
            ctx.complain_value("attribute: reserved byte is not zero", u64::from(flags));
        }
        if version >= 2 && flags & !(FLAG_TYPE_SHARED | FLAG_SPACE_SHARED) != 0 {
            ctx.complain_value("attribute: unknown flags", u64::from(flags));
        }
        let flags = if version == 1 { 0 } else { flags };
        let name_size = usize::from(d.u16()?);
        let type_size = usize::from(d.u16()?);
        let space_size = usize::from(d.u16()?);
        let charset = if version >= 3 { d.u8()? } else { 0 };
        if charset > 1 {
            ctx.complain_value("attribute: invalid character set", u64::from(charset));
        }
        let pad = |n: usize| if version == 1 { n.next_multiple_of(8) } else { n };

        let raw_name = d.bytes(pad(name_size))?;
        let name_bytes = &raw_name[..name_size];
        let name = match name_bytes.split_last() {
            Some((0, body)) => String::from_utf8_lossy(body).into_owned(),
            _ => {
                ctx.complain("attribute: name is not NUL-terminated");
                String::from_utf8_lossy(name_bytes).into_owned()
            }
        };

        let type_at = d.address();
        let type_raw = d.bytes(pad(type_size))?;
        let datatype = if flags & FLAG_TYPE_SHARED != 0 {
            Embedded::Shared(with_address(ctx, type_at, |c| SharedRef::decode(&type_raw[..type_size], c))?)
        } else {
            let mut td = Decoder::new(&type_raw[..type_size], type_at, Level::Message);
            Embedded::Inline(Datatype::decode_from(&mut td, ctx, 0)?)
        };

        let space_at = d.address();
        let space_raw = d.bytes(pad(space_size))?;
        let dataspace = if flags & FLAG_SPACE_SHARED != 0 {
            Embedded::Shared(with_address(ctx, space_at, |c| SharedRef::decode(&space_raw[..space_size], c))?)
        } else {
            Embedded::Inline(with_address(ctx, space_at, |c| Dataspace::decode(&space_raw[..space_size], c))?)
        };

        let data = d.rest().to_vec();
        if let (Some(t), Some(s)) = (datatype.inline(), dataspace.inline()) {
            let need = s.num_elements().saturating_mul(u64::from(t.size));
            if (data.len() as u64) < need {
                ctx.complain_value("attribute: value is shorter than its type and space require", data.len() as u64);
            }
        }
        Ok(Self {
            version,
            name,
            charset,
            datatype,
            dataspace,
            data,
        })
    }
}

fn with_address<T>(
    ctx: &mut MessageContext,
    address: u64,
    f: impl FnOnce(&mut MessageContext) -> CheckResult<T>,
) -> CheckResult<T> {
    let saved = std::mem::replace(&mut ctx.address, address);
    let out = f(ctx);
    ctx.address = saved;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Sizes;
    use crate::options::CompatLevel;

    fn int32() -> Vec<u8> {
        let mut v = vec![0x10, 0, 0, 0];
        v.extend_from_slice(&4u32.to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes());
        v.extend_from_slice(&32u16.to_le_bytes());
        v
    }

    fn space(n: u64) -> Vec<u8> {
        let mut v = vec![1, 1, 0, 0, 0, 0, 0, 0];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }

    fn v1(name: &str, n: u64, values: &[u8]) -> Vec<u8> {
        let mut nm = name.as_bytes().to_vec();
        nm.push(0);
        let t = int32();
        let s = space(n);
        let mut p = vec![1, 0];
        p.extend_from_slice(&(nm.len() as u16).to_le_bytes());
        p.extend_from_slice(&(t.len() as u16).to_le_bytes());
        p.extend_from_slice(&(s.len() as u16).to_le_bytes());
        for part in [nm, t, s] {
            let mut part = part;
            part.resize(part.len().next_multiple_of(8), 0);
            p.extend_from_slice(&part);
        }
        p.extend_from_slice(values);
        p
    }

    #[test]
    fn v1_attribute() {
        let mut c = MessageContext::new(Sizes::default(), CompatLevel::V18, 0);
        let a = Attribute::decode(&v1("units", 2, &[0; 8]), &mut c).unwrap();
        assert_eq!(a.name, "units");
        assert_eq!(a.data.len(), 8);
        assert!(matches!(a.datatype, Embedded::Inline(_)));
        assert!(c.complaints.is_empty(), "{:?}", c.complaints);
    }

    #[test]
    fn short_value() {
        let mut c = MessageContext::new(Sizes::default(), CompatLevel::V18, 0);
        Attribute::decode(&v1("units", 3, &[0; 8]), &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn shared_datatype_v3() {
        let mut c = MessageContext::new(Sizes::default(), CompatLevel::V18, 0x100);
        let mut shared = vec![3u8, 2];
        shared.extend_from_slice(&0x900u64.to_le_bytes());
        let s = space(1);
        let mut p = vec![3, FLAG_TYPE_SHARED];
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&(shared.len() as u16).to_le_bytes());
        p.extend_from_slice(&(s.len() as u16).to_le_bytes());
        p.push(0);
        p.extend_from_slice(b"a\0");
        p.extend_from_slice(&shared);
        p.extend_from_slice(&s);
        p.extend_from_slice(&[1, 2, 3, 4]);
        let a = Attribute::decode(&p, &mut c).unwrap();
        assert!(matches!(a.datatype, Embedded::Shared(_)));
        assert_eq!(c.address, 0x100);
        assert!(c.complaints.is_empty(), "{:?}", c.complaints);
    }
}
