//! Datatype message (0x03).
//!
//! All eleven classes are decoded, recursively for compound, enumeration,
//! variable-length and array types. Property checks are limited to what
//! the encoded type itself can prove: bit fields inside the type size,
//! float components inside the precision, member extents inside the
//! compound.

use super::MessageContext;
use crate::decode::{limit_enc_size, Decoder};
use crate::error::{CheckError, CheckResult, Level};

/// Nesting limit for compound/enum/vlen/array base types.
const MAX_NESTING: usize = 64;

/// Datatype class, from the low nibble of the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeClass {
    FixedPoint,
    FloatingPoint,
    Time,
    String,
    BitField,
    Opaque,
    Compound,
    Reference,
    Enumerated,
    VariableLength,
    Array,
}

impl DatatypeClass {
    /// Class for a raw id; `None` for ids 11 and up.
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::FixedPoint,
            1 => Self::FloatingPoint,
            2 => Self::Time,
            3 => Self::String,
            4 => Self::BitField,
            5 => Self::Opaque,
            6 => Self::Compound,
            7 => Self::Reference,
            8 => Self::Enumerated,
            9 => Self::VariableLength,
            10 => Self::Array,
            _ => return None,
        })
    }
}

/// A member of a compound datatype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundMember {
    /// Member name.
    pub name: String,
    /// Byte offset within the compound.
    pub offset: u64,
    /// Member type.
    pub datatype: Datatype,
}

/// Class-specific properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeProperties {
    /// Fixed-point or bit field.
    Integer {
        bit_offset: u16,
        precision: u16,
    },
    /// Floating point.
    Float {
        bit_offset: u16,
        precision: u16,
        exp_location: u8,
        exp_size: u8,
        mant_location: u8,
        mant_size: u8,
        exp_bias: u32,
    },
    /// Time.
    Time {
        precision: u16,
    },
    /// Fixed-length string; padding and charset live in the class flags.
    String,
    /// Opaque with its ASCII tag.
    Opaque {
        tag: String,
    },
    /// Compound.
    Compound {
        members: Vec<CompoundMember>,
    },
    /// Object or region reference.
    Reference,
    /// Enumeration.
    Enumerated {
        base: Box<Datatype>,
        names: Vec<String>,
        values: Vec<Vec<u8>>,
    },
    /// Sequence or string of variable length.
    VariableLength {
        base: Box<Datatype>,
    },
    /// Fixed-size array of a base type.
    Array {
        dims: Vec<u32>,
        base: Box<Datatype>,
    },
}

/// Decoded datatype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datatype {
    /// Encoding version (1–3).
    pub version: u8,
    /// Class.
    pub class: DatatypeClass,
    /// 24-bit class bit field.
    pub flags: u32,
    /// Size of one element in bytes.
    pub size: u32,
    /// Class properties.
    pub props: TypeProperties,
}

impl Datatype {
    /// Decode a datatype payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        Self::decode_from(&mut d, ctx, 0)
    }

    /// Decode a datatype embedded in another structure (attributes,
    /// compound members, base types).
    pub fn decode_from(d: &mut Decoder<'_>, ctx: &mut MessageContext, depth: usize) -> CheckResult<Self> {
        if depth > MAX_NESTING {
            return Err(CheckError::format(
                Level::Message,
                "datatype: base types nested too deeply",
                d.address(),
            ));
        }
        let at = d.address();
        let first = d.u8()?;
        let raw_version = first >> 4;
        let version = ctx.check_version("datatype", raw_version, 1..=3);
        if version == 3 {
            ctx.require_post_1_6("datatype version 3");
        }
        let class_id = first & 0x0f;
        let class = DatatypeClass::from_u8(class_id).ok_or_else(|| {
            CheckError::from(
                crate::error::Complaint::new(Level::Message, "datatype: invalid class")
                    .at(at)
                    .value(u64::from(class_id)),
            )
        })?;
        let flag_bytes = d.bytes(3)?;
        let flags = u32::from(flag_bytes[0]) | u32::from(flag_bytes[1]) << 8 | u32::from(flag_bytes[2]) << 16;
        let size = d.u32()?;
        let bits = u64::from(size) * 8;

        let props = match class {
            DatatypeClass::FixedPoint | DatatypeClass::BitField => {
                let bit_offset = d.u16()?;
                let precision = d.u16()?;
                if u64::from(bit_offset) + u64::from(precision) > bits || precision == 0 {
                    ctx.complain_value("datatype: bit offset and precision exceed type size", u64::from(precision));
                }
                TypeProperties::Integer { bit_offset, precision }
            }
            DatatypeClass::FloatingPoint => Self::decode_float(d, ctx, flags, bits)?,
            DatatypeClass::Time => TypeProperties::Time { precision: d.u16()? },
            DatatypeClass::String => {
                if flags & 0x0f > 2 {
                    ctx.complain_value("datatype: invalid string padding", u64::from(flags & 0x0f));
                }
                if (flags >> 4) & 0x0f > 1 {
                    ctx.complain_value("datatype: invalid string character set", u64::from((flags >> 4) & 0x0f));
                }
                TypeProperties::String
            }
            DatatypeClass::Opaque => {
                let tag_len = (flags & 0xff) as usize;
                let raw = d.bytes(tag_len)?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                if !raw[..end].is_ascii() {
                    ctx.complain("datatype: opaque tag is not ASCII");
                }
                TypeProperties::Opaque {
                    tag: String::from_utf8_lossy(&raw[..end]).into_owned(),
                }
            }
            DatatypeClass::Compound => Self::decode_compound(d, ctx, version, flags, size, depth)?,
            DatatypeClass::Reference => {
                if flags & 0x0f > 1 {
                    ctx.complain_value("datatype: invalid reference type", u64::from(flags & 0x0f));
                }
                TypeProperties::Reference
            }
            DatatypeClass::Enumerated => {
                let count = (flags & 0xffff) as usize;
                let base = Box::new(Self::decode_from(d, ctx, depth + 1)?);
                if !matches!(base.class, DatatypeClass::FixedPoint) {
                    ctx.complain("datatype: enumeration base type is not an integer");
                }
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(read_name(d, version < 3)?);
                }
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(d.bytes(base.size as usize)?.to_vec());
                }
                TypeProperties::Enumerated { base, names, values }
            }
            DatatypeClass::VariableLength => {
                if flags & 0x0f > 1 {
                    ctx.complain_value("datatype: invalid variable-length type", u64::from(flags & 0x0f));
                }
                let base = Box::new(Self::decode_from(d, ctx, depth + 1)?);
                TypeProperties::VariableLength { base }
            }
            DatatypeClass::Array => {
                if version < 2 {
                    ctx.complain("datatype: array class requires version 2 or later");
                }
                let rank = d.u8()?;
                if rank == 0 || rank > super::dataspace::MAX_RANK {
                    ctx.complain_value("datatype: invalid array rank", u64::from(rank));
                }
                if version < 3 {
                    d.skip(3)?;
                }
                let mut dims = Vec::with_capacity(usize::from(rank));
                for _ in 0..rank {
                    dims.push(d.u32()?);
                }
                if version < 3 {
                    d.skip(4 * usize::from(rank))?;
                }
                let base = Box::new(Self::decode_from(d, ctx, depth + 1)?);
                let total = dims
                    .iter()
                    .fold(u64::from(base.size), |acc, &n| acc.saturating_mul(u64::from(n)));
                if total != u64::from(size) {
                    ctx.complain_value("datatype: array size does not match its dimensions", u64::from(size));
                }
                TypeProperties::Array { dims, base }
            }
        };
        Ok(Self {
            version,
            class,
            flags,
            size,
            props,
        })
    }

    fn decode_float(
        d: &mut Decoder<'_>,
        ctx: &mut MessageContext,
        flags: u32,
        bits: u64,
    ) -> CheckResult<TypeProperties> {
        let bit_offset = d.u16()?;
        let precision = d.u16()?;
        let exp_location = d.u8()?;
        let exp_size = d.u8()?;
        let mant_location = d.u8()?;
        let mant_size = d.u8()?;
        let exp_bias = d.u32()?;

        let prec = u64::from(precision);
        if u64::from(bit_offset) + prec > bits || precision == 0 {
            ctx.complain_value("datatype: float precision exceeds type size", prec);
        }
        let sign = u64::from((flags >> 8) & 0xff);
        if sign >= prec {
            ctx.complain_value("datatype: float sign bit outside precision", sign);
        }
        let exp_end = u64::from(exp_location) + u64::from(exp_size);
        let mant_end = u64::from(mant_location) + u64::from(mant_size);
        if exp_size == 0 || exp_end > prec {
            ctx.complain_value("datatype: float exponent outside precision", u64::from(exp_size));
        }
        if mant_size == 0 || mant_end > prec {
            ctx.complain_value("datatype: float mantissa outside precision", u64::from(mant_size));
        }
        let overlap = u64::from(mant_location) < exp_end && u64::from(exp_location) < mant_end;
        if overlap {
            ctx.complain("datatype: float exponent and mantissa overlap");
        }
        Ok(TypeProperties::Float {
            bit_offset,
            precision,
            exp_location,
            exp_size,
            mant_location,
            mant_size,
            exp_bias,
        })
    }

    fn decode_compound(
        d: &mut Decoder<'_>,
        ctx: &mut MessageContext,
        version: u8,
        flags: u32,
        size: u32,
        depth: usize,
    ) -> CheckResult<TypeProperties> {
        let count = (flags & 0xffff) as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_name(d, version < 3)?;
            let offset = if version >= 3 {
                d.uint(limit_enc_size(u64::from(size)))?
            } else {
                u64::from(d.u32()?)
            };
            if version == 1 {
                // Dimensionality, reserved, permutation, reserved, four dims.
                d.skip(1 + 3 + 4 + 4 + 16)?;
            }
            let datatype = Self::decode_from(d, ctx, depth + 1)?;
            if offset + u64::from(datatype.size) > u64::from(size) {
                ctx.complain_value(
                    format!("datatype: compound member '{name}' extends beyond the compound"),
                    offset,
                );
            }
            members.push(CompoundMember { name, offset, datatype });
        }
        Ok(TypeProperties::Compound { members })
    }
}

fn read_name(d: &mut Decoder<'_>, padded: bool) -> CheckResult<String> {
    let start = d.position();
    let raw = d.cstring()?;
    let name = String::from_utf8_lossy(raw).into_owned();
    if padded {
        let consumed = d.position() - start;
        d.skip((8 - consumed % 8) % 8)?;
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Sizes;
    use crate::options::CompatLevel;

    fn ctx() -> MessageContext {
        MessageContext::new(Sizes::default(), CompatLevel::V18, 0)
    }

    fn header(class: u8, version: u8, flags: [u8; 3], size: u32) -> Vec<u8> {
        let mut v = vec![(version << 4) | class];
        v.extend_from_slice(&flags);
        v.extend_from_slice(&size.to_le_bytes());
        v
    }

    fn int32() -> Vec<u8> {
        let mut v = header(0, 1, [0x08, 0, 0], 4);
        v.extend_from_slice(&0u16.to_le_bytes());
        v.extend_from_slice(&32u16.to_le_bytes());
        v
    }

    fn float64() -> Vec<u8> {
        let mut v = header(1, 1, [0x20, 63, 0], 8);
        v.extend_from_slice(&0u16.to_le_bytes());
        v.extend_from_slice(&64u16.to_le_bytes());
        v.extend_from_slice(&[52, 11, 0, 52]);
        v.extend_from_slice(&1023u32.to_le_bytes());
        v
    }

    #[test]
    fn integer_and_float() {
        let mut c = ctx();
        let t = Datatype::decode(&int32(), &mut c).unwrap();
        assert_eq!(t.class, DatatypeClass::FixedPoint);
        let f = Datatype::decode(&float64(), &mut c).unwrap();
        assert_eq!(f.size, 8);
        assert!(c.complaints.is_empty(), "{:?}", c.complaints);
    }

    #[test]
    fn precision_beyond_size() {
        let mut c = ctx();
        let mut v = header(0, 1, [0, 0, 0], 2);
        v.extend_from_slice(&8u16.to_le_bytes());
        v.extend_from_slice(&16u16.to_le_bytes());
        Datatype::decode(&v, &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn invalid_class_aborts() {
        let mut c = ctx();
        let v = header(12, 1, [0, 0, 0], 4);
        assert!(matches!(Datatype::decode(&v, &mut c), Err(CheckError::Format(_))));
    }

    #[test]
    fn compound_v1_members() {
        let mut c = ctx();
        let mut v = header(6, 1, [2, 0, 0], 12);
        for (name, off, ty) in [("a", 0u32, int32()), ("b", 4, float64())] {
            let mut n = name.as_bytes().to_vec();
            n.resize(8, 0);
            v.extend_from_slice(&n);
            v.extend_from_slice(&off.to_le_bytes());
            v.extend_from_slice(&[0u8; 28]);
            v.extend_from_slice(&ty);
        }
        let t = Datatype::decode(&v, &mut c).unwrap();
        match t.props {
            TypeProperties::Compound { members } => {
                assert_eq!(members.len(), 2);
                assert_eq!(members[1].name, "b");
                assert_eq!(members[1].offset, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.complaints.is_empty(), "{:?}", c.complaints);
    }

    #[test]
    fn compound_member_overflow() {
        let mut c = ctx();
        let mut v = header(6, 3, [1, 0, 0], 4);
        v.extend_from_slice(b"x\0");
        v.push(2);
        v.extend_from_slice(&int32());
        Datatype::decode(&v, &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn array_requires_v2() {
        let mut c = ctx();
        let mut v = header(10, 1, [0, 0, 0], 8);
        v.extend_from_slice(&[1, 0, 0, 0]);
        v.extend_from_slice(&2u32.to_le_bytes());
        v.extend_from_slice(&0u32.to_le_bytes());
        v.extend_from_slice(&int32());
        Datatype::decode(&v, &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
        assert!(c.complaints[0].description.contains("array"));
    }

    #[test]
    fn enum_names_and_values() {
        let mut c = ctx();
        let mut v = header(8, 3, [2, 0, 0], 4);
        v.extend_from_slice(&int32());
        v.extend_from_slice(b"RED\0GREEN\0");
        v.extend_from_slice(&0u32.to_le_bytes());
        v.extend_from_slice(&1u32.to_le_bytes());
        let t = Datatype::decode(&v, &mut c).unwrap();
        match t.props {
            TypeProperties::Enumerated { names, values, .. } => {
                assert_eq!(names, vec!["RED", "GREEN"]);
                assert_eq!(values[1], vec![1, 0, 0, 0]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
