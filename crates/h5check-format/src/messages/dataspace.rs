//! Dataspace message (0x01).

use super::MessageContext;
use crate::error::CheckResult;

/// Maximum dataspace rank.
pub const MAX_RANK: u8 = 32;

const FLAG_MAX_DIMS: u8 = 0x01;
const FLAG_PERMUTATION: u8 = 0x02;

/// Kind of dataspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// Single element.
    Scalar,
    /// N-dimensional array.
    Simple,
    /// No elements.
    Null,
}

/// Decoded dataspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    /// Encoding version.
    pub version: u8,
    /// Space kind.
    pub kind: SpaceKind,
    /// Current dimension sizes.
    pub dims: Vec<u64>,
    /// Maximum dimension sizes; `u64::MAX` is unlimited.
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements.
    pub fn num_elements(&self) -> u64 {
        match self.kind {
            SpaceKind::Null => 0,
            SpaceKind::Scalar => 1,
            SpaceKind::Simple => self.dims.iter().fold(1u64, |acc, &d| acc.saturating_mul(d)),
        }
    }

    /// Decode a dataspace payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("dataspace", raw_version, 1..=2);
        if version == 2 {
            ctx.require_post_1_6("dataspace version 2");
        }
        let rank = d.u8()?;
        if rank > MAX_RANK {
            ctx.complain_value("dataspace: rank exceeds 32", u64::from(rank));
        }
        let flags = d.u8()?;
        if flags & !(FLAG_MAX_DIMS | FLAG_PERMUTATION) != 0 {
            ctx.complain_value("dataspace: unknown flags", u64::from(flags));
        }
        let kind = if version >= 2 {
            match d.u8()? {
                0 => SpaceKind::Scalar,
                1 => SpaceKind::Simple,
                2 => SpaceKind::Null,
                other => {
                    ctx.complain_value("dataspace: invalid type", u64::from(other));
                    SpaceKind::Simple
                }
            }
        } else {
            d.skip(1)?;
            d.skip(4)?;
            if rank > 0 {
                SpaceKind::Simple
            } else {
                SpaceKind::Scalar
            }
        };
        if kind != SpaceKind::Simple && rank != 0 {
            ctx.complain_value("dataspace: scalar or null space with non-zero rank", u64::from(rank));
        }

        let mut dims = Vec::with_capacity(usize::from(rank));
        for _ in 0..rank {
            dims.push(d.length(ctx.sizes)?);
        }
        let max_dims = if flags & FLAG_MAX_DIMS != 0 {
            let mut max = Vec::with_capacity(usize::from(rank));
            for _ in 0..rank {
                max.push(d.length(ctx.sizes)?);
            }
            for (i, (&cur, &m)) in dims.iter().zip(&max).enumerate() {
                if m != u64::MAX && m < cur {
                    ctx.complain_value(
                        format!("dataspace: maximum size of dimension {i} is below its current size"),
                        m,
                    );
                }
            }
            Some(max)
        } else {
            None
        };
        Ok(Self {
            version,
            kind,
            dims,
            max_dims,
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

    fn v1(dims: &[u64], max: Option<&[u64]>) -> Vec<u8> {
        let mut p = vec![1, dims.len() as u8, u8::from(max.is_some()), 0, 0, 0, 0, 0];
        for d in dims {
            p.extend_from_slice(&d.to_le_bytes());
        }
        for m in max.unwrap_or(&[]) {
            p.extend_from_slice(&m.to_le_bytes());
        }
        p
    }

    #[test]
    fn simple_with_unlimited_max() {
        let mut c = ctx();
        let ds = Dataspace::decode(&v1(&[10, 20], Some(&[u64::MAX, 20])), &mut c).unwrap();
        assert!(c.complaints.is_empty());
        assert_eq!(ds.kind, SpaceKind::Simple);
        assert_eq!(ds.num_elements(), 200);
    }

    #[test]
    fn max_below_current_is_flagged() {
        let mut c = ctx();
        Dataspace::decode(&v1(&[10], Some(&[5])), &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
        assert_eq!(c.complaints[0].bad_value, Some(5));
    }

    #[test]
    fn v2_null_and_bad_type() {
        let mut c = ctx();
        let ds = Dataspace::decode(&[2, 0, 0, 2], &mut c).unwrap();
        assert_eq!(ds.kind, SpaceKind::Null);
        assert_eq!(ds.num_elements(), 0);
        assert!(c.complaints.is_empty());
        Dataspace::decode(&[2, 0, 0, 7], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn rank_limit() {
        let mut c = ctx();
        let dims = vec![1u64; 33];
        Dataspace::decode(&v1(&dims, None), &mut c).unwrap();
        assert!(c.complaints.iter().any(|x| x.description.contains("rank")));
    }
}
