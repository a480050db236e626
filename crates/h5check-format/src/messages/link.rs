//! Link message (0x06).

use super::MessageContext;
use crate::error::{CheckError, CheckResult, Level};

const FLAG_NAME_LEN_WIDTH: u8 = 0x03;
const FLAG_CREATION_ORDER: u8 = 0x04;
const FLAG_LINK_TYPE: u8 = 0x08;
const FLAG_CHARSET: u8 = 0x10;

/// Link type of external links.
pub const LINK_TYPE_EXTERNAL: u8 = 64;

/// Destination of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Object header address in this file.
    Hard {
        /// Header address.
        addr: u64,
    },
    /// Path to another object in this file.
    Soft {
        /// Target path.
        path: String,
    },
    /// Object in another file.
    External {
        /// Target file name.
        file: String,
        /// Object path inside that file.
        path: String,
    },
    /// Other user-defined link kinds, kept opaque.
    UserDefined {
        /// Link type (65–255).
        kind: u8,
        /// Link data.
        data: Vec<u8>,
    },
}

/// Decoded link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Link name.
    pub name: String,
    /// Creation order index, if tracked.
    pub creation_order: Option<u64>,
    /// Character set of the name (0 ASCII, 1 UTF-8).
    pub charset: u8,
    /// Destination.
    pub target: LinkTarget,
}

impl Link {
    /// Decode a link payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("link", raw_version, 1..=1);
        let flags = d.u8()?;
        if flags & 0xe0 != 0 {
            ctx.complain_value("link: reserved flag bits set", u64::from(flags));
        }
        let link_type = if flags & FLAG_LINK_TYPE != 0 { d.u8()? } else { 0 };
        if link_type > 1 && link_type < LINK_TYPE_EXTERNAL {
            ctx.complain_value("link: invalid link type", u64::from(link_type));
        }
        let creation_order = if flags & FLAG_CREATION_ORDER != 0 {
            Some(d.u64()?)
        } else {
            None
        };
        let charset = if flags & FLAG_CHARSET != 0 { d.u8()? } else { 0 };
        if charset > 1 {
            ctx.complain_value("link: invalid character set", u64::from(charset));
        }
        let width = 1usize << (flags & FLAG_NAME_LEN_WIDTH);
        let name_len = d.uint(width)?;
        if name_len == 0 {
            return Err(CheckError::format(Level::Message, "link: zero-length name", ctx.address));
        }
        let name = String::from_utf8_lossy(d.bytes(name_len as usize)?).into_owned();

        let target = match link_type {
            0 => LinkTarget::Hard {
                addr: d.addr(ctx.sizes)?,
            },
            1 => {
                let len = d.u16()?;
                LinkTarget::Soft {
                    path: String::from_utf8_lossy(d.bytes(usize::from(len))?).into_owned(),
                }
            }
            LINK_TYPE_EXTERNAL => {
                let len = d.u16()?;
                let data = d.bytes(usize::from(len))?;
                decode_external(data, ctx)?
            }
            kind => {
                let len = d.u16()?;
                LinkTarget::UserDefined {
                    kind,
                    data: d.bytes(usize::from(len))?.to_vec(),
                }
            }
        };
        Ok(Self {
            name,
            creation_order,
            charset,
            target,
        })
    }
}

fn decode_external(data: &[u8], ctx: &mut MessageContext) -> CheckResult<LinkTarget> {
    let mut d = ctx.decoder(data);
    let vf = d.u8()?;
    if vf >> 4 != 0 {
        ctx.complain_value("link: invalid external link version", u64::from(vf >> 4));
    }
    if vf & 0x0e != 0 {
        ctx.complain_value("link: invalid external link flags", u64::from(vf & 0x0f));
    }
    let file = String::from_utf8_lossy(d.cstring()?).into_owned();
    let path = String::from_utf8_lossy(d.cstring()?).into_owned();
    Ok(LinkTarget::External { file, path })
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
    fn hard_link() {
        let mut c = ctx();
        let mut p = vec![1, 0, 4];
        p.extend_from_slice(b"data");
        p.extend_from_slice(&0x320u64.to_le_bytes());
        let l = Link::decode(&p, &mut c).unwrap();
        assert_eq!(l.name, "data");
        assert_eq!(l.target, LinkTarget::Hard { addr: 0x320 });
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn external_link_with_order_and_charset() {
        let mut c = ctx();
        let mut p = vec![1, FLAG_LINK_TYPE | FLAG_CREATION_ORDER | FLAG_CHARSET, LINK_TYPE_EXTERNAL];
        p.extend_from_slice(&7u64.to_le_bytes());
        p.push(1);
        p.push(3);
        p.extend_from_slice(b"ext");
        let target = b"\0b.h5\0/g\0";
        p.extend_from_slice(&(target.len() as u16).to_le_bytes());
        p.extend_from_slice(target);
        let l = Link::decode(&p, &mut c).unwrap();
        assert_eq!(l.creation_order, Some(7));
        assert_eq!(
            l.target,
            LinkTarget::External {
                file: "b.h5".into(),
                path: "/g".into()
            }
        );
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn invalid_type_and_charset() {
        let mut c = ctx();
        let mut p = vec![1, FLAG_LINK_TYPE | FLAG_CHARSET, 5, 9, 1, b'x'];
        p.extend_from_slice(&0u16.to_le_bytes());
        Link::decode(&p, &mut c).unwrap();
        assert_eq!(c.complaints.len(), 2);
    }
}
