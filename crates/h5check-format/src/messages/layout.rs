//! Data layout message (0x08), versions 1 through 4.

use super::MessageContext;
use crate::decode::is_undef;
use crate::error::{CheckError, CheckResult, Complaint, Level};

/// Chunked layout v4 flag: single chunk is filtered.
pub const SINGLE_CHUNK_FILTERED: u8 = 0x02;

/// How the chunks of a chunked dataset are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkIndexKind {
    /// B-tree v1, node type 1 (layout versions 1–3).
    BTreeV1,
    /// A single chunk stored at the index address.
    SingleChunk {
        /// Stored size when filtered.
        filtered_size: Option<u64>,
        /// Filter mask when filtered.
        filter_mask: u32,
    },
    /// Chunks at computed addresses, no index.
    Implicit,
    /// Fixed array.
    FixedArray {
        /// log2 of the page size in elements.
        page_bits: u8,
    },
    /// Extensible array.
    ExtensibleArray {
        /// Bits needed for the maximum number of elements.
        max_bits: u8,
        /// Elements stored in the index block.
        index_elements: u8,
        /// Minimum data block pointers in a super block.
        min_pointers: u8,
        /// Minimum elements in a data block.
        min_elements: u8,
        /// log2 of the data block page size.
        page_bits: u8,
    },
    /// B-tree v2, record kinds 10/11.
    BTreeV2 {
        /// Node size.
        node_size: u32,
        /// Split percent.
        split: u8,
        /// Merge percent.
        merge: u8,
    },
}

/// Storage class with its class-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutClass {
    /// Raw data inside the message.
    Compact {
        /// Raw data.
        data: Vec<u8>,
    },
    /// One contiguous extent.
    Contiguous {
        /// Extent address.
        addr: u64,
        /// Extent size, if the encoding stores it.
        size: Option<u64>,
    },
    /// Chunked storage.
    Chunked {
        /// Chunk index address.
        addr: u64,
        /// Chunk dimensions; the last is the element size.
        dims: Vec<u64>,
        /// v4 layout flags.
        flags: u8,
        /// Index kind.
        index: ChunkIndexKind,
    },
    /// Virtual dataset mappings in the global heap.
    Virtual {
        /// Global heap collection address.
        heap_addr: u64,
        /// Object index in the collection.
        heap_index: u32,
    },
}

/// Decoded layout message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Encoding version.
    pub version: u8,
    /// Storage class.
    pub class: LayoutClass,
}

impl Layout {
    /// Decode a layout payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("layout", raw_version, 1..=4);
        if version == 4 {
            ctx.require_post_1_6("layout version 4");
        }
        let class = if version < 3 {
            Self::decode_v1(&mut d, ctx)?
        } else {
            Self::decode_v3(&mut d, ctx, version)?
        };
        if let LayoutClass::Chunked { dims, .. } = &class {
            if dims.is_empty() || dims.iter().any(|&n| n == 0) {
                ctx.complain("layout: chunk dimension of size zero");
            }
        }
        Ok(Self { version, class })
    }

    fn decode_v1(d: &mut crate::decode::Decoder<'_>, ctx: &mut MessageContext) -> CheckResult<LayoutClass> {
        let ndims = d.u8()?;
        let class_id = d.u8()?;
        d.skip(5)?;
        if class_id > 2 {
            return Err(bad_class(ctx.address, class_id));
        }
        let addr = if class_id != 0 { d.addr(ctx.sizes)? } else { 0 };
        let mut dims = Vec::with_capacity(usize::from(ndims));
        for _ in 0..ndims {
            dims.push(u64::from(d.u32()?));
        }
        Ok(match class_id {
            0 => {
                let size = d.u32()?;
                LayoutClass::Compact {
                    data: d.bytes(size as usize)?.to_vec(),
                }
            }
            1 => LayoutClass::Contiguous { addr, size: None },
            _ => LayoutClass::Chunked {
                addr,
                dims,
                flags: 0,
                index: ChunkIndexKind::BTreeV1,
            },
        })
    }

    fn decode_v3(
        d: &mut crate::decode::Decoder<'_>,
        ctx: &mut MessageContext,
        version: u8,
    ) -> CheckResult<LayoutClass> {
        let class_id = d.u8()?;
        Ok(match class_id {
            0 => {
                let size = d.u16()?;
                LayoutClass::Compact {
                    data: d.bytes(usize::from(size))?.to_vec(),
                }
            }
            1 => LayoutClass::Contiguous {
                addr: d.addr(ctx.sizes)?,
                size: Some(d.length(ctx.sizes)?),
            },
            2 if version == 3 => {
                let ndims = d.u8()?;
                let addr = d.addr(ctx.sizes)?;
                let mut dims = Vec::with_capacity(usize::from(ndims));
                for _ in 0..ndims {
                    dims.push(u64::from(d.u32()?));
                }
                LayoutClass::Chunked {
                    addr,
                    dims,
                    flags: 0,
                    index: ChunkIndexKind::BTreeV1,
                }
            }
            2 => {
                let flags = d.u8()?;
                if flags & !0x03 != 0 {
                    ctx.complain_value("layout: reserved chunked flags set", u64::from(flags));
                }
                let ndims = d.u8()?;
                let width = d.u8()?;
                if !(1..=8).contains(&width) {
                    return Err(Complaint::new(Level::Message, "layout: invalid chunk dimension width")
                        .at(ctx.address)
                        .value(u64::from(width))
                        .into());
                }
                let mut dims = Vec::with_capacity(usize::from(ndims));
                for _ in 0..ndims {
                    dims.push(d.uint(usize::from(width))?);
                }
                let index = match d.u8()? {
                    1 => {
                        if flags & SINGLE_CHUNK_FILTERED != 0 {
                            let size = d.length(ctx.sizes)?;
                            let mask = d.u32()?;
                            ChunkIndexKind::SingleChunk {
                                filtered_size: Some(size),
                                filter_mask: mask,
                            }
                        } else {
                            ChunkIndexKind::SingleChunk {
                                filtered_size: None,
                                filter_mask: 0,
                            }
                        }
                    }
                    2 => ChunkIndexKind::Implicit,
                    3 => ChunkIndexKind::FixedArray { page_bits: d.u8()? },
                    4 => ChunkIndexKind::ExtensibleArray {
                        max_bits: d.u8()?,
                        index_elements: d.u8()?,
                        min_pointers: d.u8()?,
                        min_elements: d.u8()?,
                        page_bits: d.u8()?,
                    },
                    5 => ChunkIndexKind::BTreeV2 {
                        node_size: d.u32()?,
                        split: d.u8()?,
                        merge: d.u8()?,
                    },
                    other => {
                        return Err(Complaint::new(Level::Message, "layout: invalid chunk index type")
                            .at(ctx.address)
                            .value(u64::from(other))
                            .into())
                    }
                };
                let addr = d.addr(ctx.sizes)?;
                LayoutClass::Chunked {
                    addr,
                    dims,
                    flags,
                    index,
                }
            }
            3 if version == 4 => {
                let heap_addr = d.addr(ctx.sizes)?;
                let heap_index = d.u32()?;
                LayoutClass::Virtual { heap_addr, heap_index }
            }
            other => return Err(bad_class(ctx.address, other)),
        })
    }

    /// Address of the storage, or undefined for compact data.
    pub fn storage_addr(&self) -> u64 {
        match &self.class {
            LayoutClass::Compact { .. } => crate::decode::UNDEF_ADDR,
            LayoutClass::Contiguous { addr, .. } | LayoutClass::Chunked { addr, .. } => *addr,
            LayoutClass::Virtual { heap_addr, .. } => *heap_addr,
        }
    }

    /// True when no storage has been allocated yet.
    pub fn is_unallocated(&self) -> bool {
        !matches!(self.class, LayoutClass::Compact { .. }) && is_undef(self.storage_addr())
    }
}

fn bad_class(addr: u64, class_id: u8) -> CheckError {
    Complaint::new(Level::Message, "layout: invalid layout class")
        .at(addr)
        .value(u64::from(class_id))
        .into()
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
    fn v3_contiguous() {
        let mut c = ctx();
        let mut p = vec![3, 1];
        p.extend_from_slice(&0x800u64.to_le_bytes());
        p.extend_from_slice(&400u64.to_le_bytes());
        let l = Layout::decode(&p, &mut c).unwrap();
        assert_eq!(
            l.class,
            LayoutClass::Contiguous {
                addr: 0x800,
                size: Some(400)
            }
        );
    }

    #[test]
    fn v3_chunked_and_unallocated() {
        let mut c = ctx();
        let mut p = vec![3, 2, 3];
        p.extend_from_slice(&u64::MAX.to_le_bytes());
        for n in [10u32, 10, 4] {
            p.extend_from_slice(&n.to_le_bytes());
        }
        let l = Layout::decode(&p, &mut c).unwrap();
        assert!(l.is_unallocated());
        match l.class {
            LayoutClass::Chunked { dims, index, .. } => {
                assert_eq!(dims, vec![10, 10, 4]);
                assert_eq!(index, ChunkIndexKind::BTreeV1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn v4_extensible_array() {
        let mut c = ctx();
        let mut p = vec![4, 2, 0, 2, 1, 16, 8, 4];
        p.extend_from_slice(&[32, 4, 4, 16, 10]);
        p.extend_from_slice(&0x1000u64.to_le_bytes());
        let l = Layout::decode(&p, &mut c).unwrap();
        match l.class {
            LayoutClass::Chunked { dims, index, addr, .. } => {
                assert_eq!(dims, vec![16, 8]);
                assert_eq!(addr, 0x1000);
                assert!(matches!(index, ChunkIndexKind::ExtensibleArray { max_bits: 32, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn v1_compact() {
        let mut c = ctx();
        let mut p = vec![1, 1, 0, 0, 0, 0, 0, 0];
        p.extend_from_slice(&4u32.to_le_bytes());
        p.extend_from_slice(&3u32.to_le_bytes());
        p.extend_from_slice(&[7, 8, 9]);
        let l = Layout::decode(&p, &mut c).unwrap();
        assert_eq!(l.class, LayoutClass::Compact { data: vec![7, 8, 9] });
    }

    #[test]
    fn invalid_class_aborts() {
        let mut c = ctx();
        assert!(Layout::decode(&[3, 9], &mut c).is_err());
        assert!(Layout::decode(&[3, 3], &mut c).is_err());
    }
}
