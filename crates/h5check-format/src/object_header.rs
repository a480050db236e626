//! Object header decoding and validation (v1 and v2).
//!
//! [`ObjectHeader::load`] reads the prefix and every chunk reachable
//! through continuation messages, checks message framing and flags, and
//! decodes each message through the [`Message`] registry. Problems inside
//! one message are recorded and the remaining messages are still decoded.
//! Following the messages to other structures (heaps, B-trees, other
//! headers) is left to the validator.

use std::collections::HashSet;

use crate::checksum::verify_trailing;
use crate::decode::Decoder;
use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::file_state::FileContext;
use crate::message_type::MessageType;
use crate::messages::{Message, MessageContext, SharedRef};
use crate::options::CompatLevel;
use crate::signature::{magic, matches};

/// Message may not change.
pub const MSG_FLAG_CONSTANT: u8 = 0x01;
/// Payload is a shared message reference.
pub const MSG_FLAG_SHARED: u8 = 0x02;
/// Message must not be shared.
pub const MSG_FLAG_DONT_SHARE: u8 = 0x04;
/// Fail when writing if the kind is unknown.
pub const MSG_FLAG_FAIL_IF_UNKNOWN_WRITE: u8 = 0x08;
/// Mark the header when the kind is unknown.
pub const MSG_FLAG_MARK_IF_UNKNOWN: u8 = 0x10;
/// Kind was unknown to a previous writer.
pub const MSG_FLAG_WAS_UNKNOWN: u8 = 0x20;
/// Message may be shared.
pub const MSG_FLAG_SHAREABLE: u8 = 0x40;
/// Fail if the kind is unknown.
pub const MSG_FLAG_FAIL_IF_UNKNOWN_ALWAYS: u8 = 0x80;
/// Bits defined by the 1.6 format.
const MSG_FLAGS_1_6: u8 = 0x07;

/// v2 header flag: creation order of messages is tracked.
pub const HDR_ATTR_CRT_ORDER_TRACKED: u8 = 0x04;
/// v2 header flag: creation order of messages is indexed.
pub const HDR_ATTR_CRT_ORDER_INDEXED: u8 = 0x08;
/// v2 header flag: attribute phase-change values are stored.
pub const HDR_ATTR_STORE_PHASE_CHANGE: u8 = 0x10;
/// v2 header flag: access, modification, change and birth times are stored.
pub const HDR_STORE_TIMES: u8 = 0x20;
const HDR_CHUNK0_SIZE: u8 = 0x03;
const HDR_ALL_FLAGS: u8 = 0x3f;

/// Size of the v1 prefix, padded.
const V1_PREFIX: usize = 16;
/// v1 message header: type, size, flags, three reserved bytes.
const V1_MSG_HEADER: usize = 8;
/// Upper bound on the v2 prefix: signature, version, flags, times,
/// phase-change values, eight-byte chunk size.
const V2_PREFIX_MAX: usize = 4 + 1 + 1 + 16 + 4 + 8;

/// One chunk of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderChunk {
    /// Address of the chunk's message area.
    pub address: u64,
    /// Size of the message area.
    pub size: u64,
}

/// One message as found in a chunk.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Kind.
    pub mtype: MessageType,
    /// Message flags.
    pub flags: u8,
    /// Creation order, in v2 headers that track it.
    pub crt_order: Option<u16>,
    /// Index of the chunk holding the message.
    pub chunk: usize,
    /// File address of the payload.
    pub address: u64,
    /// Payload bytes.
    pub raw: Vec<u8>,
    /// Reference, when the message is shared.
    pub shared: Option<SharedRef>,
    /// Decoded payload, when decoding succeeded. For shared messages this
    /// is filled in by the validator once the body is located.
    pub decoded: Option<Message>,
}

impl RawMessage {
    /// True when the payload is a shared message reference.
    pub fn is_shared(&self) -> bool {
        self.flags & MSG_FLAG_SHARED != 0
    }
}

/// A decoded object header.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    /// Header address.
    pub address: u64,
    /// Version (1 or 2).
    pub version: u8,
    /// v2 header flags; 0 for v1.
    pub flags: u8,
    /// Reference count from the v1 prefix.
    pub refcount: Option<u32>,
    /// Access, modification, change and birth times (v2).
    pub times: Option<[u32; 4]>,
    /// Attribute phase-change values `(max compact, min dense)` (v2).
    pub attr_phase_change: Option<(u16, u16)>,
    /// Chunks in the order they were read.
    pub chunks: Vec<HeaderChunk>,
    /// Every message, Nil included.
    pub messages: Vec<RawMessage>,
}

impl ObjectHeader {
    /// Decode and validate the header at `addr`.
    pub fn load(ctx: &mut FileContext<'_>, addr: u64) -> CheckResult<ObjectHeader> {
        let avail = ctx.driver.eof().saturating_sub(addr).min(ctx.state.eoa.saturating_sub(addr));
        let peek_len = (avail.min(V2_PREFIX_MAX as u64) as usize).max(4);
        let prefix = ctx.read(addr, peek_len.min(4), Level::Message, "object header")?;
        let header = if matches(&prefix, magic::OHDR) {
            if ctx.compat == CompatLevel::V16 {
                ctx.record(
                    Complaint::new(Level::Message, "object header: version 2 is not part of the 1.6 format")
                        .at(addr),
                );
            }
            let image = ctx.read(addr, peek_len, Level::Message, "object header")?;
            Self::load_v2(ctx, addr, &image)?
        } else {
            let image = ctx.read(addr, V1_PREFIX, Level::Message, "object header")?;
            Self::load_v1(ctx, addr, &image)?
        };
        tracing::debug!(
            addr,
            version = header.version,
            chunks = header.chunks.len(),
            messages = header.messages.len(),
            "decoded object header"
        );
        Ok(header)
    }

    fn load_v1(ctx: &mut FileContext<'_>, addr: u64, prefix: &[u8]) -> CheckResult<ObjectHeader> {
        let mut d = Decoder::new(prefix, addr, Level::Message);
        let version = d.u8()?;
        if version != 1 {
            return Err(Complaint::new(Level::Message, "object header: invalid version")
                .at(addr)
                .value(u64::from(version))
                .into());
        }
        let reserved = d.u8()?;
        ctx.require(reserved == 0, || {
            Complaint::new(Level::Message, "object header: reserved byte is not zero")
                .at(addr)
                .value(u64::from(reserved))
        });
        let nmesgs = d.u16()?;
        let refcount = d.u32()?;
        let chunk0_size = u64::from(d.u32()?);

        let mut header = ObjectHeader {
            address: addr,
            version: 1,
            flags: 0,
            refcount: Some(refcount),
            times: None,
            attr_phase_change: None,
            chunks: Vec::new(),
            messages: Vec::new(),
        };
        let chunk0_addr = addr + V1_PREFIX as u64;
        let mut pending = vec![(chunk0_addr, chunk0_size)];
        let mut seen = HashSet::new();
        while let Some((chunk_addr, size)) = pending.pop() {
            if !seen.insert(chunk_addr) {
                ctx.record(
                    Complaint::new(Level::Message, "object header: continuation chunk already visited")
                        .at(addr)
                        .value(chunk_addr),
                );
                continue;
            }
            let len = chunk_len(chunk_addr, size)?;
            let image = match ctx.read(chunk_addr, len, Level::Message, "object header chunk") {
                Ok(image) => image,
                Err(CheckError::Format(c)) => {
                    ctx.record(*c);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let index = header.chunks.len();
            header.chunks.push(HeaderChunk {
                address: chunk_addr,
                size,
            });
            header.scan_v1_chunk(ctx, index, chunk_addr, &image, &mut pending)?;
        }
        let found = header.messages.len();
        ctx.require(found == usize::from(nmesgs), || {
            Complaint::new(
                Level::Message,
                format!("object header: {found} messages found, header declares {nmesgs}"),
            )
            .at(addr)
            .value(u64::from(nmesgs))
        });
        Ok(header)
    }

    fn scan_v1_chunk(
        &mut self,
        ctx: &mut FileContext<'_>,
        index: usize,
        chunk_addr: u64,
        image: &[u8],
        pending: &mut Vec<(u64, u64)>,
    ) -> CheckResult<()> {
        let mut d = Decoder::new(image, chunk_addr, Level::Message);
        while d.remaining() >= V1_MSG_HEADER {
            let at = d.address();
            let type_id = d.u16()?;
            let size = usize::from(d.u16()?);
            let flags = d.u8()?;
            d.skip(3)?;
            if size % 8 != 0 {
                ctx.record(
                    Complaint::new(Level::Message, "object header: message size is not a multiple of 8")
                        .at(at)
                        .value(size as u64),
                );
            }
            if size > d.remaining() {
                return Err(Complaint::new(Level::Message, "object header: message extends beyond its chunk")
                    .at(at)
                    .value(size as u64)
                    .into());
            }
            let payload_addr = d.address();
            let raw = d.bytes(size)?.to_vec();
            self.push_message(ctx, MessageType::from_u16(type_id), flags, None, index, payload_addr, raw, pending);
            if d.align(8).is_err() {
                break;
            }
        }
        if !d.is_empty() {
            ctx.record(
                Complaint::new(Level::Message, "object header: trailing bytes in chunk")
                    .at(d.address())
                    .value(d.remaining() as u64),
            );
        }
        Ok(())
    }

    fn load_v2(ctx: &mut FileContext<'_>, addr: u64, prefix: &[u8]) -> CheckResult<ObjectHeader> {
        let mut d = Decoder::new(prefix, addr, Level::Message);
        d.skip(4)?;
        let version = d.u8()?;
        if version != 2 {
            return Err(Complaint::new(Level::Message, "object header: invalid version")
                .at(addr)
                .value(u64::from(version))
                .into());
        }
        let flags = d.u8()?;
        ctx.require(flags & !HDR_ALL_FLAGS == 0, || {
            Complaint::new(Level::Message, "object header: reserved flag bits set")
                .at(addr)
                .value(u64::from(flags))
        });
        let times = if flags & HDR_STORE_TIMES != 0 {
            Some([d.u32()?, d.u32()?, d.u32()?, d.u32()?])
        } else {
            None
        };
        let attr_phase_change = if flags & HDR_ATTR_STORE_PHASE_CHANGE != 0 {
            let max_compact = d.u16()?;
            let min_dense = d.u16()?;
            ctx.require(max_compact >= min_dense, || {
                Complaint::new(
                    Level::Message,
                    "object header: attribute max compact below min dense",
                )
                .at(addr)
                .value(u64::from(max_compact))
            });
            Some((max_compact, min_dense))
        } else {
            None
        };
        let width = 1usize << (flags & HDR_CHUNK0_SIZE);
        let chunk0_size = d.uint(width)?;
        let prefix_len = d.position() as u64;

        let mut header = ObjectHeader {
            address: addr,
            version: 2,
            flags,
            refcount: None,
            times,
            attr_phase_change,
            chunks: Vec::new(),
            messages: Vec::new(),
        };

        // Chunk 0 is checksummed together with the prefix.
        let total = prefix_len
            .checked_add(chunk0_size)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| CheckError::format(Level::Message, "object header: chunk 0 size too large", addr))?;
        let len = chunk_len(addr, total)?;
        let image = ctx.read(addr, len, Level::Message, "object header")?;
        if image.len() < prefix_len as usize + 4 {
            return Err(CheckError::format(Level::Message, "object header: chunk 0 truncated", addr));
        }
        if let Some(c) = verify_trailing(&image, addr, Level::Message, "object header") {
            ctx.record(c);
        }
        let chunk0_addr = addr + prefix_len;
        header.chunks.push(HeaderChunk {
            address: chunk0_addr,
            size: chunk0_size,
        });
        let mut pending = Vec::new();
        let body = &image[prefix_len as usize..image.len() - 4];
        header.scan_v2_chunk(ctx, 0, chunk0_addr, body, &mut pending)?;

        let mut seen = HashSet::new();
        while let Some((chunk_addr, size)) = pending.pop() {
            if !seen.insert(chunk_addr) {
                ctx.record(
                    Complaint::new(Level::Message, "object header: continuation chunk already visited")
                        .at(addr)
                        .value(chunk_addr),
                );
                continue;
            }
            match header.load_v2_continuation(ctx, chunk_addr, size, &mut pending) {
                Ok(()) => {}
                Err(CheckError::Format(c)) => ctx.record(*c),
                Err(e) => return Err(e),
            }
        }
        Ok(header)
    }

    fn load_v2_continuation(
        &mut self,
        ctx: &mut FileContext<'_>,
        chunk_addr: u64,
        size: u64,
        pending: &mut Vec<(u64, u64)>,
    ) -> CheckResult<()> {
        let len = chunk_len(chunk_addr, size)?;
        if len < 8 {
            return Err(Complaint::new(Level::Message, "object header: continuation chunk too small")
                .at(chunk_addr)
                .value(size)
                .into());
        }
        let image = ctx.read(chunk_addr, len, Level::Message, "object header continuation chunk")?;
        if !matches(&image[..4], magic::OCHK) {
            return Err(CheckError::format(
                Level::Message,
                "object header continuation chunk: incorrect signature",
                chunk_addr,
            ));
        }
        if let Some(c) = verify_trailing(&image, chunk_addr, Level::Message, "object header continuation chunk") {
            ctx.record(c);
        }
        let index = self.chunks.len();
        self.chunks.push(HeaderChunk {
            address: chunk_addr + 4,
            size: size - 8,
        });
        self.scan_v2_chunk(ctx, index, chunk_addr + 4, &image[4..len - 4], pending)
    }

    fn scan_v2_chunk(
        &mut self,
        ctx: &mut FileContext<'_>,
        index: usize,
        chunk_addr: u64,
        body: &[u8],
        pending: &mut Vec<(u64, u64)>,
    ) -> CheckResult<()> {
        let tracked = self.flags & HDR_ATTR_CRT_ORDER_TRACKED != 0;
        let header_size = if tracked { 6 } else { 4 };
        let mut d = Decoder::new(body, chunk_addr, Level::Message);
        while d.remaining() >= header_size {
            let at = d.address();
            let type_id = u16::from(d.u8()?);
            let size = usize::from(d.u16()?);
            let flags = d.u8()?;
            let crt_order = if tracked { Some(d.u16()?) } else { None };
            if size > d.remaining() {
                return Err(Complaint::new(Level::Message, "object header: message extends beyond its chunk")
                    .at(at)
                    .value(size as u64)
                    .into());
            }
            let payload_addr = d.address();
            let raw = d.bytes(size)?.to_vec();
            self.push_message(ctx, MessageType::from_u16(type_id), flags, crt_order, index, payload_addr, raw, pending);
        }
        // A gap smaller than a message header may end a chunk; it must be zero.
        let gap = d.rest();
        if gap.iter().any(|&b| b != 0) {
            ctx.record(
                Complaint::new(Level::Message, "object header: non-zero gap at end of chunk")
                    .at(chunk_addr + (body.len() - gap.len()) as u64),
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn push_message(
        &mut self,
        ctx: &mut FileContext<'_>,
        mtype: MessageType,
        flags: u8,
        crt_order: Option<u16>,
        chunk: usize,
        address: u64,
        raw: Vec<u8>,
        pending: &mut Vec<(u64, u64)>,
    ) {
        check_message_flags(ctx, mtype, flags, address);
        let mut mctx = MessageContext::new(ctx.sizes(), ctx.compat, address);
        let mut shared = None;
        let mut decoded = None;
        if flags & MSG_FLAG_SHARED != 0 && mtype.is_shareable() {
            match SharedRef::decode(&raw, &mut mctx) {
                Ok(r) => shared = Some(r),
                Err(CheckError::Format(c)) => mctx.complaints.push(*c),
                Err(e) => mctx.complaints.push(Complaint::new(Level::Message, e.to_string()).at(address)),
            }
        } else {
            match Message::decode(mtype, &raw, &mut mctx) {
                Ok(m) => decoded = Some(m),
                Err(CheckError::Format(c)) => mctx.complaints.push(*c),
                Err(e) => mctx.complaints.push(Complaint::new(Level::Message, e.to_string()).at(address)),
            }
        }
        ctx.report.extend(mctx.complaints);

        if let Some(Message::Continuation(cont)) = &decoded {
            if ctx.state.addr_valid(cont.addr) {
                pending.push((cont.addr, cont.length));
            } else {
                ctx.record(
                    Complaint::new(Level::Message, "continuation: invalid chunk address")
                        .at(address)
                        .value(cont.addr),
                );
            }
        }
        self.messages.push(RawMessage {
            mtype,
            flags,
            crt_order,
            chunk,
            address,
            raw,
            shared,
            decoded,
        });
    }

    /// Decoded messages of kind `mt`.
    pub fn decoded(&self, mt: MessageType) -> impl Iterator<Item = &Message> + '_ {
        self.messages
            .iter()
            .filter(move |m| m.mtype == mt)
            .filter_map(|m| m.decoded.as_ref())
    }

    /// First decoded message of kind `mt`.
    pub fn first(&self, mt: MessageType) -> Option<&Message> {
        self.decoded(mt).next()
    }

    /// True when a message of kind `mt` is present, decoded or not.
    pub fn has(&self, mt: MessageType) -> bool {
        self.messages.iter().any(|m| m.mtype == mt)
    }

    /// Messages of every kind that carry a shared reference.
    pub fn shared_messages(&self) -> impl Iterator<Item = (usize, &RawMessage)> + '_ {
        self.messages.iter().enumerate().filter(|(_, m)| m.shared.is_some())
    }
}

fn check_message_flags(ctx: &mut FileContext<'_>, mtype: MessageType, flags: u8, address: u64) {
    if ctx.compat == CompatLevel::V16 && flags & !MSG_FLAGS_1_6 != 0 {
        ctx.record(
            Complaint::new(Level::Message, format!("{mtype}: reserved message flag bits set"))
                .at(address)
                .value(u64::from(flags)),
        );
    }
    if flags & MSG_FLAG_SHARED != 0 && !mtype.is_shareable() {
        ctx.record(
            Complaint::new(Level::Message, format!("{mtype}: shared flag on a kind that cannot be shared"))
                .at(address)
                .value(u64::from(flags)),
        );
    }
    if flags & MSG_FLAG_SHARED != 0 && flags & MSG_FLAG_DONT_SHARE != 0 {
        ctx.record(
            Complaint::new(Level::Message, format!("{mtype}: both shared and don't-share flags set"))
                .at(address)
                .value(u64::from(flags)),
        );
    }
}

fn chunk_len(addr: u64, size: u64) -> CheckResult<usize> {
    usize::try_from(size).map_err(|_| CheckError::format(Level::Message, "object header: chunk too large", addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::lookup3;
    use crate::file_state::FileState;
    use crate::report::Report;
    use h5check_io::Driver;

    fn v1_header(messages: &[(u16, u8, Vec<u8>)], declared: u16) -> Vec<u8> {
        let mut body = Vec::new();
        for (t, flags, payload) in messages {
            let mut p = payload.clone();
            p.resize(p.len().next_multiple_of(8), 0);
            body.extend_from_slice(&t.to_le_bytes());
            body.extend_from_slice(&(p.len() as u16).to_le_bytes());
            body.extend_from_slice(&[*flags, 0, 0, 0]);
            body.extend_from_slice(&p);
        }
        let mut img = vec![1, 0];
        img.extend_from_slice(&declared.to_le_bytes());
        img.extend_from_slice(&1u32.to_le_bytes());
        img.extend_from_slice(&(body.len() as u32).to_le_bytes());
        img.extend_from_slice(&[0; 4]);
        img.extend_from_slice(&body);
        img
    }

    fn v2_header(flags: u8, messages: &[(u8, u8, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (t, mflags, payload) in messages {
            body.push(*t);
            body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            body.push(*mflags);
            body.extend_from_slice(payload);
        }
        let mut img = b"OHDR".to_vec();
        img.push(2);
        img.push(flags);
        img.push(body.len() as u8);
        img.extend_from_slice(&body);
        let sum = lookup3(&img);
        img.extend_from_slice(&sum.to_le_bytes());
        img
    }

    fn load(img: Vec<u8>, compat: CompatLevel) -> (CheckResult<ObjectHeader>, Report) {
        let drv = Driver::memory("ohdr", img);
        let mut st = FileState::new();
        st.eoa = drv.eof();
        let mut report = Report::default();
        let res = {
            let mut ctx = FileContext {
                driver: &drv,
                state: &st,
                report: &mut report,
                compat,
            };
            ObjectHeader::load(&mut ctx, 0)
        };
        (res, report)
    }

    fn mtime() -> Vec<u8> {
        vec![1, 0, 0, 0, 0x10, 0x20, 0x30, 0x40]
    }

    #[test]
    fn v1_messages_decoded() {
        let img = v1_header(&[(0x12, 0, mtime()), (0, 0, vec![0; 8])], 2);
        let (h, report) = load(img, CompatLevel::V18);
        let h = h.unwrap();
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(h.version, 1);
        assert_eq!(h.messages.len(), 2);
        assert!(matches!(h.first(MessageType::ModificationTime), Some(Message::ModTime(_))));
    }

    #[test]
    fn v1_message_count_mismatch() {
        let img = v1_header(&[(0x12, 0, mtime())], 3);
        let (h, report) = load(img, CompatLevel::V18);
        assert!(h.is_ok());
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn v2_oversized_chunk0_is_reported() {
        let mut img = b"OHDR".to_vec();
        img.extend_from_slice(&[2, 0x03]);
        img.extend_from_slice(&u64::MAX.to_le_bytes());
        img.extend_from_slice(&[0; 32]);
        let (h, _) = load(img, CompatLevel::V18);
        match h {
            Err(CheckError::Format(c)) => {
                assert_eq!(c.address, Some(0));
                assert!(c.description.contains("chunk 0"), "{}", c.description);
            }
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn v2_checksum_verified() {
        let img = v2_header(0, &[(0x12, 0, mtime())]);
        let (h, report) = load(img.clone(), CompatLevel::V18);
        assert!(report.is_clean(), "{:?}", report.complaints());
        assert_eq!(h.unwrap().version, 2);

        let mut bad = img;
        let n = bad.len();
        bad[n - 5] ^= 0x01;
        let (h, report) = load(bad, CompatLevel::V18);
        assert!(h.is_ok());
        assert!(report.complaints().iter().any(|c| c.description.contains("checksum")));
    }

    #[test]
    fn v2_flagged_under_1_6() {
        let img = v2_header(0, &[(0x12, 0, mtime())]);
        let (_, report) = load(img, CompatLevel::V16);
        assert!(report.complaints().iter().any(|c| c.description.contains("1.6")));
    }

    #[test]
    fn shared_flag_rules() {
        let img = v1_header(&[(0x12, MSG_FLAG_SHARED, mtime())], 1);
        let (_, report) = load(img, CompatLevel::V18);
        assert!(report
            .complaints()
            .iter()
            .any(|c| c.description.contains("cannot be shared")));

        let mut shared = vec![2u8, 0];
        shared.extend_from_slice(&0x40u64.to_le_bytes());
        let img = v1_header(&[(0x03, MSG_FLAG_SHARED | MSG_FLAG_DONT_SHARE, shared)], 1);
        let (h, report) = load(img, CompatLevel::V18);
        assert_eq!(report.total(), 1);
        assert!(h.unwrap().messages[0].shared.is_some());
    }

    #[test]
    fn reserved_flags_only_under_1_6() {
        let img = v1_header(&[(0x12, MSG_FLAG_MARK_IF_UNKNOWN, mtime())], 1);
        let (_, report) = load(img.clone(), CompatLevel::V18);
        assert!(report.is_clean());
        let (_, report) = load(img, CompatLevel::V16);
        assert_eq!(report.total(), 1);
    }

    #[test]
    fn bad_message_does_not_stop_others() {
        // A bogus message with the wrong value, then a valid mtime.
        let img = v1_header(&[(0x09, 0, vec![1, 2, 3, 4]), (0x12, 0, mtime())], 2);
        let (h, report) = load(img, CompatLevel::V18);
        let h = h.unwrap();
        assert_eq!(report.total(), 1);
        assert!(h.first(MessageType::ModificationTime).is_some());
    }

    #[test]
    fn continuation_to_undefined_address() {
        let mut cont = u64::MAX.to_le_bytes().to_vec();
        cont.extend_from_slice(&64u64.to_le_bytes());
        let img = v1_header(&[(0x10, 0, cont)], 1);
        let (h, report) = load(img, CompatLevel::V18);
        assert!(h.is_ok());
        assert_eq!(report.total(), 1);
    }
}
