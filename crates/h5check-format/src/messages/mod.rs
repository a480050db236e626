//! Object header message payloads.
//!
//! [`Message`] is the registry: one variant per message kind, decoded by
//! [`Message::decode`]. Copy and release are `Clone` and `Drop`. Payload
//! checks that do not need other structures happen during decode and are
//! collected in the [`MessageContext`]; checks that do (heaps, B-trees,
//! other headers) are driven by the validator afterwards.

pub mod attribute;
pub mod dataspace;
pub mod datatype;
pub mod file;
pub mod fill_value;
pub mod group;
pub mod layout;
pub mod link;
pub mod misc;
pub mod pipeline;

use std::ops::RangeInclusive;

use crate::decode::{Decoder, Sizes};
use crate::error::{CheckResult, Complaint, Level};
use crate::message_type::MessageType;
use crate::options::CompatLevel;

pub use attribute::Attribute;
pub use dataspace::{Dataspace, SpaceKind};
pub use datatype::{Datatype, DatatypeClass, TypeProperties};
pub use file::{BTreeKValues, DriverInfoMessage, FileSpaceInfo, SohmTableMessage};
pub use fill_value::{FillValue, FillValueOld};
pub use group::{AttributeInfo, GroupInfo, LinkInfo, SymbolTableMessage};
pub use layout::{ChunkIndexKind, Layout, LayoutClass};
pub use link::{Link, LinkTarget};
pub use misc::{Bogus, Comment, Continuation, ExternalFileList, ModTime, ModTimeOld, RefCount};
pub use pipeline::{FilterDescription, FilterPipeline};

/// Decode-time state for one message payload.
#[derive(Debug)]
pub struct MessageContext {
    /// Offset and length widths of the file.
    pub sizes: Sizes,
    /// Rules in force.
    pub compat: CompatLevel,
    /// File address of the payload.
    pub address: u64,
    /// Problems found so far.
    pub complaints: Vec<Complaint>,
}

impl MessageContext {
    /// Context for a payload at `address`.
    pub fn new(sizes: Sizes, compat: CompatLevel, address: u64) -> Self {
        Self {
            sizes,
            compat,
            address,
            complaints: Vec::new(),
        }
    }

    /// Decoder over `payload`.
    pub fn decoder<'b>(&self, payload: &'b [u8]) -> Decoder<'b> {
        Decoder::new(payload, self.address, Level::Message)
    }

    /// Record a level-2 complaint at the payload address.
    pub fn complain(&mut self, description: impl Into<String>) {
        self.complaints
            .push(Complaint::new(Level::Message, description).at(self.address));
    }

    /// Record a level-2 complaint carrying the offending value.
    pub fn complain_value(&mut self, description: impl Into<String>, value: u64) {
        self.complaints.push(
            Complaint::new(Level::Message, description)
                .at(self.address)
                .value(value),
        );
    }

    /// Check a version byte; out-of-range versions are recorded and clamped
    /// to the nearest supported one so decoding can continue.
    pub fn check_version(&mut self, what: &str, version: u8, range: RangeInclusive<u8>) -> u8 {
        if range.contains(&version) {
            return version;
        }
        self.complain_value(format!("{what}: invalid version"), u64::from(version));
        version.clamp(*range.start(), *range.end())
    }

    /// Record that `what` is not part of the 1.6 format when checking
    /// against it.
    pub fn require_post_1_6(&mut self, what: &str) {
        if self.compat == CompatLevel::V16 {
            self.complain(format!("{what} is not part of the 1.6 format"));
        }
    }
}

/// Where a shared message's body lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedKind {
    /// Stored in another object header (a committed object).
    Committed {
        /// Header address.
        addr: u64,
    },
    /// Stored in the shared message heap.
    Sohm {
        /// Fractal heap ID.
        heap_id: [u8; 8],
    },
}

/// Shared message reference, the payload of a message with the shared flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedRef {
    /// Encoding version (1–3).
    pub version: u8,
    /// Location of the body.
    pub kind: SharedKind,
}

/// Share type: message is in the shared message heap.
pub const SHARE_TYPE_SOHM: u8 = 1;
/// Share type: message is in a committed object's header.
pub const SHARE_TYPE_COMMITTED: u8 = 2;

impl SharedRef {
    /// Decode a shared message reference.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        let version = ctx.check_version("shared message", raw_version, 1..=3);
        let share_type = d.u8()?;
        if version == 1 {
            d.skip(6)?;
            d.skip(ctx.sizes.len_width())?;
            let addr = d.addr(ctx.sizes)?;
            return Ok(Self {
                version,
                kind: SharedKind::Committed { addr },
            });
        }
        if version == 3 && share_type == SHARE_TYPE_SOHM {
            let raw = d.bytes(8)?;
            let mut heap_id = [0u8; 8];
            heap_id.copy_from_slice(raw);
            return Ok(Self {
                version,
                kind: SharedKind::Sohm { heap_id },
            });
        }
        if version == 3 && share_type != SHARE_TYPE_COMMITTED {
            ctx.complain_value("shared message: invalid share type", u64::from(share_type));
        }
        let addr = d.addr(ctx.sizes)?;
        Ok(Self {
            version,
            kind: SharedKind::Committed { addr },
        })
    }
}

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// 0x00: padding.
    Nil,
    /// 0x01.
    Dataspace(Dataspace),
    /// 0x02.
    LinkInfo(LinkInfo),
    /// 0x03.
    Datatype(Datatype),
    /// 0x04.
    FillValueOld(FillValueOld),
    /// 0x05.
    FillValue(FillValue),
    /// 0x06.
    Link(Link),
    /// 0x07.
    ExternalFiles(ExternalFileList),
    /// 0x08.
    Layout(Layout),
    /// 0x09: test message.
    Bogus(Bogus),
    /// 0x0A.
    GroupInfo(GroupInfo),
    /// 0x0B.
    FilterPipeline(FilterPipeline),
    /// 0x0C.
    Attribute(Attribute),
    /// 0x0D.
    Comment(Comment),
    /// 0x0E.
    ModTimeOld(ModTimeOld),
    /// 0x0F.
    SharedMessageTable(SohmTableMessage),
    /// 0x10.
    Continuation(Continuation),
    /// 0x11.
    SymbolTable(SymbolTableMessage),
    /// 0x12.
    ModTime(ModTime),
    /// 0x13.
    BTreeK(BTreeKValues),
    /// 0x14.
    DriverInfo(DriverInfoMessage),
    /// 0x15.
    AttributeInfo(AttributeInfo),
    /// 0x16.
    RefCount(RefCount),
    /// 0x17.
    FileSpaceInfo(FileSpaceInfo),
    /// Unrecognized kind, kept opaque.
    Unknown {
        /// Raw type id.
        type_id: u16,
        /// Raw payload.
        raw: Vec<u8>,
    },
}

impl Message {
    /// Decode a payload of kind `mt`.
    pub fn decode(mt: MessageType, payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Message> {
        if mt.is_post_1_6() {
            ctx.require_post_1_6(&mt.to_string());
        }
        Ok(match mt {
            MessageType::Nil => Message::Nil,
            MessageType::Dataspace => Message::Dataspace(Dataspace::decode(payload, ctx)?),
            MessageType::LinkInfo => Message::LinkInfo(LinkInfo::decode(payload, ctx)?),
            MessageType::Datatype => Message::Datatype(Datatype::decode(payload, ctx)?),
            MessageType::FillValueOld => Message::FillValueOld(FillValueOld::decode(payload, ctx)?),
            MessageType::FillValue => Message::FillValue(FillValue::decode(payload, ctx)?),
            MessageType::Link => Message::Link(Link::decode(payload, ctx)?),
            MessageType::ExternalFiles => {
                Message::ExternalFiles(ExternalFileList::decode(payload, ctx)?)
            }
            MessageType::DataLayout => Message::Layout(Layout::decode(payload, ctx)?),
            MessageType::Bogus => Message::Bogus(Bogus::decode(payload, ctx)?),
            MessageType::GroupInfo => Message::GroupInfo(GroupInfo::decode(payload, ctx)?),
            MessageType::FilterPipeline => {
                Message::FilterPipeline(FilterPipeline::decode(payload, ctx)?)
            }
            MessageType::Attribute => Message::Attribute(Attribute::decode(payload, ctx)?),
            MessageType::Comment => Message::Comment(Comment::decode(payload, ctx)?),
            MessageType::ModificationTimeOld => Message::ModTimeOld(ModTimeOld::decode(payload, ctx)?),
            MessageType::SharedMessageTable => {
                Message::SharedMessageTable(SohmTableMessage::decode(payload, ctx)?)
            }
            MessageType::Continuation => Message::Continuation(Continuation::decode(payload, ctx)?),
            MessageType::SymbolTable => Message::SymbolTable(SymbolTableMessage::decode(payload, ctx)?),
            MessageType::ModificationTime => Message::ModTime(ModTime::decode(payload, ctx)?),
            MessageType::BTreeKValues => Message::BTreeK(BTreeKValues::decode(payload, ctx)?),
            MessageType::DriverInfo => Message::DriverInfo(DriverInfoMessage::decode(payload, ctx)?),
            MessageType::AttributeInfo => Message::AttributeInfo(AttributeInfo::decode(payload, ctx)?),
            MessageType::ReferenceCount => Message::RefCount(RefCount::decode(payload, ctx)?),
            MessageType::FileSpaceInfo => Message::FileSpaceInfo(FileSpaceInfo::decode(payload, ctx)?),
            MessageType::Unknown(type_id) => {
                ctx.complain_value("unknown message type", u64::from(type_id));
                Message::Unknown {
                    type_id,
                    raw: payload.to_vec(),
                }
            }
        })
    }

    /// Kind of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Nil => MessageType::Nil,
            Message::Dataspace(_) => MessageType::Dataspace,
            Message::LinkInfo(_) => MessageType::LinkInfo,
            Message::Datatype(_) => MessageType::Datatype,
            Message::FillValueOld(_) => MessageType::FillValueOld,
            Message::FillValue(_) => MessageType::FillValue,
            Message::Link(_) => MessageType::Link,
            Message::ExternalFiles(_) => MessageType::ExternalFiles,
            Message::Layout(_) => MessageType::DataLayout,
            Message::Bogus(_) => MessageType::Bogus,
            Message::GroupInfo(_) => MessageType::GroupInfo,
            Message::FilterPipeline(_) => MessageType::FilterPipeline,
            Message::Attribute(_) => MessageType::Attribute,
            Message::Comment(_) => MessageType::Comment,
            Message::ModTimeOld(_) => MessageType::ModificationTimeOld,
            Message::SharedMessageTable(_) => MessageType::SharedMessageTable,
            Message::Continuation(_) => MessageType::Continuation,
            Message::SymbolTable(_) => MessageType::SymbolTable,
            Message::ModTime(_) => MessageType::ModificationTime,
            Message::BTreeK(_) => MessageType::BTreeKValues,
            Message::DriverInfo(_) => MessageType::DriverInfo,
            Message::AttributeInfo(_) => MessageType::AttributeInfo,
            Message::RefCount(_) => MessageType::ReferenceCount,
            Message::FileSpaceInfo(_) => MessageType::FileSpaceInfo,
            Message::Unknown { type_id, .. } => MessageType::Unknown(*type_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> MessageContext {
        MessageContext::new(Sizes::default(), CompatLevel::V18, 0x200)
    }

    #[test]
    fn version_clamping() {
        let mut c = ctx();
        assert_eq!(c.check_version("x", 2, 1..=3), 2);
        assert!(c.complaints.is_empty());
        assert_eq!(c.check_version("x", 9, 1..=3), 3);
        assert_eq!(c.check_version("x", 0, 1..=3), 1);
        assert_eq!(c.complaints.len(), 2);
        assert_eq!(c.complaints[0].address, Some(0x200));
    }

    #[test]
    fn shared_ref_versions() {
        let mut c = ctx();
        let mut v2 = vec![2u8, 0];
        v2.extend_from_slice(&0x400u64.to_le_bytes());
        assert_eq!(
            SharedRef::decode(&v2, &mut c).unwrap().kind,
            SharedKind::Committed { addr: 0x400 }
        );

        let mut v3 = vec![3u8, SHARE_TYPE_SOHM];
        v3.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            SharedRef::decode(&v3, &mut c).unwrap().kind,
            SharedKind::Sohm {
                heap_id: [1, 2, 3, 4, 5, 6, 7, 8]
            }
        );

        let mut v1 = vec![1u8, 0, 0, 0, 0, 0, 0, 0];
        v1.extend_from_slice(&0u64.to_le_bytes());
        v1.extend_from_slice(&0x800u64.to_le_bytes());
        assert_eq!(
            SharedRef::decode(&v1, &mut c).unwrap().kind,
            SharedKind::Committed { addr: 0x800 }
        );
        assert!(c.complaints.is_empty());
    }

    #[test]
    fn unknown_kind_is_kept() {
        let mut c = ctx();
        let m = Message::decode(MessageType::Unknown(0x42), &[1, 2, 3], &mut c).unwrap();
        assert_eq!(m.message_type(), MessageType::Unknown(0x42));
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn post_1_6_kinds_flagged() {
        let mut c = MessageContext::new(Sizes::default(), CompatLevel::V16, 0);
        Message::decode(MessageType::ReferenceCount, &[0, 1, 0, 0, 0], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }
}
