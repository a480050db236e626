//! HDF5 object header message type identifiers.

/// Object header message types, ids 0x00 through 0x17.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nil,
    Dataspace,
    LinkInfo,
    Datatype,
    FillValueOld,
    FillValue,
    Link,
    ExternalFiles,
    DataLayout,
    Bogus,
    GroupInfo,
    FilterPipeline,
    Attribute,
    Comment,
    ModificationTimeOld,
    SharedMessageTable,
    Continuation,
    SymbolTable,
    ModificationTime,
    BTreeKValues,
    DriverInfo,
    AttributeInfo,
    ReferenceCount,
    FileSpaceInfo,
    /// Unrecognized type with its raw id.
    Unknown(u16),
}

impl MessageType {
    const KNOWN: [MessageType; 24] = [
        MessageType::Nil,
        MessageType::Dataspace,
        MessageType::LinkInfo,
        MessageType::Datatype,
        MessageType::FillValueOld,
        MessageType::FillValue,
        MessageType::Link,
        MessageType::ExternalFiles,
        MessageType::DataLayout,
        MessageType::Bogus,
        MessageType::GroupInfo,
        MessageType::FilterPipeline,
        MessageType::Attribute,
        MessageType::Comment,
        MessageType::ModificationTimeOld,
        MessageType::SharedMessageTable,
        MessageType::Continuation,
        MessageType::SymbolTable,
        MessageType::ModificationTime,
        MessageType::BTreeKValues,
        MessageType::DriverInfo,
        MessageType::AttributeInfo,
        MessageType::ReferenceCount,
        MessageType::FileSpaceInfo,
    ];

    /// Convert a raw id to a `MessageType`.
    pub fn from_u16(val: u16) -> MessageType {
        Self::KNOWN
            .get(usize::from(val))
            .copied()
            .unwrap_or(MessageType::Unknown(val))
    }

    /// Raw id.
    pub fn to_u16(self) -> u16 {
        match self {
            MessageType::Unknown(v) => v,
            known => Self::KNOWN
                .iter()
                .position(|k| *k == known)
                .map_or(u16::MAX, |i| i as u16),
        }
    }

    /// Name used in complaints.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Nil => "NIL",
            MessageType::Dataspace => "dataspace",
            MessageType::LinkInfo => "link info",
            MessageType::Datatype => "datatype",
            MessageType::FillValueOld => "fill value (old)",
            MessageType::FillValue => "fill value",
            MessageType::Link => "link",
            MessageType::ExternalFiles => "external data files",
            MessageType::DataLayout => "data layout",
            MessageType::Bogus => "bogus",
            MessageType::GroupInfo => "group info",
            MessageType::FilterPipeline => "filter pipeline",
            MessageType::Attribute => "attribute",
            MessageType::Comment => "object comment",
            MessageType::ModificationTimeOld => "modification time (old)",
            MessageType::SharedMessageTable => "shared message table",
            MessageType::Continuation => "continuation",
            MessageType::SymbolTable => "symbol table",
            MessageType::ModificationTime => "modification time",
            MessageType::BTreeKValues => "B-tree 'K' values",
            MessageType::DriverInfo => "driver info",
            MessageType::AttributeInfo => "attribute info",
            MessageType::ReferenceCount => "reference count",
            MessageType::FileSpaceInfo => "file space info",
            MessageType::Unknown(_) => "unknown",
        }
    }

    /// Kinds that may be stored in the shared message heap or as committed
    /// objects.
    pub fn is_shareable(self) -> bool {
        matches!(
            self,
            MessageType::Dataspace
                | MessageType::Datatype
                | MessageType::FillValue
                | MessageType::FilterPipeline
                | MessageType::Attribute
        )
    }

    /// Bit of this kind in a shared message index type mask.
    pub fn sohm_flag(self) -> Option<u16> {
        self.is_shareable().then(|| 1u16 << self.to_u16())
    }

    /// Kinds introduced with the 1.8 format.
    pub fn is_post_1_6(self) -> bool {
        matches!(
            self,
            MessageType::LinkInfo
                | MessageType::Link
                | MessageType::GroupInfo
                | MessageType::SharedMessageTable
                | MessageType::BTreeKValues
                | MessageType::DriverInfo
                | MessageType::AttributeInfo
                | MessageType::ReferenceCount
                | MessageType::FileSpaceInfo
        )
    }
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} message ({:#04x})", self.name(), self.to_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_roundtrip() {
        for id in 0u16..0x18 {
            let mt = MessageType::from_u16(id);
            assert!(!matches!(mt, MessageType::Unknown(_)), "id {id}");
            assert_eq!(mt.to_u16(), id);
        }
        assert_eq!(MessageType::from_u16(0x0007), MessageType::ExternalFiles);
        assert_eq!(MessageType::from_u16(0x0017), MessageType::FileSpaceInfo);
    }

    #[test]
    fn unknown_type() {
        let mt = MessageType::from_u16(0x0018);
        assert_eq!(mt, MessageType::Unknown(0x0018));
        assert_eq!(mt.to_u16(), 0x0018);
        assert_eq!(mt.name(), "unknown");
    }

    #[test]
    fn sohm_flags() {
        assert_eq!(MessageType::Dataspace.sohm_flag(), Some(0x0002));
        assert_eq!(MessageType::Datatype.sohm_flag(), Some(0x0008));
        assert_eq!(MessageType::Attribute.sohm_flag(), Some(0x1000));
        assert_eq!(MessageType::Link.sohm_flag(), None);
    }
}
