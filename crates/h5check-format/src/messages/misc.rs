//! Small messages: external files (0x07), bogus (0x09), comment (0x0D),
//! modification times (0x0E, 0x12), continuation (0x10) and reference
//! count (0x16).

use super::MessageContext;
use crate::error::CheckResult;

/// Payload of the bogus test message.
pub const BOGUS_VALUE: u32 = 0xdead_beef;

/// One slot of an external file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalSlot {
    /// Offset of the file name in the local heap.
    pub name_offset: u64,
    /// Byte offset of the data inside that file.
    pub file_offset: u64,
    /// Bytes reserved in that file.
    pub size: u64,
}

/// External data files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFileList {
    /// Allocated slots.
    pub allocated: u16,
    /// Local heap holding the file names.
    pub heap_addr: u64,
    /// Used slots.
    pub slots: Vec<ExternalSlot>,
}

impl ExternalFileList {
    /// Decode an external file list payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("external file list", raw_version, 1..=1);
        d.skip(3)?;
        let allocated = d.u16()?;
        let used = d.u16()?;
        if used > allocated {
            ctx.complain_value("external file list: more slots used than allocated", u64::from(used));
        }
        let heap_addr = d.addr(ctx.sizes)?;
        let mut slots = Vec::with_capacity(usize::from(used));
        for _ in 0..used {
            slots.push(ExternalSlot {
                name_offset: d.length(ctx.sizes)?,
                file_offset: d.length(ctx.sizes)?,
                size: d.length(ctx.sizes)?,
            });
        }
        Ok(Self {
            allocated,
            heap_addr,
            slots,
        })
    }
}

/// Test message carrying a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bogus {
    /// Stored value.
    pub value: u32,
}

impl Bogus {
    /// Decode a bogus payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let value = ctx.decoder(payload).u32()?;
        if value != BOGUS_VALUE {
            ctx.complain_value("bogus message: invalid value", u64::from(value));
        }
        Ok(Self { value })
    }
}

/// Object comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    /// Comment text.
    pub text: String,
}

impl Comment {
    /// Decode a comment payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let raw = ctx.decoder(payload).cstring()?;
        Ok(Self {
            text: String::from_utf8_lossy(raw).into_owned(),
        })
    }
}

/// Old modification time: `YYYYMMDDhhmmss` in ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModTimeOld {
    /// The fourteen digits.
    pub stamp: String,
}

impl ModTimeOld {
    /// Decode an old modification time payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let digits = d.bytes(14)?;
        d.skip(2)?;
        if !digits.iter().all(u8::is_ascii_digit) {
            ctx.complain("modification time (old): not all digits");
        }
        Ok(Self {
            stamp: String::from_utf8_lossy(digits).into_owned(),
        })
    }
}

/// Modification time in seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModTime {
    /// Seconds since 1970-01-01 UTC.
    pub seconds: u32,
}

impl ModTime {
    /// Decode a modification time payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("modification time", raw_version, 1..=1);
        d.skip(3)?;
        Ok(Self { seconds: d.u32()? })
    }
}

/// Pointer to the next header chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    /// Chunk address.
    pub addr: u64,
    /// Chunk length.
    pub length: u64,
}

impl Continuation {
    /// Decode a continuation payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let addr = d.addr(ctx.sizes)?;
        let length = d.length(ctx.sizes)?;
        if length == 0 {
            ctx.complain("continuation: zero-length chunk");
        }
        Ok(Self { addr, length })
    }
}

/// Object reference count, for new-style headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCount {
    /// Hard link count.
    pub count: u32,
}

impl RefCount {
    /// Decode a reference count payload.
    pub fn decode(payload: &[u8], ctx: &mut MessageContext) -> CheckResult<Self> {
        let mut d = ctx.decoder(payload);
        let raw_version = d.u8()?;
        ctx.check_version("reference count", raw_version, 0..=0);
        let count = d.u32()?;
        if count == 0 {
            ctx.complain("reference count: zero");
        }
        Ok(Self { count })
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
    fn bogus_value() {
        let mut c = ctx();
        Bogus::decode(&BOGUS_VALUE.to_le_bytes(), &mut c).unwrap();
        assert!(c.complaints.is_empty());
        Bogus::decode(&[1, 2, 3, 4], &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn old_mtime_digits() {
        let mut c = ctx();
        let m = ModTimeOld::decode(b"20240131120000\0\0", &mut c).unwrap();
        assert_eq!(m.stamp, "20240131120000");
        assert!(c.complaints.is_empty());
        ModTimeOld::decode(b"2024013112000x\0\0", &mut c).unwrap();
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn comment_requires_nul() {
        let mut c = ctx();
        assert_eq!(Comment::decode(b"hello\0", &mut c).unwrap().text, "hello");
        assert!(Comment::decode(b"hello", &mut c).is_err());
    }

    #[test]
    fn efl_used_exceeds_allocated() {
        let mut c = ctx();
        let mut p = vec![1, 0, 0, 0];
        p.extend_from_slice(&0u16.to_le_bytes());
        p.extend_from_slice(&1u16.to_le_bytes());
        p.extend_from_slice(&0x300u64.to_le_bytes());
        for v in [8u64, 0, 100] {
            p.extend_from_slice(&v.to_le_bytes());
        }
        let efl = ExternalFileList::decode(&p, &mut c).unwrap();
        assert_eq!(efl.slots[0].size, 100);
        assert_eq!(c.complaints.len(), 1);
    }

    #[test]
    fn continuation_and_refcount() {
        let mut c = ctx();
        let mut p = 0x1000u64.to_le_bytes().to_vec();
        p.extend_from_slice(&256u64.to_le_bytes());
        let k = Continuation::decode(&p, &mut c).unwrap();
        assert_eq!(k.length, 256);
        let r = RefCount::decode(&[0, 2, 0, 0, 0], &mut c).unwrap();
        assert_eq!(r.count, 2);
        assert!(c.complaints.is_empty());
    }
}
