//! Little-endian field decoding over a byte image read from the file.
//!
//! [`Decoder`] is a cursor that knows the file address of its first byte,
//! so a short read turns into a complaint pointing at the right place.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{CheckError, CheckResult, Complaint, Level};

/// The undefined address: all bits set in the file's offset width.
pub const UNDEF_ADDR: u64 = u64::MAX;

/// True for the undefined-address sentinel.
pub fn is_undef(addr: u64) -> bool {
    addr == UNDEF_ADDR
}

/// Widths of file offsets and lengths, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    /// Size of offsets (addresses).
    pub offset: u8,
    /// Size of lengths.
    pub length: u8,
}

impl Sizes {
    /// Widths allowed by the format.
    pub const VALID: [u8; 5] = [2, 4, 8, 16, 32];

    /// New pair of widths.
    pub const fn new(offset: u8, length: u8) -> Self {
        Self { offset, length }
    }

    /// Offset width as `usize`.
    pub fn addr_width(self) -> usize {
        usize::from(self.offset)
    }

    /// Length width as `usize`.
    pub fn len_width(self) -> usize {
        usize::from(self.length)
    }

    /// True when `width` is one of the allowed widths.
    pub fn is_valid_width(width: u8) -> bool {
        Self::VALID.contains(&width)
    }
}

impl Default for Sizes {
    fn default() -> Self {
        Self::new(8, 8)
    }
}

/// Cursor over a byte image.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
    level: Level,
}

impl<'a> Decoder<'a> {
    /// Cursor over `buf`, whose first byte lives at file address `base`.
    pub fn new(buf: &'a [u8], base: u64, level: Level) -> Self {
        Self {
            buf,
            pos: 0,
            base,
            level,
        }
    }

    /// Current position within the image.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// File address of the current position.
    pub fn address(&self) -> u64 {
        self.base.wrapping_add(self.pos as u64)
    }

    /// File address of the start of the image.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when no bytes are left.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The whole image.
    pub fn image(&self) -> &'a [u8] {
        self.buf
    }

    /// Move to absolute position `pos`.
    pub fn seek(&mut self, pos: usize) -> CheckResult<()> {
        if pos > self.buf.len() {
            return Err(self.short(pos - self.pos));
        }
        self.pos = pos;
        Ok(())
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> CheckResult<()> {
        self.bytes(n).map(|_| ())
    }

    fn short(&self, need: usize) -> CheckError {
        Complaint::new(
            self.level,
            format!(
                "structure truncated: need {need} bytes, {} available",
                self.remaining()
            ),
        )
        .at(self.address())
        .into()
    }

    /// Next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> CheckResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.short(n));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Peek at the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> CheckResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.short(n));
        }
        Ok(&self.buf[self.pos..self.pos + n])
    }

    /// One byte.
    pub fn u8(&mut self) -> CheckResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Little-endian `u16`.
    pub fn u16(&mut self) -> CheckResult<u16> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    /// Little-endian `u32`.
    pub fn u32(&mut self) -> CheckResult<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    /// Little-endian `u64`.
    pub fn u64(&mut self) -> CheckResult<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    /// Little-endian unsigned integer of `width` bytes.
    ///
    /// Widths above 8 are accepted when the high bytes are zero.
    pub fn uint(&mut self, width: usize) -> CheckResult<u64> {
        let at = self.address();
        let raw = self.bytes(width)?;
        decode_uint(raw).ok_or_else(|| {
            Complaint::new(
                self.level,
                format!("{width}-byte value does not fit in 64 bits"),
            )
            .at(at)
            .into()
        })
    }

    /// File address in the file's offset width. All bits set decodes as
    /// [`UNDEF_ADDR`].
    pub fn addr(&mut self, sizes: Sizes) -> CheckResult<u64> {
        let at = self.address();
        let raw = self.bytes(sizes.addr_width())?;
        if raw.iter().all(|&b| b == 0xff) {
            return Ok(UNDEF_ADDR);
        }
        decode_uint(raw).ok_or_else(|| {
            Complaint::new(self.level, "address does not fit in 64 bits")
                .at(at)
                .into()
        })
    }

    /// Length in the file's length width. All bits set decodes as
    /// `u64::MAX` ("unlimited" in dataspace maxima).
    pub fn length(&mut self, sizes: Sizes) -> CheckResult<u64> {
        let at = self.address();
        let raw = self.bytes(sizes.len_width())?;
        if raw.iter().all(|&b| b == 0xff) {
            return Ok(u64::MAX);
        }
        decode_uint(raw).ok_or_else(|| {
            Complaint::new(self.level, "length does not fit in 64 bits")
                .at(at)
                .into()
        })
    }

    /// Bytes up to (not including) the next NUL; the NUL is consumed.
    pub fn cstring(&mut self) -> CheckResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(n) => {
                self.pos += n + 1;
                Ok(&rest[..n])
            }
            None => Err(Complaint::new(self.level, "string is not NUL-terminated")
                .at(self.address())
                .into()),
        }
    }

    /// Advance to the next multiple of `align` relative to the image start.
    pub fn align(&mut self, align: usize) -> CheckResult<()> {
        let pad = (align - self.pos % align) % align;
        self.skip(pad)
    }
}

/// Decode a little-endian unsigned integer of any width; `None` when a byte
/// above the eighth is non-zero.
pub fn decode_uint(raw: &[u8]) -> Option<u64> {
    if raw.len() > 8 && raw[8..].iter().any(|&b| b != 0) {
        return None;
    }
    let n = raw.len().min(8);
    Some(LittleEndian::read_uint(&pad8(&raw[..n]), 8))
}

fn pad8(raw: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..raw.len()].copy_from_slice(raw);
    out
}

/// Encode `value` in `width` little-endian bytes.
pub fn encode_uint(value: u64, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    let le = value.to_le_bytes();
    let n = width.min(8);
    out[..n].copy_from_slice(&le[..n]);
    out
}

/// Encode an address, writing the undefined address as all bits set.
pub fn encode_addr(addr: u64, width: usize) -> Vec<u8> {
    if is_undef(addr) {
        vec![0xff; width]
    } else {
        encode_uint(addr, width)
    }
}

/// Floor of log2 of `n`; 0 for 0.
pub fn log2_gen(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        63 - n.leading_zeros()
    }
}

/// log2 of a power of two.
pub fn log2_of2(n: u64) -> u32 {
    n.trailing_zeros()
}

/// Bytes needed to encode values up to `limit`.
pub fn limit_enc_size(limit: u64) -> usize {
    (log2_gen(limit) / 8 + 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixed_width_reads() {
        let data = [1u8, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 9];
        let mut d = Decoder::new(&data, 100, Level::Structure);
        assert_eq!(d.u8().unwrap(), 1);
        assert_eq!(d.u16().unwrap(), 0x1234);
        assert_eq!(d.u32().unwrap(), 0x1234_5678);
        assert_eq!(d.address(), 107);
        assert_eq!(d.remaining(), 1);
        assert!(d.u16().is_err());
    }

    #[test]
    fn short_read_reports_address() {
        let data = [0u8; 3];
        let mut d = Decoder::new(&data, 0x40, Level::Message);
        d.skip(2).unwrap();
        match d.u32() {
            Err(CheckError::Format(c)) => {
                assert_eq!(c.address, Some(0x42));
                assert_eq!(c.level, Level::Message);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undefined_address() {
        let data = [0xffu8; 8];
        let mut d = Decoder::new(&data, 0, Level::Structure);
        assert_eq!(d.addr(Sizes::new(4, 8)).unwrap(), UNDEF_ADDR);
        assert_eq!(d.addr(Sizes::new(4, 8)).unwrap(), UNDEF_ADDR);
    }

    #[test]
    fn wide_fields() {
        let mut data = vec![0u8; 16];
        data[0] = 0x10;
        let mut d = Decoder::new(&data, 0, Level::Structure);
        assert_eq!(d.addr(Sizes::new(16, 16)).unwrap(), 0x10);

        data[12] = 1;
        let mut d = Decoder::new(&data, 0, Level::Structure);
        assert!(d.addr(Sizes::new(16, 16)).is_err());
    }

    #[test]
    fn cstring_and_align() {
        let data = b"abc\0\0\0\0\0xyz";
        let mut d = Decoder::new(data, 0, Level::Message);
        assert_eq!(d.cstring().unwrap(), b"abc");
        d.align(8).unwrap();
        assert_eq!(d.position(), 8);
        assert!(d.cstring().is_err());
    }

    #[test]
    fn log_helpers() {
        assert_eq!(log2_gen(1), 0);
        assert_eq!(log2_gen(255), 7);
        assert_eq!(log2_gen(256), 8);
        assert_eq!(log2_of2(4096), 12);
        assert_eq!(limit_enc_size(0), 1);
        assert_eq!(limit_enc_size(255), 1);
        assert_eq!(limit_enc_size(256), 2);
        assert_eq!(limit_enc_size(u64::MAX), 8);
    }

    proptest! {
        #[test]
        fn address_field_roundtrip(
            width in prop::sample::select(vec![2usize, 4, 8, 16, 32]),
            raw in any::<u64>(),
        ) {
            let bits = (width.min(8) * 8) as u32;
            let value = if bits == 64 { raw } else { raw & ((1u64 << bits) - 1) };
            let sizes = Sizes::new(width as u8, width as u8);
            let bytes = encode_addr(value, width);
            let mut d = Decoder::new(&bytes, 0, Level::Structure);
            let decoded = d.addr(sizes).unwrap();
            let all_ones = bytes.iter().all(|&b| b == 0xff);
            prop_assert_eq!(decoded, if all_ones { UNDEF_ADDR } else { value });
            prop_assert_eq!(encode_addr(decoded, width), bytes);
        }
    }
}
