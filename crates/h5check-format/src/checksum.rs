//! Jenkins lookup3 `hashlittle`, the checksum of every HDF5 metadata block
//! that carries one (superblock v2+, v2 object headers, B-tree v2 nodes,
//! fractal heap blocks, free-space and shared-message structures).

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Complaint, Level};

/// Checksum of `data` with the initial value HDF5 uses for metadata.
pub fn lookup3(data: &[u8]) -> u32 {
    hashlittle(data, 0)
}

#[inline]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline]
fn final_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Bob Jenkins' `hashlittle` over arbitrary bytes.
///
/// The tail shorter than twelve bytes is zero-padded, which matches the
/// byte-wise fall-through of the reference implementation.
pub fn hashlittle(data: &[u8], initval: u32) -> u32 {
    let init = 0xdead_beef_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(initval);
    let (mut a, mut b, mut c) = (init, init, init);
    if data.is_empty() {
        return c;
    }

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(LittleEndian::read_u32(&rest[0..4]));
        b = b.wrapping_add(LittleEndian::read_u32(&rest[4..8]));
        c = c.wrapping_add(LittleEndian::read_u32(&rest[8..12]));
        mix(&mut a, &mut b, &mut c);
        rest = &rest[12..];
    }

    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(LittleEndian::read_u32(&tail[0..4]));
    b = b.wrapping_add(LittleEndian::read_u32(&tail[4..8]));
    c = c.wrapping_add(LittleEndian::read_u32(&tail[8..12]));
    final_mix(&mut a, &mut b, &mut c);
    c
}

/// Verify a block whose last four bytes hold its checksum.
///
/// Returns a level-`level` complaint at `address` on mismatch, or when the
/// block is too short to hold a checksum.
pub fn verify_trailing(block: &[u8], address: u64, level: Level, what: &str) -> Option<Complaint> {
    if block.len() < 4 {
        return Some(
            Complaint::new(level, format!("{what}: block too small to hold a checksum"))
                .at(address),
        );
    }
    let (body, stored) = block.split_at(block.len() - 4);
    let stored = LittleEndian::read_u32(stored);
    let computed = lookup3(body);
    (stored != computed).then(|| {
        Complaint::new(
            level,
            format!("{what}: incorrect metadata checksum (stored {stored:#010x}, computed {computed:#010x})"),
        )
        .at(address)
        .value(u64::from(stored))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(lookup3(&[]), 0xdead_beef);
    }

    #[test]
    fn reference_vectors() {
        // Values from the driver program shipped with lookup3.c.
        let s = b"Four score and seven years ago";
        assert_eq!(hashlittle(s, 0), 0x1777_0551);
        assert_eq!(hashlittle(s, 1), 0xcd62_8161);
    }

    #[test]
    fn exact_block_and_tail_lengths_differ() {
        let twelve = [7u8; 12];
        let thirteen = [7u8; 13];
        assert_ne!(lookup3(&twelve), lookup3(&thirteen));
        assert_ne!(lookup3(&twelve[..11]), lookup3(&twelve));
    }

    #[test]
    fn trailing_checksum_verification() {
        let mut block = b"BTHD-some-header-bytes".to_vec();
        let cs = lookup3(&block);
        block.extend_from_slice(&cs.to_le_bytes());
        assert!(verify_trailing(&block, 64, Level::Structure, "header").is_none());

        block[3] ^= 1;
        let c = verify_trailing(&block, 64, Level::Structure, "header").unwrap();
        assert_eq!(c.address, Some(64));
        assert!(c.description.contains("checksum"));
        assert!(verify_trailing(&[1, 2], 0, Level::Structure, "x").is_some());
    }
}
