//! HDF5 file signature detection and structure signatures.

use h5check_io::Driver;

use crate::error::{CheckError, CheckResult, Level};

/// The 8-byte HDF5 format signature.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n'];

/// Four-byte signatures of the checksummed and legacy metadata structures.
pub mod magic {
    /// Version 2 object header.
    pub const OHDR: &[u8; 4] = b"OHDR";
    /// Version 2 object header continuation chunk.
    pub const OCHK: &[u8; 4] = b"OCHK";
    /// Version 1 B-tree node.
    pub const TREE: &[u8; 4] = b"TREE";
    /// Symbol table node.
    pub const SNOD: &[u8; 4] = b"SNOD";
    /// Local heap.
    pub const HEAP: &[u8; 4] = b"HEAP";
    /// Global heap collection.
    pub const GCOL: &[u8; 4] = b"GCOL";
    /// Version 2 B-tree header.
    pub const BTHD: &[u8; 4] = b"BTHD";
    /// Version 2 B-tree internal node.
    pub const BTIN: &[u8; 4] = b"BTIN";
    /// Version 2 B-tree leaf node.
    pub const BTLF: &[u8; 4] = b"BTLF";
    /// Fractal heap header.
    pub const FRHP: &[u8; 4] = b"FRHP";
    /// Fractal heap direct block.
    pub const FHDB: &[u8; 4] = b"FHDB";
    /// Fractal heap indirect block.
    pub const FHIB: &[u8; 4] = b"FHIB";
    /// Free-space manager header.
    pub const FSHD: &[u8; 4] = b"FSHD";
    /// Free-space section list.
    pub const FSSE: &[u8; 4] = b"FSSE";
    /// Shared message master table.
    pub const SMTB: &[u8; 4] = b"SMTB";
    /// Shared message list index.
    pub const SMLI: &[u8; 4] = b"SMLI";
    /// Fixed array header.
    pub const FAHD: &[u8; 4] = b"FAHD";
    /// Fixed array data block.
    pub const FADB: &[u8; 4] = b"FADB";
    /// Extensible array header.
    pub const EAHD: &[u8; 4] = b"EAHD";
    /// Extensible array index block.
    pub const EAIB: &[u8; 4] = b"EAIB";
}

/// Search for the HDF5 signature at offset 0 and then at 512, 1024, 2048,
/// and so on, below the end of file.
///
/// Returns the physical offset of the signature.
pub fn locate(driver: &Driver) -> CheckResult<u64> {
    let eof = driver.physical_eof();
    let mut offset = 0u64;
    while offset.checked_add(8).is_some_and(|end| end <= eof) {
        let mut sig = [0u8; 8];
        driver.read_into(offset.wrapping_sub(driver.base()), &mut sig)?;
        if sig == HDF5_SIGNATURE {
            return Ok(offset);
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }
    Err(CheckError::format(
        Level::Superblock,
        "unable to find the HDF5 file signature",
        0,
    ))
}

/// Compare a four-byte structure signature.
pub fn matches(found: &[u8], expected: &[u8; 4]) -> bool {
    found.len() >= 4 && &found[..4] == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_signature_at(len: usize, at: Option<usize>) -> Driver {
        let mut data = vec![0u8; len];
        if let Some(at) = at {
            data[at..at + 8].copy_from_slice(&HDF5_SIGNATURE);
        }
        Driver::memory("sig", data)
    }

    #[test]
    fn found_at_zero() {
        assert_eq!(locate(&image_with_signature_at(64, Some(0))).unwrap(), 0);
    }

    #[test]
    fn found_at_power_of_two() {
        assert_eq!(locate(&image_with_signature_at(1100, Some(512))).unwrap(), 512);
        assert_eq!(locate(&image_with_signature_at(4096, Some(2048))).unwrap(), 2048);
    }

    #[test]
    fn not_found_between_candidate_offsets() {
        assert!(locate(&image_with_signature_at(1024, Some(100))).is_err());
        assert!(locate(&image_with_signature_at(4, None)).is_err());
    }

    #[test]
    fn earliest_wins() {
        let mut data = vec![0u8; 1024];
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        data[512..520].copy_from_slice(&HDF5_SIGNATURE);
        assert_eq!(locate(&Driver::memory("sig", data)).unwrap(), 0);
    }

    #[test]
    fn structure_magic() {
        assert!(matches(b"TREE\x00", magic::TREE));
        assert!(!matches(b"TRE", magic::TREE));
        assert!(!matches(b"SNOD", magic::TREE));
    }
}
