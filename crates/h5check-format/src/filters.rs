//! Filter reversal for filtered fractal heap blocks and huge objects.
//!
//! Only the filters that ship with the library without external codecs are
//! reversed: deflate, shuffle and Fletcher-32. Filters are undone in the
//! reverse of their pipeline order; a set bit in the filter mask means the
//! filter at that position was skipped when the data was written.

use std::io::Read;

use crate::error::{CheckError, CheckResult, Complaint, Level};
use crate::messages::pipeline::{FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_SHUFFLE};
use crate::messages::FilterPipeline;

/// Undo `pipeline` on `data` read at `address`.
///
/// `element_size` is used by shuffle when the filter carries no element
/// size of its own.
pub fn reverse(
    pipeline: &FilterPipeline,
    mask: u32,
    data: &[u8],
    element_size: usize,
    address: u64,
) -> CheckResult<Vec<u8>> {
    let mut out = data.to_vec();
    for (i, filter) in pipeline.filters.iter().enumerate().rev() {
        if i < 32 && mask & (1 << i) != 0 {
            continue;
        }
        out = match filter.id {
            FILTER_DEFLATE => inflate(&out, address)?,
            FILTER_SHUFFLE => {
                let size = filter
                    .client_data
                    .first()
                    .map_or(element_size, |&n| n as usize);
                unshuffle(&out, size)
            }
            FILTER_FLETCHER32 => strip_fletcher32(&out, address)?,
            other => {
                return Err(Complaint::new(Level::Structure, "filtered data: filter cannot be reversed")
                    .at(address)
                    .value(u64::from(other))
                    .into())
            }
        };
    }
    Ok(out)
}

fn inflate(data: &[u8], address: u64) -> CheckResult<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| {
        CheckError::format(Level::Structure, format!("filtered data: inflate failed: {e}"), address)
    })?;
    Ok(out)
}

/// Regroup byte planes into elements. A trailing partial element is copied
/// through unchanged.
pub fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 || data.len() < element_size {
        return data.to_vec();
    }
    let count = data.len() / element_size;
    let body = count * element_size;
    let mut out = vec![0u8; data.len()];
    for i in 0..count {
        for j in 0..element_size {
            out[i * element_size + j] = data[j * count + i];
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

/// Fletcher-32 over big-endian 16-bit words; an odd trailing byte is the
/// high half of a final word.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for block in data.chunks(720) {
        let mut words = block.chunks_exact(2);
        for w in &mut words {
            sum1 += u32::from(w[0]) << 8 | u32::from(w[1]);
            sum2 += sum1;
        }
        if let [last] = words.remainder() {
            sum1 += u32::from(*last) << 8;
            sum2 += sum1;
        }
        sum1 %= 65535;
        sum2 %= 65535;
    }
    sum2 << 16 | sum1
}

fn strip_fletcher32(data: &[u8], address: u64) -> CheckResult<Vec<u8>> {
    if data.len() < 4 {
        return Err(CheckError::format(
            Level::Structure,
            "filtered data: too short for a Fletcher-32 checksum",
            address,
        ));
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let computed = fletcher32(body);
    if stored != computed {
        return Err(Complaint::new(
            Level::Structure,
            format!("filtered data: Fletcher-32 mismatch (computed {computed:#010x})"),
        )
        .at(address)
        .value(u64::from(stored))
        .into());
    }
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::FilterDescription;
    use std::io::Write;

    fn pipeline(ids: &[u16]) -> FilterPipeline {
        FilterPipeline {
            version: 2,
            filters: ids
                .iter()
                .map(|&id| FilterDescription {
                    id,
                    flags: 0,
                    name: None,
                    client_data: Vec::new(),
                })
                .collect(),
        }
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn shuffle(data: &[u8], size: usize) -> Vec<u8> {
        let n = data.len() / size;
        let mut out = vec![0; data.len()];
        for i in 0..n {
            for j in 0..size {
                out[j * n + i] = data[i * size + j];
            }
        }
        out
    }

    #[test]
    fn shuffle_then_deflate() {
        let raw: Vec<u8> = (0u32..64).flat_map(|v| v.to_le_bytes()).collect();
        let stored = deflate(&shuffle(&raw, 4));
        let out = reverse(&pipeline(&[FILTER_SHUFFLE, FILTER_DEFLATE]), 0, &stored, 4, 0x100).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn masked_filter_is_skipped() {
        let raw = b"plain text that was never compressed".to_vec();
        let out = reverse(&pipeline(&[FILTER_DEFLATE]), 0b1, &raw, 1, 0).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn fletcher_checked() {
        let mut data = vec![1u8, 2, 3, 4, 5];
        data.extend_from_slice(&fletcher32(&data).to_le_bytes());
        let p = pipeline(&[FILTER_FLETCHER32]);
        assert_eq!(reverse(&p, 0, &data, 1, 0).unwrap(), vec![1, 2, 3, 4, 5]);
        data[0] ^= 1;
        assert!(matches!(reverse(&p, 0, &data, 1, 0), Err(CheckError::Format(_))));
    }

    #[test]
    fn unknown_filter_is_reported() {
        let err = reverse(&pipeline(&[4]), 0, b"xx", 1, 0x40).unwrap_err();
        match err {
            CheckError::Format(c) => assert_eq!(c.bad_value, Some(4)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fletcher_known_values() {
        assert_eq!(fletcher32(&[0; 16]), 0);
        assert_eq!(fletcher32(&[0, 1]), 1 << 16 | 1);
    }
}
