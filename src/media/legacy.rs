//! Legacy single-byte-XOR media encoding, using the same
//! magic-header-table idiom as [`crate::media::format_sniff`].

use crate::error::{CoreError, CoreResult};
use crate::media::format_sniff::{legacy_candidate_headers, sniff, Format};

/// Infers the single XOR byte by comparing the blob's first 3-4 bytes
/// against every known format header; all compared header bytes must
/// yield the same XOR byte for a format to be accepted.
pub fn infer_xor_key(blob: &[u8]) -> Option<(u8, Format)> {
    for (format, header) in legacy_candidate_headers() {
        if blob.len() < header.len() {
            continue;
        }
        let mut candidate_key = None;
        let mut agree = true;
        for (b, h) in blob.iter().zip(header.iter()) {
            let k = b ^ h;
            match candidate_key {
                None => candidate_key = Some(k),
                Some(existing) if existing != k => {
                    agree = false;
                    break;
                }
                _ => {}
            }
        }
        if agree {
            if let Some(key) = candidate_key {
                return Some((key, format));
            }
        }
    }
    None
}

/// Decodes a legacy XOR-encoded blob, returning the plaintext and its
/// detected format tag.
pub fn decode(blob: &[u8]) -> CoreResult<(Vec<u8>, &'static str)> {
    let (key, _) = infer_xor_key(blob).ok_or(CoreError::UnknownMediaFormat)?;
    let plain: Vec<u8> = blob.iter().map(|b| b ^ key).collect();
    let format = sniff(&plain).ok_or(CoreError::UnknownMediaFormat)?;
    Ok((plain, format.tag()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_xor_encoded_jpeg() {
        let k = 0x37u8;
        let plain = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let blob: Vec<u8> = plain.iter().map(|b| b ^ k).collect();

        let (decoded, tag) = decode(&blob).unwrap();
        assert_eq!(decoded, plain);
        assert_eq!(tag, "jpg");
    }

    #[test]
    fn disagreeing_header_bytes_are_rejected() {
        // Header bytes that don't agree on a single XOR byte for any
        // known format should fail to decode.
        let blob = vec![0x00, 0x01, 0x02, 0x03, 0x04];
        assert!(decode(&blob).is_err());
    }
}
