//! v4 media container: AES-ECB head + clear middle + XOR tail. PKCS#7
//! stripping uses the `cipher` crate's `block_padding::Pkcs7` feature.

use crate::error::{CoreError, CoreResult};
use crate::media::format_sniff::sniff;
use aes::Aes128;
use cipher::block_padding::{Pkcs7, UnpadError};
use ecb::cipher::{BlockDecryptMut, KeyInit};

pub const HEADER_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKeyVariant {
    V1,
    V2,
}

/// Variant 1's hard-coded key; origin undocumented, kept as a literal
/// constant and never inferred. The image-key validator rejects it for
/// a given user's blobs if it fails to decrypt their thumbnails, falling
/// back to a scanned variant-2 key.
const VARIANT_1_KEY: [u8; 16] = *b"cfcd208495d565ef";

#[derive(Debug)]
pub struct Header {
    pub variant: ImageKeyVariant,
    pub aes_enc_len: u32,
    pub xor_enc_len: u32,
}

pub fn parse_header(blob: &[u8]) -> CoreResult<Header> {
    if blob.len() < HEADER_LEN {
        return Err(CoreError::UnknownMediaFormat);
    }
    let variant = match &blob[0..4] {
        [0x07, 0x08, 0x56, 0x31] => ImageKeyVariant::V1,
        [0x07, 0x08, 0x56, 0x32] => ImageKeyVariant::V2,
        _ => return Err(CoreError::UnknownMediaFormat),
    };
    let aes_enc_len = u32::from_le_bytes(blob[6..10].try_into().unwrap());
    let xor_enc_len = u32::from_le_bytes(blob[10..14].try_into().unwrap());
    Ok(Header { variant, aes_enc_len, xor_enc_len })
}

/// Decodes a v4 blob given the body (bytes after the 15-byte header),
/// a resolved image key (for variant 2; variant 1 uses the hard-coded
/// key), and the XOR key derived from a sibling thumbnail.
pub fn decode_body(
    header: &Header,
    body: &[u8],
    image_key_v2: Option<&[u8; 16]>,
    xor_key: u8,
) -> CoreResult<Vec<u8>> {
    let aes_len = header.aes_enc_len.div_ceil(16) as usize * 16;
    let xor_len = header.xor_enc_len as usize;

    if aes_len.checked_add(xor_len).map(|n| n > body.len()).unwrap_or(true) {
        return Err(CoreError::UnknownMediaFormat);
    }

    let aes_region = &body[..aes_len];
    let xor_region = &body[body.len() - xor_len..];
    let middle = &body[aes_len..body.len() - xor_len];

    let key = match header.variant {
        ImageKeyVariant::V1 => VARIANT_1_KEY,
        ImageKeyVariant::V2 => *image_key_v2.ok_or(CoreError::UnknownMediaFormat)?,
    };

    let aes_plain = decrypt_ecb_tolerant_unpad(&key, aes_region);
    let xor_plain: Vec<u8> = xor_region.iter().map(|b| b ^ xor_key).collect();

    let mut out = Vec::with_capacity(aes_plain.len() + middle.len() + xor_plain.len());
    out.extend_from_slice(&aes_plain);
    out.extend_from_slice(middle);
    out.extend_from_slice(&xor_plain);
    Ok(out)
}

/// Decrypts an AES-ECB-encrypted region, stripping PKCS#7 padding when it
/// validates and keeping the raw decrypted bytes when it doesn't.
fn decrypt_ecb_tolerant_unpad(key: &[u8; 16], region: &[u8]) -> Vec<u8> {
    let mut buf = region.to_vec();
    for block in buf.chunks_exact_mut(16) {
        let mut decryptor = ecb::Decryptor::<Aes128>::new(key.into());
        decryptor.decrypt_block_mut(block.into());
    }

    match try_strip_pkcs7(&buf) {
        Ok(unpadded_len) => buf.truncate(unpadded_len),
        Err(_) => {}
    }
    buf
}

fn try_strip_pkcs7(buf: &[u8]) -> Result<usize, UnpadError> {
    if buf.is_empty() {
        return Err(UnpadError);
    }
    let unpadded = Pkcs7::raw_unpad(buf)?;
    Ok(unpadded.len())
}

/// Derives `xor_key` from a sibling `*_t.dat` thumbnail: its tail two
/// bytes, XORed with the JPEG end-of-image marker `FF D9`, must agree.
pub fn derive_xor_key_from_thumbnail(thumbnail_tail_2: [u8; 2]) -> CoreResult<u8> {
    const EOI: [u8; 2] = [0xFF, 0xD9];
    let k0 = thumbnail_tail_2[0] ^ EOI[0];
    let k1 = thumbnail_tail_2[1] ^ EOI[1];
    if k0 != k1 {
        return Err(CoreError::UnknownMediaFormat);
    }
    Ok(k0)
}

pub fn is_wxgf_container(plain: &[u8]) -> bool {
    sniff(plain) == Some(crate::media::format_sniff::Format::AnimatedStickerContainer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parses_variant_and_lengths() {
        let mut blob = vec![0x07, 0x08, 0x56, 0x31, 0x00, 0x00];
        blob.extend_from_slice(&1024u32.to_le_bytes());
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.push(0x01);
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.variant, ImageKeyVariant::V1);
        assert_eq!(header.aes_enc_len, 1024);
        assert_eq!(header.xor_enc_len, 2);
    }

    #[test]
    fn xor_key_derivation_requires_agreement() {
        let k = 0x37u8;
        let tail = [0xFFu8 ^ k, 0xD9u8 ^ k];
        assert_eq!(derive_xor_key_from_thumbnail(tail).unwrap(), k);
        assert!(derive_xor_key_from_thumbnail([0x00, 0xFF]).is_err());
    }

    #[test]
    fn oversized_region_lengths_are_rejected_not_panicking() {
        let header = Header { variant: ImageKeyVariant::V1, aes_enc_len: 1_000_000, xor_enc_len: 1_000_000 };
        let body = vec![0u8; 16];
        let err = decode_body(&header, &body, None, 0x00).unwrap_err();
        assert!(matches!(err, CoreError::UnknownMediaFormat));
    }

    #[test]
    fn tail_xor_round_trips_and_head_is_ecb_decrypted() {
        let key = [0x01u8; 16];
        let plain_head = [0xAAu8; 16];
        let mut head_cipher = plain_head.to_vec();
        let mut encryptor = ecb::Encryptor::<Aes128>::new((&key).into());
        use ecb::cipher::BlockEncryptMut;
        for block in head_cipher.chunks_exact_mut(16) {
            encryptor.encrypt_block_mut(block.into());
        }

        let middle = [0x55u8; 8];
        let xor_key = 0x09u8;
        let tail_plain = [0x11u8, 0x22];
        let tail_cipher: Vec<u8> = tail_plain.iter().map(|b| b ^ xor_key).collect();

        let mut body = Vec::new();
        body.extend_from_slice(&head_cipher);
        body.extend_from_slice(&middle);
        body.extend_from_slice(&tail_cipher);

        let header = Header { variant: ImageKeyVariant::V2, aes_enc_len: 16, xor_enc_len: 2 };
        let decoded = decode_body(&header, &body, Some(&key), xor_key).unwrap();

        assert_eq!(&decoded[16..24], &middle);
        assert_eq!(&decoded[24..26], &tail_plain);
    }
}
