//! Validators used by [`crate::keys::find`]/[`find_parallel`]: the
//! page-1 HMAC check for the database master key, and the AES-ECB
//! thumbnail-magic check for the v4 image key.

use crate::crypto::derive_keys;
use crate::media::format_sniff::sniff;
use crate::model::{Profile, IV_SIZE, KEY_SIZE, SALT_SIZE};
use aes::Aes128;
use ecb::cipher::{BlockDecryptMut, KeyInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha512;

/// Builds a validator that derives `page_key`/`mac_key` from a candidate
/// 32-byte master key and `salt`, then checks page 1's HMAC against
/// `encrypted_page1` (the full raw page-1 bytes, salt included).
pub fn page1_hmac_validator(
    salt: [u8; SALT_SIZE],
    encrypted_page1: Vec<u8>,
    profile: Profile,
) -> impl Fn(&[u8; KEY_SIZE]) -> bool {
    move |candidate: &[u8; KEY_SIZE]| -> bool {
        let (_, mac_key) = derive_keys(candidate, &salt, profile);
        let body_end = profile.page_size - profile.reserved;
        if encrypted_page1.len() < body_end + IV_SIZE + profile.mac_size {
            return false;
        }
        let body = &encrypted_page1[SALT_SIZE..body_end];
        let iv = &encrypted_page1[body_end..body_end + IV_SIZE];
        let mac_tag = &encrypted_page1[body_end + IV_SIZE..body_end + IV_SIZE + profile.mac_size];

        match profile.version {
            crate::model::SchemaVersion::V3 => {
                let mut mac = match <Hmac<Sha1> as Mac>::new_from_slice(&mac_key) {
                    Ok(m) => m,
                    Err(_) => return false,
                };
                mac.update(body);
                mac.update(iv);
                mac.update(&1u32.to_le_bytes());
                mac.verify_slice(mac_tag).is_ok()
            }
            crate::model::SchemaVersion::V4 => {
                let mut mac = match <Hmac<Sha512> as Mac>::new_from_slice(&mac_key) {
                    Ok(m) => m,
                    Err(_) => return false,
                };
                mac.update(body);
                mac.update(iv);
                mac.update(&1u32.to_le_bytes());
                mac.verify_slice(mac_tag).is_ok()
            }
        }
    }
}

/// Builds a validator for the 16-byte v4 image key: candidate must
/// AES-ECB-decrypt the head of a known thumbnail file to bytes beginning
/// with a recognized image-format magic.
pub fn image_key_validator(thumbnail_head: Vec<u8>) -> impl Fn(&[u8; 16]) -> bool {
    move |candidate: &[u8; 16]| -> bool {
        if thumbnail_head.len() < 16 {
            return false;
        }
        let mut block = thumbnail_head[..16].to_vec();
        let mut decryptor = ecb::Decryptor::<Aes128>::new(candidate.into());
        decryptor.decrypt_block_mut(block.as_mut_slice().into());
        sniff(&block).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page1_hmac_validator_accepts_matching_key_and_rejects_wrong_one() {
        use crate::crypto;
        use aes::Aes256;
        use cbc::cipher::{BlockEncryptMut, KeyIvInit};

        let profile = Profile::v3();
        let master_key = [0x42u8; KEY_SIZE];
        let salt = [0x09u8; SALT_SIZE];
        let (page_key, mac_key) = crypto::derive_keys(&master_key, &salt, profile);

        let body_len = profile.page_size - profile.reserved - SALT_SIZE;
        let mut body = vec![0xAB; body_len];
        let iv = [0x01u8; IV_SIZE];
        let mut cipher = cbc::Encryptor::<Aes256>::new(page_key.as_slice().into(), (&iv).into());
        for block in body.chunks_exact_mut(16) {
            cipher.encrypt_block_mut(block.into());
        }

        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&mac_key).unwrap();
        mac.update(&body);
        mac.update(&iv);
        mac.update(&1u32.to_le_bytes());
        let tag = mac.finalize().into_bytes();

        let mut page1 = Vec::new();
        page1.extend_from_slice(&salt);
        page1.extend_from_slice(&body);
        page1.extend_from_slice(&iv);
        page1.extend_from_slice(&tag);
        page1.resize(profile.page_size, 0);

        let validator = page1_hmac_validator(salt, page1, profile);
        assert!(validator(&master_key));
        assert!(!validator(&[0u8; KEY_SIZE]));
    }
}
