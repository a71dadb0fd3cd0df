//! Database decryptor. Streams an encrypted, page-structured SQLite
//! file back to plaintext: per-page HMAC verification, AES-CBC
//! decryption, SQLite header reconstruction on page 1, hex-key parsing
//! and a directory batch driver with a recoverable-vs-fatal split.
//! Generalized from v3-only constants to the `Profile` table covering
//! both v3 and v4.

use crate::error::{CoreError, CoreResult};
use crate::model::{Profile, SchemaVersion, IV_SIZE, KEY_SIZE, SALT_SIZE, SQLITE_HEADER};
use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha512;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub type CancellationToken = std::sync::Arc<AtomicBool>;

pub fn new_cancellation_token() -> CancellationToken {
    std::sync::Arc::new(AtomicBool::new(false))
}

/// `page_key`/`mac_key` derivation. Generic over the profile's PRF so
/// v3 (SHA-1) and v4 (SHA-512) share one code path.
pub fn derive_keys(master_key: &[u8; KEY_SIZE], salt: &[u8; SALT_SIZE], profile: Profile) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
    let mac_salt: Vec<u8> = salt.iter().map(|&b| b ^ 0x3a).collect();
    let mut page_key = [0u8; KEY_SIZE];
    let mut mac_key = [0u8; KEY_SIZE];

    match profile.version {
        SchemaVersion::V3 => {
            pbkdf2_hmac::<Sha1>(master_key, salt, profile.kdf_rounds, &mut page_key);
            pbkdf2_hmac::<Sha1>(&page_key, &mac_salt, 2, &mut mac_key);
        }
        SchemaVersion::V4 => {
            pbkdf2_hmac::<Sha512>(master_key, salt, profile.kdf_rounds, &mut page_key);
            pbkdf2_hmac::<Sha512>(&page_key, &mac_salt, 2, &mut mac_key);
        }
    }

    (page_key, mac_key)
}

fn hmac_page(mac_key: &[u8; KEY_SIZE], body: &[u8], iv: &[u8], page_index: u32, profile: Profile) -> Vec<u8> {
    match profile.version {
        SchemaVersion::V3 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(mac_key).expect("valid hmac key length");
            mac.update(body);
            mac.update(iv);
            mac.update(&page_index.to_le_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        SchemaVersion::V4 => {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(mac_key).expect("valid hmac key length");
            mac.update(body);
            mac.update(iv);
            mac.update(&page_index.to_le_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Returns true iff `first_16` equals the SQLite magic string — callers
/// should copy the file verbatim instead of decrypting (`AlreadyDecrypted`).
pub fn is_already_plaintext(first_16: &[u8]) -> bool {
    first_16.len() >= SQLITE_HEADER.len() && &first_16[..SQLITE_HEADER.len()] == SQLITE_HEADER
}

/// Streams `encrypted` page-by-page into `out`, emitting a standards
/// compliant SQLite file. Preconditions: `total_len` is a positive
/// multiple of `profile.page_size`.
pub fn decrypt(
    mut encrypted: impl Read,
    total_len: u64,
    master_key: &[u8; KEY_SIZE],
    profile: Profile,
    mut out: impl Write,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let page_size = profile.page_size as u64;
    if total_len == 0 || total_len % page_size != 0 {
        return Err(CoreError::IncompleteRead);
    }
    let page_count = total_len / page_size;

    let mut page_buf = vec![0u8; profile.page_size];
    let mut mac_key: Option<[u8; KEY_SIZE]> = None;
    let mut page_key: Option<[u8; KEY_SIZE]> = None;

    for page_index in 1..=page_count {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::OperationCanceled);
        }

        encrypted
            .read_exact(&mut page_buf)
            .map_err(|_| CoreError::IncompleteRead)?;

        let is_first = page_index == 1;
        let reserved = profile.reserved;
        let (body_ciphertext, iv, mac_tag, salt): (&[u8], &[u8], &[u8], Option<[u8; SALT_SIZE]>) = if is_first {
            let salt: [u8; SALT_SIZE] = page_buf[..SALT_SIZE].try_into().unwrap();
            let body_end = profile.page_size - reserved;
            (
                &page_buf[SALT_SIZE..body_end],
                &page_buf[body_end..body_end + IV_SIZE],
                &page_buf[body_end + IV_SIZE..body_end + IV_SIZE + profile.mac_size],
                Some(salt),
            )
        } else {
            let body_end = profile.page_size - reserved;
            (
                &page_buf[..body_end],
                &page_buf[body_end..body_end + IV_SIZE],
                &page_buf[body_end + IV_SIZE..body_end + IV_SIZE + profile.mac_size],
                None,
            )
        };

        if let Some(salt) = salt {
            let (pk, mk) = derive_keys(master_key, &salt, profile);
            page_key = Some(pk);
            mac_key = Some(mk);
        }
        let mac_key = mac_key.expect("mac_key derived from page 1's salt before any page is verified");
        let page_key = page_key.expect("page_key derived alongside mac_key");

        let expected = hmac_page(&mac_key, body_ciphertext, iv, page_index as u32, profile);
        if expected != mac_tag {
            if is_first {
                return Err(CoreError::IncorrectKey);
            }
            return Err(CoreError::HashVerificationFailed(page_index as u32));
        }

        let mut plaintext = body_ciphertext.to_vec();
        let mut cipher = cbc::Decryptor::<Aes256>::new(page_key.as_slice().into(), iv.into());
        for block in plaintext.chunks_exact_mut(16) {
            cipher.decrypt_block_mut(block.into());
        }

        if is_first {
            out.write_all(SQLITE_HEADER.as_slice())
                .map_err(|e| CoreError::WriteFailed(e.to_string()))?;
        }
        out.write_all(&plaintext)
            .map_err(|e| CoreError::WriteFailed(e.to_string()))?;
        out.write_all(&page_buf[profile.page_size - reserved..])
            .map_err(|e| CoreError::WriteFailed(e.to_string()))?;
    }

    Ok(())
}

/// Copies `src` to `dst` verbatim when it's already a plaintext SQLite
/// file; otherwise decrypts it. Per-file errors are logged and the walk
/// continues; only cancellation halts the whole directory.
pub fn batch_decrypt(
    master_key: &[u8; KEY_SIZE],
    profile: Profile,
    db_path: &Path,
    out_dir: &Path,
    cancel: &CancellationToken,
) -> Vec<(std::path::PathBuf, CoreResult<std::path::PathBuf>)> {
    let mut results = Vec::new();

    let entries: Vec<std::path::PathBuf> = if db_path.is_file() {
        vec![db_path.to_path_buf()]
    } else {
        walkdir::WalkDir::new(db_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    };

    for in_path in entries {
        if cancel.load(Ordering::Relaxed) {
            results.push((in_path, Err(CoreError::OperationCanceled)));
            continue;
        }

        let file_name = in_path.file_name().unwrap_or_default();
        let out_path = out_dir.join(format!("de_{}", file_name.to_string_lossy()));

        let result = (|| -> CoreResult<std::path::PathBuf> {
            let mut f = std::fs::File::open(&in_path)?;
            let mut head = [0u8; 16];
            let read = f.read(&mut head)?;
            if read == 16 && is_already_plaintext(&head) {
                drop(f);
                std::fs::copy(&in_path, &out_path)?;
                return Err(CoreError::AlreadyDecrypted);
            }

            let total_len = f.metadata()?.len();
            let mut full = std::fs::File::open(&in_path)?;
            let out_file = std::fs::File::create(&out_path)?;
            decrypt(&mut full, total_len, master_key, profile, std::io::BufWriter::new(out_file), cancel)?;
            Ok(out_path.clone())
        })();

        match &result {
            Err(e) if !e.recoverable() => log::error!("{}: {e}", in_path.display()),
            Err(e) => log::info!("{}: {e}", in_path.display()),
            Ok(p) => log::info!("{} -> {}", in_path.display(), p.display()),
        }

        results.push((in_path, result));
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypt_fixture(master_key: &[u8; KEY_SIZE], profile: Profile, plaintext_pages: &[[u8; 4096]]) -> Vec<u8> {
        use cbc::cipher::BlockEncryptMut;
        let salt = [0x11u8; SALT_SIZE];
        let (page_key, mac_key) = derive_keys(master_key, &salt, profile);

        let mut out = Vec::new();
        for (i, page) in plaintext_pages.iter().enumerate() {
            let page_index = (i + 1) as u32;
            let is_first = i == 0;
            let reserved = profile.reserved;
            let body_start = if is_first { 16 } else { 0 };
            let body_plain = &page[body_start..profile.page_size - reserved];

            let iv: [u8; IV_SIZE] = {
                let mut v = [0u8; IV_SIZE];
                v[0] = page_index as u8;
                v
            };

            let mut body_cipher = body_plain.to_vec();
            let mut cipher = cbc::Encryptor::<Aes256>::new(page_key.as_slice().into(), (&iv).into());
            for block in body_cipher.chunks_exact_mut(16) {
                cipher.encrypt_block_mut(block.into());
            }

            let mac_tag = hmac_page(&mac_key, &body_cipher, &iv, page_index, profile);

            if is_first {
                out.extend_from_slice(&salt);
            }
            out.extend_from_slice(&body_cipher);
            out.extend_from_slice(&iv);
            out.extend_from_slice(&mac_tag);
            // pad reserved area up to `reserved` bytes (iv + mac_tag already reserved-sized after AES-block rounding)
            let written = iv.len() + mac_tag.len();
            if written < reserved {
                out.extend(std::iter::repeat(0u8).take(reserved - written));
            }
        }
        out
    }

    fn sample_pages(profile: Profile, n: usize) -> Vec<[u8; 4096]> {
        (0..n)
            .map(|i| {
                let mut page = [0u8; 4096];
                for (j, b) in page.iter_mut().enumerate() {
                    *b = ((i * 7 + j) % 251) as u8;
                }
                // page 1's first 16 bytes get overwritten with salt on
                // encryption and the SQLite header on decryption, so the
                // fixture's own bytes there are irrelevant.
                let _ = profile;
                page
            })
            .collect()
    }

    #[test]
    fn v3_round_trip_produces_sqlite_header_and_preserves_page_count() {
        let profile = Profile::v3();
        let master_key = [0x11u8; KEY_SIZE];
        let pages = sample_pages(profile, 3);
        let encrypted = encrypt_fixture(&master_key, profile, &pages);
        assert_eq!(encrypted.len(), 3 * profile.page_size);

        let mut out = Vec::new();
        decrypt(
            encrypted.as_slice(),
            encrypted.len() as u64,
            &master_key,
            profile,
            &mut out,
            &new_cancellation_token(),
        )
        .unwrap();

        assert_eq!(out.len(), 3 * profile.page_size);
        assert_eq!(&out[..16], SQLITE_HEADER.as_slice());
    }

    #[test]
    fn v4_round_trip_with_sha512_profile() {
        let profile = Profile::v4();
        let master_key = [0x22u8; KEY_SIZE];
        let pages = sample_pages(profile, 2);
        let encrypted = encrypt_fixture(&master_key, profile, &pages);

        let mut out = Vec::new();
        decrypt(
            encrypted.as_slice(),
            encrypted.len() as u64,
            &master_key,
            profile,
            &mut out,
            &new_cancellation_token(),
        )
        .unwrap();

        assert_eq!(out.len(), 2 * profile.page_size);
        assert_eq!(&out[..16], SQLITE_HEADER.as_slice());
    }

    #[test]
    fn wrong_key_yields_incorrect_key_and_no_output_side_effects() {
        let profile = Profile::v3();
        let master_key = [0x11u8; KEY_SIZE];
        let pages = sample_pages(profile, 1);
        let encrypted = encrypt_fixture(&master_key, profile, &pages);

        let wrong_key = [0x00u8; KEY_SIZE];
        let mut out = Vec::new();
        let err = decrypt(
            encrypted.as_slice(),
            encrypted.len() as u64,
            &wrong_key,
            profile,
            &mut out,
            &new_cancellation_token(),
        )
        .unwrap_err();

        assert!(matches!(err, CoreError::IncorrectKey));
        assert!(out.is_empty());
    }

    #[test]
    fn already_plaintext_is_detected_from_header() {
        assert!(is_already_plaintext(SQLITE_HEADER.as_slice()));
        assert!(!is_already_plaintext(&[0u8; 16]));
    }

    #[test]
    fn incomplete_stream_is_rejected() {
        let profile = Profile::v3();
        let master_key = [0x11u8; KEY_SIZE];
        let short = vec![0u8; profile.page_size - 1];
        let mut out = Vec::new();
        let err = decrypt(
            short.as_slice(),
            short.len() as u64,
            &master_key,
            profile,
            &mut out,
            &new_cancellation_token(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::IncompleteRead));
    }
}
