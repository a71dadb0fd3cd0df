//! Media decoder. `decode(blob, aes_key?, xor_key?) -> (plaintext,
//! format_tag)`. A per-`data_dir` builder owns `aes_key` and a
//! lazily-populated `xor_key`, keeping the legacy XOR byte as instance
//! state rather than a process-global.

pub mod format_sniff;
pub mod legacy;
pub mod transmux;
pub mod v4;

use crate::error::{CoreError, CoreResult};
use crate::media::format_sniff::sniff;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct MediaDecoder {
    data_dir: PathBuf,
    image_key_v2: Option<[u8; 16]>,
    xor_key: Mutex<Option<u8>>,
}

pub struct MediaDecoderBuilder {
    data_dir: PathBuf,
    image_key_v2: Option<[u8; 16]>,
    eager_xor_key: bool,
}

impl MediaDecoderBuilder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        MediaDecoderBuilder {
            data_dir: data_dir.into(),
            image_key_v2: None,
            eager_xor_key: false,
        }
    }

    pub fn image_key_v2(mut self, key: [u8; 16]) -> Self {
        self.image_key_v2 = Some(key);
        self
    }

    /// Populates `xor_key` immediately instead of lazily on first decode.
    pub fn eager_xor_key(mut self, eager: bool) -> Self {
        self.eager_xor_key = eager;
        self
    }

    pub fn build(self) -> CoreResult<MediaDecoder> {
        let decoder = MediaDecoder {
            data_dir: self.data_dir,
            image_key_v2: self.image_key_v2,
            xor_key: Mutex::new(None),
        };
        if self.eager_xor_key {
            decoder.resolve_xor_key()?;
        }
        Ok(decoder)
    }
}

impl MediaDecoder {
    /// Locates any sibling thumbnail (`*_t.dat`) under `data_dir` and
    /// derives `xor_key` from it, caching the result.
    fn resolve_xor_key(&self) -> CoreResult<u8> {
        {
            let cached = self.xor_key.lock().unwrap();
            if let Some(k) = *cached {
                return Ok(k);
            }
        }

        let thumbnail = find_thumbnail(&self.data_dir).ok_or(CoreError::UnknownMediaFormat)?;
        let bytes = std::fs::read(&thumbnail)?;
        if bytes.len() < 2 {
            return Err(CoreError::UnknownMediaFormat);
        }
        let tail: [u8; 2] = bytes[bytes.len() - 2..].try_into().unwrap();
        let key = v4::derive_xor_key_from_thumbnail(tail)?;

        *self.xor_key.lock().unwrap() = Some(key);
        Ok(key)
    }

    /// Decodes a media blob, dispatching to the legacy or v4 path by
    /// inspecting the 15-byte v4 header magic.
    pub fn decode(&self, blob: &[u8]) -> CoreResult<(Vec<u8>, &'static str)> {
        if let Ok(header) = v4::parse_header(blob) {
            let xor_key = self.resolve_xor_key()?;
            let body = &blob[v4::HEADER_LEN..];
            let plain = v4::decode_body(&header, body, self.image_key_v2.as_ref(), xor_key)?;

            if v4::is_wxgf_container(&plain) {
                return self.transmux(&plain);
            }

            let format = sniff(&plain).ok_or(CoreError::UnknownMediaFormat)?;
            return Ok((plain, format.tag()));
        }

        legacy::decode(blob)
    }

    fn transmux(&self, wxgf_blob: &[u8]) -> CoreResult<(Vec<u8>, &'static str)> {
        let partitions = transmux::discover_partitions(wxgf_blob)?;
        match transmux::classify(partitions) {
            transmux::Classification::StillFrame { partition } => {
                let raw = &wxgf_blob[partition.offset..partition.offset + partition.length];
                let sample = transmux::repair_frame_slices(raw);
                if let Some(jpg) = transmux::try_external_transcode(&sample, &["-f", "mjpeg"]) {
                    return Ok((jpg, "jpg"));
                }
                Ok((transmux::still_frame_to_fmp4(&sample), "mp4"))
            }
            transmux::Classification::Animated { color_frames, mask_frames } => {
                // The slice-header fix runs per frame before the frames are
                // handed to either the external transcoder or the
                // no-toolchain fMP4 writer.
                let color: Vec<Vec<u8>> = color_frames
                    .iter()
                    .map(|p| transmux::repair_frame_slices(&wxgf_blob[p.offset..p.offset + p.length]))
                    .collect();
                let mask: Vec<Vec<u8>> = mask_frames
                    .iter()
                    .map(|p| transmux::repair_frame_slices(&wxgf_blob[p.offset..p.offset + p.length]))
                    .collect();
                let color_refs: Vec<&[u8]> = color.iter().map(Vec::as_slice).collect();
                let mask_refs: Vec<&[u8]> = mask.iter().map(Vec::as_slice).collect();

                if std::env::var("FFMPEG_PATH").is_ok() {
                    let mut combined = Vec::new();
                    for frame in color_refs.iter().chain(mask_refs.iter()) {
                        combined.extend_from_slice(frame);
                    }
                    if let Some(gif) = transmux::try_external_transcode(&combined, &["-f", "gif"]) {
                        return Ok((gif, "gif-animated"));
                    }
                }
                Ok((transmux::animated_to_fmp4(&color_refs, &mask_refs), "mp4"))
            }
        }
    }
}

fn find_thumbnail(data_dir: &Path) -> Option<PathBuf> {
    walkdir::WalkDir::new(data_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| {
            e.file_type().is_file()
                && e.file_name().to_string_lossy().ends_with("_t.dat")
        })
        .map(|e| e.path().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_legacy_blob_without_any_keys_configured() {
        let decoder = MediaDecoderBuilder::new(std::env::temp_dir()).build().unwrap();
        let k = 0x37u8;
        let plain = [0xFFu8, 0xD8, 0xFF, 0xE0];
        let blob: Vec<u8> = plain.iter().map(|b| b ^ k).collect();

        let (decoded, tag) = decoder.decode(&blob).unwrap();
        assert_eq!(decoded, plain);
        assert_eq!(tag, "jpg");
    }

    #[test]
    fn v4_blob_with_sibling_thumbnail_resolves_xor_key_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let xor_key = 0x37u8;
        let thumb_path = dir.path().join("abc_t.dat");
        std::fs::write(&thumb_path, [0x00u8, 0xFF ^ xor_key, 0xD9 ^ xor_key]).unwrap();

        let decoder = MediaDecoderBuilder::new(dir.path()).build().unwrap();

        let mut blob = vec![0x07, 0x08, 0x56, 0x31, 0x00, 0x00];
        blob.extend_from_slice(&0u32.to_le_bytes());
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.push(0x01);
        blob.push(0xFF ^ xor_key);
        blob.push(0xD9 ^ xor_key);

        let (decoded, tag) = decoder.decode(&blob).unwrap();
        assert_eq!(decoded, vec![0xFF, 0xD9]);
        assert_eq!(tag, "jpg");
    }
}
