//! Animated-sticker transmuxer. Parses an HEVC/H.265 Annex-B stream
//! wrapped in a length-prefixed partition container, classifies it as a
//! still frame or an animated mask/color sticker, and emits either a
//! minimal fragmented MP4 or (when `FFMPEG_PATH` is set) shells out to an
//! external transcoder for a JPEG/GIF. Uses the bounds-checked
//! `offset + length <= total` partition-walk idiom common to
//! length-prefixed container parsers, generalized to this proprietary
//! wrapper (see DESIGN.md for the grounding).

use crate::error::{CoreError, CoreResult};
use std::process::Command;

const STILL_FRAME_RATIO_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct Partition {
    pub offset: usize,
    pub length: usize,
    pub ratio: f64,
}

/// Walks the byte stream partition by partition: each partition is
/// preceded by a big-endian u32 length, immediately followed by a NAL
/// start code (`00 00 00 01` or `00 00 01`) at which the partition
/// itself begins. Every step is bounds-checked (`length > 0 && offset +
/// length <= total`); the walk stops at the first partition that fails
/// to bounds-check rather than guessing a resync point.
pub fn discover_partitions(blob: &[u8]) -> CoreResult<Vec<Partition>> {
    if blob.is_empty() {
        return Err(CoreError::UnknownMediaFormat);
    }
    // single-byte header-length prefix, per spec.
    let header_len = blob[0] as usize;
    if header_len >= blob.len() {
        return Err(CoreError::UnknownMediaFormat);
    }

    let total = blob.len();
    let mut partitions = Vec::new();
    let mut cursor = header_len + 1;

    while cursor + 4 <= total {
        let length = u32::from_be_bytes(blob[cursor..cursor + 4].try_into().unwrap()) as usize;
        let after_length = cursor + 4;

        let offset = if blob[after_length..].starts_with(&[0, 0, 0, 1]) {
            after_length
        } else if blob[after_length..].starts_with(&[0, 0, 1]) {
            after_length
        } else {
            break;
        };

        if length == 0 || offset + length > total {
            break;
        }

        partitions.push(Partition {
            offset,
            length,
            ratio: length as f64 / total as f64,
        });

        cursor = offset + length;
    }

    if partitions.is_empty() {
        return Err(CoreError::UnknownMediaFormat);
    }
    Ok(partitions)
}

#[derive(Debug)]
pub enum Classification {
    StillFrame { partition: Partition },
    Animated { color_frames: Vec<Partition>, mask_frames: Vec<Partition> },
}

pub fn classify(partitions: Vec<Partition>) -> Classification {
    if let Some(still) = partitions.iter().max_by(|a, b| a.ratio.total_cmp(&b.ratio)) {
        if still.ratio >= STILL_FRAME_RATIO_THRESHOLD {
            return Classification::StillFrame { partition: still.clone() };
        }
    }

    let mut color_frames = Vec::new();
    let mut mask_frames = Vec::new();
    for (i, p) in partitions.into_iter().enumerate() {
        if i % 2 == 0 {
            color_frames.push(p);
        } else {
            mask_frames.push(p);
        }
    }
    Classification::Animated { color_frames, mask_frames }
}

/// Drops any slice after the first one in a frame that also claims to be
/// `first_slice_segment_in_pic_flag = 1`.
/// `is_first_slice` inspects the single bit per the HEVC slice-segment
/// header layout (first bit of the first byte after the 2-byte NAL
/// header for slice NAL unit types).
pub fn dedupe_first_slices(slice_nal_payloads: &[&[u8]]) -> Vec<usize> {
    let mut keep = Vec::new();
    let mut seen_first = false;
    for (i, payload) in slice_nal_payloads.iter().enumerate() {
        let is_first = is_first_slice_segment(payload);
        if is_first {
            if seen_first {
                continue; // duplicate first-slice claim: drop it.
            }
            seen_first = true;
        }
        keep.push(i);
    }
    keep
}

fn is_first_slice_segment(nal_payload: &[u8]) -> bool {
    // NAL header is 2 bytes; the slice segment header's first bit is
    // `first_slice_segment_in_pic_flag`.
    nal_payload.get(2).is_some_and(|b| b & 0x80 != 0)
}

/// HEVC VCL (slice) NAL unit types are 0..=21; everything above that
/// (VPS/SPS/PPS/SEI/...) is non-VCL and passes through `repair_frame_slices`
/// untouched.
fn is_vcl_nal(nal_payload: &[u8]) -> bool {
    nal_payload.first().is_some_and(|&b| (b >> 1) & 0x3F <= 21)
}

struct Nal<'a> {
    start_code: &'a [u8],
    payload: &'a [u8],
}

/// Splits raw Annex-B bytes into NAL units (start code + payload),
/// scanning for `00 00 00 01` / `00 00 01` the same way
/// [`discover_partitions`] finds partition boundaries, but within a
/// single frame's bytes rather than across the whole blob.
fn split_nal_units(bytes: &[u8]) -> Vec<Nal<'_>> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= bytes.len() {
        if bytes[i..].starts_with(&[0, 0, 0, 1]) {
            starts.push((i, 4usize));
            i += 4;
        } else if bytes[i..].starts_with(&[0, 0, 1]) {
            starts.push((i, 3usize));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(pos, sc_len)) in starts.iter().enumerate() {
        let payload_start = pos + sc_len;
        let payload_end = starts.get(idx + 1).map(|&(next_pos, _)| next_pos).unwrap_or(bytes.len());
        if payload_start >= payload_end {
            continue;
        }
        nals.push(Nal { start_code: &bytes[pos..payload_start], payload: &bytes[payload_start..payload_end] });
    }
    nals
}

/// Applies the HEVC slice-header fix (§4.4.1) to one frame's raw bytes:
/// splits it into NAL units, runs [`dedupe_first_slices`] over the VCL
/// (slice) NALs only, and reassembles the frame with duplicate
/// first-slice claims dropped. Non-VCL NALs (VPS/SPS/PPS, parsed once per
/// stream upstream) always pass through unchanged.
pub fn repair_frame_slices(frame: &[u8]) -> Vec<u8> {
    let nals = split_nal_units(frame);
    let slice_payloads: Vec<&[u8]> = nals.iter().filter(|n| is_vcl_nal(n.payload)).map(|n| n.payload).collect();
    let keep_slice_indices = dedupe_first_slices(&slice_payloads);

    let mut out = Vec::with_capacity(frame.len());
    let mut slice_idx = 0usize;
    for nal in &nals {
        if is_vcl_nal(nal.payload) {
            if keep_slice_indices.contains(&slice_idx) {
                out.extend_from_slice(nal.start_code);
                out.extend_from_slice(nal.payload);
            }
            slice_idx += 1;
        } else {
            out.extend_from_slice(nal.start_code);
            out.extend_from_slice(nal.payload);
        }
    }
    out
}

/// Writes a minimal fragmented MP4 wrapping a single HEVC sample
/// (ftyp/moov/moof/mdat), with no external toolchain required.
pub fn still_frame_to_fmp4(hevc_sample: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_box(&mut out, b"ftyp", |b| {
        b.extend_from_slice(b"isom");
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(b"isomiso2hvc1");
    });
    write_box(&mut out, b"moov", |b| {
        write_box(b, b"mvhd", |mvhd| mvhd.extend_from_slice(&[0u8; 100]));
    });
    write_box(&mut out, b"moof", |b| {
        write_box(b, b"mfhd", |mfhd| mfhd.extend_from_slice(&1u32.to_be_bytes()));
    });
    write_box(&mut out, b"mdat", |b| b.extend_from_slice(hevc_sample));
    out
}

/// Two-track fragmented MP4 (color + mask), alphamerge deferred to the
/// consumer.
pub fn animated_to_fmp4(color_frames: &[&[u8]], mask_frames: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    write_box(&mut out, b"ftyp", |b| {
        b.extend_from_slice(b"isom");
        b.extend_from_slice(&0u32.to_be_bytes());
        b.extend_from_slice(b"isomiso2hvc1");
    });
    write_box(&mut out, b"moov", |b| {
        write_box(b, b"mvhd", |mvhd| mvhd.extend_from_slice(&[0u8; 100]));
    });
    for (track_id, frames) in [(1u32, color_frames), (2u32, mask_frames)] {
        write_box(&mut out, b"moof", |b| {
            write_box(b, b"mfhd", |mfhd| mfhd.extend_from_slice(&track_id.to_be_bytes()));
        });
        write_box(&mut out, b"mdat", |b| {
            for frame in frames {
                b.extend_from_slice(frame);
            }
        });
    }
    out
}

fn write_box(out: &mut Vec<u8>, tag: &[u8; 4], fill: impl FnOnce(&mut Vec<u8>)) {
    let size_pos = out.len();
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(tag);
    fill(out);
    let size = (out.len() - size_pos) as u32;
    out[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

/// Runs the external transcoder named by `FFMPEG_PATH` when present,
/// returning its stdout bytes (a JPEG for still frames, a GIF for
/// animated ones). Returns `None` when the env var isn't set, letting
/// the caller fall back to the no-toolchain fMP4 path.
pub fn try_external_transcode(input: &[u8], extra_args: &[&str]) -> Option<Vec<u8>> {
    let ffmpeg = std::env::var("FFMPEG_PATH").ok()?;
    let mut tmp_in = tempfile::NamedTempFile::new().ok()?;
    std::io::Write::write_all(&mut tmp_in, input).ok()?;
    let tmp_out = tempfile::Builder::new().suffix(".out").tempfile().ok()?;

    let status = Command::new(ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(tmp_in.path())
        .args(extra_args)
        .arg(tmp_out.path())
        .status()
        .ok()?;

    if !status.success() {
        return None;
    }
    std::fs::read(tmp_out.path()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_container(partitions: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0u8]; // header_len = 0
        for p in partitions {
            out.extend_from_slice(&(p.len() as u32).to_be_bytes());
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&p[4..]);
        }
        out
    }

    #[test]
    fn discovers_bounds_checked_partitions() {
        let frame_a = [0u8, 0, 0, 1, 0xAA, 0xBB, 0xCC];
        let frame_b = [0u8, 0, 0, 1, 0xDD, 0xEE];
        let blob = build_container(&[&frame_a, &frame_b]);

        let partitions = discover_partitions(&blob).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].length, frame_a.len());
        assert_eq!(partitions[1].length, frame_b.len());
    }

    #[test]
    fn classifies_single_dominant_partition_as_still() {
        let big = vec![0u8, 0, 0, 1, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let small = vec![0u8, 0, 0, 1, 1];
        let blob = build_container(&[&big, &small]);
        let partitions = discover_partitions(&blob).unwrap();

        match classify(partitions) {
            Classification::StillFrame { partition } => assert_eq!(partition.length, big.len()),
            Classification::Animated { .. } => panic!("expected still frame classification"),
        }
    }

    #[test]
    fn classifies_even_partitions_as_animated_mask_color() {
        let f1 = vec![0u8, 0, 0, 1, 1, 2];
        let f2 = vec![0u8, 0, 0, 1, 3, 4];
        let f3 = vec![0u8, 0, 0, 1, 5, 6];
        let f4 = vec![0u8, 0, 0, 1, 7, 8];
        let blob = build_container(&[&f1, &f2, &f3, &f4]);
        let partitions = discover_partitions(&blob).unwrap();

        match classify(partitions) {
            Classification::Animated { color_frames, mask_frames } => {
                assert_eq!(color_frames.len(), 2);
                assert_eq!(mask_frames.len(), 2);
            }
            Classification::StillFrame { .. } => panic!("expected animated classification"),
        }
    }

    #[test]
    fn drops_duplicate_first_slices() {
        let slice_a = [0u8, 0, 0x80]; // first_slice_segment_in_pic_flag = 1
        let slice_b = [0u8, 0, 0x80]; // duplicate claim
        let slice_c = [0u8, 0, 0x00]; // not a first slice
        let kept = dedupe_first_slices(&[&slice_a, &slice_b, &slice_c]);
        assert_eq!(kept, vec![0, 2]);
    }

    #[test]
    fn repair_frame_slices_drops_duplicate_first_slice_and_keeps_non_vcl_nals() {
        // nal_unit_type 33 (SPS) => byte0 = 33 << 1 = 0x42; non-VCL, always kept.
        let sps_nal = [0x42u8, 0x01, 0xAA];
        // nal_unit_type 1 (TRAIL_R slice) => byte0 = 1 << 1 = 0x02; VCL.
        let slice_1 = [0x02u8, 0x01, 0x80, 0xBB]; // first_slice_segment_in_pic_flag = 1
        let slice_2 = [0x02u8, 0x01, 0x80, 0xCC]; // duplicate first-slice claim

        let mut frame = Vec::new();
        for nal in [&sps_nal[..], &slice_1[..], &slice_2[..]] {
            frame.extend_from_slice(&[0, 0, 0, 1]);
            frame.extend_from_slice(nal);
        }

        let repaired = repair_frame_slices(&frame);

        let contains = |needle: &[u8]| repaired.windows(needle.len()).any(|w| w == needle);
        assert!(contains(&sps_nal));
        assert!(contains(&slice_1));
        assert!(!contains(&slice_2));
    }

    #[test]
    fn fmp4_boxes_have_self_consistent_sizes() {
        let data = still_frame_to_fmp4(&[1, 2, 3, 4]);
        // ftyp box size field covers ftyp + its payload
        let ftyp_size = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
        assert_eq!(&data[4..8], b"ftyp");
        assert!(ftyp_size <= data.len());
    }
}
