//! Image/container format sniffing by magic header bytes: magic-byte
//! tables checked in order. Shared by the legacy XOR-key inference path
//! and the v4 post-decrypt format tag lookup.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Jpg,
    Png,
    Gif,
    Tiff,
    Bmp,
    Mp4,
    /// Proprietary animated-sticker container (`wxgf` magic); routed to
    /// the transmuxer rather than returned as a plain format.
    AnimatedStickerContainer,
}

impl Format {
    pub fn tag(self) -> &'static str {
        match self {
            Format::Jpg => "jpg",
            Format::Png => "png",
            Format::Gif => "gif",
            Format::Tiff => "tiff",
            Format::Bmp => "bmp",
            Format::Mp4 => "mp4",
            Format::AnimatedStickerContainer => "wxgf",
        }
    }
}

/// Known headers, longest/most-specific discriminator first where magics
/// could otherwise collide (none do here, but order is kept deterministic).
const HEADERS: &[(Format, &[u8])] = &[
    (Format::Png, &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
    (Format::Gif, b"GIF87a"),
    (Format::Gif, b"GIF89a"),
    (Format::Jpg, &[0xFF, 0xD8, 0xFF]),
    (Format::Bmp, b"BM"),
    (Format::Tiff, &[0x49, 0x49, 0x2A, 0x00]),
    (Format::Tiff, &[0x4D, 0x4D, 0x00, 0x2A]),
    (Format::Mp4, &[0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p']),
    (Format::Mp4, &[0x00, 0x00, 0x00, 0x1C, b'f', b't', b'y', b'p']),
    (Format::AnimatedStickerContainer, b"wxgf"),
];

/// Returns the format whose header matches the start of `bytes`, if any.
pub fn sniff(bytes: &[u8]) -> Option<Format> {
    HEADERS
        .iter()
        .find(|(_, magic)| bytes.starts_with(magic))
        .map(|(fmt, _)| *fmt)
}

/// Returns every `(format, first_n_header_bytes)` pair used by the
/// legacy single-byte-XOR key inference, which compares the first 3-4
/// bytes against the header of each known image format.
pub fn legacy_candidate_headers() -> impl Iterator<Item = (Format, &'static [u8])> {
    HEADERS
        .iter()
        .filter(|(fmt, _)| *fmt != Format::AnimatedStickerContainer)
        .map(|(fmt, magic)| (*fmt, &magic[..magic.len().min(4)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_jpeg_and_wxgf() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(Format::Jpg));
        assert_eq!(sniff(b"wxgf-rest-of-blob"), Some(Format::AnimatedStickerContainer));
        assert_eq!(sniff(&[0, 1, 2, 3]), None);
    }
}
