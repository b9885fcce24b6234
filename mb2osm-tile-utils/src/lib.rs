#![doc = include_str!("../README.md")]

use std::fmt::{Display, Formatter};

mod coord;
pub use coord::*;

/// Raster image encodings that can be found in a tile blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl Format {
    /// Sniff the encoding from the magic bytes at the start of `data`.
    ///
    /// Only the header is inspected, the image itself is never decoded.
    /// Returns `None` for empty, truncated, or unrecognized buffers.
    #[must_use]
    pub fn detect(data: &[u8]) -> Option<Self> {
        Some(match data {
            v if v.starts_with(b"\x89\x50\x4E\x47\x0D\x0A\x1A\x0A") => Self::Png,
            v if v.starts_with(b"\xFF\xD8\xFF") => Self::Jpeg,
            v if v.starts_with(b"GIF87a") || v.starts_with(b"GIF89a") => Self::Gif,
            v if v.starts_with(b"RIFF") && v.get(8..12) == Some(b"WEBP".as_slice()) => Self::Webp,
            _ => None?,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
