//! Accepted input formats and conversion targets.
//!
//! Inputs are limited to what screenshot tools actually produce: PNG, JPEG and
//! GIF. Conversion can additionally target WebP.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_SIGNATURE: &[u8] = b"\xFF\xD8\xFF";
const GIF87_SIGNATURE: &[u8] = b"GIF87a";
const GIF89_SIGNATURE: &[u8] = b"GIF89a";

/// A supported input format, identified by magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
}

impl ImageKind {
    /// Identify a format from its leading bytes. Truncated headers and
    /// unknown signatures return `None`.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(PNG_SIGNATURE) {
            Some(Self::Png)
        } else if bytes.starts_with(JPEG_SIGNATURE) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(GIF87_SIGNATURE) || bytes.starts_with(GIF89_SIGNATURE) {
            Some(Self::Gif)
        } else {
            None
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Format implied by a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn canonical_extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Gif => image::ImageFormat::Gif,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::Gif => "GIF",
        };
        f.write_str(name)
    }
}

/// Whether a path's extension is one discovery should consider.
pub fn has_supported_extension(path: &Path) -> bool {
    ImageKind::from_path(path).is_some()
}

/// Target of `--convert-to` / `default_convert_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvertTarget {
    Png,
    Jpg,
    Webp,
    Gif,
}

impl ConvertTarget {
    /// Canonical file extension; also the value stored in the config file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }

    /// Whether a file with extension `ext` is already in this format.
    pub fn matches_extension(self, ext: &str) -> bool {
        normalize_extension(ext) == self.extension()
    }
}

/// Lower-case an extension and fold `jpeg` into `jpg`.
pub fn normalize_extension(ext: &str) -> String {
    let lower = ext.to_ascii_lowercase();
    if lower == "jpeg" { "jpg".to_string() } else { lower }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported target format: {0} (valid options: png, jpg, webp, gif)")]
pub struct UnknownTarget(pub String);

impl FromStr for ConvertTarget {
    type Err = UnknownTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_extension(s.trim()).as_str() {
            "png" => Ok(Self::Png),
            "jpg" => Ok(Self::Jpg),
            "webp" => Ok(Self::Webp),
            "gif" => Ok(Self::Gif),
            _ => Err(UnknownTarget(s.to_string())),
        }
    }
}

impl fmt::Display for ConvertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
