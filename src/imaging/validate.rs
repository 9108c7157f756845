//! Byte-level screening of untrusted image files.
//!
//! [`validate`] is a pure function of the bytes it is given. It runs four
//! checks in order and stops at the first failure:
//!
//! | Step | Check | Rejection |
//! |---|---|---|
//! | 1 | Leading signature is PNG, JPEG or GIF | [`RejectReason::BadMagicBytes`] |
//! | 2 | Container walk finds the end-of-image marker; only padding follows | [`RejectReason::Corrupt`], [`RejectReason::TrailerPayload`] |
//! | 3 | Header dimensions stay under [`MAX_IMAGE_PIXELS`] | [`RejectReason::DecompressionBomb`] |
//! | 4 | Full decode with allocation limits | [`RejectReason::Corrupt`] |
//!
//! The pixel ceiling is checked against the dimensions declared in the
//! container headers, before any pixel buffer is allocated. A 100-byte PNG
//! that claims to be 10000×10000 is rejected without decoding.
//!
//! ## Trailing data
//!
//! Some encoders pad the end of a file with zero or `0xFF` bytes. Up to
//! [`TRAILER_TOLERANCE`] bytes of such padding are accepted; anything else
//! after the end marker (an appended ZIP, a script, even a single non-padding
//! byte) is treated as a smuggled payload.

use super::format::ImageKind;
use crate::limits::{MAX_IMAGE_PIXELS, SizeViolation};
use image::{ImageReader, Limits};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Maximum number of padding bytes tolerated after the end-of-image marker.
pub const TRAILER_TOLERANCE: usize = 32;

/// Decoders may allocate at most this many bytes per pixel (16-bit RGBA).
const MAX_BYTES_PER_PIXEL: u64 = 8;

/// Why a candidate was not admitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Not a supported image (unrecognized file signature)")]
    BadMagicBytes,
    #[error("Unexpected data after end of image ({trailing} bytes)")]
    TrailerPayload { trailing: usize },
    #[error("Image too large: {pixels} pixels (maximum: {max})", max = MAX_IMAGE_PIXELS)]
    DecompressionBomb { pixels: u64 },
    #[error("Invalid image: {0}")]
    Corrupt(String),
    #[error("{0}")]
    SizeExceeded(#[from] SizeViolation),
    #[error("Symlinks are not allowed")]
    SymlinkRejected,
    #[error("Cannot read file: {0}")]
    Io(String),
}

/// Result of screening one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted { format: ImageKind, pixel_count: u64 },
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

impl From<RejectReason> for ValidationOutcome {
    fn from(reason: RejectReason) -> Self {
        Self::Rejected(reason)
    }
}

/// Where the encoded image ends and how large it claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    end: usize,
    width: u32,
    height: u32,
}

/// Screen `bytes`. `declared` is the format implied by the file extension;
/// a mismatch is logged but not fatal since the output name is derived from
/// the detected format.
pub fn validate(bytes: &[u8], declared: Option<ImageKind>) -> ValidationOutcome {
    let Some(kind) = ImageKind::sniff(bytes) else {
        return RejectReason::BadMagicBytes.into();
    };
    if let Some(declared) = declared.filter(|d| *d != kind) {
        debug!(%declared, detected = %kind, "extension does not match content");
    }

    // Claimed dimensions first, so a truncated bomb is still called a bomb.
    if let Some((width, height)) = header_dimensions(bytes, kind) {
        let pixels = u64::from(width) * u64::from(height);
        if pixels > MAX_IMAGE_PIXELS {
            return RejectReason::DecompressionBomb { pixels }.into();
        }
    }

    let layout = match kind {
        ImageKind::Png => png_layout(bytes),
        ImageKind::Jpeg => jpeg_layout(bytes),
        ImageKind::Gif => gif_layout(bytes),
    };
    let layout = match layout {
        Ok(layout) => layout,
        Err(reason) => return RejectReason::Corrupt(reason.to_string()).into(),
    };

    let trailer = &bytes[layout.end..];
    if !is_padding(trailer) {
        return RejectReason::TrailerPayload {
            trailing: trailer.len(),
        }
        .into();
    }

    if layout.width == 0 || layout.height == 0 {
        return RejectReason::Corrupt("zero image dimension".to_string()).into();
    }
    let pixels = u64::from(layout.width) * u64::from(layout.height);
    if pixels > MAX_IMAGE_PIXELS {
        return RejectReason::DecompressionBomb { pixels }.into();
    }

    match decode(&bytes[..layout.end], kind) {
        Ok(()) => ValidationOutcome::Accepted {
            format: kind,
            pixel_count: pixels,
        },
        Err(reason) => reason.into(),
    }
}

fn is_padding(trailer: &[u8]) -> bool {
    trailer.len() <= TRAILER_TOLERANCE && trailer.iter().all(|b| *b == 0x00 || *b == 0xFF)
}

fn decode(bytes: &[u8], kind: ImageKind) -> Result<(), RejectReason> {
    let mut limits = Limits::default();
    limits.max_alloc = Some(MAX_IMAGE_PIXELS * MAX_BYTES_PER_PIXEL);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), kind.image_format());
    reader.limits(limits);
    let image = reader
        .decode()
        .map_err(|e| RejectReason::Corrupt(e.to_string()))?;

    // Decoders can disagree with the header we walked; re-check what they produced.
    let pixels = u64::from(image.width()) * u64::from(image.height());
    if pixels > MAX_IMAGE_PIXELS {
        return Err(RejectReason::DecompressionBomb { pixels });
    }
    Ok(())
}

/// Dimensions declared up front: PNG's IHDR, the first JPEG frame header, or
/// the GIF logical screen. Reads only as far as the header itself.
fn header_dimensions(bytes: &[u8], kind: ImageKind) -> Option<(u32, u32)> {
    match kind {
        ImageKind::Png => {
            if bytes.get(PNG_SIGNATURE_LEN + 4..PNG_SIGNATURE_LEN + 8) != Some(&b"IHDR"[..]) {
                return None;
            }
            Some((
                be_u32(bytes, PNG_SIGNATURE_LEN + 8)?,
                be_u32(bytes, PNG_SIGNATURE_LEN + 12)?,
            ))
        }
        ImageKind::Jpeg => jpeg_frame_dimensions(bytes),
        ImageKind::Gif => Some((u32::from(le_u16(bytes, 6)?), u32::from(le_u16(bytes, 8)?))),
    }
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

// ---------------------------------------------------------------------------
// PNG: signature, IHDR, chunks ..., IEND
// ---------------------------------------------------------------------------

const PNG_SIGNATURE_LEN: usize = 8;

fn png_layout(bytes: &[u8]) -> Result<Layout, &'static str> {
    let mut pos = PNG_SIGNATURE_LEN;
    if bytes.get(pos + 4..pos + 8) != Some(&b"IHDR"[..]) {
        return Err("missing IHDR chunk");
    }
    let width = be_u32(bytes, pos + 8).ok_or("truncated IHDR chunk")?;
    let height = be_u32(bytes, pos + 12).ok_or("truncated IHDR chunk")?;

    loop {
        let len = be_u32(bytes, pos).ok_or("missing IEND chunk")? as usize;
        let kind = bytes.get(pos + 4..pos + 8).ok_or("truncated chunk header")?;
        // length + type + data + crc
        let chunk_end = pos
            .checked_add(12)
            .and_then(|p| p.checked_add(len))
            .ok_or("chunk length overflow")?;
        if chunk_end > bytes.len() {
            return Err("truncated chunk");
        }
        if kind == b"IEND" {
            return Ok(Layout {
                end: chunk_end,
                width,
                height,
            });
        }
        pos = chunk_end;
    }
}

// ---------------------------------------------------------------------------
// JPEG: SOI, marker segments, entropy-coded scans, EOI
// ---------------------------------------------------------------------------

const JPEG_EOI: u8 = 0xD9;
const JPEG_SOS: u8 = 0xDA;

/// Start-of-frame markers carry the image dimensions. C4 (DHT), C8 (JPG
/// extension) and CC (DAC) share the range but are not frames.
fn is_start_of_frame(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

/// Markers with no length field.
fn is_standalone(marker: u8) -> bool {
    matches!(marker, 0x01 | 0xD0..=0xD7)
}

fn jpeg_layout(bytes: &[u8]) -> Result<Layout, &'static str> {
    let mut pos = 2;
    let mut dimensions: Option<(u32, u32)> = None;

    loop {
        if bytes.get(pos) != Some(&0xFF) {
            return Err("missing end-of-image marker");
        }
        while bytes.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        let marker = *bytes.get(pos).ok_or("truncated marker")?;
        pos += 1;

        if marker == JPEG_EOI {
            let (width, height) = dimensions.ok_or("missing frame header")?;
            return Ok(Layout {
                end: pos,
                width,
                height,
            });
        }
        if is_standalone(marker) {
            continue;
        }
        if marker == 0xD8 {
            return Err("unexpected start-of-image marker");
        }

        let len = be_u16(bytes, pos).ok_or("truncated segment")? as usize;
        if len < 2 {
            return Err("invalid segment length");
        }
        let segment_end = pos + len;
        if segment_end > bytes.len() {
            return Err("truncated segment");
        }
        if is_start_of_frame(marker) {
            // length(2) precision(1) height(2) width(2)
            if len < 7 {
                return Err("truncated frame header");
            }
            let height = be_u16(bytes, pos + 3).ok_or("truncated frame header")?;
            let width = be_u16(bytes, pos + 5).ok_or("truncated frame header")?;
            dimensions = Some((u32::from(width), u32::from(height)));
        }
        pos = segment_end;

        if marker == JPEG_SOS {
            pos = skip_entropy_coded(bytes, pos)?;
        }
    }
}

/// Walk marker segments up to the first frame header. Stops at the first
/// scan or anything malformed; the full walk reports those.
fn jpeg_frame_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    loop {
        if *bytes.get(pos)? != 0xFF {
            return None;
        }
        while bytes.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        let marker = *bytes.get(pos)?;
        pos += 1;
        if is_standalone(marker) {
            continue;
        }
        if matches!(marker, JPEG_EOI | JPEG_SOS | 0xD8) {
            return None;
        }
        if is_start_of_frame(marker) {
            let height = be_u16(bytes, pos + 3)?;
            let width = be_u16(bytes, pos + 5)?;
            return Some((u32::from(width), u32::from(height)));
        }
        let len = usize::from(be_u16(bytes, pos)?);
        if len < 2 {
            return None;
        }
        pos += len;
    }
}

/// Advance past scan data to the next real marker. `FF 00` is a stuffed
/// data byte and `FF D0`..`FF D7` are restart markers inside the scan.
fn skip_entropy_coded(bytes: &[u8], mut pos: usize) -> Result<usize, &'static str> {
    loop {
        match (bytes.get(pos), bytes.get(pos + 1)) {
            (Some(0xFF), Some(0x00 | 0xD0..=0xD7)) => pos += 2,
            (Some(0xFF), Some(_)) => return Ok(pos),
            (Some(_), _) => pos += 1,
            (None, _) => return Err("truncated scan data"),
        }
    }
}

// ---------------------------------------------------------------------------
// GIF: header, logical screen, global palette, blocks ..., trailer
// ---------------------------------------------------------------------------

const GIF_TRAILER: u8 = 0x3B;
const GIF_EXTENSION: u8 = 0x21;
const GIF_IMAGE: u8 = 0x2C;

fn palette_len(packed: u8) -> usize {
    if packed & 0x80 == 0 {
        0
    } else {
        3 << ((packed & 0x07) + 1)
    }
}

fn gif_layout(bytes: &[u8]) -> Result<Layout, &'static str> {
    let screen_width = le_u16(bytes, 6).ok_or("truncated logical screen")?;
    let screen_height = le_u16(bytes, 8).ok_or("truncated logical screen")?;
    let packed = *bytes.get(10).ok_or("truncated logical screen")?;
    let mut width = u32::from(screen_width);
    let mut height = u32::from(screen_height);
    let mut pos = 13 + palette_len(packed);

    loop {
        match bytes.get(pos) {
            Some(&GIF_TRAILER) => {
                return Ok(Layout {
                    end: pos + 1,
                    width,
                    height,
                });
            }
            Some(&GIF_EXTENSION) => {
                pos = skip_sub_blocks(bytes, pos + 2)?;
            }
            Some(&GIF_IMAGE) => {
                let left = le_u16(bytes, pos + 1).ok_or("truncated image descriptor")?;
                let top = le_u16(bytes, pos + 3).ok_or("truncated image descriptor")?;
                let frame_w = le_u16(bytes, pos + 5).ok_or("truncated image descriptor")?;
                let frame_h = le_u16(bytes, pos + 7).ok_or("truncated image descriptor")?;
                let packed = *bytes.get(pos + 9).ok_or("truncated image descriptor")?;
                // Frames may extend past the logical screen; the decoder sizes
                // its canvas to cover them.
                width = width.max(u32::from(left) + u32::from(frame_w));
                height = height.max(u32::from(top) + u32::from(frame_h));
                // descriptor(10) + local palette + LZW minimum code size(1)
                pos = skip_sub_blocks(bytes, pos + 10 + palette_len(packed) + 1)?;
            }
            Some(_) => return Err("unknown block type"),
            None => return Err("missing trailer"),
        }
    }
}

fn skip_sub_blocks(bytes: &[u8], mut pos: usize) -> Result<usize, &'static str> {
    loop {
        let size = *bytes.get(pos).ok_or("truncated data block")? as usize;
        pos += 1;
        if size == 0 {
            return Ok(pos);
        }
        pos += size;
    }
}
