//! Pure Rust codec backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (PNG, JPEG, GIF) | `image::ImageReader` with allocation limits |
//! | Encode → PNG | `PngEncoder`, best compression, adaptive filtering |
//! | Encode → JPEG | `JpegEncoder` at the requested quality, alpha flattened onto white |
//! | Encode → WebP | `image`'s lossless WebP encoder |
//! | Encode → GIF | `image`'s GIF encoder (first frame only) |
//!
//! All outputs go through [`write_atomic`](crate::atomic::write_atomic), so a
//! failed encode never leaves a partial file behind.

use super::backend::{BackendError, ImageBackend, OptimizeOutcome};
use super::format::{ConvertTarget, ImageKind};
use super::params::{ConvertParams, OptimizeParams, Quality};
use crate::atomic::{OWNER_WRITE_WORLD_READ, Replace, write_atomic};
use crate::limits::MAX_IMAGE_PIXELS;
use crate::sanitize::redact;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::{DynamicImage, ImageFormat, ImageReader, Limits, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and decode an image from disk, refusing oversized pixel buffers.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    let bytes = std::fs::read(path)?;
    let mut limits = Limits::default();
    limits.max_alloc = Some(MAX_IMAGE_PIXELS * 8);

    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    reader.decode().map_err(|e| {
        BackendError::ProcessingFailed(format!("Failed to decode {}: {}", redact(path), e))
    })
}

/// Composite any alpha channel onto a white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let alpha = u32::from(a);
            ((u32::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8
        };
        Rgb([blend(r), blend(g), blend(b)])
    })
}

fn encode_failed(format: &str, e: image::ImageError) -> BackendError {
    BackendError::ProcessingFailed(format!("{format} encode failed: {e}"))
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
    img.write_with_encoder(encoder)
        .map_err(|e| encode_failed("PNG", e))?;
    Ok(buf)
}

fn encode_jpeg(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    let flattened = DynamicImage::ImageRgb8(flatten_onto_white(img));
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.as_u8());
    flattened
        .write_with_encoder(encoder)
        .map_err(|e| encode_failed("JPEG", e))?;
    Ok(buf)
}

/// WebP and GIF encoders only take 8-bit RGB(A).
fn encode_rgba(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, BackendError> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img.to_rgba8())
        .write_to(&mut buf, format)
        .map_err(|e| encode_failed(&format!("{format:?}"), e))?;
    Ok(buf.into_inner())
}

fn encode(img: &DynamicImage, target: ConvertTarget, quality: Quality) -> Result<Vec<u8>, BackendError> {
    match target {
        ConvertTarget::Png => encode_png(img),
        ConvertTarget::Jpg => encode_jpeg(img, quality),
        ConvertTarget::Webp => encode_rgba(img, ImageFormat::WebP),
        ConvertTarget::Gif => encode_rgba(img, ImageFormat::Gif),
    }
}

impl ImageBackend for RustBackend {
    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        let bytes = encode(&img, params.target, params.quality)?;
        write_atomic(&params.output, &bytes, OWNER_WRITE_WORLD_READ, Replace::NoClobber)?;
        debug!(
            output = %redact(&params.output),
            target = %params.target,
            bytes = bytes.len(),
            "converted"
        );
        Ok(())
    }

    fn optimize(&self, params: &OptimizeParams) -> Result<OptimizeOutcome, BackendError> {
        let target = match params.format {
            ImageKind::Png => ConvertTarget::Png,
            ImageKind::Jpeg => ConvertTarget::Jpg,
            // Re-encoding would drop every frame after the first.
            ImageKind::Gif => return Ok(OptimizeOutcome::Unchanged),
        };
        let before = std::fs::metadata(&params.path)?.len();
        let img = load_image(&params.path)?;
        let bytes = encode(&img, target, params.quality)?;
        let after = bytes.len() as u64;
        if after >= before {
            return Ok(OptimizeOutcome::Unchanged);
        }
        write_atomic(&params.path, &bytes, OWNER_WRITE_WORLD_READ, Replace::Overwrite)?;
        Ok(OptimizeOutcome::Rewritten { before, after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::validate::{ValidationOutcome, validate};
    use crate::test_helpers::{jpeg_bytes, png_bytes, png_bytes_rgba, transparent_png_bytes};
    use std::path::PathBuf;

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn convert_png_to_jpg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = write(tmp.path(), "shot.png", &png_bytes(40, 30));

        RustBackend::new()
            .convert(&ConvertParams::beside(source.clone(), ConvertTarget::Jpg))
            .unwrap();

        let output = tmp.path().join("shot.jpg");
        let bytes = std::fs::read(&output).unwrap();
        assert!(matches!(
            validate(&bytes, None),
            ValidationOutcome::Accepted {
                format: ImageKind::Jpeg,
                pixel_count: 1200
            }
        ));
        // The caller decides when to remove the source.
        assert!(source.exists());
    }

    #[test]
    fn convert_to_every_target() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = write(tmp.path(), "shot.jpg", &jpeg_bytes(16, 16));
        for target in [ConvertTarget::Png, ConvertTarget::Webp, ConvertTarget::Gif] {
            RustBackend::new()
                .convert(&ConvertParams::beside(source.clone(), target))
                .unwrap();
            let output = tmp.path().join(format!("shot.{}", target.extension()));
            let decoded = image::open(&output).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (16, 16));
        }
    }

    #[test]
    fn convert_refuses_to_clobber() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = write(tmp.path(), "shot.png", &png_bytes(4, 4));
        write(tmp.path(), "shot.jpg", b"existing");

        let result =
            RustBackend::new().convert(&ConvertParams::beside(source, ConvertTarget::Jpg));
        assert!(matches!(result, Err(BackendError::Io(_))));
        assert_eq!(std::fs::read(tmp.path().join("shot.jpg")).unwrap(), b"existing");
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let img = image::load_from_memory(&transparent_png_bytes(2, 2)).unwrap();
        let flat = flatten_onto_white(&img);
        assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn opaque_pixels_keep_their_colour() {
        let img = image::load_from_memory(&png_bytes_rgba(2, 2)).unwrap();
        let rgba = img.to_rgba8();
        let flat = flatten_onto_white(&img);
        let [r, g, b, _] = rgba.get_pixel(1, 1).0;
        assert_eq!(flat.get_pixel(1, 1).0, [r, g, b]);
    }

    #[test]
    fn convert_corrupt_source_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = write(tmp.path(), "bad.png", b"\x89PNG\r\n\x1a\nnot really");
        let result =
            RustBackend::new().convert(&ConvertParams::beside(source, ConvertTarget::Jpg));
        assert!(matches!(result, Err(BackendError::ProcessingFailed(_))));
        assert!(!tmp.path().join("bad.jpg").exists());
    }

    #[test]
    fn optimize_gif_is_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write(tmp.path(), "anim.gif", b"GIF89a not decoded");
        let outcome = RustBackend::new()
            .optimize(&OptimizeParams {
                path: path.clone(),
                format: ImageKind::Gif,
                quality: Quality::default(),
            })
            .unwrap();
        assert_eq!(outcome, OptimizeOutcome::Unchanged);
        assert_eq!(std::fs::read(&path).unwrap(), b"GIF89a not decoded");
    }

    #[test]
    fn optimize_never_grows_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let original = png_bytes(64, 64);
        let path = write(tmp.path(), "shot.png", &original);

        let outcome = RustBackend::new()
            .optimize(&OptimizeParams {
                path: path.clone(),
                format: ImageKind::Png,
                quality: Quality::default(),
            })
            .unwrap();

        let after = std::fs::metadata(&path).unwrap().len();
        match outcome {
            OptimizeOutcome::Rewritten { before, after: new } => {
                assert!(new < before);
                assert_eq!(new, after);
            }
            OptimizeOutcome::Unchanged => assert_eq!(after, original.len() as u64),
        }
        assert!(validate(&std::fs::read(&path).unwrap(), None).is_accepted());
    }
}
