pub mod params;

use crate::config::{FitMode, ImageFormat};
use crate::{CdnError, Result};
use bytes::Bytes;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageDecoder, ImageEncoder, ImageReader, RgbaImage};
use params::TransformOptions;
use std::io::Cursor;

/// Fit used by the public `/cdn` surface when a resize omits `fit`.
pub const PUBLIC_DEFAULT_FIT: FitMode = FitMode::Cover;

/// Fit used by the dashboard `/images` surface when a resize omits `fit`.
pub const DASHBOARD_DEFAULT_FIT: FitMode = FitMode::Inside;

/// Speed 4 balances AVIF encoding time and compression ratio.
const AVIF_SPEED: u8 = 4;

fn failed(stage: &str, e: impl std::fmt::Display) -> CdnError {
    CdnError::TransformFailed(format!("{}: {}", stage, e))
}

/// Decodes raw image bytes, applying any EXIF orientation.
///
/// The format is guessed from magic bytes, so a wrong stored content type
/// does not matter.
///
/// # Parameters
/// * `bytes` - Raw encoded image data
///
/// # Returns
/// Tuple of `(DynamicImage, Option<ImageFormat>)`; the format is `Some` when
/// the pipeline can also encode it.
///
/// # Errors
/// Returns `CdnError::TransformFailed` if:
/// - Format cannot be detected from magic bytes
/// - Image data is corrupted or truncated
/// - Decoded image has a zero dimension
pub fn decode_image(bytes: &[u8]) -> Result<(DynamicImage, Option<ImageFormat>)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| failed("decode", e))?;

    let fmt = match reader.format() {
        Some(image::ImageFormat::Jpeg) => Some(ImageFormat::Jpeg),
        Some(image::ImageFormat::Png) => Some(ImageFormat::Png),
        Some(image::ImageFormat::WebP) => Some(ImageFormat::Webp),
        Some(image::ImageFormat::Avif) => Some(ImageFormat::Avif),
        Some(_) => None,
        None => return Err(failed("decode", "unrecognized image format")),
    };

    let mut decoder = reader.into_decoder().map_err(|e| failed("decode", e))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| failed("decode", e))?;
    img.apply_orientation(orientation);

    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(failed("decode", "invalid image dimensions"));
    }
    Ok((img, fmt))
}

fn scaled(len: u32, scale: f64) -> u32 {
    ((len as f64 * scale).round() as u32).max(1)
}

/// Resizes with `fit` semantics, never enlarging beyond the source.
///
/// # Parameters
/// * `img` - Source image to resize
/// * `w` - Target box width (optional)
/// * `h` - Target box height (optional)
/// * `fit` - How the image is placed in the box when both are given
///
/// # Behavior
/// - one dimension given: the other follows the aspect ratio
/// - `fill`: exact dimensions, aspect ratio ignored
/// - `inside`: largest size fitting within the box
/// - `outside`: smallest size covering the box, no crop
/// - `cover`: covers the box, then center-crops to it
/// - `contain`: fits within the box, then letterboxes onto a transparent
///   canvas of the box size, capped at the source size
///
/// Lanczos3 is used throughout for high-quality downsampling. Output sides
/// are at least 1 pixel.
pub fn resize_image(img: DynamicImage, w: Option<u32>, h: Option<u32>, fit: FitMode) -> Result<DynamicImage> {
    let (ow, oh) = img.dimensions();
    let filter = FilterType::Lanczos3;

    let (tw, th) = match (w, h) {
        (None, None) => return Ok(img),
        (Some(w), None) => {
            let s = (w as f64 / ow as f64).min(1.0);
            return Ok(img.resize_exact(scaled(ow, s), scaled(oh, s), filter));
        }
        (None, Some(h)) => {
            let s = (h as f64 / oh as f64).min(1.0);
            return Ok(img.resize_exact(scaled(ow, s), scaled(oh, s), filter));
        }
        (Some(w), Some(h)) => (w, h),
    };

    let sx = tw as f64 / ow as f64;
    let sy = th as f64 / oh as f64;

    let out = match fit {
        FitMode::Fill => img.resize_exact(tw.min(ow), th.min(oh), filter),
        FitMode::Inside => {
            let s = sx.min(sy).min(1.0);
            img.resize_exact(scaled(ow, s), scaled(oh, s), filter)
        }
        FitMode::Outside => {
            let s = sx.max(sy).min(1.0);
            img.resize_exact(scaled(ow, s), scaled(oh, s), filter)
        }
        FitMode::Cover => {
            let s = sx.max(sy).min(1.0);
            let resized = img.resize_exact(scaled(ow, s), scaled(oh, s), filter);
            let (rw, rh) = resized.dimensions();
            let (cw, ch) = (tw.min(rw), th.min(rh));
            resized.crop_imm((rw - cw) / 2, (rh - ch) / 2, cw, ch)
        }
        FitMode::Contain => {
            let s = sx.min(sy);
            if s >= 1.0 {
                // Box is larger than the source in both directions
                img
            } else {
                let resized = img.resize_exact(scaled(ow, s), scaled(oh, s), filter).to_rgba8();
                let (cw, ch) = (tw.min(ow), th.min(oh));
                let mut canvas = RgbaImage::new(cw, ch);
                let x = cw.saturating_sub(resized.width()) / 2;
                let y = ch.saturating_sub(resized.height()) / 2;
                image::imageops::overlay(&mut canvas, &resized, x as i64, y as i64);
                DynamicImage::ImageRgba8(canvas)
            }
        }
    };
    Ok(out)
}

/// Encodes to `fmt` with quality control.
///
/// - **JPEG**: RGB, lossy
/// - **PNG**: lossless, best compression; `quality` is ignored
/// - **WebP**: lossy via libwebp, keeps alpha when present
/// - **AVIF**: RGBA with AV1 compression (slowest, best compression)
///
/// # Parameters
/// * `img` - Image to encode
/// * `fmt` - Target output format
/// * `quality` - Compression quality, clamped to [1, 100]
///
/// # Returns
/// Encoded bytes ready for caching.
///
/// # Errors
/// Returns `CdnError::TransformFailed` on encoder failure or empty output.
pub fn encode_image(img: &DynamicImage, fmt: ImageFormat, quality: u8) -> Result<Vec<u8>> {
    let q = quality.clamp(1, 100);
    let mut out = Vec::new();

    match fmt {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, q)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| failed("encode jpeg", e))?;
        }
        ImageFormat::Png => {
            let encoder = PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
            img.write_with_encoder(encoder).map_err(|e| failed("encode png", e))?;
        }
        ImageFormat::Webp => {
            let encoded = if img.color().has_alpha() {
                let rgba = img.to_rgba8();
                webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height()).encode(q as f32)
            } else {
                let rgb = img.to_rgb8();
                webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height()).encode(q as f32)
            };
            out.extend_from_slice(&encoded);
        }
        ImageFormat::Avif => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, q)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| failed("encode avif", e))?;
        }
    }

    if out.is_empty() {
        return Err(failed("encode", format!("{} encoder produced no output", fmt)));
    }
    Ok(out)
}

/// Output format for a request: the explicit format, else the source's own
/// format, else PNG for sources the pipeline cannot re-encode.
pub fn output_format(options: &TransformOptions, source: Option<ImageFormat>) -> ImageFormat {
    options.format.or(source).unwrap_or(ImageFormat::Png)
}

/// Applies `options` to an encoded image.
///
/// Requests without any content-shaping option return the input unchanged.
/// Output is deterministic for a given input and option set. CPU bound; call
/// from a blocking context.
pub fn transform(bytes: Bytes, content_type: &str, options: &TransformOptions) -> Result<(Bytes, String)> {
    if options.is_passthrough() {
        return Ok((bytes, content_type.to_string()));
    }

    let (img, detected) = decode_image(&bytes)?;
    let source = detected.or_else(|| ImageFormat::from_content_type(content_type));
    let fit = options.fit.unwrap_or(PUBLIC_DEFAULT_FIT);
    let resized = resize_image(img, options.width, options.height, fit)?;

    let target = output_format(options, source);
    let quality = options.quality.unwrap_or_else(|| target.default_quality());
    let encoded = encode_image(&resized, target, quality)?;

    Ok((Bytes::from(encoded), target.content_type().to_string()))
}
