use std::borrow::Cow;
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine};
use image::{DynamicImage, GenericImageView, ImageFormat as CodecFormat, ImageReader};

use super::types::{ImageFormat, ImagePayload, NormalizedImage, PixelDims};

/// Images whose longest side is below this get upscaled when enhancement is requested.
pub const UPSCALE_BELOW: u32 = 1000;

/// Hard cap on the longest side after enhancement.
pub const MAX_ENHANCED_DIMENSION: u32 = 4096;

/// Result of [`enhance_for_ocr`].
#[derive(Debug, Clone)]
pub struct EnhancedImage {
    pub png: Vec<u8>,
    /// Factor the image was scaled by; divide coordinates by it to map back.
    pub scale: f32,
}

impl NormalizedImage {
    /// Encoded bytes for backends that cannot take raw pixels. Raw payloads
    /// are wrapped as PNG.
    pub fn encoded(&self) -> Result<Cow<'_, [u8]>, String> {
        match &self.payload {
            ImagePayload::Encoded { bytes, .. } => Ok(Cow::Borrowed(bytes)),
            ImagePayload::Raw { data, dims } => encode_raw_png(data, *dims).map(Cow::Owned),
        }
    }

    pub fn format(&self) -> ImageFormat {
        match &self.payload {
            ImagePayload::Encoded { format, .. } => *format,
            ImagePayload::Raw { .. } => ImageFormat::Png,
        }
    }

    pub fn to_data_url(&self) -> Result<String, String> {
        let bytes = self.encoded()?;
        Ok(format!(
            "data:{};base64,{}",
            self.format().mime_type(),
            STANDARD.encode(bytes.as_ref())
        ))
    }
}

/// Wrap an interleaved pixel buffer as a PNG file.
pub fn encode_raw_png(data: &[u8], dims: PixelDims) -> Result<Vec<u8>, String> {
    let PixelDims {
        width,
        height,
        channels,
    } = dims;
    let data = data.to_vec();
    let mismatch = || format!("pixel buffer does not match {width}x{height}x{channels}");

    let img = match channels {
        1 => image::GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
        2 => image::GrayAlphaImage::from_raw(width, height, data).map(DynamicImage::ImageLumaA8),
        3 => image::RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
        4 => image::RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
        other => return Err(format!("unsupported channel count: {other}")),
    }
    .ok_or_else(mismatch)?;

    write_png(&img)
}

/// Prepare an encoded image for a local engine: upscale small inputs, drop
/// alpha, convert to grayscale and stretch contrast.
pub fn enhance_for_ocr(bytes: &[u8]) -> Result<EnhancedImage, String> {
    let img = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| format!("Failed to read image: {e}"))?
        .decode()
        .map_err(|e| format!("Failed to decode image: {e}"))?;

    let (img, scale) = upscale_if_small(img);
    let img = remove_alpha(img);
    let img = enhance_contrast(img);

    Ok(EnhancedImage {
        png: write_png(&img)?,
        scale,
    })
}

fn write_png(img: &DynamicImage) -> Result<Vec<u8>, String> {
    let mut output = Vec::new();
    img.write_to(&mut Cursor::new(&mut output), CodecFormat::Png)
        .map_err(|e| format!("Failed to encode image: {e}"))?;
    Ok(output)
}

/// Scale the longest side up towards [`UPSCALE_BELOW`], at most 3x and never
/// past [`MAX_ENHANCED_DIMENSION`].
fn upscale_if_small(img: DynamicImage) -> (DynamicImage, f32) {
    let (width, height) = img.dimensions();
    let longest = width.max(height);

    if longest == 0 || longest >= UPSCALE_BELOW {
        return (img, 1.0);
    }

    let ratio = (UPSCALE_BELOW as f32 / longest as f32)
        .min(3.0)
        .min(MAX_ENHANCED_DIMENSION as f32 / longest as f32);
    if ratio <= 1.0 {
        return (img, 1.0);
    }

    let new_width = (width as f32 * ratio).round() as u32;
    let new_height = (height as f32 * ratio).round() as u32;

    (
        img.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3),
        ratio,
    )
}

fn remove_alpha(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgba8(_) => DynamicImage::ImageRgb8(img.to_rgb8()),
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLuma8(img.to_luma8()),
        _ => img,
    }
}

fn enhance_contrast(img: DynamicImage) -> DynamicImage {
    DynamicImage::ImageLuma8(stretch_contrast(img.to_luma8()))
}

/// Map the darkest pixel to 0 and the lightest to 255.
fn stretch_contrast(gray: image::GrayImage) -> image::GrayImage {
    let (min_val, max_val) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));

    if max_val <= min_val {
        return gray;
    }

    let range = (max_val - min_val) as f32;
    image::GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = gray.get_pixel(x, y)[0];
        image::Luma([(((value - min_val) as f32 / range) * 255.0) as u8])
    })
}
