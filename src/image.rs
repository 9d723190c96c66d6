//! Image ingestion and delivery.
//!
//! This module provides:
//!
//! - The [`Image`] type, an owned 8-bit RGBA image tagged as original or
//!   processed.
//! - Decoding from raw bytes with format and size validation.
//! - Quality-preserving resampling.
//! - [`Image::encode_to_envelope`], the size-targeted JPEG encoder used when
//!   assembling results.

use std::{fmt, path::Path};

use image::{
    codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType, ImageEncoder, ImageFormat,
    RgbImage, RgbaImage,
};

use crate::error::{CloakError, Result};

/// Input size ceiling. Anything larger is rejected before decoding.
pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Output byte envelope the adaptive encoder aims for.
const ENVELOPE_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Encoder quality floor, in percent. The envelope target loses against this.
const QUALITY_FLOOR: u8 = 75;

/// Whether an [`Image`] holds original or perturbed pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageTag {
    /// Pixels as ingested.
    Original,
    /// Pixels after the attack ran.
    Processed,
}

/// An 8-bit sRGB image with alpha channel.
#[derive(Clone)]
pub struct Image {
    buf: RgbaImage,
    tag: ImageTag,
}

impl Image {
    /// Creates an opaque black image of the given size, tagged original.
    pub fn new(width: u32, height: u32) -> Self {
        let buf = RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255]));
        Self {
            buf,
            tag: ImageTag::Original,
        }
    }

    /// Creates an image by evaluating `f` at every pixel coordinate.
    pub fn from_pixel_fn<F: FnMut(u32, u32) -> [u8; 4]>(width: u32, height: u32, mut f: F) -> Self {
        Self {
            buf: RgbaImage::from_fn(width, height, |x, y| image::Rgba(f(x, y))),
            tag: ImageTag::Original,
        }
    }

    /// Decodes an image from raw bytes.
    ///
    /// The data must be in JPEG, PNG or WebP format and no larger than
    /// [`MAX_INPUT_BYTES`]. Violations surface as [`CloakError::Validation`],
    /// codec failures as [`CloakError::Conversion`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_INPUT_BYTES {
            return Err(CloakError::Validation(format!(
                "input is {} bytes, the limit is {} bytes",
                data.len(),
                MAX_INPUT_BYTES
            )));
        }

        let format = image::guess_format(data)
            .map_err(|e| CloakError::Validation(format!("unrecognized image data: {e}")))?;
        match format {
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP => {}
            other => {
                return Err(CloakError::Validation(format!(
                    "unsupported image format {other:?} (expected JPEG, PNG or WebP)"
                )));
            }
        }

        let buf = image::load_from_memory_with_format(data, format)
            .map_err(|e| CloakError::Conversion {
                action: "decode",
                reason: e.to_string(),
            })?
            .to_rgba8();

        if buf.width() == 0 || buf.height() == 0 {
            return Err(CloakError::Validation("image has zero dimensions".into()));
        }

        Ok(Self {
            buf,
            tag: ImageTag::Original,
        })
    }

    /// Loads an image from the filesystem.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| CloakError::Conversion {
            action: "decode",
            reason: e.to_string(),
        })?;
        Self::decode(&data)
    }

    /// Saves the image to the filesystem; the format follows the extension.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.buf.save(path).map_err(|e| CloakError::Conversion {
            action: "encode",
            reason: e.to_string(),
        })
    }

    /// Returns the width of this image, in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.buf.width()
    }

    /// Returns the height of this image, in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.buf.height()
    }

    /// Total number of pixels.
    #[inline]
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }

    /// Whether this image holds original or processed pixel data.
    #[inline]
    pub fn tag(&self) -> ImageTag {
        self.tag
    }

    /// Marks the image as holding perturbed pixel data.
    pub fn into_processed(mut self) -> Self {
        self.tag = ImageTag::Processed;
        self
    }

    /// Gets the RGBA value at the given pixel coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the bounds of this image.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        self.buf[(x, y)].0
    }

    /// Sets the RGBA value at the given pixel coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is outside the bounds of this image.
    #[inline]
    pub fn set(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        self.buf[(x, y)] = image::Rgba(rgba);
    }

    /// Resamples the image to a new size with Lanczos3 interpolation.
    ///
    /// Used both for internal downscaling of oversized inputs and for
    /// aligning dimensions before metric comparison, so quality-preserving
    /// interpolation matters more than speed here.
    pub fn resize(&self, width: u32, height: u32) -> Image {
        Image {
            buf: image::imageops::resize(&self.buf, width, height, FilterType::Lanczos3),
            tag: self.tag,
        }
    }

    /// Drops the alpha channel.
    pub(crate) fn to_rgb(&self) -> RgbImage {
        let mut rgb = RgbImage::new(self.width(), self.height());
        for (x, y, pixel) in self.buf.enumerate_pixels() {
            let [r, g, b, _] = pixel.0;
            rgb.put_pixel(x, y, image::Rgb([r, g, b]));
        }
        rgb
    }

    /// Encodes the image as JPEG, adapting quality toward the output byte
    /// envelope.
    ///
    /// Binary-searches the quality range `[75, 100]` for the highest setting
    /// that stays within ~4 MB. If even the quality floor exceeds the
    /// envelope, the floor wins and the oversized result is returned as-is.
    pub fn encode_to_envelope(&self) -> Result<EncodedImage> {
        let rgb = self.to_rgb();

        let mut lo = QUALITY_FLOOR;
        let mut hi = 100u8;
        let mut best: Option<(Vec<u8>, u8)> = None;

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let data = encode_jpeg(&rgb, mid)?;
            if data.len() <= ENVELOPE_MAX_BYTES {
                best = Some((data, mid));
                if mid == 100 {
                    break;
                }
                lo = mid + 1;
            } else {
                if mid == QUALITY_FLOOR {
                    break;
                }
                hi = mid - 1;
            }
        }

        let (data, quality) = match best {
            Some(found) => found,
            // Quality floor exceeds the envelope; deliver it anyway.
            None => (encode_jpeg(&rgb, QUALITY_FLOOR)?, QUALITY_FLOOR),
        };

        log::debug!(
            "encoded {}x{} output at quality {} ({} bytes)",
            self.width(),
            self.height(),
            quality,
            data.len()
        );

        Ok(EncodedImage {
            data,
            quality,
            width: self.width(),
            height: self.height(),
        })
    }
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut data, quality);
    encoder
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| CloakError::Conversion {
            action: "encode",
            reason: e.to_string(),
        })?;
    Ok(data)
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} Image ({:?})", self.width(), self.height(), self.tag)
    }
}

/// A compressed output image produced by [`Image::encode_to_envelope`].
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// JPEG bytes.
    pub data: Vec<u8>,
    /// The quality setting that was used, in percent.
    pub quality: u8,
    /// Width of the encoded image, in pixels.
    pub width: u32,
    /// Height of the encoded image, in pixels.
    pub height: u32,
}
