//! Default codec built on the `image` crate.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader, Limits};
use tracing::trace;

use crate::domain::entities::{
    DecodeQuality, DecodedPayload, PixelFormat, RequestOptions, ScaleMode, Size, SizeClass,
};
use crate::domain::errors::CodecError;
use crate::domain::ports::{BufferSource, ImageCodec};

/// Default cap on what a single decode may allocate (256 MB).
pub const DEFAULT_MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

/// Decodes PNG, JPEG and WebP into pooled buffers.
///
/// High quality keeps 32-bit RGBA and resamples with Lanczos3. Low quality
/// packs pixels as RGB565 and uses nearest-neighbour sampling.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    max_alloc: u64,
}

impl ImageCrateCodec {
    /// Creates a codec refusing decodes that would allocate more than
    /// `max_alloc` bytes.
    #[must_use]
    pub const fn new(max_alloc: u64) -> Self {
        Self { max_alloc }
    }

    fn read(&self, bytes: &[u8]) -> Result<DynamicImage, CodecError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::malformed(e.to_string()))?;
        if reader.format().is_none() {
            return Err(CodecError::UnknownFormat);
        }
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);

        reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => CodecError::OutOfMemory {
                bytes: usize::try_from(self.max_alloc).unwrap_or(usize::MAX),
            },
            ImageError::Unsupported(_) => CodecError::UnknownFormat,
            other => CodecError::malformed(other.to_string()),
        })
    }
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DECODE_ALLOC)
    }
}

impl ImageCodec for ImageCrateCodec {
    fn decode(
        &self,
        bytes: &[u8],
        options: &RequestOptions,
        buffers: &dyn BufferSource,
    ) -> Result<DecodedPayload, CodecError> {
        let image = self.read(bytes)?;
        let source = Size::new(image.width(), image.height());

        let (filter, format) = match options.quality() {
            DecodeQuality::High => (FilterType::Lanczos3, PixelFormat::Rgba8888),
            DecodeQuality::Low => (FilterType::Nearest, PixelFormat::Rgb565),
        };
        let scaled = scale(image, options, filter);
        let rgba = scaled.to_rgba8();
        let size = Size::new(rgba.width(), rgba.height());
        if size.area() == 0 {
            return Err(CodecError::malformed("image has no pixels"));
        }

        let mut buffer = buffers.obtain(SizeClass::new(size, format));
        write_pixels(buffer.pixels_mut(), rgba.as_raw(), format);
        trace!(%source, %size, %format, "Decoded image");
        Ok(DecodedPayload::new(buffer, source))
    }
}

/// Applies the resize target, then the max-size cap.
///
/// Without `force_exact_resize`, a resize never scales up.
fn scale(image: DynamicImage, options: &RequestOptions, filter: FilterType) -> DynamicImage {
    let mut image = image;

    if let Some(resize) = options.resize_target() {
        let current = Size::new(image.width(), image.height());
        let target = resize.size;
        let needed = options.is_force_exact_resize() || !target.contains(current);
        if needed && target.area() > 0 {
            image = match resize.mode {
                ScaleMode::Fit => image.resize(target.width, target.height, filter),
                ScaleMode::Fill => image.resize_to_fill(target.width, target.height, filter),
                ScaleMode::Exact => image.resize_exact(target.width, target.height, filter),
            };
        }
    }

    if let Some(max) = options.max_size_limit() {
        let current = Size::new(image.width(), image.height());
        if !max.contains(current) && max.area() > 0 {
            image = image.resize(max.width, max.height, filter);
        }
    }

    image
}

fn write_pixels(out: &mut [u8], rgba: &[u8], format: PixelFormat) {
    match format {
        PixelFormat::Rgba8888 => out.copy_from_slice(&rgba[..out.len()]),
        PixelFormat::Rgb565 => {
            for (dst, px) in out.chunks_exact_mut(2).zip(rgba.chunks_exact(4)) {
                let packed = (u16::from(px[0] >> 3) << 11)
                    | (u16::from(px[1] >> 2) << 5)
                    | u16::from(px[2] >> 3);
                dst.copy_from_slice(&packed.to_le_bytes());
            }
        }
        PixelFormat::Gray8 => {
            for (dst, px) in out.iter_mut().zip(rgba.chunks_exact(4)) {
                let luma = (u32::from(px[0]) * 299 + u32::from(px[1]) * 587 + u32::from(px[2]) * 114)
                    / 1000;
                *dst = u8::try_from(luma).unwrap_or(u8::MAX);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::image::ResourcePool;
    use image::{ImageFormat, Rgba, RgbaImage};

    /// Encodes a solid-color PNG.
    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn decode(bytes: &[u8], options: &RequestOptions) -> Result<DecodedPayload, CodecError> {
        ImageCrateCodec::default().decode(bytes, options, &ResourcePool::default())
    }

    #[test]
    fn test_decode_full_size() {
        let payload = decode(&png(40, 20), &RequestOptions::new()).unwrap();
        assert_eq!(payload.size(), Size::new(40, 20));
        assert_eq!(payload.source_size(), Size::new(40, 20));
        assert_eq!(payload.format(), PixelFormat::Rgba8888);
        assert_eq!(&payload.pixels()[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_max_size_keeps_aspect() {
        let payload = decode(&png(400, 200), &RequestOptions::new().max_size(100, 100)).unwrap();
        assert_eq!(payload.size(), Size::new(100, 50));
        assert_eq!(payload.source_size(), Size::new(400, 200));
    }

    #[test]
    fn test_fit_does_not_upscale_without_force() {
        let options = RequestOptions::new().resize(100, 100, ScaleMode::Fit);
        assert_eq!(decode(&png(40, 20), &options).unwrap().size(), Size::new(40, 20));

        let forced = options.force_exact_resize(true);
        assert_eq!(decode(&png(40, 20), &forced).unwrap().size(), Size::new(100, 50));
    }

    #[test]
    fn test_fill_and_exact() {
        let fill = RequestOptions::new().resize(10, 10, ScaleMode::Fill);
        assert_eq!(decode(&png(40, 20), &fill).unwrap().size(), Size::new(10, 10));

        let exact = RequestOptions::new().resize(10, 30, ScaleMode::Exact);
        assert_eq!(decode(&png(40, 40), &exact).unwrap().size(), Size::new(10, 30));
    }

    #[test]
    fn test_low_quality_packs_rgb565() {
        let options = RequestOptions::new().decode_quality(DecodeQuality::Low);
        let payload = decode(&png(4, 4), &options).unwrap();
        assert_eq!(payload.format(), PixelFormat::Rgb565);
        assert_eq!(payload.byte_size(), 32);
        // Pure red: 0b11111_000000_00000.
        assert_eq!(&payload.pixels()[..2], &0xF800u16.to_le_bytes());
    }

    #[test]
    fn test_garbage_is_unknown_format() {
        let err = decode(b"definitely not an image", &RequestOptions::new()).unwrap_err();
        assert!(matches!(err, CodecError::UnknownFormat));
    }

    #[test]
    fn test_truncated_png_is_malformed() {
        let bytes = png(40, 20);
        let err = decode(&bytes[..bytes.len() / 2], &RequestOptions::new()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_alloc_limit_is_out_of_memory() {
        let codec = ImageCrateCodec::new(16);
        let err = codec
            .decode(&png(64, 64), &RequestOptions::new(), &ResourcePool::default())
            .unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_decode_reuses_pooled_buffer() {
        let pool = ResourcePool::default();
        let first = ImageCrateCodec::default()
            .decode(&png(8, 8), &RequestOptions::new(), &pool)
            .unwrap();
        pool.release(first.into_buffer());
        assert_eq!(pool.stats().idle_buffers, 1);

        let _second = ImageCrateCodec::default()
            .decode(&png(8, 8), &RequestOptions::new(), &pool)
            .unwrap();
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.stats().idle_buffers, 0);
    }
}
