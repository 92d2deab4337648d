//! JPEG re-encoding before transfer.

use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tracing::{debug, warn};

use vitrine_core::logging::SUBSYSTEM_SYNC;
use vitrine_core::{BinaryOptimizer, Error, OptimizeOptions, Result};

/// Decodes any format the `image` crate understands, downsizes to fit the
/// bounds and re-encodes as JPEG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptimizer;

impl BinaryOptimizer for ImageOptimizer {
    fn optimize(&self, raw: &[u8], options: &OptimizeOptions) -> Result<Vec<u8>> {
        let img = image::load_from_memory(raw)
            .map_err(|e| Error::InvalidInput(format!("undecodable image: {}", e)))?;

        let img = if img.width() > options.max_width || img.height() > options.max_height {
            img.resize(options.max_width, options.max_height, FilterType::Lanczos3)
        } else {
            img
        };

        let rgb = img.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, options.quality)
            .encode_image(&rgb)
            .map_err(|e| Error::Internal(format!("jpeg encode failed: {}", e)))?;
        Ok(out)
    }
}

/// Run the optimizer off the async runtime, falling back to the raw bytes
/// when it fails.
pub(crate) async fn optimize_or_raw(
    optimizer: Arc<dyn BinaryOptimizer>,
    raw: Arc<[u8]>,
    options: OptimizeOptions,
) -> Arc<[u8]> {
    let input = Arc::clone(&raw);
    let result =
        tokio::task::spawn_blocking(move || optimizer.optimize(&input, &options)).await;
    match result {
        Ok(Ok(encoded)) => {
            debug!(
                subsystem = SUBSYSTEM_SYNC,
                component = "optimizer",
                raw_bytes = raw.len(),
                encoded_bytes = encoded.len(),
                "Binary optimized"
            );
            Arc::from(encoded)
        }
        Ok(Err(e)) => {
            warn!(subsystem = SUBSYSTEM_SYNC, component = "optimizer", error = %e, "Optimization failed, using raw bytes");
            raw
        }
        Err(e) => {
            warn!(subsystem = SUBSYSTEM_SYNC, component = "optimizer", error = %e, "Optimizer task failed, using raw bytes");
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([200, 120, 40]),
        ));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_oversized_image_is_downscaled_to_bounds() {
        let options = OptimizeOptions {
            max_width: 64,
            max_height: 64,
            quality: 80,
        };
        let encoded = ImageOptimizer.optimize(&png(256, 128), &options).unwrap();

        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 32));
        assert_eq!(
            image::guess_format(&encoded).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn test_small_image_keeps_dimensions() {
        let encoded = ImageOptimizer
            .optimize(&png(10, 20), &OptimizeOptions::default())
            .unwrap();
        let decoded = image::load_from_memory(&encoded).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (10, 20));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = ImageOptimizer
            .optimize(b"not an image", &OptimizeOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_raw_bytes() {
        let raw: Arc<[u8]> = Arc::from(b"not an image".to_vec());
        let out = optimize_or_raw(
            Arc::new(ImageOptimizer),
            Arc::clone(&raw),
            OptimizeOptions::default(),
        )
        .await;
        assert_eq!(&*out, &*raw);
    }
}
