//! Image preprocessing for keypoint matching models.
//!
//! Both model families consume pairs of grayscale images resized to a fixed
//! resolution and rescaled to `[0, 1]`. The processor configuration is
//! serialized next to the model artifacts as `preprocessor_config.json` so
//! downstream loaders reproduce the exact preprocessing.

use crate::error::{GraftError, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Target resolution for resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    /// Height in pixels.
    pub height: usize,
    /// Width in pixels.
    pub width: usize,
}

/// Fixed preprocessing applied to input image pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageProcessor {
    /// Processor identifier written to the config file.
    pub image_processor_type: String,
    /// Whether images are resized to [`ImageProcessor::size`].
    pub do_resize: bool,
    /// Target resolution.
    pub size: ImageSize,
    /// Whether pixel values are rescaled.
    pub do_rescale: bool,
    /// Rescale factor applied to raw pixel values.
    pub rescale_factor: f64,
    /// Whether images are converted to grayscale.
    pub do_grayscale: bool,
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            image_processor_type: "KeypointMatchingImageProcessor".to_string(),
            do_resize: true,
            size: ImageSize {
                height: 480,
                width: 640,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_grayscale: true,
        }
    }
}

impl ImageProcessor {
    /// Load one image as a `(1, height, width)` grayscale tensor.
    pub fn load(&self, path: &Path, device: &Device) -> Result<Tensor> {
        let img = image::open(path)
            .map_err(|e| GraftError::Image(format!("failed to open {}: {e}", path.display())))?;
        let img = if self.do_resize {
            img.resize_exact(
                self.size.width as u32,
                self.size.height as u32,
                image::imageops::FilterType::Triangle,
            )
        } else {
            img
        };
        let gray = img.to_luma8();
        let (width, height) = gray.dimensions();

        let factor = if self.do_rescale {
            self.rescale_factor as f32
        } else {
            1.0
        };
        let values: Vec<f32> = gray.into_raw().iter().map(|&p| f32::from(p) * factor).collect();
        let tensor = Tensor::from_vec(values, (1, height as usize, width as usize), device)?;
        Ok(tensor)
    }

    /// Load an image pair as the `(1, 2, 1, height, width)` model input.
    pub fn preprocess_pair(&self, left: &Path, right: &Path, device: &Device) -> Result<Tensor> {
        let left = self.load(left, device)?;
        let right = self.load(right, device)?;
        let pair = Tensor::stack(&[left, right], 0)?;
        Ok(pair.unsqueeze(0)?)
    }

    /// Write `preprocessor_config.json` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join("preprocessor_config.json");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a processor back from a saved directory.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let contents = fs::read_to_string(dir.join("preprocessor_config.json"))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_image(dir: &Path, name: &str, value: u8) -> std::path::PathBuf {
        let path = dir.join(name);
        let img = image::GrayImage::from_pixel(8, 6, image::Luma([value]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn load_resizes_and_rescales() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_image(dir.path(), "white.png", 255);

        let processor = ImageProcessor {
            size: ImageSize {
                height: 12,
                width: 16,
            },
            ..Default::default()
        };
        let tensor = processor.load(&path, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 12, 16]);

        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((v - 1.0).abs() < 1e-6, "expected 1.0, got {v}");
        }
    }

    #[test]
    fn pair_has_batch_and_pair_dims() {
        let dir = tempfile::tempdir().unwrap();
        let left = write_test_image(dir.path(), "left.png", 0);
        let right = write_test_image(dir.path(), "right.png", 128);

        let processor = ImageProcessor {
            size: ImageSize {
                height: 32,
                width: 32,
            },
            ..Default::default()
        };
        let pair = processor
            .preprocess_pair(&left, &right, &Device::Cpu)
            .unwrap();
        assert_eq!(pair.dims(), &[1, 2, 1, 32, 32]);
    }

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let processor = ImageProcessor::default();
        processor.save_pretrained(dir.path()).unwrap();

        assert!(dir.path().join("preprocessor_config.json").is_file());
        let reloaded = ImageProcessor::from_pretrained(dir.path()).unwrap();
        assert_eq!(reloaded.size, processor.size);
        assert!(reloaded.do_grayscale);
        assert!((reloaded.rescale_factor - 1.0 / 255.0).abs() < 1e-12);
    }
}
