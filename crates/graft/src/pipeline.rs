//! Shared conversion pipeline plumbing.
//!
//! Both converters follow the same strictly linear flow:
//! config → fetch → rewrite keys → transplant → build/bind → save →
//! reload → verify → (optional) publish. This module holds the pieces the
//! two flows share.

use candle_core::Device;
use graft_core::error::Result;
use graft_core::hub::{self, Publisher};
use graft_core::image::ImageProcessor;
use hf_hub::RepoType;
use std::path::{Path, PathBuf};
use tracing::info;

/// Hub dataset holding the fixed verification image pair.
pub const TEST_IMAGE_DATASET: &str = "hf-internal-testing/image-matching-test-dataset";

/// Default organization converted artifacts are published under.
pub const DEFAULT_ORGANIZATION: &str = "stevenbucaille";

/// Options common to both conversion pipelines.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Directory receiving `config.json`, `model.safetensors` and
    /// `preprocessor_config.json`.
    pub output_dir: PathBuf,
    /// Hub organization for publishing.
    pub organization: String,
    /// Accepted for compatibility; artifacts are always written because the
    /// reload check needs them.
    pub save_model: bool,
    /// Publish the saved artifacts after verification.
    pub push_to_hub: bool,
}

impl ConvertOptions {
    /// Options writing to `output_dir`, not publishing.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            organization: DEFAULT_ORGANIZATION.to_string(),
            save_model: false,
            push_to_hub: false,
        }
    }
}

/// Pick the conversion device: CUDA when present, CPU otherwise.
pub fn device() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}

/// Download cache for URL-sourced checkpoints.
pub fn cache_dir() -> PathBuf {
    std::env::temp_dir().join("graft-downloads")
}

/// Fetch the fixed verification image pair from the test dataset.
///
/// The pair order (second image first) is part of the recorded fixtures.
pub fn fetch_test_image_pair() -> Result<(PathBuf, PathBuf)> {
    let left = hub::fetch_hub_file(TEST_IMAGE_DATASET, "image_2.png", RepoType::Dataset)?;
    let right = hub::fetch_hub_file(TEST_IMAGE_DATASET, "image_0.png", RepoType::Dataset)?;
    Ok((left, right))
}

/// Write the preprocessing config next to the model artifacts.
pub fn save_image_processor(dir: &Path) -> Result<ImageProcessor> {
    let processor = ImageProcessor::default();
    processor.save_pretrained(dir)?;
    info!("image processor config saved");
    Ok(processor)
}

/// Publish the three saved artifacts to `{organization}/{model_name}`.
pub fn publish_artifacts(organization: &str, model_name: &str, dir: &Path) -> Result<()> {
    let repo_id = format!("{organization}/{model_name}");
    info!("pushing artifacts to {repo_id}");
    let publisher = Publisher::from_env()?;
    publisher.create_repo(&repo_id)?;
    publisher.upload_files(
        &repo_id,
        dir,
        &["config.json", "model.safetensors", "preprocessor_config.json"],
        "Add model",
    )?;
    info!("artifacts published to {repo_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_local_only() {
        let options = ConvertOptions::new("/tmp/out");
        assert_eq!(options.organization, DEFAULT_ORGANIZATION);
        assert!(!options.push_to_hub);
        assert_eq!(options.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn cache_dir_is_stable() {
        assert_eq!(cache_dir(), cache_dir());
    }
}
