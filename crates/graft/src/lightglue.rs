//! LightGlue checkpoint conversion.
//!
//! Translates the published SuperPoint+LightGlue release checkpoint into
//! this library's naming scheme, merges the pretrained SuperPoint detector
//! under `keypoint_detector.`, loads the combined dict into
//! [`LightGlueForKeypointMatching`], saves, reloads and verifies the
//! recorded golden outputs.

use crate::pipeline::{self, ConvertOptions};
use graft_core::checkpoint;
use graft_core::error::Result;
use graft_core::hub::Source;
use graft_core::model::LightGlueForKeypointMatching;
use graft_core::prelude::{GoldenOutputs, KeyMapping, LightGlueConfig, Rule};
use graft_core::state_dict::{merge_namespaced, transplant};
use tracing::{debug, info};

/// Release URL of the original checkpoint.
pub const DEFAULT_CHECKPOINT_URL: &str =
    "https://github.com/cvg/LightGlue/releases/download/v0.1_arxiv/superpoint_lightglue.pth";

/// Hub repository of the pretrained keypoint detector whose weights are
/// merged into the converted model.
pub const KEYPOINT_DETECTOR_REPO: &str = "magic-leap-community/superpoint";

const MODEL_NAME: &str = "lightglue";

/// Ordered key-mapping table from the original checkpoint naming to ours.
pub fn key_mapping() -> Result<KeyMapping> {
    Ok(KeyMapping::new(vec![
        Rule::template(r"posenc.Wr.weight", r"positional_encoder.projector.weight")?,
        Rule::template(
            r"self_attn.(\d+).Wqkv.weight",
            r"transformer_layers.$1.self_attention_block.Wqkv.weight",
        )?,
        Rule::template(
            r"self_attn.(\d+).Wqkv.bias",
            r"transformer_layers.$1.self_attention_block.Wqkv.bias",
        )?,
        Rule::template(
            r"self_attn.(\d+).out_proj.weight",
            r"transformer_layers.$1.self_attention_block.output_projection.weight",
        )?,
        Rule::template(
            r"self_attn.(\d+).out_proj.bias",
            r"transformer_layers.$1.self_attention_block.output_projection.bias",
        )?,
        Rule::template(
            r"self_attn.(\d+).ffn.(\d+).weight",
            r"transformer_layers.$1.self_attention_block.ffn.$2.weight",
        )?,
        Rule::template(
            r"self_attn.(\d+).ffn.(\d+).bias",
            r"transformer_layers.$1.self_attention_block.ffn.$2.bias",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_qk.weight",
            r"transformer_layers.$1.cross_attention_block.to_qk.weight",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_qk.bias",
            r"transformer_layers.$1.cross_attention_block.to_qk.bias",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_v.weight",
            r"transformer_layers.$1.cross_attention_block.to_v.weight",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_v.bias",
            r"transformer_layers.$1.cross_attention_block.to_v.bias",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_out.weight",
            r"transformer_layers.$1.cross_attention_block.to_out.weight",
        )?,
        Rule::template(
            r"cross_attn.(\d+).to_out.bias",
            r"transformer_layers.$1.cross_attention_block.to_out.bias",
        )?,
        Rule::template(
            r"cross_attn.(\d+).ffn.(\d+).weight",
            r"transformer_layers.$1.cross_attention_block.ffn.$2.weight",
        )?,
        Rule::template(
            r"cross_attn.(\d+).ffn.(\d+).bias",
            r"transformer_layers.$1.cross_attention_block.ffn.$2.bias",
        )?,
        Rule::template(
            r"log_assignment.(\d+).matchability.weight",
            r"match_assignment_layers.$1.matchability.weight",
        )?,
        Rule::template(
            r"log_assignment.(\d+).matchability.bias",
            r"match_assignment_layers.$1.matchability.bias",
        )?,
        Rule::template(
            r"log_assignment.(\d+).final_proj.weight",
            r"match_assignment_layers.$1.final_projection.weight",
        )?,
        Rule::template(
            r"log_assignment.(\d+).final_proj.bias",
            r"match_assignment_layers.$1.final_projection.bias",
        )?,
        Rule::template(
            r"token_confidence.(\d+).token.0.weight",
            r"token_confidence.$1.token.weight",
        )?,
        Rule::template(
            r"token_confidence.(\d+).token.0.bias",
            r"token_confidence.$1.token.bias",
        )?,
    ]))
}

/// Run the full LightGlue conversion.
pub fn convert(options: &ConvertOptions, checkpoint_url: &str) -> Result<()> {
    std::fs::create_dir_all(&options.output_dir)?;
    let device = pipeline::device();

    let config = LightGlueConfig::default();
    config.save_pretrained(&options.output_dir)?;
    info!("model config saved successfully");

    info!("fetching all parameters from the checkpoint at {checkpoint_url}");
    let checkpoint_path =
        Source::parse(checkpoint_url, "superpoint_lightglue.pth")?.fetch(&pipeline::cache_dir())?;
    let original = checkpoint::load_pth(&checkpoint_path, None)?;

    info!("converting {} parameters", original.len());
    let keys: Vec<String> = original.keys().map(str::to_string).collect();
    let renames = key_mapping()?.apply(&keys);
    let mut state = transplant(original, &renames)?;

    info!("merging the pretrained keypoint detector from {KEYPOINT_DETECTOR_REPO}");
    let detector_path =
        Source::hub(KEYPOINT_DETECTOR_REPO, "model.safetensors").fetch(&pipeline::cache_dir())?;
    let detector_state = checkpoint::load_safetensors(&detector_path, &device)?;
    merge_namespaced(&mut state, "keypoint_detector", detector_state)?;

    info!("loading the checkpoint into a LightGlue model");
    let model = LightGlueForKeypointMatching::from_state_dict(config, state, &device)?;
    info!("checkpoint loaded successfully");

    if !options.save_model {
        debug!("--save-model not set; artifacts are still written for the reload check");
    }
    info!("saving the model");
    model.save_pretrained(&options.output_dir)?;
    drop(model);

    info!("reloading the model to check it was saved correctly");
    let model = LightGlueForKeypointMatching::from_pretrained(&options.output_dir, &device)?;
    info!("model reloaded successfully");

    info!("checking the model outputs");
    let (left, right) = pipeline::fetch_test_image_pair()?;
    let processor = pipeline::save_image_processor(&options.output_dir)?;
    let inputs = processor.preprocess_pair(&left, &right, &device)?;
    let outputs = model.forward(&inputs, true, true)?;
    GoldenOutputs::lightglue().check(&outputs)?;
    info!("model outputs verified successfully");

    if options.push_to_hub {
        pipeline::publish_artifacts(&options.organization, MODEL_NAME, &options.output_dir)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use graft_core::model::WeightBinder;
    use std::collections::BTreeSet;

    fn rename(key: &str) -> Option<String> {
        let mapping = key_mapping().unwrap();
        let map = mapping.apply(&[key.to_string()]);
        map.get(key).unwrap().map(str::to_string)
    }

    #[test]
    fn positional_encoder_rule() {
        assert_eq!(
            rename("posenc.Wr.weight").unwrap(),
            "positional_encoder.projector.weight"
        );
    }

    #[test]
    fn self_attention_rules() {
        assert_eq!(
            rename("self_attn.0.Wqkv.weight").unwrap(),
            "transformer_layers.0.self_attention_block.Wqkv.weight"
        );
        assert_eq!(
            rename("self_attn.8.out_proj.bias").unwrap(),
            "transformer_layers.8.self_attention_block.output_projection.bias"
        );
        // Feed-forward sequential indices survive the rename.
        assert_eq!(
            rename("self_attn.3.ffn.1.weight").unwrap(),
            "transformer_layers.3.self_attention_block.ffn.1.weight"
        );
        assert_eq!(
            rename("self_attn.3.ffn.3.bias").unwrap(),
            "transformer_layers.3.self_attention_block.ffn.3.bias"
        );
    }

    #[test]
    fn cross_attention_rules() {
        assert_eq!(
            rename("cross_attn.5.to_qk.weight").unwrap(),
            "transformer_layers.5.cross_attention_block.to_qk.weight"
        );
        assert_eq!(
            rename("cross_attn.5.ffn.0.bias").unwrap(),
            "transformer_layers.5.cross_attention_block.ffn.0.bias"
        );
    }

    #[test]
    fn assignment_and_confidence_rules() {
        assert_eq!(
            rename("log_assignment.8.final_proj.weight").unwrap(),
            "match_assignment_layers.8.final_projection.weight"
        );
        assert_eq!(
            rename("log_assignment.0.matchability.bias").unwrap(),
            "match_assignment_layers.0.matchability.bias"
        );
        // The sequential index inside the confidence head collapses.
        assert_eq!(
            rename("token_confidence.7.token.0.weight").unwrap(),
            "token_confidence.7.token.weight"
        );
    }

    /// All original matcher checkpoint keys for the default configuration.
    fn original_checkpoint_keys(config: &LightGlueConfig) -> Vec<String> {
        let mut keys = vec!["posenc.Wr.weight".to_string()];
        for layer in 0..config.num_layers {
            for param in ["weight", "bias"] {
                keys.push(format!("self_attn.{layer}.Wqkv.{param}"));
                keys.push(format!("self_attn.{layer}.out_proj.{param}"));
                for ffn in [0, 1, 3] {
                    keys.push(format!("self_attn.{layer}.ffn.{ffn}.{param}"));
                }
                keys.push(format!("cross_attn.{layer}.to_qk.{param}"));
                keys.push(format!("cross_attn.{layer}.to_v.{param}"));
                keys.push(format!("cross_attn.{layer}.to_out.{param}"));
                for ffn in [0, 1, 3] {
                    keys.push(format!("cross_attn.{layer}.ffn.{ffn}.{param}"));
                }
                keys.push(format!("log_assignment.{layer}.matchability.{param}"));
                keys.push(format!("log_assignment.{layer}.final_proj.{param}"));
            }
        }
        for layer in 0..config.num_layers - 1 {
            keys.push(format!("token_confidence.{layer}.token.0.weight"));
            keys.push(format!("token_confidence.{layer}.token.0.bias"));
        }
        keys
    }

    /// The keypoint detector's own state dict keys (merged under a prefix,
    /// not rewritten).
    fn detector_keys(config: &LightGlueConfig) -> Vec<String> {
        let mut keys = Vec::new();
        for block in 0..config.keypoint_detector.encoder_hidden_sizes.len() {
            for conv in ["conv_a", "conv_b"] {
                for param in ["weight", "bias"] {
                    keys.push(format!("encoder.conv_blocks.{block}.{conv}.{param}"));
                }
            }
        }
        for (head, conv) in [
            ("keypoint_decoder", "conv_score_a"),
            ("keypoint_decoder", "conv_score_b"),
            ("descriptor_decoder", "conv_descriptor_a"),
            ("descriptor_decoder", "conv_descriptor_b"),
        ] {
            for param in ["weight", "bias"] {
                keys.push(format!("{head}.{conv}.{param}"));
            }
        }
        keys
    }

    #[test]
    fn every_original_key_lands_in_the_model_schema() {
        let config = LightGlueConfig::default();
        let keys = original_checkpoint_keys(&config);
        let renames = key_mapping().unwrap().apply(&keys);
        assert_eq!(renames.len(), keys.len());

        let mut converted: BTreeSet<String> = renames
            .iter()
            .filter_map(|(_, new)| new.map(str::to_string))
            .collect();
        for key in detector_keys(&config) {
            converted.insert(format!("keypoint_detector.{key}"));
        }

        let device = Device::Cpu;
        let mut binder = WeightBinder::random(&device);
        LightGlueForKeypointMatching::from_binder(config, &mut binder, &device).unwrap();
        let bound: BTreeSet<String> = binder.bound_names().iter().cloned().collect();

        let missing: Vec<&String> = converted.difference(&bound).collect();
        let extra: Vec<&String> = bound.difference(&converted).collect();
        assert!(
            missing.is_empty() && extra.is_empty(),
            "converted keys not in schema: {missing:?}; schema slots never converted: {extra:?}"
        );
    }

    #[test]
    fn no_key_is_unintentionally_dropped() {
        let config = LightGlueConfig::default();
        let keys = original_checkpoint_keys(&config);
        let renames = key_mapping().unwrap().apply(&keys);

        for (old, new) in renames.iter() {
            let new = new.unwrap_or_else(|| panic!("key {old} was dropped"));
            assert_ne!(old, new, "key {old} passed through unmapped");
        }
    }

    #[test]
    #[ignore = "requires network access and the release checkpoints"]
    fn end_to_end_conversion_matches_golden_outputs() {
        let dir = std::env::temp_dir().join("graft-e2e-lightglue");
        let options = ConvertOptions::new(&dir);
        // convert() itself checks the (1, 2, 866) shapes, the 127 valid
        // matches and the recorded index/score slices.
        convert(&options, DEFAULT_CHECKPOINT_URL).unwrap();
    }

    #[test]
    fn merged_detector_keys_stay_disjoint() {
        let config = LightGlueConfig::default();
        let keys = original_checkpoint_keys(&config);
        let renames = key_mapping().unwrap().apply(&keys);

        let converted: BTreeSet<String> = renames
            .iter()
            .filter_map(|(_, new)| new.map(str::to_string))
            .collect();
        for key in detector_keys(&config) {
            let namespaced = format!("keypoint_detector.{key}");
            assert!(
                !converted.contains(&namespaced),
                "{namespaced} collides with a converted matcher key"
            );
        }
    }
}
