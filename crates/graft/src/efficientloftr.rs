//! EfficientLoFTR checkpoint conversion.
//!
//! Translates the published EfficientLoFTR release checkpoint into this
//! library's naming scheme, loads it into
//! [`EfficientLoftrForKeypointMatching`], saves the artifacts, reloads them
//! and verifies the recorded golden outputs.

use crate::pipeline::{self, ConvertOptions};
use graft_core::checkpoint;
use graft_core::error::Result;
use graft_core::hub::Source;
use graft_core::model::EfficientLoftrForKeypointMatching;
use graft_core::prelude::{EfficientLoftrConfig, GoldenOutputs, KeyMapping, Rule};
use graft_core::state_dict::transplant;
use regex::Captures;
use tracing::{debug, info};

/// Hub repository of the original release checkpoint.
pub const DEFAULT_MODEL_REPO: &str = "stevenbucaille/efficient_loftr_pth";
/// Checkpoint file name within the repository.
pub const DEFAULT_FILE: &str = "eloftr.pth";

const MODEL_NAME: &str = "efficientloftr";

fn index(caps: &Captures, group: usize) -> usize {
    caps[group].parse().unwrap_or(0)
}

/// Paired attention sub-layer index: original layers alternate self/cross,
/// so halving the index folds them onto the pair.
fn pair(caps: &Captures) -> usize {
    index(caps, 1) / 2
}

/// Fine-head block index: the 1/4-scale level (original layer 2) becomes
/// bucket 0; the 1/2-scale level keeps its index.
fn refinement_bucket(caps: &Captures) -> usize {
    let idx = index(caps, 1);
    if idx == 2 {
        0
    } else {
        idx
    }
}

/// Ordered key-mapping table from the original checkpoint naming to ours.
///
/// Table order is load-bearing: the `layer3_outconv` rule must run before
/// the generic `layer(\d+)_outconv` rules, and the paired attention rules
/// rely on even/odd layer indices surviving until their own rule fires.
pub fn key_mapping() -> Result<KeyMapping> {
    Ok(KeyMapping::new(vec![
        Rule::template(
            r"matcher.backbone.layer(\d+).rbr_dense.conv",
            r"model.backbone.stages.$1.blocks.0.conv1.conv",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).rbr_dense.bn",
            r"model.backbone.stages.$1.blocks.0.conv1.norm",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).rbr_1x1.conv",
            r"model.backbone.stages.$1.blocks.0.conv2.conv",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).rbr_1x1.bn",
            r"model.backbone.stages.$1.blocks.0.conv2.norm",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).(\d+).rbr_dense.conv",
            r"model.backbone.stages.$1.blocks.$2.conv1.conv",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).(\d+).rbr_dense.bn",
            r"model.backbone.stages.$1.blocks.$2.conv1.norm",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).(\d+).rbr_1x1.conv",
            r"model.backbone.stages.$1.blocks.$2.conv2.conv",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).(\d+).rbr_1x1.bn",
            r"model.backbone.stages.$1.blocks.$2.conv2.norm",
        )?,
        Rule::template(
            r"matcher.backbone.layer(\d+).(\d+).rbr_identity",
            r"model.backbone.stages.$1.blocks.$2.identity",
        )?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).aggregate", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.aggregation.q_aggregation",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).norm1", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.aggregation.norm",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).q_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.attention.q_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).k_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.attention.k_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).v_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.attention.v_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).merge", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.attention.o_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).mlp.(\d+)", |caps| {
            let fc = if &caps[2] == "0" { 1 } else { 2 };
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.mlp.fc{fc}",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[02468]).norm2", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.self_attention.mlp.layer_norm",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).aggregate", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.aggregation.q_aggregation",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).norm1", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.aggregation.norm",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).q_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.attention.q_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).k_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.attention.k_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).v_proj", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.attention.v_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).merge", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.attention.o_proj",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).mlp.(\d+)", |caps| {
            let fc = if &caps[2] == "0" { 1 } else { 2 };
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.mlp.fc{fc}",
                pair(caps)
            )
        })?,
        Rule::rename(r"matcher.loftr_coarse.layers.(\d*[13579]).norm2", |caps| {
            format!(
                "model.local_feature_transformer.layers.{}.cross_attention.mlp.layer_norm",
                pair(caps)
            )
        })?,
        Rule::template(
            r"matcher.fine_preprocess.layer3_outconv",
            "refinement_layer.out_conv",
        )?,
        Rule::rename(r"matcher.fine_preprocess.layer(\d+)_outconv.weight", |caps| {
            format!(
                "refinement_layer.out_conv_layers.{}.out_conv1.weight",
                refinement_bucket(caps)
            )
        })?,
        Rule::rename(r"matcher.fine_preprocess.layer(\d+)_outconv2\.0", |caps| {
            format!(
                "refinement_layer.out_conv_layers.{}.out_conv2",
                refinement_bucket(caps)
            )
        })?,
        Rule::rename(r"matcher.fine_preprocess.layer(\d+)_outconv2\.1", |caps| {
            format!(
                "refinement_layer.out_conv_layers.{}.batch_norm",
                refinement_bucket(caps)
            )
        })?,
        Rule::rename(r"matcher.fine_preprocess.layer(\d+)_outconv2\.3", |caps| {
            format!(
                "refinement_layer.out_conv_layers.{}.out_conv3",
                refinement_bucket(caps)
            )
        })?,
    ]))
}

/// Run the full EfficientLoFTR conversion.
pub fn convert(options: &ConvertOptions, repo_id: &str, file_name: &str) -> Result<()> {
    std::fs::create_dir_all(&options.output_dir)?;
    let device = pipeline::device();

    let config = EfficientLoftrConfig::default();
    config.save_pretrained(&options.output_dir)?;
    info!("model config saved successfully");

    info!("fetching all parameters from the checkpoint at {repo_id}/{file_name}");
    let checkpoint_path = Source::hub(repo_id, file_name).fetch(&pipeline::cache_dir())?;
    let original = checkpoint::load_pth(&checkpoint_path, Some("state_dict"))?;

    info!("converting {} parameters", original.len());
    let keys: Vec<String> = original.keys().map(str::to_string).collect();
    let renames = key_mapping()?.apply(&keys);
    let state = transplant(original, &renames)?;

    info!("loading the checkpoint into an EfficientLoFTR model");
    let model = EfficientLoftrForKeypointMatching::from_state_dict(config, state, &device)?;
    info!("checkpoint loaded successfully");

    if !options.save_model {
        debug!("--save-model not set; artifacts are still written for the reload check");
    }
    info!("saving the model");
    model.save_pretrained(&options.output_dir)?;
    drop(model);

    info!("reloading the model to check it was saved correctly");
    let model = EfficientLoftrForKeypointMatching::from_pretrained(&options.output_dir, &device)?;
    info!("model reloaded successfully");

    // The recorded fixtures describe the release checkpoint only.
    if repo_id == DEFAULT_MODEL_REPO {
        info!("checking the model outputs");
        let (left, right) = pipeline::fetch_test_image_pair()?;
        let processor = pipeline::save_image_processor(&options.output_dir)?;
        let inputs = processor.preprocess_pair(&left, &right, &device)?;
        let outputs = model.forward(&inputs, true, true)?;
        GoldenOutputs::efficientloftr().check(&outputs)?;
        info!("model outputs verified successfully");
    } else {
        pipeline::save_image_processor(&options.output_dir)?;
    }

    if options.push_to_hub {
        pipeline::publish_artifacts(&options.organization, MODEL_NAME, &options.output_dir)?;
    }

    Ok(())
}
