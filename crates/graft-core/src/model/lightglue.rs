//! LightGlue keypoint matching.
//!
//! SuperPoint detections from both images are refined by alternating
//! self/cross attention layers with a learnable Fourier positional
//! encoding, then matched by a sigmoid-matchability-weighted dual softmax
//! assignment. The converted model carries the full keypoint detector under
//! the `keypoint_detector.` prefix.

use crate::error::{GraftError, Result};
use crate::model::{
    KeypointMatchingOutput, SuperPointConfig, SuperPointForKeypointDetection, WeightBinder,
    NO_MATCH,
};
use crate::state_dict::StateDict;
use candle_core::{Device, Tensor, D};
use candle_nn::{LayerNorm, Linear, Module};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for [`LightGlueForKeypointMatching`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightGlueConfig {
    /// Descriptor dimension shared with the keypoint detector.
    pub descriptor_dim: usize,
    /// Number of self/cross transformer layers.
    pub num_layers: usize,
    /// Attention heads.
    pub num_heads: usize,
    /// Minimum assignment probability for a match.
    pub filter_threshold: f64,
    /// Early-exit confidence; negative disables adaptive depth.
    pub depth_confidence: f64,
    /// Token-pruning confidence; negative disables adaptive width.
    pub width_confidence: f64,
    /// Layer-norm epsilon for the feed-forward blocks.
    pub layer_norm_eps: f64,
    /// Embedded keypoint detector configuration.
    pub keypoint_detector: SuperPointConfig,
    /// Architecture tag written to `config.json`.
    pub architectures: Vec<String>,
    /// Model family tag.
    pub model_type: String,
}

impl Default for LightGlueConfig {
    fn default() -> Self {
        Self {
            descriptor_dim: 256,
            num_layers: 9,
            num_heads: 4,
            filter_threshold: 0.1,
            depth_confidence: -1.0,
            width_confidence: -1.0,
            layer_norm_eps: 1e-5,
            keypoint_detector: SuperPointConfig::default(),
            architectures: vec!["LightGlueForKeypointMatching".to_string()],
            model_type: "lightglue".to_string(),
        }
    }
}

impl LightGlueConfig {
    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.descriptor_dim / self.num_heads
    }

    /// Write `config.json` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join("config.json"), json)?;
        Ok(())
    }

    /// Load from a saved directory.
    pub fn from_pretrained(dir: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(dir.join("config.json"))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

fn linear(
    binder: &mut WeightBinder,
    name: &str,
    out_dim: usize,
    in_dim: usize,
) -> Result<Linear> {
    let weight = binder.take(&format!("{name}.weight"), &[out_dim, in_dim])?;
    let bias = binder.take(&format!("{name}.bias"), &[out_dim])?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Rotary position terms derived from keypoint coordinates.
struct PositionalEncoding {
    cos: Tensor,
    sin: Tensor,
}

/// Rotate half the head dimension by the positional terms.
fn apply_rotary(x: &Tensor, enc: &PositionalEncoding) -> Result<Tensor> {
    let dims = x.dims();
    let half = dims[3] / 2;
    let x1 = x.narrow(3, 0, half)?;
    let x2 = x.narrow(3, half, half)?;

    // [tokens, half] -> broadcast over batch and heads.
    let cos = enc.cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = enc.sin.unsqueeze(0)?.unsqueeze(0)?;
    let cos = cos.broadcast_as(&[dims[0], dims[1], dims[2], half])?;
    let sin = sin.broadcast_as(&[dims[0], dims[1], dims[2], half])?;

    let out1 = ((&x1 * &cos)? - (&x2 * &sin)?)?;
    let out2 = ((&x2 * &cos)? + (&x1 * &sin)?)?;
    Ok(Tensor::cat(&[out1, out2], 3)?)
}

/// Feed-forward block fusing features with an attention message.
///
/// Parameter names keep the original sequential indices (`ffn.0`, `ffn.1`,
/// `ffn.3`) so converted keys bind without a second rename.
#[derive(Debug, Clone)]
struct FeedForward {
    dense: Linear,
    norm: LayerNorm,
    output: Linear,
}

impl FeedForward {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &LightGlueConfig,
    ) -> Result<Self> {
        let dim = config.descriptor_dim;
        let dense = linear(binder, &format!("{prefix}.ffn.0"), 2 * dim, 2 * dim)?;
        let norm_weight = binder.take(&format!("{prefix}.ffn.1.weight"), &[2 * dim])?;
        let norm_bias = binder.take(&format!("{prefix}.ffn.1.bias"), &[2 * dim])?;
        let norm = LayerNorm::new(norm_weight, norm_bias, config.layer_norm_eps);
        let output = linear(binder, &format!("{prefix}.ffn.3"), dim, 2 * dim)?;
        Ok(Self {
            dense,
            norm,
            output,
        })
    }

    /// `x + ffn(cat(x, message))`.
    fn forward(&self, x: &Tensor, message: &Tensor) -> Result<Tensor> {
        let fused = Tensor::cat(&[x, message], D::Minus1)?;
        let hidden = self.dense.forward(&fused)?;
        let hidden = self.norm.forward(&hidden)?;
        let hidden = hidden.gelu_erf()?;
        Ok((x + self.output.forward(&hidden)?)?)
    }
}

fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, tokens, _) = x.dims3()?;
    Ok(x
        .contiguous()?
        .reshape((batch, tokens, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?)
}

fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch, heads, tokens, head_dim) = x.dims4()?;
    Ok(x
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, tokens, heads * head_dim))?)
}

fn attend(q: &Tensor, k: &Tensor, v: &Tensor, head_dim: usize) -> Result<(Tensor, Tensor)> {
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
    let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let out = weights.matmul(v)?;
    Ok((out, weights))
}

/// Self attention with rotary positional terms.
#[derive(Debug, Clone)]
struct SelfAttentionBlock {
    qkv_proj: Linear,
    output_projection: Linear,
    ffn: FeedForward,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttentionBlock {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &LightGlueConfig,
    ) -> Result<Self> {
        let dim = config.descriptor_dim;
        Ok(Self {
            qkv_proj: linear(binder, &format!("{prefix}.Wqkv"), 3 * dim, dim)?,
            output_projection: linear(binder, &format!("{prefix}.output_projection"), dim, dim)?,
            ffn: FeedForward::from_binder(binder, prefix, config)?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    fn forward(&self, x: &Tensor, enc: &PositionalEncoding) -> Result<(Tensor, Tensor)> {
        let (batch, tokens, dim) = x.dims3()?;
        let qkv = self.qkv_proj.forward(x)?;
        let qkv = qkv.reshape((batch, tokens, 3, dim))?;
        let q = qkv.narrow(2, 0, 1)?.squeeze(2)?;
        let k = qkv.narrow(2, 1, 1)?.squeeze(2)?;
        let v = qkv.narrow(2, 2, 1)?.squeeze(2)?;

        let q = split_heads(&q, self.num_heads, self.head_dim)?;
        let k = split_heads(&k, self.num_heads, self.head_dim)?;
        let v = split_heads(&v, self.num_heads, self.head_dim)?;

        let q = apply_rotary(&q, enc)?;
        let k = apply_rotary(&k, enc)?;

        let (message, weights) = attend(&q, &k, &v, self.head_dim)?;
        let message = self.output_projection.forward(&merge_heads(&message)?)?;
        let updated = self.ffn.forward(x, &message)?;
        Ok((updated, weights))
    }
}

/// Bidirectional cross attention with a shared query/key projection.
#[derive(Debug, Clone)]
struct CrossAttentionBlock {
    to_qk: Linear,
    to_v: Linear,
    to_out: Linear,
    ffn: FeedForward,
    num_heads: usize,
    head_dim: usize,
}

impl CrossAttentionBlock {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &LightGlueConfig,
    ) -> Result<Self> {
        let dim = config.descriptor_dim;
        Ok(Self {
            to_qk: linear(binder, &format!("{prefix}.to_qk"), dim, dim)?,
            to_v: linear(binder, &format!("{prefix}.to_v"), dim, dim)?,
            to_out: linear(binder, &format!("{prefix}.to_out"), dim, dim)?,
            ffn: FeedForward::from_binder(binder, prefix, config)?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Update both images' descriptors from each other.
    fn forward(&self, x0: &Tensor, x1: &Tensor) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let qk0 = split_heads(&self.to_qk.forward(x0)?, self.num_heads, self.head_dim)?;
        let qk1 = split_heads(&self.to_qk.forward(x1)?, self.num_heads, self.head_dim)?;
        let v0 = split_heads(&self.to_v.forward(x0)?, self.num_heads, self.head_dim)?;
        let v1 = split_heads(&self.to_v.forward(x1)?, self.num_heads, self.head_dim)?;

        let (message0, weights0) = attend(&qk0, &qk1, &v1, self.head_dim)?;
        let (message1, weights1) = attend(&qk1, &qk0, &v0, self.head_dim)?;

        let message0 = self.to_out.forward(&merge_heads(&message0)?)?;
        let message1 = self.to_out.forward(&merge_heads(&message1)?)?;

        let updated0 = self.ffn.forward(x0, &message0)?;
        let updated1 = self.ffn.forward(x1, &message1)?;
        Ok((updated0, updated1, weights0, weights1))
    }
}

/// One transformer layer: self attention per image, then cross attention.
#[derive(Debug, Clone)]
struct TransformerLayer {
    self_attention_block: SelfAttentionBlock,
    cross_attention_block: CrossAttentionBlock,
}

/// Matchability-weighted assignment head.
#[derive(Debug, Clone)]
struct MatchAssignment {
    matchability: Linear,
    final_projection: Linear,
    dim: usize,
}

impl MatchAssignment {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &LightGlueConfig,
    ) -> Result<Self> {
        let dim = config.descriptor_dim;
        Ok(Self {
            matchability: linear(binder, &format!("{prefix}.matchability"), 1, dim)?,
            final_projection: linear(binder, &format!("{prefix}.final_projection"), dim, dim)?,
            dim,
        })
    }

    /// Assignment probabilities `(tokens0, tokens1)`.
    fn forward(&self, desc0: &Tensor, desc1: &Tensor) -> Result<Tensor> {
        let scale = 1.0 / (self.dim as f64).powf(0.25);
        let proj0 = (self.final_projection.forward(desc0)? * scale)?;
        let proj1 = (self.final_projection.forward(desc1)? * scale)?;
        let similarity = proj0.matmul(&proj1.transpose(1, 2)?.contiguous()?)?;

        // Mutual softmax in log domain, then matchability gating.
        let log_assignment = (candle_nn::ops::log_softmax(&similarity, D::Minus1)?
            + candle_nn::ops::log_softmax(&similarity, 1)?)?;
        let probabilities = log_assignment.exp()?;

        let z0 = candle_nn::ops::sigmoid(&self.matchability.forward(desc0)?)?;
        let z1 = candle_nn::ops::sigmoid(&self.matchability.forward(desc1)?)?;
        let gated = probabilities
            .broadcast_mul(&z0)?
            .broadcast_mul(&z1.transpose(1, 2)?)?;
        Ok(gated.squeeze(0)?)
    }
}

/// Per-layer token confidence head for adaptive depth.
#[derive(Debug, Clone)]
struct TokenConfidence {
    token: Linear,
}

impl TokenConfidence {
    fn from_binder(binder: &mut WeightBinder, prefix: &str, dim: usize) -> Result<Self> {
        Ok(Self {
            token: linear(binder, &format!("{prefix}.token"), 1, dim)?,
        })
    }

    fn forward(&self, descriptors: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(&self.token.forward(descriptors)?)?)
    }
}

/// LightGlue keypoint matching model.
#[derive(Debug, Clone)]
pub struct LightGlueForKeypointMatching {
    config: LightGlueConfig,
    keypoint_detector: SuperPointForKeypointDetection,
    positional_projector: Linear,
    transformer_layers: Vec<TransformerLayer>,
    match_assignment_layers: Vec<MatchAssignment>,
    token_confidence: Vec<TokenConfidence>,
    state: StateDict,
    device: Device,
}

impl LightGlueForKeypointMatching {
    /// Build the model by binding a converted state dict.
    ///
    /// The load is lenient (the original checkpoint is merged with the
    /// detector's, and extras are dropped rather than rejected).
    pub fn from_state_dict(
        config: LightGlueConfig,
        state: StateDict,
        device: &Device,
    ) -> Result<Self> {
        let mut binder = WeightBinder::checkpoint(state, device).lenient();
        let mut model = Self::from_binder(config, &mut binder, device)?;
        model.state = binder.finish()?;
        Ok(model)
    }

    /// Build with synthesized weights (for testing).
    pub fn random(config: LightGlueConfig, device: &Device) -> Result<Self> {
        let mut binder = WeightBinder::random(device);
        let mut model = Self::from_binder(config, &mut binder, device)?;
        model.state = binder.finish()?;
        Ok(model)
    }

    /// Write `config.json` and `model.safetensors` into `dir`.
    ///
    /// Only tensors that actually bound are saved; extras a lenient load
    /// dropped never reach the artifacts.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        self.config.save_pretrained(dir)?;
        crate::checkpoint::save_safetensors(&self.state, &dir.join("model.safetensors"))
    }

    /// Reload a model saved with [`Self::save_pretrained`].
    pub fn from_pretrained(dir: &Path, device: &Device) -> Result<Self> {
        let config = LightGlueConfig::from_pretrained(dir)?;
        let state = crate::checkpoint::load_safetensors(&dir.join("model.safetensors"), device)?;
        Self::from_state_dict(config, state, device)
    }

    /// Walk the model schema, taking every parameter from `binder`.
    ///
    /// Callers are responsible for `binder.finish()`; prefer
    /// [`Self::from_state_dict`] unless the binder itself is under test.
    pub fn from_binder(
        config: LightGlueConfig,
        binder: &mut WeightBinder,
        device: &Device,
    ) -> Result<Self> {
        let keypoint_detector = SuperPointForKeypointDetection::from_binder(
            binder,
            "keypoint_detector",
            config.keypoint_detector.clone(),
            device,
        )?;

        // The projector feeds the rotary encoding: one angle per rotation
        // pair, so half the head dimension.
        let projector_weight = binder.take(
            "positional_encoder.projector.weight",
            &[config.head_dim() / 2, 2],
        )?;
        let positional_projector = Linear::new(projector_weight, None);

        let mut transformer_layers = Vec::with_capacity(config.num_layers);
        let mut match_assignment_layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            transformer_layers.push(TransformerLayer {
                self_attention_block: SelfAttentionBlock::from_binder(
                    binder,
                    &format!("transformer_layers.{i}.self_attention_block"),
                    &config,
                )?,
                cross_attention_block: CrossAttentionBlock::from_binder(
                    binder,
                    &format!("transformer_layers.{i}.cross_attention_block"),
                    &config,
                )?,
            });
            match_assignment_layers.push(MatchAssignment::from_binder(
                binder,
                &format!("match_assignment_layers.{i}"),
                &config,
            )?);
        }

        let mut token_confidence = Vec::with_capacity(config.num_layers.saturating_sub(1));
        for i in 0..config.num_layers.saturating_sub(1) {
            token_confidence.push(TokenConfidence::from_binder(
                binder,
                &format!("token_confidence.{i}"),
                config.descriptor_dim,
            )?);
        }

        Ok(Self {
            config,
            keypoint_detector,
            positional_projector,
            transformer_layers,
            match_assignment_layers,
            token_confidence,
            state: StateDict::new(),
            device: device.clone(),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &LightGlueConfig {
        &self.config
    }

    /// The embedded keypoint detector.
    pub fn keypoint_detector(&self) -> &SuperPointForKeypointDetection {
        &self.keypoint_detector
    }

    /// Match an image pair `(1, 2, channels, height, width)`.
    pub fn forward(
        &self,
        images: &Tensor,
        output_hidden_states: bool,
        output_attentions: bool,
    ) -> Result<KeypointMatchingOutput> {
        let dims = images.dims();
        if dims.len() != 5 || dims[0] != 1 || dims[1] != 2 {
            return Err(GraftError::Checkpoint(format!(
                "expected image pairs of shape (1, 2, c, h, w), got {dims:?}"
            )));
        }
        let (height, width) = (dims[3], dims[4]);
        let image0 = images.narrow(1, 0, 1)?.squeeze(1)?;
        let image1 = images.narrow(1, 1, 1)?.squeeze(1)?;

        let detections0 = self.keypoint_detector.forward(&image0)?;
        let detections1 = self.keypoint_detector.forward(&image1)?;
        let (count0, count1) = (detections0.len(), detections1.len());
        let padded = count0.max(count1);

        if count0 == 0 || count1 == 0 {
            return self.empty_output(&detections0, &detections1, padded);
        }

        let enc0 = self.encode_positions(&detections0.keypoints, height, width)?;
        let enc1 = self.encode_positions(&detections1.keypoints, height, width)?;

        let mut desc0 = detections0.descriptors.unsqueeze(0)?;
        let mut desc1 = detections1.descriptors.unsqueeze(0)?;

        let mut hidden_states = output_hidden_states.then(Vec::new);
        let mut attentions = output_attentions.then(Vec::new);
        for (i, layer) in self.transformer_layers.iter().enumerate() {
            let (d0, a0) = layer.self_attention_block.forward(&desc0, &enc0)?;
            let (d1, a1) = layer.self_attention_block.forward(&desc1, &enc1)?;
            let (d0, d1, a2, a3) = layer.cross_attention_block.forward(&d0, &d1)?;
            desc0 = d0;
            desc1 = d1;

            if let Some(states) = hidden_states.as_mut() {
                states.push(desc0.clone());
                states.push(desc1.clone());
            }
            if let Some(all) = attentions.as_mut() {
                all.extend([a0, a1, a2, a3]);
            }

            // Adaptive depth: stop once enough tokens are confidently final.
            if self.config.depth_confidence > 0.0 {
                if let Some(confidence) = self.token_confidence.get(i) {
                    let c0 = confidence.forward(&desc0)?;
                    let c1 = confidence.forward(&desc1)?;
                    let confident = Tensor::cat(&[c0.flatten_all()?, c1.flatten_all()?], 0)?
                        .ge(self.config.depth_confidence)?
                        .to_dtype(candle_core::DType::F32)?
                        .mean_all()?
                        .to_scalar::<f32>()?;
                    if f64::from(confident) >= self.config.depth_confidence {
                        break;
                    }
                }
            }
        }

        let assignment = self
            .match_assignment_layers
            .last()
            .ok_or_else(|| GraftError::Checkpoint("model has no assignment layers".into()))?
            .forward(&desc0, &desc1)?;

        self.extract_matches(
            &assignment,
            &detections0,
            &detections1,
            padded,
            hidden_states,
            attentions,
        )
    }

    /// Rotary terms from normalized keypoint coordinates.
    fn encode_positions(
        &self,
        keypoints: &[(f32, f32)],
        height: usize,
        width: usize,
    ) -> Result<PositionalEncoding> {
        let half_w = width as f32 / 2.0;
        let half_h = height as f32 / 2.0;
        let scale = half_w.max(half_h);

        let mut coords = Vec::with_capacity(keypoints.len() * 2);
        for &(x, y) in keypoints {
            coords.push((x - half_w) / scale);
            coords.push((y - half_h) / scale);
        }
        let coords = Tensor::from_vec(coords, (keypoints.len(), 2), &self.device)?;
        let angles = self.positional_projector.forward(&coords)?;
        Ok(PositionalEncoding {
            cos: angles.cos()?,
            sin: angles.sin()?,
        })
    }

    /// Mutual-argmax match extraction with threshold filtering, padded to a
    /// common keypoint count.
    fn extract_matches(
        &self,
        assignment: &Tensor,
        detections0: &crate::model::KeypointDetections,
        detections1: &crate::model::KeypointDetections,
        padded: usize,
        hidden_states: Option<Vec<Tensor>>,
        attentions: Option<Vec<Tensor>>,
    ) -> Result<KeypointMatchingOutput> {
        let best1: Vec<u32> = assignment.argmax(1)?.to_vec1()?;
        let best0: Vec<u32> = assignment.argmax(0)?.to_vec1()?;
        let best1_scores: Vec<f32> = assignment.max(1)?.to_vec1()?;
        let best0_scores: Vec<f32> = assignment.max(0)?.to_vec1()?;

        let threshold = self.config.filter_threshold as f32;
        let count0 = detections0.len();
        let count1 = detections1.len();

        let mut matches = vec![NO_MATCH; 2 * padded];
        let mut scores = vec![0.0f32; 2 * padded];
        for i in 0..count0 {
            let j = best1[i] as usize;
            if best0[j] as usize == i && best1_scores[i] > threshold {
                matches[i] = j as i64;
                scores[i] = best1_scores[i];
            }
        }
        for j in 0..count1 {
            let i = best0[j] as usize;
            if best1[i] as usize == j && best0_scores[j] > threshold {
                matches[padded + j] = i as i64;
                scores[padded + j] = best0_scores[j];
            }
        }

        let mut keypoints = vec![0.0f32; 2 * padded * 2];
        for (i, &(x, y)) in detections0.keypoints.iter().enumerate() {
            keypoints[i * 2] = x;
            keypoints[i * 2 + 1] = y;
        }
        for (j, &(x, y)) in detections1.keypoints.iter().enumerate() {
            keypoints[(padded + j) * 2] = x;
            keypoints[(padded + j) * 2 + 1] = y;
        }

        Ok(KeypointMatchingOutput {
            keypoints: Tensor::from_vec(keypoints, (1, 2, padded, 2), &self.device)?,
            matches: Tensor::from_vec(matches, (1, 2, padded), &self.device)?,
            matching_scores: Tensor::from_vec(scores, (1, 2, padded), &self.device)?,
            hidden_states,
            attentions,
        })
    }

    fn empty_output(
        &self,
        detections0: &crate::model::KeypointDetections,
        detections1: &crate::model::KeypointDetections,
        padded: usize,
    ) -> Result<KeypointMatchingOutput> {
        let mut keypoints = vec![0.0f32; 2 * padded * 2];
        for (i, &(x, y)) in detections0.keypoints.iter().enumerate() {
            keypoints[i * 2] = x;
            keypoints[i * 2 + 1] = y;
        }
        for (j, &(x, y)) in detections1.keypoints.iter().enumerate() {
            keypoints[(padded + j) * 2] = x;
            keypoints[(padded + j) * 2 + 1] = y;
        }
        Ok(KeypointMatchingOutput {
            keypoints: Tensor::from_vec(keypoints, (1, 2, padded, 2), &self.device)?,
            matches: Tensor::from_vec(vec![NO_MATCH; 2 * padded], (1, 2, padded), &self.device)?,
            matching_scores: Tensor::from_vec(
                vec![0.0f32; 2 * padded],
                (1, 2, padded),
                &self.device,
            )?,
            hidden_states: None,
            attentions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> LightGlueConfig {
        LightGlueConfig {
            descriptor_dim: 16,
            num_layers: 2,
            num_heads: 2,
            // Random assignments rarely clear 0.1; accept everything mutual.
            filter_threshold: 0.0,
            keypoint_detector: SuperPointConfig {
                encoder_hidden_sizes: vec![4, 4, 8, 8],
                decoder_hidden_size: 16,
                descriptor_decoder_dim: 16,
                max_keypoints: 8,
                keypoint_threshold: 0.0,
                nms_radius: 1,
                border_removal_distance: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn config_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = LightGlueConfig::default();
        config.save_pretrained(dir.path()).unwrap();

        let reloaded = LightGlueConfig::from_pretrained(dir.path()).unwrap();
        assert_eq!(reloaded.descriptor_dim, 256);
        assert_eq!(reloaded.num_layers, 9);
        assert_eq!(reloaded.num_heads, 4);
        assert_eq!(reloaded.keypoint_detector.keypoint_decoder_dim, 65);
        assert_eq!(
            reloaded.architectures,
            vec!["LightGlueForKeypointMatching".to_string()]
        );
    }

    #[test]
    fn random_model_binds_full_schema() {
        let device = Device::Cpu;
        let mut binder = WeightBinder::random(&device);
        LightGlueForKeypointMatching::from_binder(tiny_config(), &mut binder, &device).unwrap();

        let names = binder.bound_names();
        assert!(names.contains(&"positional_encoder.projector.weight".to_string()));
        assert!(names
            .contains(&"transformer_layers.0.self_attention_block.Wqkv.weight".to_string()));
        assert!(names
            .contains(&"transformer_layers.1.self_attention_block.ffn.0.weight".to_string()));
        assert!(names
            .contains(&"transformer_layers.1.self_attention_block.ffn.1.bias".to_string()));
        assert!(names
            .contains(&"transformer_layers.0.cross_attention_block.to_qk.weight".to_string()));
        assert!(names.contains(&"match_assignment_layers.1.matchability.bias".to_string()));
        assert!(names.contains(&"match_assignment_layers.0.final_projection.weight".to_string()));
        assert!(names.contains(&"token_confidence.0.token.weight".to_string()));
        assert!(names
            .contains(&"keypoint_detector.encoder.conv_blocks.0.conv_a.weight".to_string()));
        // One confidence head fewer than there are layers.
        assert!(!names.contains(&"token_confidence.1.token.weight".to_string()));
    }

    #[test]
    fn forward_pads_to_common_keypoint_count() {
        let device = Device::Cpu;
        let model = LightGlueForKeypointMatching::random(tiny_config(), &device).unwrap();

        let images = Tensor::rand(0.0f32, 1.0, &[1, 2, 1, 32, 32], &device).unwrap();
        let output = model.forward(&images, true, true).unwrap();

        let dims = output.matches.dims().to_vec();
        assert_eq!(&dims[..2], &[1, 2]);
        let padded = dims[2];
        assert!(padded > 0 && padded <= 8);
        assert_eq!(output.matching_scores.dims(), &[1, 2, padded]);
        assert_eq!(output.keypoints.dims(), &[1, 2, padded, 2]);

        // Match indices are either the sentinel or valid indices into the
        // other image's keypoint list.
        let values: Vec<i64> = output.matches.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| v == NO_MATCH || (v >= 0 && v < padded as i64)));

        // Introspection enabled: two hidden states and four attention maps
        // per executed layer.
        let states = output.hidden_states.as_ref().unwrap();
        assert_eq!(states.len(), 4);
        let attention = output.attentions.as_ref().unwrap();
        assert_eq!(attention.len(), 8);
    }

    #[test]
    fn unmatched_scores_are_zero() {
        let device = Device::Cpu;
        let model = LightGlueForKeypointMatching::random(tiny_config(), &device).unwrap();
        let images = Tensor::rand(0.0f32, 1.0, &[1, 2, 1, 32, 32], &device).unwrap();
        let output = model.forward(&images, false, false).unwrap();

        let matches: Vec<i64> = output.matches.flatten_all().unwrap().to_vec1().unwrap();
        let scores: Vec<f32> = output
            .matching_scores
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (m, s) in matches.iter().zip(&scores) {
            if *m == NO_MATCH {
                assert_eq!(*s, 0.0);
            }
        }
    }

    #[test]
    fn missing_weight_fails_binding() {
        let device = Device::Cpu;
        let result = LightGlueForKeypointMatching::from_state_dict(
            tiny_config(),
            StateDict::new(),
            &device,
        );
        assert!(matches!(result, Err(GraftError::MissingTensor(_))));
    }

    #[test]
    fn save_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let model = LightGlueForKeypointMatching::random(tiny_config(), &device).unwrap();
        model.save_pretrained(dir.path()).unwrap();

        let reloaded = LightGlueForKeypointMatching::from_pretrained(dir.path(), &device).unwrap();
        assert_eq!(reloaded.config().descriptor_dim, 16);
        assert_eq!(reloaded.config().keypoint_detector.descriptor_decoder_dim, 16);
    }
}
