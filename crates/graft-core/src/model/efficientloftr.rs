//! EfficientLoFTR: detector-free keypoint matching.
//!
//! A RepVGG backbone produces a feature pyramid; the coarsest level runs
//! through paired self/cross aggregated-attention layers with 2-D rotary
//! position encoding; dual-softmax matching over coarse cells yields
//! mutual-nearest-neighbor matches which a fine refinement head then
//! adjusts to sub-cell positions.

use crate::error::{GraftError, Result};
use crate::model::{
    BatchNorm2d, KeypointMatchingOutput, RepVggBackbone, RotaryEmbedding2d, WeightBinder,
};
use crate::state_dict::StateDict;
use candle_core::{Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, Module};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Positional-encoding scheme descriptor, serialized with the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RopeScaling {
    /// Encoding family; this model uses `"2d"`.
    pub rope_type: String,
    /// Serialized sin+cos width (twice the rotated head dimension).
    pub dim: usize,
}

/// Configuration for [`EfficientLoftrForKeypointMatching`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EfficientLoftrConfig {
    /// Input channels (grayscale images).
    pub in_channels: usize,
    /// Backbone stage widths.
    pub stage_block_dims: Vec<usize>,
    /// Blocks per backbone stage.
    pub stage_num_blocks: Vec<usize>,
    /// Stride of each backbone stage's first block.
    pub stage_strides: Vec<usize>,
    /// Coarse feature dimension.
    pub hidden_size: usize,
    /// Number of paired self/cross attention layers.
    pub num_attention_layers: usize,
    /// Attention heads.
    pub num_attention_heads: usize,
    /// Kernel (= stride) of the depthwise query aggregation.
    pub q_aggregation_kernel_size: usize,
    /// Kernel (= stride) of the key/value max-pool aggregation.
    pub kv_aggregation_kernel_size: usize,
    /// Batch-norm epsilon.
    pub batch_norm_eps: f64,
    /// Layer-norm epsilon.
    pub layer_norm_eps: f64,
    /// Rotary base frequency.
    pub rope_theta: f64,
    /// Positional-encoding descriptor.
    pub rope_scaling: RopeScaling,
    /// Dual-softmax confidence threshold for coarse matches.
    pub coarse_matching_threshold: f64,
    /// Dual-softmax temperature.
    pub coarse_matching_temperature: f64,
    /// Cells stripped from the coarse border before matching.
    pub coarse_matching_border_removal: usize,
    /// Fine correlation window side length.
    pub fine_kernel_size: usize,
    /// Softmax temperature for the fine offset regression.
    pub fine_matching_regress_temperature: f64,
    /// Architecture tag written to `config.json`.
    pub architectures: Vec<String>,
    /// Model family tag.
    pub model_type: String,
}

impl Default for EfficientLoftrConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            stage_block_dims: vec![64, 64, 128, 256],
            stage_num_blocks: vec![1, 2, 4, 14],
            stage_strides: vec![2, 1, 2, 2],
            hidden_size: 256,
            num_attention_layers: 4,
            num_attention_heads: 8,
            q_aggregation_kernel_size: 4,
            kv_aggregation_kernel_size: 4,
            batch_norm_eps: 1e-5,
            layer_norm_eps: 1e-5,
            rope_theta: 10000.0,
            rope_scaling: RopeScaling {
                rope_type: "2d".to_string(),
                dim: 64,
            },
            coarse_matching_threshold: 0.2,
            coarse_matching_temperature: 0.1,
            coarse_matching_border_removal: 2,
            fine_kernel_size: 8,
            fine_matching_regress_temperature: 10.0,
            architectures: vec!["EfficientLoftrForKeypointMatching".to_string()],
            model_type: "efficientloftr".to_string(),
        }
    }
}

impl EfficientLoftrConfig {
    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Total backbone downsampling factor (the coarse cell size in pixels).
    pub fn coarse_stride(&self) -> usize {
        self.stage_strides.iter().product()
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

fn leaky_relu(x: &Tensor, slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&(x * slope)?)?)
}

fn linear(binder: &mut WeightBinder, name: &str, out_dim: usize, in_dim: usize) -> Result<Linear> {
    let weight = binder.take(&format!("{name}.weight"), &[out_dim, in_dim])?;
    Ok(Linear::new(weight, None))
}

fn layer_norm(binder: &mut WeightBinder, name: &str, dim: usize, eps: f64) -> Result<LayerNorm> {
    let weight = binder.take(&format!("{name}.weight"), &[dim])?;
    let bias = binder.take(&format!("{name}.bias"), &[dim])?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// Depthwise query aggregation + normalization.
#[derive(Debug, Clone)]
struct Aggregation {
    q_aggregation: Conv2d,
    norm: LayerNorm,
    kernel: usize,
}

impl Aggregation {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        let dim = config.hidden_size;
        let kernel = config.q_aggregation_kernel_size;
        let weight = binder.take(
            &format!("{prefix}.q_aggregation.weight"),
            &[dim, 1, kernel, kernel],
        )?;
        let q_aggregation = Conv2d::new(
            weight,
            None,
            Conv2dConfig {
                stride: kernel,
                groups: dim,
                ..Default::default()
            },
        );
        let norm = layer_norm(binder, &format!("{prefix}.norm"), dim, config.layer_norm_eps)?;
        Ok(Self {
            q_aggregation,
            norm,
            kernel,
        })
    }

    /// Aggregate a feature map into query tokens `(batch, tokens, dim)`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let aggregated = self.q_aggregation.forward(x)?;
        let tokens = map_to_tokens(&aggregated)?;
        Ok(self.norm.forward(&tokens)?)
    }
}

/// Multi-head attention over aggregated tokens.
#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            q_proj: linear(binder, &format!("{prefix}.q_proj"), dim, dim)?,
            k_proj: linear(binder, &format!("{prefix}.k_proj"), dim, dim)?,
            v_proj: linear(binder, &format!("{prefix}.v_proj"), dim, dim)?,
            o_proj: linear(binder, &format!("{prefix}.o_proj"), dim, dim)?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, tokens, _) = x.dims3()?;
        Ok(x
            .reshape((batch, tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Attend query tokens over key/value tokens.
    ///
    /// Returns `(message, attention_weights)` with message shaped like the
    /// query tokens.
    fn forward(
        &self,
        q_tokens: &Tensor,
        kv_tokens: &Tensor,
        rope: &RotaryEmbedding2d,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, tokens, _) = q_tokens.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(q_tokens)?)?;
        let k = self.split_heads(&self.k_proj.forward(kv_tokens)?)?;
        let v = self.split_heads(&self.v_proj.forward(kv_tokens)?)?;

        let (q, k) = rope.apply(&q, &k)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let message = weights.matmul(&v)?;

        let message = message
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, tokens, self.num_heads * self.head_dim))?;
        let message = self.o_proj.forward(&message)?;
        Ok((message, weights))
    }
}

/// Gated fusion of full-resolution features with the attention message.
#[derive(Debug, Clone)]
struct Mlp {
    fc1: Linear,
    layer_norm: LayerNorm,
    fc2: Linear,
}

impl Mlp {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        let dim = config.hidden_size;
        Ok(Self {
            fc1: linear(binder, &format!("{prefix}.fc1"), 2 * dim, 2 * dim)?,
            layer_norm: layer_norm(
                binder,
                &format!("{prefix}.layer_norm"),
                2 * dim,
                config.layer_norm_eps,
            )?,
            fc2: linear(binder, &format!("{prefix}.fc2"), dim, 2 * dim)?,
        })
    }

    /// `(batch, tokens, 2*dim)` -> `(batch, tokens, dim)`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?;
        let hidden = self.layer_norm.forward(&hidden)?;
        let hidden = leaky_relu(&hidden, 0.01)?;
        Ok(self.fc2.forward(&hidden)?)
    }
}

/// One aggregated attention block (used for both self and cross attention).
#[derive(Debug, Clone)]
struct AggregatedAttention {
    aggregation: Aggregation,
    attention: Attention,
    mlp: Mlp,
    kv_kernel: usize,
}

impl AggregatedAttention {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        Ok(Self {
            aggregation: Aggregation::from_binder(
                binder,
                &format!("{prefix}.aggregation"),
                config,
            )?,
            attention: Attention::from_binder(binder, &format!("{prefix}.attention"), config)?,
            mlp: Mlp::from_binder(binder, &format!("{prefix}.mlp"), config)?,
            kv_kernel: config.kv_aggregation_kernel_size,
        })
    }

    /// Update `x` with a message attended from `source`.
    ///
    /// Self attention passes the same map for both; cross attention passes
    /// the other image's features as `source`.
    fn forward(
        &self,
        x: &Tensor,
        source: &Tensor,
        rope: &RotaryEmbedding2d,
    ) -> Result<(Tensor, Tensor)> {
        let (_, _, height, width) = x.dims4()?;

        let q_tokens = self.aggregation.forward(x)?;
        let kv_map = source.max_pool2d(self.kv_kernel)?;
        let kv_tokens = map_to_tokens(&kv_map)?;

        let (message, weights) = self.attention.forward(&q_tokens, &kv_tokens, rope)?;

        // Message lives on the aggregated grid; bring it back to full
        // resolution before fusing.
        let agg = self.aggregation.kernel;
        let message = tokens_to_map(&message, height / agg, width / agg)?;
        let message = message.upsample_nearest2d(height, width)?;

        let x_tokens = map_to_tokens(x)?;
        let message_tokens = map_to_tokens(&message)?;
        let fused = Tensor::cat(&[&x_tokens, &message_tokens], D::Minus1)?;
        let update = self.mlp.forward(&fused)?;
        let update = tokens_to_map(&update, height, width)?;

        Ok(((x + update)?, weights))
    }
}

/// Paired self/cross attention layer.
#[derive(Debug, Clone)]
struct LocalFeatureTransformerLayer {
    self_attention: AggregatedAttention,
    cross_attention: AggregatedAttention,
}

impl LocalFeatureTransformerLayer {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        Ok(Self {
            self_attention: AggregatedAttention::from_binder(
                binder,
                &format!("{prefix}.self_attention"),
                config,
            )?,
            cross_attention: AggregatedAttention::from_binder(
                binder,
                &format!("{prefix}.cross_attention"),
                config,
            )?,
        })
    }
}

/// FPN-style fusion block producing the next finer feature level.
#[derive(Debug, Clone)]
struct RefinementBlock {
    out_conv1: Conv2d,
    out_conv2: Conv2d,
    batch_norm: BatchNorm2d,
    out_conv3: Conv2d,
}

impl RefinementBlock {
    fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        lateral_dim: usize,
        dim: usize,
        out_dim: usize,
        eps: f64,
    ) -> Result<Self> {
        let w1 = binder.take(&format!("{prefix}.out_conv1.weight"), &[dim, lateral_dim, 1, 1])?;
        let w2 = binder.take(&format!("{prefix}.out_conv2.weight"), &[dim, dim, 3, 3])?;
        let w3 = binder.take(&format!("{prefix}.out_conv3.weight"), &[out_dim, dim, 3, 3])?;
        Ok(Self {
            out_conv1: Conv2d::new(w1, None, Conv2dConfig::default()),
            out_conv2: Conv2d::new(
                w2,
                None,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
            ),
            batch_norm: BatchNorm2d::from_binder(
                binder,
                &format!("{prefix}.batch_norm"),
                dim,
                eps,
            )?,
            out_conv3: Conv2d::new(
                w3,
                None,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
            ),
        })
    }

    /// Fuse the upsampled coarser map with the lateral feature map.
    fn forward(&self, top_down: &Tensor, lateral: &Tensor) -> Result<Tensor> {
        let lateral = self.out_conv1.forward(lateral)?;
        let fused = (lateral + top_down)?;
        let fused = self.out_conv2.forward(&fused)?;
        let fused = leaky_relu(&self.batch_norm.forward(&fused)?, 0.01)?;
        Ok(self.out_conv3.forward(&fused)?)
    }
}

/// Fine feature head: projects coarse features and fuses them down the
/// pyramid to the fine matching resolution.
#[derive(Debug, Clone)]
struct RefinementLayer {
    out_conv: Conv2d,
    out_conv_layers: Vec<RefinementBlock>,
}

impl RefinementLayer {
    fn from_binder(
        binder: &mut WeightBinder,
        config: &EfficientLoftrConfig,
    ) -> Result<Self> {
        let dims = &config.stage_block_dims;
        let coarse = *dims.last().ok_or_else(|| {
            GraftError::Checkpoint("backbone needs at least one stage".to_string())
        })?;
        let w = binder.take("refinement_layer.out_conv.weight", &[coarse, coarse, 1, 1])?;
        let out_conv = Conv2d::new(w, None, Conv2dConfig::default());

        // Walk the pyramid from the coarse level down: 256@1/8 -> 128@1/4 -> 64@1/2.
        let mid = dims[dims.len() - 2];
        let fine = dims[dims.len() - 3];
        let out_conv_layers = vec![
            RefinementBlock::from_binder(
                binder,
                "refinement_layer.out_conv_layers.0",
                mid,
                coarse,
                mid,
                config.batch_norm_eps,
            )?,
            RefinementBlock::from_binder(
                binder,
                "refinement_layer.out_conv_layers.1",
                fine,
                mid,
                fine,
                config.batch_norm_eps,
            )?,
        ];
        Ok(Self {
            out_conv,
            out_conv_layers,
        })
    }

    /// Produce fine features from the transformed coarse map and the
    /// backbone's intermediate levels.
    fn forward(&self, coarse: &Tensor, mid: &Tensor, fine: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = coarse.dims4()?;
        let top = self.out_conv.forward(coarse)?;
        let top = top.upsample_nearest2d(h * 2, w * 2)?;
        let mid = self.out_conv_layers[0].forward(&top, mid)?;
        let mid = mid.upsample_nearest2d(h * 4, w * 4)?;
        self.out_conv_layers[1].forward(&mid, fine)
    }
}

/// A single coarse-level match between the two images.
#[derive(Debug, Clone, Copy)]
struct CoarseMatch {
    cell0: usize,
    cell1: usize,
    score: f32,
}

/// EfficientLoFTR keypoint matching model.
#[derive(Debug, Clone)]
pub struct EfficientLoftrForKeypointMatching {
    config: EfficientLoftrConfig,
    backbone: RepVggBackbone,
    layers: Vec<LocalFeatureTransformerLayer>,
    refinement_layer: RefinementLayer,
    state: StateDict,
    device: Device,
}

impl EfficientLoftrForKeypointMatching {
    /// Build the model by binding a converted state dict, strictly.
    pub fn from_state_dict(
        config: EfficientLoftrConfig,
        state: StateDict,
        device: &Device,
    ) -> Result<Self> {
        let mut binder = WeightBinder::checkpoint(state, device);
        let mut model = Self::from_binder(config, &mut binder, device)?;
        model.state = binder.finish()?;
        Ok(model)
    }

    /// Build with synthesized weights (for testing).
    pub fn random(config: EfficientLoftrConfig, device: &Device) -> Result<Self> {
        let mut binder = WeightBinder::random(device);
        let mut model = Self::from_binder(config, &mut binder, device)?;
        model.state = binder.finish()?;
        Ok(model)
    }

    /// Write `config.json` and `model.safetensors` into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        self.config.save_pretrained(dir)?;
        crate::checkpoint::save_safetensors(&self.state, &dir.join("model.safetensors"))
    }

    /// Reload a model saved with [`Self::save_pretrained`].
    pub fn from_pretrained(dir: &Path, device: &Device) -> Result<Self> {
        let config = EfficientLoftrConfig::from_pretrained(dir)?;
        let state = crate::checkpoint::load_safetensors(&dir.join("model.safetensors"), device)?;
        Self::from_state_dict(config, state, device)
    }

    /// Walk the model schema, taking every parameter from `binder`.
    ///
    /// Callers are responsible for `binder.finish()`; prefer
    /// [`Self::from_state_dict`] unless the binder itself is under test.
    pub fn from_binder(
        config: EfficientLoftrConfig,
        binder: &mut WeightBinder,
        device: &Device,
    ) -> Result<Self> {
        let backbone = RepVggBackbone::from_binder(
            binder,
            "model.backbone",
            config.in_channels,
            &config.stage_block_dims,
            &config.stage_num_blocks,
            &config.stage_strides,
            config.batch_norm_eps,
        )?;

        let mut layers = Vec::with_capacity(config.num_attention_layers);
        for i in 0..config.num_attention_layers {
            layers.push(LocalFeatureTransformerLayer::from_binder(
                binder,
                &format!("model.local_feature_transformer.layers.{i}"),
                &config,
            )?);
        }

        let refinement_layer = RefinementLayer::from_binder(binder, &config)?;

        Ok(Self {
            config,
            backbone,
            layers,
            refinement_layer,
            state: StateDict::new(),
            device: device.clone(),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &EfficientLoftrConfig {
        &self.config
    }

    /// Match an image pair.
    ///
    /// `images` is `(batch, 2, channels, height, width)`; batch size must be
    /// one. Height and width must be divisible by the coarse cell size times
    /// the aggregation kernel.
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
        let image0 = images.narrow(1, 0, 1)?.squeeze(1)?;
        let image1 = images.narrow(1, 1, 1)?.squeeze(1)?;

        let pyramid0 = self.backbone.forward(&image0)?;
        let pyramid1 = self.backbone.forward(&image1)?;
        let n = pyramid0.len();
        let (mut coarse0, mut coarse1) = (pyramid0[n - 1].clone(), pyramid1[n - 1].clone());

        let (_, _, hc, wc) = coarse0.dims4()?;
        let agg = self.config.q_aggregation_kernel_size;
        let rope = RotaryEmbedding2d::new(
            self.config.head_dim(),
            hc / agg,
            wc / agg,
            self.config.rope_theta,
            &self.device,
        )?;

        let mut hidden_states = output_hidden_states.then(Vec::new);
        let mut attentions = output_attentions.then(Vec::new);
        for layer in &self.layers {
            let (f0, a0) = layer.self_attention.forward(&coarse0, &coarse0, &rope)?;
            let (f1, a1) = layer.self_attention.forward(&coarse1, &coarse1, &rope)?;
            let (f0, a2) = layer.cross_attention.forward(&f0, &f1, &rope)?;
            let (f1, a3) = layer.cross_attention.forward(&f1, &f0, &rope)?;
            coarse0 = f0;
            coarse1 = f1;
            if let Some(states) = hidden_states.as_mut() {
                states.push(coarse0.clone());
                states.push(coarse1.clone());
            }
            if let Some(all) = attentions.as_mut() {
                all.extend([a0, a1, a2, a3]);
            }
        }

        let matches = self.coarse_matching(&coarse0, &coarse1, hc, wc)?;

        let fine0 =
            self.refinement_layer
                .forward(&coarse0, &pyramid0[n - 2], &pyramid0[n - 3])?;
        let fine1 =
            self.refinement_layer
                .forward(&coarse1, &pyramid1[n - 2], &pyramid1[n - 3])?;

        self.assemble_output(&matches, (hc, wc), &fine0, &fine1, hidden_states, attentions)
    }

    /// Dual-softmax matching over coarse cells with mutual-nearest-neighbor
    /// filtering, confidence thresholding and border removal.
    fn coarse_matching(
        &self,
        feat0: &Tensor,
        feat1: &Tensor,
        hc: usize,
        wc: usize,
    ) -> Result<Vec<CoarseMatch>> {
        let dim = self.config.hidden_size as f64;
        let tokens0 = (map_to_tokens(feat0)? / dim.sqrt())?;
        let tokens1 = (map_to_tokens(feat1)? / dim.sqrt())?;

        let similarity = tokens0.matmul(&tokens1.transpose(1, 2)?.contiguous()?)?;
        let similarity = (similarity / self.config.coarse_matching_temperature)?;
        let confidence = (candle_nn::ops::softmax(&similarity, 1)?
            * candle_nn::ops::softmax(&similarity, 2)?)?;

        let confidence = confidence.squeeze(0)?;
        let best1: Vec<u32> = confidence.argmax(1)?.to_vec1()?;
        let best0: Vec<u32> = confidence.argmax(0)?.to_vec1()?;
        let best1_scores: Vec<f32> = confidence.max(1)?.to_vec1()?;

        let border = self.config.coarse_matching_border_removal;
        let inside = |cell: usize| {
            let (y, x) = (cell / wc, cell % wc);
            y >= border && y < hc - border && x >= border && x < wc - border
        };

        let threshold = self.config.coarse_matching_threshold as f32;
        let mut matches = Vec::new();
        for (cell0, (&cell1, &score)) in best1.iter().zip(&best1_scores).enumerate() {
            let cell1 = cell1 as usize;
            let mutual = best0[cell1] as usize == cell0;
            if mutual && score > threshold && inside(cell0) && inside(cell1) {
                matches.push(CoarseMatch {
                    cell0,
                    cell1,
                    score,
                });
            }
        }
        Ok(matches)
    }

    /// Refine the second image's keypoints and pack the output tensors.
    fn assemble_output(
        &self,
        matches: &[CoarseMatch],
        coarse_grid: (usize, usize),
        fine0: &Tensor,
        fine1: &Tensor,
        hidden_states: Option<Vec<Tensor>>,
        attentions: Option<Vec<Tensor>>,
    ) -> Result<KeypointMatchingOutput> {
        let (_, wc) = coarse_grid;
        let stride = self.config.coarse_stride() as f32;
        let half_cell = stride / 2.0;

        let fine = FineGrid::new(fine0, fine1)?;
        // Pixels per fine cell, from the actual map resolution.
        let fine_stride = (coarse_grid.0 * self.config.coarse_stride()) as f32 / fine.height as f32;

        let count = matches.len();
        let mut keypoints = Vec::with_capacity(count * 4);
        let mut scores = Vec::with_capacity(count);
        // Coordinates of image 0 first, then image 1 (refined).
        let mut keypoints1 = Vec::with_capacity(count * 2);
        for m in matches {
            let (y0, x0) = (m.cell0 / wc, m.cell0 % wc);
            let (y1, x1) = (m.cell1 / wc, m.cell1 % wc);
            let kp0 = (
                x0 as f32 * stride + half_cell,
                y0 as f32 * stride + half_cell,
            );
            let kp1 = (
                x1 as f32 * stride + half_cell,
                y1 as f32 * stride + half_cell,
            );
            let (dx, dy) = fine.refine_offset(
                kp0,
                kp1,
                fine_stride,
                self.config.fine_kernel_size,
                self.config.fine_matching_regress_temperature as f32,
            );
            keypoints.extend([kp0.0, kp0.1]);
            keypoints1.extend([kp1.0 + dx * fine_stride, kp1.1 + dy * fine_stride]);
            scores.push(m.score);
        }
        keypoints.extend(keypoints1);

        // Matched pairs are index-aligned, so both match rows are 0..count.
        let indices: Vec<i64> = (0..count as i64).chain(0..count as i64).collect();
        let keypoints = Tensor::from_vec(keypoints, (1, 2, count, 2), &self.device)?;
        let match_indices = Tensor::from_vec(indices, (1, 2, count), &self.device)?;
        let scores_both: Vec<f32> = scores.iter().chain(scores.iter()).copied().collect();
        let matching_scores = Tensor::from_vec(scores_both, (1, 2, count), &self.device)?;

        Ok(KeypointMatchingOutput {
            keypoints,
            matches: match_indices,
            matching_scores,
            hidden_states,
            attentions,
        })
    }
}

/// Fine feature maps pulled to host memory for window correlation.
struct FineGrid {
    data0: Vec<f32>,
    data1: Vec<f32>,
    height: usize,
    width: usize,
    channels: usize,
}

impl FineGrid {
    fn new(fine0: &Tensor, fine1: &Tensor) -> Result<Self> {
        let (_, channels, height, width) = fine0.dims4()?;
        let data0 = fine0.flatten_all()?.to_vec1()?;
        let data1 = fine1.flatten_all()?.to_vec1()?;
        Ok(Self {
            data0,
            data1,
            height,
            width,
            channels,
        })
    }

    fn descriptor(data: &[f32], channels: usize, height: usize, width: usize, y: usize, x: usize) -> Vec<f32> {
        (0..channels)
            .map(|c| data[c * height * width + y * width + x])
            .collect()
    }

    /// Correlate the image-0 descriptor at `kp0` against a window around
    /// `kp1` in image 1, returning the expected sub-window offset in fine
    /// cells.
    fn refine_offset(
        &self,
        kp0: (f32, f32),
        kp1: (f32, f32),
        fine_stride: f32,
        window: usize,
        temperature: f32,
    ) -> (f32, f32) {
        let clamp = |v: f32, max: usize| (v.max(0.0) as usize).min(max - 1);
        let (x0, y0) = (
            clamp(kp0.0 / fine_stride, self.width),
            clamp(kp0.1 / fine_stride, self.height),
        );
        let (x1, y1) = (
            clamp(kp1.0 / fine_stride, self.width),
            clamp(kp1.1 / fine_stride, self.height),
        );

        let anchor = Self::descriptor(&self.data0, self.channels, self.height, self.width, y0, x0);

        let half = (window / 2) as isize;
        let mut logits = Vec::with_capacity(window * window);
        let mut offsets = Vec::with_capacity(window * window);
        for dy in -half..half {
            for dx in -half..half {
                let yy = y1 as isize + dy;
                let xx = x1 as isize + dx;
                if yy < 0 || xx < 0 || yy >= self.height as isize || xx >= self.width as isize {
                    continue;
                }
                let cand = Self::descriptor(
                    &self.data1,
                    self.channels,
                    self.height,
                    self.width,
                    yy as usize,
                    xx as usize,
                );
                let dot: f32 = anchor.iter().zip(&cand).map(|(a, b)| a * b).sum();
                logits.push(dot * temperature);
                offsets.push((dx as f32, dy as f32));
            }
        }
        if logits.is_empty() {
            return (0.0, 0.0);
        }

        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let total: f32 = exp.iter().sum();
        let mut dx = 0.0;
        let mut dy = 0.0;
        for (w, (ox, oy)) in exp.iter().zip(&offsets) {
            dx += w / total * ox;
            dy += w / total * oy;
        }
        (dx, dy)
    }
}

/// Flatten `(batch, channels, h, w)` into `(batch, h*w, channels)` tokens.
fn map_to_tokens(x: &Tensor) -> Result<Tensor> {
    Ok(x.flatten_from(2)?.transpose(1, 2)?.contiguous()?)
}

/// Reshape `(batch, tokens, channels)` tokens back into a map.
fn tokens_to_map(x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (batch, _, channels) = x.dims3()?;
    Ok(x
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, channels, height, width))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shrunken configuration so forward passes stay fast on CPU.
    fn tiny_config() -> EfficientLoftrConfig {
        EfficientLoftrConfig {
            stage_block_dims: vec![8, 8, 16, 32],
            stage_num_blocks: vec![1, 1, 1, 1],
            hidden_size: 32,
            num_attention_layers: 1,
            num_attention_heads: 4,
            // Accept everything so random weights still produce matches.
            coarse_matching_threshold: 0.0,
            coarse_matching_border_removal: 0,
            fine_kernel_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn config_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = EfficientLoftrConfig::default();
        config.save_pretrained(dir.path()).unwrap();

        let reloaded = EfficientLoftrConfig::from_pretrained(dir.path()).unwrap();
        assert_eq!(reloaded.hidden_size, 256);
        assert_eq!(reloaded.stage_num_blocks, vec![1, 2, 4, 14]);
        assert_eq!(reloaded.rope_scaling.rope_type, "2d");
        assert_eq!(reloaded.rope_scaling.dim, 64);
        assert_eq!(
            reloaded.architectures,
            vec!["EfficientLoftrForKeypointMatching".to_string()]
        );
    }

    #[test]
    fn default_config_is_self_consistent() {
        let config = EfficientLoftrConfig::default();
        assert_eq!(config.head_dim(), 32);
        assert_eq!(config.coarse_stride(), 8);
        assert_eq!(
            config.stage_block_dims.len(),
            config.stage_num_blocks.len()
        );
    }

    #[test]
    fn random_model_binds_full_schema() {
        let device = Device::Cpu;
        let mut binder = WeightBinder::random(&device);
        let config = tiny_config();
        EfficientLoftrForKeypointMatching::from_binder(config, &mut binder, &device).unwrap();

        let names = binder.bound_names();
        assert!(names.contains(&"model.backbone.stages.0.blocks.0.conv1.conv.weight".to_string()));
        assert!(names.contains(
            &"model.local_feature_transformer.layers.0.self_attention.attention.q_proj.weight"
                .to_string()
        ));
        assert!(names.contains(
            &"model.local_feature_transformer.layers.0.cross_attention.mlp.layer_norm.bias"
                .to_string()
        ));
        assert!(names.contains(&"refinement_layer.out_conv.weight".to_string()));
        assert!(names.contains(&"refinement_layer.out_conv_layers.1.batch_norm.weight".to_string()));
    }

    #[test]
    fn missing_weight_fails_binding() {
        let device = Device::Cpu;
        let state = StateDict::new();
        let result = EfficientLoftrForKeypointMatching::from_state_dict(
            tiny_config(),
            state,
            &device,
        );
        assert!(matches!(result, Err(GraftError::MissingTensor(_))));
    }

    #[test]
    fn forward_produces_pairwise_output() {
        let device = Device::Cpu;
        let model = EfficientLoftrForKeypointMatching::random(tiny_config(), &device).unwrap();

        // 64x64 inputs: coarse grid 8x8, aggregated grid 2x2.
        let images = Tensor::rand(0.0f32, 1.0, &[1, 2, 1, 64, 64], &device).unwrap();
        let output = model.forward(&images, true, true).unwrap();

        let dims = output.matches.dims().to_vec();
        assert_eq!(dims[0], 1);
        assert_eq!(dims[1], 2);
        let count = dims[2];
        assert!(count > 0, "threshold 0 must admit at least one mutual match");
        assert_eq!(output.matching_scores.dims(), &[1, 2, count]);
        assert_eq!(output.keypoints.dims(), &[1, 2, count, 2]);

        // With index-aligned pairs every entry is a valid match.
        let row: Vec<i64> = output
            .matches
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(row.iter().all(|&v| v >= 0));

        // Introspection was requested: one entry pair per layer, four
        // attention maps per layer.
        assert_eq!(output.hidden_states.as_ref().unwrap().len(), 2);
        assert_eq!(output.attentions.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn save_reload_roundtrip_binds_strictly() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let model = EfficientLoftrForKeypointMatching::random(tiny_config(), &device).unwrap();
        model.save_pretrained(dir.path()).unwrap();

        assert!(dir.path().join("config.json").is_file());
        assert!(dir.path().join("model.safetensors").is_file());

        // The saved artifacts cover exactly the schema, so the strict
        // reload must succeed.
        let reloaded =
            EfficientLoftrForKeypointMatching::from_pretrained(dir.path(), &device).unwrap();
        assert_eq!(reloaded.config().hidden_size, 32);
    }

    #[test]
    fn forward_rejects_unbatched_input() {
        let device = Device::Cpu;
        let model = EfficientLoftrForKeypointMatching::random(tiny_config(), &device).unwrap();
        let images = Tensor::rand(0.0f32, 1.0, &[1, 1, 64, 64], &device).unwrap();
        assert!(model.forward(&images, false, false).is_err());
    }
}
