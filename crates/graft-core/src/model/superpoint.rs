//! SuperPoint keypoint detection.
//!
//! VGG-style encoder at 1/8 resolution, a 65-channel score head whose last
//! channel is the "no keypoint" dustbin, and a descriptor head sampled
//! bilinearly at detected keypoints. Used as the detection front-end of the
//! LightGlue matcher; its full weight set is merged into the converted
//! LightGlue state dict under the `keypoint_detector.` prefix.

use crate::error::{GraftError, Result};
use crate::model::WeightBinder;
use candle_core::{Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Module};
use serde::{Deserialize, Serialize};

/// Configuration for [`SuperPointForKeypointDetection`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperPointConfig {
    /// Input channels (grayscale).
    pub in_channels: usize,
    /// Channel widths of the four encoder blocks.
    pub encoder_hidden_sizes: Vec<usize>,
    /// Hidden width of both decoder heads.
    pub decoder_hidden_size: usize,
    /// Score-head channels (64 cells + dustbin).
    pub keypoint_decoder_dim: usize,
    /// Descriptor dimension.
    pub descriptor_decoder_dim: usize,
    /// Minimum keypoint score.
    pub keypoint_threshold: f64,
    /// Keep at most this many keypoints; 0 keeps all.
    pub max_keypoints: usize,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: usize,
    /// Pixels stripped from the image border.
    pub border_removal_distance: usize,
    /// Model family tag.
    pub model_type: String,
}

impl Default for SuperPointConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            encoder_hidden_sizes: vec![64, 64, 128, 128],
            decoder_hidden_size: 256,
            keypoint_decoder_dim: 65,
            descriptor_decoder_dim: 256,
            keypoint_threshold: 0.005,
            max_keypoints: 0,
            nms_radius: 4,
            border_removal_distance: 4,
            model_type: "superpoint".to_string(),
        }
    }
}

/// Keypoints detected in a single image.
#[derive(Debug, Clone)]
pub struct KeypointDetections {
    /// Pixel coordinates, `(x, y)` per keypoint.
    pub keypoints: Vec<(f32, f32)>,
    /// Detection score per keypoint.
    pub scores: Vec<f32>,
    /// L2-normalized descriptors, `(num_keypoints, descriptor_dim)`.
    pub descriptors: Tensor,
}

impl KeypointDetections {
    /// Number of detected keypoints.
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    /// Whether nothing was detected.
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

fn conv(
    binder: &mut WeightBinder,
    name: &str,
    out_channels: usize,
    in_channels: usize,
    kernel: usize,
    padding: usize,
) -> Result<Conv2d> {
    let weight = binder.take(
        &format!("{name}.weight"),
        &[out_channels, in_channels, kernel, kernel],
    )?;
    let bias = binder.take(&format!("{name}.bias"), &[out_channels])?;
    Ok(Conv2d::new(
        weight,
        Some(bias),
        Conv2dConfig {
            padding,
            ..Default::default()
        },
    ))
}

/// One encoder block: two 3x3 convolutions with ReLU.
#[derive(Debug, Clone)]
struct EncoderBlock {
    conv_a: Conv2d,
    conv_b: Conv2d,
}

impl EncoderBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv_a.forward(x)?.relu()?;
        Ok(self.conv_b.forward(&x)?.relu()?)
    }
}

/// SuperPoint keypoint detection model.
#[derive(Debug, Clone)]
pub struct SuperPointForKeypointDetection {
    config: SuperPointConfig,
    encoder: Vec<EncoderBlock>,
    conv_score_a: Conv2d,
    conv_score_b: Conv2d,
    conv_descriptor_a: Conv2d,
    conv_descriptor_b: Conv2d,
    device: Device,
}

impl SuperPointForKeypointDetection {
    /// Bind the detector under `prefix` (e.g. `keypoint_detector`).
    pub fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        config: SuperPointConfig,
        device: &Device,
    ) -> Result<Self> {
        let mut encoder = Vec::with_capacity(config.encoder_hidden_sizes.len());
        let mut channels = config.in_channels;
        for (i, &dim) in config.encoder_hidden_sizes.iter().enumerate() {
            let block = format!("{prefix}.encoder.conv_blocks.{i}");
            encoder.push(EncoderBlock {
                conv_a: conv(binder, &format!("{block}.conv_a"), dim, channels, 3, 1)?,
                conv_b: conv(binder, &format!("{block}.conv_b"), dim, dim, 3, 1)?,
            });
            channels = dim;
        }

        let hidden = config.decoder_hidden_size;
        let conv_score_a = conv(
            binder,
            &format!("{prefix}.keypoint_decoder.conv_score_a"),
            hidden,
            channels,
            3,
            1,
        )?;
        let conv_score_b = conv(
            binder,
            &format!("{prefix}.keypoint_decoder.conv_score_b"),
            config.keypoint_decoder_dim,
            hidden,
            1,
            0,
        )?;
        let conv_descriptor_a = conv(
            binder,
            &format!("{prefix}.descriptor_decoder.conv_descriptor_a"),
            hidden,
            channels,
            3,
            1,
        )?;
        let conv_descriptor_b = conv(
            binder,
            &format!("{prefix}.descriptor_decoder.conv_descriptor_b"),
            config.descriptor_decoder_dim,
            hidden,
            1,
            0,
        )?;

        Ok(Self {
            config,
            encoder,
            conv_score_a,
            conv_score_b,
            conv_descriptor_a,
            conv_descriptor_b,
            device: device.clone(),
        })
    }

    /// Build with synthesized weights (for testing).
    pub fn random(config: SuperPointConfig, device: &Device) -> Result<Self> {
        let mut binder = WeightBinder::random(device);
        Self::from_binder(&mut binder, "keypoint_detector", config, device)
    }

    /// Detector configuration.
    pub fn config(&self) -> &SuperPointConfig {
        &self.config
    }

    /// Detect keypoints in one grayscale image `(1, 1, height, width)`.
    pub fn forward(&self, image: &Tensor) -> Result<KeypointDetections> {
        let (_, _, height, width) = image.dims4()?;

        let mut hidden = image.clone();
        let last = self.encoder.len() - 1;
        for (i, block) in self.encoder.iter().enumerate() {
            hidden = block.forward(&hidden)?;
            if i < last {
                hidden = hidden.max_pool2d(2)?;
            }
        }

        let scores = self.score_map(&hidden, height, width)?;
        let keypoints = self.select_keypoints(&scores, height, width)?;

        let descriptor_map = self.conv_descriptor_a.forward(&hidden)?.relu()?;
        let descriptor_map = self.conv_descriptor_b.forward(&descriptor_map)?;
        let descriptors = self.sample_descriptors(&descriptor_map, &keypoints)?;

        let scores = keypoints.iter().map(|&(_, _, s)| s).collect();
        let keypoints = keypoints.into_iter().map(|(x, y, _)| (x, y)).collect();
        Ok(KeypointDetections {
            keypoints,
            scores,
            descriptors,
        })
    }

    /// Full-resolution score map from the 65-channel head.
    fn score_map(&self, encoded: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        let logits = self.conv_score_a.forward(encoded)?.relu()?;
        let logits = self.conv_score_b.forward(&logits)?;
        let probs = candle_nn::ops::softmax(&logits, 1)?;

        // Drop the dustbin channel, then unfold each remaining channel onto
        // its 8x8 cell.
        let cells = self.config.keypoint_decoder_dim - 1;
        let probs = probs.narrow(1, 0, cells)?.contiguous()?;
        let (batch, _, h8, w8) = probs.dims4()?;
        let side = (cells as f64).sqrt() as usize;
        let full = probs
            .reshape((batch, side, side, h8, w8))?
            .permute((0, 3, 1, 4, 2))?
            .contiguous()?
            .reshape((batch, h8 * side, w8 * side))?;
        // Encoder rounding can leave the map a cell short of the image.
        Ok(full
            .narrow(1, 0, (h8 * side).min(height))?
            .narrow(2, 0, (w8 * side).min(width))?
            .contiguous()?)
    }

    /// Threshold, NMS, border removal and top-k selection on the host.
    fn select_keypoints(
        &self,
        scores: &Tensor,
        height: usize,
        width: usize,
    ) -> Result<Vec<(f32, f32, f32)>> {
        let flat: Vec<f32> = scores.flatten_all()?.to_vec1()?;
        let (map_h, map_w) = (
            scores.dims().get(1).copied().unwrap_or(height),
            scores.dims().get(2).copied().unwrap_or(width),
        );

        let threshold = self.config.keypoint_threshold as f32;
        let radius = self.config.nms_radius as isize;
        let border = self.config.border_removal_distance;

        let mut selected = Vec::new();
        for y in border..map_h.saturating_sub(border) {
            for x in border..map_w.saturating_sub(border) {
                let score = flat[y * map_w + x];
                if score < threshold {
                    continue;
                }
                // Local maximum within the NMS radius.
                let mut is_max = true;
                'nms: for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let (ny, nx) = (y as isize + dy, x as isize + dx);
                        if ny < 0 || nx < 0 || ny >= map_h as isize || nx >= map_w as isize {
                            continue;
                        }
                        if flat[ny as usize * map_w + nx as usize] > score {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    selected.push((x as f32, y as f32, score));
                }
            }
        }

        selected.sort_by(|a, b| b.2.total_cmp(&a.2));
        if self.config.max_keypoints > 0 {
            selected.truncate(self.config.max_keypoints);
        }
        Ok(selected)
    }

    /// Bilinearly sample L2-normalized descriptors at keypoint locations.
    fn sample_descriptors(
        &self,
        descriptor_map: &Tensor,
        keypoints: &[(f32, f32, f32)],
    ) -> Result<Tensor> {
        let (_, channels, map_h, map_w) = descriptor_map.dims4()?;
        let data: Vec<f32> = descriptor_map.flatten_all()?.to_vec1()?;
        let at = |c: usize, y: usize, x: usize| data[c * map_h * map_w + y * map_w + x];

        // The descriptor grid sits at 1/8 resolution; sample at cell centers.
        let stride = 8.0f32;
        let mut out = Vec::with_capacity(keypoints.len() * channels);
        for &(x, y, _) in keypoints {
            let gx = ((x + 0.5) / stride - 0.5).clamp(0.0, (map_w - 1) as f32);
            let gy = ((y + 0.5) / stride - 0.5).clamp(0.0, (map_h - 1) as f32);
            let (x0, y0) = (gx.floor() as usize, gy.floor() as usize);
            let (x1, y1) = ((x0 + 1).min(map_w - 1), (y0 + 1).min(map_h - 1));
            let (fx, fy) = (gx - x0 as f32, gy - y0 as f32);

            let mut descriptor = Vec::with_capacity(channels);
            for c in 0..channels {
                let top = at(c, y0, x0) * (1.0 - fx) + at(c, y0, x1) * fx;
                let bottom = at(c, y1, x0) * (1.0 - fx) + at(c, y1, x1) * fx;
                descriptor.push(top * (1.0 - fy) + bottom * fy);
            }
            let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
            out.extend(descriptor.into_iter().map(|v| v / norm));
        }

        Ok(Tensor::from_vec(
            out,
            (keypoints.len(), channels),
            &self.device,
        )?)
    }
}

impl SuperPointConfig {
    /// Validate internal consistency (cells must form a square).
    pub fn validate(&self) -> Result<()> {
        let cells = self.keypoint_decoder_dim - 1;
        let side = (cells as f64).sqrt() as usize;
        if side * side != cells {
            return Err(GraftError::Checkpoint(format!(
                "keypoint_decoder_dim {} does not describe a square cell",
                self.keypoint_decoder_dim
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> SuperPointConfig {
        SuperPointConfig {
            encoder_hidden_sizes: vec![4, 4, 8, 8],
            decoder_hidden_size: 16,
            descriptor_decoder_dim: 16,
            max_keypoints: 32,
            // Random weights produce near-uniform softmax scores, so accept
            // everything and let NMS pick structure.
            keypoint_threshold: 0.0,
            nms_radius: 1,
            border_removal_distance: 0,
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        SuperPointConfig::default().validate().unwrap();
        assert_eq!(SuperPointConfig::default().keypoint_decoder_dim, 65);
    }

    #[test]
    fn binder_names_follow_schema() {
        let device = Device::Cpu;
        let mut binder = WeightBinder::random(&device);
        SuperPointForKeypointDetection::from_binder(
            &mut binder,
            "keypoint_detector",
            tiny_config(),
            &device,
        )
        .unwrap();

        let names = binder.bound_names();
        assert!(names.contains(&"keypoint_detector.encoder.conv_blocks.0.conv_a.weight".to_string()));
        assert!(names.contains(&"keypoint_detector.encoder.conv_blocks.3.conv_b.bias".to_string()));
        assert!(names
            .contains(&"keypoint_detector.keypoint_decoder.conv_score_b.weight".to_string()));
        assert!(names
            .contains(&"keypoint_detector.descriptor_decoder.conv_descriptor_a.bias".to_string()));
    }

    #[test]
    fn forward_detects_consistent_keypoints() {
        let device = Device::Cpu;
        let model = SuperPointForKeypointDetection::random(tiny_config(), &device).unwrap();

        let image = Tensor::rand(0.0f32, 1.0, &[1, 1, 32, 32], &device).unwrap();
        let detections = model.forward(&image).unwrap();

        assert!(!detections.is_empty());
        assert!(detections.len() <= 32);
        assert_eq!(detections.scores.len(), detections.len());
        assert_eq!(detections.descriptors.dims(), &[detections.len(), 16]);

        // Keypoints stay inside the image.
        for &(x, y) in &detections.keypoints {
            assert!(x >= 0.0 && x < 32.0);
            assert!(y >= 0.0 && y < 32.0);
        }
    }

    #[test]
    fn descriptors_are_normalized() {
        let device = Device::Cpu;
        let model = SuperPointForKeypointDetection::random(tiny_config(), &device).unwrap();
        let image = Tensor::rand(0.0f32, 1.0, &[1, 1, 32, 32], &device).unwrap();
        let detections = model.forward(&image).unwrap();

        let rows: Vec<Vec<f32>> = detections.descriptors.to_vec2().unwrap();
        for row in rows {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "descriptor norm {norm}");
        }
    }

    #[test]
    fn max_keypoints_caps_detections() {
        let device = Device::Cpu;
        let mut config = tiny_config();
        config.max_keypoints = 3;
        let model = SuperPointForKeypointDetection::random(config, &device).unwrap();
        let image = Tensor::rand(0.0f32, 1.0, &[1, 1, 32, 32], &device).unwrap();

        let detections = model.forward(&image).unwrap();
        assert!(detections.len() <= 3);
    }
}
