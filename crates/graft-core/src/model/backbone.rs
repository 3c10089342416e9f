//! RepVGG convolutional backbone.
//!
//! Inference-form RepVGG: each block sums a 3x3 branch, a 1x1 branch and
//! (when shapes allow) a batch-norm identity branch, then applies ReLU.
//! Stages downsample with their first block and expose their outputs as a
//! multi-scale feature pyramid.

use crate::error::Result;
use crate::model::{BatchNorm2d, WeightBinder};
use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module};

/// One RepVGG block in inference form.
#[derive(Debug, Clone)]
pub struct RepVggBlock {
    conv1: Conv2d,
    norm1: BatchNorm2d,
    conv2: Conv2d,
    norm2: BatchNorm2d,
    identity: Option<BatchNorm2d>,
}

impl RepVggBlock {
    /// Bind `{prefix}.{conv1,conv2,identity}` for a block mapping
    /// `in_channels -> out_channels` at `stride`.
    pub fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        eps: f64,
    ) -> Result<Self> {
        let conv1_weight = binder.take(
            &format!("{prefix}.conv1.conv.weight"),
            &[out_channels, in_channels, 3, 3],
        )?;
        let conv1 = Conv2d::new(
            conv1_weight,
            None,
            Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            },
        );
        let norm1 =
            BatchNorm2d::from_binder(binder, &format!("{prefix}.conv1.norm"), out_channels, eps)?;

        let conv2_weight = binder.take(
            &format!("{prefix}.conv2.conv.weight"),
            &[out_channels, in_channels, 1, 1],
        )?;
        let conv2 = Conv2d::new(
            conv2_weight,
            None,
            Conv2dConfig {
                stride,
                ..Default::default()
            },
        );
        let norm2 =
            BatchNorm2d::from_binder(binder, &format!("{prefix}.conv2.norm"), out_channels, eps)?;

        // The identity branch only exists where it is shape-preserving.
        let identity = if in_channels == out_channels && stride == 1 {
            Some(BatchNorm2d::from_binder(
                binder,
                &format!("{prefix}.identity"),
                out_channels,
                eps,
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            norm1,
            conv2,
            norm2,
            identity,
        })
    }

    /// Forward over `(batch, in_channels, height, width)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dense = self.norm1.forward(&self.conv1.forward(x)?)?;
        let pointwise = self.norm2.forward(&self.conv2.forward(x)?)?;
        let mut sum = (dense + pointwise)?;
        if let Some(identity) = &self.identity {
            sum = (sum + identity.forward(x)?)?;
        }
        Ok(sum.relu()?)
    }
}

/// Staged RepVGG backbone producing a feature pyramid.
#[derive(Debug, Clone)]
pub struct RepVggBackbone {
    stages: Vec<Vec<RepVggBlock>>,
}

impl RepVggBackbone {
    /// Bind `{prefix}.stages.{s}.blocks.{b}` according to the stage layout.
    ///
    /// `dims`, `num_blocks` and `strides` must have equal length; block 0 of
    /// each stage carries the stage stride and channel change.
    pub fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        in_channels: usize,
        dims: &[usize],
        num_blocks: &[usize],
        strides: &[usize],
        eps: f64,
    ) -> Result<Self> {
        let mut stages = Vec::with_capacity(dims.len());
        let mut channels = in_channels;
        for (stage, ((&dim, &blocks), &stride)) in
            dims.iter().zip(num_blocks).zip(strides).enumerate()
        {
            let mut stage_blocks = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let block_prefix = format!("{prefix}.stages.{stage}.blocks.{block}");
                let (block_in, block_stride) = if block == 0 {
                    (channels, stride)
                } else {
                    (dim, 1)
                };
                stage_blocks.push(RepVggBlock::from_binder(
                    binder,
                    &block_prefix,
                    block_in,
                    dim,
                    block_stride,
                    eps,
                )?);
            }
            channels = dim;
            stages.push(stage_blocks);
        }
        Ok(Self { stages })
    }

    /// Run all stages, returning each stage's output feature map.
    pub fn forward(&self, x: &Tensor) -> Result<Vec<Tensor>> {
        let mut features = Vec::with_capacity(self.stages.len());
        let mut hidden = x.clone();
        for stage in &self.stages {
            for block in stage {
                hidden = block.forward(&hidden)?;
            }
            features.push(hidden.clone());
        }
        Ok(features)
    }

    /// Number of stages.
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }
}
