//! Model assembly and inference.
//!
//! Provides the three model families involved in conversion:
//! - EfficientLoFTR (detector-free keypoint matching)
//! - SuperPoint (keypoint detection)
//! - LightGlue (keypoint matching over SuperPoint detections)
//!
//! Models are built by binding named tensors from a converted state dict;
//! see [`WeightBinder`].

mod backbone;
mod binder;
mod efficientloftr;
mod lightglue;
mod norm;
mod rope;
mod superpoint;

pub use backbone::{RepVggBackbone, RepVggBlock};
pub use binder::{BinderSource, WeightBinder};
pub use efficientloftr::{
    EfficientLoftrConfig, EfficientLoftrForKeypointMatching, RopeScaling,
};
pub use lightglue::{LightGlueConfig, LightGlueForKeypointMatching};
pub use norm::BatchNorm2d;
pub use rope::RotaryEmbedding2d;
pub use superpoint::{KeypointDetections, SuperPointConfig, SuperPointForKeypointDetection};

use candle_core::Tensor;

/// Sentinel value marking "no match" in the match-index tensor.
pub const NO_MATCH: i64 = -1;

/// Output of a keypoint matching forward pass.
///
/// Tensor layout follows the pair convention: dimension 1 has size 2 and
/// indexes the two images of the pair.
#[derive(Debug, Clone)]
pub struct KeypointMatchingOutput {
    /// Keypoint coordinates, `(batch, 2, num_keypoints, 2)` in pixels.
    pub keypoints: Tensor,
    /// Match indices into the other image's keypoint list,
    /// `(batch, 2, num_keypoints)`, [`NO_MATCH`] where unmatched.
    pub matches: Tensor,
    /// Matching confidence per keypoint, `(batch, 2, num_keypoints)`.
    pub matching_scores: Tensor,
    /// Per-stage hidden states, present when introspection was requested.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Attention weights, present when introspection was requested.
    pub attentions: Option<Vec<Tensor>>,
}
