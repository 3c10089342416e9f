//! # Graft Core
//!
//! Library half of the graft conversion toolkit. Converts externally
//! published keypoint-matching checkpoints (EfficientLoFTR, LightGlue +
//! SuperPoint) into this library's parameter naming and configuration
//! format.
//!
//! This crate provides:
//! - **Key rewriting** via ordered regex mapping tables
//! - **State dict transplanting** with bounded peak memory
//! - **Checkpoint I/O** for PyTorch pickle and SafeTensors files
//! - **Model assembly** by named-slot weight binding
//! - **Golden verification** against recorded reference outputs
//! - **Hub access** for checkpoint fetches and artifact publishing

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod checkpoint;
pub mod error;
pub mod hub;
pub mod image;
pub mod model;
pub mod rewrite;
pub mod state_dict;
pub mod verify;

pub use error::{GraftError, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::error::{GraftError, Result};
    pub use crate::hub::{Publisher, Source};
    pub use crate::image::ImageProcessor;
    pub use crate::model::{
        EfficientLoftrConfig, EfficientLoftrForKeypointMatching, KeypointMatchingOutput,
        LightGlueConfig, LightGlueForKeypointMatching, SuperPointConfig, WeightBinder, NO_MATCH,
    };
    pub use crate::rewrite::{KeyMapping, RenameMap, Rule, RuleAction};
    pub use crate::state_dict::{merge_namespaced, transplant, StateDict};
    pub use crate::verify::GoldenOutputs;
}
