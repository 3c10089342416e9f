//! # Graft
//!
//! Conversion pipelines turning published keypoint-matching checkpoints
//! (EfficientLoFTR, LightGlue + SuperPoint) into this library's parameter
//! naming and configuration format.
//!
//! Each pipeline is strictly linear: fetch the original checkpoint, rewrite
//! its parameter keys through an ordered regex table, transplant the
//! tensors, bind them into a freshly built model, save the artifacts,
//! reload them, and verify a fixed image pair against recorded golden
//! outputs. Publishing to the Hub is an optional final step.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use graft::pipeline::ConvertOptions;
//!
//! let options = ConvertOptions::new("converted/efficientloftr");
//! graft::efficientloftr::convert(
//!     &options,
//!     graft::efficientloftr::DEFAULT_MODEL_REPO,
//!     graft::efficientloftr::DEFAULT_FILE,
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export the core crate.
pub use graft_core::*;

pub mod efficientloftr;
pub mod lightglue;
pub mod pipeline;
