//! State dict handling.
//!
//! A state dict is an ordered mapping from parameter name to tensor. The
//! transplant step moves tensors out of the original checkpoint's dict into
//! a new one under the rewritten names; the original is consumed so peak
//! memory stays bounded during large-checkpoint conversion (candle tensors
//! are reference-counted handles, so nothing is deep-copied).

use crate::error::{GraftError, Result};
use crate::rewrite::RenameMap;
use candle_core::Tensor;
use std::collections::HashMap;

/// Ordered parameter-name → tensor mapping.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    order: Vec<String>,
    tensors: HashMap<String, Tensor>,
}

impl StateDict {
    /// Create an empty state dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/tensor pairs, preserving their order.
    pub fn from_pairs(pairs: Vec<(String, Tensor)>) -> Result<Self> {
        let mut dict = Self::new();
        for (name, tensor) in pairs {
            dict.insert(name, tensor)?;
        }
        Ok(dict)
    }

    /// Insert a tensor under a name not yet present.
    ///
    /// A duplicate name is an error: two rewrite rules mapping distinct
    /// original keys onto the same target name is a mapping-table bug, not
    /// something to resolve silently.
    pub fn insert(&mut self, name: String, tensor: Tensor) -> Result<()> {
        if self.tensors.contains_key(&name) {
            return Err(GraftError::KeyCollision(name));
        }
        self.order.push(name.clone());
        self.tensors.insert(name, tensor);
        Ok(())
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Remove and return a tensor by name.
    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let tensor = self.tensors.remove(name)?;
        self.order.retain(|n| n != name);
        Some(tensor)
    }

    /// Check if a name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Parameter names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the dict is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Consume into name/tensor pairs in insertion order.
    pub fn into_pairs(mut self) -> Vec<(String, Tensor)> {
        self.order
            .drain(..)
            .filter_map(|name| {
                let tensor = self.tensors.remove(&name)?;
                Some((name, tensor))
            })
            .collect()
    }

    /// Consume into an unordered map (for tensor-by-name consumers).
    pub fn into_map(self) -> HashMap<String, Tensor> {
        self.tensors
    }
}

/// Move every tensor of `source` into a fresh dict under its rewritten name.
///
/// Keys the rename map dropped are discarded with their tensors. Every
/// surviving tensor is made contiguous. `source` is consumed; its backing
/// map is freed when this returns.
pub fn transplant(mut source: StateDict, renames: &RenameMap) -> Result<StateDict> {
    let mut converted = StateDict::new();
    for (old, new) in renames.iter() {
        let tensor = source
            .remove(old)
            .ok_or_else(|| GraftError::MissingTensor(old.to_string()))?;
        if let Some(new) = new {
            converted.insert(new.to_string(), tensor.contiguous()?)?;
        }
    }
    Ok(converted)
}

/// Merge a second model's full state dict under `prefix.`.
///
/// The prefix must keep the merged keys disjoint from everything already in
/// `dst`; a collision aborts the conversion.
pub fn merge_namespaced(dst: &mut StateDict, prefix: &str, src: StateDict) -> Result<()> {
    for (name, tensor) in src.into_pairs() {
        let namespaced = format!("{prefix}.{name}");
        if dst.contains(&namespaced) {
            return Err(GraftError::KeyCollision(namespaced));
        }
        dst.insert(namespaced, tensor)?;
    }
    Ok(())
}
