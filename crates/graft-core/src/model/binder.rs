//! Named-slot weight binding.
//!
//! A model constructor walks its parameter slots in schema order and takes
//! each tensor from a [`WeightBinder`]. Binding fails if a name is absent or
//! a shape disagrees, which is exactly how a mis-converted key table should
//! surface: loudly, before anything is saved.

use crate::error::{GraftError, Result};
use crate::state_dict::StateDict;
use candle_core::{DType, Device, Tensor};

/// Where bound tensors come from.
#[derive(Debug)]
pub enum BinderSource {
    /// A converted state dict; tensors are moved out as they bind.
    Checkpoint(StateDict),
    /// Synthesized weights for tests and shape checks.
    Random,
}

/// Dispenses tensors to model constructors by parameter name.
///
/// Tensors are handles over shared storage, so the bound-state record kept
/// for [`WeightBinder::finish`] costs no extra memory.
#[derive(Debug)]
pub struct WeightBinder {
    source: BinderSource,
    device: Device,
    bound: Vec<String>,
    bound_state: StateDict,
    strict: bool,
}

impl WeightBinder {
    /// Bind from a converted state dict, strictly: leftover tensors at
    /// [`WeightBinder::finish`] are an error.
    pub fn checkpoint(state: StateDict, device: &Device) -> Self {
        Self {
            source: BinderSource::Checkpoint(state),
            device: device.clone(),
            bound: Vec::new(),
            bound_state: StateDict::new(),
            strict: true,
        }
    }

    /// Tolerate leftover tensors at finish time (the merged-detector load).
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    /// Bind synthesized weights (for tests).
    pub fn random(device: &Device) -> Self {
        Self {
            source: BinderSource::Random,
            device: device.clone(),
            bound: Vec::new(),
            bound_state: StateDict::new(),
            strict: false,
        }
    }

    /// Take the tensor for `name`, requiring exactly `dims`.
    pub fn take(&mut self, name: &str, dims: &[usize]) -> Result<Tensor> {
        let tensor = match &mut self.source {
            BinderSource::Checkpoint(state) => {
                let tensor = state
                    .remove(name)
                    .ok_or_else(|| GraftError::MissingTensor(name.to_string()))?;
                if tensor.dims() != dims {
                    return Err(GraftError::ShapeMismatch {
                        name: name.to_string(),
                        expected: dims.to_vec(),
                        got: tensor.dims().to_vec(),
                    });
                }
                tensor.to_device(&self.device)?.to_dtype(DType::F32)?
            }
            // Uniform in [0, 1) keeps running-variance slots valid.
            BinderSource::Random => Tensor::rand(0.0f32, 1.0, dims, &self.device)?,
        };
        self.bound.push(name.to_string());
        self.bound_state.insert(name.to_string(), tensor.clone())?;
        Ok(tensor)
    }

    /// Consume a bookkeeping tensor if present (e.g. `num_batches_tracked`);
    /// never fails and never synthesizes.
    pub fn discard(&mut self, name: &str) {
        if let BinderSource::Checkpoint(state) = &mut self.source {
            if state.remove(name).is_some() {
                self.bound.push(name.to_string());
            }
        }
    }

    /// Names bound so far, in bind order.
    pub fn bound_names(&self) -> &[String] {
        &self.bound
    }

    /// Device tensors are bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Finish binding, returning the state dict of everything that bound.
    ///
    /// This is what a converted model saves: the parameters it actually
    /// holds, not whatever else the checkpoint carried. In strict mode any
    /// tensor the schema never consumed is an error; in lenient mode
    /// leftovers are dropped.
    pub fn finish(self) -> Result<StateDict> {
        if let BinderSource::Checkpoint(state) = self.source {
            if self.strict && !state.is_empty() {
                let mut leftover: Vec<&str> = state.keys().collect();
                leftover.sort_unstable();
                return Err(GraftError::UnexpectedTensors(leftover.join(", ")));
            }
        }
        Ok(self.bound_state)
    }
}
