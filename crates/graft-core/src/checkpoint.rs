//! Checkpoint I/O.
//!
//! Original checkpoints arrive either as PyTorch pickle files (`.pth`,
//! sometimes with the weights nested under a `state_dict` entry) or as
//! SafeTensors files. Converted artifacts are always written as
//! SafeTensors next to their `config.json`.

use crate::error::{GraftError, Result};
use crate::state_dict::StateDict;
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Load a PyTorch pickle checkpoint.
///
/// `nested_key` selects a sub-dictionary of the pickled object (the
/// EfficientLoFTR release stores weights under `"state_dict"`); `None`
/// reads a flat state dict. Tensors land on the CPU.
pub fn load_pth(path: &Path, nested_key: Option<&str>) -> Result<StateDict> {
    let pairs = candle_core::pickle::read_all_with_key(path, nested_key).map_err(|e| {
        GraftError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    StateDict::from_pairs(pairs)
}

/// Load a SafeTensors checkpoint.
///
/// Entries are inserted in name order so loading is deterministic across
/// serializers.
pub fn load_safetensors(path: &Path, device: &Device) -> Result<StateDict> {
    let data = fs::read(path)?;
    let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
        GraftError::Checkpoint(format!("failed to deserialize {}: {e}", path.display()))
    })?;

    let mut entries: Vec<(String, safetensors::tensor::TensorView)> = safetensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (name.to_string(), view))
        .collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));

    let mut pairs = Vec::with_capacity(entries.len());
    for (name, view) in entries {
        let tensor = view_to_tensor(&view, device)?;
        pairs.push((name, tensor));
    }
    StateDict::from_pairs(pairs)
}

/// Write a state dict as a SafeTensors file.
pub fn save_safetensors(state: &StateDict, path: &Path) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(state.len());
    for name in state.keys() {
        if let Some(tensor) = state.get(name) {
            tensors.insert(name.to_string(), tensor.clone());
        }
    }
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Convert a SafeTensors view into a candle tensor.
fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: &[f32] = bytemuck::cast_slice(data);
            Tensor::from_slice(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let values: &[half::f16] = bytemuck::cast_slice(data);
            Tensor::from_slice(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let values: &[half::bf16] = bytemuck::cast_slice(data);
            Tensor::from_slice(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::I64 => {
            let values: &[i64] = bytemuck::cast_slice(data);
            Tensor::from_slice(values, shape.as_slice(), device)?
        }
        // Candle has no I32; widen.
        safetensors::Dtype::I32 => {
            let values: &[i32] = bytemuck::cast_slice(data);
            let values: Vec<i64> = values.iter().map(|&x| i64::from(x)).collect();
            Tensor::from_slice(&values, shape.as_slice(), device)?
        }
        safetensors::Dtype::U32 => {
            let values: &[u32] = bytemuck::cast_slice(data);
            Tensor::from_slice(values, shape.as_slice(), device)?
        }
        safetensors::Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
        other => {
            return Err(GraftError::Checkpoint(format!(
                "unsupported dtype {other:?} for tensor of shape {shape:?}"
            )));
        }
    };

    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safetensors_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");

        let device = Device::Cpu;
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let b = Tensor::from_slice(&[5.0f32, 6.0], (2,), &device).unwrap();
        let state = StateDict::from_pairs(vec![
            ("backbone.conv.weight".to_string(), a),
            ("head.bias".to_string(), b),
        ])
        .unwrap();

        save_safetensors(&state, &path).unwrap();
        let reloaded = load_safetensors(&path, &device).unwrap();

        assert_eq!(reloaded.len(), 2);
        let a = reloaded.get("backbone.conv.weight").unwrap();
        assert_eq!(a.dims(), &[2, 2]);
        let values: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let result = load_safetensors(Path::new("/nonexistent/model.safetensors"), &Device::Cpu);
        assert!(result.is_err());
    }

    #[test]
    fn load_pth_missing_file_is_an_error() {
        let result = load_pth(Path::new("/nonexistent/weights.pth"), Some("state_dict"));
        assert!(matches!(result, Err(GraftError::Checkpoint(_))));
    }
}
