//! Batch normalization over feature maps.
//!
//! Conversion targets are inference-only, so this is the frozen-statistics
//! form: `y = (x - mean) / sqrt(var + eps) * weight + bias` with recorded
//! running statistics.

use crate::error::Result;
use crate::model::WeightBinder;
use candle_core::{DType, Device, Tensor};

/// 2-D batch normalization with frozen running statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    eps: f64,
    num_features: usize,
}

impl BatchNorm2d {
    /// Create from explicit parameter tensors, all of shape `(num_features,)`.
    pub fn new(
        weight: Tensor,
        bias: Tensor,
        running_mean: Tensor,
        running_var: Tensor,
        eps: f64,
    ) -> Result<Self> {
        let num_features = weight.dims()[0];
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            eps,
            num_features,
        })
    }

    /// Identity normalization (for testing).
    pub fn identity(num_features: usize, eps: f64, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Tensor::ones(num_features, DType::F32, device)?,
            bias: Tensor::zeros(num_features, DType::F32, device)?,
            running_mean: Tensor::zeros(num_features, DType::F32, device)?,
            running_var: Tensor::ones(num_features, DType::F32, device)?,
            eps,
            num_features,
        })
    }

    /// Bind `{prefix}.{weight,bias,running_mean,running_var}`.
    ///
    /// The checkpoint bookkeeping entry `num_batches_tracked` is consumed
    /// and discarded; it is not a parameter.
    pub fn from_binder(
        binder: &mut WeightBinder,
        prefix: &str,
        num_features: usize,
        eps: f64,
    ) -> Result<Self> {
        let dims = [num_features];
        let weight = binder.take(&format!("{prefix}.weight"), &dims)?;
        let bias = binder.take(&format!("{prefix}.bias"), &dims)?;
        let running_mean = binder.take(&format!("{prefix}.running_mean"), &dims)?;
        let running_var = binder.take(&format!("{prefix}.running_var"), &dims)?;
        binder.discard(&format!("{prefix}.num_batches_tracked"));
        Self::new(weight, bias, running_mean, running_var, eps)
    }

    /// Forward pass over `(batch, channels, height, width)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let rstd = (&self.running_var + self.eps)?.sqrt()?.recip()?;
        let scale = (&self.weight * &rstd)?;
        let shift = (&self.bias - (&self.running_mean * &scale)?)?;

        let scale = scale.reshape((1, self.num_features, 1, 1))?;
        let shift = shift.reshape((1, self.num_features, 1, 1))?;
        let y = x.broadcast_mul(&scale)?.broadcast_add(&shift)?;
        Ok(y)
    }

    /// Number of normalized channels.
    pub fn num_features(&self) -> usize {
        self.num_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_stats_pass_input_through() {
        let norm = BatchNorm2d::identity(3, 0.0, &Device::Cpu).unwrap();
        let x = Tensor::from_slice(&[2.0f32; 12], (1, 3, 2, 2), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();

        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((v - 2.0).abs() < 1e-6, "expected 2.0, got {v}");
        }
    }

    #[test]
    fn normalizes_with_recorded_statistics() {
        let device = Device::Cpu;
        let norm = BatchNorm2d::new(
            Tensor::from_slice(&[2.0f32], (1,), &device).unwrap(),
            Tensor::from_slice(&[1.0f32], (1,), &device).unwrap(),
            Tensor::from_slice(&[3.0f32], (1,), &device).unwrap(),
            Tensor::from_slice(&[4.0f32], (1,), &device).unwrap(),
            0.0,
        )
        .unwrap();

        // y = (x - 3) / 2 * 2 + 1 = x - 2
        let x = Tensor::from_slice(&[5.0f32], (1, 1, 1, 1), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!((v[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn binds_all_four_parameters() {
        let mut binder = WeightBinder::random(&Device::Cpu);
        let norm = BatchNorm2d::from_binder(&mut binder, "block.norm", 8, 1e-5).unwrap();
        assert_eq!(norm.num_features(), 8);

        let names = binder.bound_names();
        assert!(names.contains(&"block.norm.weight".to_string()));
        assert!(names.contains(&"block.norm.running_var".to_string()));
    }

    #[test]
    fn forward_preserves_shape() {
        let norm = BatchNorm2d::identity(16, 1e-5, &Device::Cpu).unwrap();
        let x = Tensor::rand(0.0f32, 1.0, &[2, 16, 8, 8], &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }
}
