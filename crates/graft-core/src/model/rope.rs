//! Two-dimensional rotary position embeddings.
//!
//! Feature-map tokens live on an (y, x) grid, so rotary frequencies are
//! split between the two axes: the first half of each rotation pair encodes
//! the row index, the second half the column index. Queries and keys over
//! the flattened grid are rotated with cached cos/sin tables.

use crate::error::{GraftError, Result};
use candle_core::{Device, Tensor};

/// Rotary embedding over a fixed 2-D grid.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding2d {
    cos_cache: Tensor,
    sin_cache: Tensor,
    head_dim: usize,
    grid: (usize, usize),
}

impl RotaryEmbedding2d {
    /// Build caches for a `height` x `width` grid.
    ///
    /// `head_dim` must be divisible by four: half the dimension rotates, and
    /// that half splits evenly across the two axes.
    pub fn new(
        head_dim: usize,
        height: usize,
        width: usize,
        theta: f64,
        device: &Device,
    ) -> Result<Self> {
        if head_dim % 4 != 0 {
            return Err(GraftError::Checkpoint(format!(
                "rotary head_dim {head_dim} is not divisible by 4"
            )));
        }
        let half = head_dim / 2;
        let quarter = head_dim / 4;

        // Per-axis inverse frequencies: 1 / theta^(2i/half) for i in [0, quarter).
        let inv_freq: Vec<f64> = (0..quarter)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / half as f64))
            .collect();

        let mut freqs = Vec::with_capacity(height * width * half);
        for y in 0..height {
            for x in 0..width {
                for f in &inv_freq {
                    freqs.push((y as f64 * f) as f32);
                }
                for f in &inv_freq {
                    freqs.push((x as f64 * f) as f32);
                }
            }
        }
        let freqs = Tensor::from_vec(freqs, (height * width, half), device)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            grid: (height, width),
        })
    }

    /// Rotate query and key tensors of shape `(batch, heads, tokens, head_dim)`
    /// where `tokens` equals the flattened grid size.
    pub fn apply(&self, query: &Tensor, key: &Tensor) -> Result<(Tensor, Tensor)> {
        let tokens = query.dims()[2];
        let expected = self.grid.0 * self.grid.1;
        if tokens != expected {
            return Err(GraftError::ShapeMismatch {
                name: "rotary grid".to_string(),
                expected: vec![expected],
                got: vec![tokens],
            });
        }

        let query_rot = self.rotate(query)?;
        let key_rot = self.rotate(key)?;
        Ok((query_rot, key_rot))
    }

    fn rotate(&self, x: &Tensor) -> Result<Tensor> {
        let half = self.head_dim / 2;
        let dims = x.dims();

        let x1 = x.narrow(3, 0, half)?;
        let x2 = x.narrow(3, half, half)?;

        // [tokens, half] -> [1, 1, tokens, half], broadcast over batch/heads.
        let cos = self.cos_cache.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin_cache.unsqueeze(0)?.unsqueeze(0)?;
        let cos = cos.broadcast_as(&[dims[0], dims[1], dims[2], half])?;
        let sin = sin.broadcast_as(&[dims[0], dims[1], dims[2], half])?;

        let out1 = ((&x1 * &cos)? - (&x2 * &sin)?)?;
        let out2 = ((&x2 * &cos)? + (&x1 * &sin)?)?;
        Ok(Tensor::cat(&[out1, out2], 3)?)
    }

    /// Head dimension the caches were built for.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// The (height, width) grid the caches cover.
    pub fn grid(&self) -> (usize, usize) {
        self.grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_shapes_cover_grid() {
        let rope = RotaryEmbedding2d::new(32, 6, 8, 10000.0, &Device::Cpu).unwrap();
        assert_eq!(rope.grid(), (6, 8));
        assert_eq!(rope.cos_cache.dims(), &[48, 16]);
        assert_eq!(rope.sin_cache.dims(), &[48, 16]);
    }

    #[test]
    fn apply_preserves_shapes() {
        let rope = RotaryEmbedding2d::new(32, 4, 4, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::rand(0.0f32, 1.0, &[1, 8, 16, 32], &Device::Cpu).unwrap();
        let k = Tensor::rand(0.0f32, 1.0, &[1, 8, 16, 32], &Device::Cpu).unwrap();

        let (q_rot, k_rot) = rope.apply(&q, &k).unwrap();
        assert_eq!(q_rot.dims(), q.dims());
        assert_eq!(k_rot.dims(), k.dims());
    }

    #[test]
    fn origin_token_is_unrotated() {
        // Position (0, 0) has zero angles, so cos=1/sin=0 and the first
        // token passes through unchanged.
        let rope = RotaryEmbedding2d::new(8, 2, 2, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::rand(0.0f32, 1.0, &[1, 1, 4, 8], &Device::Cpu).unwrap();
        let k = q.clone();

        let (q_rot, _) = rope.apply(&q, &k).unwrap();
        let before: Vec<f32> = q.narrow(2, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let after: Vec<f32> =
            q_rot.narrow(2, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (b, a) in before.iter().zip(&after) {
            assert!((b - a).abs() < 1e-6);
        }
    }

    #[test]
    fn token_count_mismatch_is_an_error() {
        let rope = RotaryEmbedding2d::new(8, 2, 2, 10000.0, &Device::Cpu).unwrap();
        let q = Tensor::rand(0.0f32, 1.0, &[1, 1, 9, 8], &Device::Cpu).unwrap();
        assert!(rope.apply(&q, &q).is_err());
    }

    #[test]
    fn indivisible_head_dim_is_an_error() {
        assert!(RotaryEmbedding2d::new(6, 2, 2, 10000.0, &Device::Cpu).is_err());
    }
}
