use std::fmt;

use candle_core::Result;
use candle_core::Tensor;

/// Tensor statistics for inspecting head inputs and outputs
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub nonzero: usize,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor
            .flatten_all()?
            .to_dtype(candle_core::DType::F32)?
            .to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = if data.is_empty() {
            0.0
        } else {
            sum / data.len() as f32
        };
        let nonzero = data.iter().filter(|&&v| v != 0.0).count();

        Ok(Self {
            shape,
            min,
            max,
            mean,
            nonzero,
        })
    }

    /// Log the statistics of a named tensor at debug level
    pub fn log(name: &str, tensor: &Tensor) -> Result<()> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let stats = Self::from_tensor(tensor)?;
            tracing::debug!("{name}: {stats}");
        }
        Ok(())
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shape={:?} min={:.4} max={:.4} mean={:.4} nonzero={}",
            self.shape, self.min, self.max, self.mean, self.nonzero
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tensor_stats() {
        let t = Tensor::new(&[[0f32, 2.0], [-1.0, 3.0]], &Device::Cpu).unwrap();
        let stats = TensorStats::from_tensor(&t).unwrap();
        assert_eq!(stats.shape, vec![2, 2]);
        assert_eq!(stats.min, -1.0);
        assert_eq!(stats.max, 3.0);
        assert!((stats.mean - 1.0).abs() < 1e-6);
        assert_eq!(stats.nonzero, 3);
    }
}
