//! Matrix NMS
//!
//! Parallel soft suppression for mask candidates. Instead of greedily removing
//! overlapping masks, every candidate's score is decayed in one pass by a factor
//! computed from its IoU with all higher-ranked candidates:
//!
//! ```text
//! decay(i, j)    = f(iou[i, j]) / f(compensate[i])     for i ranked above j
//! compensate[i]  = max_k iou[k, i]                       for k ranked above i
//! score'[j]      = score[j] * min_i decay(i, j)
//! ```
//!
//! The compensation term accounts for candidate `i` being suppressed itself.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Decay function applied to pairwise IoU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayKernel {
    /// `f(iou) = exp(-iou^2 / sigma)`
    Gaussian,
    /// `f(iou) = 1 - iou`
    Linear,
}

impl DecayKernel {
    /// Element-wise decay matrix `f(iou) / f(compensate)` for the given kernel
    fn decay_matrix(&self, iou: &Tensor, compensate: &Tensor, sigma: f32) -> Result<Tensor> {
        match self {
            DecayKernel::Gaussian => {
                let scale = -1.0 / sigma as f64;
                let decay = iou.sqr()?.affine(scale, 0.0)?.exp()?;
                let comp = compensate.sqr()?.affine(scale, 0.0)?.exp()?;
                decay.div(&comp)
            }
            DecayKernel::Linear => {
                let decay = iou.affine(-1.0, 1.0)?;
                // A fully overlapped higher-ranked candidate leaves nothing to compensate
                let comp = compensate.affine(-1.0, 1.0)?.clamp(f32::EPSILON, 1.0)?;
                decay.div(&comp)
            }
        }
    }
}

impl std::str::FromStr for DecayKernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" => Ok(DecayKernel::Gaussian),
            "linear" => Ok(DecayKernel::Linear),
            other => Err(format!("unknown matrix nms kernel '{other}'")),
        }
    }
}

/// Which candidate pairs are allowed to suppress each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsScope {
    /// Only candidates sharing a label
    PerClass,
    /// Every higher-ranked candidate, regardless of label
    ClassAgnostic,
}

/// Pairwise mask IoU of `n` binary masks, shape `[n, n]`
///
/// `masks` is `[n, H, W]` of any dtype holding 0/1 values; `areas` is `[n]` f32.
pub fn mask_iou_matrix(masks: &Tensor, areas: &Tensor) -> Result<Tensor> {
    let n = masks.dim(0)?;
    let flat = masks.flatten_from(1)?.to_dtype(DType::F32)?;
    let inter = flat.matmul(&flat.t()?.contiguous()?)?;
    let areas = areas.to_dtype(DType::F32)?.reshape((1, n))?;
    let union = areas
        .broadcast_add(&areas.t()?)?
        .broadcast_sub(&inter)?
        .clamp(f32::EPSILON, f32::MAX)?;
    inter.div(&union)
}

/// Matrix NMS over candidates sorted by descending score.
///
/// # Arguments
/// * `masks` - Binary masks `[n, H, W]`
/// * `labels` - Class labels `[n]` (u32)
/// * `scores` - Scores `[n]` (f32), sorted descending
/// * `areas` - Optional precomputed mask areas `[n]`
///
/// # Returns
/// Decayed scores `[n]`
pub fn matrix_nms(
    masks: &Tensor,
    labels: &Tensor,
    scores: &Tensor,
    areas: Option<&Tensor>,
    kernel: DecayKernel,
    sigma: f32,
    scope: NmsScope,
) -> Result<Tensor> {
    let n = scores.dims1()?;
    if masks.dim(0)? != n || labels.dims1()? != n {
        candle_core::bail!(
            "matrix nms expects {n} masks and labels, got {:?} and {:?}",
            masks.dims(),
            labels.dims()
        )
    }
    if n == 0 {
        return Ok(scores.clone());
    }
    let device = scores.device();

    let areas = match areas {
        Some(areas) => areas.to_dtype(DType::F32)?,
        None => masks.to_dtype(DType::F32)?.flatten_from(1)?.sum(1)?,
    };
    let iou = mask_iou_matrix(masks, &areas)?;

    // Only pairs (i, j) with i ranked strictly above j take part
    let order = Tensor::arange(0u32, n as u32, device)?;
    let mut pair_mask = order
        .reshape((n, 1))?
        .broadcast_lt(&order.reshape((1, n))?)?
        .to_dtype(DType::F32)?;
    if scope == NmsScope::PerClass {
        let same_label = labels
            .reshape((n, 1))?
            .broadcast_eq(&labels.reshape((1, n))?)?
            .to_dtype(DType::F32)?;
        pair_mask = pair_mask.mul(&same_label)?;
    }
    let decay_iou = iou.mul(&pair_mask)?;

    // compensate[i] = max IoU of i with a higher-ranked candidate, repeated along row i
    let compensate = decay_iou
        .max(0)?
        .reshape((n, 1))?
        .broadcast_as((n, n))?
        .contiguous()?;

    let decay = kernel.decay_matrix(&decay_iou, &compensate, sigma)?;
    let coefficient = decay.min(0)?;
    scores.to_dtype(DType::F32)?.mul(&coefficient)
}
