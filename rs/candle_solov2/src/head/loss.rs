//! Training losses of the SOLOv2 head.
//!
//! The mask branch is trained with a dice loss on the decoded masks of positive cells,
//! the category branch with a softmax focal loss over every cell of every level.

use candle_core::{DType, Device, Result, Tensor};

/// Smoothing term added to both squared sums of the dice denominator
pub const DICE_EPS: f64 = 1e-3;
/// Added to probabilities before taking the log in the focal loss
pub const FOCAL_EPS: f64 = 1e-16;

/// Separate mask and category losses of a batch
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Weighted dice loss, scalar
    pub loss_ins: Tensor,
    /// Focal loss, scalar
    pub loss_cate: Tensor,
}

impl LossOutput {
    pub fn to_scalars(&self) -> Result<(f32, f32)> {
        Ok((
            self.loss_ins.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            self.loss_cate.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        ))
    }
}

/// Per-entry dice loss.
///
/// # Arguments
/// * `probs` - Mask probabilities [N, H, W]
/// * `target` - Binary target masks [N, H, W], any dtype
///
/// # Returns
/// `1 - 2 * sum(p * t) / (sum(p^2) + eps + sum(t^2) + eps)` per entry, shape [N]
pub fn dice_loss(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let n = probs.dim(0)?;
    if target.dim(0)? != n {
        candle_core::bail!(
            "dice loss got {n} predictions and {} targets",
            target.dim(0)?
        )
    }
    let probs = probs.reshape((n, ()))?;
    let target = target.to_dtype(probs.dtype())?.reshape((n, ()))?;

    let a = (&probs * &target)?.sum(1)?;
    let b = (probs.sqr()?.sum(1)? + DICE_EPS)?;
    let c = (target.sqr()?.sum(1)? + DICE_EPS)?;
    let d = ((a * 2.0)? / (b + c)?)?;
    d.affine(-1.0, 1.0)
}

/// Weighted mean of the dice loss over every positive entry.
///
/// # Arguments
/// * `pairs` - Per level `(mask logits [n, H, W], targets [n, H, W])`; levels without
///   entries are left out by the caller
/// * `weight` - Loss weight
pub fn mask_loss(pairs: &[(Tensor, Tensor)], weight: f64, device: &Device) -> Result<Tensor> {
    if pairs.is_empty() {
        return Tensor::zeros((), DType::F32, device);
    }
    let mut losses = Vec::with_capacity(pairs.len());
    for (logits, target) in pairs {
        let probs = candle_nn::ops::sigmoid(logits)?;
        losses.push(dice_loss(&probs, target)?);
    }
    Tensor::cat(&losses, 0)?.mean_all()? * weight
}

/// Softmax focal loss with mean reduction.
///
/// # Arguments
/// * `probs` - Class probabilities [M, C] (softmax already applied)
/// * `labels` - Class index per row, `len() == M`
/// * `gamma` - Focusing parameter
/// * `ignore_index` - Rows with this label do not contribute
///
/// # Returns
/// Scalar `mean(-(1 - p)^gamma * ln(p + eps))` over the kept rows, zero when none is kept
pub fn focal_loss(
    probs: &Tensor,
    labels: &[u32],
    gamma: f64,
    ignore_index: Option<u32>,
) -> Result<Tensor> {
    let (m, c) = probs.dims2()?;
    if labels.len() != m {
        candle_core::bail!("focal loss got {m} rows and {} labels", labels.len())
    }

    let mut rows = Vec::with_capacity(m);
    let mut kept = Vec::with_capacity(m);
    for (row, &label) in labels.iter().enumerate() {
        if Some(label) == ignore_index {
            continue;
        }
        if label as usize >= c {
            candle_core::bail!("label {label} is outside the {c} class channels")
        }
        rows.push(row as u32);
        kept.push(label);
    }
    if rows.is_empty() {
        return Tensor::zeros((), probs.dtype(), probs.device());
    }

    let device = probs.device();
    let n = rows.len();
    let rows = Tensor::from_vec(rows, n, device)?;
    let kept = Tensor::from_vec(kept, (n, 1), device)?;
    let p = probs.index_select(&rows, 0)?.gather(&kept, 1)?;

    let modulator = p.affine(-1.0, 1.0)?.powf(gamma)?;
    let log_p = p.affine(1.0, FOCAL_EPS)?.log()?;
    (modulator * log_p)?.neg()?.mean_all()
}

/// Focal loss over the per-level class logits of a batch.
///
/// # Arguments
/// * `cate_logits` - Per level class logits [B, C, S, S]
/// * `labels` - Category grids flattened level-major, then image-major, then row-major
pub fn class_loss(
    cate_logits: &[Tensor],
    labels: &[u32],
    gamma: f64,
    ignore_index: Option<u32>,
) -> Result<Tensor> {
    let mut flat = Vec::with_capacity(cate_logits.len());
    for logits in cate_logits {
        let c = logits.dim(1)?;
        flat.push(logits.permute((0, 2, 3, 1))?.reshape(((), c))?);
    }
    let flat = Tensor::cat(&flat, 0)?;
    let probs = candle_nn::ops::softmax_last_dim(&flat)?;
    focal_loss(&probs, labels, gamma, ignore_index)
}
