//! Per-image inference decoding.
//!
//! Candidates are (cell, class) pairs whose class probability passes `score_thr`. Their
//! kernels are decoded into masks, filtered by mask area, rescored by mask quality,
//! suppressed with Matrix NMS and finally resized to the original image.

use candle_core::{DType, Result, Tensor};

use super::dynamic_conv::decode_masks;
use super::matrix_nms::matrix_nms;
use crate::config::{GridLevels, InferenceConfig};
use crate::detection::SegResult;

/// Image geometry needed to map masks back to the original image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageMeta {
    /// Unpadded network input size (h, w)
    pub img_shape: (usize, usize),
    /// Original image size (h, w)
    pub ori_shape: (usize, usize),
    /// Resize factor from the original image to the network input. Informational,
    /// decoding only reads the two shapes.
    pub scale_factor: f32,
}

impl ImageMeta {
    pub fn new(img_shape: (usize, usize), ori_shape: (usize, usize), scale_factor: f32) -> Self {
        Self {
            img_shape,
            ori_shape,
            scale_factor,
        }
    }

    /// Geometry of a keep-ratio resize, the scale factor being the smaller side ratio
    pub fn from_shapes(img_shape: (usize, usize), ori_shape: (usize, usize)) -> Self {
        let ratio_h = img_shape.0 as f32 / ori_shape.0.max(1) as f32;
        let ratio_w = img_shape.1 as f32 / ori_shape.1.max(1) as f32;
        Self::new(img_shape, ori_shape, ratio_h.min(ratio_w))
    }
}

/// Keep class probabilities only at local maxima.
///
/// A cell survives when it equals the max of the 2x2 window ending at it, i.e. a
/// stride 1 max pool with padding 1 whose last row and column are dropped.
///
/// # Arguments
/// * `heat` - Non-negative class probabilities [B, C, S, S]
pub fn points_nms(heat: &Tensor) -> Result<Tensor> {
    heat.dims4()?;
    // Zero padding equals -inf padding for probabilities
    let padded = heat.pad_with_zeros(2, 1, 0)?.pad_with_zeros(3, 1, 0)?;
    let hmax = padded.max_pool2d_with_stride(2, 1)?;
    let keep = hmax.eq(heat)?.to_dtype(heat.dtype())?;
    heat.mul(&keep)
}

/// Descending order of `scores`, truncated to `limit`
fn sorted_desc(scores: &[f32], limit: usize) -> Vec<u32> {
    let mut order: Vec<u32> = (0..scores.len() as u32).collect();
    order.sort_by(|&a, &b| {
        scores[b as usize]
            .partial_cmp(&scores[a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(limit);
    order
}

fn select<T: Copy>(values: &[T], order: &[u32]) -> Vec<T> {
    order.iter().map(|&i| values[i as usize]).collect()
}

/// Decode the detections of one image.
///
/// # Arguments
/// * `cate_scores` - Class probabilities of every cell, levels concatenated, [N, C]
/// * `kernels` - Kernel vector of every cell in the same order, [N, K]
/// * `mask_feat` - Shared mask features of the image, [K, H, W]
/// * `meta` - Image geometry
/// * `levels` - Grid layout, `levels.total_cells() == N`
/// * `mask_stride` - Stride of the mask features with respect to the input
/// * `cfg` - Thresholds
///
/// # Returns
/// `None` when no candidate survives a filtering stage
pub fn decode_image(
    cate_scores: &Tensor,
    kernels: &Tensor,
    mask_feat: &Tensor,
    meta: &ImageMeta,
    levels: &GridLevels,
    mask_stride: usize,
    cfg: &InferenceConfig,
) -> Result<Option<SegResult>> {
    let (num_cells, num_classes) = cate_scores.dims2()?;
    let (kernel_cells, kernel_channels) = kernels.dims2()?;
    let (feat_channels, feat_h, feat_w) = mask_feat.dims3()?;
    if num_cells != levels.total_cells() || kernel_cells != num_cells {
        candle_core::bail!(
            "expected {} cells, got {num_cells} class rows and {kernel_cells} kernel rows",
            levels.total_cells()
        )
    }
    if kernel_channels != feat_channels {
        candle_core::bail!(
            "kernel channels {kernel_channels} do not match mask feature channels {feat_channels}"
        )
    }
    let device = mask_feat.device();

    // 1. threshold (cell, class) pairs, cell-major
    let score_rows: Vec<Vec<f32>> = cate_scores.to_dtype(DType::F32)?.to_vec2()?;
    let mut cells = Vec::new();
    let mut labels = Vec::new();
    let mut scores = Vec::new();
    for (cell, row) in score_rows.iter().enumerate() {
        for (class, &score) in row.iter().enumerate() {
            if score > cfg.score_thr {
                cells.push(cell as u32);
                labels.push(class as u32);
                scores.push(score);
            }
        }
    }
    tracing::debug!(candidates = cells.len(), num_classes, "score threshold");
    if cells.is_empty() {
        return Ok(None);
    }

    // 2. kernels and level strides of the candidates
    let mut strides = Vec::with_capacity(cells.len());
    for &cell in &cells {
        match levels.stride_of(cell as usize) {
            Some(stride) => strides.push(stride as f32),
            None => candle_core::bail!("cell {cell} is outside the grid levels"),
        }
    }
    let cell_index = Tensor::from_slice(&cells, cells.len(), device)?;
    let kernels = kernels.index_select(&cell_index, 0)?;

    // 3. decode and binarize
    let logits = decode_masks(&kernels, &mask_feat.to_dtype(kernels.dtype())?)?;
    let probs = candle_nn::ops::sigmoid(&logits)?.to_dtype(DType::F32)?;
    let masks = probs.gt(cfg.mask_thr as f64)?.to_dtype(DType::F32)?;
    let sum_masks: Vec<f32> = masks.sum((1, 2))?.to_vec1()?;

    // 4. drop masks smaller than the level stride
    let keep: Vec<u32> = (0..sum_masks.len() as u32)
        .filter(|&i| sum_masks[i as usize] > strides[i as usize])
        .collect();
    tracing::debug!(kept = keep.len(), "mask area filter");
    if keep.is_empty() {
        return Ok(None);
    }
    let keep_index = Tensor::from_slice(&keep, keep.len(), device)?;
    let probs = probs.index_select(&keep_index, 0)?;
    let masks = masks.index_select(&keep_index, 0)?;
    let sum_masks = select(&sum_masks, &keep);
    let labels = select(&labels, &keep);
    let scores = select(&scores, &keep);

    // 5. mask quality rescoring
    let quality: Vec<f32> = (&probs * &masks)?.sum((1, 2))?.to_vec1()?;
    let scores: Vec<f32> = scores
        .iter()
        .zip(quality.iter().zip(sum_masks.iter()))
        .map(|(&s, (&q, &area))| s * q / area)
        .collect();

    // 6. top nms_pre
    let order = sorted_desc(&scores, cfg.nms_pre);
    let order_index = Tensor::from_slice(&order, order.len(), device)?;
    let probs = probs.index_select(&order_index, 0)?;
    let masks = masks.index_select(&order_index, 0)?;
    let sum_masks = select(&sum_masks, &order);
    let labels = select(&labels, &order);
    let scores = select(&scores, &order);

    // 7. matrix nms
    let n = scores.len();
    let decayed = matrix_nms(
        &masks,
        &Tensor::from_slice(&labels, n, device)?,
        &Tensor::from_slice(&scores, n, device)?,
        Some(&Tensor::from_slice(&sum_masks, n, device)?),
        cfg.kernel,
        cfg.sigma,
        cfg.scope,
    )?;
    let decayed: Vec<f32> = decayed.to_vec1()?;

    // 8. update threshold
    let keep: Vec<u32> = (0..n as u32)
        .filter(|&i| decayed[i as usize] >= cfg.update_thr)
        .collect();
    tracing::debug!(kept = keep.len(), "matrix nms");
    if keep.is_empty() {
        return Ok(None);
    }
    let scores = select(&decayed, &keep);
    let labels = select(&labels, &keep);

    // 9. top max_per_img, indices into the kept set mapped back to `probs` rows
    let order = sorted_desc(&scores, cfg.max_per_img);
    let rows = select(&keep, &order);
    let scores = select(&scores, &order);
    let labels = select(&labels, &order);
    let probs = probs.index_select(&Tensor::from_slice(&rows, rows.len(), device)?, 0)?;

    // 10. back to the original image
    let masks = resize_to_original(&probs, meta, (feat_h, feat_w), mask_stride, cfg.mask_thr)?;
    tracing::debug!(detections = scores.len(), "decoded image");
    Ok(Some(SegResult::new(masks, labels, scores)))
}

/// Upsample mask probabilities [K, H, W] to the padded input, crop the valid region,
/// resize to the original image and binarize.
///
/// # Returns
/// U8 masks [K, ori_h, ori_w]
pub fn resize_to_original(
    probs: &Tensor,
    meta: &ImageMeta,
    feat_size: (usize, usize),
    mask_stride: usize,
    mask_thr: f32,
) -> Result<Tensor> {
    let (up_h, up_w) = (feat_size.0 * mask_stride, feat_size.1 * mask_stride);
    let (img_h, img_w) = meta.img_shape;
    let (ori_h, ori_w) = meta.ori_shape;

    let upsampled = probs
        .unsqueeze(0)?
        .upsample_bilinear2d(up_h, up_w, false)?;
    let cropped = upsampled
        .narrow(2, 0, img_h.min(up_h))?
        .narrow(3, 0, img_w.min(up_w))?
        .contiguous()?;
    cropped
        .upsample_bilinear2d(ori_h, ori_w, false)?
        .squeeze(0)?
        .gt(mask_thr as f64)
}
