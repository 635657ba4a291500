//! SOLOv2 Head
//!
//! Batch-level entry points of the head. The upstream network provides, per level, a
//! class map `[B, C, S, S]` and a kernel map `[B, K, S, S]`, plus one shared mask
//! feature map `[B, K, H, W]`. Training turns these into the dice and focal losses,
//! inference into per-image segmentation results.

pub mod assign;
pub mod dynamic_conv;
pub mod inference;
pub mod loss;
pub mod matrix_nms;

use candle_core::{Result, Tensor};

use crate::config::{GridLevels, SoloConfig};
use crate::detection::SegResult;
use assign::{GridAssigner, Instance};
use dynamic_conv::decode_cells;
use inference::{decode_image, points_nms, ImageMeta};
use loss::{class_loss, mask_loss, LossOutput};

/// SOLOv2 head post-network logic
pub struct SoloHead {
    /// Head configuration
    pub config: SoloConfig,

    /// Cumulative cell offsets of the grid levels
    levels: GridLevels,

    /// Ground-truth to grid assignment
    assigner: GridAssigner,
}

impl SoloHead {
    /// Create a head from a validated configuration
    pub fn new(config: SoloConfig) -> Result<Self> {
        config.validate()?;
        let levels = config.grid_levels();
        let assigner = GridAssigner::new(&config.levels, config.sigma, config.mask_stride);
        Ok(Self {
            config,
            levels,
            assigner,
        })
    }

    /// Check per-level maps laid out as [B, channels, S, S] against the configuration
    fn check_level_maps(&self, name: &str, maps: &[Tensor], channels: usize) -> Result<usize> {
        if maps.len() != self.config.num_levels() {
            candle_core::bail!(
                "expected {} {name} maps, got {}",
                self.config.num_levels(),
                maps.len()
            )
        }
        let mut batch = None;
        for (idx, (map, level)) in maps.iter().zip(self.config.levels.iter()).enumerate() {
            let (b, c, s1, s2) = map.dims4()?;
            if c != channels || s1 != level.num_grid || s2 != level.num_grid {
                candle_core::bail!(
                    "{name} map {idx}: expected [B, {channels}, {g}, {g}], got {:?}",
                    map.dims(),
                    g = level.num_grid
                )
            }
            match batch {
                Some(prev) if prev != b => {
                    candle_core::bail!("{name} map {idx}: batch {b} differs from {prev}")
                }
                _ => batch = Some(b),
            }
        }
        Ok(batch.unwrap_or(0))
    }

    /// Check the shared mask features [B, K, H, W] and return (h, w)
    fn check_mask_feat(&self, mask_feat: &Tensor, batch: usize) -> Result<(usize, usize)> {
        let (b, k, h, w) = mask_feat.dims4()?;
        if b != batch || k != self.config.kernel_channels {
            candle_core::bail!(
                "mask features: expected [{batch}, {}, H, W], got {:?}",
                self.config.kernel_channels,
                mask_feat.dims()
            )
        }
        Ok((h, w))
    }

    /// Class probabilities for inference.
    ///
    /// Applies sigmoid and point NMS to every level and moves classes last.
    ///
    /// # Arguments
    /// * `cate_logits` - Per level class logits [B, C, S, S]
    ///
    /// # Returns
    /// Per level probabilities [B, S, S, C]
    pub fn eval_category_scores(&self, cate_logits: &[Tensor]) -> Result<Vec<Tensor>> {
        self.check_level_maps("category", cate_logits, self.config.cate_channels())?;
        cate_logits
            .iter()
            .map(|logits| {
                let probs = candle_nn::ops::sigmoid(logits)?;
                points_nms(&probs)?.permute((0, 2, 3, 1))?.contiguous()
            })
            .collect()
    }

    /// Training losses of a batch.
    ///
    /// # Arguments
    /// * `cate_logits` - Per level class logits [B, C, S, S]
    /// * `kernel_preds` - Per level kernel maps [B, K, S, S]
    /// * `mask_feat` - Shared mask features [B, K, H, W]
    /// * `gt` - Ground-truth instances of every image
    pub fn loss(
        &self,
        cate_logits: &[Tensor],
        kernel_preds: &[Tensor],
        mask_feat: &Tensor,
        gt: &[Vec<Instance>],
    ) -> Result<LossOutput> {
        let batch = self.check_level_maps("category", cate_logits, self.config.cate_channels())?;
        let kernel_batch =
            self.check_level_maps("kernel", kernel_preds, self.config.kernel_channels)?;
        if kernel_batch != batch || gt.len() != batch {
            candle_core::bail!(
                "batch mismatch: {batch} category, {kernel_batch} kernel, {} ground truth",
                gt.len()
            )
        }
        let feat_size = self.check_mask_feat(mask_feat, batch)?;

        let assignments = gt
            .iter()
            .map(|instances| self.assigner.assign(instances, feat_size))
            .collect::<Result<Vec<_>>>()?;

        // Decoded masks and targets, concatenated per level over the batch
        let mut pairs = Vec::with_capacity(self.config.num_levels());
        let mut labels = Vec::with_capacity(self.levels.total_cells() * batch);
        let mut num_positive = 0;
        for (level_idx, kernel_map) in kernel_preds.iter().enumerate() {
            let mut logits = Vec::new();
            let mut targets = Vec::new();
            for (img_idx, per_level) in assignments.iter().enumerate() {
                let assignment = &per_level[level_idx];
                labels.extend_from_slice(&assignment.category_grid);
                num_positive += assignment.num_positive_cells();

                let decoded = decode_cells(
                    &kernel_map.get(img_idx)?,
                    &assignment.grid_order,
                    &mask_feat.get(img_idx)?,
                )?;
                if let (Some(decoded), Some(stacked)) = (decoded, assignment.stacked_targets()?) {
                    logits.push(decoded);
                    targets.push(stacked);
                }
            }
            if !logits.is_empty() {
                pairs.push((Tensor::cat(&logits, 0)?, Tensor::cat(&targets, 0)?));
            }
        }
        tracing::debug!(
            levels_with_entries = pairs.len(),
            num_positive,
            "assigned batch"
        );

        let loss_ins = mask_loss(
            &pairs,
            self.config.ins_loss_weight as f64,
            mask_feat.device(),
        )?;
        let loss_cate = class_loss(
            cate_logits,
            &labels,
            self.config.focal_gamma as f64,
            self.config.ignore_index,
        )?;
        Ok(LossOutput {
            loss_ins,
            loss_cate,
        })
    }

    /// Segmentation results of a batch.
    ///
    /// # Arguments
    /// * `cate_scores` - Per level class probabilities [B, S, S, C], see `eval_category_scores`
    /// * `kernel_preds` - Per level kernel maps [B, K, S, S]
    /// * `mask_feat` - Shared mask features [B, K, H, W]
    /// * `metas` - Geometry of every image
    ///
    /// # Returns
    /// One entry per image, `None` when nothing was detected
    pub fn get_seg(
        &self,
        cate_scores: &[Tensor],
        kernel_preds: &[Tensor],
        mask_feat: &Tensor,
        metas: &[ImageMeta],
    ) -> Result<Vec<Option<SegResult>>> {
        let batch = self.check_level_maps("kernel", kernel_preds, self.config.kernel_channels)?;
        if cate_scores.len() != self.config.num_levels() {
            candle_core::bail!(
                "expected {} category maps, got {}",
                self.config.num_levels(),
                cate_scores.len()
            )
        }
        for (idx, (scores, level)) in cate_scores.iter().zip(self.config.levels.iter()).enumerate()
        {
            let expected = [batch, level.num_grid, level.num_grid, self.config.cate_channels()];
            if scores.dims() != expected {
                candle_core::bail!(
                    "category scores {idx}: expected {expected:?}, got {:?}",
                    scores.dims()
                )
            }
        }
        if metas.len() != batch {
            candle_core::bail!("{} image metas for a batch of {batch}", metas.len())
        }
        self.check_mask_feat(mask_feat, batch)?;

        let num_classes = self.config.cate_channels();
        let kernel_channels = self.config.kernel_channels;
        let mut results = Vec::with_capacity(batch);
        for (img_idx, meta) in metas.iter().enumerate() {
            let mut scores = Vec::with_capacity(cate_scores.len());
            let mut kernels = Vec::with_capacity(kernel_preds.len());
            for (level_scores, level_kernels) in cate_scores.iter().zip(kernel_preds.iter()) {
                scores.push(level_scores.get(img_idx)?.reshape(((), num_classes))?);
                kernels.push(
                    level_kernels
                        .get(img_idx)?
                        .permute((1, 2, 0))?
                        .reshape(((), kernel_channels))?,
                );
            }
            let result = decode_image(
                &Tensor::cat(&scores, 0)?,
                &Tensor::cat(&kernels, 0)?,
                &mask_feat.get(img_idx)?,
                meta,
                &self.levels,
                self.config.mask_stride,
                &self.config.test,
            )?;
            tracing::debug!(
                image = img_idx,
                detections = result.as_ref().map_or(0, |r| r.len()),
                "segmented image"
            );
            results.push(result);
        }
        Ok(results)
    }

    /// Full inference from raw class logits: `eval_category_scores` then `get_seg`
    pub fn segment(
        &self,
        cate_logits: &[Tensor],
        kernel_preds: &[Tensor],
        mask_feat: &Tensor,
        metas: &[ImageMeta],
    ) -> Result<Vec<Option<SegResult>>> {
        let cate_scores = self.eval_category_scores(cate_logits)?;
        self.get_seg(&cate_scores, kernel_preds, mask_feat, metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridLevel;
    use candle_core::{DType, Device};

    /// Two levels, 3 classes (2 channels), 2 kernel channels
    fn tiny_config() -> SoloConfig {
        SoloConfig {
            num_classes: 3,
            levels: vec![
                GridLevel::new(4, 8, (1.0, 24.0)),
                GridLevel::new(2, 16, (16.0, 64.0)),
            ],
            sigma: 0.2,
            kernel_channels: 2,
            mask_stride: 4,
            ins_loss_weight: 3.0,
            focal_gamma: 2.0,
            ignore_index: None,
            test: Default::default(),
        }
    }

    fn square_instance(label: u32, y0: usize, y1: usize, x0: usize, x1: usize) -> Instance {
        let mut data = vec![0u8; 32 * 32];
        for y in y0..y1 {
            for x in x0..x1 {
                data[y * 32 + x] = 1;
            }
        }
        let mask = Tensor::from_vec(data, (32, 32), &Device::Cpu).unwrap();
        Instance::new(
            [x0 as f32, y0 as f32, x1 as f32, y1 as f32],
            label,
            mask,
        )
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_loss_with_and_without_positives() {
        let head = SoloHead::new(tiny_config()).unwrap();
        let cate = vec![zeros(&[2, 2, 4, 4]), zeros(&[2, 2, 2, 2])];
        let kernels = vec![zeros(&[2, 2, 4, 4]), zeros(&[2, 2, 2, 2])];
        let mask_feat = zeros(&[2, 2, 8, 8]);

        // image 0: one 20px instance (hits both levels), image 1: nothing
        let gt = vec![vec![square_instance(1, 4, 24, 4, 24)], vec![]];
        let out = head.loss(&cate, &kernels, &mask_feat, &gt).unwrap();
        let (loss_ins, loss_cate) = out.to_scalars().unwrap();
        // zero kernels decode to p = 0.5 everywhere, so the dice loss is positive
        assert!(loss_ins > 0.0);
        // uniform softmax over 2 channels: -(0.5^2) * ln(0.5) per cell
        let expected = -(0.25f32 * 0.5f32.ln());
        assert!((loss_cate - expected).abs() < 1e-5, "{loss_cate}");

        let empty = vec![vec![], vec![]];
        let out = head.loss(&cate, &kernels, &mask_feat, &empty).unwrap();
        let (loss_ins, _) = out.to_scalars().unwrap();
        assert_eq!(loss_ins, 0.0);
    }

    #[test]
    fn test_loss_rejects_wrong_grid() {
        let head = SoloHead::new(tiny_config()).unwrap();
        let cate = vec![zeros(&[1, 2, 5, 5]), zeros(&[1, 2, 2, 2])];
        let kernels = vec![zeros(&[1, 2, 4, 4]), zeros(&[1, 2, 2, 2])];
        let mask_feat = zeros(&[1, 2, 8, 8]);
        assert!(head.loss(&cate, &kernels, &mask_feat, &[vec![]]).is_err());

        let cate = vec![zeros(&[1, 2, 4, 4])];
        assert!(head.loss(&cate, &kernels, &mask_feat, &[vec![]]).is_err());
    }

    #[test]
    fn test_eval_category_scores_layout() {
        let head = SoloHead::new(tiny_config()).unwrap();
        let cate = vec![zeros(&[1, 2, 4, 4]), zeros(&[1, 2, 2, 2])];
        let scores = head.eval_category_scores(&cate).unwrap();
        assert_eq!(scores[0].dims(), &[1, 4, 4, 2]);
        assert_eq!(scores[1].dims(), &[1, 2, 2, 2]);
        // sigmoid(0) everywhere, every cell ties with its window max
        let values: Vec<f32> = scores[0].flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_segment_finds_single_instance() {
        let device = Device::Cpu;
        let head = SoloHead::new(tiny_config()).unwrap();

        // channel 0 is high on the top-left 4x4 block of the 8x8 features
        let mut feat = vec![-10f32; 2 * 8 * 8];
        for y in 0..4 {
            for x in 0..4 {
                feat[y * 8 + x] = 10.0;
            }
        }
        let mask_feat = Tensor::from_vec(feat, (1, 2, 8, 8), &device).unwrap();

        // level 0, cell (1, 1) predicts class 1 with kernel [1, 0]
        let mut cate0 = vec![-10f32; 2 * 4 * 4];
        cate0[16 + 4 + 1] = 5.0;
        let cate0 = Tensor::from_vec(cate0, (1, 2, 4, 4), &device).unwrap();
        let cate1 = Tensor::full(-10f32, (1, 2, 2, 2), &device).unwrap();
        let mut kern0 = vec![0f32; 2 * 4 * 4];
        kern0[4 + 1] = 1.0;
        let kern0 = Tensor::from_vec(kern0, (1, 2, 4, 4), &device).unwrap();
        let kern1 = zeros(&[1, 2, 2, 2]);

        let meta = ImageMeta::new((32, 32), (64, 64), 2.0);
        let results = head
            .segment(&[cate0, cate1], &[kern0, kern1], &mask_feat, &[meta])
            .unwrap();
        let result = results[0].as_ref().unwrap();
        assert_eq!(result.labels, vec![1]);
        assert_eq!(result.masks.dims(), &[1, 64, 64]);

        let instances = result.instances().unwrap();
        assert_eq!(instances[0].bbox, [0.0, 0.0, 32.0, 32.0]);
    }
}
