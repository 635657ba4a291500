//! SOLOv2 Head Configuration
//!
//! This module defines the grid levels, loss constants and inference thresholds
//! for the SOLOv2 head. Configurations are plain values passed into every call.

use std::path::Path;

use candle_core::Result;
use serde::{Deserialize, Serialize};

use crate::head::matrix_nms::{DecayKernel, NmsScope};

/// One pyramid level of the SOLO grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Number of cells along each side of the `num_grid x num_grid` lattice
    pub num_grid: usize,
    /// Feature stride of the level, also the minimum mask area at inference
    pub stride: usize,
    /// Inclusive range of `sqrt(w * h)` of the instances handled by this level
    pub scale_range: (f32, f32),
}

impl GridLevel {
    pub fn new(num_grid: usize, stride: usize, scale_range: (f32, f32)) -> Self {
        Self {
            num_grid,
            stride,
            scale_range,
        }
    }

    /// Number of cells in the level
    pub fn num_cells(&self) -> usize {
        self.num_grid * self.num_grid
    }

    /// Whether an instance of the given scale is assigned to this level
    pub fn accepts(&self, scale: f32) -> bool {
        let (low, high) = self.scale_range;
        scale >= low && scale <= high
    }
}

/// Multi-level grid layout with cumulative cell offsets.
///
/// Flattened per-image predictions concatenate the levels in order, so a flat cell
/// index belongs to the level whose `[offsets[l], offsets[l + 1])` range contains it.
#[derive(Debug, Clone)]
pub struct GridLevels {
    levels: Vec<GridLevel>,
    offsets: Vec<usize>,
}

impl GridLevels {
    pub fn new(levels: &[GridLevel]) -> Self {
        let mut offsets = Vec::with_capacity(levels.len() + 1);
        offsets.push(0);
        let mut total = 0;
        for level in levels {
            total += level.num_cells();
            offsets.push(total);
        }
        Self {
            levels: levels.to_vec(),
            offsets,
        }
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    /// Cumulative cell offsets, `len() == levels().len() + 1`
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Total number of cells over all levels
    pub fn total_cells(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// Level index owning a flat cell index, `None` when out of range
    pub fn level_of(&self, cell: usize) -> Option<usize> {
        if cell >= self.total_cells() {
            return None;
        }
        // First offset strictly greater than `cell`, minus one.
        Some(self.offsets.partition_point(|&o| o <= cell) - 1)
    }

    /// Stride of the level owning a flat cell index
    pub fn stride_of(&self, cell: usize) -> Option<usize> {
        self.level_of(cell).map(|l| self.levels[l].stride)
    }
}

/// Inference thresholds (the `test_cfg` of the head)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Maximum number of candidates kept before Matrix NMS
    pub nms_pre: usize,
    /// Minimum class probability for a (cell, class) candidate
    pub score_thr: f32,
    /// Binarization threshold for mask probabilities
    pub mask_thr: f32,
    /// Minimum score after Matrix NMS decay
    pub update_thr: f32,
    /// Matrix NMS decay kernel
    pub kernel: DecayKernel,
    /// Matrix NMS gaussian parameter, `decay = exp(-iou^2 / sigma)`
    pub sigma: f32,
    /// Whether suppression only happens between candidates of the same class
    pub scope: NmsScope,
    /// Maximum number of detections per image
    pub max_per_img: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            nms_pre: 500,
            score_thr: 0.1,
            mask_thr: 0.5,
            update_thr: 0.05,
            kernel: DecayKernel::Gaussian,
            sigma: 0.5,
            scope: NmsScope::PerClass,
            max_per_img: 100,
        }
    }
}

/// Configuration for the SOLOv2 head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoloConfig {
    /// Number of classes including background; class maps carry `num_classes - 1` channels
    pub num_classes: usize,
    /// Grid levels, from the finest to the coarsest
    pub levels: Vec<GridLevel>,
    /// Shrink factor of the instance box used to bound the positive footprint
    pub sigma: f32,
    /// Channels of the dynamic kernels and of the shared mask features
    pub kernel_channels: usize,
    /// Stride between the input image and the shared mask features
    pub mask_stride: usize,
    /// Weight of the dice loss
    pub ins_loss_weight: f32,
    /// Focusing parameter of the classification focal loss
    pub focal_gamma: f32,
    /// Category label excluded from the classification loss
    pub ignore_index: Option<u32>,
    /// Inference thresholds
    #[serde(default)]
    pub test: InferenceConfig,
}

impl Default for SoloConfig {
    fn default() -> Self {
        Self::r50()
    }
}

impl SoloConfig {
    /// SOLOv2 with the standard five-level grid (ResNet-50/101 heads)
    pub fn r50() -> Self {
        Self {
            num_classes: 81,
            levels: vec![
                GridLevel::new(40, 8, (1.0, 96.0)),
                GridLevel::new(36, 8, (48.0, 192.0)),
                GridLevel::new(24, 16, (96.0, 384.0)),
                GridLevel::new(16, 32, (192.0, 768.0)),
                GridLevel::new(12, 32, (384.0, 2048.0)),
            ],
            sigma: 0.2,
            kernel_channels: 256,
            mask_stride: 4,
            ins_loss_weight: 3.0,
            focal_gamma: 2.0,
            ignore_index: Some(80),
            test: InferenceConfig::default(),
        }
    }

    /// SOLOv2-light for 448px inputs (ResNet-18/34 heads)
    pub fn light_448() -> Self {
        Self {
            levels: vec![
                GridLevel::new(40, 8, (1.0, 56.0)),
                GridLevel::new(36, 8, (28.0, 112.0)),
                GridLevel::new(24, 16, (56.0, 224.0)),
                GridLevel::new(16, 32, (112.0, 448.0)),
                GridLevel::new(12, 32, (224.0, 896.0)),
            ],
            kernel_channels: 128,
            ..Self::r50()
        }
    }

    /// Load a configuration from a JSON file and validate it
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of channels of the per-level class maps
    pub fn cate_channels(&self) -> usize {
        self.num_classes.saturating_sub(1)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn grid_levels(&self) -> GridLevels {
        GridLevels::new(&self.levels)
    }

    /// Check the configuration for values the head cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            candle_core::bail!("at least one grid level is required")
        }
        if self.num_classes < 2 {
            candle_core::bail!("num_classes must include background and one class")
        }
        if self.kernel_channels == 0 || self.mask_stride == 0 {
            candle_core::bail!("kernel_channels and mask_stride must be positive")
        }
        for (idx, level) in self.levels.iter().enumerate() {
            if level.num_grid == 0 || level.stride == 0 {
                candle_core::bail!("level {idx}: num_grid and stride must be positive")
            }
            let (low, high) = level.scale_range;
            if low > high {
                candle_core::bail!("level {idx}: scale range ({low}, {high}) is inverted")
            }
        }
        if self.sigma < 0.0 {
            candle_core::bail!("sigma must be non-negative, got {}", self.sigma)
        }
        if let Some(ignore) = self.ignore_index {
            if ignore as usize > self.cate_channels() {
                candle_core::bail!(
                    "ignore_index {ignore} is outside the {} class channels",
                    self.cate_channels()
                )
            }
        }
        if self.test.kernel == DecayKernel::Gaussian && self.test.sigma <= 0.0 {
            candle_core::bail!("gaussian matrix nms needs a positive sigma")
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        SoloConfig::r50().validate().unwrap();
        SoloConfig::light_448().validate().unwrap();
        assert_eq!(SoloConfig::r50().cate_channels(), 80);
        assert_eq!(SoloConfig::light_448().kernel_channels, 128);
    }

    #[test]
    fn test_grid_offsets() {
        let levels = SoloConfig::r50().grid_levels();
        assert_eq!(levels.offsets(), &[0, 1600, 2896, 3472, 3728, 3872]);
        assert_eq!(levels.total_cells(), 3872);
    }

    #[test]
    fn test_level_of_boundaries() {
        let levels = GridLevels::new(&[
            GridLevel::new(2, 8, (0.0, 10.0)),
            GridLevel::new(3, 16, (5.0, 20.0)),
        ]);
        assert_eq!(levels.level_of(0), Some(0));
        assert_eq!(levels.level_of(3), Some(0));
        assert_eq!(levels.level_of(4), Some(1));
        assert_eq!(levels.level_of(12), Some(1));
        assert_eq!(levels.level_of(13), None);
        assert_eq!(levels.stride_of(4), Some(16));
    }

    #[test]
    fn test_scale_range_is_inclusive() {
        let level = GridLevel::new(4, 8, (16.0, 64.0));
        assert!(level.accepts(16.0));
        assert!(level.accepts(64.0));
        assert!(!level.accepts(64.5));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = SoloConfig::r50();
        config.levels[0].scale_range = (100.0, 10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let config = SoloConfig::light_448();
        let json = serde_json::to_string(&config).unwrap();
        let back: SoloConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        // `test` falls back to the default thresholds when omitted
        let mut value = serde_json::to_value(&config).unwrap();
        value.as_object_mut().unwrap().remove("test");
        let back: SoloConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.test, InferenceConfig::default());
    }
}
