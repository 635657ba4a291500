//! Segmentation output structures
//!
//! `SegResult` holds the binary masks, labels and scores of one image;
//! `SegmentedInstance` is a per-instance summary for reporting.

use std::fmt;

use candle_core::{DType, Result, Tensor};

use crate::coco_classes;

/// Detections of one image, sorted by descending score
#[derive(Debug, Clone)]
pub struct SegResult {
    /// Binary masks [K, H0, W0] at the original image size, u8
    pub masks: Tensor,
    /// Class channel index per mask
    pub labels: Vec<u32>,
    /// Score per mask after Matrix NMS
    pub scores: Vec<f32>,
}

impl SegResult {
    pub fn new(masks: Tensor, labels: Vec<u32>, scores: Vec<f32>) -> Self {
        Self {
            masks,
            labels,
            scores,
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Per-instance summaries with mask area and bounding box
    pub fn instances(&self) -> Result<Vec<SegmentedInstance>> {
        let (k, _h, _w) = self.masks.dims3()?;
        if k != self.len() || self.labels.len() != self.len() {
            candle_core::bail!(
                "{k} masks for {} labels and {} scores",
                self.labels.len(),
                self.scores.len()
            )
        }
        let mut instances = Vec::with_capacity(k);
        for idx in 0..k {
            let mask = self.masks.get(idx)?;
            let (bbox, area) = mask_bbox(&mask)?;
            instances.push(SegmentedInstance {
                label: self.labels[idx],
                score: self.scores[idx],
                area,
                bbox,
            });
        }
        Ok(instances)
    }
}

/// Tight box [x1, y1, x2, y2] (exclusive end) and pixel count of a binary mask [H, W].
/// An empty mask gives a zero box.
pub fn mask_bbox(mask: &Tensor) -> Result<([f32; 4], usize)> {
    let mask = mask.ne(0u8)?.to_dtype(DType::U32)?;
    let area = mask.sum_all()?.to_scalar::<u32>()? as usize;
    let rows: Vec<u32> = mask.max(1)?.to_vec1()?;
    let cols: Vec<u32> = mask.max(0)?.to_vec1()?;

    let span = |v: &[u32]| -> Option<(usize, usize)> {
        let first = v.iter().position(|&x| x > 0)?;
        let last = v.iter().rposition(|&x| x > 0)?;
        Some((first, last + 1))
    };
    match (span(&cols), span(&rows)) {
        (Some((x1, x2)), Some((y1, y2))) => {
            Ok(([x1 as f32, y1 as f32, x2 as f32, y2 as f32], area))
        }
        _ => Ok(([0.0; 4], area)),
    }
}

/// Summary of one segmented instance
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedInstance {
    /// Class channel index
    pub label: u32,
    /// Confidence score (0.0 to 1.0)
    pub score: f32,
    /// Number of mask pixels
    pub area: usize,
    /// Mask bounding box in [x1, y1, x2, y2] pixel coordinates of the original image
    pub bbox: [f32; 4],
}

impl SegmentedInstance {
    pub fn class_name(&self) -> &'static str {
        coco_classes::get_class_name(self.label)
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

impl fmt::Display for SegmentedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance {{ label: {} ({}), score: {:.2}, area: {}, bbox: [{:.1}, {:.1}, {:.1}, {:.1}] }}",
            self.label,
            self.class_name(),
            self.score,
            self.area,
            self.bbox[0],
            self.bbox[1],
            self.bbox[2],
            self.bbox[3]
        )
    }
}
