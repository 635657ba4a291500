//! Ground-truth assignment to the SOLO grids.
//!
//! For every level, an instance whose scale `sqrt(w * h)` falls in the level's range is
//! assigned to the cells around its mass center. The footprint is the box shrunk by
//! `sigma`, restricted to at most one cell away from the center cell. Each assigned cell
//! gets the instance label in the category grid and the instance mask, rescaled to the
//! mask feature resolution, as its target.

use candle_core::{DType, Result, Tensor};

use crate::config::GridLevel;

/// A ground-truth instance of one image
#[derive(Debug, Clone)]
pub struct Instance {
    /// Box in [x1, y1, x2, y2] input pixel coordinates
    pub bbox: [f32; 4],
    /// Category label written into the category grid
    pub label: u32,
    /// Binary mask at input resolution, shape [H, W]
    pub mask: Tensor,
}

impl Instance {
    pub fn new(bbox: [f32; 4], label: u32, mask: Tensor) -> Self {
        Self { bbox, label, mask }
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }

    /// Geometric mean of the box sides, used to pick pyramid levels
    pub fn scale(&self) -> f32 {
        (self.width() * self.height()).sqrt()
    }
}

/// Inclusive cell rectangle covered by one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Footprint {
    /// Row-major `(row, col)` cells of the footprint
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (self.top..=self.bottom).flat_map(move |i| (self.left..=self.right).map(move |j| (i, j)))
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        (self.top..=self.bottom).contains(&row) && (self.left..=self.right).contains(&col)
    }
}

/// Cell index of a normalized coordinate, `normalized // (1 / num_grid)`.
///
/// Uses the rounding of float `divmod` (quotient from the remainder), which can land
/// one cell lower than `floor(normalized * num_grid)` on exact cell boundaries.
pub fn grid_cell(normalized: f64, num_grid: usize) -> i64 {
    let cell = 1.0 / num_grid as f64;
    let rem = normalized % cell;
    let mut div = (normalized - rem) / cell;
    if rem < 0.0 {
        div -= 1.0;
    }
    let mut floor = div.floor();
    if div - floor > 0.5 {
        floor += 1.0;
    }
    floor as i64
}

/// Compute the positive footprint of an instance on a `num_grid x num_grid` lattice.
///
/// # Arguments
/// * `center` - Mass center (y, x) in input pixels
/// * `half_extent` - Shrunk half height and half width in input pixels
/// * `image_size` - Padded input size (h, w) the grid spans
/// * `num_grid` - Grid resolution
pub fn footprint(
    center: (f64, f64),
    half_extent: (f32, f32),
    image_size: (usize, usize),
    num_grid: usize,
) -> Footprint {
    let last = num_grid as i64 - 1;
    let cell = |coord: f64, size: usize| grid_cell(coord / size as f64, num_grid);
    let (cy, cx) = center;
    let (half_h, half_w) = (half_extent.0 as f64, half_extent.1 as f64);
    let (img_h, img_w) = image_size;

    let coord_h = cell(cy, img_h).clamp(0, last);
    let coord_w = cell(cx, img_w).clamp(0, last);

    let top_box = cell(cy - half_h, img_h).max(0);
    let down_box = cell(cy + half_h, img_h).min(last);
    let left_box = cell(cx - half_w, img_w).max(0);
    let right_box = cell(cx + half_w, img_w).min(last);

    let top = top_box.max(coord_h - 1);
    let down = down_box.min(coord_h + 1);
    let left = left_box.max(coord_w - 1);
    let right = right_box.min(coord_w + 1);

    Footprint {
        top: top.clamp(0, last) as usize,
        bottom: down.clamp(0, last) as usize,
        left: left.clamp(0, last) as usize,
        right: right.clamp(0, last) as usize,
    }
}

/// Mass center (y, x) of a mask in pixel index coordinates, `None` for an empty mask.
///
/// Row and column pixel counts are reduced on the device, the index-weighted sums are
/// accumulated in f64.
pub fn center_of_mass(mask: &Tensor) -> Result<Option<(f64, f64)>> {
    mask.dims2()?;
    let mask = mask.to_dtype(DType::F32)?;
    let row_counts = mask.sum(1)?.to_vec1::<f32>()?;
    let col_counts = mask.sum(0)?.to_vec1::<f32>()?;
    let total: f64 = row_counts.iter().map(|&c| c as f64).sum();
    if total <= 0.0 {
        return Ok(None);
    }
    let weighted_mean = |counts: &[f32]| {
        counts
            .iter()
            .enumerate()
            .map(|(i, &c)| i as f64 * c as f64)
            .sum::<f64>()
            / total
    };
    Ok(Some((weighted_mean(&row_counts), weighted_mean(&col_counts))))
}

/// Rescale an input-resolution mask by `1 / stride` and paste it into the top-left
/// corner of a zero mask of the feature size.
///
/// # Returns
/// U8 mask of shape [feat_h, feat_w]
pub fn rescale_mask(mask: &Tensor, stride: usize, feat_size: (usize, usize)) -> Result<Tensor> {
    let (h, w) = mask.dims2()?;
    let (feat_h, feat_w) = feat_size;
    let scale = 1.0 / stride as f64;
    let new_h = ((h as f64 * scale + 0.5) as usize).max(1);
    let new_w = ((w as f64 * scale + 0.5) as usize).max(1);

    let resized = mask
        .to_dtype(DType::F32)?
        .reshape((1, 1, h, w))?
        .upsample_bilinear2d(new_h, new_w, false)?
        .reshape((new_h, new_w))?
        .ge(0.5)?;

    let resized = resized.narrow(0, 0, new_h.min(feat_h))?;
    let resized = resized.narrow(1, 0, new_w.min(feat_w))?;
    let resized = resized.pad_with_zeros(0, 0, feat_h.saturating_sub(new_h))?;
    resized.pad_with_zeros(1, 0, feat_w.saturating_sub(new_w))
}

/// Targets of one image on one grid level
#[derive(Debug, Clone)]
pub struct LevelAssignment {
    pub num_grid: usize,
    /// Row-major `num_grid x num_grid` labels, 0 for background
    pub category_grid: Vec<u32>,
    /// Row-major positive cell indicator
    pub positive: Vec<bool>,
    /// Flat cell index of every (instance, cell) pair, in assignment order
    pub grid_order: Vec<u32>,
    /// Target mask [feat_h, feat_w] of every entry of `grid_order`
    pub targets: Vec<Tensor>,
}

impl LevelAssignment {
    pub fn empty(num_grid: usize) -> Self {
        Self {
            num_grid,
            category_grid: vec![0; num_grid * num_grid],
            positive: vec![false; num_grid * num_grid],
            grid_order: Vec::new(),
            targets: Vec::new(),
        }
    }

    /// Number of (instance, cell) entries
    pub fn num_entries(&self) -> usize {
        self.grid_order.len()
    }

    /// Number of distinct positive cells
    pub fn num_positive_cells(&self) -> usize {
        self.positive.iter().filter(|&&p| p).count()
    }

    pub fn label_at(&self, row: usize, col: usize) -> u32 {
        self.category_grid[row * self.num_grid + col]
    }

    /// Stacked target masks [n, feat_h, feat_w], `None` without entries
    pub fn stacked_targets(&self) -> Result<Option<Tensor>> {
        if self.targets.is_empty() {
            return Ok(None);
        }
        Tensor::stack(&self.targets, 0).map(Some)
    }

    fn assign(&mut self, footprint: &Footprint, label: u32, target: &Tensor) {
        for (i, j) in footprint.cells() {
            let cell = i * self.num_grid + j;
            // Overlapping footprints overwrite the label; the earlier mask entry stays.
            self.category_grid[cell] = label;
            self.positive[cell] = true;
            self.grid_order.push(cell as u32);
            self.targets.push(target.clone());
        }
    }
}

/// Assigns the ground truth of one image to every grid level
#[derive(Debug, Clone)]
pub struct GridAssigner {
    levels: Vec<GridLevel>,
    sigma: f32,
    mask_stride: usize,
}

impl GridAssigner {
    pub fn new(levels: &[GridLevel], sigma: f32, mask_stride: usize) -> Self {
        Self {
            levels: levels.to_vec(),
            sigma,
            mask_stride,
        }
    }

    /// Build the per-level targets of one image.
    ///
    /// # Arguments
    /// * `instances` - Ground truth of the image
    /// * `feat_size` - Size (h, w) of the shared mask features
    pub fn assign(
        &self,
        instances: &[Instance],
        feat_size: (usize, usize),
    ) -> Result<Vec<LevelAssignment>> {
        let image_size = (feat_size.0 * self.mask_stride, feat_size.1 * self.mask_stride);

        // Mass centers and rescaled masks are shared by all levels an instance hits
        let mut prepared: Vec<Option<((f64, f64), Tensor)>> = vec![None; instances.len()];

        let mut assignments = Vec::with_capacity(self.levels.len());
        for (level_idx, level) in self.levels.iter().enumerate() {
            let mut assignment = LevelAssignment::empty(level.num_grid);

            for (idx, instance) in instances.iter().enumerate() {
                if !level.accepts(instance.scale()) {
                    continue;
                }
                if prepared[idx].is_none() {
                    let Some(center) = center_of_mass(&instance.mask)? else {
                        continue;
                    };
                    let target = rescale_mask(&instance.mask, self.mask_stride, feat_size)?;
                    prepared[idx] = Some((center, target));
                }
                let Some((center, target)) = &prepared[idx] else {
                    continue;
                };

                let half_extent = (
                    0.5 * instance.height() * self.sigma,
                    0.5 * instance.width() * self.sigma,
                );
                let fp = footprint(*center, half_extent, image_size, level.num_grid);
                tracing::trace!(
                    level = level_idx,
                    label = instance.label,
                    ?fp,
                    "assigned instance"
                );
                assignment.assign(&fp, instance.label, target);
            }

            tracing::trace!(
                level = level_idx,
                entries = assignment.num_entries(),
                "level assignment done"
            );
            assignments.push(assignment);
        }
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Square mask covering [y0, y1) x [x0, x1) of an h x w image
    fn rect_mask(h: usize, w: usize, y0: usize, y1: usize, x0: usize, x1: usize) -> Tensor {
        let mut data = vec![0u8; h * w];
        for y in y0..y1 {
            for x in x0..x1 {
                data[y * w + x] = 1;
            }
        }
        Tensor::from_vec(data, (h, w), &Device::Cpu).unwrap()
    }

    fn rect_instance(label: u32, y0: usize, y1: usize, x0: usize, x1: usize) -> Instance {
        Instance::new(
            [x0 as f32, y0 as f32, x1 as f32, y1 as f32],
            label,
            rect_mask(64, 64, y0, y1, x0, x1),
        )
    }

    fn single_level(sigma: f32) -> GridAssigner {
        GridAssigner::new(&[GridLevel::new(4, 8, (16.0, 64.0))], sigma, 4)
    }

    fn positive_cells(assignment: &LevelAssignment) -> Vec<(usize, usize)> {
        (0..assignment.num_grid * assignment.num_grid)
            .filter(|&k| assignment.positive[k])
            .map(|k| (k / assignment.num_grid, k % assignment.num_grid))
            .collect()
    }

    #[test]
    fn test_zero_shrink_gives_center_cell() {
        // 32x32 box, mass center (39.5, 39.5) on a 64x64 input -> cell (2, 2)
        let instance = rect_instance(5, 24, 56, 24, 56);
        assert!((instance.scale() - 32.0).abs() < 1e-6);

        let levels = single_level(0.0).assign(&[instance], (16, 16)).unwrap();
        let level = &levels[0];
        assert_eq!(positive_cells(level), vec![(2, 2)]);
        assert_eq!(level.grid_order, vec![10]);
        assert_eq!(level.label_at(2, 2), 5);
        assert_eq!(level.category_grid.iter().filter(|&&l| l != 0).count(), 1);
    }

    #[test]
    fn test_shrink_radius_spans_three_by_three() {
        // half extent 16px = one cell of a 4-grid over 64px
        let instance = rect_instance(7, 24, 56, 24, 56);
        let levels = single_level(1.0).assign(&[instance], (16, 16)).unwrap();
        let level = &levels[0];

        let mut expected = Vec::new();
        for i in 1..=3 {
            for j in 1..=3 {
                expected.push((i, j));
            }
        }
        assert_eq!(positive_cells(level), expected);
        assert_eq!(level.num_entries(), 9);
        assert_eq!(level.grid_order, vec![5, 6, 7, 9, 10, 11, 13, 14, 15]);
    }

    #[test]
    fn test_footprint_contains_center_and_stays_in_grid() {
        for num_grid in [3usize, 5, 12, 40] {
            for (cy, cx) in [(0.0f64, 0.0f64), (10.0, 500.0), (255.9, 255.9), (128.0, 3.0)] {
                for half in [0.0f32, 5.0, 60.0, 400.0] {
                    let fp = footprint((cy, cx), (half, half), (256, 256), num_grid);
                    let last = num_grid as i64 - 1;
                    let gy = grid_cell(cy / 256.0, num_grid).clamp(0, last) as usize;
                    let gx = grid_cell(cx / 256.0, num_grid).clamp(0, last) as usize;
                    assert!(fp.contains(gy, gx), "{fp:?} misses ({gy}, {gx})");
                    assert!(fp.bottom < num_grid && fp.right < num_grid);
                    assert!(fp.bottom - fp.top <= 2 && fp.right - fp.left <= 2);
                }
            }
        }
    }

    #[test]
    fn test_overlapping_footprints_keep_last_label_but_all_masks() {
        // Documented quirk: the label grid is last-write-wins while every mask entry
        // is retained, so cell (2, 2) has label 2 but two target masks.
        let first = rect_instance(1, 24, 56, 24, 56);
        let second = rect_instance(2, 26, 58, 26, 58);
        let levels = single_level(0.0).assign(&[first, second], (16, 16)).unwrap();
        let level = &levels[0];

        assert_eq!(level.label_at(2, 2), 2);
        assert_eq!(level.grid_order, vec![10, 10]);
        assert_eq!(level.num_positive_cells(), 1);
        let targets = level.stacked_targets().unwrap().unwrap();
        assert_eq!(targets.dims(), &[2, 16, 16]);
        let diff: u8 = targets
            .get(0)
            .unwrap()
            .ne(&targets.get(1).unwrap())
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 1, "both instance masks should be kept");
    }

    #[test]
    fn test_empty_mask_is_skipped() {
        let mut instance = rect_instance(3, 24, 56, 24, 56);
        instance.mask = Tensor::zeros((64, 64), DType::U8, &Device::Cpu).unwrap();
        let levels = single_level(1.0).assign(&[instance], (16, 16)).unwrap();
        assert_eq!(levels[0].num_entries(), 0);
        assert!(levels[0].category_grid.iter().all(|&l| l == 0));
        assert!(levels[0].stacked_targets().unwrap().is_none());
    }

    #[test]
    fn test_unmatched_levels_are_empty() {
        let assigner = GridAssigner::new(
            &[
                GridLevel::new(4, 8, (1.0, 20.0)),
                GridLevel::new(2, 16, (16.0, 64.0)),
            ],
            0.2,
            4,
        );
        let instance = rect_instance(1, 24, 56, 24, 56);
        let levels = assigner.assign(&[instance], (16, 16)).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].num_entries(), 0);
        assert_eq!(levels[0].category_grid.len(), 16);
        assert_eq!(levels[1].num_entries(), 1);
        assert_eq!(levels[1].label_at(1, 1), 1);
    }

    #[test]
    fn test_grid_cell_boundaries() {
        assert_eq!(grid_cell(0.0, 4), 0);
        assert_eq!(grid_cell(0.625, 4), 2);
        assert_eq!(grid_cell(0.99, 40), 39);
        // 1/40 is not exact, the remainder-based quotient lands below the boundary
        assert_eq!(grid_cell(0.5, 40), 19);
        assert_eq!(grid_cell(-0.1, 4), -1);
    }

    #[test]
    fn test_center_of_mass() {
        let mask = rect_mask(8, 8, 2, 4, 4, 8);
        let (cy, cx) = center_of_mass(&mask).unwrap().unwrap();
        assert!((cy - 2.5).abs() < 1e-6);
        assert!((cx - 5.5).abs() < 1e-6);
        let empty = Tensor::zeros((4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(center_of_mass(&empty).unwrap().is_none());
    }

    #[test]
    fn test_large_mask_center_lands_on_cell_boundary() {
        // Rows 1..1344 of a 1344x1344 image: the mass center row is exactly 672, half
        // the input height, which belongs to the lower row of a 2x2 grid.
        let (size, feat) = (1344, 336);
        let mask = rect_mask(size, size, 1, size, 0, size);
        let (cy, cx) = center_of_mass(&mask).unwrap().unwrap();
        assert_eq!(cy, 672.0);
        assert_eq!(cx, 671.5);

        let instance = Instance::new([0.0, 1.0, size as f32, size as f32], 5, mask);
        let assigner = GridAssigner::new(&[GridLevel::new(2, 32, (0.0, 4000.0))], 0.0, 4);
        let levels = assigner.assign(&[instance], (feat, feat)).unwrap();
        assert_eq!(levels[0].grid_order, vec![2]);
        assert_eq!(levels[0].label_at(1, 0), 5);
    }

    #[test]
    fn test_rescale_mask_pads_to_feature_size() {
        let mask = rect_mask(40, 60, 0, 40, 0, 60);
        let target = rescale_mask(&mask, 4, (16, 16)).unwrap();
        assert_eq!(target.dims(), &[16, 16]);
        assert_eq!(target.dtype(), DType::U8);
        let rows: Vec<Vec<u8>> = target.to_vec2().unwrap();
        // 40x60 / 4 = 10x15 of ones, zero padding after
        assert_eq!(rows[0][14], 1);
        assert_eq!(rows[0][15], 0);
        assert_eq!(rows[9][0], 1);
        assert_eq!(rows[10][0], 0);
    }
}
