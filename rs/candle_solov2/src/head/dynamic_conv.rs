//! Dynamic mask decoding.
//!
//! Each positive grid cell predicts a kernel vector of `C` values which is used as the
//! weight of a `C x 1 x 1` convolution over the shared mask features. A 1x1 convolution
//! is a per-pixel dot product, so all kernels are applied with a single matmul.

use candle_core::{Result, Tensor};

/// Apply `n` dynamic 1x1 kernels to a shared feature map.
///
/// # Arguments
/// * `kernels` - Kernel vectors, shape [N, C]
/// * `features` - Shared mask features, shape [C, H, W]
///
/// # Returns
/// Mask logits of shape [N, H, W]
pub fn decode_masks(kernels: &Tensor, features: &Tensor) -> Result<Tensor> {
    let (n, c) = kernels.dims2()?;
    let (c2, h, w) = features.dims3()?;
    if c != c2 {
        candle_core::bail!("kernel channels {c} do not match mask feature channels {c2}")
    }

    // [N, C] @ [C, H*W] -> [N, H*W]
    let features = features.reshape((c, h * w))?;
    kernels
        .contiguous()?
        .matmul(&features)?
        .reshape((n, h, w))
}

/// Gather the kernels of the given cells from a kernel map and decode them.
///
/// # Arguments
/// * `kernel_map` - Per-cell kernels of one image and level, shape [C, S, S]
/// * `cells` - Flat cell indices (row-major) into the `S x S` grid
/// * `features` - Shared mask features of the same image, shape [C, H, W]
///
/// # Returns
/// Mask logits [len(cells), H, W], or `None` when `cells` is empty
pub fn decode_cells(kernel_map: &Tensor, cells: &[u32], features: &Tensor) -> Result<Option<Tensor>> {
    if cells.is_empty() {
        return Ok(None);
    }
    let (c, s1, s2) = kernel_map.dims3()?;
    let num_cells = s1 * s2;
    if let Some(&bad) = cells.iter().find(|&&cell| cell as usize >= num_cells) {
        candle_core::bail!("cell index {bad} is outside the {s1}x{s2} grid")
    }
    let index = Tensor::from_slice(cells, cells.len(), kernel_map.device())?;
    // [C, S*S] -> [C, n] -> [n, C]
    let kernels = kernel_map
        .reshape((c, num_cells))?
        .index_select(&index, 1)?
        .t()?;
    decode_masks(&kernels, features).map(Some)
}
