//! `.npy` I/O for head inputs and outputs.
//!
//! Dumped network outputs are read as f32 tensors, masks as u8 (numpy `bool` or
//! `uint8`). Tensors are written back as f32 or u8 depending on their dtype.

use std::path::Path;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_npy::ReadNpyExt;

fn open(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))
}

/// Load an f32 array as a tensor
pub fn load_f32<P: AsRef<Path>>(path: P, device: &Device) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let arr = ArrayD::<f32>::read_npy(open(path)?)
        .with_context(|| format!("failed to parse {} as f32", path.display()))?;
    let shape = arr.shape().to_vec();
    let data: Vec<f32> = arr.into_iter().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Load a binary mask stored as `uint8` or `bool` as a u8 tensor
pub fn load_mask<P: AsRef<Path>>(path: P, device: &Device) -> anyhow::Result<Tensor> {
    let path = path.as_ref();
    let (shape, data) = match ArrayD::<u8>::read_npy(open(path)?) {
        Ok(arr) => {
            let shape = arr.shape().to_vec();
            (shape, arr.into_iter().map(|v| u8::from(v != 0)).collect::<Vec<u8>>())
        }
        Err(_) => {
            let arr = ArrayD::<bool>::read_npy(open(path)?)
                .with_context(|| format!("{} is neither uint8 nor bool", path.display()))?;
            let shape = arr.shape().to_vec();
            (shape, arr.into_iter().map(u8::from).collect())
        }
    };
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Save a tensor as `.npy`, u8 tensors as `uint8` and everything else as `float32`
pub fn save<P: AsRef<Path>>(path: P, tensor: &Tensor) -> anyhow::Result<()> {
    let path = path.as_ref();
    let shape = IxDyn(tensor.dims());
    let flat = tensor.flatten_all()?;
    let written = if tensor.dtype() == DType::U8 {
        let data: Vec<u8> = flat.to_vec1()?;
        ndarray_npy::write_npy(path, &ArrayD::from_shape_vec(shape, data)?)
    } else {
        let data: Vec<f32> = flat.to_dtype(DType::F32)?.to_vec1()?;
        ndarray_npy::write_npy(path, &ArrayD::from_shape_vec(shape, data)?)
    };
    written.with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("candle_solov2_{}_{name}", std::process::id()))
    }

    #[test]
    fn test_f32_file() {
        let path = temp_path("feat.npy");
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap();
        save(&path, &t).unwrap();
        let back = load_f32(&path, &Device::Cpu).unwrap();
        assert_eq!(back.dims(), &[1, 3, 4]);
        let diff: f32 = (back - &t).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_bool_mask_file() {
        let path = temp_path("mask.npy");
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![true, false, false, true]).unwrap();
        ndarray_npy::write_npy(&path, &arr).unwrap();
        let mask = load_mask(&path, &Device::Cpu).unwrap();
        assert_eq!(mask.dtype(), DType::U8);
        let rows: Vec<Vec<u8>> = mask.to_vec2().unwrap();
        assert_eq!(rows, vec![vec![1, 0], vec![0, 1]]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_f32(temp_path("does_not_exist.npy"), &Device::Cpu).is_err());
    }
}
