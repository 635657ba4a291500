//! Loss subcommand: training losses of dumped head outputs against ground truth.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use clap::Args;
use serde::Deserialize;

use candle_solov2::{npy, Instance, SoloConfig, SoloHead};

use crate::cmd_segment::load_head_outputs;

/// Arguments for the loss subcommand
#[derive(Args, Debug)]
pub struct LossArgs {
    /// Directory with `cate_{l}.npy`, `kernel_{l}.npy` and `mask_feat.npy`.
    pub input_dir: PathBuf,

    /// Ground-truth file, defaults to `targets.json` in the input directory.
    #[arg(long)]
    pub targets: Option<PathBuf>,
}

/// One ground-truth instance in `targets.json`
#[derive(Debug, Deserialize)]
struct TargetRecord {
    bbox: [f32; 4],
    label: u32,
    /// `.npy` mask path, relative to the targets file
    mask: PathBuf,
}

/// Load per-image ground truth from a JSON list of instance lists
fn load_targets(path: &Path, device: &Device) -> anyhow::Result<Vec<Vec<Instance>>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let images: Vec<Vec<TargetRecord>> = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));

    let mut gt = Vec::with_capacity(images.len());
    for records in images {
        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            let mask = npy::load_mask(root.join(&record.mask), device)?;
            if mask.rank() != 2 {
                anyhow::bail!(
                    "mask {} must be 2D, got shape {:?}",
                    record.mask.display(),
                    mask.dims()
                );
            }
            instances.push(Instance::new(record.bbox, record.label, mask));
        }
        gt.push(instances);
    }
    Ok(gt)
}

/// Run the loss subcommand
pub fn run(args: &LossArgs, config: SoloConfig, device: &Device) -> anyhow::Result<()> {
    let outputs = load_head_outputs(&args.input_dir, config.num_levels(), device)?;
    let targets = args
        .targets
        .clone()
        .unwrap_or_else(|| args.input_dir.join("targets.json"));
    let gt = load_targets(&targets, device)?;
    let batch = outputs.batch_size()?;
    if gt.len() != batch {
        anyhow::bail!(
            "{} has {} image(s) but the head outputs have {batch}",
            targets.display(),
            gt.len()
        );
    }
    let num_instances: usize = gt.iter().map(Vec::len).sum();
    println!("Loaded {} image(s) with {} instance(s)", batch, num_instances);

    let head = SoloHead::new(config)?;
    let losses = head.loss(
        &outputs.cate_logits,
        &outputs.kernel_preds,
        &outputs.mask_feat,
        &gt,
    )?;
    let (loss_ins, loss_cate) = losses.to_scalars()?;
    println!("loss_ins: {:.6}", loss_ins);
    println!("loss_cate: {:.6}", loss_cate);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};

    #[test]
    fn test_load_targets() {
        let dir = std::env::temp_dir().join(format!("candle_solov2_targets_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mask = Tensor::ones((4, 6), DType::U8, &Device::Cpu).unwrap();
        npy::save(dir.join("m0.npy"), &mask).unwrap();
        std::fs::write(
            dir.join("targets.json"),
            r#"[[{"bbox": [0, 0, 6, 4], "label": 3, "mask": "m0.npy"}], []]"#,
        )
        .unwrap();

        let gt = load_targets(&dir.join("targets.json"), &Device::Cpu).unwrap();
        assert_eq!(gt.len(), 2);
        assert_eq!(gt[0][0].label, 3);
        assert_eq!(gt[0][0].mask.dims(), &[4, 6]);
        assert!((gt[0][0].scale() - 24f32.sqrt()).abs() < 1e-6);
        assert!(gt[1].is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
