//! Segment subcommand: decode instance masks from dumped head outputs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use clap::Args;
use serde::Serialize;

use candle_solov2::debug::TensorStats;
use candle_solov2::{npy, DecayKernel, ImageMeta, SegResult, SoloConfig, SoloHead};

/// Arguments for the segment subcommand
#[derive(Args, Debug)]
pub struct SegmentArgs {
    /// Directory with `cate_{l}.npy`, `kernel_{l}.npy` and `mask_feat.npy`.
    pub input_dir: PathBuf,

    /// Output directory for results and masks.
    #[arg(long, short, default_value = "segment_output")]
    pub output_dir: PathBuf,

    /// Unpadded network input size as `H,W`, defaults to the padded size.
    #[arg(long, value_parser = parse_size)]
    pub img_shape: Option<(usize, usize)>,

    /// Original image size as `H,W`, defaults to the input size.
    #[arg(long, value_parser = parse_size)]
    pub ori_shape: Option<(usize, usize)>,

    /// Override the class score threshold.
    #[arg(long)]
    pub score_thr: Option<f32>,

    /// Override the Matrix NMS kernel (`gaussian` or `linear`).
    #[arg(long)]
    pub kernel: Option<DecayKernel>,

    /// Save one PNG per instance mask.
    #[arg(long)]
    pub png: bool,
}

fn parse_size(s: &str) -> Result<(usize, usize), String> {
    let (h, w) = s
        .split_once(',')
        .ok_or_else(|| format!("expected H,W, got '{s}'"))?;
    let h = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    let w = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    Ok((h, w))
}

/// Network outputs consumed by the head
pub struct HeadOutputs {
    /// Per level class logits [B, C, S, S]
    pub cate_logits: Vec<Tensor>,
    /// Per level kernel maps [B, K, S, S]
    pub kernel_preds: Vec<Tensor>,
    /// Shared mask features [B, K, H, W]
    pub mask_feat: Tensor,
}

impl HeadOutputs {
    pub fn batch_size(&self) -> anyhow::Result<usize> {
        Ok(self.mask_feat.dim(0)?)
    }
}

/// Load the dumped head outputs of `num_levels` levels from a directory
pub fn load_head_outputs(
    dir: &Path,
    num_levels: usize,
    device: &Device,
) -> anyhow::Result<HeadOutputs> {
    let mut cate_logits = Vec::with_capacity(num_levels);
    let mut kernel_preds = Vec::with_capacity(num_levels);
    for level in 0..num_levels {
        let cate = npy::load_f32(dir.join(format!("cate_{level}.npy")), device)?;
        let kernel = npy::load_f32(dir.join(format!("kernel_{level}.npy")), device)?;
        TensorStats::log(&format!("cate_{level}"), &cate)?;
        TensorStats::log(&format!("kernel_{level}"), &kernel)?;
        cate_logits.push(cate);
        kernel_preds.push(kernel);
    }
    let mask_feat = npy::load_f32(dir.join("mask_feat.npy"), device)?;
    TensorStats::log("mask_feat", &mask_feat)?;
    Ok(HeadOutputs {
        cate_logits,
        kernel_preds,
        mask_feat,
    })
}

#[derive(Serialize)]
struct InstanceRecord {
    label: u32,
    class_name: &'static str,
    score: f32,
    area: usize,
    bbox: [f32; 4],
}

#[derive(Serialize)]
struct ImageRecord {
    image: usize,
    masks: Option<String>,
    instances: Vec<InstanceRecord>,
}

/// Save every mask of a result as a grayscale PNG
fn save_pngs(result: &SegResult, output_dir: &Path, image: usize) -> anyhow::Result<()> {
    let (k, h, w) = result.masks.dims3()?;
    for idx in 0..k {
        let data: Vec<u8> = result
            .masks
            .get(idx)?
            .to_dtype(DType::U8)?
            .flatten_all()?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|v| if v > 0 { 255 } else { 0 })
            .collect();
        let img = image::GrayImage::from_raw(w as u32, h as u32, data)
            .context("mask buffer does not match its size")?;
        img.save(output_dir.join(format!("mask_{image}_{idx}.png")))?;
    }
    Ok(())
}

/// Run the segment subcommand
pub fn run(args: &SegmentArgs, mut config: SoloConfig, device: &Device) -> anyhow::Result<()> {
    if let Some(score_thr) = args.score_thr {
        config.test.score_thr = score_thr;
    }
    if let Some(kernel) = args.kernel {
        config.test.kernel = kernel;
    }
    println!("Inference thresholds: {:?}", config.test);

    let outputs = load_head_outputs(&args.input_dir, config.num_levels(), device)?;
    let batch = outputs.batch_size()?;
    let (_, _, feat_h, feat_w) = outputs.mask_feat.dims4()?;
    let padded = (feat_h * config.mask_stride, feat_w * config.mask_stride);
    let img_shape = args.img_shape.unwrap_or(padded);
    let ori_shape = args.ori_shape.unwrap_or(img_shape);
    let metas = vec![ImageMeta::from_shapes(img_shape, ori_shape); batch];
    println!("Loaded {} image(s), mask features {}x{}", batch, feat_h, feat_w);

    let head = SoloHead::new(config)?;
    let start = Instant::now();
    let results = head.segment(
        &outputs.cate_logits,
        &outputs.kernel_preds,
        &outputs.mask_feat,
        &metas,
    )?;
    println!("Inference completed in {:?}", start.elapsed());

    std::fs::create_dir_all(&args.output_dir)?;
    let mut records = Vec::with_capacity(batch);
    for (image, result) in results.iter().enumerate() {
        let Some(result) = result else {
            println!("Image {image}: no detections found.");
            records.push(ImageRecord {
                image,
                masks: None,
                instances: Vec::new(),
            });
            continue;
        };

        println!("Image {image}: {} instance(s)", result.len());
        let mut instances = Vec::with_capacity(result.len());
        for instance in result.instances()? {
            println!("  {}", instance);
            instances.push(InstanceRecord {
                label: instance.label,
                class_name: instance.class_name(),
                score: instance.score,
                area: instance.area,
                bbox: instance.bbox,
            });
        }

        let masks_name = format!("masks_{image}.npy");
        npy::save(args.output_dir.join(&masks_name), &result.masks)?;
        if args.png {
            save_pngs(result, &args.output_dir, image)?;
        }
        records.push(ImageRecord {
            image,
            masks: Some(masks_name),
            instances,
        });
    }

    let results_file = args.output_dir.join("result.json");
    let file = std::fs::File::create(&results_file)?;
    serde_json::to_writer_pretty(file, &records)?;
    println!("Results saved to: {:?}", results_file);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("480, 640").unwrap(), (480, 640));
        assert!(parse_size("480").is_err());
        assert!(parse_size("a,1").is_err());
    }
}
