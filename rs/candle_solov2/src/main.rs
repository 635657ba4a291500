//! SOLOv2 head driver
//!
//! Runs the head on network outputs dumped as `.npy` files: `segment` decodes
//! instance masks, `loss` evaluates the training losses against ground truth.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_loss;
mod cmd_segment;

use std::path::PathBuf;

use candle_core::{Device, Result};
use candle_solov2::SoloConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Head configuration presets
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Preset {
    /// Standard SOLOv2 grids for ResNet-50/101
    R50,
    /// SOLOv2-light for 448px inputs
    Light448,
}

impl Preset {
    fn config(&self) -> SoloConfig {
        match self {
            Preset::R50 => SoloConfig::r50(),
            Preset::Light448 => SoloConfig::light_448(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Which configuration preset to use.
    #[arg(long, value_enum, default_value_t = Preset::R50, global = true)]
    preset: Preset,

    /// JSON configuration file, overrides the preset.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode instance masks from dumped head outputs
    Segment(cmd_segment::SegmentArgs),
    /// Evaluate the training losses of dumped head outputs
    Loss(cmd_loss::LossArgs),
}

impl Cli {
    fn solo_config(&self) -> anyhow::Result<SoloConfig> {
        match &self.config {
            Some(path) => SoloConfig::from_json_file(path),
            None => Ok(self.preset.config()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let device = device(cli.cpu)?;
    println!("Using device: {:?}", device);

    let config = cli.solo_config()?;
    match &cli.config {
        Some(path) => println!("Config: {:?}", path),
        None => println!("Config preset: {:?}", cli.preset),
    }
    println!("  Levels: {}", config.num_levels());
    println!("  Classes: {}", config.cate_channels());
    println!("  Kernel channels: {}", config.kernel_channels);

    match &cli.command {
        Command::Segment(args) => cmd_segment::run(args, config, &device),
        Command::Loss(args) => cmd_loss::run(args, config, &device),
    }
}
