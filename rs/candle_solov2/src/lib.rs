//! SOLOv2 instance segmentation head with Candle
//!
//! The post-network part of SOLOv2: ground-truth assignment to multi-scale grids,
//! dynamic mask decoding, the dice and focal training losses, and inference with
//! Matrix NMS. Feature extraction is left to the caller, which provides per-level
//! class and kernel maps and the shared mask features.

pub mod coco_classes;
pub mod config;
pub mod debug;
pub mod detection;
pub mod head;
pub mod npy;

pub use config::{GridLevel, GridLevels, InferenceConfig, SoloConfig};
pub use detection::{SegResult, SegmentedInstance};
pub use head::assign::Instance;
pub use head::inference::ImageMeta;
pub use head::loss::LossOutput;
pub use head::matrix_nms::{DecayKernel, NmsScope};
pub use head::SoloHead;
