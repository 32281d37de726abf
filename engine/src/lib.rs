//! Training and evaluation drivers for DETR-style detectors.

pub mod common;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod losses;
pub mod metric_logger;
pub mod model;
pub mod train;
pub mod utils;

pub use config::Config;
pub use data::{Batch, Target};
pub use error::EngineError;
pub use evaluate::{evaluate, EvalStats};
pub use metric_logger::{LogEvery, MetricLogger, SmoothedValue};
pub use model::{
    BboxPostProcess, Criterion, Detection, DetectionModel, LossDict, Optimizer, PanopticOutput,
    PanopticPostProcess, PostProcessors, SegmPostProcess, WeightDict,
};
pub use train::{train_one_epoch, EpochStats, ThroughputReport};
