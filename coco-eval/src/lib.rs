//! COCO detection, instance segmentation and panoptic segmentation metrics.

pub mod common;
pub mod dataset;
pub mod eval;
pub mod evaluator;
pub mod mask;
pub mod panoptic;
pub mod params;

pub use dataset::{Annotation, Category, CocoDataset, ImageInfo, ResultAnnotation, Segmentation};
pub use eval::{Accumulation, CocoEval, EvalImg, NUM_STATS};
pub use evaluator::{CocoEvaluator, ImageDetections};
pub use mask::Rle;
pub use panoptic::{
    pq_compute, PanopticAnnotation, PanopticEvaluator, PanopticPrediction, PqResults, PqScore,
    SegmentInfo,
};
pub use params::{AreaRange, IouType, Params};
