use crate::common::*;
use thiserror::Error;

/// Conditions the engine reports as typed errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("loss is {value}, stopping training; reduced losses: {losses:?}")]
    NonFiniteLoss {
        value: f64,
        losses: IndexMap<String, f64>,
    },
    #[error("the criterion did not produce the '{name}' term")]
    MissingLossTerm { name: String },
    #[error("panoptic post-processing requires evaluation.panoptic with ann_file and ann_folder")]
    MissingPanopticSource,
}
