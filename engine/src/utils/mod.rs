//! Misc utilities.

mod tensor;
mod warmup;

pub use tensor::*;
pub use warmup::*;
