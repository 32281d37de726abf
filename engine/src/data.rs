//! Batches fed to the drivers.

use crate::common::*;

/// Annotations of one image. Sizes are `[height, width]`.
#[derive(Debug, TensorLike)]
pub struct Target {
    #[tensor_like(copy)]
    pub image_id: i64,
    /// The image size before augmentation.
    #[tensor_like(copy)]
    pub orig_size: [i64; 2],
    /// The image size as fed to the model.
    #[tensor_like(copy)]
    pub size: [i64; 2],
    pub boxes: Tensor,
    pub labels: Tensor,
    pub masks: Option<Tensor>,
}

/// Images stacked into one tensor along with per-image targets.
#[derive(Debug, TensorLike)]
pub struct Batch {
    pub samples: Tensor,
    pub targets: Vec<Target>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.samples.size().first().copied().unwrap_or(0) as usize
    }
}

/// Stacks `[height, width]` pairs into an `[N, 2]` int64 tensor.
pub fn stack_sizes(sizes: impl IntoIterator<Item = [i64; 2]>, device: Device) -> Tensor {
    let flat: Vec<i64> = sizes.into_iter().flatten().collect();
    let num = flat.len() as i64 / 2;
    Tensor::of_slice(&flat).view([num, 2]).to_device(device)
}

/// The PNG file name of a panoptic prediction.
pub fn panoptic_file_name(image_id: i64) -> String {
    format!("{:012}.png", image_id)
}
