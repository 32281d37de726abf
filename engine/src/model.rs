//! Interfaces of the model, loss and post-processing collaborators.

use crate::{common::*, data::Target};
use coco_eval::{ImageDetections, Rle, SegmentInfo};

/// Loss terms by name. Each value is a scalar tensor.
pub type LossDict = IndexMap<String, Tensor>;

/// Loss weights by name. Only terms present here contribute to the total loss.
pub type WeightDict = IndexMap<String, f64>;

/// A detector that maps a batch of images to raw outputs.
pub trait DetectionModel {
    type Output;

    fn forward_t(&mut self, samples: &Tensor, train: bool) -> Result<Self::Output>;

    fn trainable_variables(&self) -> Vec<Tensor>;
}

/// Computes loss terms from model outputs and targets.
pub trait Criterion<O> {
    fn forward(&self, outputs: &O, targets: &[Target]) -> Result<LossDict>;

    fn weight_dict(&self) -> &WeightDict;
}

/// The parameter update step.
pub trait Optimizer {
    fn zero_grad(&mut self);

    fn step(&mut self);

    fn lr(&self) -> f64;
}

/// Post-processed detections of one image.
///
/// `boxes` are `[N, 4]` in `x1, y1, x2, y2` absolute pixels. `masks`, when
/// present, are `[N, H, W]` or `[N, 1, H, W]` probabilities or booleans.
#[derive(Debug, TensorLike)]
pub struct Detection {
    pub scores: Tensor,
    pub labels: Tensor,
    pub boxes: Tensor,
    pub masks: Option<Tensor>,
}

impl Detection {
    /// Copies to host memory in the form consumed by the COCO evaluator.
    /// Masks are binarized at 0.5 and run-length encoded.
    pub fn to_image_detections(&self) -> Result<ImageDetections> {
        let scores = Vec::<f64>::from(&self.scores.to_kind(Kind::Double));
        let labels = Vec::<i64>::from(&self.labels.to_kind(Kind::Int64));
        let boxes = Vec::<f64>::from(&self.boxes.to_kind(Kind::Double));
        ensure!(
            boxes.len() == scores.len() * 4,
            "expect {} box coordinates for {} scores, but get {}",
            scores.len() * 4,
            scores.len(),
            boxes.len()
        );
        let boxes: Vec<[f64; 4]> = boxes
            .chunks(4)
            .map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
            .collect();

        let masks = self
            .masks
            .as_ref()
            .map(|masks| encode_masks(masks, scores.len()))
            .transpose()?;

        Ok(ImageDetections {
            boxes,
            scores,
            labels,
            masks,
        })
    }
}

fn encode_masks(masks: &Tensor, num: usize) -> Result<Vec<Rle>> {
    let shape = masks.size();
    ensure!(
        shape.len() >= 2,
        "masks must have at least two dimensions, but get shape {:?}",
        shape
    );
    let height = shape[shape.len() - 2] as usize;
    let width = shape[shape.len() - 1] as usize;

    let binary = masks.to_kind(Kind::Double).gt(0.5).to_kind(Kind::Uint8);
    let pixels = Vec::<u8>::from(&binary);
    ensure!(
        pixels.len() == num * height * width,
        "expect {} masks of size {}x{}, but get shape {:?}",
        num,
        height,
        width,
        shape
    );

    if num == 0 {
        return Ok(vec![]);
    }

    pixels
        .chunks(height * width)
        .map(|mask| Rle::encode_row_major(mask, height, width))
        .collect()
}

/// Panoptic output of one image.
#[derive(Debug, Clone)]
pub struct PanopticOutput {
    /// PNG encoded segment id map.
    pub png_string: Vec<u8>,
    pub segments_info: Vec<SegmentInfo>,
}

/// Turns raw outputs into boxes in original image coordinates.
pub trait BboxPostProcess<O> {
    fn forward(&self, outputs: &O, orig_target_sizes: &Tensor) -> Result<Vec<Detection>>;
}

/// Adds instance masks to box detections.
pub trait SegmPostProcess<O> {
    fn forward(
        &self,
        results: Vec<Detection>,
        outputs: &O,
        orig_target_sizes: &Tensor,
        target_sizes: &Tensor,
    ) -> Result<Vec<Detection>>;
}

/// Produces panoptic segment maps.
pub trait PanopticPostProcess<O> {
    fn forward(
        &self,
        outputs: &O,
        target_sizes: &Tensor,
        orig_target_sizes: &Tensor,
    ) -> Result<Vec<PanopticOutput>>;
}

/// The post-processors used by an evaluation pass. Box post-processing is
/// mandatory.
pub struct PostProcessors<O> {
    pub bbox: Box<dyn BboxPostProcess<O>>,
    pub segm: Option<Box<dyn SegmPostProcess<O>>>,
    pub panoptic: Option<Box<dyn PanopticPostProcess<O>>>,
}

impl<O> PostProcessors<O> {
    pub fn new(bbox: impl BboxPostProcess<O> + 'static) -> Self {
        Self {
            bbox: Box::new(bbox),
            segm: None,
            panoptic: None,
        }
    }

    pub fn with_segm(mut self, segm: impl SegmPostProcess<O> + 'static) -> Self {
        self.segm = Some(Box::new(segm));
        self
    }

    pub fn with_panoptic(mut self, panoptic: impl PanopticPostProcess<O> + 'static) -> Self {
        self.panoptic = Some(Box::new(panoptic));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_to_host() {
        let detection = Detection {
            scores: Tensor::of_slice(&[0.9f32, 0.4]),
            labels: Tensor::of_slice(&[3i64, 1]),
            boxes: Tensor::of_slice(&[0f32, 0.0, 2.0, 2.0, 1.0, 1.0, 3.0, 4.0]).view([2, 4]),
            masks: Some(
                Tensor::of_slice(&[0.9f32, 0.1, 0.0, 0.0, 0.0, 0.0, 0.6, 0.7]).view([2, 1, 2, 2]),
            ),
        };

        let detections = detection.to_image_detections().unwrap();
        assert_eq!(detections.labels, vec![3, 1]);
        assert_eq!(detections.boxes[1], [1.0, 1.0, 3.0, 4.0]);

        let masks = detections.masks.unwrap();
        assert_eq!(masks.len(), 2);
        assert_eq!(masks[0].area(), 1);
        assert_eq!(masks[1].area(), 2);
        assert_eq!(masks[1].height, 2);
        assert_eq!(masks[1].to_bbox(), [0.0, 1.0, 2.0, 1.0]);
    }
}
