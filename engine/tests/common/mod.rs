#![allow(dead_code)]

use anyhow::{ensure, Result};
use coco_eval::{
    panoptic::encode_id_map, Annotation, Category, CocoDataset, ImageInfo, SegmentInfo,
    Segmentation,
};
use engine::{
    utils, BboxPostProcess, Batch, Criterion, Detection, DetectionModel, LossDict, Optimizer,
    PanopticOutput, PanopticPostProcess, SegmPostProcess, Target, WeightDict,
};
use tch::{nn, nn::Module, Kind, Tensor};

pub const ORIG_SIZE: [i64; 2] = [8, 8];
pub const INPUT_SIZE: [i64; 2] = [4, 4];

/// Class logits and normalized boxes.
pub struct ToyOutput {
    pub logits: Tensor,
    pub boxes: Tensor,
}

/// A single linear layer mapping 4 features to 2 logits and 4 box values.
pub struct ToyModel {
    linear: nn::Linear,
    variables: Vec<Tensor>,
}

impl ToyModel {
    pub fn new(vs: &nn::VarStore) -> Self {
        let linear = nn::linear(vs.root() / "head", 4, 6, Default::default());
        Self {
            linear,
            variables: vs.trainable_variables(),
        }
    }
}

impl DetectionModel for ToyModel {
    type Output = ToyOutput;

    fn forward_t(&mut self, samples: &Tensor, _train: bool) -> Result<Self::Output> {
        let out = self.linear.forward(samples);
        Ok(ToyOutput {
            logits: out.narrow(1, 0, 2),
            boxes: out.narrow(1, 2, 4).sigmoid(),
        })
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        self.variables.iter().map(|var| var.shallow_clone()).collect()
    }
}

/// Squared logits and L1 box error, with a fixed class error.
pub struct ToyCriterion {
    weight_dict: WeightDict,
    /// Poison the classification term with NaN.
    pub nan: bool,
    /// Leave out the class error term.
    pub skip_class_error: bool,
}

impl Default for ToyCriterion {
    fn default() -> Self {
        Self {
            weight_dict: vec![("loss_ce".to_string(), 1.0), ("loss_bbox".to_string(), 5.0)]
                .into_iter()
                .collect(),
            nan: false,
            skip_class_error: false,
        }
    }
}

impl Criterion<ToyOutput> for ToyCriterion {
    fn forward(&self, outputs: &ToyOutput, targets: &[Target]) -> Result<LossDict> {
        let target_boxes = Tensor::cat(
            &targets
                .iter()
                .map(|target| target.boxes.shallow_clone())
                .collect::<Vec<_>>(),
            0,
        );

        let mut loss_ce = (&outputs.logits * &outputs.logits).mean(Kind::Float);
        if self.nan {
            loss_ce = loss_ce * f64::NAN;
        }
        let loss_bbox = (&outputs.boxes - target_boxes).abs().mean(Kind::Float);

        let mut losses: LossDict = vec![
            ("loss_ce".to_string(), loss_ce),
            ("loss_bbox".to_string(), loss_bbox),
        ]
        .into_iter()
        .collect();
        if !self.skip_class_error {
            losses.insert("class_error".to_string(), Tensor::from(12.5f32));
        }
        Ok(losses)
    }

    fn weight_dict(&self) -> &WeightDict {
        &self.weight_dict
    }
}

/// Scales normalized boxes to the original image size. Every detection has
/// label 1.
pub struct ToyBboxPostProcess;

impl BboxPostProcess<ToyOutput> for ToyBboxPostProcess {
    fn forward(&self, outputs: &ToyOutput, orig_target_sizes: &Tensor) -> Result<Vec<Detection>> {
        let scores = Vec::<f32>::from(&outputs.logits.select(1, 0).sigmoid());
        let boxes = Vec::<f32>::from(&outputs.boxes);
        let sizes = Vec::<i64>::from(orig_target_sizes);
        ensure!(sizes.len() == scores.len() * 2);

        let detections = scores
            .iter()
            .zip(boxes.chunks(4))
            .zip(sizes.chunks(2))
            .map(|((&score, b), size)| {
                let (h, w) = (size[0] as f32, size[1] as f32);
                let x1 = b[0] * w / 2.0;
                let y1 = b[1] * h / 2.0;
                let x2 = x1 + b[2] * w / 2.0;
                let y2 = y1 + b[3] * h / 2.0;

                Detection {
                    scores: Tensor::of_slice(&[score]),
                    labels: Tensor::of_slice(&[1i64]),
                    boxes: Tensor::of_slice(&[x1, y1, x2, y2]).view([1, 4]),
                    masks: None,
                }
            })
            .collect();
        Ok(detections)
    }
}

/// Fills the box of every detection as its mask. Fails unless the input
/// sizes are passed as `target_sizes`.
pub struct ToySegmPostProcess;

impl SegmPostProcess<ToyOutput> for ToySegmPostProcess {
    fn forward(
        &self,
        results: Vec<Detection>,
        _outputs: &ToyOutput,
        orig_target_sizes: &Tensor,
        target_sizes: &Tensor,
    ) -> Result<Vec<Detection>> {
        let orig_sizes = Vec::<i64>::from(orig_target_sizes);
        let sizes = Vec::<i64>::from(target_sizes);
        ensure!(orig_sizes.len() == results.len() * 2);
        ensure!(sizes.chunks(2).all(|size| size == INPUT_SIZE));

        results
            .into_iter()
            .zip(orig_sizes.chunks(2))
            .map(|(detection, size)| {
                let (h, w) = (size[0], size[1]);
                let b = Vec::<f32>::from(&detection.boxes);
                let pixels: Vec<f32> = (0..h)
                    .flat_map(|y| (0..w).map(move |x| (x as f32 + 0.5, y as f32 + 0.5)))
                    .map(|(x, y)| {
                        let inside = x >= b[0] && x < b[2] && y >= b[1] && y < b[3];
                        if inside {
                            1.0
                        } else {
                            0.0
                        }
                    })
                    .collect();

                Ok(Detection {
                    masks: Some(Tensor::of_slice(&pixels).view([1, h, w])),
                    ..detection
                })
            })
            .collect()
    }
}

/// Labels the whole image as one segment of category 1.
pub struct ToyPanopticPostProcess;

impl PanopticPostProcess<ToyOutput> for ToyPanopticPostProcess {
    fn forward(
        &self,
        _outputs: &ToyOutput,
        _target_sizes: &Tensor,
        orig_target_sizes: &Tensor,
    ) -> Result<Vec<PanopticOutput>> {
        Vec::<i64>::from(orig_target_sizes)
            .chunks(2)
            .map(|size| {
                let (h, w) = (size[0] as u32, size[1] as u32);
                let ids = vec![1u32; (h * w) as usize];
                Ok(PanopticOutput {
                    png_string: encode_id_map(&ids, w, h)?,
                    segments_info: vec![SegmentInfo {
                        id: 1,
                        category_id: 1,
                        area: (h * w) as u64,
                        iscrowd: 0,
                        isthing: None,
                        bbox: None,
                    }],
                })
            })
            .collect()
    }
}

/// Counts calls and records the gradient norm seen by each step.
pub struct RecordingOptimizer {
    variables: Vec<Tensor>,
    pub lr: f64,
    pub zero_grads: usize,
    pub grad_norms: Vec<f64>,
}

impl RecordingOptimizer {
    pub fn new(variables: Vec<Tensor>, lr: f64) -> Self {
        Self {
            variables,
            lr,
            zero_grads: 0,
            grad_norms: vec![],
        }
    }

    pub fn steps(&self) -> usize {
        self.grad_norms.len()
    }
}

impl Optimizer for RecordingOptimizer {
    fn zero_grad(&mut self) {
        self.zero_grads += 1;
        for var in &self.variables {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    fn step(&mut self) {
        self.grad_norms.push(utils::grad_norm(&self.variables));
    }

    fn lr(&self) -> f64 {
        self.lr
    }
}

/// A batch with one box per image. Image `i` of the batch has features
/// derived from its id.
pub fn toy_batch(image_ids: &[i64]) -> Batch {
    let features: Vec<f32> = image_ids
        .iter()
        .flat_map(|&id| {
            let id = id as f32;
            [id * 0.1, 1.0 - id * 0.1, 0.5, -0.5]
        })
        .collect();
    let samples = Tensor::of_slice(&features).view([image_ids.len() as i64, 4]);

    let targets = image_ids
        .iter()
        .map(|&image_id| Target {
            image_id,
            orig_size: ORIG_SIZE,
            size: INPUT_SIZE,
            boxes: Tensor::of_slice(&[0.25f32, 0.25, 0.5, 0.5]).view([1, 4]),
            labels: Tensor::of_slice(&[1i64]),
            masks: None,
        })
        .collect();

    Batch { samples, targets }
}

pub fn toy_batches(batches: &[&[i64]]) -> Vec<Result<Batch>> {
    batches.iter().map(|ids| Ok(toy_batch(ids))).collect()
}

/// Ground truth with one box of category 1 on every image. The box is also
/// given as a polygon.
pub fn toy_dataset(image_ids: &[i64]) -> Result<CocoDataset> {
    let [height, width] = ORIG_SIZE;
    let images = image_ids
        .iter()
        .map(|&id| ImageInfo {
            id,
            file_name: format!("{:012}.jpg", id),
            height: height as usize,
            width: width as usize,
        })
        .collect();
    let categories = vec![Category {
        id: 1,
        name: "object".into(),
        supercategory: None,
        isthing: Some(1),
    }];
    let annotations = image_ids
        .iter()
        .enumerate()
        .map(|(index, &image_id)| Annotation {
            id: index as i64 + 1,
            image_id,
            category_id: 1,
            bbox: [2.0, 2.0, 4.0, 4.0],
            area: 16.0,
            iscrowd: 0,
            segmentation: Some(Segmentation::Polygons(vec![vec![
                2.0, 2.0, 6.0, 2.0, 6.0, 6.0, 2.0, 6.0,
            ]])),
        })
        .collect();

    CocoDataset::new(images, categories, annotations)
}
