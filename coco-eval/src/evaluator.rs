//! Incremental COCO evaluation fed batch by batch.

use crate::{
    common::*,
    dataset::{CocoDataset, ResultAnnotation},
    eval::{CocoEval, EvalImg, NUM_STATS},
    mask::Rle,
    params::IouType,
};

/// Post-processed detections of one image.
///
/// Boxes are `[x1, y1, x2, y2]` in absolute pixels of the original image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDetections {
    pub boxes: Vec<[f64; 4]>,
    pub scores: Vec<f64>,
    pub labels: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masks: Option<Vec<Rle>>,
}

impl ImageDetections {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Converts to COCO result entries of the given IoU type.
    pub fn to_results(&self, image_id: i64, iou_type: IouType) -> Result<Vec<ResultAnnotation>> {
        ensure!(
            self.boxes.len() == self.len() && self.labels.len() == self.len(),
            "image {} has {} boxes, {} scores and {} labels",
            image_id,
            self.boxes.len(),
            self.scores.len(),
            self.labels.len()
        );

        let results = match iou_type {
            IouType::Bbox => izip!(&self.boxes, &self.scores, &self.labels)
                .map(|(&[x1, y1, x2, y2], &score, &label)| ResultAnnotation {
                    image_id,
                    category_id: label,
                    bbox: Some([x1, y1, x2 - x1, y2 - y1]),
                    score,
                    segmentation: None,
                })
                .collect(),
            IouType::Segm => {
                let masks = self
                    .masks
                    .as_ref()
                    .ok_or_else(|| format_err!("image {} has no masks", image_id))?;
                ensure!(
                    masks.len() == self.len(),
                    "image {} has {} masks but {} scores",
                    image_id,
                    masks.len(),
                    self.len()
                );

                izip!(masks, &self.scores, &self.labels)
                    .map(|(rle, &score, &label)| ResultAnnotation {
                        image_id,
                        category_id: label,
                        bbox: None,
                        score,
                        segmentation: Some(rle.clone()),
                    })
                    .collect()
            }
        };

        Ok(results)
    }
}

/// Collects detections over an evaluation pass and computes COCO metrics
/// for each requested IoU type.
#[derive(Debug, Clone)]
pub struct CocoEvaluator {
    gt: Arc<CocoDataset>,
    coco_eval: IndexMap<IouType, CocoEval>,
    img_ids: Vec<i64>,
}

impl CocoEvaluator {
    pub fn new(gt: Arc<CocoDataset>, iou_types: impl IntoIterator<Item = IouType>) -> Self {
        let coco_eval = iou_types
            .into_iter()
            .map(|iou_type| (iou_type, CocoEval::new(gt.clone(), iou_type)))
            .collect();

        Self {
            gt,
            coco_eval,
            img_ids: vec![],
        }
    }

    pub fn ground_truth(&self) -> &Arc<CocoDataset> {
        &self.gt
    }

    pub fn iou_types(&self) -> impl Iterator<Item = IouType> + '_ {
        self.coco_eval.keys().copied()
    }

    /// Image ids seen by [CocoEvaluator::update] on this worker.
    pub fn img_ids(&self) -> &[i64] {
        &self.img_ids
    }

    pub fn coco_eval(&self, iou_type: IouType) -> Option<&CocoEval> {
        self.coco_eval.get(&iou_type)
    }

    /// Evaluates the detections of a batch of images.
    pub fn update(&mut self, predictions: &IndexMap<i64, ImageDetections>) -> Result<()> {
        let img_ids: Vec<i64> = predictions.keys().copied().sorted().dedup().collect();
        self.img_ids.extend(img_ids.iter().copied());

        for (&iou_type, coco_eval) in &mut self.coco_eval {
            let results: Vec<_> = predictions
                .iter()
                .map(|(&image_id, detections)| detections.to_results(image_id, iou_type))
                .flatten_ok()
                .collect::<Result<_>>()?;
            coco_eval.evaluate_images(&img_ids, &results)?;
        }

        Ok(())
    }

    /// Evaluates prepared result entries, as read from a results file.
    pub fn update_results(&mut self, img_ids: &[i64], results: &[ResultAnnotation]) -> Result<()> {
        self.img_ids.extend(img_ids.iter().copied());

        for coco_eval in self.coco_eval.values_mut() {
            coco_eval.evaluate_images(img_ids, results)?;
        }
        Ok(())
    }

    /// Exchanges per-image outcomes so that every worker holds all of them.
    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        for coco_eval in self.coco_eval.values_mut() {
            let local: Vec<(i64, Vec<Option<EvalImg>>)> = coco_eval
                .eval_imgs()
                .iter()
                .map(|(&image_id, evals)| (image_id, evals.clone()))
                .collect();
            let gathered = process_group::all_gather(group, &local)?;
            coco_eval.merge(gathered.into_iter().flatten());
        }
        Ok(())
    }

    pub fn accumulate(&mut self) {
        for coco_eval in self.coco_eval.values_mut() {
            coco_eval.accumulate();
        }
    }

    pub fn summarize(&mut self) -> Result<()> {
        for (iou_type, coco_eval) in &mut self.coco_eval {
            info!("IoU metric: {}", iou_type);
            coco_eval.summarize()?;
        }
        Ok(())
    }

    /// Summary statistics of an IoU type, available after [CocoEvaluator::summarize].
    pub fn stats(&self, iou_type: IouType) -> Option<[f64; NUM_STATS]> {
        self.coco_eval.get(&iou_type)?.stats().copied()
    }
}
