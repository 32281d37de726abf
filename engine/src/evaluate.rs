//! The evaluation driver.

use crate::{
    common::*,
    config::{EvaluationConfig, PanopticConfig},
    data::{self, Batch},
    error::EngineError,
    losses::{self, LossTerms},
    metric_logger::{LogEvery, MeterFormat, MetricLogger, SmoothedValue},
    model::{Criterion, DetectionModel, PanopticPostProcess, PostProcessors},
    utils::{self, WarmupMeter},
};
use coco_eval::{
    CocoDataset, CocoEvaluator, ImageDetections, IouType, PanopticEvaluator, PanopticPrediction,
    PqScore,
};

/// The sub-directory of the output directory receiving panoptic PNGs.
pub const PANOPTIC_OUTPUT_DIR: &str = "panoptic_eval";

/// Metrics of an evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalStats {
    /// Global averages of the loss meters.
    #[serde(flatten)]
    pub meters: IndexMap<String, f64>,
    /// Mean forward latency in seconds after warm-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_time: Option<f64>,
    /// The 12 COCO box statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coco_eval_bbox: Option<Vec<f64>>,
    /// The 12 COCO mask statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coco_eval_masks: Option<Vec<f64>>,
    #[serde(rename = "PQ_all", default, skip_serializing_if = "Option::is_none")]
    pub pq_all: Option<PqScore>,
    #[serde(rename = "PQ_th", default, skip_serializing_if = "Option::is_none")]
    pub pq_th: Option<PqScore>,
    #[serde(rename = "PQ_st", default, skip_serializing_if = "Option::is_none")]
    pub pq_st: Option<PqScore>,
}

struct PanopticPass<'a, O> {
    postprocess: &'a dyn PanopticPostProcess<O>,
    evaluator: PanopticEvaluator,
}

/// Runs the model over `data_loader` without gradients and evaluates the
/// post-processed detections against `base_ds`.
///
/// Box detections are always evaluated. Mask detections are evaluated when
/// `postprocessors.segm` is set, and panoptic quality is computed when
/// `postprocessors.panoptic` is set. Panoptic predictions are written under
/// `output_dir/panoptic_eval`.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<M, C, I>(
    model: &mut M,
    criterion: &C,
    postprocessors: &PostProcessors<M::Output>,
    data_loader: I,
    base_ds: Arc<CocoDataset>,
    device: Device,
    output_dir: &Path,
    config: &EvaluationConfig,
    group: &dyn ProcessGroup,
) -> Result<(EvalStats, CocoEvaluator)>
where
    M: DetectionModel,
    C: Criterion<M::Output>,
    I: IntoIterator<Item = Result<Batch>>,
{
    tch::no_grad(|| {
        evaluate_no_grad(
            model,
            criterion,
            postprocessors,
            data_loader,
            base_ds,
            device,
            output_dir,
            config,
            group,
        )
    })
}

#[allow(clippy::too_many_arguments)]
fn evaluate_no_grad<M, C, I>(
    model: &mut M,
    criterion: &C,
    postprocessors: &PostProcessors<M::Output>,
    data_loader: I,
    base_ds: Arc<CocoDataset>,
    device: Device,
    output_dir: &Path,
    config: &EvaluationConfig,
    group: &dyn ProcessGroup,
) -> Result<(EvalStats, CocoEvaluator)>
where
    M: DetectionModel,
    C: Criterion<M::Output>,
    I: IntoIterator<Item = Result<Batch>>,
{
    let EvaluationConfig {
        print_freq,
        inference_warmup,
        ref panoptic,
    } = *config;

    let mut metric_logger = MetricLogger::default();
    metric_logger.add_meter(
        losses::CLASS_ERROR,
        SmoothedValue::new(1, MeterFormat::Value(2)),
    );

    let iou_types: Vec<IouType> = postprocessors
        .segm
        .as_ref()
        .map(|_| IouType::Segm)
        .into_iter()
        .chain([IouType::Bbox])
        .collect();
    let mut coco_evaluator = CocoEvaluator::new(base_ds, iou_types);

    let mut panoptic_pass = match &postprocessors.panoptic {
        Some(postprocess) => {
            let PanopticConfig {
                ann_file,
                ann_folder,
            } = panoptic.as_ref().ok_or(EngineError::MissingPanopticSource)?;
            let evaluator = PanopticEvaluator::new(
                ann_file,
                ann_folder,
                output_dir.join(PANOPTIC_OUTPUT_DIR),
                group,
            )?;
            Some(PanopticPass {
                postprocess: postprocess.as_ref(),
                evaluator,
            })
        }
        None => None,
    };

    let mut batches = data_loader.into_iter();
    let total = match batches.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    };
    let mut progress = LogEvery::new("Test:", print_freq, total);
    let mut latencies = WarmupMeter::new(inference_warmup);

    while let Some(batch) = progress.next(&mut batches) {
        let Batch { samples, targets } = batch?.to_device(device);

        utils::synchronize(device);
        let since = Instant::now();
        let outputs = model.forward_t(&samples, false)?;
        utils::synchronize(device);
        latencies.push(since.elapsed().as_secs_f64());

        let loss_dict = criterion.forward(&outputs, &targets)?;
        let terms = LossTerms::reduce(&loss_dict, criterion.weight_dict(), group)?;
        terms.log_to(&mut metric_logger);
        metric_logger.update(losses::CLASS_ERROR, terms.class_error()?);

        let orig_target_sizes =
            data::stack_sizes(targets.iter().map(|target| target.orig_size), device);
        let target_sizes = data::stack_sizes(targets.iter().map(|target| target.size), device);

        let mut results = postprocessors.bbox.forward(&outputs, &orig_target_sizes)?;
        if let Some(segm) = &postprocessors.segm {
            results = segm.forward(results, &outputs, &orig_target_sizes, &target_sizes)?;
        }
        ensure!(
            results.len() == targets.len(),
            "post-processing produced {} results for {} images",
            results.len(),
            targets.len()
        );

        let res: IndexMap<i64, ImageDetections> = izip!(&targets, &results)
            .map(|(target, detection)| -> Result<_> {
                Ok((target.image_id, detection.to_image_detections()?))
            })
            .collect::<Result<_>>()?;
        coco_evaluator.update(&res)?;

        if let Some(PanopticPass {
            postprocess,
            evaluator,
        }) = &mut panoptic_pass
        {
            let segments = postprocess.forward(&outputs, &target_sizes, &orig_target_sizes)?;
            ensure!(
                segments.len() == targets.len(),
                "panoptic post-processing produced {} results for {} images",
                segments.len(),
                targets.len()
            );

            let predictions: Vec<_> = izip!(&targets, segments)
                .map(|(target, output)| PanopticPrediction {
                    image_id: target.image_id,
                    file_name: data::panoptic_file_name(target.image_id),
                    png_string: output.png_string,
                    segments_info: output.segments_info,
                })
                .collect();
            evaluator.update(predictions)?;
        }

        progress.log(&metric_logger);
    }

    progress.finish();

    let inference_time = latencies.mean();
    info!("inference times: {:?}", latencies.values());
    match inference_time {
        Some(mean) => info!("average inference time: {:.4} s", mean),
        None => warn!(
            "all {} inference times fall within the warm-up",
            latencies.seen()
        ),
    }

    // gather the stats from all processes
    metric_logger.synchronize_between_processes(group)?;
    info!("Averaged stats: {}", metric_logger);

    coco_evaluator.synchronize_between_processes(group)?;
    if let Some(pass) = &mut panoptic_pass {
        pass.evaluator.synchronize_between_processes(group)?;
    }

    coco_evaluator.accumulate();
    coco_evaluator.summarize()?;

    let panoptic_results = match &panoptic_pass {
        Some(pass) => pass.evaluator.summarize(group)?,
        None => None,
    };

    let stats_of = |iou_type: IouType| coco_evaluator.stats(iou_type).map(|stats| stats.to_vec());
    let stats = EvalStats {
        meters: metric_logger.global_averages(),
        inference_time,
        coco_eval_bbox: stats_of(IouType::Bbox),
        coco_eval_masks: stats_of(IouType::Segm),
        pq_all: panoptic_results.as_ref().map(|results| results.all),
        pq_th: panoptic_results.as_ref().map(|results| results.things),
        pq_st: panoptic_results.as_ref().map(|results| results.stuff),
    };

    Ok((stats, coco_evaluator))
}
