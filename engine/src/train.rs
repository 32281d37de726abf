//! The training epoch driver.

use crate::{
    common::*,
    config::TrainingConfig,
    data::Batch,
    error::EngineError,
    losses::{self, LossTerms},
    metric_logger::{LogEvery, MeterFormat, MetricLogger, SmoothedValue},
    model::{Criterion, DetectionModel, Optimizer},
    utils::{self, WarmupMeter},
};

/// Batches per second of an epoch in throughput mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputReport {
    /// The batch size of the first batch.
    pub batch_size: usize,
    pub steps: usize,
    pub samples: usize,
    /// Mean forward batches per second after the warm-up measurements.
    pub forward: Option<f64>,
    /// Mean backward batches per second after the warm-up measurements.
    pub backward: Option<f64>,
    /// Steps over the wall time of the whole epoch.
    pub total: f64,
    /// Samples over the wall time of the whole epoch.
    pub samples_per_sec: f64,
}

/// Global averages of the training meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    #[serde(flatten)]
    pub meters: IndexMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput: Option<ThroughputReport>,
}

#[derive(Debug)]
struct ThroughputMeter {
    forward: WarmupMeter,
    backward: WarmupMeter,
    batch_size: Option<usize>,
    steps: usize,
    samples: usize,
}

impl ThroughputMeter {
    fn new(warmup: usize) -> Self {
        Self {
            forward: WarmupMeter::new(warmup),
            backward: WarmupMeter::new(warmup),
            batch_size: None,
            steps: 0,
            samples: 0,
        }
    }

    fn push(&mut self, batch_size: usize, forward: Duration, backward: Duration) {
        self.forward.push(1.0 / forward.as_secs_f64());
        self.backward.push(1.0 / backward.as_secs_f64());
        self.batch_size.get_or_insert(batch_size);
        self.steps += 1;
        self.samples += batch_size;
    }

    fn report(&self, elapsed: Duration) -> ThroughputReport {
        let report = ThroughputReport {
            batch_size: self.batch_size.unwrap_or(0),
            steps: self.steps,
            samples: self.samples,
            forward: self.forward.mean(),
            backward: self.backward.mean(),
            total: self.steps as f64 / elapsed.as_secs_f64(),
            samples_per_sec: self.samples as f64 / elapsed.as_secs_f64(),
        };

        info!(
            "batch size: {}\tsteps: {}\tsamples: {}",
            report.batch_size, report.steps, report.samples
        );
        match report.forward {
            Some(rate) => info!("forward throughput: {:.2} batches/s", rate),
            None => warn!("no forward throughput measurement left after warm-up"),
        }
        match report.backward {
            Some(rate) => info!("backward throughput: {:.2} batches/s", rate),
            None => warn!("no backward throughput measurement left after warm-up"),
        }
        info!(
            "overall throughput: {:.2} batches/s ({:.2} samples/s)",
            report.total, report.samples_per_sec
        );

        report
    }
}

/// Runs one training epoch over `data_loader`.
///
/// Each batch is moved to `device`, fed forward in training mode, and the
/// weighted loss is back-propagated before an optimizer step. Loss terms
/// are averaged across the workers of `group` for logging. A non-finite
/// total loss stops the epoch before the optimizer is touched.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch<M, C, I>(
    model: &mut M,
    criterion: &C,
    data_loader: I,
    optimizer: &mut dyn Optimizer,
    device: Device,
    epoch: usize,
    config: &TrainingConfig,
    group: &dyn ProcessGroup,
) -> Result<EpochStats>
where
    M: DetectionModel,
    C: Criterion<M::Output>,
    I: IntoIterator<Item = Result<Batch>>,
{
    let TrainingConfig {
        print_freq,
        clip_max_norm,
        measure_throughput,
        throughput_warmup,
        exit_on_non_finite,
        ..
    } = *config;
    let clip_max_norm = clip_max_norm.raw();

    let variables = model.trainable_variables();
    {
        let num_params: i64 = variables
            .iter()
            .map(|var| var.size().iter().product::<i64>())
            .sum();
        info!(
            "number of trainable parameters: {:.2}M",
            num_params as f64 / 1e6
        );
    }

    let mut metric_logger = MetricLogger::default();
    metric_logger.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value(6)));
    metric_logger.add_meter(
        losses::CLASS_ERROR,
        SmoothedValue::new(1, MeterFormat::Value(2)),
    );

    let mut batches = data_loader.into_iter();
    let total = match batches.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    };
    let mut progress = LogEvery::new(format!("Epoch: [{}]", epoch), print_freq, total);
    let mut throughput = measure_throughput.then(|| ThroughputMeter::new(throughput_warmup));
    let since = Instant::now();

    while let Some(batch) = progress.next(&mut batches) {
        let batch = batch?.to_device(device);
        let batch_size = batch.batch_size();
        let Batch { samples, targets } = batch;

        // forward
        utils::synchronize(device);
        let forward_since = Instant::now();

        let outputs = model.forward_t(&samples, true)?;
        let loss_dict = criterion.forward(&outputs, &targets)?;
        let weight_dict = criterion.weight_dict();
        let loss = losses::weighted_loss(&loss_dict, weight_dict)?;
        let terms = LossTerms::reduce(&loss_dict, weight_dict, group)?;

        if !terms.total.is_finite() {
            error!("Loss is {}, stopping training", terms.total);
            error!("{:?}", terms.reduced);
            if exit_on_non_finite {
                std::process::exit(1);
            }
            return Err(EngineError::NonFiniteLoss {
                value: terms.total,
                losses: terms.reduced,
            }
            .into());
        }

        utils::synchronize(device);
        let forward_time = forward_since.elapsed();

        // backward
        let backward_since = Instant::now();

        optimizer.zero_grad();
        loss.backward();
        if clip_max_norm > 0.0 {
            utils::clip_grad_norm(&variables, clip_max_norm);
        }
        optimizer.step();

        utils::synchronize(device);
        let backward_time = backward_since.elapsed();

        if let Some(throughput) = &mut throughput {
            throughput.push(batch_size, forward_time, backward_time);
        }

        terms.log_to(&mut metric_logger);
        metric_logger.update(losses::CLASS_ERROR, terms.class_error()?);
        metric_logger.update("lr", optimizer.lr());
        progress.log(&metric_logger);
    }

    progress.finish();
    let elapsed = since.elapsed();

    metric_logger.synchronize_between_processes(group)?;
    info!("Averaged stats: {}", metric_logger);

    Ok(EpochStats {
        meters: metric_logger.global_averages(),
        throughput: throughput.map(|throughput| throughput.report(elapsed)),
    })
}
