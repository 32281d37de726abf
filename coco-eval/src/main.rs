use anyhow::{Context, Result};
use coco_eval::{pq_compute, CocoDataset, CocoEvaluator, IouType, ResultAnnotation};
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Evaluate detection results with COCO metrics.
enum Args {
    Bbox {
        /// ground truth annotation file
        gt_file: PathBuf,
        /// detection results file
        results_file: PathBuf,
    },
    Segm {
        /// ground truth annotation file
        gt_file: PathBuf,
        /// segmentation results file
        results_file: PathBuf,
    },
    Panoptic {
        /// ground truth panoptic annotation file
        gt_json: PathBuf,
        /// predicted panoptic annotation file
        pred_json: PathBuf,
        #[structopt(long)]
        /// directory of ground truth PNGs
        gt_folder: Option<PathBuf>,
        #[structopt(long)]
        /// directory of predicted PNGs
        pred_folder: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match Args::from_args() {
        Args::Bbox {
            gt_file,
            results_file,
        } => coco(gt_file, results_file, IouType::Bbox)?,
        Args::Segm {
            gt_file,
            results_file,
        } => coco(gt_file, results_file, IouType::Segm)?,
        Args::Panoptic {
            gt_json,
            pred_json,
            gt_folder,
            pred_folder,
        } => {
            let results = pq_compute(
                &gt_json,
                &pred_json,
                gt_folder.as_deref(),
                pred_folder.as_deref(),
            )?;
            results.to_table().printstd();
        }
    }

    Ok(())
}

fn coco(gt_file: PathBuf, results_file: PathBuf, iou_type: IouType) -> Result<()> {
    let gt = Arc::new(
        CocoDataset::open(&gt_file)
            .with_context(|| format!("failed to load '{}'", gt_file.display()))?,
    );
    let results = ResultAnnotation::open_many(&results_file)?;
    info!("loaded {} results", results.len());

    let image_ids = gt.image_ids();
    let mut evaluator = CocoEvaluator::new(gt, [iou_type]);
    evaluator.update_results(&image_ids, &results)?;
    evaluator.accumulate();
    evaluator.summarize()?;

    Ok(())
}
