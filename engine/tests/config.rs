use anyhow::Result;
use approx::assert_abs_diff_eq;
use engine::config::Config;
use std::path::{Path, PathBuf};

lazy_static::lazy_static! {
    static ref CONFIG_DIR: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("cfg");
}

#[test]
fn load_engine_config() -> Result<()> {
    let config = Config::open(CONFIG_DIR.join("engine.json5"))?;
    let training = &config.training;

    assert_eq!(training.print_freq, 50);
    assert_abs_diff_eq!(training.clip_max_norm.raw(), 0.1);
    assert!(training.measure_throughput);
    assert_eq!(training.throughput_warmup, 2);
    assert!(!training.exit_on_non_finite);

    let evaluation = &config.evaluation;
    assert_eq!(evaluation.print_freq, 10);
    assert_eq!(evaluation.inference_warmup, 4);
    let panoptic = evaluation.panoptic.as_ref().unwrap();
    assert!(panoptic.ann_folder.ends_with("panoptic_val2017"));

    Ok(())
}

#[test]
fn empty_config_uses_defaults() -> Result<()> {
    let config: Config = json5::from_str("{}")?;

    assert_eq!(config.training.print_freq, 10);
    assert_eq!(config.training.clip_max_norm.raw(), 0.0);
    assert!(!config.training.measure_throughput);
    assert_eq!(config.training.throughput_warmup, 1);
    assert!(config.training.exit_on_non_finite);
    assert_eq!(config.evaluation.inference_warmup, 4);
    assert!(config.evaluation.panoptic.is_none());

    Ok(())
}

#[test]
fn missing_file_is_an_error() {
    assert!(Config::open(CONFIG_DIR.join("no_such_file.json5")).is_err());
}
