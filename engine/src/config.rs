//! Engine configuration format.

use crate::common::*;

pub use evaluation::*;
pub use training::*;

/// The main engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod training {
    use super::*;

    /// Options of a training epoch.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        /// Log progress every this many iterations.
        #[serde(default = "default_print_freq")]
        pub print_freq: usize,
        /// Clip the global gradient norm to this value. Zero disables clipping.
        #[serde(default = "default_clip_max_norm")]
        pub clip_max_norm: R64,
        /// Time the forward and backward phases and report batches per second.
        #[serde(default)]
        pub measure_throughput: bool,
        /// The number of leading throughput measurements to discard.
        #[serde(default = "default_throughput_warmup")]
        pub throughput_warmup: usize,
        /// Exit the process with code 1 on a non-finite loss instead of
        /// returning an error.
        #[serde(default = "default_exit_on_non_finite")]
        pub exit_on_non_finite: bool,
    }

    impl Default for TrainingConfig {
        fn default() -> Self {
            Self {
                print_freq: default_print_freq(),
                clip_max_norm: default_clip_max_norm(),
                measure_throughput: false,
                throughput_warmup: default_throughput_warmup(),
                exit_on_non_finite: default_exit_on_non_finite(),
            }
        }
    }

    fn default_print_freq() -> usize {
        10
    }

    fn default_clip_max_norm() -> R64 {
        r64(0.0)
    }

    fn default_throughput_warmup() -> usize {
        1
    }

    fn default_exit_on_non_finite() -> bool {
        true
    }
}

mod evaluation {
    use super::*;

    /// Options of an evaluation pass.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        #[serde(default = "default_print_freq")]
        pub print_freq: usize,
        /// The number of leading inference latencies to discard.
        #[serde(default = "default_inference_warmup")]
        pub inference_warmup: usize,
        /// Panoptic ground truth, required by panoptic post-processing.
        #[serde(default)]
        pub panoptic: Option<PanopticConfig>,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self {
                print_freq: default_print_freq(),
                inference_warmup: default_inference_warmup(),
                panoptic: None,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PanopticConfig {
        /// The panoptic annotation JSON file.
        pub ann_file: PathBuf,
        /// The directory of ground truth PNG files.
        pub ann_folder: PathBuf,
    }

    fn default_print_freq() -> usize {
        10
    }

    fn default_inference_warmup() -> usize {
        4
    }
}
