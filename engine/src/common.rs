//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use noisy_float::prelude::*;
pub use process_group::ProcessGroup;
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{Device, Kind, Tensor};
pub use tch_tensor_like::TensorLike;
pub use tracing::{error, info, warn};
