//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::{iproduct, izip, Itertools as _};
pub use process_group::ProcessGroup;
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt, fs, iter,
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tracing::info;
