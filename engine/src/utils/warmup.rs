use crate::common::*;

/// Collects measurements after discarding the first `skip` ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmupMeter {
    skip: usize,
    seen: usize,
    values: Vec<f64>,
}

impl WarmupMeter {
    pub fn new(skip: usize) -> Self {
        Self {
            skip,
            seen: 0,
            values: vec![],
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.seen >= self.skip {
            self.values.push(value);
        }
        self.seen += 1;
    }

    /// The number of measurements pushed, kept or not.
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// The mean of the kept values, or `None` if all were discarded.
    pub fn mean(&self) -> Option<f64> {
        (!self.values.is_empty()).then(|| self.values.iter().sum::<f64>() / self.values.len() as f64)
    }
}
