//! Smoothed meters and periodic progress logging.

use crate::common::*;

/// How a [SmoothedValue] renders itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterFormat {
    /// `median (global_avg)` with the given decimals.
    MedianGlobalAvg(usize),
    /// The latest value with the given decimals.
    Value(usize),
    /// The window average with the given decimals.
    Avg(usize),
}

impl Default for MeterFormat {
    fn default() -> Self {
        Self::MedianGlobalAvg(4)
    }
}

/// Tracks a series of values over a sliding window and over the whole run.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: f64,
    format: MeterFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20, MeterFormat::default())
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, format: MeterFormat) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0.0,
            format,
        }
    }

    pub fn update(&mut self, value: f64) {
        self.update_n(value, 1);
    }

    /// Records `value` as the mean of `n` samples.
    pub fn update_n(&mut self, value: f64, n: usize) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n as f64;
        self.total += value * n as f64;
    }

    /// Sums count and total over all workers. The window stays local.
    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        let reduced = process_group::all_reduce_sum(group, &[self.count, self.total])?;
        self.count = reduced[0];
        self.total = reduced[1];
        Ok(())
    }

    /// The lower median of the window.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }
        let mut sorted: Vec<_> = self.window.iter().copied().collect();
        sorted.sort_by(|lhs, rhs| lhs.total_cmp(rhs));
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return f64::NAN;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        self.total / self.count
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NAN, f64::max)
    }

    /// The latest value.
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(f64::NAN)
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianGlobalAvg(prec) => write!(
                f,
                "{:.prec$} ({:.prec$})",
                self.median(),
                self.global_avg(),
                prec = prec
            ),
            MeterFormat::Value(prec) => write!(f, "{:.prec$}", self.value(), prec = prec),
            MeterFormat::Avg(prec) => write!(f, "{:.prec$}", self.avg(), prec = prec),
        }
    }
}

/// A named, ordered collection of [SmoothedValue] meters.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: IndexMap<String, SmoothedValue>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            meters: IndexMap::new(),
            delimiter: delimiter.into(),
        }
    }

    pub fn add_meter(&mut self, name: impl Into<String>, meter: SmoothedValue) {
        self.meters.insert(name.into(), meter);
    }

    /// Records a value, creating a default meter for unseen names.
    pub fn update(&mut self, name: &str, value: f64) {
        match self.meters.get_mut(name) {
            Some(meter) => meter.update(value),
            None => {
                let mut meter = SmoothedValue::default();
                meter.update(value);
                self.meters.insert(name.to_string(), meter);
            }
        }
    }

    pub fn update_many<'a>(&mut self, values: impl IntoIterator<Item = (&'a String, &'a f64)>) {
        values
            .into_iter()
            .for_each(|(name, &value)| self.update(name, value));
    }

    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    pub fn meters(&self) -> &IndexMap<String, SmoothedValue> {
        &self.meters
    }

    /// Sums counts and totals of all meters across workers. Workers must
    /// hold the same meters in the same order.
    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
        let local: Vec<f64> = self
            .meters
            .values()
            .flat_map(|meter| [meter.count, meter.total])
            .collect();
        let reduced = process_group::all_reduce_sum(group, &local)?;
        ensure!(
            reduced.len() == local.len(),
            "workers hold different sets of meters"
        );

        for (meter, pair) in self.meters.values_mut().zip(reduced.chunks(2)) {
            meter.count = pair[0];
            meter.total = pair[1];
        }
        Ok(())
    }

    /// The global average of every meter.
    pub fn global_averages(&self) -> IndexMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .meters
            .iter()
            .map(|(name, meter)| format!("{}: {}", name, meter))
            .join(&self.delimiter);
        write!(f, "{}", text)
    }
}

/// Drives progress logging over a stream of batches.
///
/// Call [LogEvery::next] to fetch an item, which measures the data loading
/// time, and [LogEvery::log] once the item has been processed.
#[derive(Debug)]
pub struct LogEvery {
    header: String,
    print_freq: usize,
    total: Option<usize>,
    index: usize,
    start: Instant,
    end: Instant,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
}

impl LogEvery {
    /// `total` is the stream length when it is known in advance.
    pub fn new(header: impl Into<String>, print_freq: usize, total: Option<usize>) -> Self {
        let now = Instant::now();
        Self {
            header: header.into(),
            print_freq: print_freq.max(1),
            total,
            index: 0,
            start: now,
            end: now,
            iter_time: SmoothedValue::new(20, MeterFormat::Avg(4)),
            data_time: SmoothedValue::new(20, MeterFormat::Avg(4)),
        }
    }

    /// Pulls the next item and records how long it took.
    pub fn next<I>(&mut self, iter: &mut I) -> Option<I::Item>
    where
        I: Iterator,
    {
        let item = iter.next();
        if item.is_some() {
            self.data_time.update(self.end.elapsed().as_secs_f64());
        }
        item
    }

    /// Finishes an iteration and logs progress when due.
    pub fn log(&mut self, metric_logger: &MetricLogger) {
        self.iter_time.update(self.end.elapsed().as_secs_f64());

        let is_last = self.total.map(|total| self.index + 1 == total).unwrap_or(false);
        if self.index % self.print_freq == 0 || is_last {
            let progress = match self.total {
                Some(total) => {
                    let width = total.to_string().len();
                    let eta = self.iter_time.global_avg() * total.saturating_sub(self.index) as f64;
                    format!(
                        "[{:>width$}/{}]  eta: {}",
                        self.index,
                        total,
                        format_duration(eta),
                        width = width
                    )
                }
                None => format!("[{}]", self.index),
            };

            info!(
                "{}  {}  {}  time: {}  data: {}",
                self.header, progress, metric_logger, self.iter_time, self.data_time
            );
        }

        self.index += 1;
        self.end = Instant::now();
    }

    /// The number of completed iterations.
    pub fn iterations(&self) -> usize {
        self.index
    }

    /// Logs the total time and returns it.
    pub fn finish(self) -> Duration {
        let total_time = self.start.elapsed();
        let per_iter = total_time.as_secs_f64() / self.index.max(1) as f64;
        info!(
            "{} Total time: {} ({:.4} s / it)",
            self.header,
            format_duration(total_time.as_secs_f64()),
            per_iter
        );
        total_time
    }
}

/// Formats seconds as `h:mm:ss`.
pub fn format_duration(seconds: f64) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use process_group::SingleProcess;

    #[test]
    fn smoothed_value_statistics() {
        let mut meter = SmoothedValue::new(3, MeterFormat::default());
        for value in [5.0, 1.0, 4.0, 2.0] {
            meter.update(value);
        }

        // the window holds 1, 4, 2
        assert_eq!(meter.median(), 2.0);
        assert_abs_diff_eq!(meter.avg(), 7.0 / 3.0, epsilon = 1e-12);
        assert_eq!(meter.max(), 4.0);
        assert_eq!(meter.value(), 2.0);
        assert_abs_diff_eq!(meter.global_avg(), 3.0, epsilon = 1e-12);
        assert_eq!(meter.to_string(), "2.0000 (3.0000)");
    }

    #[test]
    fn lower_median_of_even_window() {
        let mut meter = SmoothedValue::default();
        for value in [4.0, 1.0, 3.0, 2.0] {
            meter.update(value);
        }
        assert_eq!(meter.median(), 2.0);
    }

    #[test]
    fn value_format() {
        let mut meter = SmoothedValue::new(1, MeterFormat::Value(6));
        meter.update(0.5);
        meter.update(0.0001);
        assert_eq!(meter.to_string(), "0.000100");
        assert_abs_diff_eq!(meter.global_avg(), 0.25005, epsilon = 1e-12);
    }

    #[test]
    fn logger_keeps_meter_order() {
        let mut logger = MetricLogger::default();
        logger.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value(6)));
        logger.update("loss", 2.0);
        logger.update("lr", 0.1);
        logger.update("loss", 4.0);
        logger.synchronize_between_processes(&SingleProcess).unwrap();

        let averages = logger.global_averages();
        assert_eq!(averages.keys().collect::<Vec<_>>(), vec!["lr", "loss"]);
        assert_eq!(averages["loss"], 3.0);
        assert_eq!(
            logger.to_string(),
            "lr: 0.100000  loss: 4.0000 (3.0000)"
        );
    }

    #[test]
    fn log_every_counts_iterations() {
        let logger = MetricLogger::default();
        let mut iter = 0..3;
        let mut progress = LogEvery::new("Test:", 2, Some(3));
        let mut items = vec![];

        while let Some(item) = progress.next(&mut iter) {
            items.push(item);
            progress.log(&logger);
        }

        assert_eq!(items, vec![0, 1, 2]);
        assert_eq!(progress.iterations(), 3);
        progress.finish();
    }

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(0.4), "0:00:00");
        assert_eq!(format_duration(3725.0), "1:02:05");
        assert_eq!(format_duration(f64::NAN), "0:00:00");
    }
}
