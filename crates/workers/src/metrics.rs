//! Training metrics helpers

use std::collections::BTreeMap;
use std::time::Instant;

use data_batch::{keys, TensorBatch};

/// Named scalar metrics reported by a worker operation
pub type Metrics = BTreeMap<String, f64>;

/// Wall-clock timer for a single operation
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Seconds elapsed since the timer started
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Appends throughput metrics derived from the batch's global token
/// counts.
///
/// The driver attaches per-rank token totals under
/// [`keys::GLOBAL_TOKEN_NUM`]; batches without it produce no
/// throughput metrics.
pub fn append_perf_metrics(metrics: &mut Metrics, batch: &TensorBatch, elapsed_secs: f64) {
    let Some(token_counts) = batch.meta_int_list(keys::GLOBAL_TOKEN_NUM) else {
        return;
    };
    let total_tokens: i64 = token_counts.iter().sum();
    if elapsed_secs > 0.0 {
        metrics.insert(
            "perf/throughput_tokens_per_sec".to_string(),
            total_tokens as f64 / elapsed_secs,
        );
    }
    metrics.insert("perf/time_per_step_s".to_string(), elapsed_secs);
}
