//! Numeric delegate seams for the role workers
//!
//! Workers own resource lifecycle and data movement; the numeric work
//! itself is delegated through these traits. A production deployment
//! plugs real engines in at `init_model` time through a builder
//! closure; tests plug in fakes. Delegates are synchronous because each
//! worker process runs its numeric code single-threaded, suspending
//! only at collective and network boundaries outside the delegate.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use data_batch::TensorBatch;
use runtime_core::config::OptimConfig;
use runtime_core::error::{Error, Result};

use crate::metrics::Metrics;

/// Opaque serialized model and optimizer state, as produced by a
/// trainable delegate for checkpointing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleState {
    /// Serialized model parameters
    pub model: Vec<u8>,

    /// Serialized optimizer state, empty for frozen modules
    pub optimizer: Vec<u8>,
}

/// Trainable policy delegate
pub trait PolicyModule: Send {
    /// One optimization step over the batch, returning loss metrics
    fn update(&mut self, batch: &TensorBatch) -> Result<Metrics>;

    /// Per-token log-probabilities over the batch's full token grid.
    /// Column `t` of the result aligns with token column `t` of
    /// `input_ids`; the caller slices out the response region.
    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>>;

    /// Snapshot of the current model and optimizer state
    fn state(&self) -> Result<ModuleState>;

    /// Restores a previously snapshotted state
    fn restore(&mut self, state: &ModuleState) -> Result<()>;
}

/// Frozen reference policy delegate
pub trait RefModule: Send {
    /// Per-token log-probabilities, same grid contract as
    /// [`PolicyModule::log_probs`]
    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>>;
}

/// Generation engine delegate.
///
/// Runs inside the hand-off scope, so the published training weights
/// are visible for the duration of the call.
pub trait RolloutEngine: Send {
    /// Generates responses for a batch of prompts
    fn generate(&mut self, prompts: &TensorBatch) -> Result<TensorBatch>;
}

/// Trainable value-function delegate
pub trait ValueModule: Send {
    /// One optimization step over the batch, returning loss metrics
    fn update(&mut self, batch: &TensorBatch) -> Result<Metrics>;

    /// Per-token value estimates over the batch's full token grid
    fn values(&mut self, batch: &TensorBatch) -> Result<Array2<f32>>;

    /// Snapshot of the current model and optimizer state
    fn state(&self) -> Result<ModuleState>;

    /// Restores a previously snapshotted state
    fn restore(&mut self, state: &ModuleState) -> Result<()>;
}

/// Output head shape of a reward scoring model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreHead {
    /// One scalar per token position
    Scalar,

    /// A two-class distribution per token position
    TwoClass,
}

impl ScoreHead {
    /// Size of the trailing class axis
    pub fn classes(&self) -> usize {
        match self {
            ScoreHead::Scalar => 1,
            ScoreHead::TwoClass => 2,
        }
    }
}

/// Reward scoring model delegate
pub trait ScoreModule: Send {
    /// Head shape this module emits
    fn head(&self) -> ScoreHead;

    /// Forward pass producing a `(batch, tokens, classes)` score grid
    /// over the batch's full token grid
    fn forward(&mut self, batch: &TensorBatch) -> Result<Array3<f32>>;
}

/// Colocated generative judge delegate
pub trait JudgeEngine: Send {
    /// Generates the judge's evaluation text for one prompt
    fn generate_text(&mut self, prompt: &str) -> Result<String>;
}

/// Keeps the trailing `response_len` token columns of a delegate's
/// full-width output grid
pub(crate) fn slice_response_cols(
    output: TensorBatch,
    name: &str,
    response_len: usize,
) -> Result<TensorBatch> {
    let total = output.uniform_cols()?;
    let start = total
        .checked_sub(response_len)
        .ok_or_else(|| Error::ShapeMismatch {
            name: name.to_string(),
            message: format!(
                "output grid has {} columns, response region needs {}",
                total, response_len
            ),
        })?;
    output.slice_cols(start..total)
}

/// Constant learning rate with linear warmup.
///
/// Mirrors the schedule used for both policy and critic optimizers:
/// the rate climbs linearly from zero over the warmup steps, then
/// holds at the configured peak. Serialized into checkpoints so a
/// restored worker resumes mid-schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    base_lr: f64,
    warmup_steps: u64,
    steps_taken: u64,
}

impl LrScheduler {
    pub fn new(base_lr: f64, warmup_steps: u64) -> Self {
        Self {
            base_lr,
            warmup_steps,
            steps_taken: 0,
        }
    }

    /// Builds the schedule from optimizer settings; warmup length is
    /// the configured ratio of total training steps, rounded down
    pub fn from_config(optim: &OptimConfig) -> Self {
        let warmup_steps =
            (optim.lr_warmup_steps_ratio * optim.total_training_steps as f64) as u64;
        Self::new(optim.lr, warmup_steps)
    }

    /// Learning rate at the current step count
    pub fn current_lr(&self) -> f64 {
        if self.warmup_steps == 0 {
            return self.base_lr;
        }
        let factor = (self.steps_taken as f64 / self.warmup_steps as f64).min(1.0);
        self.base_lr * factor
    }

    /// Advances the schedule by one step and returns the new rate
    pub fn step(&mut self) -> f64 {
        self.steps_taken += 1;
        self.current_lr()
    }

    /// Number of steps taken so far
    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }
}
