//! Error types for the RLHF worker runtime

use thiserror::Error;

use crate::types::ResourceKind;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the RLHF worker runtime
#[derive(Error, Debug)]
pub enum Error {
    // Topology / configuration errors
    #[error("Hybrid sharding is not supported: fsdp_size {fsdp_size} with world size {world_size} (set fsdp_size=-1 for full sharding)")]
    UnsupportedTopology { world_size: usize, fsdp_size: i64 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Batch size {name}={value} is not divisible by {divisor}")]
    BatchSizeIndivisible {
        name: String,
        value: usize,
        divisor: usize,
    },

    // Worker lifecycle errors
    #[error("Operation {operation} requires an initialized worker")]
    NotInitialized { operation: String },

    #[error("init_model called twice for role {role}")]
    AlreadyInitialized { role: String },

    #[error("Operation {operation} is not available for role {role}")]
    MissingCapability { operation: String, role: String },

    // Accelerator memory errors
    #[error("Accelerator allocation failed for {label}: requested {requested} bytes, {available} free")]
    AllocationFailed {
        label: String,
        requested: u64,
        available: u64,
    },

    #[error("{resource} already resident on accelerator")]
    AlreadyResident { resource: ResourceKind },

    #[error("{resource} not resident on accelerator")]
    NotResident { resource: ResourceKind },

    // Batch errors
    #[error("Tensor not found in batch: {name}")]
    TensorNotFound { name: String },

    #[error("Tensor {name} has batch dimension {actual}, expected {expected}")]
    MisalignedBatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Tensor {name}: {message}")]
    ShapeMismatch { name: String, message: String },

    #[error("Tensor {name} already present in batch")]
    DuplicateTensor { name: String },

    #[error("Sample of {sample_tokens} tokens exceeds micro-batch token budget {budget}")]
    TokenBudgetExceeded { sample_tokens: usize, budget: usize },

    // Sharding / hand-off errors
    #[error("Weight conversion failed: {message}")]
    WeightConversion { message: String },

    // Collective errors
    #[error("Collective {operation} timed out after {timeout_ms}ms (rank {rank})")]
    CollectiveTimeout {
        operation: String,
        rank: usize,
        timeout_ms: u64,
    },

    // Checkpoint errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    // Remote judge errors
    #[error("Judge endpoint unreachable: {url} - {reason}")]
    JudgeUnreachable { url: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is a configuration error that should
    /// abort construction rather than be retried.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedTopology { .. }
                | Error::InvalidConfig { .. }
                | Error::BatchSizeIndivisible { .. }
        )
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_))
    }

    /// Returns true if this error indicates a fatal condition for the
    /// surrounding operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedTopology { .. }
                | Error::InvalidConfig { .. }
                | Error::BatchSizeIndivisible { .. }
                | Error::AllocationFailed { .. }
                | Error::AlreadyResident { .. }
                | Error::NotResident { .. }
                | Error::WeightConversion { .. }
                | Error::CollectiveTimeout { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
