//! Core runtime for distributed RLHF workers
//!
//! This crate provides the pieces every worker role builds on: role
//! and lifecycle types, configuration with batch-size normalization,
//! device mesh construction, an in-process collective group, and
//! accelerator memory accounting with explicit offload control.

pub mod collective;
pub mod config;
pub mod error;
pub mod memory;
pub mod offload;
pub mod topology;
pub mod types;

pub use collective::{CollectiveGroup, LocalGroup, DEFAULT_COLLECTIVE_TIMEOUT};
pub use config::{
    dp_size, normalize_micro_batch, ActorConfig, ActorRolloutRefConfig, CreditConfig, CriticConfig,
    FsdpConfig, JudgeConfig, ModelConfig, NormalizedBatchSizes, OptimConfig, RefConfig,
    RetryConfig, RewardBackend, RewardModelConfig, RolloutConfig,
};
pub use error::{Error, Result};
pub use memory::{AcceleratorPool, MemoryClaim};
pub use offload::{OffloadController, Residency};
pub use topology::{
    build_fsdp_mesh, build_sequence_parallel_mesh, DeviceMesh, MeshAxis, AXIS_DP, AXIS_FSDP,
    AXIS_SP,
};
pub use types::{LifecycleState, Rank, ResourceKind, Role, Step, TokenId};
