//! Scoped sharding managers for RLHF workers
//!
//! Two layout-conversion scopes wrap every cross-boundary computation:
//! the sequence-parallel manager splits batch token axes across a
//! process group, and the hand-off manager moves weights between the
//! training and inference representations.

pub mod handoff;
pub mod manager;
pub mod sequence_parallel;

pub use handoff::{HandoffShardingManager, WeightBridge};
pub use manager::{run_scoped, run_scoped_with, ShardingManager};
pub use sequence_parallel::UlyssesShardingManager;
