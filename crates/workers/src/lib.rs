//! Role workers for distributed RLHF training
//!
//! Each worker owns one rank's share of a role: the combined actor /
//! rollout / reference worker, the critic, and the reward scorer. The
//! workers manage accelerator residency, batch placement, sharding
//! scopes, and checkpointing around pluggable model engines supplied
//! through component builders at `init_model` time.

pub mod actor;
pub mod critic;
pub mod metrics;
pub mod model;
pub mod reward;

pub use actor::{ActorComponentBuilder, ActorComponents, ActorRolloutRefWorker};
pub use critic::{CriticComponentBuilder, CriticComponents, CriticWorker};
pub use metrics::{append_perf_metrics, Metrics, Timer};
pub use model::{
    JudgeEngine, LrScheduler, ModuleState, PolicyModule, RefModule, RolloutEngine, ScoreHead,
    ScoreModule, ValueModule,
};
pub use reward::{RewardComponentBuilder, RewardComponents, RewardWorker};
