//! Core types shared across the RLHF worker runtime

use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear rank of a process in the device mesh
pub type Rank = usize;

/// Global training step number
pub type Step = u64;

/// Vocabulary token id
pub type TokenId = i64;

/// Role composition of a worker process.
///
/// A worker is constructed for exactly one role. Hybrid roles colocate
/// several capabilities in one process and share a single model engine
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Policy training only
    Actor,

    /// Generation only
    Rollout,

    /// Frozen reference policy only
    Ref,

    /// Policy training colocated with generation
    ActorRollout,

    /// Policy training, generation, and reference scoring in one process
    ActorRolloutRef,

    /// Value function training
    Critic,

    /// Reward scoring (classifier, process classifier, or judge backed)
    Reward,
}

impl Role {
    /// Whether this role carries the trainable policy
    pub fn has_actor(&self) -> bool {
        matches!(self, Role::Actor | Role::ActorRollout | Role::ActorRolloutRef)
    }

    /// Whether this role carries the generation engine
    pub fn has_rollout(&self) -> bool {
        matches!(self, Role::Rollout | Role::ActorRollout | Role::ActorRolloutRef)
    }

    /// Whether this role carries the frozen reference policy
    pub fn has_ref(&self) -> bool {
        matches!(self, Role::Ref | Role::ActorRolloutRef)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Actor => "actor",
            Role::Rollout => "rollout",
            Role::Ref => "ref",
            Role::ActorRollout => "actor_rollout",
            Role::ActorRolloutRef => "actor_rollout_ref",
            Role::Critic => "critic",
            Role::Reward => "reward",
        };
        write!(f, "{}", s)
    }
}

/// A worker-held resource whose accelerator residency is managed
/// explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Model parameters
    Params,

    /// Optimizer state
    Optimizer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Params => write!(f, "params"),
            ResourceKind::Optimizer => write!(f, "optimizer"),
        }
    }
}

/// Lifecycle state of a worker process.
///
/// Workers move strictly forward: operations that touch the model are
/// rejected until init_model has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Constructed, model not yet built
    Uninitialized,

    /// Model engine built and registered with the memory pool
    ModelBuilt,

    /// Ready to serve operations
    Ready,
}

impl LifecycleState {
    /// Whether model-touching operations may run in this state
    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }
}
