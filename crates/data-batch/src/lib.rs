//! Tensor batch plumbing for RLHF workers
//!
//! Provides the named tensor batch exchanged between worker roles and
//! the token-budget rearrangement used for dynamic micro-batching.

pub mod batch;
pub mod rearrange;

pub use batch::{keys, names, Device, MetaValue, Tensor, TensorBatch};
pub use rearrange::{
    concat_order, effective_lengths, rearrange_micro_batches, reverse_index, split_by_token_budget,
};
