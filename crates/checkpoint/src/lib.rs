//! Durable training-state snapshots
//!
//! Async snapshot writes with atomic rename, step-keyed lookup, and pruning
//! of superseded checkpoints.

pub mod manager;
pub mod writer;

pub use manager::{
    read_snapshot, CheckpointRecord, CheckpointStore, CheckpointStoreConfig, TrainSnapshot,
    WriteStatus,
};
pub use writer::{read_snapshot_data, SnapshotWriter, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
