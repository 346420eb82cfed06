//! Step-keyed checkpoint store
//!
//! Tracks one role's snapshots across training steps. Writes go through the
//! async writer; callers queue a snapshot, continue working, and call
//! [`CheckpointStore::wait_durable`] before any step that must not outrun its
//! checkpoint (collective barriers, pruning). Layout on disk is
//! `<base>/global_step_<N>/<role>.ckpt`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use runtime_core::{Error, Result, Step};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::writer::{read_snapshot_data, SnapshotWriter, WriteRequest, WriterEvent};

/// Serialized training state for one role at one step.
///
/// The state blobs are opaque to the store; workers fill them from their
/// model, optimizer, and scheduler delegates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSnapshot {
    pub role: String,
    pub global_step: Step,
    pub model_state: Vec<u8>,
    pub optimizer_state: Vec<u8>,
    pub scheduler_state: Vec<u8>,
}

impl TrainSnapshot {
    pub fn encode(&self) -> Result<Bytes> {
        let data = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Bytes::from(data))
    }
}

/// Decode a snapshot file written by [`CheckpointStore`].
pub async fn read_snapshot(path: &Path) -> Result<TrainSnapshot> {
    let data = read_snapshot_data(path).await?;
    bincode::deserialize(&data).map_err(|e| Error::CheckpointCorrupted {
        path: path.display().to_string(),
        reason: format!("snapshot payload: {e}"),
    })
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct CheckpointStoreConfig {
    /// Base directory holding `global_step_<N>` subdirectories
    pub base_path: PathBuf,

    /// Queue depth for the async writer
    pub queue_depth: usize,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            queue_depth: 16,
        }
    }
}

/// A durable snapshot known to the store
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Write identifier
    pub id: String,

    /// Training step
    pub step: Step,

    /// Role the snapshot belongs to
    pub role: String,

    /// Snapshot file path
    pub path: PathBuf,

    /// Size on disk including header
    pub size_bytes: u64,

    /// Completion time
    pub created_at: DateTime<Utc>,
}

/// Write status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Queued or in flight
    Pending,

    /// Durable on disk
    Completed,

    /// Write failed
    Failed,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    id: String,
    step: Step,
    role: String,
    path: PathBuf,
    status: WriteStatus,
    error: Option<String>,
}

/// Async checkpoint store for one worker role.
pub struct CheckpointStore {
    config: CheckpointStoreConfig,
    records: Arc<RwLock<BTreeMap<Step, CheckpointRecord>>>,
    pending: Arc<RwLock<HashMap<String, PendingWrite>>>,
    write_tx: mpsc::Sender<WriteRequest>,
    _writer: SnapshotWriter,
}

impl CheckpointStore {
    pub async fn new(config: CheckpointStoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_path)
            .await
            .map_err(|e| Error::CheckpointWriteFailed {
                message: format!(
                    "failed to create checkpoint directory {}: {e}",
                    config.base_path.display()
                ),
            })?;

        let records: Arc<RwLock<BTreeMap<Step, CheckpointRecord>>> =
            Arc::new(RwLock::new(BTreeMap::new()));
        let pending: Arc<RwLock<HashMap<String, PendingWrite>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let (write_tx, writer) = SnapshotWriter::spawn(config.queue_depth, event_tx);

        let records_task = records.clone();
        let pending_task = pending.clone();
        tokio::spawn(async move {
            debug!("checkpoint event listener started");
            while let Some(event) = event_rx.recv().await {
                match event {
                    WriterEvent::Completed {
                        snapshot_id,
                        size_bytes,
                    } => {
                        let mut pending_lock = pending_task.write();
                        if let Some(entry) = pending_lock.get_mut(&snapshot_id) {
                            entry.status = WriteStatus::Completed;
                            let record = CheckpointRecord {
                                id: entry.id.clone(),
                                step: entry.step,
                                role: entry.role.clone(),
                                path: entry.path.clone(),
                                size_bytes,
                                created_at: Utc::now(),
                            };
                            records_task.write().insert(entry.step, record);
                            info!(
                                snapshot_id = %snapshot_id,
                                step = entry.step,
                                size_bytes = size_bytes,
                                "checkpoint durable"
                            );
                        }
                    }
                    WriterEvent::Failed { snapshot_id, error } => {
                        let mut pending_lock = pending_task.write();
                        if let Some(entry) = pending_lock.get_mut(&snapshot_id) {
                            entry.status = WriteStatus::Failed;
                            entry.error = Some(error.clone());
                            error!(
                                snapshot_id = %snapshot_id,
                                error = %error,
                                "checkpoint write failed"
                            );
                        }
                    }
                }
            }
            debug!("checkpoint event listener stopped");
        });

        Ok(Self {
            config,
            records,
            pending,
            write_tx,
            _writer: writer,
        })
    }

    /// Path a snapshot for `step` and `role` lands at.
    pub fn snapshot_path(&self, step: Step, role: &str) -> PathBuf {
        self.config
            .base_path
            .join(format!("global_step_{step}"))
            .join(format!("{role}.ckpt"))
    }

    /// Queue a snapshot for writing without blocking on I/O.
    pub async fn save_async(&self, snapshot: &TrainSnapshot) -> Result<String> {
        let id = format!("ckpt-{}-{}", snapshot.global_step, Uuid::new_v4());
        let path = self.snapshot_path(snapshot.global_step, &snapshot.role);
        let data = snapshot.encode()?;

        self.pending.write().insert(
            id.clone(),
            PendingWrite {
                id: id.clone(),
                step: snapshot.global_step,
                role: snapshot.role.clone(),
                path: path.clone(),
                status: WriteStatus::Pending,
                error: None,
            },
        );

        self.write_tx
            .send(WriteRequest {
                snapshot_id: id.clone(),
                data,
                path,
                step: snapshot.global_step,
            })
            .await
            .map_err(|e| Error::ChannelClosed {
                channel: format!("checkpoint write channel: {e}"),
            })?;

        debug!(snapshot_id = %id, step = snapshot.global_step, "queued snapshot write");
        Ok(id)
    }

    /// Block until every queued write has completed or failed.
    ///
    /// Reports the first batch of failures as [`Error::CheckpointWriteFailed`].
    pub async fn wait_durable(&self) -> Result<()> {
        loop {
            let has_pending = {
                let pending = self.pending.read();
                pending.values().any(|p| p.status == WriteStatus::Pending)
            };
            if !has_pending {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let failures: Vec<PendingWrite> = self
            .pending
            .read()
            .values()
            .filter(|p| p.status == WriteStatus::Failed)
            .cloned()
            .collect();

        if !failures.is_empty() {
            let errors: Vec<String> = failures
                .iter()
                .map(|f| {
                    format!(
                        "{}: {}",
                        f.id,
                        f.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            return Err(Error::CheckpointWriteFailed {
                message: errors.join(", "),
            });
        }
        Ok(())
    }

    /// Latest durable snapshot
    pub fn latest(&self) -> Option<CheckpointRecord> {
        self.records.read().values().last().cloned()
    }

    /// Durable snapshot at an exact step
    pub fn get_by_step(&self, step: Step) -> Option<CheckpointRecord> {
        self.records.read().get(&step).cloned()
    }

    /// All durable snapshots in step order
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Load the snapshot saved at `step`.
    pub async fn load(&self, step: Step) -> Result<TrainSnapshot> {
        let record = self.get_by_step(step).ok_or_else(|| Error::CheckpointNotFound {
            path: self
                .config
                .base_path
                .join(format!("global_step_{step}"))
                .display()
                .to_string(),
        })?;
        read_snapshot(&record.path).await
    }

    /// Load the latest durable snapshot.
    pub async fn load_latest(&self) -> Result<TrainSnapshot> {
        let record = self.latest().ok_or_else(|| Error::CheckpointNotFound {
            path: self.config.base_path.display().to_string(),
        })?;
        read_snapshot(&record.path).await
    }

    /// Delete every snapshot older than `step`, returning how many were
    /// removed. Deletion failures are logged and skipped so a sticky file
    /// never blocks training.
    pub async fn prune_before(&self, step: Step) -> usize {
        let stale: Vec<CheckpointRecord> = {
            let mut records = self.records.write();
            let keep = records.split_off(&step);
            let stale = records.values().cloned().collect();
            *records = keep;
            stale
        };

        let mut removed = 0;
        for record in stale {
            let step_dir = record
                .path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| record.path.clone());
            match tokio::fs::remove_dir_all(&step_dir).await {
                Ok(()) => {
                    debug!(path = %step_dir.display(), step = record.step, "pruned old checkpoint");
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        path = %step_dir.display(),
                        error = %e,
                        "failed to delete old checkpoint"
                    );
                }
            }
        }
        removed
    }
}
