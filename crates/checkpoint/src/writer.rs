//! Async snapshot writer for non-blocking checkpoint I/O
//!
//! Snapshots are queued on a channel and written by a background task so the
//! training loop is only blocked when it explicitly waits for durability.
//! Files are written to a temporary path, synced, and renamed into place;
//! readers never observe a partially written snapshot.

use bytes::Bytes;
use runtime_core::{Error, Result, Step};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Magic bytes for snapshot files
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RLCP";

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Fixed-size portion of the snapshot header: magic, version, step, data size
const HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// Request to write one serialized snapshot
#[derive(Debug)]
pub struct WriteRequest {
    /// Identifier for tracking the write
    pub snapshot_id: String,

    /// Serialized snapshot payload
    pub data: Bytes,

    /// Target path
    pub path: PathBuf,

    /// Training step the snapshot belongs to
    pub step: Step,
}

/// Event reported by the writer task
#[derive(Debug)]
pub enum WriterEvent {
    /// Write completed and is durable on disk
    Completed {
        snapshot_id: String,
        size_bytes: u64,
    },
    /// Write failed
    Failed { snapshot_id: String, error: String },
}

/// Background writer task handle.
pub struct SnapshotWriter {
    _task: tokio::task::JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawn the writer task.
    ///
    /// Returns the request channel alongside the handle; dropping the sender
    /// stops the task after it drains queued writes.
    pub fn spawn(
        queue_depth: usize,
        event_tx: mpsc::Sender<WriterEvent>,
    ) -> (mpsc::Sender<WriteRequest>, Self) {
        let (tx, rx) = mpsc::channel::<WriteRequest>(queue_depth.max(1));
        let task = tokio::spawn(Self::writer_loop(rx, event_tx));
        (tx, Self { _task: task })
    }

    async fn writer_loop(mut rx: mpsc::Receiver<WriteRequest>, event_tx: mpsc::Sender<WriterEvent>) {
        info!("snapshot writer started");

        while let Some(request) = rx.recv().await {
            let snapshot_id = request.snapshot_id.clone();
            match Self::write_snapshot(&request).await {
                Ok(size) => {
                    debug!(
                        snapshot_id = %request.snapshot_id,
                        size_bytes = size,
                        path = %request.path.display(),
                        "snapshot written"
                    );
                    let _ = event_tx
                        .send(WriterEvent::Completed {
                            snapshot_id,
                            size_bytes: size,
                        })
                        .await;
                }
                Err(e) => {
                    error!(
                        snapshot_id = %request.snapshot_id,
                        error = %e,
                        "failed to write snapshot"
                    );
                    let _ = event_tx
                        .send(WriterEvent::Failed {
                            snapshot_id,
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        }

        info!("snapshot writer stopped");
    }

    #[instrument(skip(request), fields(snapshot_id = %request.snapshot_id, step = request.step))]
    async fn write_snapshot(request: &WriteRequest) -> Result<u64> {
        let start = std::time::Instant::now();

        if let Some(parent) = request.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }

        let temp_path = request.path.with_extension("tmp");
        let mut file = File::create(&temp_path).await.map_err(Error::Io)?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&SNAPSHOT_MAGIC);
        header.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        header.extend_from_slice(&request.step.to_le_bytes());
        header.extend_from_slice(&(request.data.len() as u64).to_le_bytes());

        file.write_all(&header).await.map_err(Error::Io)?;
        file.write_all(&request.data).await.map_err(Error::Io)?;
        file.sync_all().await.map_err(Error::Io)?;

        tokio::fs::rename(&temp_path, &request.path)
            .await
            .map_err(Error::Io)?;

        let size = HEADER_LEN as u64 + request.data.len() as u64;
        let elapsed = start.elapsed();
        info!(
            snapshot_id = %request.snapshot_id,
            size_bytes = size,
            elapsed_ms = elapsed.as_millis(),
            "snapshot write complete"
        );
        Ok(size)
    }
}

/// Read and validate a snapshot file, returning its payload.
pub async fn read_snapshot_data(path: &Path) -> Result<Bytes> {
    use tokio::io::AsyncReadExt;

    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::CheckpointNotFound {
                path: path.display().to_string(),
            })
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic).await.map_err(|_| corrupt(path, "truncated header"))?;
    if magic != SNAPSHOT_MAGIC {
        return Err(corrupt(path, "bad magic bytes"));
    }

    let version = file
        .read_u32_le()
        .await
        .map_err(|_| corrupt(path, "truncated header"))?;
    if version != SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            expected = SNAPSHOT_VERSION,
            found = version,
            "snapshot version mismatch"
        );
    }

    let _step = file
        .read_u64_le()
        .await
        .map_err(|_| corrupt(path, "truncated header"))?;
    let data_size = file
        .read_u64_le()
        .await
        .map_err(|_| corrupt(path, "truncated header"))?;

    let mut data = vec![0u8; data_size as usize];
    file.read_exact(&mut data)
        .await
        .map_err(|_| corrupt(path, "payload shorter than header declares"))?;

    Ok(Bytes::from(data))
}

fn corrupt(path: &Path, reason: &str) -> Error {
    Error::CheckpointCorrupted {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}
