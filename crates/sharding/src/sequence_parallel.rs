//! Sequence-parallel sharding manager
//!
//! Splits the token axis of a batch across the ranks of a sequence
//! parallel group. Preprocess pads every tensor's token axis to a
//! multiple of the group size and keeps only this rank's column block;
//! postprocess all-gathers the blocks, reassembles the full axis, and
//! strips the padding. Round-tripping a batch through the pair
//! reproduces its logical content exactly.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use data_batch::TensorBatch;
use runtime_core::collective::CollectiveGroup;
use runtime_core::error::{Error, Result};
use runtime_core::topology::{DeviceMesh, AXIS_SP};

use crate::manager::ShardingManager;

#[derive(Debug, Clone, Copy)]
struct PadState {
    original_cols: usize,
}

/// Sharding manager for Ulysses-style sequence parallelism.
///
/// Constructed with the two-axis sequence parallel mesh, or None when
/// sequence parallelism is disabled; the collective group spans this
/// rank's sp axis peers.
pub struct UlyssesShardingManager {
    mesh: Option<DeviceMesh>,
    group: Arc<dyn CollectiveGroup>,
    entered: AtomicBool,
    state: Mutex<Option<PadState>>,
}

impl UlyssesShardingManager {
    pub fn new(mesh: Option<DeviceMesh>, group: Arc<dyn CollectiveGroup>) -> Result<Self> {
        if let Some(mesh) = &mesh {
            let sp = mesh.axis_size(AXIS_SP).ok_or_else(|| Error::InvalidConfig {
                message: "sequence parallel mesh has no sp axis".to_string(),
            })?;
            if group.world_size() != sp {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "sp group has {} ranks but mesh sp axis is {}",
                        group.world_size(),
                        sp
                    ),
                });
            }
        }
        Ok(Self {
            mesh,
            group,
            entered: AtomicBool::new(false),
            state: Mutex::new(None),
        })
    }

    fn sp_size(&self) -> usize {
        self.mesh
            .as_ref()
            .and_then(|m| m.axis_size(AXIS_SP))
            .unwrap_or(1)
    }
}

#[async_trait]
impl ShardingManager for UlyssesShardingManager {
    async fn enter(&self) -> Result<()> {
        if self.entered.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal {
                message: "sequence parallel scope entered twice".to_string(),
            });
        }
        Ok(())
    }

    async fn exit(&self) -> Result<()> {
        if !self.entered.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal {
                message: "sequence parallel scope exited without entering".to_string(),
            });
        }
        *self.state.lock() = None;
        Ok(())
    }

    async fn preprocess(&self, batch: TensorBatch) -> Result<TensorBatch> {
        let sp = self.sp_size();
        if sp == 1 || batch.is_empty() {
            return Ok(batch);
        }
        // Only uniform-grid batches are resharded; mixed-width batches
        // (training batches carrying both full-sequence and
        // response-region tensors) pass through for the model to
        // handle internally.
        let cols = match batch.uniform_cols() {
            Ok(cols) => cols,
            Err(_) => return Ok(batch),
        };

        let padded_cols = cols.div_ceil(sp) * sp;
        let shard = padded_cols / sp;
        let rank = self.group.rank();
        let padded = batch.pad_cols(padded_cols)?;
        let sharded = padded.slice_cols(rank * shard..(rank + 1) * shard)?;
        *self.state.lock() = Some(PadState {
            original_cols: cols,
        });
        debug!(sp, rank, cols, shard, "Sharded token axis");
        Ok(sharded)
    }

    async fn postprocess(&self, batch: TensorBatch) -> Result<TensorBatch> {
        let sp = self.sp_size();
        if sp == 1 || batch.is_empty() {
            return Ok(batch);
        }
        let state = match self.state.lock().take() {
            Some(state) => state,
            None => return Ok(batch),
        };

        let encoded =
            bincode::serialize(&batch).map_err(|e| Error::Serialization(e.to_string()))?;
        let gathered = self.group.all_gather(Bytes::from(encoded)).await?;
        let shards = gathered
            .iter()
            .map(|bytes| {
                bincode::deserialize::<TensorBatch>(bytes)
                    .map_err(|e| Error::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let full = TensorBatch::concat_cols(&shards)?;
        let restored = full.slice_cols(0..state.original_cols)?;
        debug!(
            sp,
            original_cols = state.original_cols,
            "Gathered token axis"
        );
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::run_scoped;
    use data_batch::names;
    use ndarray::{array, Array2};
    use runtime_core::collective::LocalGroup;
    use runtime_core::topology::build_sequence_parallel_mesh;
    use std::time::Duration;

    fn grid_batch() -> TensorBatch {
        let mut batch = TensorBatch::new();
        batch
            .insert(
                names::INPUT_IDS,
                array![[1i64, 2, 3, 4, 5], [6, 7, 8, 9, 10]],
            )
            .unwrap();
        batch
            .insert(
                names::ATTENTION_MASK,
                array![[1i64, 1, 1, 1, 0], [1, 1, 1, 1, 1]],
            )
            .unwrap();
        batch
    }

    fn managers(world: usize, sp: usize) -> Vec<UlyssesShardingManager> {
        LocalGroup::new_group(world, Duration::from_secs(5))
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(rank, group)| {
                let mesh = build_sequence_parallel_mesh(rank, world, sp).unwrap();
                UlyssesShardingManager::new(mesh, Arc::new(group)).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_identity_with_uneven_length() {
        // 5 columns over sp=2 pads to 6, shards of 3
        let mut handles = Vec::new();
        for manager in managers(2, 2) {
            handles.push(tokio::spawn(async move {
                let original = grid_batch();
                let sharded = manager.preprocess(grid_batch()).await.unwrap();
                assert_eq!(sharded.uniform_cols().unwrap(), 3);
                let restored = manager.postprocess(sharded).await.unwrap();
                assert_eq!(
                    restored.get_int(names::INPUT_IDS).unwrap(),
                    original.get_int(names::INPUT_IDS).unwrap()
                );
                assert_eq!(
                    restored.get_int(names::ATTENTION_MASK).unwrap(),
                    original.get_int(names::ATTENTION_MASK).unwrap()
                );
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_each_rank_gets_its_own_columns() {
        let mut handles = Vec::new();
        for (rank, manager) in managers(2, 2).into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                let sharded = manager.preprocess(grid_batch()).await.unwrap();
                let ids = sharded.get_int(names::INPUT_IDS).unwrap().clone();
                // Drain the gather so the peer's postprocess completes
                manager.postprocess(sharded).await.unwrap();
                (rank, ids)
            }));
        }
        for handle in handles {
            let (rank, ids) = handle.await.unwrap();
            if rank == 0 {
                assert_eq!(ids, array![[1i64, 2, 3], [6, 7, 8]]);
            } else {
                // Rank 1 holds the padded tail
                assert_eq!(ids, array![[4i64, 5, 0], [9, 10, 0]]);
            }
        }
    }

    #[tokio::test]
    async fn test_computation_on_shards_composes() {
        // Each rank derives a float tensor from its shard; the gathered
        // result matches computing on the full axis directly.
        let mut handles = Vec::new();
        for manager in managers(2, 2) {
            handles.push(tokio::spawn(async move {
                run_scoped(&manager, grid_batch(), |shard| async move {
                    let ids = shard.get_int(names::INPUT_IDS).unwrap();
                    let probs = ids.mapv(|v| v as f32 * -0.5);
                    let mut out = TensorBatch::new();
                    out.insert("log_probs", probs).unwrap();
                    Ok(out)
                })
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            let out = handle.await.unwrap();
            let expected = grid_batch()
                .get_int(names::INPUT_IDS)
                .unwrap()
                .mapv(|v| v as f32 * -0.5);
            assert_eq!(out.get_float("log_probs").unwrap(), &expected);
        }
    }

    #[tokio::test]
    async fn test_disabled_sequence_parallel_passes_through() {
        let manager =
            UlyssesShardingManager::new(None, Arc::new(LocalGroup::solo())).unwrap();
        let batch = grid_batch();
        let sharded = manager.preprocess(batch).await.unwrap();
        assert_eq!(sharded.uniform_cols().unwrap(), 5);
        let restored = manager.postprocess(sharded).await.unwrap();
        assert_eq!(restored.uniform_cols().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_mixed_width_batch_passes_through() {
        let mut handles = Vec::new();
        for manager in managers(2, 2) {
            handles.push(tokio::spawn(async move {
                let mut batch = grid_batch();
                batch
                    .insert(names::RESPONSES, Array2::<i64>::zeros((2, 2)))
                    .unwrap();
                let out = manager.preprocess(batch).await.unwrap();
                // Unchanged widths
                assert_eq!(out.get_int(names::INPUT_IDS).unwrap().ncols(), 5);
                assert_eq!(out.get_int(names::RESPONSES).unwrap().ncols(), 2);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_scope_reentry_rejected() {
        let manager =
            UlyssesShardingManager::new(None, Arc::new(LocalGroup::solo())).unwrap();
        manager.enter().await.unwrap();
        assert!(manager.enter().await.is_err());
        manager.exit().await.unwrap();
        assert!(manager.exit().await.is_err());
    }

    #[test]
    fn test_group_size_must_match_mesh() {
        let mesh = build_sequence_parallel_mesh(0, 4, 2).unwrap();
        let group = Arc::new(LocalGroup::solo());
        assert!(UlyssesShardingManager::new(mesh, group).is_err());
    }
}
