//! Value function worker
//!
//! Trains the critic and serves value estimates for credit assignment.
//! The numeric value model sits behind [`crate::model::ValueModule`];
//! the worker runs the fixed pipeline around it, mirroring the actor
//! worker's residency and sharding discipline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use checkpoint::{read_snapshot, CheckpointStore, CheckpointStoreConfig, TrainSnapshot};
use data_batch::{keys, names, TensorBatch};
use runtime_core::collective::{CollectiveGroup, LocalGroup};
use runtime_core::config::{normalize_micro_batch, CriticConfig, NormalizedBatchSizes};
use runtime_core::error::{Error, Result};
use runtime_core::memory::AcceleratorPool;
use runtime_core::offload::OffloadController;
use runtime_core::topology::{build_fsdp_mesh, build_sequence_parallel_mesh, DeviceMesh};
use runtime_core::types::{LifecycleState, Rank, Role, Step};
use sharding::{run_scoped, run_scoped_with, UlyssesShardingManager};

use crate::metrics::{append_perf_metrics, Metrics, Timer};
use crate::model::{slice_response_cols, LrScheduler, ModuleState, ValueModule};

/// Engines produced by a critic component builder during `init_model`
pub struct CriticComponents {
    /// Trainable value model
    pub value: Box<dyn ValueModule>,

    /// Accelerator bytes the value model parameters occupy
    pub param_bytes: u64,

    /// Accelerator bytes the optimizer state occupies
    pub optimizer_bytes: u64,
}

/// Builds the value model once the worker's topology is in place
pub type CriticComponentBuilder =
    Box<dyn FnOnce(&CriticConfig) -> Result<CriticComponents> + Send>;

/// Worker hosting the trainable value function
pub struct CriticWorker {
    config: CriticConfig,
    state: LifecycleState,
    rank: Rank,
    world_size: usize,
    pool: Arc<AcceleratorPool>,
    group: Arc<dyn CollectiveGroup>,
    fsdp_mesh: DeviceMesh,
    batch_sizes: NormalizedBatchSizes,
    forward_micro_per_device: Option<usize>,

    builder: Option<CriticComponentBuilder>,
    value: Option<Box<dyn ValueModule>>,
    scheduler: LrScheduler,
    offload: Option<Arc<OffloadController>>,
    ulysses: UlyssesShardingManager,
    checkpoint: Option<(PathBuf, CheckpointStore)>,
}

impl CriticWorker {
    /// Creates the worker on this rank's topology.
    ///
    /// `sp_group` spans this rank's sequence parallel peers and is
    /// required when `ulysses_sequence_parallel_size > 1`.
    pub fn new(
        config: CriticConfig,
        pool: Arc<AcceleratorPool>,
        group: Arc<dyn CollectiveGroup>,
        sp_group: Option<Arc<dyn CollectiveGroup>>,
        builder: CriticComponentBuilder,
    ) -> Result<Self> {
        let rank = group.rank();
        let world_size = group.world_size();
        let sp = config.ulysses_sequence_parallel_size;

        let fsdp_mesh = build_fsdp_mesh(rank, world_size, config.fsdp.fsdp_size)?;
        let sp_mesh = build_sequence_parallel_mesh(rank, world_size, sp)?;
        let ulysses = UlyssesShardingManager::new(
            sp_mesh,
            sp_group.unwrap_or_else(|| Arc::new(LocalGroup::solo())),
        )?;

        let batch_sizes = NormalizedBatchSizes::for_critic(&config, world_size)?;
        let forward_micro_per_device = normalize_micro_batch(
            "critic.forward_micro_batch_size",
            config.forward_micro_batch_size,
            world_size,
            sp,
        )?;

        let scheduler = LrScheduler::from_config(&config.optim);
        info!(
            rank,
            world_size,
            sp,
            mini_batch = batch_sizes.mini_batch_size,
            "Constructed critic worker"
        );

        Ok(Self {
            config,
            state: LifecycleState::Uninitialized,
            rank,
            world_size,
            pool,
            group,
            fsdp_mesh,
            batch_sizes,
            forward_micro_per_device,
            builder: Some(builder),
            value: None,
            scheduler,
            offload: None,
            ulysses,
            checkpoint: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Per-rank batch sizes derived from the global configuration
    pub fn batch_sizes(&self) -> NormalizedBatchSizes {
        self.batch_sizes
    }

    /// Builds the value model, registers its memory with the pool, and
    /// applies the configured initial offload.
    pub fn init_model(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(Error::AlreadyInitialized {
                role: Role::Critic.to_string(),
            });
        }
        let builder = self.builder.take().ok_or_else(|| Error::Internal {
            message: "component builder already consumed".to_string(),
        })?;
        let components = builder(&self.config)?;

        let offload = Arc::new(OffloadController::with_optimizer(
            Arc::clone(&self.pool),
            "critic",
            components.param_bytes,
            components.optimizer_bytes,
        )?);
        self.state = LifecycleState::ModelBuilt;
        if self.config.fsdp.param_offload {
            offload.offload_params()?;
        }
        if self.config.fsdp.optimizer_offload {
            offload.offload_optimizer()?;
        }

        self.value = Some(components.value);
        self.offload = Some(offload);
        self.state = LifecycleState::Ready;
        self.pool.empty_cache();

        info!(
            rank = self.rank,
            mesh = ?self.fsdp_mesh.shape(),
            param_offload = self.config.fsdp.param_offload,
            optimizer_offload = self.config.fsdp.optimizer_offload,
            "Value model initialized"
        );
        Ok(())
    }

    fn require_ready(&self, operation: &str) -> Result<()> {
        if !self.state.is_ready() {
            return Err(Error::NotInitialized {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Runs value function updates over a full train batch and reports
    /// the update metrics, including the post-step learning rate.
    pub async fn update_critic(&mut self, mut batch: TensorBatch) -> Result<Metrics> {
        self.require_ready("update_critic")?;
        if batch.batch_size() % self.batch_sizes.mini_batch_size != 0 {
            return Err(Error::BatchSizeIndivisible {
                name: "update_batch".to_string(),
                value: batch.batch_size(),
                divisor: self.batch_sizes.mini_batch_size,
            });
        }
        debug!(samples = batch.batch_size(), "Updating value function");

        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.load_params()?;
            }
            if self.config.fsdp.optimizer_offload {
                offload.load_optimizer()?;
            }
        }
        batch.to_accelerator(&self.pool, "critic.update_batch")?;

        let Some(value) = self.value.as_mut() else {
            return Err(Error::NotInitialized {
                operation: "update_critic".to_string(),
            });
        };
        let scheduler = &mut self.scheduler;
        let manager = &self.ulysses;
        let (_, metrics) = run_scoped_with(manager, batch, move |batch| async move {
            let timer = Timer::start();
            let mut metrics = value.update(&batch)?;
            append_perf_metrics(&mut metrics, &batch, timer.elapsed_secs());
            metrics.insert("critic/lr".to_string(), scheduler.step());
            Ok((TensorBatch::new(), metrics))
        })
        .await?;

        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.offload_params()?;
            }
            if self.config.fsdp.optimizer_offload {
                offload.offload_optimizer()?;
            }
        }
        self.pool.empty_cache();
        Ok(metrics)
    }

    /// Computes value estimates over the response region.
    ///
    /// Inference-only: offloaded bytes stay in the pool cache so an
    /// immediately following update can reclaim them without a fresh
    /// allocation.
    pub async fn compute_values(&mut self, mut batch: TensorBatch) -> Result<TensorBatch> {
        self.require_ready("compute_values")?;
        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.load_params()?;
            }
        }
        batch.to_accelerator(&self.pool, "critic.values_batch")?;
        if let Some(micro) = self.forward_micro_per_device {
            batch.set_meta(keys::MICRO_BATCH_SIZE, micro);
        }
        batch.set_meta(
            keys::MAX_TOKEN_LEN,
            self.config.forward_max_token_len_per_gpu,
        );
        batch.set_meta(keys::USE_DYNAMIC_BSZ, self.config.use_dynamic_bsz);
        let response_len = batch.get_int(names::RESPONSES)?.ncols();

        let Some(value) = self.value.as_mut() else {
            return Err(Error::NotInitialized {
                operation: "compute_values".to_string(),
            });
        };
        let manager = &self.ulysses;
        let output = run_scoped(manager, batch, move |batch| async move {
            let values = value.values(&batch)?;
            let mut out = TensorBatch::new();
            out.insert(names::VALUES, values)?;
            Ok(out)
        })
        .await?;

        let mut output = slice_response_cols(output, names::VALUES, response_len)?;
        output.to_host();

        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.offload_params()?;
            }
        }
        Ok(output)
    }

    /// Writes this rank's value model snapshot under
    /// `<path>/global_step_<step>/` and waits for it to become durable
    /// on every rank.
    pub async fn save_checkpoint(
        &mut self,
        path: &Path,
        global_step: Step,
        keep_previous: bool,
    ) -> Result<()> {
        self.require_ready("save_checkpoint")?;

        let toggle = self.config.fsdp.param_offload;
        if toggle {
            if let Some(offload) = &self.offload {
                offload.load_params()?;
            }
        }

        let state = match self.value.as_ref() {
            Some(value) => value.state()?,
            None => {
                return Err(Error::NotInitialized {
                    operation: "save_checkpoint".to_string(),
                })
            }
        };
        let snapshot = TrainSnapshot {
            role: self.shard_name(),
            global_step,
            model_state: state.model,
            optimizer_state: state.optimizer,
            scheduler_state: bincode::serialize(&self.scheduler)
                .map_err(|e| Error::Serialization(e.to_string()))?,
        };

        let store = self.checkpoint_store(path).await?;
        store.save_async(&snapshot).await?;
        store.wait_durable().await?;
        if !keep_previous {
            store.prune_before(global_step).await;
        }
        self.group.barrier().await?;

        if toggle {
            if let Some(offload) = &self.offload {
                offload.offload_params()?;
            }
        }
        info!(step = global_step, path = %path.display(), "Saved critic checkpoint");
        Ok(())
    }

    /// Restores this rank's value model snapshot from a
    /// `global_step_<N>` directory, returning the step it was saved at.
    pub async fn load_checkpoint(&mut self, path: &Path) -> Result<Step> {
        self.require_ready("load_checkpoint")?;

        let toggle = self.config.fsdp.param_offload;
        if toggle {
            if let Some(offload) = &self.offload {
                offload.load_params()?;
            }
        }

        let shard = path.join(format!("{}.ckpt", self.shard_name()));
        let snapshot = read_snapshot(&shard).await?;
        let state = ModuleState {
            model: snapshot.model_state,
            optimizer: snapshot.optimizer_state,
        };
        match self.value.as_mut() {
            Some(value) => value.restore(&state)?,
            None => {
                return Err(Error::NotInitialized {
                    operation: "load_checkpoint".to_string(),
                })
            }
        }
        self.scheduler = bincode::deserialize(&snapshot.scheduler_state)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if toggle {
            if let Some(offload) = &self.offload {
                offload.offload_params()?;
            }
        }
        info!(
            step = snapshot.global_step,
            path = %shard.display(),
            "Restored critic checkpoint"
        );
        Ok(snapshot.global_step)
    }

    fn shard_name(&self) -> String {
        format!("critic_world_{}_rank_{}", self.world_size, self.rank)
    }

    /// Store handle for `base`, recreated when the base path changes
    async fn checkpoint_store(&mut self, base: &Path) -> Result<&CheckpointStore> {
        let reuse = matches!(&self.checkpoint, Some((path, _)) if path.as_path() == base);
        if !reuse {
            let store = CheckpointStore::new(CheckpointStoreConfig {
                base_path: base.to_path_buf(),
                ..CheckpointStoreConfig::default()
            })
            .await?;
            self.checkpoint = Some((base.to_path_buf(), store));
        }
        match &self.checkpoint {
            Some((_, store)) => Ok(store),
            None => Err(Error::Internal {
                message: "checkpoint store not constructed".to_string(),
            }),
        }
    }
}
