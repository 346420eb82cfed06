//! Combined actor / rollout / reference worker
//!
//! One process can carry the trainable policy, the generation engine,
//! and the frozen reference policy in any configured combination.
//! Numeric work lives behind the delegate traits in [`crate::model`];
//! this worker owns the fixed pipeline around them: residency
//! toggling, device placement, batch metadata, sharding scopes, output
//! slicing, and checkpoint exchange.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use checkpoint::{read_snapshot, CheckpointStore, CheckpointStoreConfig, TrainSnapshot};
use data_batch::{keys, names, TensorBatch};
use runtime_core::collective::{CollectiveGroup, LocalGroup};
use runtime_core::config::{normalize_micro_batch, ActorRolloutRefConfig, NormalizedBatchSizes};
use runtime_core::error::{Error, Result};
use runtime_core::memory::AcceleratorPool;
use runtime_core::offload::OffloadController;
use runtime_core::topology::{build_fsdp_mesh, build_sequence_parallel_mesh, DeviceMesh};
use runtime_core::types::{LifecycleState, Rank, Role, Step, TokenId};
use sharding::{
    run_scoped, run_scoped_with, HandoffShardingManager, UlyssesShardingManager, WeightBridge,
};

use crate::metrics::{append_perf_metrics, Metrics, Timer};
use crate::model::{
    slice_response_cols, LrScheduler, ModuleState, PolicyModule, RefModule, RolloutEngine,
};

/// Engines produced by a component builder during `init_model`.
///
/// Which fields must be present depends on the worker's role; the
/// worker validates the combination before accepting them.
pub struct ActorComponents {
    /// Trainable policy, required by actor roles
    pub policy: Option<Box<dyn PolicyModule>>,

    /// Generation engine, required by rollout roles
    pub rollout: Option<Box<dyn RolloutEngine>>,

    /// Frozen reference policy, required by ref roles
    pub reference: Option<Box<dyn RefModule>>,

    /// Weight bridge into the generation engine, required by rollout
    /// roles
    pub bridge: Option<Arc<dyn WeightBridge>>,

    /// End-of-sequence token id of the tokenizer the engines share
    pub eos_token_id: TokenId,

    /// Padding token id
    pub pad_token_id: TokenId,

    /// Accelerator bytes the training parameters occupy
    pub param_bytes: u64,

    /// Accelerator bytes the optimizer state occupies
    pub optimizer_bytes: u64,

    /// Accelerator bytes the reference parameters occupy
    pub ref_param_bytes: u64,
}

/// Builds the numeric engines once the worker's topology is in place
pub type ActorComponentBuilder =
    Box<dyn FnOnce(&ActorRolloutRefConfig) -> Result<ActorComponents> + Send>;

fn missing_capability(operation: &str, role: Role) -> Error {
    Error::MissingCapability {
        operation: operation.to_string(),
        role: role.to_string(),
    }
}

/// Worker hosting the policy, generation, and reference capabilities
/// selected by its role.
pub struct ActorRolloutRefWorker {
    role: Role,
    config: ActorRolloutRefConfig,
    state: LifecycleState,
    rank: Rank,
    world_size: usize,
    pool: Arc<AcceleratorPool>,
    group: Arc<dyn CollectiveGroup>,
    fsdp_mesh: DeviceMesh,
    batch_sizes: NormalizedBatchSizes,
    log_prob_micro_per_device: Option<usize>,
    ref_micro_per_device: Option<usize>,

    builder: Option<ActorComponentBuilder>,
    policy: Option<Box<dyn PolicyModule>>,
    rollout: Option<Box<dyn RolloutEngine>>,
    reference: Option<Box<dyn RefModule>>,
    scheduler: LrScheduler,

    /// Residency of the training parameters and optimizer state; None
    /// for ref-only workers
    offload: Option<Arc<OffloadController>>,
    ref_offload: Option<Arc<OffloadController>>,
    ulysses: UlyssesShardingManager,
    handoff: Option<HandoffShardingManager>,

    eos_token_id: TokenId,
    pad_token_id: TokenId,
    checkpoint: Option<(PathBuf, CheckpointStore)>,
}

impl ActorRolloutRefWorker {
    /// Creates the worker on this rank's topology.
    ///
    /// `sp_group` spans this rank's sequence parallel peers and is
    /// required when `ulysses_sequence_parallel_size > 1`; without
    /// sequence parallelism the scope degenerates to a pass-through.
    pub fn new(
        role: Role,
        config: ActorRolloutRefConfig,
        pool: Arc<AcceleratorPool>,
        group: Arc<dyn CollectiveGroup>,
        sp_group: Option<Arc<dyn CollectiveGroup>>,
        builder: ActorComponentBuilder,
    ) -> Result<Self> {
        let rank = group.rank();
        let world_size = group.world_size();
        let sp = config.actor.ulysses_sequence_parallel_size;

        let fsdp_mesh = build_fsdp_mesh(rank, world_size, config.actor.fsdp.fsdp_size)?;
        let sp_mesh = build_sequence_parallel_mesh(rank, world_size, sp)?;
        let ulysses = UlyssesShardingManager::new(
            sp_mesh,
            sp_group.unwrap_or_else(|| Arc::new(LocalGroup::solo())),
        )?;

        let batch_sizes =
            NormalizedBatchSizes::for_actor(&config.actor, &config.rollout, world_size)?;
        let log_prob_micro_per_device = normalize_micro_batch(
            "rollout.log_prob_micro_batch_size",
            config.rollout.log_prob_micro_batch_size,
            world_size,
            sp,
        )?;
        let ref_micro_per_device = normalize_micro_batch(
            "ref.log_prob_micro_batch_size",
            config.reference.log_prob_micro_batch_size,
            world_size,
            sp,
        )?;

        let scheduler = LrScheduler::from_config(&config.actor.optim);
        info!(
            role = %role,
            rank,
            world_size,
            sp,
            mini_batch = batch_sizes.mini_batch_size,
            "Constructed actor rollout ref worker"
        );

        Ok(Self {
            role,
            config,
            state: LifecycleState::Uninitialized,
            rank,
            world_size,
            pool,
            group,
            fsdp_mesh,
            batch_sizes,
            log_prob_micro_per_device,
            ref_micro_per_device,
            builder: Some(builder),
            policy: None,
            rollout: None,
            reference: None,
            scheduler,
            offload: None,
            ref_offload: None,
            ulysses,
            handoff: None,
            eos_token_id: 0,
            pad_token_id: 0,
            checkpoint: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Per-rank batch sizes derived from the global configuration
    pub fn batch_sizes(&self) -> NormalizedBatchSizes {
        self.batch_sizes
    }

    /// Builds the numeric engines, registers their memory with the
    /// pool, and applies the configured initial offload.
    ///
    /// Must be called exactly once before any operation.
    pub fn init_model(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(Error::AlreadyInitialized {
                role: self.role.to_string(),
            });
        }
        let builder = self.builder.take().ok_or_else(|| Error::Internal {
            message: "component builder already consumed".to_string(),
        })?;
        let components = builder(&self.config)?;

        if self.role.has_actor() && components.policy.is_none() {
            return Err(Error::InvalidConfig {
                message: format!("role {} requires a policy module", self.role),
            });
        }
        if self.role.has_rollout() && (components.rollout.is_none() || components.bridge.is_none())
        {
            return Err(Error::InvalidConfig {
                message: format!(
                    "role {} requires a rollout engine and a weight bridge",
                    self.role
                ),
            });
        }
        if self.role.has_ref() && components.reference.is_none() {
            return Err(Error::InvalidConfig {
                message: format!("role {} requires a reference module", self.role),
            });
        }

        let offload = if self.role.has_actor() {
            Some(Arc::new(OffloadController::with_optimizer(
                Arc::clone(&self.pool),
                "actor",
                components.param_bytes,
                components.optimizer_bytes,
            )?))
        } else if self.role.has_rollout() {
            Some(Arc::new(OffloadController::new(
                Arc::clone(&self.pool),
                "actor",
                components.param_bytes,
            )?))
        } else {
            None
        };
        self.state = LifecycleState::ModelBuilt;

        if let Some(offload) = &offload {
            if self.config.actor.fsdp.param_offload {
                offload.offload_params()?;
            }
            if self.role.has_actor() && self.config.actor.fsdp.optimizer_offload {
                offload.offload_optimizer()?;
            }
        }

        if self.role.has_ref() {
            let ref_offload = Arc::new(OffloadController::new(
                Arc::clone(&self.pool),
                "ref",
                components.ref_param_bytes,
            )?);
            if self.config.reference.fsdp.param_offload {
                ref_offload.offload_params()?;
            }
            self.ref_offload = Some(ref_offload);
        }

        if let (Some(bridge), Some(offload)) = (components.bridge, &offload) {
            self.handoff = Some(HandoffShardingManager::new(
                bridge,
                Arc::clone(offload),
                self.config.actor.fsdp.param_offload,
                self.config.actor.fsdp.optimizer_offload,
            ));
        }

        self.policy = components.policy;
        self.rollout = components.rollout;
        self.reference = components.reference;
        self.eos_token_id = components.eos_token_id;
        self.pad_token_id = components.pad_token_id;
        self.offload = offload;
        self.state = LifecycleState::Ready;
        self.pool.empty_cache();

        info!(
            role = %self.role,
            rank = self.rank,
            mesh = ?self.fsdp_mesh.shape(),
            param_offload = self.config.actor.fsdp.param_offload,
            optimizer_offload = self.config.actor.fsdp.optimizer_offload,
            "Model engines initialized"
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

    /// Runs PPO policy updates over a full train batch and reports the
    /// update metrics, including the post-step learning rate.
    pub async fn update_actor(&mut self, mut batch: TensorBatch) -> Result<Metrics> {
        self.require_ready("update_actor")?;
        let role = self.role;
        if batch.batch_size() % self.batch_sizes.mini_batch_size != 0 {
            return Err(Error::BatchSizeIndivisible {
                name: "update_batch".to_string(),
                value: batch.batch_size(),
                divisor: self.batch_sizes.mini_batch_size,
            });
        }
        debug!(samples = batch.batch_size(), "Updating policy");

        if let Some(offload) = &self.offload {
            if self.config.actor.fsdp.param_offload {
                offload.load_params()?;
            }
            if self.config.actor.fsdp.optimizer_offload {
                offload.load_optimizer()?;
            }
        }
        batch.to_accelerator(&self.pool, "actor.update_batch")?;

        let Some(policy) = self.policy.as_mut() else {
            return Err(missing_capability("update_actor", role));
        };
        let scheduler = &mut self.scheduler;
        let manager = &self.ulysses;
        let (_, metrics) = run_scoped_with(manager, batch, move |batch| async move {
            let timer = Timer::start();
            let mut metrics = policy.update(&batch)?;
            append_perf_metrics(&mut metrics, &batch, timer.elapsed_secs());
            metrics.insert("actor/lr".to_string(), scheduler.step());
            Ok((TensorBatch::new(), metrics))
        })
        .await?;

        if let Some(offload) = &self.offload {
            if self.config.actor.fsdp.param_offload {
                offload.offload_params()?;
            }
            if self.config.actor.fsdp.optimizer_offload {
                offload.offload_optimizer()?;
            }
        }
        self.pool.empty_cache();
        Ok(metrics)
    }

    /// Recomputes the behavior policy's log-probs over the response
    /// region under the rollout sampling temperature.
    pub async fn compute_log_prob(&mut self, mut batch: TensorBatch) -> Result<TensorBatch> {
        self.require_ready("compute_log_prob")?;
        let role = self.role;
        if let Some(offload) = &self.offload {
            if self.config.actor.fsdp.param_offload {
                offload.load_params()?;
            }
        }
        batch.to_accelerator(&self.pool, "actor.log_prob_batch")?;
        if let Some(micro) = self.log_prob_micro_per_device {
            batch.set_meta(keys::MICRO_BATCH_SIZE, micro);
        }
        batch.set_meta(
            keys::MAX_TOKEN_LEN,
            self.config.rollout.log_prob_max_token_len_per_gpu,
        );
        batch.set_meta(
            keys::USE_DYNAMIC_BSZ,
            self.config.rollout.log_prob_use_dynamic_bsz,
        );
        batch.set_meta(keys::TEMPERATURE, self.config.rollout.temperature);
        let response_len = batch.get_int(names::RESPONSES)?.ncols();
        let temperature = self.config.rollout.temperature;

        let Some(policy) = self.policy.as_mut() else {
            return Err(missing_capability("compute_log_prob", role));
        };
        let manager = &self.ulysses;
        let output = run_scoped(manager, batch, move |batch| async move {
            let log_probs = policy.log_probs(&batch)?;
            let mut out = TensorBatch::new();
            out.insert(names::OLD_LOG_PROBS, log_probs)?;
            out.set_meta(keys::TEMPERATURE, temperature);
            Ok(out)
        })
        .await?;

        let mut output = slice_response_cols(output, names::OLD_LOG_PROBS, response_len)?;
        output.to_host();

        if let Some(offload) = &self.offload {
            if self.config.actor.fsdp.param_offload {
                offload.offload_params()?;
            }
        }
        self.pool.empty_cache();
        Ok(output)
    }

    /// Computes frozen reference log-probs over the response region.
    ///
    /// The reference pass reuses the rollout sampling temperature so
    /// its log-probs are comparable with the behavior policy's.
    pub async fn compute_ref_log_prob(&mut self, mut batch: TensorBatch) -> Result<TensorBatch> {
        self.require_ready("compute_ref_log_prob")?;
        let role = self.role;
        if let Some(ref_offload) = &self.ref_offload {
            if self.config.reference.fsdp.param_offload {
                ref_offload.load_params()?;
            }
        }
        batch.to_accelerator(&self.pool, "ref.log_prob_batch")?;
        if let Some(micro) = self.ref_micro_per_device {
            batch.set_meta(keys::MICRO_BATCH_SIZE, micro);
        }
        batch.set_meta(
            keys::MAX_TOKEN_LEN,
            self.config.reference.log_prob_max_token_len_per_gpu,
        );
        batch.set_meta(
            keys::USE_DYNAMIC_BSZ,
            self.config.reference.log_prob_use_dynamic_bsz,
        );
        batch.set_meta(keys::TEMPERATURE, self.config.rollout.temperature);
        let response_len = batch.get_int(names::RESPONSES)?.ncols();

        let Some(reference) = self.reference.as_mut() else {
            return Err(missing_capability("compute_ref_log_prob", role));
        };
        let manager = &self.ulysses;
        let output = run_scoped(manager, batch, move |batch| async move {
            let log_probs = reference.log_probs(&batch)?;
            let mut out = TensorBatch::new();
            out.insert(names::REF_LOG_PROB, log_probs)?;
            Ok(out)
        })
        .await?;

        let mut output = slice_response_cols(output, names::REF_LOG_PROB, response_len)?;
        output.to_host();

        if let Some(ref_offload) = &self.ref_offload {
            if self.config.reference.fsdp.param_offload {
                ref_offload.offload_params()?;
            }
        }
        self.pool.empty_cache();
        Ok(output)
    }

    /// Generates responses for a prompt batch through the weight
    /// hand-off scope.
    ///
    /// Inside the scope the inference engine holds the only live copy
    /// of the weights when offload is configured; training state is
    /// restored as the scope exits.
    pub async fn generate_sequences(&mut self, mut prompts: TensorBatch) -> Result<TensorBatch> {
        self.require_ready("generate_sequences")?;
        let role = self.role;
        prompts.to_accelerator(&self.pool, "rollout.prompts")?;
        prompts.set_meta(keys::EOS_TOKEN_ID, self.eos_token_id);
        prompts.set_meta(keys::PAD_TOKEN_ID, self.pad_token_id);
        debug!(prompts = prompts.batch_size(), "Generating sequences");

        let Some(handoff) = self.handoff.as_ref() else {
            return Err(missing_capability("generate_sequences", role));
        };
        let Some(engine) = self.rollout.as_mut() else {
            return Err(missing_capability("generate_sequences", role));
        };
        let mut output = run_scoped(handoff, prompts, move |prompts| async move {
            engine.generate(&prompts)
        })
        .await?;

        output.to_host();
        self.pool.empty_cache();
        Ok(output)
    }

    /// Writes this rank's policy snapshot under
    /// `<path>/global_step_<step>/` and waits for it to become durable
    /// on every rank.
    ///
    /// With `keep_previous` unset, snapshots from earlier steps are
    /// pruned once the new one is durable.
    pub async fn save_checkpoint(
        &mut self,
        path: &Path,
        global_step: Step,
        keep_previous: bool,
    ) -> Result<()> {
        self.require_ready("save_checkpoint")?;
        let role = self.role;
        if self.policy.is_none() {
            return Err(missing_capability("save_checkpoint", role));
        }

        // Snapshotting needs the parameters resident
        let toggle = self.config.actor.fsdp.param_offload;
        if toggle {
            if let Some(offload) = &self.offload {
                offload.load_params()?;
            }
        }

        let state = match self.policy.as_ref() {
            Some(policy) => policy.state()?,
            None => return Err(missing_capability("save_checkpoint", role)),
        };
        let snapshot = TrainSnapshot {
            role: self.shard_name("actor"),
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
        info!(
            role = %self.role,
            step = global_step,
            path = %path.display(),
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Restores this rank's policy snapshot from a
    /// `global_step_<N>` directory, returning the step it was saved at.
    pub async fn load_checkpoint(&mut self, path: &Path) -> Result<Step> {
        self.require_ready("load_checkpoint")?;
        let role = self.role;
        if self.policy.is_none() {
            return Err(missing_capability("load_checkpoint", role));
        }

        let toggle = self.config.actor.fsdp.param_offload;
        if toggle {
            if let Some(offload) = &self.offload {
                offload.load_params()?;
            }
        }

        let shard = path.join(format!("{}.ckpt", self.shard_name("actor")));
        let snapshot = read_snapshot(&shard).await?;
        let state = ModuleState {
            model: snapshot.model_state,
            optimizer: snapshot.optimizer_state,
        };
        match self.policy.as_mut() {
            Some(policy) => policy.restore(&state)?,
            None => return Err(missing_capability("load_checkpoint", role)),
        }
        self.scheduler = bincode::deserialize(&snapshot.scheduler_state)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if toggle {
            if let Some(offload) = &self.offload {
                offload.offload_params()?;
            }
        }
        info!(
            role = %self.role,
            step = snapshot.global_step,
            path = %shard.display(),
            "Restored checkpoint"
        );
        Ok(snapshot.global_step)
    }

    fn shard_name(&self, kind: &str) -> String {
        format!("{}_world_{}_rank_{}", kind, self.world_size, self.rank)
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

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};
    use parking_lot::Mutex;
    use runtime_core::config::OptimConfig;
    use tempfile::tempdir;

    #[derive(Default)]
    struct PolicyLog {
        update_calls: usize,
        seen_micro: Option<usize>,
        seen_temperature: Option<f64>,
        state: ModuleState,
    }

    struct FakePolicy {
        log: Arc<Mutex<PolicyLog>>,
    }

    impl PolicyModule for FakePolicy {
        fn update(&mut self, batch: &TensorBatch) -> Result<Metrics> {
            let mut log = self.log.lock();
            log.update_calls += 1;
            let mut metrics = Metrics::new();
            metrics.insert("actor/loss".to_string(), 0.25);
            metrics.insert("actor/samples".to_string(), batch.batch_size() as f64);
            Ok(metrics)
        }

        fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
            let mut log = self.log.lock();
            log.seen_micro = batch.meta_usize(keys::MICRO_BATCH_SIZE);
            log.seen_temperature = batch.meta_f64(keys::TEMPERATURE);
            Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.1))
        }

        fn state(&self) -> Result<ModuleState> {
            Ok(self.log.lock().state.clone())
        }

        fn restore(&mut self, state: &ModuleState) -> Result<()> {
            self.log.lock().state = state.clone();
            Ok(())
        }
    }

    #[derive(Default)]
    struct RefLog {
        allocated_during_op: u64,
        seen_temperature: Option<f64>,
    }

    struct FakeRef {
        pool: Arc<AcceleratorPool>,
        log: Arc<Mutex<RefLog>>,
    }

    impl RefModule for FakeRef {
        fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
            let mut log = self.log.lock();
            log.allocated_during_op = self.pool.allocated();
            log.seen_temperature = batch.meta_f64(keys::TEMPERATURE);
            Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.2))
        }
    }

    struct RolloutLog {
        eos: Option<i64>,
        pad: Option<i64>,
        allocated_during_generate: u64,
    }

    struct FakeRollout {
        pool: Arc<AcceleratorPool>,
        log: Arc<Mutex<Option<RolloutLog>>>,
    }

    impl RolloutEngine for FakeRollout {
        fn generate(&mut self, prompts: &TensorBatch) -> Result<TensorBatch> {
            *self.log.lock() = Some(RolloutLog {
                eos: prompts.meta_i64(keys::EOS_TOKEN_ID),
                pad: prompts.meta_i64(keys::PAD_TOKEN_ID),
                allocated_during_generate: self.pool.allocated(),
            });
            let ids = prompts.get_int(names::PROMPTS)?;
            let mut out = TensorBatch::new();
            out.insert(names::PROMPTS, ids.clone())?;
            out.insert(names::RESPONSES, Array2::<i64>::from_elem((ids.nrows(), 3), 7))?;
            Ok(out)
        }
    }

    struct PoolBridge {
        pool: Arc<AcceleratorPool>,
        bytes: u64,
        events: Mutex<Vec<&'static str>>,
    }

    impl WeightBridge for PoolBridge {
        fn publish(&self) -> Result<()> {
            self.pool.claim("inference.params", self.bytes)?;
            self.events.lock().push("publish");
            Ok(())
        }

        fn withdraw(&self) -> Result<()> {
            self.pool.release("inference.params", self.bytes);
            self.events.lock().push("withdraw");
            Ok(())
        }
    }

    const PARAM_BYTES: u64 = 400;
    const OPTIM_BYTES: u64 = 200;
    const REF_BYTES: u64 = 100;

    struct Fixture {
        pool: Arc<AcceleratorPool>,
        policy_log: Arc<Mutex<PolicyLog>>,
        ref_log: Arc<Mutex<RefLog>>,
        rollout_log: Arc<Mutex<Option<RolloutLog>>>,
        bridge: Arc<PoolBridge>,
    }

    impl Fixture {
        fn new() -> Self {
            let pool = AcceleratorPool::new(10_000);
            Self {
                bridge: Arc::new(PoolBridge {
                    pool: Arc::clone(&pool),
                    bytes: 300,
                    events: Mutex::new(Vec::new()),
                }),
                policy_log: Arc::new(Mutex::new(PolicyLog::default())),
                ref_log: Arc::new(Mutex::new(RefLog::default())),
                rollout_log: Arc::new(Mutex::new(None)),
                pool,
            }
        }

        fn worker(&self, role: Role, config: ActorRolloutRefConfig) -> ActorRolloutRefWorker {
            let policy_log = Arc::clone(&self.policy_log);
            let ref_log = Arc::clone(&self.ref_log);
            let rollout_log = Arc::clone(&self.rollout_log);
            let pool = Arc::clone(&self.pool);
            let bridge = Arc::clone(&self.bridge);
            ActorRolloutRefWorker::new(
                role,
                config,
                Arc::clone(&self.pool),
                Arc::new(LocalGroup::solo()),
                None,
                Box::new(move |_| {
                    Ok(ActorComponents {
                        policy: role.has_actor().then(|| {
                            Box::new(FakePolicy { log: policy_log }) as Box<dyn PolicyModule>
                        }),
                        rollout: role.has_rollout().then(|| {
                            Box::new(FakeRollout {
                                pool: Arc::clone(&pool),
                                log: rollout_log,
                            }) as Box<dyn RolloutEngine>
                        }),
                        reference: role.has_ref().then(|| {
                            Box::new(FakeRef {
                                pool: Arc::clone(&pool),
                                log: ref_log,
                            }) as Box<dyn RefModule>
                        }),
                        bridge: role
                            .has_rollout()
                            .then(|| bridge as Arc<dyn WeightBridge>),
                        eos_token_id: 2,
                        pad_token_id: 0,
                        param_bytes: PARAM_BYTES,
                        optimizer_bytes: OPTIM_BYTES,
                        ref_param_bytes: REF_BYTES,
                    })
                }),
            )
            .unwrap()
        }
    }

    fn small_config() -> ActorRolloutRefConfig {
        let mut config = ActorRolloutRefConfig::default();
        config.actor.ppo_mini_batch_size = 2;
        config
    }

    fn train_batch() -> TensorBatch {
        let mut batch = TensorBatch::new();
        batch
            .insert(names::PROMPTS, array![[11i64, 12], [13, 14]])
            .unwrap();
        batch
            .insert(names::RESPONSES, array![[1i64, 2, 3], [4, 5, 2]])
            .unwrap();
        batch
            .insert(
                names::INPUT_IDS,
                array![[11i64, 12, 1, 2, 3], [13, 14, 4, 5, 2]],
            )
            .unwrap();
        batch
            .insert(
                names::ATTENTION_MASK,
                array![[1i64, 1, 1, 1, 1], [1, 1, 1, 1, 1]],
            )
            .unwrap();
        batch
            .insert(names::POSITION_IDS, array![[0i64, 1, 2, 3, 4], [0, 1, 2, 3, 4]])
            .unwrap();
        batch
    }

    #[tokio::test]
    async fn test_operations_rejected_before_init() {
        let fixture = Fixture::new();
        let mut worker = fixture.worker(Role::Actor, small_config());
        let err = worker.update_actor(train_batch()).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized { .. }));
        let err = worker.compute_log_prob(train_batch()).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized { .. }));
    }

    #[test]
    fn test_init_model_registers_memory_and_runs_once() {
        let fixture = Fixture::new();
        let mut worker = fixture.worker(Role::Actor, small_config());
        worker.init_model().unwrap();
        assert_eq!(worker.state(), LifecycleState::Ready);
        assert_eq!(fixture.pool.allocated(), PARAM_BYTES + OPTIM_BYTES);

        let err = worker.init_model().unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized { .. }));
    }

    #[tokio::test]
    async fn test_missing_capability_reports_operation_and_role() {
        let fixture = Fixture::new();
        let mut actor_only = fixture.worker(Role::Actor, small_config());
        actor_only.init_model().unwrap();
        let err = actor_only.generate_sequences(train_batch()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MissingCapability { ref operation, ref role }
                if operation == "generate_sequences" && role == "actor"
        ));
        let err = actor_only
            .compute_ref_log_prob(train_batch())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCapability { .. }));

        let fixture = Fixture::new();
        let mut ref_only = fixture.worker(Role::Ref, small_config());
        ref_only.init_model().unwrap();
        let err = ref_only.update_actor(train_batch()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::MissingCapability { ref operation, .. } if operation == "update_actor"
        ));
    }

    #[tokio::test]
    async fn test_update_actor_steps_schedule_and_restores_offload() {
        let fixture = Fixture::new();
        let mut config = small_config();
        config.actor.fsdp.param_offload = true;
        config.actor.fsdp.optimizer_offload = true;
        config.actor.optim = OptimConfig {
            lr: 1e-3,
            total_training_steps: 8,
            lr_warmup_steps_ratio: 0.25,
            weight_decay: 0.01,
        };
        let mut worker = fixture.worker(Role::Actor, config);
        worker.init_model().unwrap();
        assert_eq!(fixture.pool.allocated(), 0);

        let mut batch = train_batch();
        batch.set_meta(keys::GLOBAL_TOKEN_NUM, vec![6i64, 4]);
        let metrics = worker.update_actor(batch).await.unwrap();

        // Two warmup steps out of eight total: first update is at half lr
        assert!((metrics["actor/lr"] - 0.5e-3).abs() < 1e-12);
        assert_eq!(metrics["actor/samples"], 2.0);
        assert!(metrics.contains_key("perf/throughput_tokens_per_sec"));
        assert!(metrics.contains_key("perf/time_per_step_s"));
        assert_eq!(fixture.policy_log.lock().update_calls, 1);

        // Training state back on host, batch claim emptied
        assert_eq!(fixture.pool.allocated(), 0);
        assert_eq!(fixture.pool.cached(), 0);

        let metrics = worker.update_actor(train_batch()).await.unwrap();
        assert!((metrics["actor/lr"] - 1e-3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_update_batch_must_align_with_mini_batch() {
        let fixture = Fixture::new();
        let mut config = small_config();
        config.actor.ppo_mini_batch_size = 2;
        config.rollout.n = 2;
        let mut worker = fixture.worker(Role::Actor, config);
        worker.init_model().unwrap();

        // Per-rank mini batch is 4 after rollout expansion; 2 samples cannot
        // form a full mini batch
        let err = worker.update_actor(train_batch()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::BatchSizeIndivisible { value: 2, divisor: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_compute_log_prob_slices_response_region() {
        let fixture = Fixture::new();
        let mut config = small_config();
        config.rollout.temperature = 0.7;
        config.rollout.log_prob_micro_batch_size = Some(4);
        let mut worker = fixture.worker(Role::Actor, config);
        worker.init_model().unwrap();

        let output = worker.compute_log_prob(train_batch()).await.unwrap();

        assert_eq!(output.names(), vec![names::OLD_LOG_PROBS]);
        assert_eq!(output.meta_f64(keys::TEMPERATURE), Some(0.7));
        let log_probs = output.get_float(names::OLD_LOG_PROBS).unwrap();
        assert_eq!(log_probs.dim(), (2, 3));
        // Trailing response columns of the full-width grid
        assert!((log_probs[[0, 0]] - -0.1).abs() < 1e-6);
        assert!((log_probs[[1, 2]] - -0.2).abs() < 1e-6);

        let log = fixture.policy_log.lock();
        assert_eq!(log.seen_micro, Some(4));
        assert_eq!(log.seen_temperature, Some(0.7));
    }

    #[tokio::test]
    async fn test_ref_log_prob_reuses_rollout_temperature() {
        let fixture = Fixture::new();
        let mut config = small_config();
        config.rollout.temperature = 0.3;
        config.reference.fsdp.param_offload = true;
        let mut worker = fixture.worker(Role::Ref, config);
        worker.init_model().unwrap();
        // Ref params offloaded at init
        assert_eq!(fixture.pool.allocated(), 0);

        let batch = train_batch();
        let batch_bytes = batch.byte_size();
        let output = worker.compute_ref_log_prob(batch).await.unwrap();

        assert_eq!(output.names(), vec![names::REF_LOG_PROB]);
        assert_eq!(output.get_float(names::REF_LOG_PROB).unwrap().dim(), (2, 3));

        let log = fixture.ref_log.lock();
        assert_eq!(log.seen_temperature, Some(0.3));
        assert_eq!(log.allocated_during_op, REF_BYTES + batch_bytes);
        drop(log);

        assert_eq!(fixture.pool.allocated(), 0);
        assert_eq!(fixture.pool.cached(), 0);
    }

    #[tokio::test]
    async fn test_generate_runs_inside_weight_handoff() {
        let fixture = Fixture::new();
        let mut config = small_config();
        config.actor.fsdp.param_offload = true;
        config.actor.fsdp.optimizer_offload = true;
        let mut worker = fixture.worker(Role::ActorRollout, config);
        worker.init_model().unwrap();
        assert_eq!(fixture.pool.allocated(), 0);

        let mut prompts = TensorBatch::new();
        prompts
            .insert(names::PROMPTS, array![[11i64, 12], [13, 14]])
            .unwrap();
        let prompt_bytes = prompts.byte_size();
        let output = worker.generate_sequences(prompts).await.unwrap();

        assert_eq!(output.get_int(names::RESPONSES).unwrap().dim(), (2, 3));
        let log = fixture.rollout_log.lock();
        let seen = log.as_ref().unwrap();
        assert_eq!(seen.eos, Some(2));
        assert_eq!(seen.pad, Some(0));
        // Training state left the accelerator; only the inference copy and
        // the prompt batch were resident during generation
        assert_eq!(seen.allocated_during_generate, 300 + prompt_bytes);
        drop(log);

        assert_eq!(*fixture.bridge.events.lock(), vec!["publish", "withdraw"]);
        assert_eq!(fixture.pool.allocated(), 0);
        assert_eq!(fixture.pool.cached(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip_restores_schedule() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new();
        let mut config = small_config();
        config.actor.optim.lr_warmup_steps_ratio = 0.5;
        config.actor.optim.total_training_steps = 4;

        let mut worker = fixture.worker(Role::Actor, config.clone());
        worker.init_model().unwrap();
        fixture.policy_log.lock().state = ModuleState {
            model: vec![1, 2, 3],
            optimizer: vec![4, 5],
        };
        let first_lr = worker.update_actor(train_batch()).await.unwrap()["actor/lr"];
        worker
            .save_checkpoint(dir.path(), 3, true)
            .await
            .unwrap();
        assert!(dir
            .path()
            .join("global_step_3")
            .join("actor_world_1_rank_0.ckpt")
            .exists());

        let resumed_fixture = Fixture::new();
        let mut resumed = resumed_fixture.worker(Role::Actor, config);
        resumed.init_model().unwrap();
        let step = resumed
            .load_checkpoint(&dir.path().join("global_step_3"))
            .await
            .unwrap();
        assert_eq!(step, 3);
        assert_eq!(
            resumed_fixture.policy_log.lock().state,
            ModuleState {
                model: vec![1, 2, 3],
                optimizer: vec![4, 5],
            }
        );

        // The schedule resumes where the saved worker left off
        let resumed_lr = resumed.update_actor(train_batch()).await.unwrap()["actor/lr"];
        assert!(resumed_lr > first_lr);
    }

    #[tokio::test]
    async fn test_save_without_keep_prunes_older_steps() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new();
        let mut worker = fixture.worker(Role::Actor, small_config());
        worker.init_model().unwrap();

        worker.save_checkpoint(dir.path(), 1, true).await.unwrap();
        worker.save_checkpoint(dir.path(), 2, false).await.unwrap();

        assert!(!dir.path().join("global_step_1").exists());
        assert!(dir
            .path()
            .join("global_step_2")
            .join("actor_world_1_rank_0.ckpt")
            .exists());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_reported() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new();
        let mut worker = fixture.worker(Role::Actor, small_config());
        worker.init_model().unwrap();
        let err = worker.load_checkpoint(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound { .. }));
    }
}
