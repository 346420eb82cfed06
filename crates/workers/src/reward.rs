//! Reward scoring worker
//!
//! Scores generated responses through one of four backends: a scalar
//! sequence classifier, a two-class process classifier scoring each
//! reasoning step, a colocated generative judge, or a remote judge
//! service. Classifier backends run micro-batched model forwards
//! inside the sequence parallel scope; judge backends decode text from
//! full rows and so bypass the scope entirely.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{concatenate, s, Array2, Array3, Axis};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use data_batch::{names, split_by_token_budget, TensorBatch};
use runtime_core::collective::{CollectiveGroup, LocalGroup};
use runtime_core::config::{normalize_micro_batch, RewardBackend, RewardModelConfig};
use runtime_core::error::{Error, Result};
use runtime_core::memory::AcceleratorPool;
use runtime_core::offload::OffloadController;
use runtime_core::topology::{build_fsdp_mesh, build_sequence_parallel_mesh, DeviceMesh};
use runtime_core::types::{LifecycleState, Rank, Role, TokenId};
use sharding::{run_scoped, UlyssesShardingManager};
use step_reward::{
    apply_credit_assignment, judge_all_steps, separator_token_ids, split_steps, JudgeKind,
    PromptTemplate, RemoteJudgeClient, ScoreExtractor, StepJudge, StepSegments, TokenCodec,
};

use crate::model::{JudgeEngine, ScoreHead, ScoreModule};

/// Engines produced by a reward component builder during `init_model`.
///
/// Which fields must be present depends on the configured backend: the
/// classifier backends need `score`, the local judge backend needs
/// `judge_engine`, and the remote judge backend needs neither.
pub struct RewardComponents {
    /// Scoring model, required by the classifier backends
    pub score: Option<Box<dyn ScoreModule>>,

    /// Colocated judge engine, required by the local judge backend
    pub judge_engine: Option<Box<dyn JudgeEngine>>,

    /// Accelerator bytes the scoring or judge model occupies
    pub param_bytes: u64,
}

/// Builds the scoring engine once the worker's topology is in place
pub type RewardComponentBuilder =
    Box<dyn FnOnce(&RewardModelConfig) -> Result<RewardComponents> + Send>;

/// Adapter driving a colocated judge engine through the step judging
/// interface.
///
/// Generation failures degrade to the local parse-failure score rather
/// than failing the batch; a broken judge must not abort training.
struct LocalJudgeBackend {
    engine: Mutex<Box<dyn JudgeEngine>>,
    template: PromptTemplate,
    extractor: ScoreExtractor,
}

#[async_trait]
impl StepJudge for LocalJudgeBackend {
    async fn score(&self, problem: &str, previous_steps: &str, current_step: &str) -> f32 {
        let prompt = self.template.render(problem, previous_steps, current_step);
        match self.engine.lock().generate_text(&prompt) {
            Ok(text) => self.extractor.extract(&text, JudgeKind::Local),
            Err(e) => {
                error!(error = %e, "local judge generation failed, degrading step score");
                JudgeKind::Local.parse_failure_score()
            }
        }
    }
}

/// Worker hosting the configured reward scoring backend
pub struct RewardWorker {
    config: RewardModelConfig,
    state: LifecycleState,
    rank: Rank,
    pool: Arc<AcceleratorPool>,
    fsdp_mesh: DeviceMesh,
    micro_per_device: Option<usize>,
    codec: Arc<dyn TokenCodec>,

    /// Token ids that close a reasoning step, scanned from the
    /// vocabulary at construction
    separators: HashSet<TokenId>,

    builder: Option<RewardComponentBuilder>,
    score: Option<Box<dyn ScoreModule>>,
    judge: Option<Arc<dyn StepJudge>>,
    offload: Option<Arc<OffloadController>>,
    ulysses: UlyssesShardingManager,
}

impl std::fmt::Debug for RewardWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardWorker")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

impl RewardWorker {
    /// Creates the worker on this rank's topology.
    ///
    /// The codec is used to scan the vocabulary for separator tokens
    /// and, for the judge backends, to decode problem and step text.
    pub fn new(
        config: RewardModelConfig,
        codec: Arc<dyn TokenCodec>,
        pool: Arc<AcceleratorPool>,
        group: Arc<dyn CollectiveGroup>,
        sp_group: Option<Arc<dyn CollectiveGroup>>,
        builder: RewardComponentBuilder,
    ) -> Result<Self> {
        config.validate()?;
        let rank = group.rank();
        let world_size = group.world_size();
        let sp = config.ulysses_sequence_parallel_size;

        let fsdp_mesh = build_fsdp_mesh(rank, world_size, config.fsdp.fsdp_size)?;
        let sp_mesh = build_sequence_parallel_mesh(rank, world_size, sp)?;
        let ulysses = UlyssesShardingManager::new(
            sp_mesh,
            sp_group.unwrap_or_else(|| Arc::new(LocalGroup::solo())),
        )?;
        let micro_per_device =
            normalize_micro_batch("reward.micro_batch_size", config.micro_batch_size, world_size, sp)?;
        let separators = separator_token_ids(codec.as_ref(), &config.split_step_char);

        info!(
            rank,
            world_size,
            backend = ?config.backend,
            separator_tokens = separators.len(),
            "Constructed reward worker"
        );

        Ok(Self {
            config,
            state: LifecycleState::Uninitialized,
            rank,
            pool,
            fsdp_mesh,
            micro_per_device,
            codec,
            separators,
            builder: Some(builder),
            score: None,
            judge: None,
            offload: None,
            ulysses,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Builds the backend's engines and registers their memory with the
    /// pool.
    ///
    /// Async because the remote judge backend verifies its endpoint is
    /// reachable before the worker accepts traffic.
    pub async fn init_model(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(Error::AlreadyInitialized {
                role: Role::Reward.to_string(),
            });
        }
        let builder = self.builder.take().ok_or_else(|| Error::Internal {
            message: "component builder already consumed".to_string(),
        })?;
        let components = builder(&self.config)?;
        self.state = LifecycleState::ModelBuilt;

        match self.config.backend {
            RewardBackend::Classifier | RewardBackend::ProcessClassifier => {
                let Some(score) = components.score else {
                    return Err(Error::InvalidConfig {
                        message: format!(
                            "{:?} backend requires a score module",
                            self.config.backend
                        ),
                    });
                };
                let expected = match self.config.backend {
                    RewardBackend::Classifier => ScoreHead::Scalar,
                    _ => ScoreHead::TwoClass,
                };
                if score.head() != expected {
                    return Err(Error::InvalidConfig {
                        message: format!(
                            "{:?} backend requires a {:?} score head, model has {:?}",
                            self.config.backend,
                            expected,
                            score.head()
                        ),
                    });
                }
                let offload = Arc::new(OffloadController::new(
                    Arc::clone(&self.pool),
                    "reward",
                    components.param_bytes,
                )?);
                if self.config.fsdp.param_offload {
                    offload.offload_params()?;
                }
                self.score = Some(score);
                self.offload = Some(offload);
            }
            RewardBackend::LocalJudge => {
                let Some(engine) = components.judge_engine else {
                    return Err(Error::InvalidConfig {
                        message: "local_judge backend requires a judge engine".to_string(),
                    });
                };
                let judge_config =
                    self.config.judge.as_ref().ok_or_else(|| Error::InvalidConfig {
                        message: "local_judge backend requires a judge section".to_string(),
                    })?;
                let backend = LocalJudgeBackend {
                    engine: Mutex::new(engine),
                    template: PromptTemplate::from_config(judge_config.prompt_template.as_deref()),
                    extractor: ScoreExtractor::new(),
                };
                let offload = Arc::new(OffloadController::new(
                    Arc::clone(&self.pool),
                    "reward",
                    components.param_bytes,
                )?);
                if self.config.fsdp.param_offload {
                    offload.offload_params()?;
                }
                self.judge = Some(Arc::new(backend));
                self.offload = Some(offload);
            }
            RewardBackend::RemoteJudge => {
                let judge_config =
                    self.config.judge.clone().ok_or_else(|| Error::InvalidConfig {
                        message: "remote_judge backend requires a judge section".to_string(),
                    })?;
                // No resident model on this rank; scoring lives behind
                // the remote endpoint
                let client = RemoteJudgeClient::connect(judge_config).await?;
                self.judge = Some(Arc::new(client));
            }
        }

        self.state = LifecycleState::Ready;
        self.pool.empty_cache();
        info!(
            rank = self.rank,
            mesh = ?self.fsdp_mesh.shape(),
            backend = ?self.config.backend,
            "Reward backend initialized"
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

    /// Scores a batch of responses, returning a `(batch, response_len)`
    /// token-level score grid under [`names::RM_SCORES`].
    pub async fn compute_rm_score(&mut self, batch: TensorBatch) -> Result<TensorBatch> {
        self.require_ready("compute_rm_score")?;
        match self.config.backend {
            RewardBackend::Classifier | RewardBackend::ProcessClassifier => {
                self.model_scores(batch).await
            }
            RewardBackend::LocalJudge | RewardBackend::RemoteJudge => {
                self.judge_scores(batch).await
            }
        }
    }

    /// Classifier scoring: micro-batched forwards inside the sequence
    /// parallel scope, then head-specific score extraction.
    async fn model_scores(&mut self, mut batch: TensorBatch) -> Result<TensorBatch> {
        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.load_params()?;
            }
        }
        batch.to_accelerator(&self.pool, "reward.score_batch")?;
        let response_len = batch.get_int(names::RESPONSES)?.ncols();

        // Step boundaries come from full-width rows, so they are located
        // before the scope can shard the sequence axis
        let segments = match self.config.backend {
            RewardBackend::ProcessClassifier => Some(split_steps(
                batch.get_int(names::RESPONSES)?,
                batch.get_int(names::ATTENTION_MASK)?,
                &self.separators,
            )?),
            _ => None,
        };
        let credit_enabled = self.config.credit.enabled;
        let credit_temperature = self.config.credit.temperature as f32;
        let use_dynamic = self.config.use_dynamic_bsz;
        let budget =
            self.config.forward_max_token_len_per_gpu * self.config.ulysses_sequence_parallel_size;
        let micro_per_device = self.micro_per_device;

        let Some(score) = self.score.as_mut() else {
            return Err(Error::NotInitialized {
                operation: "compute_rm_score".to_string(),
            });
        };
        let manager = &self.ulysses;
        let mut output = run_scoped(manager, batch, move |batch| async move {
            let (micro_batches, restore) = if use_dynamic {
                split_by_token_budget(&batch, names::ATTENTION_MASK, budget)?
            } else {
                split_fixed(&batch, micro_per_device)?
            };
            let mut grids = Vec::with_capacity(micro_batches.len());
            for micro in &micro_batches {
                grids.push(score.forward(micro)?);
            }
            let views: Vec<_> = grids.iter().map(|grid| grid.view()).collect();
            let stacked =
                concatenate(Axis(0), &views).map_err(|e| Error::ShapeMismatch {
                    name: names::RM_SCORES.to_string(),
                    message: e.to_string(),
                })?;
            let grid = stacked.select(Axis(0), &restore);

            let scores = match &segments {
                None => eos_token_scores(&batch, &grid, response_len)?,
                Some(segments) => {
                    let mut scores = boundary_score_diffs(&grid, segments, response_len)?;
                    if credit_enabled {
                        apply_credit_assignment(
                            &mut scores,
                            segments.reward_mask(),
                            credit_temperature,
                        )?;
                    }
                    scores
                }
            };
            let mut out = TensorBatch::new();
            out.insert(names::RM_SCORES, scores)?;
            Ok(out)
        })
        .await?;

        output.to_host();
        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.offload_params()?;
            }
        }
        self.pool.empty_cache();
        Ok(output)
    }

    /// Judge scoring: decode problem and step text from full rows and
    /// collect one score per step boundary.
    async fn judge_scores(&mut self, mut batch: TensorBatch) -> Result<TensorBatch> {
        if let Some(offload) = &self.offload {
            if self.config.fsdp.param_offload {
                offload.load_params()?;
            }
        }
        batch.to_accelerator(&self.pool, "reward.judge_batch")?;
        debug!(samples = batch.batch_size(), "Scoring responses with judge");

        let prompts = batch.get_int(names::PROMPTS)?;
        let responses = batch.get_int(names::RESPONSES)?;
        let mask = batch.get_int(names::ATTENTION_MASK)?;
        let prompt_mask = mask.slice(s![.., ..prompts.ncols()]).to_owned();
        let segments = split_steps(responses, mask, &self.separators)?;

        let Some(judge) = self.judge.as_ref() else {
            return Err(Error::NotInitialized {
                operation: "compute_rm_score".to_string(),
            });
        };
        let mut scores = judge_all_steps(
            judge.as_ref(),
            self.codec.as_ref(),
            prompts,
            &prompt_mask,
            responses,
            &segments,
        )
        .await?;
        if self.config.credit.enabled {
            apply_credit_assignment(
                &mut scores,
                segments.reward_mask(),
                self.config.credit.temperature as f32,
            )?;
        }
        let mut out = TensorBatch::new();
        out.insert(names::RM_SCORES, scores)?;
        drop(batch);

        if matches!(self.config.backend, RewardBackend::LocalJudge) {
            if let Some(offload) = &self.offload {
                if self.config.fsdp.param_offload {
                    offload.offload_params()?;
                }
            }
            self.pool.empty_cache();
        }
        Ok(out)
    }
}

/// Fixed-size row split preserving order, with an identity restore
/// index. The final chunk may be smaller.
fn split_fixed(
    batch: &TensorBatch,
    per_device: Option<usize>,
) -> Result<(Vec<TensorBatch>, Vec<usize>)> {
    let size = batch.batch_size();
    let per = per_device.unwrap_or_else(|| size.max(1)).max(1);
    let mut parts = Vec::new();
    let mut start = 0;
    while start < size {
        let end = (start + per).min(size);
        parts.push(batch.slice(start..end)?);
        start = end;
    }
    Ok((parts, (0..size).collect()))
}

/// Scatter each sequence's score at its last valid token over a zero
/// grid and keep the response region
fn eos_token_scores(
    batch: &TensorBatch,
    grid: &Array3<f32>,
    response_len: usize,
) -> Result<Array2<f32>> {
    let mask = batch.get_int(names::ATTENTION_MASK)?;
    let position_ids = batch.get_int(names::POSITION_IDS)?;
    let (rows, total) = mask.dim();
    if grid.dim().0 != rows || grid.dim().1 != total {
        return Err(Error::ShapeMismatch {
            name: names::RM_SCORES.to_string(),
            message: format!(
                "score grid is {:?} but the batch mask is {:?}",
                grid.dim(),
                mask.dim()
            ),
        });
    }
    let start = total
        .checked_sub(response_len)
        .ok_or_else(|| Error::ShapeMismatch {
            name: names::RM_SCORES.to_string(),
            message: format!(
                "mask has {} columns, response region needs {}",
                total, response_len
            ),
        })?;

    let mut scores = Array2::<f32>::zeros((rows, total));
    for i in 0..rows {
        let mut eos = 0usize;
        let mut best = i64::MIN;
        for t in 0..total {
            let weighted = position_ids[[i, t]] * mask[[i, t]];
            if weighted > best {
                best = weighted;
                eos = t;
            }
        }
        scores[[i, eos]] = grid[[i, eos, 0]];
    }
    Ok(scores.slice(s![.., start..]).to_owned())
}

/// Two-class probability difference at each step boundary: P(correct)
/// minus P(incorrect), zero away from boundaries
fn boundary_score_diffs(
    grid: &Array3<f32>,
    segments: &StepSegments,
    response_len: usize,
) -> Result<Array2<f32>> {
    let (rows, total, classes) = grid.dim();
    if classes != 2 {
        return Err(Error::ShapeMismatch {
            name: names::RM_SCORES.to_string(),
            message: format!("process scoring needs a two-class grid, got {} classes", classes),
        });
    }
    let start = total
        .checked_sub(response_len)
        .ok_or_else(|| Error::ShapeMismatch {
            name: names::RM_SCORES.to_string(),
            message: format!(
                "score grid has {} columns, response region needs {}",
                total, response_len
            ),
        })?;
    let reward_mask = segments.reward_mask();
    if reward_mask.dim() != (rows, response_len) {
        return Err(Error::ShapeMismatch {
            name: names::RM_SCORES.to_string(),
            message: format!(
                "reward mask is {:?} but the batch is ({}, {})",
                reward_mask.dim(),
                rows,
                response_len
            ),
        });
    }

    let mut scores = Array2::<f32>::zeros((rows, response_len));
    for i in 0..rows {
        for t in 0..response_len {
            if reward_mask[[i, t]] {
                let incorrect = grid[[i, start + t, 0]];
                let correct = grid[[i, start + t, 1]];
                let peak = incorrect.max(correct);
                let e0 = (incorrect - peak).exp();
                let e1 = (correct - peak).exp();
                scores[[i, t]] = (e1 - e0) / (e0 + e1);
            }
        }
    }
    Ok(scores)
}
