//! End-to-end training simulation test
//!
//! This test simulates a realistic distributed RLHF job with:
//! - Multiple ranks driving actor, critic, and reward workers in lockstep
//! - Generation, log prob, value, and scoring phases feeding updates
//! - Full parameter and optimizer offload around every phase
//! - Periodic checkpointing with pruning and barrier synchronization
//! - Restart recovery from the latest checkpoint

use axum::routing::{get, post};
use axum::{Json, Router};
use ndarray::{s, Array2};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use data_batch::{keys, names, TensorBatch};
use runtime_core::collective::{CollectiveGroup, LocalGroup};
use runtime_core::config::{
    ActorRolloutRefConfig, CriticConfig, JudgeConfig, RetryConfig, RewardBackend,
    RewardModelConfig,
};
use runtime_core::error::Result;
use runtime_core::memory::AcceleratorPool;
use runtime_core::types::Role;
use sharding::WeightBridge;
use step_reward::VocabCodec;
use workers::{
    ActorComponents, ActorRolloutRefWorker, CriticComponents, CriticWorker, Metrics, ModuleState,
    PolicyModule, RefModule, RewardComponents, RewardWorker, RolloutEngine, ScoreHead,
    ScoreModule, ValueModule,
};

/// Observable policy state shared with the test driver
#[derive(Default)]
struct PolicyProbe {
    updates: u8,
    restored: Option<ModuleState>,
}

struct StepPolicy {
    probe: Arc<Mutex<PolicyProbe>>,
}

impl PolicyModule for StepPolicy {
    fn update(&mut self, _batch: &TensorBatch) -> Result<Metrics> {
        self.probe.lock().unwrap().updates += 1;
        let mut metrics = Metrics::new();
        metrics.insert("actor/pg_loss".to_string(), 0.25);
        Ok(metrics)
    }

    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
        Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.05))
    }

    fn state(&self) -> Result<ModuleState> {
        let updates = self.probe.lock().unwrap().updates;
        Ok(ModuleState {
            model: vec![updates],
            optimizer: vec![0],
        })
    }

    fn restore(&mut self, state: &ModuleState) -> Result<()> {
        self.probe.lock().unwrap().restored = Some(state.clone());
        Ok(())
    }
}

struct StubRef;

impl RefModule for StubRef {
    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
        Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.02))
    }
}

struct StubRollout {
    response: [i64; 4],
}

impl RolloutEngine for StubRollout {
    fn generate(&mut self, prompts: &TensorBatch) -> Result<TensorBatch> {
        let prompt_ids = prompts.get_int(names::PROMPTS)?;
        let (rows, prompt_len) = prompt_ids.dim();
        let response_len = self.response.len();
        let mut responses = Array2::<i64>::zeros((rows, response_len));
        for mut row in responses.rows_mut() {
            for (t, token) in self.response.iter().enumerate() {
                row[t] = *token;
            }
        }
        let total = prompt_len + response_len;
        let mut input_ids = Array2::<i64>::zeros((rows, total));
        input_ids.slice_mut(s![.., ..prompt_len]).assign(prompt_ids);
        input_ids.slice_mut(s![.., prompt_len..]).assign(&responses);

        let mut out = TensorBatch::new();
        out.insert(names::PROMPTS, prompt_ids.clone())?;
        out.insert(names::RESPONSES, responses)?;
        out.insert(names::INPUT_IDS, input_ids)?;
        out.insert(names::ATTENTION_MASK, Array2::<i64>::ones((rows, total)))?;
        out.insert(
            names::POSITION_IDS,
            Array2::from_shape_fn((rows, total), |(_, t)| t as i64),
        )?;
        Ok(out)
    }
}

struct StubBridge;

impl WeightBridge for StubBridge {
    fn publish(&self) -> Result<()> {
        Ok(())
    }

    fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

struct StubValue;

impl ValueModule for StubValue {
    fn update(&mut self, _batch: &TensorBatch) -> Result<Metrics> {
        let mut metrics = Metrics::new();
        metrics.insert("critic/vf_loss".to_string(), 0.5);
        Ok(metrics)
    }

    fn values(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
        Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * 0.5))
    }

    fn state(&self) -> Result<ModuleState> {
        Ok(ModuleState {
            model: vec![3],
            optimizer: vec![4],
        })
    }

    fn restore(&mut self, _state: &ModuleState) -> Result<()> {
        Ok(())
    }
}

struct StubScore;

impl ScoreModule for StubScore {
    fn head(&self) -> ScoreHead {
        ScoreHead::Scalar
    }

    fn forward(&mut self, batch: &TensorBatch) -> Result<ndarray::Array3<f32>> {
        let ids = batch.get_int(names::INPUT_IDS)?;
        let (rows, cols) = ids.dim();
        let mut grid = ndarray::Array3::<f32>::zeros((rows, cols, 1));
        for ((i, t), v) in ids.indexed_iter() {
            grid[[i, t, 0]] = *v as f32 * 0.01;
        }
        Ok(grid)
    }
}

fn clone_rows(batch: &TensorBatch) -> Result<TensorBatch> {
    batch.select(&(0..batch.batch_size()).collect::<Vec<_>>())
}

fn actor_config() -> ActorRolloutRefConfig {
    let mut config = ActorRolloutRefConfig::default();
    config.actor.ppo_mini_batch_size = 2;
    config.actor.fsdp.param_offload = true;
    config.actor.fsdp.optimizer_offload = true;
    config.reference.fsdp.param_offload = true;
    config
}

fn build_actor(
    pool: &Arc<AcceleratorPool>,
    group: &Arc<dyn CollectiveGroup>,
    probe: Arc<Mutex<PolicyProbe>>,
) -> Result<ActorRolloutRefWorker> {
    ActorRolloutRefWorker::new(
        Role::ActorRolloutRef,
        actor_config(),
        Arc::clone(pool),
        Arc::clone(group),
        None,
        Box::new(move |_| {
            Ok(ActorComponents {
                policy: Some(Box::new(StepPolicy { probe })),
                rollout: Some(Box::new(StubRollout {
                    response: [2, 3, 5, 1],
                })),
                reference: Some(Box::new(StubRef)),
                bridge: Some(Arc::new(StubBridge)),
                eos_token_id: 1,
                pad_token_id: 0,
                param_bytes: 1024,
                optimizer_bytes: 512,
                ref_param_bytes: 256,
            })
        }),
    )
}

/// One rank's slice of the training job: four steps of generate /
/// score / update with checkpoints every second step.
async fn run_rank(
    rank: usize,
    group: LocalGroup,
    ckpt_dir: PathBuf,
    probe: Arc<Mutex<PolicyProbe>>,
) -> anyhow::Result<()> {
    let group: Arc<dyn CollectiveGroup> = Arc::new(group);
    let pool = AcceleratorPool::new(1 << 20);

    let mut actor = build_actor(&pool, &group, probe)?;
    actor.init_model()?;

    let mut critic_config = CriticConfig::default();
    critic_config.ppo_mini_batch_size = 2;
    critic_config.fsdp.param_offload = true;
    critic_config.fsdp.optimizer_offload = true;
    let mut critic = CriticWorker::new(
        critic_config,
        Arc::clone(&pool),
        Arc::clone(&group),
        None,
        Box::new(|_| {
            Ok(CriticComponents {
                value: Box::new(StubValue),
                param_bytes: 2048,
                optimizer_bytes: 1024,
            })
        }),
    )?;
    critic.init_model()?;

    let mut reward_config = RewardModelConfig::default();
    reward_config.fsdp.param_offload = true;
    let codec = Arc::new(VocabCodec::new(
        vec!["<pad>".to_string(), "<eos>".to_string()],
        1,
        0,
    ));
    let mut reward = RewardWorker::new(
        reward_config,
        codec,
        Arc::clone(&pool),
        Arc::clone(&group),
        None,
        Box::new(|_| {
            Ok(RewardComponents {
                score: Some(Box::new(StubScore)),
                judge_engine: None,
                param_bytes: 4096,
            })
        }),
    )?;
    reward.init_model().await?;

    let total_steps = 4u64;
    let checkpoint_interval = 2u64;

    for step in 1..=total_steps {
        let mut prompts = TensorBatch::new();
        prompts.insert(
            names::PROMPTS,
            Array2::from_shape_fn((2, 2), |(i, t)| (rank * 100 + i * 10 + t) as i64),
        )?;
        let generated = actor.generate_sequences(prompts).await?;

        let log_prob_out = actor.compute_log_prob(clone_rows(&generated)?).await?;
        let ref_out = actor.compute_ref_log_prob(clone_rows(&generated)?).await?;
        let values_out = critic.compute_values(clone_rows(&generated)?).await?;
        let score_out = reward.compute_rm_score(clone_rows(&generated)?).await?;

        let mut train_batch = clone_rows(&generated)?;
        train_batch.union(log_prob_out)?;
        train_batch.union(ref_out)?;
        train_batch.union(values_out)?;
        train_batch.union(score_out)?;
        train_batch.set_meta(keys::GLOBAL_TOKEN_NUM, vec![6i64, 6]);

        critic.update_critic(clone_rows(&train_batch)?).await?;
        actor.update_actor(train_batch).await?;

        if step % checkpoint_interval == 0 {
            actor.save_checkpoint(&ckpt_dir, step, false).await?;
            critic.save_checkpoint(&ckpt_dir, step, false).await?;
        }
    }

    // Every phase returned its weights and data to the host
    assert_eq!(pool.allocated(), 0);
    Ok(())
}

#[tokio::test]
async fn test_multi_rank_training_simulation() -> anyhow::Result<()> {
    let world_size = 2;
    let dir = tempfile::tempdir()?;
    let groups = LocalGroup::new_group(world_size, Duration::from_secs(10))?;

    let mut probes = Vec::new();
    let mut handles = Vec::new();
    for (rank, group) in groups.into_iter().enumerate() {
        let probe = Arc::new(Mutex::new(PolicyProbe::default()));
        probes.push(Arc::clone(&probe));
        handles.push(tokio::spawn(run_rank(
            rank,
            group,
            dir.path().to_path_buf(),
            probe,
        )));
    }
    for handle in handles {
        handle.await??;
    }

    // Pruning kept only the newest step directory
    let mut step_dirs = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        step_dirs.push(entry?.file_name().to_string_lossy().into_owned());
    }
    assert_eq!(step_dirs, vec!["global_step_4".to_string()]);

    // Both ranks wrote actor and critic shards
    for rank in 0..world_size {
        let step_dir = dir.path().join("global_step_4");
        assert!(step_dir
            .join(format!("actor_world_{world_size}_rank_{rank}.ckpt"))
            .exists());
        assert!(step_dir
            .join(format!("critic_world_{world_size}_rank_{rank}.ckpt"))
            .exists());
    }

    // Four update steps reached every rank's policy
    for probe in &probes {
        assert_eq!(probe.lock().unwrap().updates, 4);
    }

    // A replacement rank joins and resumes from the latest checkpoint
    let recovery_groups = LocalGroup::new_group(world_size, Duration::from_secs(10))?;
    let group: Arc<dyn CollectiveGroup> =
        Arc::new(recovery_groups.into_iter().next().unwrap());
    let pool = AcceleratorPool::new(1 << 20);
    let probe = Arc::new(Mutex::new(PolicyProbe::default()));
    let mut replacement = build_actor(&pool, &group, Arc::clone(&probe))?;
    replacement.init_model()?;

    let resumed = replacement
        .load_checkpoint(&dir.path().join("global_step_4"))
        .await?;
    assert_eq!(resumed, 4);
    let restored = probe.lock().unwrap().restored.clone();
    assert_eq!(
        restored,
        Some(ModuleState {
            model: vec![4],
            optimizer: vec![0],
        })
    );

    Ok(())
}

async fn serve(router: Router) -> (String, oneshot::Sender<()>) {
    let port = portpicker::pick_unused_port().expect("No ports free");
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind mock judge");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .ok();
    });
    (format!("http://127.0.0.1:{port}"), tx)
}

#[tokio::test]
async fn test_generate_then_judge_pipeline() -> anyhow::Result<()> {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_handler = Arc::clone(&seen);
    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/v1/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = Arc::clone(&seen_handler);
                async move {
                    let content = body["messages"][0]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    seen.lock().unwrap().push(content);
                    Json(serde_json::json!({
                        "choices": [{"message": {"role": "assistant", "content": r"\boxed{1.0}"}}]
                    }))
                }
            }),
        );
    let (addr, _shutdown) = serve(router).await;

    let pool = AcceleratorPool::new(1 << 20);
    let group: Arc<dyn CollectiveGroup> = Arc::new(LocalGroup::solo());

    // Rollout emits "step" ".\n\n" " one" "<eos>": one separator
    // boundary and one final boundary
    let mut config = ActorRolloutRefConfig::default();
    config.actor.ppo_mini_batch_size = 2;
    let mut actor = ActorRolloutRefWorker::new(
        Role::ActorRollout,
        config,
        Arc::clone(&pool),
        Arc::clone(&group),
        None,
        Box::new(|_| {
            Ok(ActorComponents {
                policy: Some(Box::new(StepPolicy {
                    probe: Arc::new(Mutex::new(PolicyProbe::default())),
                })),
                rollout: Some(Box::new(StubRollout {
                    response: [2, 4, 3, 1],
                })),
                reference: None,
                bridge: Some(Arc::new(StubBridge)),
                eos_token_id: 1,
                pad_token_id: 0,
                param_bytes: 1024,
                optimizer_bytes: 512,
                ref_param_bytes: 0,
            })
        }),
    )?;
    actor.init_model()?;

    let codec = Arc::new(VocabCodec::new(
        vec![
            "<pad>".to_string(),
            "<eos>".to_string(),
            "step".to_string(),
            " one".to_string(),
            ".\n\n".to_string(),
            "what is 1+0?".to_string(),
        ],
        1,
        0,
    ));
    let mut reward_config = RewardModelConfig::default();
    reward_config.backend = RewardBackend::RemoteJudge;
    reward_config.judge = Some(JudgeConfig {
        base_url: addr,
        request_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        },
        ..JudgeConfig::default()
    });
    let mut reward = RewardWorker::new(
        reward_config,
        codec,
        Arc::clone(&pool),
        group,
        None,
        Box::new(|_| {
            Ok(RewardComponents {
                score: None,
                judge_engine: None,
                param_bytes: 0,
            })
        }),
    )?;
    reward.init_model().await?;

    let mut prompts = TensorBatch::new();
    prompts.insert(names::PROMPTS, Array2::from_elem((1, 1), 5i64))?;
    let generated = actor.generate_sequences(prompts).await?;

    let scored = reward.compute_rm_score(generated).await?;
    let scores = scored.get_float(names::RM_SCORES)?;
    assert_eq!(scores.dim(), (1, 4));

    // Two equal judge scores of 1.0 split the credit weight evenly
    assert_eq!(scores[[0, 0]], 0.0);
    assert!((scores[[0, 1]] - 0.5).abs() < 1e-6);
    assert_eq!(scores[[0, 2]], 0.0);
    assert!((scores[[0, 3]] - 0.5).abs() < 1e-6);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains("[Problem]\nwhat is 1+0?"));
    assert!(seen[0].contains("[Current step being evaluated]\nstep"));
    assert!(seen[1].contains("[Previous steps]\nstep"));
    assert!(seen[1].contains("[Current step being evaluated]\n one"));

    Ok(())
}
