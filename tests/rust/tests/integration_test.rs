use ndarray::{array, s, Array2, Array3};
use std::sync::Arc;
use std::time::Duration;

use data_batch::{keys, names, TensorBatch};
use runtime_core::collective::{CollectiveGroup, LocalGroup};
use runtime_core::config::{ActorRolloutRefConfig, CriticConfig, RewardModelConfig};
use runtime_core::error::Result;
use runtime_core::memory::AcceleratorPool;
use runtime_core::topology::build_sequence_parallel_mesh;
use runtime_core::types::Role;
use sharding::{run_scoped, run_scoped_with, UlyssesShardingManager, WeightBridge};
use step_reward::VocabCodec;
use workers::{
    ActorComponents, ActorRolloutRefWorker, CriticComponents, CriticWorker, Metrics, ModuleState,
    PolicyModule, RefModule, RewardComponents, RewardWorker, RolloutEngine, ScoreHead,
    ScoreModule, ValueModule,
};

struct StubPolicy;

impl PolicyModule for StubPolicy {
    fn update(&mut self, _batch: &TensorBatch) -> Result<Metrics> {
        let mut metrics = Metrics::new();
        metrics.insert("actor/pg_loss".to_string(), 0.25);
        Ok(metrics)
    }

    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
        Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.05))
    }

    fn state(&self) -> Result<ModuleState> {
        Ok(ModuleState {
            model: vec![1],
            optimizer: vec![2],
        })
    }

    fn restore(&mut self, _state: &ModuleState) -> Result<()> {
        Ok(())
    }
}

struct StubRef;

impl RefModule for StubRef {
    fn log_probs(&mut self, batch: &TensorBatch) -> Result<Array2<f32>> {
        Ok(batch.get_int(names::INPUT_IDS)?.mapv(|v| v as f32 * -0.02))
    }
}

/// Appends a fixed four-token response to every prompt and assembles
/// the concatenated sequence tensors a real engine would return.
struct StubRollout;

impl RolloutEngine for StubRollout {
    fn generate(&mut self, prompts: &TensorBatch) -> Result<TensorBatch> {
        let prompt_ids = prompts.get_int(names::PROMPTS)?;
        let (rows, prompt_len) = prompt_ids.dim();
        let response_len = 4;
        let mut responses = Array2::<i64>::zeros((rows, response_len));
        for mut row in responses.rows_mut() {
            row.assign(&array![2i64, 3, 4, 1]);
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
        Ok(ModuleState::default())
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

    fn forward(&mut self, batch: &TensorBatch) -> Result<Array3<f32>> {
        let ids = batch.get_int(names::INPUT_IDS)?;
        let (rows, cols) = ids.dim();
        let mut grid = Array3::<f32>::zeros((rows, cols, 1));
        for ((i, t), v) in ids.indexed_iter() {
            grid[[i, t, 0]] = *v as f32 * 0.01;
        }
        Ok(grid)
    }
}

fn clone_rows(batch: &TensorBatch) -> Result<TensorBatch> {
    batch.select(&(0..batch.batch_size()).collect::<Vec<_>>())
}

#[tokio::test]
async fn test_full_step_flow() -> anyhow::Result<()> {
    let pool = AcceleratorPool::new(1 << 20);

    // 1. Actor / rollout / ref worker on a single rank
    let mut config = ActorRolloutRefConfig::default();
    config.actor.ppo_mini_batch_size = 2;
    let mut actor = ActorRolloutRefWorker::new(
        Role::ActorRolloutRef,
        config,
        Arc::clone(&pool),
        Arc::new(LocalGroup::solo()),
        None,
        Box::new(|_| {
            Ok(ActorComponents {
                policy: Some(Box::new(StubPolicy)),
                rollout: Some(Box::new(StubRollout)),
                reference: Some(Box::new(StubRef)),
                bridge: Some(Arc::new(StubBridge)),
                eos_token_id: 1,
                pad_token_id: 0,
                param_bytes: 1024,
                optimizer_bytes: 512,
                ref_param_bytes: 256,
            })
        }),
    )?;
    actor.init_model()?;

    // 2. Critic and reward workers sharing the pool
    let mut critic = CriticWorker::new(
        CriticConfig {
            ppo_mini_batch_size: 2,
            ..CriticConfig::default()
        },
        Arc::clone(&pool),
        Arc::new(LocalGroup::solo()),
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

    let codec = Arc::new(VocabCodec::new(
        vec!["<pad>".to_string(), "<eos>".to_string(), "x".to_string()],
        1,
        0,
    ));
    let mut reward = RewardWorker::new(
        RewardModelConfig::default(),
        codec,
        Arc::clone(&pool),
        Arc::new(LocalGroup::solo()),
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

    // 3. Generate responses from prompts
    let mut prompts = TensorBatch::new();
    prompts.insert(names::PROMPTS, array![[5i64, 6], [7, 8]])?;
    let generated = actor.generate_sequences(prompts).await?;
    assert_eq!(generated.batch_size(), 2);
    assert_eq!(generated.get_int(names::INPUT_IDS)?.dim(), (2, 6));
    assert_eq!(generated.meta_i64(keys::EOS_TOKEN_ID), Some(1));

    // 4. Log probs under the behavior, reference, and value models
    let log_prob_out = actor.compute_log_prob(clone_rows(&generated)?).await?;
    let old_log_probs = log_prob_out.get_float(names::OLD_LOG_PROBS)?.clone();
    assert_eq!(old_log_probs.dim(), (2, 4));
    assert!((old_log_probs[[0, 0]] - (-0.1)).abs() < 1e-6);

    let ref_out = actor.compute_ref_log_prob(clone_rows(&generated)?).await?;
    assert!((ref_out.get_float(names::REF_LOG_PROB)?[[0, 0]] - (-0.04)).abs() < 1e-6);

    let values_out = critic.compute_values(clone_rows(&generated)?).await?;
    assert_eq!(values_out.get_float(names::VALUES)?.dim(), (2, 4));
    assert!((values_out.get_float(names::VALUES)?[[0, 0]] - 1.0).abs() < 1e-6);

    // 5. Sequence-level reward lands on the final response token
    let score_out = reward.compute_rm_score(clone_rows(&generated)?).await?;
    let scores = score_out.get_float(names::RM_SCORES)?.clone();
    assert_eq!(scores.dim(), (2, 4));
    assert!((scores[[0, 3]] - 0.01).abs() < 1e-6);
    assert_eq!(scores[[0, 0]], 0.0);

    // 6. Updates consume the assembled training batch
    let mut train_batch = clone_rows(&generated)?;
    train_batch.union(log_prob_out)?;
    train_batch.union(ref_out)?;
    train_batch.union(values_out)?;
    train_batch.union(score_out)?;
    train_batch.set_meta(keys::GLOBAL_TOKEN_NUM, vec![6i64, 6]);

    let critic_metrics = critic.update_critic(clone_rows(&train_batch)?).await?;
    assert!(critic_metrics.contains_key("critic/vf_loss"));
    assert!(critic_metrics.contains_key("critic/lr"));
    assert!(critic_metrics.contains_key("perf/time_per_step_s"));

    let actor_metrics = actor.update_actor(train_batch).await?;
    assert!(actor_metrics.contains_key("actor/pg_loss"));
    assert!(actor_metrics.contains_key("actor/lr"));

    // 7. Checkpoint round trip
    let dir = tempfile::tempdir()?;
    actor.save_checkpoint(dir.path(), 7, true).await?;
    let shard = dir.path().join("global_step_7").join("actor_world_1_rank_0.ckpt");
    assert!(shard.exists());
    let resumed = actor.load_checkpoint(&dir.path().join("global_step_7")).await?;
    assert_eq!(resumed, 7);

    Ok(())
}

#[tokio::test]
async fn test_sequence_parallel_round_trip() -> anyhow::Result<()> {
    let world_size = 2;
    let groups = LocalGroup::new_group(world_size, Duration::from_secs(5))?;

    let mut handles = Vec::new();
    for (rank, group) in groups.into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let group: Arc<dyn CollectiveGroup> = Arc::new(group);
            let mesh = build_sequence_parallel_mesh(rank, world_size, world_size)?;
            let manager = UlyssesShardingManager::new(mesh, group)?;

            let mut batch = TensorBatch::new();
            batch.insert(
                names::INPUT_IDS,
                Array2::from_shape_fn((2, 6), |(i, t)| (i * 10 + t) as i64),
            )?;

            let (out, shard_start) = run_scoped_with(&manager, batch, move |batch| {
                async move {
                    // Each rank sees its own contiguous column block
                    let shard = batch.get_int(names::INPUT_IDS)?;
                    assert_eq!(shard.ncols(), 3);
                    let start = shard[[0, 0]];
                    let mut out = TensorBatch::new();
                    out.insert(names::OLD_LOG_PROBS, shard.mapv(|v| v as f32 * -0.1))?;
                    Ok((out, start))
                }
            })
            .await?;
            Ok::<_, runtime_core::error::Error>((rank, out, shard_start))
        }));
    }

    for handle in handles {
        let (rank, out, shard_start) = handle.await??;
        assert_eq!(shard_start, if rank == 0 { 0 } else { 3 });

        // The gather reassembles the full sequence on every rank
        let gathered = out.get_float(names::OLD_LOG_PROBS)?;
        assert_eq!(gathered.dim(), (2, 6));
        for i in 0..2 {
            for t in 0..6 {
                let expected = (i * 10 + t) as f32 * -0.1;
                assert!((gathered[[i, t]] - expected).abs() < 1e-6);
            }
        }
    }

    Ok(())
}

#[tokio::test]
async fn test_run_scoped_surfaces_op_error() -> anyhow::Result<()> {
    let manager = UlyssesShardingManager::new(None, Arc::new(LocalGroup::solo()))?;
    let mut batch = TensorBatch::new();
    batch.insert(names::INPUT_IDS, Array2::<i64>::ones((1, 4)))?;

    let err = run_scoped(&manager, batch, |_batch| async {
        Err(runtime_core::error::Error::Internal {
            message: "op failed".to_string(),
        })
    })
    .await
    .unwrap_err();
    assert!(matches!(err, runtime_core::error::Error::Internal { .. }));

    // The manager recovered and accepts the next scope
    let mut batch = TensorBatch::new();
    batch.insert(names::INPUT_IDS, Array2::<i64>::ones((1, 4)))?;
    let out = run_scoped(&manager, batch, |batch| async { Ok(batch) }).await?;
    assert_eq!(out.get_int(names::INPUT_IDS)?.dim(), (1, 4));

    Ok(())
}
