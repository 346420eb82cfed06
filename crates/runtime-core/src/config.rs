//! Worker configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Model source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model weights
    pub path: String,

    /// Tokenizer path, defaults to the model path when unset
    pub tokenizer_path: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "./model".to_string(),
            tokenizer_path: None,
        }
    }
}

/// Fully sharded data parallel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsdpConfig {
    /// Shard group size. Negative or >= world size selects full
    /// sharding over all ranks; any other value is rejected.
    pub fsdp_size: i64,

    /// Offload parameters to host memory between operations
    pub param_offload: bool,

    /// Offload optimizer state to host memory between operations
    pub optimizer_offload: bool,
}

impl Default for FsdpConfig {
    fn default() -> Self {
        Self {
            fsdp_size: -1,
            param_offload: false,
            optimizer_offload: false,
        }
    }
}

/// Optimizer and learning rate schedule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimConfig {
    /// Peak learning rate
    pub lr: f64,

    /// Total number of training steps for the schedule
    pub total_training_steps: u64,

    /// Fraction of total steps spent in linear warmup
    pub lr_warmup_steps_ratio: f64,

    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            lr: 1e-6,
            total_training_steps: 100,
            lr_warmup_steps_ratio: 0.0,
            weight_decay: 0.01,
        }
    }
}

/// Policy training settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Global mini-batch size in prompts, before rollout expansion
    pub ppo_mini_batch_size: usize,

    /// Global micro-batch size; divided across data-parallel ranks.
    /// Unset when dynamic micro-batching is used.
    pub ppo_micro_batch_size: Option<usize>,

    /// Number of optimizer epochs per mini-batch
    pub ppo_epochs: usize,

    /// Sequence parallel group size
    pub ulysses_sequence_parallel_size: usize,

    /// Rearrange micro-batches by token count instead of fixed size
    pub use_dynamic_bsz: bool,

    /// Per-device token budget for dynamic micro-batching
    pub ppo_max_token_len_per_gpu: usize,

    /// Optimizer settings
    pub optim: OptimConfig,

    /// Sharding and offload settings
    pub fsdp: FsdpConfig,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            ppo_mini_batch_size: 256,
            ppo_micro_batch_size: None,
            ppo_epochs: 1,
            ulysses_sequence_parallel_size: 1,
            use_dynamic_bsz: false,
            ppo_max_token_len_per_gpu: 16384,
            optim: OptimConfig::default(),
            fsdp: FsdpConfig::default(),
        }
    }
}

/// Generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Responses generated per prompt
    pub n: usize,

    /// Sampling temperature, forwarded to log-prob recomputation
    pub temperature: f64,

    /// Global micro-batch size for log-prob recomputation
    pub log_prob_micro_batch_size: Option<usize>,

    /// Per-device token budget for dynamic log-prob micro-batching
    pub log_prob_max_token_len_per_gpu: usize,

    /// Rearrange log-prob micro-batches by token count
    pub log_prob_use_dynamic_bsz: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            n: 1,
            temperature: 1.0,
            log_prob_micro_batch_size: None,
            log_prob_max_token_len_per_gpu: 16384,
            log_prob_use_dynamic_bsz: false,
        }
    }
}

/// Frozen reference policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefConfig {
    /// Global micro-batch size for reference log-prob computation
    pub log_prob_micro_batch_size: Option<usize>,

    /// Per-device token budget for dynamic micro-batching
    pub log_prob_max_token_len_per_gpu: usize,

    /// Rearrange micro-batches by token count
    pub log_prob_use_dynamic_bsz: bool,

    /// Sharding and offload settings
    pub fsdp: FsdpConfig,
}

impl Default for RefConfig {
    fn default() -> Self {
        Self {
            log_prob_micro_batch_size: None,
            log_prob_max_token_len_per_gpu: 16384,
            log_prob_use_dynamic_bsz: false,
            fsdp: FsdpConfig::default(),
        }
    }
}

/// Configuration for the combined actor / rollout / reference worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorRolloutRefConfig {
    /// Model source
    pub model: ModelConfig,

    /// Policy training settings
    pub actor: ActorConfig,

    /// Generation settings
    pub rollout: RolloutConfig,

    /// Reference policy settings
    #[serde(rename = "ref")]
    pub reference: RefConfig,
}

/// Configuration for the critic worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    /// Model source
    pub model: ModelConfig,

    /// Optimizer settings
    pub optim: OptimConfig,

    /// Sharding and offload settings
    pub fsdp: FsdpConfig,

    /// Global mini-batch size in prompts, before rollout expansion
    pub ppo_mini_batch_size: usize,

    /// Global micro-batch size for value updates
    pub ppo_micro_batch_size: Option<usize>,

    /// Global micro-batch size for value inference
    pub forward_micro_batch_size: Option<usize>,

    /// Number of optimizer epochs per mini-batch
    pub ppo_epochs: usize,

    /// Sequence parallel group size
    pub ulysses_sequence_parallel_size: usize,

    /// Rearrange micro-batches by token count instead of fixed size
    pub use_dynamic_bsz: bool,

    /// Per-device token budget for value updates
    pub ppo_max_token_len_per_gpu: usize,

    /// Per-device token budget for value inference
    pub forward_max_token_len_per_gpu: usize,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            optim: OptimConfig::default(),
            fsdp: FsdpConfig::default(),
            ppo_mini_batch_size: 256,
            ppo_micro_batch_size: None,
            forward_micro_batch_size: None,
            ppo_epochs: 1,
            ulysses_sequence_parallel_size: 1,
            use_dynamic_bsz: false,
            ppo_max_token_len_per_gpu: 32768,
            forward_max_token_len_per_gpu: 32768,
        }
    }
}

/// Scoring backend selection for the reward worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardBackend {
    /// Sequence classifier producing one scalar per response
    Classifier,

    /// Two-class token classifier producing per-step scores
    ProcessClassifier,

    /// Colocated generative judge model
    LocalJudge,

    /// Remote judge service over HTTP
    RemoteJudge,
}

/// Per-step credit assignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditConfig {
    /// Reweight step scores by a min-focused softmax over each sample
    pub enabled: bool,

    /// Softmax temperature; lower concentrates weight on the worst step
    pub temperature: f64,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            temperature: 0.1,
        }
    }
}

/// Retry configuration for remote requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts
    pub max_retries: u32,

    /// Delay before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before the attempt after `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Judge model settings, used by the local and remote judge backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Base URL of the judge service (remote backend only)
    pub base_url: String,

    /// Model name passed through to the judge service
    pub model_name: String,

    /// Prompt template; `{problem}`, `{previous_steps}` and
    /// `{current_step}` are substituted per step. Unset selects the
    /// built-in template.
    pub prompt_template: Option<String>,

    /// Maximum tokens the judge may generate per evaluation
    pub max_tokens: usize,

    /// Judge sampling temperature
    pub temperature: f64,

    /// Nucleus sampling threshold
    pub top_p: f64,

    /// Top-k sampling cutoff
    pub top_k: i64,

    /// Repetition penalty
    pub repetition_penalty: f64,

    /// Frequency penalty
    pub frequency_penalty: f64,

    /// Stop sequences for judge generation
    pub stop: Vec<String>,

    /// Per-request timeout
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Retry behavior for failed requests
    pub retry: RetryConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            model_name: "judge".to_string(),
            prompt_template: None,
            max_tokens: 2048,
            temperature: 0.6,
            top_p: 0.95,
            top_k: 20,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            stop: Vec::new(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Configuration for the reward worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardModelConfig {
    /// Scoring backend
    pub backend: RewardBackend,

    /// Model source
    pub model: ModelConfig,

    /// Sharding and offload settings
    pub fsdp: FsdpConfig,

    /// Global micro-batch size for scoring
    pub micro_batch_size: Option<usize>,

    /// Rearrange micro-batches by token count
    pub use_dynamic_bsz: bool,

    /// Per-device token budget for dynamic micro-batching
    pub forward_max_token_len_per_gpu: usize,

    /// Sequence parallel group size
    pub ulysses_sequence_parallel_size: usize,

    /// Step separator; any token whose text ends with this string
    /// closes a reasoning step
    pub split_step_char: String,

    /// Per-step credit assignment settings
    pub credit: CreditConfig,

    /// Judge settings, required by the judge backends
    pub judge: Option<JudgeConfig>,
}

impl Default for RewardModelConfig {
    fn default() -> Self {
        Self {
            backend: RewardBackend::Classifier,
            model: ModelConfig::default(),
            fsdp: FsdpConfig::default(),
            micro_batch_size: None,
            use_dynamic_bsz: false,
            forward_max_token_len_per_gpu: 32768,
            ulysses_sequence_parallel_size: 1,
            split_step_char: "\n\n".to_string(),
            credit: CreditConfig::default(),
            judge: None,
        }
    }
}

impl RewardModelConfig {
    /// Checks that the selected backend has the settings it needs
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            RewardBackend::LocalJudge | RewardBackend::RemoteJudge if self.judge.is_none() => {
                Err(Error::InvalidConfig {
                    message: format!("{:?} backend requires a judge section", self.backend),
                })
            }
            _ => {
                if self.split_step_char.is_empty() {
                    return Err(Error::InvalidConfig {
                        message: "split_step_char must not be empty".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Size of the data-parallel group given the world and sequence
/// parallel sizes
pub fn dp_size(world_size: usize, sequence_parallel_size: usize) -> Result<usize> {
    if sequence_parallel_size == 0 {
        return Err(Error::InvalidConfig {
            message: "ulysses_sequence_parallel_size must be at least 1".to_string(),
        });
    }
    if world_size % sequence_parallel_size != 0 {
        return Err(Error::BatchSizeIndivisible {
            name: "world_size".to_string(),
            value: world_size,
            divisor: sequence_parallel_size,
        });
    }
    Ok(world_size / sequence_parallel_size)
}

/// Divides a global micro-batch size evenly across data-parallel ranks
pub fn normalize_micro_batch(
    name: &str,
    global: Option<usize>,
    world_size: usize,
    sequence_parallel_size: usize,
) -> Result<Option<usize>> {
    let dp = dp_size(world_size, sequence_parallel_size)?;
    match global {
        None => Ok(None),
        Some(size) => {
            if size == 0 || size % dp != 0 {
                return Err(Error::BatchSizeIndivisible {
                    name: name.to_string(),
                    value: size,
                    divisor: dp,
                });
            }
            Ok(Some(size / dp))
        }
    }
}

/// Batch sizes after division across the data-parallel group.
///
/// Derived from the configured global sizes; the configuration itself
/// is never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedBatchSizes {
    /// Per-rank mini-batch size in samples, after rollout expansion
    pub mini_batch_size: usize,

    /// Per-device micro-batch size, None under dynamic micro-batching
    pub micro_batch_size_per_device: Option<usize>,
}

impl NormalizedBatchSizes {
    /// Derives the actor's per-rank batch sizes.
    ///
    /// The global mini-batch is first expanded by the number of rollout
    /// responses per prompt, then divided across data-parallel ranks.
    pub fn for_actor(
        actor: &ActorConfig,
        rollout: &RolloutConfig,
        world_size: usize,
    ) -> Result<Self> {
        let dp = dp_size(world_size, actor.ulysses_sequence_parallel_size)?;
        let expanded = actor.ppo_mini_batch_size * rollout.n;
        Self::derive("actor.ppo_mini_batch_size", expanded, actor.ppo_micro_batch_size, dp)
    }

    /// Derives the critic's per-rank batch sizes
    pub fn for_critic(critic: &CriticConfig, world_size: usize) -> Result<Self> {
        let dp = dp_size(world_size, critic.ulysses_sequence_parallel_size)?;
        Self::derive(
            "critic.ppo_mini_batch_size",
            critic.ppo_mini_batch_size,
            critic.ppo_micro_batch_size,
            dp,
        )
    }

    fn derive(name: &str, global_mini: usize, global_micro: Option<usize>, dp: usize) -> Result<Self> {
        if global_mini == 0 || global_mini % dp != 0 {
            return Err(Error::BatchSizeIndivisible {
                name: name.to_string(),
                value: global_mini,
                divisor: dp,
            });
        }
        let mini = global_mini / dp;

        let micro = match global_micro {
            None => None,
            Some(size) => {
                if size == 0 || size % dp != 0 {
                    return Err(Error::BatchSizeIndivisible {
                        name: format!("{}_micro", name),
                        value: size,
                        divisor: dp,
                    });
                }
                let per_device = size / dp;
                if mini % per_device != 0 {
                    return Err(Error::BatchSizeIndivisible {
                        name: name.to_string(),
                        value: mini,
                        divisor: per_device,
                    });
                }
                Some(per_device)
            }
        };

        Ok(Self {
            mini_batch_size: mini,
            micro_batch_size_per_device: micro,
        })
    }

    /// Number of micro-batches per mini-batch under fixed-size
    /// micro-batching
    pub fn micro_batches_per_mini(&self) -> Option<usize> {
        self.micro_batch_size_per_device
            .map(|micro| self.mini_batch_size / micro)
    }
}

/// Duration serialization helper, stored as integer milliseconds
mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
