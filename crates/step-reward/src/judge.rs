//! Remote judge client
//!
//! Speaks the chat-completion wire shape (`POST /v1/chat/completions`) against
//! a configured judge server. Transport failures and non-success statuses are
//! retried with exponential backoff; once retries are exhausted the step is
//! given a fixed degraded score instead of failing the surrounding training
//! step. Reachability is verified at construction so a misconfigured endpoint
//! fails fast rather than degrading every score.

use async_trait::async_trait;
use runtime_core::{Error, JudgeConfig, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::prompt::PromptTemplate;
use crate::score::{JudgeKind, ScoreExtractor};

/// Identifies this client to judge servers
pub const JUDGE_USER_AGENT: &str = "RemoteLLMJudgeWorker/1.0";

/// Score substituted when the judge cannot be reached after all retries
pub const DEGRADED_JUDGE_SCORE: f32 = 0.5;

/// Scores a single reasoning step given its surrounding context.
///
/// Implementations must degrade internally: `score` never fails, because a
/// lost judge evaluation must not abort the training step it belongs to.
#[async_trait]
pub trait StepJudge: Send + Sync {
    async fn score(&self, problem: &str, previous_steps: &str, current_step: &str) -> f32;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f64,
    top_p: f64,
    top_k: i64,
    repetition_penalty: f64,
    frequency_penalty: f64,
    stop: &'a [String],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: String,
}

/// HTTP client for a remote judge endpoint.
#[derive(Debug)]
pub struct RemoteJudgeClient {
    config: JudgeConfig,
    template: PromptTemplate,
    extractor: ScoreExtractor,
    client: reqwest::Client,
}

impl RemoteJudgeClient {
    /// Build the client and verify the endpoint is reachable.
    ///
    /// Tries `GET /health` first and falls back to `GET /v1/models` for
    /// servers without a health route. Neither responding means the endpoint
    /// is misconfigured and construction fails with
    /// [`Error::JudgeUnreachable`].
    pub async fn connect(config: JudgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(JUDGE_USER_AGENT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        let template = PromptTemplate::from_config(config.prompt_template.as_deref());
        let judge = Self {
            client,
            template,
            extractor: ScoreExtractor::new(),
            config,
        };
        judge.check_health().await?;
        info!(
            url = %judge.config.base_url,
            model = %judge.config.model_name,
            "remote judge reachable"
        );
        Ok(judge)
    }

    async fn check_health(&self) -> Result<()> {
        let base = self.config.base_url.trim_end_matches('/');

        let health = format!("{base}/health");
        match self.client.get(&health).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => debug!(
                status = %response.status(),
                "health endpoint unavailable, trying model listing"
            ),
            Err(e) => debug!(error = %e, "health endpoint unavailable, trying model listing"),
        }

        let models = format!("{base}/v1/models");
        match self.client.get(&models).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(Error::JudgeUnreachable {
                url: self.config.base_url.clone(),
                reason: format!("GET {models} returned {}", response.status()),
            }),
            Err(e) => Err(Error::JudgeUnreachable {
                url: self.config.base_url.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Send one evaluation prompt, retrying per the configured policy.
    ///
    /// Returns the judge's raw response text; parsing is left to the caller
    /// because parse failures and transport failures score differently.
    pub async fn request_evaluation(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = ChatCompletionRequest {
            model: &self.config.model_name,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            top_k: self.config.top_k,
            repetition_penalty: self.config.repetition_penalty,
            frequency_penalty: self.config.frequency_penalty,
            stop: &self.config.stop,
            stream: false,
        };

        let attempts = self.config.retry.max_retries.max(1);
        let mut last_failure = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.delay_for_attempt(attempt - 1)).await;
            }
            match self.try_request(&url, &request).await {
                Ok(content) => return Ok(content),
                Err(reason) => {
                    warn!(
                        attempt = attempt + 1,
                        attempts,
                        reason = %reason,
                        "judge request failed"
                    );
                    last_failure = reason;
                }
            }
        }
        Err(Error::Http(format!(
            "judge unavailable after {attempts} attempts: {last_failure}"
        )))
    }

    async fn try_request(
        &self,
        url: &str,
        request: &ChatCompletionRequest<'_>,
    ) -> std::result::Result<String, String> {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| format!("transport: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| format!("invalid response body: {e}"))?;
        match body.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content),
            None => Err("response contained no choices".to_string()),
        }
    }
}

#[async_trait]
impl StepJudge for RemoteJudgeClient {
    async fn score(&self, problem: &str, previous_steps: &str, current_step: &str) -> f32 {
        let prompt = self.template.render(problem, previous_steps, current_step);
        match self.request_evaluation(&prompt).await {
            Ok(text) => self.extractor.extract(&text, JudgeKind::Remote),
            Err(e) => {
                error!(error = %e, "remote judge exhausted retries, degrading step score");
                DEGRADED_JUDGE_SCORE
            }
        }
    }
}
