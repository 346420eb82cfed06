//! Process-reward pipeline: step segmentation, judge scoring, and credit
//! assignment
//!
//! Responses are segmented into reasoning steps at separator tokens, each step
//! is scored (by a classifier head, a local judge, or a remote judge over
//! HTTP), and the per-step scores are optionally reweighted by approximate
//! min-form credit assignment before they reach advantage computation.

pub mod codec;
pub mod credit;
pub mod judge;
pub mod prompt;
pub mod score;
pub mod scorer;
pub mod segment;

pub use codec::{decode_masked, separator_token_ids, TokenCodec, VocabCodec};
pub use credit::{apply_credit_assignment, min_form_weights};
pub use judge::{RemoteJudgeClient, StepJudge, DEGRADED_JUDGE_SCORE, JUDGE_USER_AGENT};
pub use prompt::{PromptTemplate, DEFAULT_JUDGE_PROMPT};
pub use score::{JudgeKind, ScoreExtractor};
pub use scorer::judge_all_steps;
pub use segment::{split_steps, StepSegments, SCORE_ID_SENTINEL};
