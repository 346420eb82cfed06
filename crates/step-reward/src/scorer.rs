//! Judge-driven scoring across a batch of segmented responses
//!
//! Steps within a sample are judged strictly in position order because each
//! judge prompt embeds the text of all earlier steps. Samples are independent
//! of each other; they are walked sequentially here to keep judge load
//! predictable.

use ndarray::Array2;
use runtime_core::{Error, Result, TokenId};
use tracing::debug;

use crate::codec::{decode_masked, TokenCodec};
use crate::judge::StepJudge;
use crate::segment::StepSegments;

/// Score every step of every response through `judge`.
///
/// `prompts` and `prompt_mask` cover the prompt region only; the decoded
/// problem text excludes padding. Step text runs from the previous boundary
/// (exclusive) to the current one (exclusive), so separator tokens never
/// appear in judge prompts. Returns a `(batch, response_len)` grid holding
/// one score at each step boundary and zero elsewhere.
pub async fn judge_all_steps(
    judge: &dyn StepJudge,
    codec: &dyn TokenCodec,
    prompts: &Array2<TokenId>,
    prompt_mask: &Array2<i64>,
    responses: &Array2<TokenId>,
    segments: &StepSegments,
) -> Result<Array2<f32>> {
    let batch = responses.nrows();
    if prompts.nrows() != batch || segments.batch_size() != batch {
        return Err(Error::ShapeMismatch {
            name: "prompts".to_string(),
            message: format!(
                "prompts rows {} / segments rows {} / responses rows {}",
                prompts.nrows(),
                segments.batch_size(),
                batch
            ),
        });
    }
    if prompt_mask.dim() != prompts.dim() {
        return Err(Error::ShapeMismatch {
            name: "prompt_mask".to_string(),
            message: format!(
                "mask shape {:?} does not match prompts shape {:?}",
                prompt_mask.dim(),
                prompts.dim()
            ),
        });
    }

    let mut scores = Array2::zeros((batch, responses.ncols()));
    for i in 0..batch {
        let positions = segments.step_positions(i);
        if positions.is_empty() {
            continue;
        }

        let prompt_row = prompts.row(i).to_vec();
        let mask_row = prompt_mask.row(i).to_vec();
        let problem = decode_masked(codec, &prompt_row, &mask_row);
        let response_row = responses.row(i).to_vec();

        let mut previous: Vec<String> = Vec::with_capacity(positions.len());
        let mut start = 0usize;
        for &end in &positions {
            let step_text = codec.decode(&response_row[start..end]);
            let context = previous.join("\n");
            scores[[i, end]] = judge.score(&problem, &context, &step_text).await;
            previous.push(step_text);
            start = end + 1;
        }
        debug!(sample = i, steps = positions.len(), "judged sample steps");
    }
    Ok(scores)
}
