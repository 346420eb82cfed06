//! Response segmentation into reasoning steps
//!
//! A response is split at step-boundary tokens (see [`crate::codec`]), and one
//! implicit boundary is always placed at the last valid response token so the
//! trailing text forms a final step even without a closing separator. Scoring
//! functions write one scalar per boundary position; everything downstream
//! (credit assignment, advantage computation) keys off the masks built here.

use std::collections::HashSet;

use ndarray::Array2;
use runtime_core::{Error, Result, TokenId};

/// Fill value for unused entries of the per-sample step-position table.
pub const SCORE_ID_SENTINEL: i64 = -1;

/// Step-boundary layout for one batch of responses.
///
/// Step counts vary per sample, so boundary positions are stored as a padded
/// `(batch, max_steps)` table with [`SCORE_ID_SENTINEL`] in unused slots and a
/// matching validity mask. `reward_mask` carries the same information projected
/// onto the `(batch, response_len)` token grid.
#[derive(Debug, Clone)]
pub struct StepSegments {
    score_ids: Array2<i64>,
    score_mask: Array2<bool>,
    reward_mask: Array2<bool>,
    num_steps: Vec<usize>,
}

impl StepSegments {
    pub fn batch_size(&self) -> usize {
        self.num_steps.len()
    }

    /// Width of the padded step-position table
    pub fn max_steps(&self) -> usize {
        self.score_ids.ncols()
    }

    /// Valid step count per sample
    pub fn num_steps(&self) -> &[usize] {
        &self.num_steps
    }

    /// Padded per-sample boundary positions, sentinel-filled past `num_steps`
    pub fn score_ids(&self) -> &Array2<i64> {
        &self.score_ids
    }

    /// Validity mask over [`Self::score_ids`]
    pub fn score_mask(&self) -> &Array2<bool> {
        &self.score_mask
    }

    /// Boolean `(batch, response_len)` grid, true exactly at boundary positions
    pub fn reward_mask(&self) -> &Array2<bool> {
        &self.reward_mask
    }

    /// Boundary positions for one sample in increasing order.
    pub fn step_positions(&self, sample: usize) -> Vec<usize> {
        (0..self.num_steps[sample])
            .map(|j| self.score_ids[[sample, j]] as usize)
            .collect()
    }
}

/// Locate step boundaries for every response in a batch.
///
/// `attention_mask` covers the full prompt+response sequence; its last
/// `responses.ncols()` columns are taken as the response validity mask.
/// Boundaries are the valid positions holding a separator token, plus the last
/// valid position when no separator already sits there. A sample whose
/// response mask is entirely zero yields zero steps.
pub fn split_steps(
    responses: &Array2<TokenId>,
    attention_mask: &Array2<i64>,
    separators: &HashSet<TokenId>,
) -> Result<StepSegments> {
    let batch = responses.nrows();
    let response_len = responses.ncols();

    if attention_mask.nrows() != batch {
        return Err(Error::ShapeMismatch {
            name: "attention_mask".to_string(),
            message: format!(
                "mask has {} rows but responses has {}",
                attention_mask.nrows(),
                batch
            ),
        });
    }
    if attention_mask.ncols() < response_len {
        return Err(Error::ShapeMismatch {
            name: "attention_mask".to_string(),
            message: format!(
                "mask width {} shorter than response width {}",
                attention_mask.ncols(),
                response_len
            ),
        });
    }

    let mask_offset = attention_mask.ncols() - response_len;
    let mut positions: Vec<Vec<usize>> = Vec::with_capacity(batch);

    for i in 0..batch {
        let valid = |p: usize| attention_mask[[i, mask_offset + p]] != 0;

        let last_valid = (0..response_len).rev().find(|&p| valid(p));
        let mut row = Vec::new();
        if let Some(last) = last_valid {
            for p in 0..response_len {
                if valid(p) && separators.contains(&responses[[i, p]]) {
                    row.push(p);
                }
            }
            // The implicit final boundary; skipped when a separator token
            // already terminates the response.
            if row.last() != Some(&last) {
                row.push(last);
            }
        }
        positions.push(row);
    }

    let max_steps = positions.iter().map(Vec::len).max().unwrap_or(0);
    let mut score_ids = Array2::from_elem((batch, max_steps), SCORE_ID_SENTINEL);
    let mut score_mask = Array2::from_elem((batch, max_steps), false);
    let mut reward_mask = Array2::from_elem((batch, response_len), false);
    let mut num_steps = Vec::with_capacity(batch);

    for (i, row) in positions.iter().enumerate() {
        for (j, &p) in row.iter().enumerate() {
            score_ids[[i, j]] = p as i64;
            score_mask[[i, j]] = true;
            reward_mask[[i, p]] = true;
        }
        num_steps.push(row.len());
    }

    Ok(StepSegments {
        score_ids,
        score_mask,
        reward_mask,
        num_steps,
    })
}
