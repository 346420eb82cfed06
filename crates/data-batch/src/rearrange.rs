//! Token-budget micro-batch rearrangement
//!
//! Fixed-size micro-batching wastes accelerator time when sequence
//! lengths are skewed: a micro-batch of short samples underfills the
//! device while one long sample dominates another. Rearrangement packs
//! samples into variable-count micro-batches so that every batch stays
//! under a per-device token budget, then restores the original sample
//! order through a reverse index after the outputs are concatenated.

use ndarray::Array2;
use tracing::debug;

use runtime_core::error::{Error, Result};

use crate::batch::TensorBatch;

/// Number of attended tokens per sample, from an attention mask
pub fn effective_lengths(mask: &Array2<i64>) -> Vec<usize> {
    mask.rows()
        .into_iter()
        .map(|row| row.iter().filter(|&&v| v != 0).count())
        .collect()
}

/// Packs sample indices into micro-batches whose token sums stay
/// within `max_token_len`.
///
/// Samples are placed longest-first into the first batch with room,
/// which keeps the batch count near the lower bound while remaining
/// deterministic. Every index appears in exactly one group. A single
/// sample longer than the budget cannot be placed and is an error.
pub fn rearrange_micro_batches(
    lengths: &[usize],
    max_token_len: usize,
) -> Result<Vec<Vec<usize>>> {
    if lengths.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(&longest) = lengths.iter().max() {
        if longest > max_token_len {
            return Err(Error::TokenBudgetExceeded {
                sample_tokens: longest,
                budget: max_token_len,
            });
        }
    }

    let mut order: Vec<usize> = (0..lengths.len()).collect();
    // Longest first; ties keep original order
    order.sort_by_key(|&i| (std::cmp::Reverse(lengths[i]), i));

    let mut loads: Vec<usize> = Vec::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for idx in order {
        let len = lengths[idx];
        match loads.iter().position(|&load| load + len <= max_token_len) {
            Some(bin) => {
                loads[bin] += len;
                groups[bin].push(idx);
            }
            None => {
                loads.push(len);
                groups.push(vec![idx]);
            }
        }
    }

    debug!(
        samples = lengths.len(),
        micro_batches = groups.len(),
        budget = max_token_len,
        "Rearranged micro-batches"
    );
    Ok(groups)
}

/// Original sample index of each row in the concatenated outputs
pub fn concat_order(groups: &[Vec<usize>]) -> Vec<usize> {
    groups.iter().flatten().copied().collect()
}

/// Permutation that restores original order when applied to the
/// concatenated outputs with [`TensorBatch::select`]
pub fn reverse_index(groups: &[Vec<usize>]) -> Vec<usize> {
    let order = concat_order(groups);
    let mut reverse = vec![0usize; order.len()];
    for (pos, &original) in order.iter().enumerate() {
        reverse[original] = pos;
    }
    reverse
}

/// Splits a batch into token-budget micro-batches using the named
/// attention mask, returning the micro-batches and the reverse index.
pub fn split_by_token_budget(
    batch: &TensorBatch,
    mask_name: &str,
    max_token_len: usize,
) -> Result<(Vec<TensorBatch>, Vec<usize>)> {
    let mask = batch.get_int(mask_name)?;
    let lengths = effective_lengths(mask);
    let groups = rearrange_micro_batches(&lengths, max_token_len)?;
    let micro_batches = groups
        .iter()
        .map(|group| batch.select(group))
        .collect::<Result<Vec<_>>>()?;
    Ok((micro_batches, reverse_index(&groups)))
}
