//! Approximate min-form credit assignment
//!
//! Raw step scores reward every step independently, but a solution is only as
//! good as its weakest step. A hard minimum over steps is non-differentiable
//! and noisy under sampling, so scores are reweighted by a softmin instead:
//! `w = softmax(-s / temperature)` over the valid boundary positions of each
//! sample, then `s <- s * w`. Low-scoring steps keep most of their magnitude
//! while confident steps are damped.

use ndarray::Array2;
use runtime_core::{Error, Result};

/// Softmin weights over the masked positions of each row.
///
/// Unmasked positions get weight zero. Rows with no masked positions are left
/// all-zero. Weights across the masked positions of a row sum to one.
pub fn min_form_weights(
    scores: &Array2<f32>,
    reward_mask: &Array2<bool>,
    temperature: f32,
) -> Result<Array2<f32>> {
    if scores.dim() != reward_mask.dim() {
        return Err(Error::ShapeMismatch {
            name: "reward_mask".to_string(),
            message: format!(
                "mask shape {:?} does not match scores shape {:?}",
                reward_mask.dim(),
                scores.dim()
            ),
        });
    }
    if temperature <= 0.0 {
        return Err(Error::InvalidConfig {
            message: format!("credit temperature must be positive, got {temperature}"),
        });
    }

    let (rows, cols) = scores.dim();
    let mut weights = Array2::zeros((rows, cols));

    for i in 0..rows {
        let masked: Vec<usize> = (0..cols).filter(|&j| reward_mask[[i, j]]).collect();
        if masked.is_empty() {
            continue;
        }

        // Softmax over -s/t, shifted by the row maximum for stability.
        let logits: Vec<f32> = masked
            .iter()
            .map(|&j| -scores[[i, j]] / temperature)
            .collect();
        let peak = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - peak).exp()).collect();
        let total: f32 = exps.iter().sum();

        for (&j, e) in masked.iter().zip(exps.iter()) {
            weights[[i, j]] = e / total;
        }
    }

    Ok(weights)
}

/// Scale each masked score by its softmin weight in place.
pub fn apply_credit_assignment(
    scores: &mut Array2<f32>,
    reward_mask: &Array2<bool>,
    temperature: f32,
) -> Result<()> {
    let weights = min_form_weights(scores, reward_mask, temperature)?;
    for ((i, j), w) in weights.indexed_iter() {
        if reward_mask[[i, j]] {
            scores[[i, j]] *= w;
        }
    }
    Ok(())
}
