use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, activation};

use crate::error::{InferenceError, Result};

/// Next-token cross entropy: logits at `t` predict `targets` at `t + 1`.
///
/// Targets whose attention mask is zero (padding) contribute nothing. The mean
/// is taken over the remaining targets.
pub fn language_model_loss<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    attention_mask: Tensor<B, 2, Int>,
) -> Result<Tensor<B, 1>> {
    let [batch, time, vocab] = logits.dims();
    if targets.dims() != [batch, time] || attention_mask.dims() != [batch, time] {
        return Err(InferenceError::invalid(format!(
            "labels {:?} and mask {:?} must match logits [{batch}, {time}]",
            targets.dims(),
            attention_mask.dims()
        )));
    }
    if time < 2 {
        return Err(InferenceError::invalid(
            "next-token loss needs at least two positions",
        ));
    }

    let predictions = logits.slice([0..batch, 0..time - 1, 0..vocab]);
    let next = targets.slice([0..batch, 1..time]).unsqueeze_dim::<3>(2);
    let weights = attention_mask.slice([0..batch, 1..time]).float();

    let log_probs = activation::log_softmax(predictions, 2);
    let picked = log_probs.gather(2, next).reshape([batch, time - 1]);

    let total = (picked * weights.clone()).sum().neg();
    let count = weights.sum().clamp_min(1.0);
    Ok(total.div(count))
}
