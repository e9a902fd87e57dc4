use crate::error::{InferenceError, Result};

/// Split `prompts` into contiguous groups of `batch_size`; the final group may be shorter.
pub fn batch_prompts<S>(prompts: &[S], batch_size: usize) -> Result<Vec<Vec<String>>>
where
    S: AsRef<str>,
{
    if batch_size == 0 {
        return Err(InferenceError::invalid("batch_size must be positive"));
    }

    Ok(prompts
        .chunks(batch_size)
        .map(|chunk| chunk.iter().map(|prompt| prompt.as_ref().to_owned()).collect())
        .collect())
}
