use burn::tensor::backend::Backend;
use tracing::{debug, info};

use crate::batching::batch_prompts;
use crate::config::RunConfig;
use crate::distributed::{launch, truncate_gathered};
use crate::error::{InferenceError, Result};
use crate::generation::{GenerateOptions, generate_completions};
use crate::model::{ModelOracle, StateDict, TransformerLm};
use crate::tokenizer::{PadOptions, PaddedTokenizer, PaddingSide, TokenizedBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankSummary {
    pub rank: usize,
    pub batches: usize,
    pub padded_batches: usize,
    pub completions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub completions: Vec<String>,
    pub ranks: Vec<RankSummary>,
}

struct RankResult {
    summary: RankSummary,
    completions: Option<Vec<String>>,
}

/// Batch, shard, generate and gather with [`TransformerLm`] workers built from
/// `weights`.
pub fn run_generation<B, D>(
    config: &RunConfig,
    tokenizer: &PaddedTokenizer,
    weights: &StateDict,
    device_for_rank: D,
) -> Result<RunOutcome>
where
    B: Backend,
    D: Fn(usize) -> B::Device,
{
    let model_config = config.model.transformer_config(tokenizer.tokenizer().len());
    model_config.validate()?;

    run_generation_with::<B, _, _, _>(config, tokenizer, device_for_rank, |device, _rank| {
        TransformerLm::<B>::from_state_dict(&model_config, weights.clone(), device)
    })
}

pub fn run_generation_with<B, M, F, D>(
    config: &RunConfig,
    tokenizer: &PaddedTokenizer,
    device_for_rank: D,
    build_oracle: F,
) -> Result<RunOutcome>
where
    B: Backend,
    M: ModelOracle<B>,
    F: Fn(&B::Device, usize) -> Result<M> + Sync,
    D: Fn(usize) -> B::Device,
{
    let generation = &config.generation;
    let distributed = &config.distributed;
    if distributed.num_processes == 0 {
        return Err(InferenceError::Configuration(
            "num_processes must be positive".into(),
        ));
    }
    if generation.pad_to_multiple_of == 0 {
        return Err(InferenceError::Configuration(
            "pad_to_multiple_of must be positive".into(),
        ));
    }

    let prompt_count = generation.prompts.len();
    let options = generation.options(tokenizer, config.model.seed);

    let results = launch::<B, _, _, _>(distributed.num_processes, device_for_rank, |state| {
        let rank = state.rank();
        let batches = batch_prompts(&generation.prompts, generation.batch_size)?;
        let tokenized = tokenize_for_generation(tokenizer, &batches, generation.pad_to_multiple_of)?;

        let shard = state.split_between_processes(&tokenized, distributed.apply_padding)?;
        if shard.has_padding() {
            debug!(rank, padding = shard.padding, "shard padded with duplicate batches");
        }

        let oracle = build_oracle(state.device(), rank)?;
        let mut local = Vec::new();
        for (index, batch) in shard.items.iter().enumerate() {
            info!(
                rank,
                batch = index + 1,
                of = shard.len(),
                rows = batch.rows(),
                seq_len = batch.seq_len(),
                "generating completions"
            );
            let options = GenerateOptions {
                seed: batch_seed(options.seed, rank, index),
                ..options.clone()
            };
            local.extend(generate_completions::<B, M>(
                &oracle,
                tokenizer,
                batch,
                state.device(),
                &options,
            )?);
        }

        let summary = RankSummary {
            rank,
            batches: shard.len(),
            padded_batches: shard.padding,
            completions: local.len(),
        };
        let gathered = state.gather_object(local)?;
        debug!(rank, gathered = gathered.len(), "gather complete");

        let completions = state
            .is_main_process()
            .then(|| truncate_gathered(gathered, prompt_count));
        Ok(RankResult {
            summary,
            completions,
        })
    })?;

    let mut completions = None;
    let mut ranks = Vec::with_capacity(results.len());
    for result in results {
        if result.completions.is_some() {
            completions = result.completions;
        }
        ranks.push(result.summary);
    }

    let completions = completions
        .ok_or_else(|| InferenceError::coordination("main process returned no completions"))?;
    Ok(RunOutcome { completions, ranks })
}

/// Sampling stream for one batch; rank 0's first batch keeps the configured seed.
fn batch_seed(seed: u64, rank: usize, batch: usize) -> u64 {
    seed.wrapping_add((rank as u64) << 32).wrapping_add(batch as u64)
}

/// Tokenize each batch left-padded for generation; the shared side is restored afterwards.
pub fn tokenize_for_generation(
    tokenizer: &PaddedTokenizer,
    batches: &[Vec<String>],
    pad_to_multiple_of: usize,
) -> Result<Vec<TokenizedBatch>> {
    let guard = tokenizer.with_padding_side(PaddingSide::Left);
    batches
        .iter()
        .map(|batch| guard.encode_batch(batch, PadOptions::aligned(pad_to_multiple_of)))
        .collect()
}
