#![recursion_limit = "512"]

pub mod batching;
pub mod comparison;
pub mod config;
pub mod distributed;
pub mod error;
pub mod generation;
pub mod model;
pub mod runner;
pub mod tokenizer;

pub use batching::batch_prompts;
pub use comparison::{
    ComparisonReport, ComparisonSettings, HostTensor, allclose, build_variant, compare_models,
    comparison_batch,
};
pub use config::{
    ComparisonSection, DistributedSection, GenerationSection, ModelSection, RunConfig,
    load_run_config, load_run_config_over_base,
};
pub use distributed::{ProcessState, Shard, launch, split_between_processes, truncate_gathered};
pub use error::InferenceError;
pub use generation::{
    GenerateOptions, SamplingOptions, autoregressive_generate, generate_completions,
    sample_next_token,
};
pub use model::{
    KernelSelection, LoadReport, ModelOracle, ModelOutput, ModelVariant, StateDict,
    TransformerConfig, TransformerLm, language_model_loss, remap_layer_norm_keys,
};
pub use runner::{RankSummary, RunOutcome, run_generation, run_generation_with};
pub use tokenizer::{PadOptions, PaddedTokenizer, PaddingSide, TokenizedBatch, TokenizerConfig};
