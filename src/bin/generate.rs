#![recursion_limit = "512"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::tensor::backend::Backend;
use burn_batched_inference::{
    ModelOracle, RunConfig, TransformerLm, load_run_config_over_base, run_generation,
};
use burn_ndarray::NdArray;
use burn_wgpu::{Wgpu, WgpuDevice};
use tracing::info;

#[cfg(feature = "cuda")]
use burn_cuda::{Cuda, CudaDevice};

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = load_run_config_over_base(Path::new("config/base.toml"), &args.config)?;
    apply_overrides(&mut config, &args);

    let per_rank = config.distributed.device_per_rank;
    match args.backend {
        BackendArg::Ndarray => generate_backend::<NdArray<f32>, _>(&config, &args, |_| {
            Default::default()
        }),
        BackendArg::Wgpu => generate_backend::<Wgpu<f32>, _>(&config, &args, |rank| {
            if per_rank {
                WgpuDevice::DiscreteGpu(rank)
            } else {
                WgpuDevice::default()
            }
        }),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                generate_backend::<Cuda<f32>, _>(&config, &args, |rank| {
                    CudaDevice::new(if per_rank { rank } else { 0 })
                })
            }
            #[cfg(not(feature = "cuda"))]
            {
                let _ = per_rank;
                Err(anyhow!(
                    "cuda backend selected but this build lacks `cuda` feature; rebuild with `--features cuda`"
                ))
            }
        }
    }
}

fn apply_overrides(config: &mut RunConfig, args: &Args) {
    if let Some(path) = &args.checkpoint {
        config.model.checkpoint = Some(path.clone());
    }
    if let Some(count) = args.num_processes {
        config.distributed.num_processes = count;
    }
    if let Some(size) = args.batch_size {
        config.generation.batch_size = size;
    }
    if let Some(tokens) = args.max_new_tokens {
        config.generation.max_new_tokens = tokens;
    }
    if args.temperature.is_some() {
        config.generation.temperature = args.temperature;
    }
    if args.top_k.is_some() {
        config.generation.top_k = args.top_k;
    }
    if args.no_padding {
        config.distributed.apply_padding = false;
    }
    if !args.prompt.is_empty() {
        config.generation.prompts = args.prompt.clone();
    }
}

fn generate_backend<B, D>(config: &RunConfig, args: &Args, device_for_rank: D) -> Result<()>
where
    B: Backend,
    D: Fn(usize) -> B::Device,
{
    B::seed(config.model.seed);
    let tokenizer = config.tokenizer.build_padded();
    let model_config = config.model.transformer_config(tokenizer.tokenizer().len());
    let device = device_for_rank(0);

    let mut model = TransformerLm::<B>::new(&model_config, &device)?;
    if let Some(path) = &config.model.checkpoint {
        model = model
            .load_checkpoint(path, &device)
            .with_context(|| format!("failed to restore model from {}", path.display()))?;
        info!(checkpoint = %path.display(), "loaded checkpoint");
    }
    if let Some(path) = &args.save_checkpoint {
        model
            .save_checkpoint(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let weights = model.state_dict();
    let outcome = run_generation::<B, _>(config, &tokenizer, &weights, device_for_rank)?;
    for rank in &outcome.ranks {
        info!(
            rank = rank.rank,
            batches = rank.batches,
            padded = rank.padded_batches,
            completions = rank.completions,
            "rank summary"
        );
    }

    println!("{:?}", outcome.completions);
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate completions for a prompt list across several worker processes"
)]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to run the model on.
    #[arg(long, value_enum, default_value_t = BackendArg::Ndarray)]
    backend: BackendArg,
    /// Burn record to load the model weights from.
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,
    /// Write the weights used for this run to a burn record.
    #[arg(long, value_name = "PATH")]
    save_checkpoint: Option<PathBuf>,
    /// Override the number of worker processes.
    #[arg(long, value_name = "N")]
    num_processes: Option<usize>,
    /// Override the prompts per batch.
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,
    /// Override the number of tokens to generate.
    #[arg(long, value_name = "N")]
    max_new_tokens: Option<usize>,
    /// Sample with this temperature instead of decoding greedily.
    #[arg(long, value_name = "T")]
    temperature: Option<f32>,
    /// Restrict sampling to the k most likely tokens.
    #[arg(long, value_name = "K")]
    top_k: Option<usize>,
    /// Split work raggedly instead of padding every process to the same count.
    #[arg(long)]
    no_padding: bool,
    /// Replace the configured prompts; repeat for several.
    #[arg(long)]
    prompt: Vec<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    Ndarray,
    Wgpu,
    Cuda,
}
