#![recursion_limit = "512"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};

use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_batched_inference::{
    ComparisonSettings, ModelVariant, RunConfig, TransformerLm, build_variant, compare_models,
    comparison_batch, load_run_config_over_base,
};
use burn_ndarray::NdArray;
use burn_wgpu::Wgpu;
use tracing::info;

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

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
    config.comparison.convert |= args.convert;
    config.comparison.no_linear |= args.no_linear;
    config.comparison.no_ln |= args.no_ln;
    if let Some(path) = &args.checkpoint {
        config.model.checkpoint = Some(path.clone());
    }

    match args.backend {
        BackendArg::Ndarray => compare_backend::<Autodiff<NdArray<f32>>>(&config),
        BackendArg::Wgpu => compare_backend::<Autodiff<Wgpu<f32>>>(&config),
        BackendArg::Cuda => {
            #[cfg(feature = "cuda")]
            {
                compare_backend::<Autodiff<Cuda<f32>>>(&config)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow!(
                    "cuda backend selected but this build lacks `cuda` feature; rebuild with `--features cuda`"
                ))
            }
        }
    }
}

fn compare_backend<B: AutodiffBackend>(config: &RunConfig) -> Result<()> {
    B::seed(config.model.seed);
    let device = B::Device::default();
    let tokenizer = config.tokenizer.build_padded();
    let model_config = config
        .model
        .transformer_config(tokenizer.tokenizer().len())
        .with_variant(ModelVariant::Baseline);

    let mut baseline = TransformerLm::<B>::new(&model_config, &device)?;
    if let Some(path) = &config.model.checkpoint {
        baseline = baseline
            .load_checkpoint(path, &device)
            .with_context(|| format!("failed to restore model from {}", path.display()))?;
    }

    let comparison = &config.comparison;
    let variant = comparison.variant();
    let (candidate, report) = build_variant(
        &baseline,
        &model_config,
        variant,
        comparison.convert,
        &device,
    )?;
    if !report.is_exact() {
        info!(
            missing = ?report.missing_keys,
            unexpected = ?report.unexpected_keys,
            "state dict keys did not line up"
        );
    }

    let batch = comparison_batch(&tokenizer, &comparison.pairs)?.to_device::<B>(&device);
    let settings = ComparisonSettings {
        tolerances: comparison.tolerances.clone(),
        hidden_state_tolerance: comparison.hidden_state_tolerance,
    };
    let report = compare_models(&baseline, &candidate, &batch, &settings)?;

    println!("Comparing baseline against {}", variant.name());
    print!("{report}");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Compare a baseline transformer against its fused-kernel variant"
)]
struct Args {
    /// Additional configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Vec<PathBuf>,
    /// Backend to run both models on.
    #[arg(long, value_enum, default_value_t = BackendArg::Ndarray)]
    backend: BackendArg,
    /// Burn record holding the baseline weights.
    #[arg(long, value_name = "PATH")]
    checkpoint: Option<PathBuf>,
    /// Convert a copy of the baseline in place instead of building the variant directly.
    #[arg(long)]
    convert: bool,
    /// Keep the plain linear layers.
    #[arg(long)]
    no_linear: bool,
    /// Keep the plain layer norms.
    #[arg(long)]
    no_ln: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BackendArg {
    Ndarray,
    Wgpu,
    Cuda,
}
