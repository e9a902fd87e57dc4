#![recursion_limit = "512"]

use burn::tensor::backend::Backend as BackendTrait;
use burn_batched_inference::generation::GenerateOptions;
use burn_batched_inference::model::{ModelOracle, ModelVariant, TransformerConfig, TransformerLm};
use burn_batched_inference::tokenizer::{PadOptions, PaddingSide, TokenizerConfig};
use burn_ndarray::NdArray;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

#[derive(Clone, Copy)]
struct GenerationCase {
    name: &'static str,
    batch: usize,
    prompt_len: usize,
    new_tokens: usize,
}

const GENERATION_CASES: &[GenerationCase] = &[
    GenerationCase {
        name: "b2_p8_n8",
        batch: 2,
        prompt_len: 8,
        new_tokens: 8,
    },
    GenerationCase {
        name: "b8_p16_n16",
        batch: 8,
        prompt_len: 16,
        new_tokens: 16,
    },
];

fn generation_bench(c: &mut Criterion) {
    type Backend = NdArray<f32>;
    <Backend as BackendTrait>::seed(42);
    let device = <Backend as BackendTrait>::Device::default();
    let tokenizer = TokenizerConfig {
        pad_with_eos: true,
        ..TokenizerConfig::default()
    }
    .build_padded();

    for variant in [ModelVariant::Baseline, ModelVariant::Fused] {
        let config = TransformerConfig {
            vocab_size: tokenizer.tokenizer().len(),
            variant,
            ..TransformerConfig::default()
        };
        let model = TransformerLm::<Backend>::new(&config, &device).expect("model");

        for case in GENERATION_CASES {
            let prompts: Vec<String> = (0..case.batch)
                .map(|row| "abcdefghijklmnopqrstuvwxyz"[..case.prompt_len - row % 3].to_string())
                .collect();
            let batch = tokenizer
                .with_padding_side(PaddingSide::Left)
                .encode_batch(&prompts, PadOptions::aligned(8))
                .expect("encode")
                .to_device::<Backend>(&device);
            // Keep eos from ending rows early so every iteration does the same work.
            let options = GenerateOptions {
                eos_token_id: None,
                ..GenerateOptions::greedy(&tokenizer, case.new_tokens)
            };

            let _ = model.generate(&batch, &options).expect("warm-up");

            c.bench_with_input(
                BenchmarkId::new(format!("generate_{}", variant.name()), case.name),
                case,
                |b, _| {
                    b.iter(|| {
                        let _ = model.generate(&batch, &options);
                    });
                },
            );
        }
    }
}

criterion_group!(benches, generation_bench);
criterion_main!(benches);
