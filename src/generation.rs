use std::cmp::Ordering;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;

use crate::error::{InferenceError, Result};
use crate::model::ModelOracle;
use crate::tokenizer::{DeviceBatch, PaddedTokenizer, TokenizedBatch};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingOptions {
    pub temperature: f32,
    pub top_k: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerateOptions {
    pub max_new_tokens: usize,
    pub sampling: Option<SamplingOptions>,
    pub eos_token_id: Option<u32>,
    pub pad_token_id: u32,
    pub seed: u64,
}

impl GenerateOptions {
    /// Greedy decoding that stops rows on the tokenizer's eos and pads them after.
    pub fn greedy(tokenizer: &PaddedTokenizer, max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            sampling: None,
            eos_token_id: tokenizer.tokenizer().eos_id(),
            pad_token_id: tokenizer.pad_token_id(),
            seed: 0,
        }
    }

    pub fn with_sampling(mut self, sampling: Option<SamplingOptions>, seed: u64) -> Self {
        self.sampling = sampling;
        self.seed = seed;
        self
    }
}

pub fn sample_next_token(
    logits: &[f32],
    sampling: Option<&SamplingOptions>,
    rng: &mut StdRng,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(InferenceError::model("empty logits row"));
    }

    let Some(sampling) = sampling else {
        let (index, _) = logits
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (idx, &value)| {
                if value > best.1 { (idx, value) } else { best }
            });
        return Ok(index as u32);
    };

    if !(sampling.temperature > 0.0) {
        return Err(InferenceError::invalid(format!(
            "temperature must be positive, got {}",
            sampling.temperature
        )));
    }

    let vocab = logits.len();
    let mut values: Vec<f32> = logits.iter().map(|v| v / sampling.temperature).collect();

    if let Some(k) = sampling.top_k
        && k > 0
        && k < vocab
    {
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let threshold = sorted[k - 1];
        for value in values.iter_mut() {
            if *value < threshold {
                *value = f32::NEG_INFINITY;
            }
        }
    }

    let max_logit = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = values.iter().map(|value| (value - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum == 0.0 || sum.is_nan() {
        probs.fill(1.0 / vocab as f32);
    } else {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }

    let dist = WeightedIndex::new(&probs).map_err(|err| InferenceError::model(err.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// Rows that emitted eos receive the pad id afterwards; every appended position is attended.
pub fn autoregressive_generate<B, F>(
    batch: &DeviceBatch<B>,
    options: &GenerateOptions,
    mut next_logits: F,
) -> Result<Tensor<B, 2, Int>>
where
    B: Backend,
    F: FnMut(&DeviceBatch<B>) -> Result<Tensor<B, 3>>,
{
    let [rows, prompt_len] = batch.shape();
    let device = batch.device();

    let mut ids = host_rows(batch.input_ids.clone(), rows, prompt_len)?;
    let mut mask = host_rows(batch.attention_mask.clone(), rows, prompt_len)?;
    let mut types = match &batch.token_type_ids {
        Some(tensor) => Some(host_rows(tensor.clone(), rows, prompt_len)?),
        None => None,
    };

    let mut finished = vec![false; rows];
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut current = batch.clone();

    for _ in 0..options.max_new_tokens {
        if finished.iter().all(|done| *done) {
            break;
        }

        let logits = next_logits(&current)?;
        let [_, time, vocab] = logits.dims();
        let last = logits
            .slice([0..rows, time - 1..time, 0..vocab])
            .reshape([rows, vocab])
            .into_data()
            .convert::<f32>()
            .into_vec::<f32>()
            .map_err(|err| InferenceError::model(format!("{err:?}")))?;

        for (row, row_logits) in last.chunks(vocab).enumerate() {
            let token = if finished[row] {
                options.pad_token_id
            } else {
                let token = sample_next_token(row_logits, options.sampling.as_ref(), &mut rng)?;
                finished[row] = options.eos_token_id == Some(token);
                token
            };
            ids[row].push(i64::from(token));
            mask[row].push(1);
            if let Some(types) = types.as_mut() {
                let segment = types[row].last().copied().unwrap_or(0);
                types[row].push(segment);
            }
        }

        current = DeviceBatch {
            input_ids: device_rows(&ids, &device),
            attention_mask: device_rows(&mask, &device),
            token_type_ids: types.as_ref().map(|types| device_rows(types, &device)),
        };
    }

    Ok(current.input_ids)
}

pub fn generate_completions<B, M>(
    oracle: &M,
    tokenizer: &PaddedTokenizer,
    batch: &TokenizedBatch,
    device: &B::Device,
    options: &GenerateOptions,
) -> Result<Vec<String>>
where
    B: Backend,
    M: ModelOracle<B> + ?Sized,
{
    let inputs = batch.to_device::<B>(device);
    let output = oracle.generate(&inputs, options)?;
    let [rows, width] = output.dims();
    if rows != batch.rows() {
        return Err(InferenceError::model(format!(
            "generate returned {rows} rows for a batch of {}",
            batch.rows()
        )));
    }

    let sequences: Vec<Vec<u32>> = host_rows(output, rows, width)?
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter_map(|id| u32::try_from(id).ok())
                .collect()
        })
        .collect();
    Ok(tokenizer.batch_decode(&sequences, true))
}

fn host_rows<B: Backend>(tensor: Tensor<B, 2, Int>, rows: usize, width: usize) -> Result<Vec<Vec<i64>>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .into_vec::<i64>()
        .map_err(|err| InferenceError::model(format!("{err:?}")))?;
    if width == 0 {
        return Ok(vec![Vec::new(); rows]);
    }
    Ok(values.chunks(width).map(<[i64]>::to_vec).collect())
}

fn device_rows<B: Backend>(rows: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let width = rows.first().map_or(0, Vec::len);
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::<B, 2, Int>::from_data(TensorData::new(flat, [rows.len(), width]), device)
}

#[cfg(test)]
mod tests {
    use burn_ndarray::NdArray;

    use super::*;
    use crate::tokenizer::{PadOptions, PaddingSide, TokenizerConfig};

    type TestBackend = NdArray<f32>;

    #[test]
    fn greedy_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        let token = sample_next_token(&[0.1, 3.0, -1.0, 2.9], None, &mut rng).expect("token");
        assert_eq!(token, 1);
    }

    #[test]
    fn top_one_sampling_is_greedy() {
        let mut rng = StdRng::seed_from_u64(7);
        let sampling = SamplingOptions {
            temperature: 0.8,
            top_k: Some(1),
        };
        for _ in 0..20 {
            let token =
                sample_next_token(&[0.5, -2.0, 4.0, 3.5], Some(&sampling), &mut rng).expect("token");
            assert_eq!(token, 2);
        }
    }

    #[test]
    fn rejects_non_positive_temperature() {
        let mut rng = StdRng::seed_from_u64(0);
        let sampling = SamplingOptions {
            temperature: 0.0,
            top_k: None,
        };
        assert!(matches!(
            sample_next_token(&[1.0, 2.0], Some(&sampling), &mut rng),
            Err(InferenceError::InvalidArgument(_))
        ));
    }

    /// Always predicts `favourite`, except that row 0 predicts `eos` once it has
    /// grown by two tokens.
    fn scripted_logits(
        batch: &DeviceBatch<TestBackend>,
        prompt_len: usize,
        favourite: usize,
        eos: usize,
        vocab: usize,
    ) -> Tensor<TestBackend, 3> {
        let [rows, time] = batch.shape();
        let mut values = vec![0.0f32; rows * time * vocab];
        for row in 0..rows {
            let target = if row == 0 && time >= prompt_len + 2 { eos } else { favourite };
            for t in 0..time {
                values[(row * time + t) * vocab + target] = 10.0;
            }
        }
        Tensor::from_data(TensorData::new(values, [rows, time, vocab]), &batch.device())
    }

    #[test]
    fn finished_rows_receive_padding() {
        let device = Default::default();
        let tokenizer = TokenizerConfig::default().build_padded();
        let encoded = tokenizer
            .with_padding_side(PaddingSide::Left)
            .encode_batch(&["ab", "c"], PadOptions::aligned(2))
            .expect("encode");
        let batch = encoded.to_device::<TestBackend>(&device);
        let options = GenerateOptions::greedy(&tokenizer, 5);
        let eos = options.eos_token_id.expect("eos") as usize;
        let pad = i64::from(options.pad_token_id);
        let vocab = tokenizer.tokenizer().len();

        let output = autoregressive_generate(&batch, &options, |current| {
            Ok(scripted_logits(current, 2, b'z' as usize, eos, vocab))
        })
        .expect("generate");

        assert_eq!(output.dims(), [2, 7]);
        let rows = host_rows(output, 2, 7).expect("rows");
        let z = b'z' as i64;
        assert_eq!(rows[0][2..], [z, z, eos as i64, pad, pad]);
        assert_eq!(rows[1][2..], [z, z, z, z, z]);
    }

    #[test]
    fn stops_once_every_row_finished() {
        let device = Default::default();
        let tokenizer = TokenizerConfig::default().build_padded();
        let batch = tokenizer
            .encode_batch(&["q"], PadOptions::default())
            .expect("encode")
            .to_device::<TestBackend>(&device);
        let options = GenerateOptions::greedy(&tokenizer, 10);
        let eos = options.eos_token_id.expect("eos") as usize;
        let vocab = tokenizer.tokenizer().len();

        let mut calls = 0;
        let output = autoregressive_generate(&batch, &options, |current| {
            calls += 1;
            Ok(scripted_logits(current, 1, eos, eos, vocab))
        })
        .expect("generate");
        assert_eq!(calls, 1);
        assert_eq!(output.dims(), [1, 2]);
    }
}
