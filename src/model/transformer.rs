use std::path::Path;

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData, activation};
use tracing::warn;

use super::attention::{Attention, causal_mask_bias};
use super::config::{KernelSelection, ModelVariant, TransformerConfig};
use super::layers::{Dense, Embedding, Norm};
use super::loss::language_model_loss;
use super::oracle::{ModelOracle, ModelOutput};
use super::state_dict::{LoadReport, StateDict, join};
use crate::error::{InferenceError, Result};
use crate::generation::{GenerateOptions, autoregressive_generate};
use crate::tokenizer::DeviceBatch;

#[derive(Module, Debug)]
pub struct Embeddings<B: Backend> {
    pub(crate) word_embeddings: Embedding<B>,
    pub(crate) position_embeddings: Embedding<B>,
    pub(crate) token_type_embeddings: Embedding<B>,
    pub(crate) layer_norm: Norm<B>,
}

impl<B: Backend> Embeddings<B> {
    fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        position_ids: Tensor<B, 2, Int>,
        token_type_ids: Option<Tensor<B, 2, Int>>,
    ) -> Tensor<B, 3> {
        let words = self.word_embeddings.forward(input_ids);
        let positions = self.position_embeddings.forward(position_ids);
        let types = match token_type_ids {
            Some(ids) => self.token_type_embeddings.forward(ids),
            None => self.token_type_embeddings.row(0),
        };
        self.layer_norm.forward(words + positions + types)
    }
}

#[derive(Module, Debug)]
pub struct FeedForwardOutput<B: Backend> {
    pub(crate) dense: Dense<B>,
    pub(crate) layer_norm: Norm<B>,
}

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    pub(crate) attention: Attention<B>,
    pub(crate) intermediate: Dense<B>,
    pub(crate) output: FeedForwardOutput<B>,
}

impl<B: Backend> EncoderLayer<B> {
    fn new(config: &TransformerConfig, kernels: KernelSelection, device: &B::Device) -> Self {
        Self {
            attention: Attention::new(
                config.n_embd,
                config.n_head,
                kernels.linear,
                kernels.layer_norm,
                device,
            ),
            intermediate: Dense::new(config.n_embd, config.intermediate_size, kernels.linear, device),
            output: FeedForwardOutput {
                dense: Dense::new(config.intermediate_size, config.n_embd, kernels.linear, device),
                layer_norm: Norm::new(config.n_embd, kernels.layer_norm, device),
            },
        }
    }

    fn forward(&self, hidden: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let attended = self.attention.forward(hidden, mask_bias);
        let expanded = activation::gelu(self.intermediate.forward(attended.clone()));
        self.output
            .layer_norm
            .forward(self.output.dense.forward(expanded) + attended)
    }
}

/// Parameter names follow the `embeddings.*`, `encoder.layer.{i}.*`,
/// `lm_head.*` layout; see [`TransformerLm::state_dict`].
#[derive(Module, Debug)]
pub struct TransformerLm<B: Backend> {
    pub(crate) embeddings: Embeddings<B>,
    pub(crate) layers: Vec<EncoderLayer<B>>,
    pub(crate) lm_head: Dense<B>,
    max_position_embeddings: usize,
}

impl<B: Backend> TransformerLm<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let kernels = config.variant.kernels();

        let embeddings = Embeddings {
            word_embeddings: Embedding::new(config.vocab_size, config.n_embd, device),
            position_embeddings: Embedding::new(
                config.max_position_embeddings,
                config.n_embd,
                device,
            ),
            token_type_embeddings: Embedding::new(config.type_vocab_size, config.n_embd, device),
            layer_norm: Norm::new(config.n_embd, kernels.layer_norm, device),
        };
        let layers = (0..config.n_layer)
            .map(|_| EncoderLayer::new(config, kernels, device))
            .collect();

        Ok(Self {
            embeddings,
            layers,
            lm_head: Dense::new(config.n_embd, config.vocab_size, kernels.linear, device),
            max_position_embeddings: config.max_position_embeddings,
        })
    }

    pub fn from_state_dict(
        config: &TransformerConfig,
        weights: StateDict,
        device: &B::Device,
    ) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(weights, true)?;
        Ok(model)
    }

    pub fn load_checkpoint(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let record = recorder
            .load::<<Self as Module<B>>::Record>(path.to_path_buf(), device)
            .map_err(|err| {
                InferenceError::model(format!(
                    "failed to load checkpoint {}: {err}",
                    path.display()
                ))
            })?;
        Ok(self.load_record(record))
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|err| {
                InferenceError::model(format!(
                    "failed to save checkpoint {}: {err}",
                    path.display()
                ))
            })
    }

    pub fn kernels(&self) -> KernelSelection {
        KernelSelection {
            linear: self.lm_head.is_fused(),
            layer_norm: self.embeddings.layer_norm.is_fused(),
        }
    }

    pub fn variant(&self) -> ModelVariant {
        match (self.kernels().linear, self.kernels().layer_norm) {
            (false, false) => ModelVariant::Baseline,
            (true, true) => ModelVariant::Fused,
            (false, true) => ModelVariant::FusedNoLinear,
            (true, false) => ModelVariant::FusedNoLayerNorm,
        }
    }

    /// Swap every linear and layer-norm path in place, keeping the weights.
    pub fn convert_kernels(&mut self, selection: KernelSelection) {
        self.embeddings.layer_norm.set_fused(selection.layer_norm);
        for layer in self.layers.iter_mut() {
            layer
                .attention
                .for_each_dense(|dense| dense.set_fused(selection.linear));
            layer.attention.output.layer_norm.set_fused(selection.layer_norm);
            layer.intermediate.set_fused(selection.linear);
            layer.output.dense.set_fused(selection.linear);
            layer.output.layer_norm.set_fused(selection.layer_norm);
        }
        self.lm_head.set_fused(selection.linear);
    }

    pub fn word_embedding_weight(&self) -> Tensor<B, 2> {
        self.embeddings.word_embeddings.weight()
    }

    pub fn query_weight(&self, layer: usize) -> Option<Tensor<B, 2>> {
        self.layers
            .get(layer)
            .map(|layer| layer.attention.self_attention.query.weight())
    }

    pub fn attention_output_norm_weight(&self, layer: usize) -> Option<Tensor<B, 1>> {
        self.layers
            .get(layer)
            .map(|layer| layer.attention.output.layer_norm.weight())
    }

    fn run(
        &self,
        batch: &DeviceBatch<B>,
        labels: Option<Tensor<B, 2, Int>>,
    ) -> Result<ModelOutput<B>> {
        let [rows, time] = batch.shape();
        if time == 0 {
            return Err(InferenceError::invalid("cannot run the model on empty sequences"));
        }
        if time > self.max_position_embeddings {
            return Err(InferenceError::invalid(format!(
                "sequence length {time} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            )));
        }

        let device = batch.device();
        let mask = batch
            .attention_mask
            .clone()
            .into_data()
            .convert::<i64>()
            .into_vec::<i64>()
            .map_err(|err| InferenceError::model(format!("{err:?}")))?;

        let position_ids = position_ids_from_mask(&mask, rows, time);
        let position_ids =
            Tensor::<B, 2, Int>::from_data(TensorData::new(position_ids, [rows, time]), &device);
        let mask_bias = causal_mask_bias::<B>(&mask, rows, time, &device);

        let mut hidden = self.embeddings.forward(
            batch.input_ids.clone(),
            position_ids,
            batch.token_type_ids.clone(),
        );
        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        hidden_states.push(hidden.clone());
        for layer in &self.layers {
            hidden = layer.forward(hidden, mask_bias.clone());
            hidden_states.push(hidden.clone());
        }

        let logits = self.lm_head.forward(hidden);
        let loss = match labels {
            Some(targets) => Some(language_model_loss(
                logits.clone(),
                targets,
                batch.attention_mask.clone(),
            )?),
            None => None,
        };

        Ok(ModelOutput {
            logits,
            hidden_states,
            loss,
        })
    }
}

impl<B: Backend> ModelOracle<B> for TransformerLm<B> {
    fn forward(
        &self,
        batch: &DeviceBatch<B>,
        labels: Option<Tensor<B, 2, Int>>,
    ) -> Result<ModelOutput<B>> {
        self.run(batch, labels)
    }

    fn generate(
        &self,
        batch: &DeviceBatch<B>,
        options: &GenerateOptions,
    ) -> Result<Tensor<B, 2, Int>> {
        let [_, prompt_len] = batch.shape();
        if prompt_len + options.max_new_tokens > self.max_position_embeddings {
            return Err(InferenceError::invalid(format!(
                "prompt length {prompt_len} plus {} new tokens exceeds max_position_embeddings {}",
                options.max_new_tokens, self.max_position_embeddings
            )));
        }
        autoregressive_generate(batch, options, |current| {
            self.run(current, None).map(|output| output.logits)
        })
    }

    fn load_weights(&mut self, weights: StateDict, strict: bool) -> Result<LoadReport> {
        let mut weights = weights;
        let mut report = LoadReport::default();

        let prefix = "embeddings";
        self.embeddings
            .word_embeddings
            .import_weights(&join(prefix, "word_embeddings"), &mut weights, &mut report)?;
        self.embeddings
            .position_embeddings
            .import_weights(&join(prefix, "position_embeddings"), &mut weights, &mut report)?;
        self.embeddings.token_type_embeddings.import_weights(
            &join(prefix, "token_type_embeddings"),
            &mut weights,
            &mut report,
        )?;
        self.embeddings
            .layer_norm
            .import_weights(&join(prefix, "layer_norm"), &mut weights, &mut report)?;

        for (index, layer) in self.layers.iter_mut().enumerate() {
            let prefix = format!("encoder.layer.{index}");
            layer
                .attention
                .import_weights(&join(&prefix, "attention"), &mut weights, &mut report)?;
            layer.intermediate.import_weights(
                &join(&prefix, "intermediate.dense"),
                &mut weights,
                &mut report,
            )?;
            let output = join(&prefix, "output");
            layer
                .output
                .dense
                .import_weights(&join(&output, "dense"), &mut weights, &mut report)?;
            layer
                .output
                .layer_norm
                .import_weights(&join(&output, "layer_norm"), &mut weights, &mut report)?;
        }

        self.lm_head
            .import_weights("lm_head", &mut weights, &mut report)?;
        report.unexpected_keys = weights.into_keys().collect();

        if !report.is_exact() {
            if strict {
                return Err(InferenceError::invalid(format!(
                    "state dict mismatch: missing {:?}, unexpected {:?}",
                    report.missing_keys, report.unexpected_keys
                )));
            }
            warn!(
                missing = report.missing_keys.len(),
                unexpected = report.unexpected_keys.len(),
                "loaded weights non-strictly"
            );
        }

        Ok(report)
    }

    fn state_dict(&self) -> StateDict {
        let mut out = StateDict::new();
        let prefix = "embeddings";
        self.embeddings
            .word_embeddings
            .export_weights(&join(prefix, "word_embeddings"), &mut out);
        self.embeddings
            .position_embeddings
            .export_weights(&join(prefix, "position_embeddings"), &mut out);
        self.embeddings
            .token_type_embeddings
            .export_weights(&join(prefix, "token_type_embeddings"), &mut out);
        self.embeddings
            .layer_norm
            .export_weights(&join(prefix, "layer_norm"), &mut out);

        for (index, layer) in self.layers.iter().enumerate() {
            let prefix = format!("encoder.layer.{index}");
            layer
                .attention
                .export_weights(&join(&prefix, "attention"), &mut out);
            layer
                .intermediate
                .export_weights(&join(&prefix, "intermediate.dense"), &mut out);
            let output = join(&prefix, "output");
            layer.output.dense.export_weights(&join(&output, "dense"), &mut out);
            layer
                .output
                .layer_norm
                .export_weights(&join(&output, "layer_norm"), &mut out);
        }

        self.lm_head.export_weights("lm_head", &mut out);
        out
    }
}

/// Positions count only attended tokens, so left padding does not shift them.
fn position_ids_from_mask(mask: &[i64], rows: usize, time: usize) -> Vec<i64> {
    let mut positions = Vec::with_capacity(rows * time);
    for row in mask.chunks(time.max(1)).take(rows) {
        let mut seen = 0i64;
        for &value in row {
            seen += value;
            positions.push((seen - 1).max(0));
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use burn_ndarray::NdArray;
    use tempfile::tempdir;

    use super::*;
    use crate::model::remap_layer_norm_keys;
    use crate::tokenizer::{PadOptions, PaddingSide, TokenizerConfig};

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            n_layer: 2,
            n_embd: 16,
            n_head: 2,
            intermediate_size: 32,
            max_position_embeddings: 32,
            ..TransformerConfig::default()
        }
    }

    fn sample_batch(side: PaddingSide) -> crate::tokenizer::TokenizedBatch {
        let tokenizer = TokenizerConfig::default().build_padded();
        let guard = tokenizer.with_padding_side(side);
        guard
            .encode_batch(&["hello there", "hi"], PadOptions::aligned(4))
            .expect("encode")
    }

    #[test]
    fn positions_skip_left_padding() {
        assert_eq!(
            position_ids_from_mask(&[0, 0, 1, 1, 1, 1, 1, 0], 2, 4),
            vec![0, 0, 0, 1, 0, 1, 2, 2]
        );
    }

    #[test]
    fn forward_shapes_and_hidden_state_count() {
        let device = Default::default();
        let config = tiny_config();
        let model = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        let batch = sample_batch(PaddingSide::Right).to_device::<TestBackend>(&device);

        let output = model
            .forward(&batch, Some(batch.input_ids.clone()))
            .expect("forward");
        assert_eq!(output.logits.dims(), [2, 12, config.vocab_size]);
        assert_eq!(output.hidden_states.len(), config.n_layer + 1);
        let loss = output.loss.expect("loss").into_scalar();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn state_dict_round_trips_between_variants() {
        let device = Default::default();
        let config = tiny_config();
        let baseline = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        let weights = baseline.state_dict();
        assert!(weights.contains_key("encoder.layer.1.attention.self.query.weight"));
        assert!(weights.contains_key("encoder.layer.0.attention.output.layer_norm.weight"));

        let mut fused = TransformerLm::<TestBackend>::new(
            &config.clone().with_variant(ModelVariant::Fused),
            &device,
        )
        .expect("model");
        let report = fused
            .load_weights(weights.clone(), false)
            .expect("non-strict load");
        assert!(!report.missing_keys.is_empty());
        assert_eq!(report.missing_keys.len(), report.unexpected_keys.len());

        let report = fused
            .load_weights(remap_layer_norm_keys(weights.clone()), true)
            .expect("strict load");
        assert!(report.is_exact());

        let batch = sample_batch(PaddingSide::Right).to_device::<TestBackend>(&device);
        let a = baseline.forward(&batch, None).expect("forward").logits;
        let b = fused.forward(&batch, None).expect("forward").logits;
        let a = a.into_data().convert::<f32>().into_vec::<f32>().expect("vec");
        let b = b.into_data().convert::<f32>().into_vec::<f32>().expect("vec");
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn strict_load_rejects_unknown_keys() {
        let device = Default::default();
        let mut model = TransformerLm::<TestBackend>::new(&tiny_config(), &device).expect("model");
        let mut weights = model.state_dict();
        weights.insert(
            "classifier.weight".into(),
            TensorData::new(vec![0.0f32; 2], [2]),
        );
        let err = model.load_weights(weights, true).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidArgument(_)));
    }

    #[test]
    fn convert_kernels_switches_parameter_names() {
        let device = Default::default();
        let mut model = TransformerLm::<TestBackend>::new(&tiny_config(), &device).expect("model");
        assert_eq!(model.variant(), ModelVariant::Baseline);

        model.convert_kernels(ModelVariant::FusedNoLinear.kernels());
        assert_eq!(model.variant(), ModelVariant::FusedNoLinear);
        let weights = model.state_dict();
        assert!(weights.contains_key("embeddings.layer_norm.layer_norm_weight"));
        assert!(weights.contains_key("lm_head.weight"));
    }

    #[test]
    fn rejects_sequences_past_position_table() {
        let device = Default::default();
        let config = TransformerConfig {
            max_position_embeddings: 8,
            ..tiny_config()
        };
        let model = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        let batch = sample_batch(PaddingSide::Left).to_device::<TestBackend>(&device);
        assert!(matches!(
            model.forward(&batch, None),
            Err(InferenceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn generate_rejects_prompts_that_outgrow_position_table() {
        let device = Default::default();
        let config = TransformerConfig {
            max_position_embeddings: 16,
            ..tiny_config()
        };
        let model = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        let tokenizer = TokenizerConfig::default().build_padded();
        let batch = tokenizer
            .with_padding_side(PaddingSide::Left)
            .encode_batch(&["hello", "hi"], PadOptions::aligned(8))
            .expect("encode")
            .to_device::<TestBackend>(&device);
        assert_eq!(batch.shape(), [2, 8]);

        let mut options = GenerateOptions::greedy(&tokenizer, 9);
        options.eos_token_id = None;
        assert!(matches!(
            model.generate(&batch, &options),
            Err(InferenceError::InvalidArgument(_))
        ));

        options.max_new_tokens = 8;
        let output = model.generate(&batch, &options).expect("fits the table");
        assert_eq!(output.dims(), [2, 16]);
    }

    #[test]
    fn non_strict_load_still_rejects_wrong_shapes() {
        let device = Default::default();
        let mut model = TransformerLm::<TestBackend>::new(&tiny_config(), &device).expect("model");
        let mut weights = model.state_dict();
        weights.insert(
            "lm_head.bias".into(),
            TensorData::new(vec![0.0f32; 3], [3]),
        );
        let err = model.load_weights(weights, false).unwrap_err();
        match err {
            InferenceError::InvalidArgument(message) => {
                assert!(message.contains("lm_head.bias"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn from_state_dict_copies_every_parameter() {
        let device = Default::default();
        let config = tiny_config();
        let source = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        let copy = TransformerLm::<TestBackend>::from_state_dict(&config, source.state_dict(), &device)
            .expect("copy");
        assert_eq!(copy.state_dict(), source.state_dict());

        let mut partial = source.state_dict();
        partial.remove("lm_head.weight");
        assert!(TransformerLm::<TestBackend>::from_state_dict(&config, partial, &device).is_err());
    }

    #[test]
    fn checkpoint_restores_weights() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("model");
        let device = Default::default();
        let config = tiny_config();

        let saved = TransformerLm::<TestBackend>::new(&config, &device).expect("model");
        saved.save_checkpoint(&path).expect("save");
        let restored = TransformerLm::<TestBackend>::new(&config, &device)
            .expect("model")
            .load_checkpoint(&path, &device)
            .expect("load");

        let expected = saved.word_embedding_weight().into_data();
        let actual = restored.word_embedding_weight().into_data();
        assert_eq!(expected, actual);
    }
}
