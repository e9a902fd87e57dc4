use std::fmt;

use burn::tensor::Tensor;
use burn::tensor::backend::{AutodiffBackend, Backend};
use tracing::info;

use crate::error::{InferenceError, Result};
use crate::model::{
    LoadReport, ModelOracle, ModelVariant, TransformerConfig, TransformerLm, remap_layer_norm_keys,
};
use crate::tokenizer::{DeviceBatch, PadOptions, PaddedTokenizer, TokenizedBatch};

const RELATIVE_TOLERANCE: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl HostTensor {
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .into_vec::<f32>()
            .map_err(|err| InferenceError::model(format!("{err:?}")))?;
        Ok(Self { shape, values })
    }

    /// `|a - b| <= atol + rtol * |b|` elementwise, with `rtol = 1e-5`. Shapes must match.
    pub fn allclose(&self, other: &Self, atol: f64) -> bool {
        self.shape == other.shape
            && self.values.iter().zip(&other.values).all(|(&a, &b)| {
                let (a, b) = (f64::from(a), f64::from(b));
                (a - b).abs() <= atol + RELATIVE_TOLERANCE * b.abs()
            })
    }
}

impl fmt::Display for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn nested(
            f: &mut fmt::Formatter<'_>,
            shape: &[usize],
            values: &[f32],
        ) -> fmt::Result {
            match shape {
                [] => values.first().map_or(Ok(()), |value| write!(f, "{value}")),
                [_] => {
                    write!(f, "[")?;
                    for (idx, value) in values.iter().enumerate() {
                        if idx > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{value}")?;
                    }
                    write!(f, "]")
                }
                [outer, inner @ ..] => {
                    let stride: usize = inner.iter().product();
                    write!(f, "[")?;
                    for idx in 0..*outer {
                        if idx > 0 {
                            write!(f, ", ")?;
                        }
                        let start = (idx * stride).min(values.len());
                        let end = (start + stride).min(values.len());
                        nested(f, inner, &values[start..end])?;
                    }
                    write!(f, "]")
                }
            }
        }
        nested(f, &self.shape, &self.values)
    }
}

pub fn allclose<B: Backend, const D: usize>(
    a: Tensor<B, D>,
    b: Tensor<B, D>,
    atol: f64,
) -> Result<bool> {
    Ok(HostTensor::from_tensor(a)?.allclose(&HostTensor::from_tensor(b)?, atol))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceCheck {
    pub atol: f64,
    pub close: bool,
}

fn checks(a: &HostTensor, b: &HostTensor, tolerances: &[f64]) -> Vec<ToleranceCheck> {
    tolerances
        .iter()
        .map(|&atol| ToleranceCheck {
            atol,
            close: a.allclose(b, atol),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct HiddenStateComparison {
    pub index: usize,
    pub baseline_preview: HostTensor,
    pub variant_preview: HostTensor,
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
    pub variant: ModelVariant,
    pub tolerances: Vec<f64>,
    pub baseline_loss: f32,
    pub variant_loss: f32,
    pub loss: Vec<ToleranceCheck>,
    pub baseline_logits: HostTensor,
    pub variant_logits: HostTensor,
    pub logits: Vec<ToleranceCheck>,
    pub hidden_state_tolerance: f64,
    pub hidden_states: Vec<HiddenStateComparison>,
    pub embedding_gradients: Vec<ToleranceCheck>,
    pub linear_gradients: Vec<ToleranceCheck>,
    pub layer_norm_gradients: Vec<ToleranceCheck>,
}

impl ComparisonReport {
    /// Loss, logits and the three gradients all agree at `atol`.
    pub fn passes_at(&self, atol: f64) -> bool {
        [
            &self.loss,
            &self.logits,
            &self.embedding_gradients,
            &self.linear_gradients,
            &self.layer_norm_gradients,
        ]
        .iter()
        .all(|group| {
            group
                .iter()
                .filter(|check| check.atol == atol)
                .all(|check| check.close)
        })
    }

    pub fn hidden_states_close(&self) -> bool {
        self.hidden_states.iter().all(|state| state.close)
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let levels = self
            .tolerances
            .iter()
            .map(|atol| format!("{atol:e}"))
            .collect::<Vec<_>>()
            .join("/");
        writeln!(f, "Loss {} vs {}", self.baseline_loss, self.variant_loss)?;
        section(f, "Loss comparison", &levels, &self.loss)?;
        writeln!(f, "Logits {} vs {}", self.baseline_logits, self.variant_logits)?;
        section(f, "Outputs comparison", &levels, &self.logits)?;
        for state in &self.hidden_states {
            writeln!(
                f,
                "Hidden states {} {} vs {}",
                state.index, state.baseline_preview, state.variant_preview
            )?;
            writeln!(f, "{}", state.close)?;
        }
        section(f, "Embeddings gradients", &levels, &self.embedding_gradients)?;
        section(f, "Linear gradients", &levels, &self.linear_gradients)?;
        section(f, "Layer norm gradients", &levels, &self.layer_norm_gradients)
    }
}

fn section(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    levels: &str,
    checks: &[ToleranceCheck],
) -> fmt::Result {
    writeln!(f, "{title} at {levels}")?;
    checks
        .iter()
        .try_for_each(|check| writeln!(f, "{}", check.close))
}

pub fn comparison_batch(
    tokenizer: &PaddedTokenizer,
    pairs: &[(String, String)],
) -> Result<TokenizedBatch> {
    if pairs.is_empty() {
        return Err(InferenceError::invalid("comparison needs at least one sentence pair"));
    }
    tokenizer.encode_pairs(pairs, PadOptions::default())
}

/// Baseline weights are loaded non-strictly, with layer-norm keys renamed for the fused norm.
pub fn build_variant<B: Backend>(
    baseline: &TransformerLm<B>,
    config: &TransformerConfig,
    variant: ModelVariant,
    convert: bool,
    device: &B::Device,
) -> Result<(TransformerLm<B>, LoadReport)> {
    let mut model = if convert {
        let mut model = baseline.clone();
        model.convert_kernels(variant.kernels());
        model
    } else {
        TransformerLm::new(&config.clone().with_variant(variant), device)?
    };

    let mut weights = baseline.state_dict();
    if variant.kernels().layer_norm {
        weights = remap_layer_norm_keys(weights);
    }
    let report = model.load_weights(weights, false)?;
    info!(
        variant = variant.name(),
        convert,
        missing = report.missing_keys.len(),
        unexpected = report.unexpected_keys.len(),
        "variant weights loaded"
    );
    Ok((model, report))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonSettings {
    pub tolerances: Vec<f64>,
    pub hidden_state_tolerance: f64,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            tolerances: vec![1e-6, 1e-5, 1e-4],
            hidden_state_tolerance: 1e-4,
        }
    }
}

struct Pass<B: AutodiffBackend> {
    loss: HostTensor,
    logits: HostTensor,
    hidden_states: Vec<Tensor<B, 3>>,
    embedding_grad: HostTensor,
    query_grad: HostTensor,
    layer_norm_grad: HostTensor,
}

fn run_pass<B: AutodiffBackend>(
    model: &TransformerLm<B>,
    batch: &DeviceBatch<B>,
) -> Result<Pass<B>> {
    let output = model.forward(batch, Some(batch.input_ids.clone()))?;
    let loss = output
        .loss
        .ok_or_else(|| InferenceError::model("forward with labels produced no loss"))?;
    let grads = loss.backward();

    let missing = |name: &str| InferenceError::model(format!("no gradient for {name}"));
    let embedding_grad = model
        .word_embedding_weight()
        .grad(&grads)
        .ok_or_else(|| missing("word embeddings"))?;
    let query_grad = model
        .query_weight(0)
        .ok_or_else(|| InferenceError::model("model has no layers"))?
        .grad(&grads)
        .ok_or_else(|| missing("layer 0 query"))?;
    let layer_norm_grad = model
        .attention_output_norm_weight(0)
        .ok_or_else(|| InferenceError::model("model has no layers"))?
        .grad(&grads)
        .ok_or_else(|| missing("layer 0 attention output layer norm"))?;

    Ok(Pass {
        loss: HostTensor::from_tensor(loss)?,
        logits: HostTensor::from_tensor(output.logits)?,
        hidden_states: output.hidden_states,
        embedding_grad: HostTensor::from_tensor(embedding_grad)?,
        query_grad: HostTensor::from_tensor(query_grad)?,
        layer_norm_grad: HostTensor::from_tensor(layer_norm_grad)?,
    })
}

fn preview<B: Backend>(tensor: Tensor<B, 3>, limits: [usize; 3]) -> Result<HostTensor> {
    let [a, b, c] = tensor.dims();
    HostTensor::from_tensor(tensor.slice([
        0..a.min(limits[0]),
        0..b.min(limits[1]),
        0..c.min(limits[2]),
    ]))
}

pub fn compare_models<B: AutodiffBackend>(
    baseline: &TransformerLm<B>,
    variant: &TransformerLm<B>,
    batch: &DeviceBatch<B>,
    settings: &ComparisonSettings,
) -> Result<ComparisonReport> {
    let reference = run_pass(baseline, batch)?;
    let candidate = run_pass(variant, batch)?;

    if reference.hidden_states.len() != candidate.hidden_states.len() {
        return Err(InferenceError::model(format!(
            "hidden state count differs: {} vs {}",
            reference.hidden_states.len(),
            candidate.hidden_states.len()
        )));
    }

    let mut hidden_states = Vec::with_capacity(reference.hidden_states.len());
    for (index, (a, b)) in reference
        .hidden_states
        .into_iter()
        .zip(candidate.hidden_states)
        .enumerate()
    {
        let baseline_preview = preview(a.clone(), [3, 2, 2])?;
        let variant_preview = preview(b.clone(), [3, 2, 2])?;
        hidden_states.push(HiddenStateComparison {
            index,
            baseline_preview,
            variant_preview,
            close: allclose(a, b, settings.hidden_state_tolerance)?,
        });
    }

    let tolerances = &settings.tolerances;
    Ok(ComparisonReport {
        variant: variant.variant(),
        tolerances: tolerances.clone(),
        baseline_loss: reference.loss.values.first().copied().unwrap_or(f32::NAN),
        variant_loss: candidate.loss.values.first().copied().unwrap_or(f32::NAN),
        loss: checks(&reference.loss, &candidate.loss, tolerances),
        logits: checks(&reference.logits, &candidate.logits, tolerances),
        baseline_logits: reference.logits,
        variant_logits: candidate.logits,
        hidden_state_tolerance: settings.hidden_state_tolerance,
        hidden_states,
        embedding_gradients: checks(&reference.embedding_grad, &candidate.embedding_grad, tolerances),
        linear_gradients: checks(&reference.query_grad, &candidate.query_grad, tolerances),
        layer_norm_gradients: checks(
            &reference.layer_norm_grad,
            &candidate.layer_norm_grad,
            tolerances,
        ),
    })
}

#[cfg(test)]
mod tests {
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    use super::*;

    type TestBackend = NdArray<f32>;

    fn host(values: Vec<f32>, shape: Vec<usize>) -> HostTensor {
        HostTensor { shape, values }
    }

    #[test]
    fn allclose_uses_absolute_and_relative_terms() {
        let a = host(vec![0.0, 100.0], vec![2]);
        let b = host(vec![5e-6, 100.0005], vec![2]);
        assert!(!a.allclose(&b, 1e-6));
        assert!(a.allclose(&b, 1e-5));
    }

    #[test]
    fn allclose_requires_matching_shapes() {
        let a = host(vec![0.0; 4], vec![2, 2]);
        let b = host(vec![0.0; 4], vec![4]);
        assert!(!a.allclose(&b, 1.0));
    }

    #[test]
    fn tensor_allclose_matches_host() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [2, 2]),
            &device,
        );
        let b = a.clone().add_scalar(5e-5);
        assert!(allclose(a.clone(), b.clone(), 1e-4).expect("allclose"));
        assert!(!allclose(a, b, 1e-6).expect("allclose"));
    }

    #[test]
    fn host_tensor_displays_nested_lists() {
        let tensor = host(vec![1.0, 2.0, 3.0, 4.0], vec![2, 1, 2]);
        assert_eq!(tensor.to_string(), "[[[1, 2]], [[3, 4]]]");
    }
}
