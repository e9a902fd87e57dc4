use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData, activation};

use super::layers::{Dense, Norm};
use super::state_dict::{LoadReport, StateDict, join};
use crate::error::Result;

const MASKED_SCORE: f32 = -1.0e9;

#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub(crate) query: Dense<B>,
    pub(crate) key: Dense<B>,
    pub(crate) value: Dense<B>,
    n_head: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(n_embd: usize, n_head: usize, fused: bool, device: &B::Device) -> Self {
        Self {
            query: Dense::new(n_embd, n_embd, fused, device),
            key: Dense::new(n_embd, n_embd, fused, device),
            value: Dense::new(n_embd, n_embd, fused, device),
            n_head,
        }
    }

    /// `mask_bias` is additive, shaped `[batch, 1, time, time]`.
    pub fn forward(&self, hidden: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let [batch, time, n_embd] = hidden.dims();
        let head_dim = n_embd / self.n_head;
        let heads = |x: Tensor<B, 3>| {
            x.reshape([batch, time, self.n_head, head_dim])
                .swap_dims(1, 2)
        };

        let query = heads(self.query.forward(hidden.clone()));
        let key = heads(self.key.forward(hidden.clone()));
        let value = heads(self.value.forward(hidden));

        let scores = query
            .matmul(key.swap_dims(2, 3))
            .div_scalar((head_dim as f64).sqrt())
            + mask_bias;
        let probs = activation::softmax(scores, 3);

        probs
            .matmul(value)
            .swap_dims(1, 2)
            .reshape([batch, time, n_embd])
    }
}

#[derive(Module, Debug)]
pub struct AttentionOutput<B: Backend> {
    pub(crate) dense: Dense<B>,
    pub(crate) layer_norm: Norm<B>,
}

#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub(crate) self_attention: SelfAttention<B>,
    pub(crate) output: AttentionOutput<B>,
}

impl<B: Backend> Attention<B> {
    pub fn new(
        n_embd: usize,
        n_head: usize,
        fused_linear: bool,
        fused_norm: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            self_attention: SelfAttention::new(n_embd, n_head, fused_linear, device),
            output: AttentionOutput {
                dense: Dense::new(n_embd, n_embd, fused_linear, device),
                layer_norm: Norm::new(n_embd, fused_norm, device),
            },
        }
    }

    pub fn forward(&self, hidden: Tensor<B, 3>, mask_bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let context = self.self_attention.forward(hidden.clone(), mask_bias);
        self.output
            .layer_norm
            .forward(self.output.dense.forward(context) + hidden)
    }

    pub(crate) fn for_each_dense(&mut self, mut apply: impl FnMut(&mut Dense<B>)) {
        apply(&mut self.self_attention.query);
        apply(&mut self.self_attention.key);
        apply(&mut self.self_attention.value);
        apply(&mut self.output.dense);
    }

    pub(crate) fn export_weights(&self, prefix: &str, out: &mut StateDict) {
        let inner = join(prefix, "self");
        self.self_attention.query.export_weights(&join(&inner, "query"), out);
        self.self_attention.key.export_weights(&join(&inner, "key"), out);
        self.self_attention.value.export_weights(&join(&inner, "value"), out);
        let output = join(prefix, "output");
        self.output.dense.export_weights(&join(&output, "dense"), out);
        self.output.layer_norm.export_weights(&join(&output, "layer_norm"), out);
    }

    pub(crate) fn import_weights(
        &mut self,
        prefix: &str,
        weights: &mut StateDict,
        report: &mut LoadReport,
    ) -> Result<()> {
        let inner = join(prefix, "self");
        self.self_attention
            .query
            .import_weights(&join(&inner, "query"), weights, report)?;
        self.self_attention
            .key
            .import_weights(&join(&inner, "key"), weights, report)?;
        self.self_attention
            .value
            .import_weights(&join(&inner, "value"), weights, report)?;
        let output = join(prefix, "output");
        self.output
            .dense
            .import_weights(&join(&output, "dense"), weights, report)?;
        self.output
            .layer_norm
            .import_weights(&join(&output, "layer_norm"), weights, report)
    }
}

/// A position may attend to key `j` when `j <= i` and key `j` is unmasked.
/// Rows with nothing to attend to (left padding) get a uniform distribution
/// instead of NaN, and their outputs are never read.
pub fn causal_mask_bias<B: Backend>(
    attention_mask: &[i64],
    batch: usize,
    time: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let mut bias = vec![0.0f32; batch * time * time];
    for b in 0..batch {
        let keys = &attention_mask[b * time..(b + 1) * time];
        for i in 0..time {
            let row = &mut bias[(b * time + i) * time..(b * time + i + 1) * time];
            for (j, value) in row.iter_mut().enumerate() {
                if j > i || keys[j] == 0 {
                    *value = MASKED_SCORE;
                }
            }
        }
    }
    Tensor::<B, 4>::from_data(TensorData::new(bias, [batch, 1, time, time]), device)
}
