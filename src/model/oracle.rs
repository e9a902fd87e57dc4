use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use super::state_dict::{LoadReport, StateDict};
use crate::error::Result;
use crate::generation::GenerateOptions;
use crate::tokenizer::DeviceBatch;

pub struct ModelOutput<B: Backend> {
    /// `[batch, time, vocab]`
    pub logits: Tensor<B, 3>,
    pub hidden_states: Vec<Tensor<B, 3>>,
    pub loss: Option<Tensor<B, 1>>,
}

pub trait ModelOracle<B: Backend> {
    fn forward(
        &self,
        batch: &DeviceBatch<B>,
        labels: Option<Tensor<B, 2, Int>>,
    ) -> Result<ModelOutput<B>>;

    /// Prompt ids followed by the generated ids, `[batch, time + new]`.
    fn generate(
        &self,
        batch: &DeviceBatch<B>,
        options: &GenerateOptions,
    ) -> Result<Tensor<B, 2, Int>>;

    fn load_weights(&mut self, weights: StateDict, strict: bool) -> Result<LoadReport>;

    fn state_dict(&self) -> StateDict;
}
