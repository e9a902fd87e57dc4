use burn::module::{Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution as TensorDistribution, Int, Tensor};

use super::state_dict::{LoadReport, StateDict, export_param, import_param, join};
use crate::error::Result;

const LAYER_NORM_EPS: f64 = 1e-5;
const INIT_STD: f64 = 0.02;

/// The fused path folds the bias into the matmul by appending a ones column
/// to the input and the bias row to the weight.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
    fused: bool,
}

impl<B: Backend> Dense<B> {
    pub fn new(d_in: usize, d_out: usize, fused: bool, device: &B::Device) -> Self {
        let weight = Tensor::<B, 2>::random(
            [d_in, d_out],
            TensorDistribution::Normal(0.0, INIT_STD),
            device,
        );
        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(Tensor::<B, 1>::zeros([d_out], device)),
            fused,
        }
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let dims = input.dims();
        let d_in = dims[D - 1];
        let rows: usize = dims[..D - 1].iter().product();
        let [_, d_out] = self.weight.val().dims();

        let flat = input.reshape([rows, d_in]);
        let projected = if self.fused {
            let ones = Tensor::<B, 2>::ones([rows, 1], &flat.device());
            let augmented = Tensor::cat(vec![flat, ones], 1);
            let weight = Tensor::cat(
                vec![self.weight.val(), self.bias.val().reshape([1, d_out])],
                0,
            );
            augmented.matmul(weight)
        } else {
            flat.matmul(self.weight.val()) + self.bias.val().unsqueeze::<2>()
        };

        let mut out_dims = dims;
        out_dims[D - 1] = d_out;
        projected.reshape(out_dims)
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }

    pub fn is_fused(&self) -> bool {
        self.fused
    }

    pub(crate) fn set_fused(&mut self, fused: bool) {
        self.fused = fused;
    }

    pub(crate) fn export_weights(&self, prefix: &str, out: &mut StateDict) {
        export_param(out, join(prefix, "weight"), &self.weight);
        export_param(out, join(prefix, "bias"), &self.bias);
    }

    pub(crate) fn import_weights(
        &mut self,
        prefix: &str,
        weights: &mut StateDict,
        report: &mut LoadReport,
    ) -> Result<()> {
        import_param(weights, join(prefix, "weight"), &mut self.weight, report)?;
        import_param(weights, join(prefix, "bias"), &mut self.bias, report)
    }
}

/// The fused path computes the variance in a single pass as `E[x^2] - E[x]^2`
/// and names its parameters `layer_norm_weight` / `layer_norm_bias`.
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
    fused: bool,
}

impl<B: Backend> Norm<B> {
    pub fn new(dim: usize, fused: bool, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::<B, 1>::ones([dim], device)),
            bias: Param::from_tensor(Tensor::<B, 1>::zeros([dim], device)),
            fused,
        }
    }

    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let normalized = if self.fused {
            let mean = input.clone().mean_dim(D - 1);
            let mean_sq = (input.clone() * input.clone()).mean_dim(D - 1);
            let var = (mean_sq - mean.clone() * mean.clone()).clamp_min(0.0);
            (input - mean) * var.add_scalar(LAYER_NORM_EPS).sqrt().recip()
        } else {
            let (var, mean) = input.clone().var_mean_bias(D - 1);
            input.sub(mean).div(var.add_scalar(LAYER_NORM_EPS).sqrt())
        };

        normalized * self.weight.val().unsqueeze::<D>() + self.bias.val().unsqueeze::<D>()
    }

    pub fn weight(&self) -> Tensor<B, 1> {
        self.weight.val()
    }

    pub fn is_fused(&self) -> bool {
        self.fused
    }

    pub(crate) fn set_fused(&mut self, fused: bool) {
        self.fused = fused;
    }

    fn names(&self, prefix: &str) -> (String, String) {
        if self.fused {
            (join(prefix, "layer_norm_weight"), join(prefix, "layer_norm_bias"))
        } else {
            (join(prefix, "weight"), join(prefix, "bias"))
        }
    }

    pub(crate) fn export_weights(&self, prefix: &str, out: &mut StateDict) {
        let (weight, bias) = self.names(prefix);
        export_param(out, weight, &self.weight);
        export_param(out, bias, &self.bias);
    }

    pub(crate) fn import_weights(
        &mut self,
        prefix: &str,
        weights: &mut StateDict,
        report: &mut LoadReport,
    ) -> Result<()> {
        let (weight, bias) = self.names(prefix);
        import_param(weights, weight, &mut self.weight, report)?;
        import_param(weights, bias, &mut self.bias, report)
    }
}

#[derive(Module, Debug)]
pub struct Embedding<B: Backend> {
    weight: Param<Tensor<B, 2>>,
}

impl<B: Backend> Embedding<B> {
    pub fn new(entries: usize, dim: usize, device: &B::Device) -> Self {
        let weight = Tensor::<B, 2>::random(
            [entries, dim],
            TensorDistribution::Normal(0.0, INIT_STD),
            device,
        );
        Self {
            weight: Param::from_tensor(weight),
        }
    }

    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch, time] = ids.dims();
        let [_, dim] = self.weight.val().dims();
        self.weight
            .val()
            .select(0, ids.reshape([batch * time]))
            .reshape([batch, time, dim])
    }

    pub fn row(&self, index: usize) -> Tensor<B, 3> {
        let [_, dim] = self.weight.val().dims();
        self.weight
            .val()
            .slice([index..index + 1, 0..dim])
            .reshape([1, 1, dim])
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        self.weight.val()
    }

    pub(crate) fn export_weights(&self, prefix: &str, out: &mut StateDict) {
        export_param(out, join(prefix, "weight"), &self.weight);
    }

    pub(crate) fn import_weights(
        &mut self,
        prefix: &str,
        weights: &mut StateDict,
        report: &mut LoadReport,
    ) -> Result<()> {
        import_param(weights, join(prefix, "weight"), &mut self.weight, report)
    }
}
