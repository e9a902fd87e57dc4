use std::collections::BTreeMap;

use burn::module::Param;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use crate::error::{InferenceError, Result};

pub type StateDict = BTreeMap<String, TensorData>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// Rename plain layer-norm parameters to the names used by the fused layer norm.
pub fn remap_layer_norm_keys(weights: StateDict) -> StateDict {
    weights
        .into_iter()
        .map(|(key, value)| (key.replace("layer_norm.", "layer_norm.layer_norm_"), value))
        .collect()
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub(crate) fn export_param<B: Backend, const D: usize>(
    out: &mut StateDict,
    name: String,
    param: &Param<Tensor<B, D>>,
) {
    out.insert(name, param.val().into_data());
}

pub(crate) fn import_param<B: Backend, const D: usize>(
    weights: &mut StateDict,
    name: String,
    param: &mut Param<Tensor<B, D>>,
    report: &mut LoadReport,
) -> Result<()> {
    let Some(data) = weights.remove(&name) else {
        report.missing_keys.push(name);
        return Ok(());
    };

    let current = param.val();
    let expected = current.dims();
    if data.shape.as_slice() != expected.as_slice() {
        return Err(InferenceError::invalid(format!(
            "shape mismatch for {name}: model has {expected:?}, weights have {:?}",
            data.shape
        )));
    }

    let tensor = Tensor::<B, D>::from_data(data, &current.device());
    *param = Param::from_tensor(tensor);
    Ok(())
}
