use serde::Deserialize;

use crate::error::{InferenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelSelection {
    pub linear: bool,
    pub layer_norm: bool,
}

impl KernelSelection {
    pub const BASELINE: Self = Self {
        linear: false,
        layer_norm: false,
    };

    pub fn is_baseline(&self) -> bool {
        *self == Self::BASELINE
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    #[default]
    Baseline,
    Fused,
    FusedNoLinear,
    FusedNoLayerNorm,
}

impl ModelVariant {
    /// Variant selected by the `--no-linear` / `--no-ln` switches.
    pub fn from_exclusions(no_linear: bool, no_layer_norm: bool) -> Self {
        match (no_linear, no_layer_norm) {
            (true, true) => Self::Baseline,
            (true, false) => Self::FusedNoLinear,
            (false, true) => Self::FusedNoLayerNorm,
            (false, false) => Self::Fused,
        }
    }

    pub fn kernels(&self) -> KernelSelection {
        match self {
            Self::Baseline => KernelSelection::BASELINE,
            Self::Fused => KernelSelection {
                linear: true,
                layer_norm: true,
            },
            Self::FusedNoLinear => KernelSelection {
                linear: false,
                layer_norm: true,
            },
            Self::FusedNoLayerNorm => KernelSelection {
                linear: true,
                layer_norm: false,
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Fused => "fused",
            Self::FusedNoLinear => "fused-no-linear",
            Self::FusedNoLayerNorm => "fused-no-layer-norm",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransformerConfig {
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub vocab_size: usize,
    pub variant: ModelVariant,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            n_layer: 2,
            n_embd: 64,
            n_head: 4,
            intermediate_size: 256,
            max_position_embeddings: 128,
            type_vocab_size: 2,
            vocab_size: 259,
            variant: ModelVariant::Baseline,
        }
    }
}

impl TransformerConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn with_variant(mut self, variant: ModelVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_layer", self.n_layer),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("intermediate_size", self.intermediate_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("type_vocab_size", self.type_vocab_size),
            ("vocab_size", self.vocab_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(InferenceError::invalid(format!("{name} must be positive")));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(InferenceError::invalid(format!(
                "n_embd {} must be divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        Ok(())
    }
}
