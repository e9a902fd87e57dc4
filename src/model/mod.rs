mod attention;
mod config;
mod layers;
mod loss;
mod oracle;
mod state_dict;
mod transformer;

pub use attention::{Attention, SelfAttention, causal_mask_bias};
pub use config::{KernelSelection, ModelVariant, TransformerConfig};
pub use layers::{Dense, Embedding, Norm};
pub use loss::language_model_loss;
pub use oracle::{ModelOracle, ModelOutput};
pub use state_dict::{LoadReport, StateDict, remap_layer_norm_keys};
pub use transformer::{EncoderLayer, TransformerLm};
