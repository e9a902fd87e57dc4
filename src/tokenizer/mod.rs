pub mod byte;
pub mod padding;

use std::sync::Arc;

use serde::Deserialize;

pub use byte::ByteTokenizer;
pub use padding::{
    ATTENTION_MASK, DeviceBatch, INPUT_IDS, PadOptions, PaddedTokenizer, PaddingSideGuard,
    TOKEN_TYPE_IDS, TokenizedBatch,
};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<u32>;
    /// Decode ids; with `skip_special_tokens` every bos/eos/pad id is dropped.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> String;
    fn len(&self) -> usize;
    fn bos_id(&self) -> Option<u32>;
    fn eos_id(&self) -> Option<u32>;
    fn pad_id(&self) -> Option<u32>;
    fn unk_id(&self) -> Option<u32>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedTokenizer = Arc<dyn Tokenizer>;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenizerConfig {
    #[serde(default = "default_true")]
    pub add_special_tokens: bool,
    /// Reuse the eos id as the pad id, the usual setup for causal generation.
    #[serde(default)]
    pub pad_with_eos: bool,
    #[serde(default)]
    pub padding_side: PaddingSide,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            add_special_tokens: true,
            pad_with_eos: false,
            padding_side: PaddingSide::Right,
        }
    }
}

impl TokenizerConfig {
    pub fn build(&self) -> SharedTokenizer {
        Arc::new(ByteTokenizer::new(self.add_special_tokens)) as SharedTokenizer
    }

    pub fn build_padded(&self) -> PaddedTokenizer {
        let tokenizer = self.build();
        let pad_id = if self.pad_with_eos {
            tokenizer.eos_id().or(tokenizer.pad_id())
        } else {
            tokenizer.pad_id()
        };
        PaddedTokenizer::new(tokenizer, pad_id.unwrap_or(0), self.padding_side)
    }
}

fn default_true() -> bool {
    true
}
