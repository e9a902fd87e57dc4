use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;

use crate::generation::{GenerateOptions, SamplingOptions};
use crate::model::{ModelVariant, TransformerConfig};
use crate::tokenizer::{PaddedTokenizer, TokenizerConfig};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSection {
    pub n_layer: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub variant: ModelVariant,
    pub checkpoint: Option<PathBuf>,
    pub seed: u64,
}

impl Default for ModelSection {
    fn default() -> Self {
        let defaults = TransformerConfig::default();
        Self {
            n_layer: defaults.n_layer,
            n_embd: defaults.n_embd,
            n_head: defaults.n_head,
            intermediate_size: defaults.intermediate_size,
            max_position_embeddings: defaults.max_position_embeddings,
            variant: defaults.variant,
            checkpoint: None,
            seed: 0,
        }
    }
}

impl ModelSection {
    pub fn transformer_config(&self, vocab_size: usize) -> TransformerConfig {
        TransformerConfig {
            n_layer: self.n_layer,
            n_embd: self.n_embd,
            n_head: self.n_head,
            intermediate_size: self.intermediate_size,
            max_position_embeddings: self.max_position_embeddings,
            vocab_size,
            variant: self.variant,
            ..TransformerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSection {
    pub prompts: Vec<String>,
    pub batch_size: usize,
    pub pad_to_multiple_of: usize,
    pub max_new_tokens: usize,
    /// Absent means greedy decoding.
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            prompts: [
                "I would like to",
                "hello how are you",
                "what is going on",
                "roses are red and",
                "welcome to the hotel",
            ]
            .map(String::from)
            .to_vec(),
            batch_size: 2,
            pad_to_multiple_of: 8,
            max_new_tokens: 20,
            temperature: None,
            top_k: None,
        }
    }
}

impl GenerationSection {
    pub fn options(&self, tokenizer: &PaddedTokenizer, seed: u64) -> GenerateOptions {
        let sampling = self.temperature.map(|temperature| SamplingOptions {
            temperature,
            top_k: self.top_k,
        });
        GenerateOptions::greedy(tokenizer, self.max_new_tokens).with_sampling(sampling, seed)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistributedSection {
    pub num_processes: usize,
    pub apply_padding: bool,
    /// Give each rank its own accelerator index instead of sharing the default device.
    pub device_per_rank: bool,
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            num_processes: 2,
            apply_padding: true,
            device_per_rank: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComparisonSection {
    pub pairs: Vec<(String, String)>,
    pub tolerances: Vec<f64>,
    pub hidden_state_tolerance: f64,
    pub convert: bool,
    pub no_linear: bool,
    pub no_ln: bool,
}

impl Default for ComparisonSection {
    fn default() -> Self {
        let pairs = [
            (
                "Amrozi accused his brother of deliberately distorting his evidence.",
                "Referring to him as only the witness, Amrozi accused his brother.",
            ),
            (
                "Yucaipa owned Dominick's before selling the chain to Safeway.",
                "Yucaipa bought Dominick's and sold it to Safeway.",
            ),
            (
                "They had published an advertisement on the Internet.",
                "On June 10, the ship's owners had published an advertisement.",
            ),
            (
                "The stock rose $2.11 to close Friday at $21.51.",
                "PG&E Corp. shares jumped $1.63 to close at $21.03.",
            ),
        ];
        Self {
            pairs: pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            tolerances: vec![1e-6, 1e-5, 1e-4],
            hidden_state_tolerance: 1e-4,
            convert: false,
            no_linear: false,
            no_ln: false,
        }
    }
}

impl ComparisonSection {
    pub fn variant(&self) -> ModelVariant {
        ModelVariant::from_exclusions(self.no_linear, self.no_ln)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelSection,
    pub tokenizer: TokenizerConfig,
    pub generation: GenerationSection,
    pub distributed: DistributedSection,
    pub comparison: ComparisonSection,
}

pub fn load_run_config(paths: &[PathBuf]) -> Result<RunConfig> {
    let mut value = Value::Table(toml::value::Table::new());
    for path in paths {
        let overlay = load_value(path)?;
        merge_values(&mut value, overlay);
    }

    value.try_into::<RunConfig>().map_err(|err| anyhow!(err))
}

/// `base` is skipped when absent; every overlay must exist.
pub fn load_run_config_over_base(base: &Path, overlays: &[PathBuf]) -> Result<RunConfig> {
    let mut paths = Vec::with_capacity(overlays.len() + 1);
    if base.is_file() {
        paths.push(base.to_path_buf());
    }
    paths.extend(overlays.iter().cloned());
    load_run_config(&paths)
}

fn load_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let table: toml::value::Table = toml::from_str(&content)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;
    Ok(Value::Table(table))
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::PaddingSide;
    use tempfile::tempdir;

    fn write_config(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, lines.join("\n")).expect("write config");
        path
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_run_config(&[]).expect("load config");
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.generation.prompts.len(), 5);
        assert_eq!(config.generation.batch_size, 2);
        assert_eq!(config.generation.pad_to_multiple_of, 8);
        assert_eq!(config.distributed.num_processes, 2);
        assert!(config.distributed.apply_padding);
        assert_eq!(config.comparison.tolerances, vec![1e-6, 1e-5, 1e-4]);
    }

    #[test]
    fn load_merges_in_order() {
        let dir = tempdir().expect("tempdir");
        let base = write_config(
            dir.path(),
            "base.toml",
            &[
                "[model]",
                "n_layer = 4",
                "n_embd = 32",
                "variant = \"fused\"",
                "",
                "[tokenizer]",
                "pad_with_eos = true",
                "",
                "[generation]",
                "prompts = [\"a\", \"b\", \"c\"]",
                "batch_size = 3",
                "temperature = 0.7",
                "",
                "[comparison]",
                "pairs = [[\"left\", \"right\"]]",
            ],
        );
        let overlay = write_config(
            dir.path(),
            "override.toml",
            &[
                "[model]",
                "n_embd = 48",
                "",
                "[generation]",
                "batch_size = 1",
                "",
                "[distributed]",
                "num_processes = 3",
                "apply_padding = false",
            ],
        );

        let config = load_run_config(&[base, overlay]).expect("load config");
        assert_eq!(config.model.n_layer, 4);
        assert_eq!(config.model.n_embd, 48);
        assert_eq!(config.model.variant, ModelVariant::Fused);
        assert!(config.tokenizer.pad_with_eos);
        assert_eq!(config.tokenizer.padding_side, PaddingSide::Right);
        assert_eq!(config.generation.prompts, vec!["a", "b", "c"]);
        assert_eq!(config.generation.batch_size, 1);
        assert_eq!(config.generation.temperature, Some(0.7));
        assert_eq!(config.distributed.num_processes, 3);
        assert!(!config.distributed.apply_padding);
        assert_eq!(
            config.comparison.pairs,
            vec![("left".to_string(), "right".to_string())]
        );

        let transformer = config.model.transformer_config(300);
        assert_eq!(transformer.vocab_size, 300);
        assert_eq!(transformer.n_embd, 48);
    }

    #[test]
    fn missing_base_is_skipped_but_missing_overlay_is_not() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("absent.toml");
        assert!(load_run_config(&[missing.clone()]).is_err());
        assert_eq!(
            load_run_config_over_base(&missing, &[]).expect("load config"),
            RunConfig::default()
        );
        assert!(load_run_config_over_base(&missing, &[missing.clone()]).is_err());

        let base = write_config(dir.path(), "base.toml", &["[generation]", "batch_size = 4"]);
        let overlay = write_config(dir.path(), "local.toml", &["[distributed]", "num_processes = 5"]);
        let config = load_run_config_over_base(&base, &[overlay]).expect("load config");
        assert_eq!(config.generation.batch_size, 4);
        assert_eq!(config.distributed.num_processes, 5);
    }

    #[test]
    fn comparison_flags_select_variant() {
        let section = ComparisonSection {
            no_ln: true,
            ..ComparisonSection::default()
        };
        assert_eq!(section.variant(), ModelVariant::FusedNoLayerNorm);
    }
}
