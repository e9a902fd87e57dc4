use std::sync::{Mutex, MutexGuard, PoisonError};

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use super::{PaddingSide, SharedTokenizer};
use crate::error::{InferenceError, Result};

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const TOKEN_TYPE_IDS: &str = "token_type_ids";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PadOptions {
    /// Round the padded length up to a multiple of this value.
    pub pad_to_multiple_of: Option<usize>,
    /// Truncate every sequence to at most this many tokens before padding.
    pub max_length: Option<usize>,
}

impl PadOptions {
    pub fn aligned(multiple: usize) -> Self {
        Self {
            pad_to_multiple_of: Some(multiple),
            max_length: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pad_to_multiple_of == Some(0) {
            return Err(InferenceError::invalid("pad_to_multiple_of must be positive"));
        }
        if self.max_length == Some(0) {
            return Err(InferenceError::invalid("max_length must be positive"));
        }
        Ok(())
    }

    fn padded_length(&self, longest: usize) -> usize {
        match self.pad_to_multiple_of {
            Some(multiple) => longest.div_ceil(multiple) * multiple,
            None => longest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedBatch {
    rows: usize,
    seq_len: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    token_type_ids: Option<Vec<i64>>,
}

impl TokenizedBatch {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.seq_len]
    }

    pub fn input_ids(&self) -> &[i64] {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> &[i64] {
        &self.attention_mask
    }

    pub fn token_type_ids(&self) -> Option<&[i64]> {
        self.token_type_ids.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&[i64]> {
        match name {
            INPUT_IDS => Some(self.input_ids()),
            ATTENTION_MASK => Some(self.attention_mask()),
            TOKEN_TYPE_IDS => self.token_type_ids(),
            _ => None,
        }
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = vec![INPUT_IDS, ATTENTION_MASK];
        if self.token_type_ids.is_some() {
            names.push(TOKEN_TYPE_IDS);
        }
        names
    }

    pub fn row(&self, name: &str, index: usize) -> Option<&[i64]> {
        if index >= self.rows {
            return None;
        }
        let start = index * self.seq_len;
        self.field(name).map(|values| &values[start..start + self.seq_len])
    }

    pub fn to_device<B: Backend>(&self, device: &B::Device) -> DeviceBatch<B> {
        let shape = self.shape();
        let tensor = |values: &[i64]| {
            Tensor::<B, 2, Int>::from_data(TensorData::new(values.to_vec(), shape), device)
        };

        DeviceBatch {
            input_ids: tensor(&self.input_ids),
            attention_mask: tensor(&self.attention_mask),
            token_type_ids: self.token_type_ids.as_deref().map(tensor),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceBatch<B: Backend> {
    pub input_ids: Tensor<B, 2, Int>,
    pub attention_mask: Tensor<B, 2, Int>,
    pub token_type_ids: Option<Tensor<B, 2, Int>>,
}

impl<B: Backend> DeviceBatch<B> {
    pub fn shape(&self) -> [usize; 2] {
        self.input_ids.shape().dims()
    }

    pub fn device(&self) -> B::Device {
        self.input_ids.device()
    }
}

/// Tokenizer plus the padding configuration shared by everyone holding it.
///
/// The padding side is mutable shared state. Temporary changes go through
/// [`PaddedTokenizer::with_padding_side`], which holds the lock for the whole
/// scope and restores the previous side when the guard drops.
pub struct PaddedTokenizer {
    tokenizer: SharedTokenizer,
    pad_token_id: u32,
    padding_side: Mutex<PaddingSide>,
}

impl PaddedTokenizer {
    pub fn new(tokenizer: SharedTokenizer, pad_token_id: u32, padding_side: PaddingSide) -> Self {
        Self {
            tokenizer,
            pad_token_id,
            padding_side: Mutex::new(padding_side),
        }
    }

    pub fn tokenizer(&self) -> &SharedTokenizer {
        &self.tokenizer
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn padding_side(&self) -> PaddingSide {
        *self.lock()
    }

    pub fn set_padding_side(&self, side: PaddingSide) {
        *self.lock() = side;
    }

    pub fn with_padding_side(&self, side: PaddingSide) -> PaddingSideGuard<'_> {
        let mut current = self.lock();
        let previous = *current;
        *current = side;
        PaddingSideGuard {
            owner: self,
            current,
            previous,
        }
    }

    pub fn encode_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        let side = self.padding_side();
        self.encode_batch_on(side, texts, options)
    }

    pub fn encode_pairs<S: AsRef<str>>(
        &self,
        pairs: &[(S, S)],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        let side = self.padding_side();
        self.encode_pairs_on(side, pairs, options)
    }

    pub fn batch_decode<R: AsRef<[u32]>>(&self, rows: &[R], skip_special_tokens: bool) -> Vec<String> {
        rows.iter()
            .map(|row| self.tokenizer.decode(row.as_ref(), skip_special_tokens))
            .collect()
    }

    fn encode_batch_on<S: AsRef<str>>(
        &self,
        side: PaddingSide,
        texts: &[S],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        options.validate()?;
        let sequences = texts
            .iter()
            .map(|text| (self.tokenizer.encode(text.as_ref(), false, false), None))
            .collect();
        pad_sequences(sequences, side, self.pad_token_id, options, false)
    }

    fn encode_pairs_on<S: AsRef<str>>(
        &self,
        side: PaddingSide,
        pairs: &[(S, S)],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        options.validate()?;
        let sequences = pairs
            .iter()
            .map(|(first, second)| {
                let mut ids = self.tokenizer.encode(first.as_ref(), false, true);
                let split = ids.len();
                ids.extend(self.tokenizer.encode(second.as_ref(), false, false));
                let types = (0..ids.len()).map(|idx| i64::from(idx >= split)).collect();
                (ids, Some(types))
            })
            .collect();
        pad_sequences(sequences, side, self.pad_token_id, options, true)
    }

    fn lock(&self) -> MutexGuard<'_, PaddingSide> {
        // The guard restores the side during unwinding, so a poisoned value is still valid.
        self.padding_side.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped padding-side override; restores the previous side on drop.
///
/// The shared configuration stays locked while the guard lives, so encode
/// through the guard rather than through the owning tokenizer.
pub struct PaddingSideGuard<'a> {
    owner: &'a PaddedTokenizer,
    current: MutexGuard<'a, PaddingSide>,
    previous: PaddingSide,
}

impl PaddingSideGuard<'_> {
    pub fn side(&self) -> PaddingSide {
        *self.current
    }

    pub fn previous(&self) -> PaddingSide {
        self.previous
    }

    pub fn encode_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        self.owner.encode_batch_on(self.side(), texts, options)
    }

    pub fn encode_pairs<S: AsRef<str>>(
        &self,
        pairs: &[(S, S)],
        options: PadOptions,
    ) -> Result<TokenizedBatch> {
        self.owner.encode_pairs_on(self.side(), pairs, options)
    }
}

impl Drop for PaddingSideGuard<'_> {
    fn drop(&mut self) {
        *self.current = self.previous;
    }
}

fn pad_sequences(
    mut sequences: Vec<(Vec<u32>, Option<Vec<i64>>)>,
    side: PaddingSide,
    pad_token_id: u32,
    options: PadOptions,
    with_token_types: bool,
) -> Result<TokenizedBatch> {
    if let Some(limit) = options.max_length {
        for (ids, types) in sequences.iter_mut() {
            ids.truncate(limit);
            if let Some(types) = types {
                types.truncate(limit);
            }
        }
    }

    let longest = sequences.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0);
    let seq_len = options.padded_length(longest);
    let rows = sequences.len();

    let mut input_ids = Vec::with_capacity(rows * seq_len);
    let mut attention_mask = Vec::with_capacity(rows * seq_len);
    let mut token_type_ids = with_token_types.then(|| Vec::with_capacity(rows * seq_len));

    for (ids, types) in sequences {
        let pad = seq_len - ids.len();
        let real_ids = ids.iter().map(|&id| i64::from(id));
        let real_types = types.unwrap_or_else(|| vec![0; ids.len()]);

        match side {
            PaddingSide::Left => {
                input_ids.extend(std::iter::repeat_n(i64::from(pad_token_id), pad));
                input_ids.extend(real_ids);
                attention_mask.extend(std::iter::repeat_n(0, pad));
                attention_mask.extend(std::iter::repeat_n(1, ids.len()));
                if let Some(out) = token_type_ids.as_mut() {
                    out.extend(std::iter::repeat_n(0, pad));
                    out.extend(real_types);
                }
            }
            PaddingSide::Right => {
                input_ids.extend(real_ids);
                input_ids.extend(std::iter::repeat_n(i64::from(pad_token_id), pad));
                attention_mask.extend(std::iter::repeat_n(1, ids.len()));
                attention_mask.extend(std::iter::repeat_n(0, pad));
                if let Some(out) = token_type_ids.as_mut() {
                    out.extend(real_types);
                    out.extend(std::iter::repeat_n(0, pad));
                }
            }
        }
    }

    Ok(TokenizedBatch {
        rows,
        seq_len,
        input_ids,
        attention_mask,
        token_type_ids,
    })
}
