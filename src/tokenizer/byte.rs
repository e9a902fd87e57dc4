use super::Tokenizer;

const BYTE_VOCAB_SIZE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteTokenizer {
    bos: Option<u32>,
    eos: Option<u32>,
    pad: Option<u32>,
    vocab_size: usize,
}

impl ByteTokenizer {
    pub fn new(add_special_tokens: bool) -> Self {
        let mut vocab_size = BYTE_VOCAB_SIZE;
        let mut bos = None;
        let mut eos = None;
        let mut pad = None;

        if add_special_tokens {
            bos = Some(vocab_size as u32);
            vocab_size += 1;
            eos = Some(vocab_size as u32);
            vocab_size += 1;
            pad = Some(vocab_size as u32);
            vocab_size += 1;
        }

        Self {
            bos,
            eos,
            pad,
            vocab_size,
        }
    }

    fn special_name(&self, id: u32) -> Option<&'static str> {
        if Some(id) == self.bos {
            Some("<bos>")
        } else if Some(id) == self.eos {
            Some("<eos>")
        } else if Some(id) == self.pad {
            Some("<pad>")
        } else {
            None
        }
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_bos: bool, add_eos: bool) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(text.len() + 2);
        if add_bos {
            if let Some(bos) = self.bos {
                tokens.push(bos);
            }
        }

        for byte in text.as_bytes() {
            tokens.push(*byte as u32);
        }

        if add_eos {
            if let Some(eos) = self.eos {
                tokens.push(eos);
            }
        }

        tokens
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> String {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(name) = self.special_name(id) {
                if !skip_special_tokens {
                    bytes.extend_from_slice(name.as_bytes());
                }
                continue;
            }
            if (id as usize) < BYTE_VOCAB_SIZE {
                bytes.push(id as u8);
            }
        }
        String::from_utf8_lossy(&bytes).to_string()
    }

    fn len(&self) -> usize {
        self.vocab_size
    }

    fn bos_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos
    }

    fn pad_id(&self) -> Option<u32> {
        self.pad
    }

    fn unk_id(&self) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_special_tokens_drops_markers() {
        let tokenizer = ByteTokenizer::new(true);
        let encoded = tokenizer.encode("hello", true, true);
        assert_eq!(encoded.first().copied(), tokenizer.bos_id());
        assert_eq!(encoded.last().copied(), tokenizer.eos_id());
        assert_eq!(tokenizer.decode(&encoded, true), "hello");
    }

    #[test]
    fn keeps_markers_when_not_skipping() {
        let tokenizer = ByteTokenizer::new(true);
        let mut ids = Vec::new();
        ids.extend(tokenizer.pad_id());
        ids.extend(tokenizer.encode("ab", false, true));
        assert_eq!(tokenizer.decode(&ids, false), "<pad>ab<eos>");
    }

    #[test]
    fn left_padding_with_eos_still_decodes_text() {
        let tokenizer = ByteTokenizer::new(true);
        let eos = tokenizer.eos_id().expect("eos");
        let mut ids = vec![eos, eos];
        ids.extend(tokenizer.encode("abc", false, false));
        assert_eq!(tokenizer.decode(&ids, true), "abc");
    }

    #[test]
    fn plain_vocabulary_has_no_specials() {
        let tokenizer = ByteTokenizer::new(false);
        assert_eq!(tokenizer.len(), BYTE_VOCAB_SIZE);
        assert_eq!(tokenizer.encode("x", true, true), vec![b'x' as u32]);
    }
}
