//! Token decoding interface for step segmentation and judge prompts
//!
//! Step boundaries are defined in token space: any vocabulary id whose decoded
//! text ends with the configured separator string terminates a reasoning step.
//! The boundary set is computed once per tokenizer by scanning the vocabulary.

use std::collections::HashSet;

use runtime_core::TokenId;
use tracing::debug;

/// Decodes token ids back to text.
///
/// Implementations wrap a real tokenizer; workers receive this as a trait
/// object so segmentation and judge-prompt construction stay independent of
/// any particular vocabulary.
pub trait TokenCodec: Send + Sync {
    /// Number of ids in the vocabulary, ids are `0..vocab_size`
    fn vocab_size(&self) -> usize;

    /// Decode a token id sequence to text
    fn decode(&self, tokens: &[TokenId]) -> String;

    /// End-of-sequence token id
    fn eos_token_id(&self) -> TokenId;

    /// Padding token id
    fn pad_token_id(&self) -> TokenId;
}

/// Collect every vocabulary id whose decoded text ends with `separator`.
///
/// Tokenizers merge separators into larger tokens (".\n\n", ")\n\n"), so an
/// exact-match lookup of the separator string would miss most real step
/// boundaries. The suffix scan catches all of them.
pub fn separator_token_ids(codec: &dyn TokenCodec, separator: &str) -> HashSet<TokenId> {
    let mut ids = HashSet::new();
    for id in 0..codec.vocab_size() as TokenId {
        if codec.decode(&[id]).ends_with(separator) {
            ids.insert(id);
        }
    }
    debug!(
        separator_tokens = ids.len(),
        vocab_size = codec.vocab_size(),
        "scanned vocabulary for step separators"
    );
    ids
}

/// Decode only the positions where `mask` is non-zero.
pub fn decode_masked(codec: &dyn TokenCodec, tokens: &[TokenId], mask: &[i64]) -> String {
    let valid: Vec<TokenId> = tokens
        .iter()
        .zip(mask.iter())
        .filter(|(_, m)| **m != 0)
        .map(|(t, _)| *t)
        .collect();
    codec.decode(&valid)
}

/// Fixed-vocabulary codec backed by a string table.
///
/// Intended for tests and fixtures: id `i` decodes to `tokens[i]`, and
/// sequences decode to the concatenation of their entries.
#[derive(Debug, Clone)]
pub struct VocabCodec {
    tokens: Vec<String>,
    eos: TokenId,
    pad: TokenId,
}

impl VocabCodec {
    pub fn new(tokens: Vec<String>, eos: TokenId, pad: TokenId) -> Self {
        Self { tokens, eos, pad }
    }
}

impl TokenCodec for VocabCodec {
    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        let mut out = String::new();
        for &id in tokens {
            if let Some(text) = usize::try_from(id).ok().and_then(|i| self.tokens.get(i)) {
                out.push_str(text);
            }
        }
        out
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos
    }

    fn pad_token_id(&self) -> TokenId {
        self.pad
    }
}
