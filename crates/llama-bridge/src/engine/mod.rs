//! The engine surface the generation session is written against.
//!
//! [`llama`] implements it over llama.cpp; tests implement it with
//! scripted doubles.

#[cfg(feature = "llama-cpp")]
pub mod llama;

use crate::batch::DecodeBatch;
use crate::error::Result;

/// Vocabulary token id.
pub type Token = i32;

/// An evaluation context: tokenizer, detokenizer and the decode primitive.
pub trait InferenceContext {
    /// Context window size in tokens.
    fn n_ctx(&self) -> u32;

    /// Largest batch accepted by a single [`decode`](Self::decode).
    fn n_batch(&self) -> u32;

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>>;

    /// Raw bytes of a token's piece. May be a partial UTF-8 sequence.
    fn token_to_bytes(&self, token: Token) -> Vec<u8>;

    /// End-of-generation token (EOS, EOT, ...).
    fn is_eog(&self, token: Token) -> bool;

    fn decode(&mut self, batch: &mut DecodeBatch) -> Result<()>;

    /// Clear the KV memory of every sequence.
    fn clear_memory(&mut self);
}

/// Picks the next token from the logits of the last decoded position.
pub trait TokenSampler<C: ?Sized> {
    fn sample(&mut self, ctx: &C) -> Token;
}

/// Host-owned position counter shared with the generation loop.
pub trait PositionCursor {
    fn get(&mut self) -> Result<i32>;

    fn increment(&mut self) -> Result<()>;
}

/// In-process cursor for native hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position(pub i32);

impl Position {
    pub fn value(self) -> i32 {
        self.0
    }
}

impl PositionCursor for Position {
    fn get(&mut self) -> Result<i32> {
        Ok(self.0)
    }

    fn increment(&mut self) -> Result<()> {
        self.0 += 1;
        Ok(())
    }
}
