//! Scripted engine used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use llama_bridge::{
    BridgeError, CancellationFlag, DecodeBatch, InferenceContext, Result, Token, TokenSampler,
};

pub const BOS: Token = 1;
pub const EOS: Token = 2;

/// Token ids below 256 stand for a single byte; larger ids map to scripted
/// pieces.
pub struct ScriptedContext {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub pieces: HashMap<Token, Vec<u8>>,
    /// Every token decoded so far, in order.
    pub history: Vec<Token>,
    pub decode_calls: usize,
    pub memory_clears: usize,
    /// Fail the decode call with this 1-based index.
    pub fail_decode_at: Option<usize>,
    /// Set this flag from inside the decode call with this 1-based index.
    pub cancel_during_decode: Option<(usize, CancellationFlag)>,
    /// Last batch seen by decode: (token, pos, seq ids, logits).
    pub last_batch: Vec<(Token, i32, Vec<i32>, bool)>,
}

impl ScriptedContext {
    pub fn new(n_ctx: u32, n_batch: u32) -> Self {
        Self {
            n_ctx,
            n_batch,
            pieces: HashMap::new(),
            history: Vec::new(),
            decode_calls: 0,
            memory_clears: 0,
            fail_decode_at: None,
            cancel_during_decode: None,
            last_batch: Vec::new(),
        }
    }

    pub fn with_piece(mut self, token: Token, bytes: &[u8]) -> Self {
        self.pieces.insert(token, bytes.to_vec());
        self
    }
}

impl InferenceContext for ScriptedContext {
    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn n_batch(&self) -> u32 {
        self.n_batch
    }

    /// One token per byte, BOS first when `add_special`.
    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(Token::from));
        Ok(tokens)
    }

    fn token_to_bytes(&self, token: Token) -> Vec<u8> {
        if let Some(piece) = self.pieces.get(&token) {
            return piece.clone();
        }
        match u8::try_from(token) {
            Ok(b) if token != BOS && token != EOS => vec![b],
            _ => Vec::new(),
        }
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOS
    }

    fn decode(&mut self, batch: &mut DecodeBatch) -> Result<()> {
        self.decode_calls += 1;
        if let Some((at, flag)) = &self.cancel_during_decode {
            if *at == self.decode_calls {
                flag.cancel();
            }
        }
        if self.fail_decode_at == Some(self.decode_calls) {
            return Err(BridgeError::DecodeFailed(-1));
        }
        let flags: Vec<bool> = batch.logit_flags().collect();
        self.last_batch = batch
            .tokens()
            .iter()
            .zip(batch.positions())
            .zip(flags)
            .enumerate()
            .map(|(i, ((&t, &p), l))| (t, p, batch.sequences(i).unwrap_or(&[]).to_vec(), l))
            .collect();
        self.history.extend_from_slice(batch.tokens());
        Ok(())
    }

    fn clear_memory(&mut self) {
        self.memory_clears += 1;
        self.history.clear();
    }
}

/// Replays a fixed token list, then EOS forever.
pub struct ScriptedSampler {
    script: Vec<Token>,
    next: usize,
    /// Set this flag while sampling call number `n` (1-based).
    pub cancel_on_sample: Option<(usize, CancellationFlag)>,
    pub calls: usize,
}

impl ScriptedSampler {
    pub fn new(script: &[Token]) -> Self {
        Self {
            script: script.to_vec(),
            next: 0,
            cancel_on_sample: None,
            calls: 0,
        }
    }
}

impl TokenSampler<ScriptedContext> for ScriptedSampler {
    fn sample(&mut self, _ctx: &ScriptedContext) -> Token {
        self.calls += 1;
        if let Some((at, flag)) = &self.cancel_on_sample {
            if *at == self.calls {
                flag.cancel();
            }
        }
        let t = self.script.get(self.next).copied().unwrap_or(EOS);
        self.next += 1;
        t
    }
}

/// Greedy over deterministic pseudo-logits: the "best" token is a pure
/// function of everything decoded so far.
pub struct HistoryGreedy;

impl TokenSampler<ScriptedContext> for HistoryGreedy {
    fn sample(&mut self, ctx: &ScriptedContext) -> Token {
        let h = ctx
            .history
            .iter()
            .fold(17u32, |acc, &t| acc.wrapping_mul(31).wrapping_add(t as u32));
        // Printable ASCII so every step yields text.
        Token::from(b'a') + (h % 26) as Token
    }
}
