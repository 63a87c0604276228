//! Fixed-capacity decode batch.
//!
//! Mirrors the layout of `llama_batch`: parallel arrays of tokens (or
//! embeddings), positions, sequence-membership lists and logit flags. The
//! sequence-id table has `capacity + 1` slots; the last one is always empty
//! and marks the end of the table.

use crate::engine::Token;
use crate::error::{BridgeError, Result};

/// Hard ceiling on `capacity`.
pub const MAX_BATCH_TOKENS: i32 = 8192;
/// Hard ceiling on `max_sequences`.
pub const MAX_BATCH_SEQUENCES: i32 = 64;

/// Owned decode batch. Sizing is carried with the batch, so release never
/// depends on external bookkeeping.
#[derive(Debug)]
pub struct DecodeBatch {
    capacity: usize,
    max_sequences: usize,
    embedding_width: usize,
    n_tokens: usize,
    token: Vec<Token>,
    embd: Vec<f32>,
    pos: Vec<i32>,
    n_seq_id: Vec<i32>,
    seq_id: Vec<Option<Box<[i32]>>>,
    logits: Vec<i8>,
}

fn alloc<T: Clone>(what: &'static str, len: usize, fill: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| BridgeError::AllocationFailed(what))?;
    v.resize(len, fill);
    Ok(v)
}

impl DecodeBatch {
    /// Allocate a batch for `capacity` tokens, each belonging to at most
    /// `max_sequences` sequences. `embedding_width > 0` makes this an
    /// embedding batch instead of a token batch.
    pub fn new(capacity: i32, embedding_width: i32, max_sequences: i32) -> Result<Self> {
        if capacity <= 0 || max_sequences <= 0 {
            return Err(BridgeError::InvalidBatchParams {
                capacity,
                max_sequences,
            });
        }
        if capacity > MAX_BATCH_TOKENS {
            return Err(BridgeError::BatchTooLarge {
                name: "n_tokens",
                value: capacity,
                max: MAX_BATCH_TOKENS,
            });
        }
        if max_sequences > MAX_BATCH_SEQUENCES {
            return Err(BridgeError::BatchTooLarge {
                name: "n_seq_max",
                value: max_sequences,
                max: MAX_BATCH_SEQUENCES,
            });
        }
        if embedding_width < 0 {
            return Err(BridgeError::InvalidEmbeddingWidth(embedding_width));
        }

        let capacity = capacity as usize;
        let max_sequences = max_sequences as usize;
        let embedding_width = embedding_width as usize;

        let (token, embd) = if embedding_width > 0 {
            let len = capacity
                .checked_mul(embedding_width)
                .ok_or(BridgeError::AllocationFailed("embd"))?;
            (Vec::new(), alloc("embd", len, 0.0f32)?)
        } else {
            (alloc("token", capacity, 0)?, Vec::new())
        };
        let pos = alloc("pos", capacity, 0)?;
        let n_seq_id = alloc("n_seq_id", capacity, 0)?;
        let logits = alloc("logits", capacity, 0i8)?;

        let mut seq_id = alloc("seq_id", capacity + 1, None)?;
        for slot in seq_id.iter_mut().take(capacity) {
            *slot = Some(alloc("seq_id list", max_sequences, 0)?.into_boxed_slice());
        }

        Ok(Self {
            capacity,
            max_sequences,
            embedding_width,
            n_tokens: 0,
            token,
            embd,
            pos,
            n_seq_id,
            seq_id,
            logits,
        })
    }

    //  Accessors

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    pub fn embedding_width(&self) -> usize {
        self.embedding_width
    }

    pub fn is_embedding(&self) -> bool {
        self.embedding_width > 0
    }

    pub fn len(&self) -> usize {
        self.n_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    pub fn is_full(&self) -> bool {
        self.n_tokens == self.capacity
    }

    pub fn tokens(&self) -> &[Token] {
        if self.is_embedding() {
            &[]
        } else {
            &self.token[..self.n_tokens]
        }
    }

    pub fn positions(&self) -> &[i32] {
        &self.pos[..self.n_tokens]
    }

    pub fn logit_flags(&self) -> impl Iterator<Item = bool> + '_ {
        self.logits[..self.n_tokens].iter().map(|&l| l != 0)
    }

    /// Sequence ids of the token at index `i`.
    pub fn sequences(&self, i: usize) -> Option<&[i32]> {
        if i >= self.n_tokens {
            return None;
        }
        let n = self.n_seq_id[i] as usize;
        self.seq_id[i].as_deref().map(|list| &list[..n])
    }

    /// Embedding row of the token at index `i`.
    pub fn embedding(&self, i: usize) -> Option<&[f32]> {
        if !self.is_embedding() || i >= self.n_tokens {
            return None;
        }
        let w = self.embedding_width;
        Some(&self.embd[i * w..(i + 1) * w])
    }

    //  Mutation

    /// Forget all entries; allocations are kept.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Append a token entry.
    pub fn append(&mut self, token: Token, pos: i32, seq_ids: &[i32], logits: bool) -> Result<()> {
        if self.is_embedding() {
            return Err(BridgeError::BatchKind {
                expected: "embeddings",
                actual: "token",
            });
        }
        let i = self.reserve_slot(seq_ids)?;
        self.token[i] = token;
        self.fill_slot(i, pos, seq_ids, logits);
        Ok(())
    }

    /// Append an embedding entry of exactly `embedding_width` values.
    pub fn append_embedding(
        &mut self,
        embedding: &[f32],
        pos: i32,
        seq_ids: &[i32],
        logits: bool,
    ) -> Result<()> {
        if !self.is_embedding() {
            return Err(BridgeError::BatchKind {
                expected: "tokens",
                actual: "embedding",
            });
        }
        if embedding.len() != self.embedding_width {
            return Err(BridgeError::EmbeddingWidth {
                expected: self.embedding_width,
                actual: embedding.len(),
            });
        }
        let i = self.reserve_slot(seq_ids)?;
        let w = self.embedding_width;
        self.embd[i * w..(i + 1) * w].copy_from_slice(embedding);
        self.fill_slot(i, pos, seq_ids, logits);
        Ok(())
    }

    fn reserve_slot(&self, seq_ids: &[i32]) -> Result<usize> {
        if self.is_full() {
            return Err(BridgeError::BatchFull(self.capacity));
        }
        if seq_ids.len() > self.max_sequences {
            return Err(BridgeError::TooManySequences {
                len: seq_ids.len(),
                max: self.max_sequences,
            });
        }
        Ok(self.n_tokens)
    }

    fn fill_slot(&mut self, i: usize, pos: i32, seq_ids: &[i32], logits: bool) {
        self.pos[i] = pos;
        self.n_seq_id[i] = seq_ids.len() as i32;
        if let Some(list) = self.seq_id[i].as_deref_mut() {
            list[..seq_ids.len()].copy_from_slice(seq_ids);
        }
        self.logits[i] = i8::from(logits);
        self.n_tokens += 1;
    }

    /// Release the batch, returning the number of sequence-id lists freed.
    /// The walk stops at the empty sentinel slot.
    pub fn release(mut self) -> usize {
        let mut freed = 0;
        for slot in self.seq_id.iter_mut() {
            match slot.take() {
                Some(list) => {
                    drop(list);
                    freed += 1;
                }
                None => break,
            }
        }
        freed
    }

    /// Borrow the batch as a `llama_batch` for one engine call.
    #[cfg(feature = "llama-cpp")]
    pub(crate) fn raw_view(&mut self) -> RawBatch<'_> {
        RawBatch::new(self)
    }
}

/// A `llama_batch` pointing into a [`DecodeBatch`]'s arrays. The pointer
/// table backing `seq_id` is owned here and ends with a null entry.
#[cfg(feature = "llama-cpp")]
pub(crate) struct RawBatch<'a> {
    raw: llama_sys::llama_batch,
    _seq_table: Vec<*mut i32>,
    _batch: std::marker::PhantomData<&'a mut DecodeBatch>,
}

#[cfg(feature = "llama-cpp")]
impl<'a> RawBatch<'a> {
    fn new(batch: &'a mut DecodeBatch) -> Self {
        let mut seq_table: Vec<*mut i32> = batch
            .seq_id
            .iter_mut()
            .map(|slot| match slot.as_deref_mut() {
                Some(list) => list.as_mut_ptr(),
                None => std::ptr::null_mut(),
            })
            .collect();

        let raw = llama_sys::llama_batch {
            n_tokens: batch.n_tokens as i32,
            token: if batch.token.is_empty() {
                std::ptr::null_mut()
            } else {
                batch.token.as_mut_ptr()
            },
            embd: if batch.embd.is_empty() {
                std::ptr::null_mut()
            } else {
                batch.embd.as_mut_ptr()
            },
            pos: batch.pos.as_mut_ptr(),
            n_seq_id: batch.n_seq_id.as_mut_ptr(),
            seq_id: seq_table.as_mut_ptr(),
            logits: batch.logits.as_mut_ptr(),
        };

        Self {
            raw,
            _seq_table: seq_table,
            _batch: std::marker::PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> llama_sys::llama_batch {
        self.raw
    }
}
