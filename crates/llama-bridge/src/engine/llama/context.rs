//! Safe RAII wrapper around `llama_context`.

use std::sync::Arc;

use tracing::{debug, info};

use super::model::LlamaModel;
use super::token;
use crate::batch::{DecodeBatch, MAX_BATCH_TOKENS};
use crate::engine::{InferenceContext, Token};
use crate::error::{BridgeError, Result};

/// Owns a `llama_context` pointer and its parent model reference.
pub struct LlamaContext {
    ptr: *mut llama_sys::llama_context,
    /// Keep the model alive for the lifetime of the context.
    model: Arc<LlamaModel>,
}

// Safety: a context is only ever used through &mut self, from one thread at
// a time.
unsafe impl Send for LlamaContext {}

impl LlamaContext {
    pub fn new(model: Arc<LlamaModel>, params: &ContextParams) -> Result<Self> {
        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = params.n_ctx;
        raw.n_batch = params.n_batch;
        raw.n_threads = params.n_threads;
        raw.n_threads_batch = params.n_threads_batch;

        let ctx = unsafe { llama_sys::llama_init_from_model(model.as_ptr(), raw) };
        if ctx.is_null() {
            return Err(BridgeError::ContextCreationFailed(
                "llama_init_from_model returned null".into(),
            ));
        }

        info!(
            n_ctx = params.n_ctx,
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "Context created"
        );
        Ok(Self { ptr: ctx, model })
    }

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_context {
        self.ptr
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }
}

impl InferenceContext for LlamaContext {
    fn n_ctx(&self) -> u32 {
        unsafe { llama_sys::llama_n_ctx(self.ptr) }
    }

    fn n_batch(&self) -> u32 {
        unsafe { llama_sys::llama_n_batch(self.ptr) }
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<Token>> {
        token::tokenize(self.model.vocab(), text, add_special, parse_special)
    }

    fn token_to_bytes(&self, token: Token) -> Vec<u8> {
        token::token_to_bytes(self.model.vocab(), token)
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog(token)
    }

    fn decode(&mut self, batch: &mut DecodeBatch) -> Result<()> {
        let view = batch.raw_view();
        let rc = unsafe { llama_sys::llama_decode(self.ptr, view.raw()) };
        if rc != 0 {
            return Err(BridgeError::DecodeFailed(rc));
        }
        Ok(())
    }

    fn clear_memory(&mut self) {
        unsafe {
            let mem = llama_sys::llama_get_memory(self.ptr);
            if !mem.is_null() {
                llama_sys::llama_memory_clear(mem, true);
            }
        }
        debug!("KV memory cleared");
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama context");
            unsafe { llama_sys::llama_free(self.ptr) }
        }
    }
}

//  ContextParams

pub const MIN_CTX: u32 = 512;
pub const MAX_CTX: u32 = 32768;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
}

fn available_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl ContextParams {
    /// Host-requested sizing: `n_ctx` clamped to `[512, 32768]`, batch as
    /// large as the context up to the decode batch ceiling, threads clamped
    /// to `[1, cores]`.
    pub fn for_host(n_ctx: i32, threads: i32) -> Self {
        let n_ctx = n_ctx.clamp(MIN_CTX as i32, MAX_CTX as i32) as u32;
        let threads = threads.clamp(1, available_threads().max(1));
        Self {
            n_ctx,
            n_batch: n_ctx.min(MAX_BATCH_TOKENS as u32),
            n_threads: threads,
            n_threads_batch: threads,
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self::for_host(4096, available_threads())
    }
}
