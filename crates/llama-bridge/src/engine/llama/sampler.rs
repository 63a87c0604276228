//! Sampler chain construction and token sampling.

use tracing::debug;

use super::context::LlamaContext;
use crate::engine::{Token, TokenSampler};
use crate::error::{BridgeError, Result};
use crate::sampling::{SamplerStage, SamplingParams};

/// RAII wrapper around a `llama_sampler` chain.
pub struct SamplerChain {
    ptr: *mut llama_sys::llama_sampler,
}

unsafe impl Send for SamplerChain {}

impl SamplerChain {
    /// Create an empty sampler chain.
    pub fn new() -> Result<Self> {
        let params = llama_sys::llama_sampler_chain_params { no_perf: true };
        let ptr = unsafe { llama_sys::llama_sampler_chain_init(params) };
        if ptr.is_null() {
            return Err(BridgeError::SamplerError(
                "llama_sampler_chain_init returned null".into(),
            ));
        }
        Ok(Self { ptr })
    }

    pub fn from_params(params: &SamplingParams) -> Result<Self> {
        let mut chain = Self::new()?;
        for stage in params.stages() {
            chain.push(stage)?;
        }
        Ok(chain)
    }

    fn push(&mut self, stage: SamplerStage) -> Result<()> {
        let s = unsafe {
            match stage {
                SamplerStage::Greedy => llama_sys::llama_sampler_init_greedy(),
                SamplerStage::Penalties { last_n, repeat } => {
                    llama_sys::llama_sampler_init_penalties(last_n, repeat, 0.0, 0.0)
                }
                SamplerStage::TopK(k) => llama_sys::llama_sampler_init_top_k(k),
                SamplerStage::TopP(p) => llama_sys::llama_sampler_init_top_p(p, 1),
                SamplerStage::Temperature(t) => llama_sys::llama_sampler_init_temp(t),
                SamplerStage::Distribution { seed } => llama_sys::llama_sampler_init_dist(seed),
            }
        };
        if s.is_null() {
            return Err(BridgeError::SamplerError(format!(
                "failed to create {stage:?} sampler"
            )));
        }
        unsafe { llama_sys::llama_sampler_chain_add(self.ptr, s) };
        debug!(?stage, "Added sampler");
        Ok(())
    }
}

impl TokenSampler<LlamaContext> for SamplerChain {
    fn sample(&mut self, ctx: &LlamaContext) -> Token {
        unsafe { llama_sys::llama_sampler_sample(self.ptr, ctx.as_ptr(), -1) }
    }
}

impl Drop for SamplerChain {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
        }
    }
}
