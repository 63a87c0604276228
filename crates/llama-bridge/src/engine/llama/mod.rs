//! llama.cpp implementation of the engine traits.

mod backend;
mod context;
mod model;
mod sampler;
mod token;

pub use backend::{GgmlBackends, LlamaBackend};
pub use context::{ContextParams, LlamaContext, MAX_CTX, MIN_CTX};
pub use model::{LlamaModel, ModelParams};
pub use sampler::SamplerChain;
