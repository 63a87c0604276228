//! Capability-gated llama.cpp inference core.
//!
//! Probes the Vulkan runtime before GPU offload is attempted, decides the
//! effective GPU-layer count, manages fixed-capacity decode batches and runs
//! incremental text generation with cooperative cancellation.
//!
//! The generation session is written against the [`engine`] traits; the
//! llama.cpp implementation lives behind the `llama-cpp` feature.

pub mod batch;
pub mod cancel;
pub mod engine;
pub mod error;
pub mod generate;
pub mod logging;
pub mod probe;
pub mod runtime;
pub mod sampling;
pub mod selector;
pub mod session;
pub mod utf8;

pub use batch::{DecodeBatch, MAX_BATCH_SEQUENCES, MAX_BATCH_TOKENS};
pub use cancel::CancellationFlag;
pub use engine::{InferenceContext, Position, PositionCursor, Token, TokenSampler};
pub use error::{BridgeError, Result};
pub use generate::{GenerateEvent, GenerateRequest, StopReason, generate_blocking};
pub use logging::{HostSink, HostSinkLayer, LogSink};
pub use probe::{ApiVersion, CapabilityProbe, ProbeConfig, RuntimeProbeResult, VulkanProber};
pub use runtime::InferenceRuntime;
pub use sampling::{SamplerStage, SamplingParams};
pub use selector::{ALL_LAYERS, BackendDevice, BackendRegistry, DeviceKind, select_gpu_layers};
pub use session::{
    FinishReason, GenerationSession, NoticeScope, SessionConfig, SessionState, StepOutput,
};
pub use utf8::Utf8Assembler;
