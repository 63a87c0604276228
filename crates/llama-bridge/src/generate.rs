//! Blocking generation driver streaming over a channel.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::batch::{DecodeBatch, MAX_BATCH_TOKENS};
use crate::engine::{InferenceContext, Position, TokenSampler};
use crate::runtime::InferenceRuntime;
use crate::session::{FinishReason, GenerationSession, SessionConfig, StepOutput};

/// Parameters for a generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Output positions reserved in the context; also the step budget.
    pub max_tokens: i32,
    pub session: SessionConfig,
}

/// Events emitted during streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateEvent {
    /// A new piece of text.
    Token(String),
    /// Generation finished.
    Done {
        finish_reason: StopReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// Generation aborted.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// End-of-generation token.
    Stop,
    /// Output limit or step budget.
    Length,
    /// The stop flag was set.
    Cancelled,
}

impl From<FinishReason> for StopReason {
    fn from(r: FinishReason) -> Self {
        match r {
            FinishReason::EndOfGeneration => Self::Stop,
            FinishReason::Length => Self::Length,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Run a complete generation: clear memory, evaluate the prompt, then step
/// until the session ends, the step budget is spent or the receiver goes
/// away.
///
/// Intended for `tokio::task::spawn_blocking`.
pub fn generate_blocking<C, S>(
    runtime: &InferenceRuntime,
    ctx: &mut C,
    sampler: &mut S,
    request: &GenerateRequest,
    tx: mpsc::Sender<GenerateEvent>,
) where
    C: InferenceContext + ?Sized,
    S: TokenSampler<C> + ?Sized,
{
    let capacity = ctx.n_batch().min(MAX_BATCH_TOKENS as u32) as i32;
    let mut batch = match DecodeBatch::new(capacity, 0, 1) {
        Ok(b) => b,
        Err(e) => {
            let _ = tx.blocking_send(GenerateEvent::Error(format!("batch: {e}")));
            return;
        }
    };

    ctx.clear_memory();

    let mut session = GenerationSession::new(runtime, request.session.clone());
    let prompt_tokens =
        match session.init(ctx, &mut batch, &request.prompt, request.max_tokens) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.blocking_send(GenerateEvent::Error(format!("prompt: {e}")));
                return;
            }
        };

    let mut cursor = Position(prompt_tokens as i32);
    let done = |reason: StopReason, session: &GenerationSession<'_>| GenerateEvent::Done {
        finish_reason: reason,
        prompt_tokens: session.prompt_tokens() as u32,
        completion_tokens: session.generated_tokens() as u32,
    };

    for _ in 0..request.max_tokens.max(0) {
        match session.step(ctx, &mut batch, sampler, request.max_tokens, &mut cursor) {
            Ok(StepOutput::Text(text)) => {
                if tx.blocking_send(GenerateEvent::Token(text)).is_err() {
                    debug!("Generation cancelled (receiver dropped)");
                    return;
                }
            }
            Ok(StepOutput::Pending) => {}
            Ok(StepOutput::Finished { reason, notice }) => {
                if let Some(notice) = notice {
                    let _ = tx.blocking_send(GenerateEvent::Token(notice));
                }
                let _ = tx.blocking_send(done(reason.into(), &session));
                return;
            }
            Ok(StepOutput::Cancelled) => {
                let _ = tx.blocking_send(done(StopReason::Cancelled, &session));
                return;
            }
            Err(e) => {
                warn!(error = %e, "Generation step failed");
                let _ = tx.blocking_send(GenerateEvent::Error(e.to_string()));
                return;
            }
        }
    }

    let _ = tx.blocking_send(done(StopReason::Length, &session));
}
