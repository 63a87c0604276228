//! Incremental text completion over a [`DecodeBatch`].
//!
//! A session evaluates the prompt once ([`GenerationSession::init`]) and then
//! produces output one sampled token at a time ([`GenerationSession::step`]).
//! The host owns the position cursor and drives the loop.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batch::DecodeBatch;
use crate::engine::{InferenceContext, PositionCursor, TokenSampler};
use crate::error::{BridgeError, Result};
use crate::runtime::InferenceRuntime;
use crate::utf8::Utf8Assembler;

//  Configuration

/// Who gets to see the truncation notice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeScope {
    /// The first length-limited end of every session.
    #[default]
    Session,
    /// Only the first length-limited end in the process.
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Recognise control tokens written in the prompt text.
    #[serde(default = "default_parse_special")]
    pub parse_special: bool,
    #[serde(default)]
    pub notice_scope: NoticeScope,
    /// Text emitted when generation stops at the length limit.
    #[serde(default = "default_truncation_notice")]
    pub truncation_notice: String,
    /// Cap on buffered bytes awaiting a complete character. `None` means
    /// unbounded.
    #[serde(default)]
    pub max_pending_bytes: Option<usize>,
}

fn default_parse_special() -> bool {
    true
}

fn default_truncation_notice() -> String {
    "(Output limit reached, truncated!)".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parse_special: default_parse_special(),
            notice_scope: NoticeScope::default(),
            truncation_notice: default_truncation_notice(),
            max_pending_bytes: None,
        }
    }
}

//  States and outputs

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PromptEvaluated,
    Generating,
    Ended(FinishReason),
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// The position cursor reached the output limit.
    Length,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfGeneration => write!(f, "stop"),
            Self::Length => write!(f, "length"),
        }
    }
}

/// Result of one [`GenerationSession::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// One or more complete characters.
    Text(String),
    /// Bytes were buffered but do not form a complete character yet. Call
    /// `step` again.
    Pending,
    /// Generation is over. `notice` carries the truncation notice the first
    /// time a length limit ends generation (per [`NoticeScope`]).
    Finished {
        reason: FinishReason,
        notice: Option<String>,
    },
    /// The stop flag was observed.
    Cancelled,
}

//  Session

pub struct GenerationSession<'rt> {
    runtime: &'rt InferenceRuntime,
    config: SessionConfig,
    assembler: Utf8Assembler,
    state: SessionState,
    notice_sent: bool,
    prompt_tokens: usize,
    generated: usize,
}

impl<'rt> GenerationSession<'rt> {
    pub fn new(runtime: &'rt InferenceRuntime, config: SessionConfig) -> Self {
        let assembler = Utf8Assembler::with_limit(config.max_pending_bytes);
        Self {
            runtime,
            config,
            assembler,
            state: SessionState::Created,
            notice_sent: false,
            prompt_tokens: 0,
            generated: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Tokens sampled and accepted so far.
    pub fn generated_tokens(&self) -> usize {
        self.generated
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Tokenize and evaluate `prompt`, reserving `max_output_length`
    /// positions of the context for output. Returns the number of prompt
    /// tokens placed in the batch, which seeds the host's position cursor.
    pub fn init<C>(
        &mut self,
        ctx: &mut C,
        batch: &mut DecodeBatch,
        prompt: &str,
        max_output_length: i32,
    ) -> Result<usize>
    where
        C: InferenceContext + ?Sized,
    {
        if self.state != SessionState::Created {
            warn!(state = ?self.state, "init called on a used session");
            return Err(BridgeError::AlreadyInitialized);
        }
        self.assembler.clear();

        let mut tokens = ctx.tokenize(prompt, true, self.config.parse_special)?;
        if tokens.is_empty() {
            self.state = SessionState::Failed;
            return Err(BridgeError::EmptyPrompt);
        }

        let n_ctx = ctx.n_ctx();
        let n_batch = ctx.n_batch();

        let max_input_tokens = i64::from(n_ctx) - i64::from(max_output_length);
        if max_input_tokens <= 0 {
            error!(max_output_length, n_ctx, "No space for input tokens");
            self.state = SessionState::Failed;
            return Err(BridgeError::NoRoomForInput {
                max_output: max_output_length,
                n_ctx,
            });
        }

        if tokens.len() as i64 > max_input_tokens {
            info!(
                input_tokens = tokens.len(),
                max_input_tokens, "Input exceeds the input budget, truncating to fit"
            );
            tokens.truncate(max_input_tokens as usize);
        }

        let n_kv_req = tokens.len() as i64 + i64::from(max_output_length);
        info!(
            n_len = max_output_length,
            n_ctx,
            n_batch,
            n_kv_req,
            input_tokens = tokens.len(),
            max_input_tokens,
            "Prompt sizing"
        );

        if n_kv_req > i64::from(n_ctx) {
            self.state = SessionState::Failed;
            return Err(BridgeError::KvCacheTooSmall {
                required: n_kv_req as usize,
                n_ctx,
            });
        }
        if tokens.len() > n_batch as usize {
            self.state = SessionState::Failed;
            return Err(BridgeError::BatchSizeExceeded {
                tokens: tokens.len(),
                n_batch,
            });
        }

        if tokens.len() > batch.capacity() {
            self.state = SessionState::Failed;
            return Err(BridgeError::BatchCapacityExceeded {
                tokens: tokens.len(),
                capacity: batch.capacity(),
            });
        }

        for &id in &tokens {
            debug!(
                token = id,
                piece = %String::from_utf8_lossy(&ctx.token_to_bytes(id)),
                "prompt token"
            );
        }

        batch.clear();
        let last = tokens.len() - 1;
        for (i, &id) in tokens.iter().enumerate() {
            if let Err(e) = batch.append(id, i as i32, &[0], i == last) {
                self.state = SessionState::Failed;
                return Err(e);
            }
        }

        if let Err(e) = ctx.decode(batch) {
            error!(error = %e, "llama_decode() failed on the prompt");
            self.state = SessionState::Failed;
            return Err(e);
        }

        self.prompt_tokens = tokens.len();
        self.state = SessionState::PromptEvaluated;
        Ok(tokens.len())
    }

    /// Sample, detokenize and re-feed one token.
    ///
    /// `Err` means the session failed (decode error, broken cursor or
    /// buffer overflow); it must not be stepped again.
    pub fn step<C, S, P>(
        &mut self,
        ctx: &mut C,
        batch: &mut DecodeBatch,
        sampler: &mut S,
        max_output_length: i32,
        cursor: &mut P,
    ) -> Result<StepOutput>
    where
        C: InferenceContext + ?Sized,
        S: TokenSampler<C> + ?Sized,
        P: PositionCursor + ?Sized,
    {
        match self.state {
            SessionState::Failed | SessionState::Created => {
                return Err(BridgeError::SessionFailed);
            }
            SessionState::Ended(reason) => {
                return Ok(StepOutput::Finished {
                    reason,
                    notice: None,
                });
            }
            SessionState::PromptEvaluated | SessionState::Generating | SessionState::Cancelled => {}
        }

        let runtime = self.runtime;
        let cancel = runtime.cancellation();
        if cancel.is_cancelled() {
            return Ok(self.cancelled());
        }
        self.state = SessionState::Generating;

        let token = sampler.sample(ctx);
        let piece = ctx.token_to_bytes(token);
        let current = self.guard(cursor.get())?;

        let end_eog = ctx.is_eog(token);
        let end_length = current == max_output_length;
        if end_eog || end_length {
            debug!(
                end_eog,
                end_length,
                position = current,
                max_output_length,
                token,
                "Generation finished"
            );
            let reason = if end_eog {
                FinishReason::EndOfGeneration
            } else {
                FinishReason::Length
            };
            self.state = SessionState::Ended(reason);
            let notice = if reason == FinishReason::Length && self.claim_notice() {
                Some(self.config.truncation_notice.clone())
            } else {
                None
            };
            return Ok(StepOutput::Finished { reason, notice });
        }

        let output = match self.assembler.push(&piece) {
            Ok(Some(text)) => StepOutput::Text(text),
            Ok(None) => {
                debug!(
                    pending = self.assembler.pending().len(),
                    "Incomplete UTF-8 sequence, accumulating"
                );
                StepOutput::Pending
            }
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e);
            }
        };
        self.generated += 1;

        batch.clear();
        let appended = batch.append(token, current, &[0], true);
        self.guard(appended)?;
        let incremented = cursor.increment();
        self.guard(incremented)?;

        if cancel.is_cancelled() {
            return Ok(self.cancelled());
        }

        if let Err(e) = ctx.decode(batch) {
            error!(error = %e, "llama_decode() failed in completion loop");
            self.state = SessionState::Failed;
            return Err(e);
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled());
        }

        Ok(output)
    }

    fn cancelled(&mut self) -> StepOutput {
        debug!("Stop flag set; leaving completion loop");
        self.state = SessionState::Cancelled;
        StepOutput::Cancelled
    }

    fn guard<T>(&mut self, r: Result<T>) -> Result<T> {
        if r.is_err() {
            self.state = SessionState::Failed;
        }
        r
    }

    fn claim_notice(&mut self) -> bool {
        match self.config.notice_scope {
            NoticeScope::Session => !std::mem::replace(&mut self.notice_sent, true),
            NoticeScope::Process => self.runtime.claim_notice(),
        }
    }
}
