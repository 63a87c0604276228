use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid batch parameters: n_tokens={capacity}, n_seq_max={max_sequences}")]
    InvalidBatchParams { capacity: i32, max_sequences: i32 },

    #[error("Batch parameter {name} too large: {value} (max: {max})")]
    BatchTooLarge {
        name: &'static str,
        value: i32,
        max: i32,
    },

    #[error("Invalid embedding width: {0}")]
    InvalidEmbeddingWidth(i32),

    #[error("Failed to allocate batch {0} array")]
    AllocationFailed(&'static str),

    #[error("Batch is full (capacity {0})")]
    BatchFull(usize),

    #[error("Token sequence list too long: {len} ids (max per token: {max})")]
    TooManySequences { len: usize, max: usize },

    #[error("Embedding width mismatch: expected {expected}, got {actual}")]
    EmbeddingWidth { expected: usize, actual: usize },

    #[error("Batch holds {expected}, cannot append {actual}")]
    BatchKind {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("n_len({max_output}) >= n_ctx({n_ctx}), no space for input tokens")]
    NoRoomForInput { max_output: i32, n_ctx: u32 },

    #[error("n_kv_req({required}) > n_ctx({n_ctx}), the required KV cache size is not big enough")]
    KvCacheTooSmall { required: usize, n_ctx: u32 },

    #[error("input_tokens({tokens}) > n_batch({n_batch})")]
    BatchSizeExceeded { tokens: usize, n_batch: u32 },

    #[error("input_tokens({tokens}) > batch capacity({capacity})")]
    BatchCapacityExceeded { tokens: usize, capacity: usize },

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Decode failed with code {0}")]
    DecodeFailed(i32),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Pending fragment buffer overflow ({0} bytes)")]
    PendingOverflow(usize),

    #[error("Session is no longer usable after a decode failure")]
    SessionFailed,

    #[error("Session already initialised")]
    AlreadyInitialized,

    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Sampler error: {0}")]
    SamplerError(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
