//! Error types for Flock operations

use thiserror::Error;

/// Argument and input validation errors.
///
/// Raised synchronously at bind or operation time and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{function} requires 2 arguments: (1) model, (2) prompt with context_columns. Got {got}")]
    ArgumentCount { function: String, got: usize },

    #[error("{function}: {reason}")]
    InvalidArgument { function: String, reason: String },

    #[error("Unexpected key in 'context_columns': {key}")]
    UnexpectedContextKey { key: String },

    #[error("Expected 'context_columns' to contain key: {key}")]
    MissingContextKey { key: String },

    #[error("Missing 'context_columns' in second argument. The prompt struct must include context_columns.")]
    MissingContextColumns,

    #[error("Unsupported column type '{value}'")]
    UnsupportedColumnType { value: String },

    #[error("Argument 'transcription_model' is not supported for data type '{data_type}'. It can only be used with type 'audio'.")]
    TranscriptionModelNotSupported { data_type: String },

    #[error("Argument 'transcription_model' is required when type is 'audio'.")]
    TranscriptionModelRequired,

    #[error("The prompt cannot be empty")]
    EmptyPrompt,

    #[error("The prompt details struct should contain a single key value pair of prompt or prompt_name with prompt version")]
    InvalidPromptDetails,

    #[error("Image embedding is not supported yet. Please use text data for embedding.")]
    ImageEmbeddingUnsupported,

    #[error("Unexpected key in inputs: {key}")]
    UnexpectedInputKey { key: String },
}

/// Configuration and storage lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Model not found: {model_name}")]
    ModelNotFound { model_name: String },

    #[error("The provided `{prompt_name}` prompt {detail}")]
    PromptNotFound { prompt_name: String, detail: String },

    #[error("Secret not found: {secret_name}")]
    SecretNotFound { secret_name: String },

    #[error("Unsupported provider: {provider}")]
    ProviderNotSupported { provider: String },

    #[error("Invalid tuple format provided `{value}`")]
    InvalidTupleFormat { value: String },
}

/// LLM provider and transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// The one retriable condition: the provider refused to emit the full
    /// response because it would exceed the configured output length.
    #[error("The response exceeded the max_output_tokens length; increase your max_output_tokens parameter.")]
    OutputLengthExceeded,

    #[error("No LLM provider configured for {provider}")]
    ProviderNotConfigured { provider: String },

    #[error("[ModelProvider] error. Reason: request to {provider} failed: {message}")]
    RequestFailed { provider: String, message: String },

    #[error("[ModelProvider] error. Reason: invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Expected {expected} responses from provider, got {got}")]
    ResponseCountMismatch { expected: usize, got: usize },
}

/// Semantically malformed provider output (bad ids in rankings and selections).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Invalid LLM response: The LLM returned ID '{id}' which is not a valid flock_row_id.")]
    UnknownRowId { id: String },

    #[error("Invalid LLM response: The LLM returned duplicate ID '{id}'.")]
    DuplicateRowId { id: String },

    #[error("Invalid LLM response: Expected integer or string ID, got: {value}")]
    UnexpectedIdType { value: String },

    #[error("Invalid LLM response: ranked {got} of {expected} rows")]
    IncompleteRanking { expected: usize, got: usize },

    #[error("Invalid LLM response: missing 'items' array")]
    MissingItems,

    #[error("Invalid LLM response: expected at least {expected} item(s), got {got}")]
    TooFewItems { expected: usize, got: usize },
}

/// Batch sizing errors raised by the splitter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("Batch size must be greater than zero")]
    NonPositive { configured: i64 },

    #[error("Batch size reduced to zero, unable to process tuples")]
    Exhausted,
}

/// Master error type for all Flock errors.
#[derive(Debug, Clone, Error)]
pub enum FlockError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Response error: {0}")]
    Response(#[from] ResponseError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),
}

impl FlockError {
    /// True for the provider overflow signal that the batch splitter may
    /// absorb by shrinking the batch.
    pub fn is_output_overflow(&self) -> bool {
        matches!(self, FlockError::Llm(LlmError::OutputLengthExceeded))
    }
}

/// Result type alias for Flock operations.
pub type FlockResult<T> = Result<T, FlockError>;

// =============================================================================
// TESTS
// =============================================================================
