use thiserror::Error;
use tutorloop_core::StoreError;

/// Prompt assembly failed; the engine is never invoked.
#[derive(Debug, Error)]
pub enum FormattingError {
    #[error("message is empty after removing chat markers")]
    EmptyMessage,

    #[error("prompt is {len} chars, limit is {max}")]
    TooLong { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inference server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed stream event: {0}")]
    Decode(String),

    #[error("fragment consumer went away")]
    ConsumerClosed,

    #[error("generation task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Engine(String),
}

/// Failure while persisting streamed fragments.
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("failed to persist fragment: {0}")]
    Persist(#[source] StoreError),

    #[error("failed to finalize turn: {0}")]
    Finalize(#[source] StoreError),
}

/// Everything that can end a turn early.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Formatting error: {0}")]
    Formatting(#[from] FormattingError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A sweep of the prompt queue failed. Never fatal to the poll loop.
#[derive(Debug, Error)]
pub enum PollingError {
    #[error("failed to list pending prompts: {0}")]
    Query(#[source] StoreError),
}
