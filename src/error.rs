use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for stream chain operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that flow through a stream chain.
///
/// One error is delivered to every member of a chain, so the type is
/// cheaply cloneable.
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// A stage's processing logic failed
    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// An underlying I/O operation failed
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// A chunk was written after `end()`
    #[error("write after end")]
    WriteAfterEnd,

    /// A chunk was pushed after end-of-stream
    #[error("stream.push() after EOF")]
    PushAfterEof,

    /// A chunk did not match the mode of the side that received it
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The node was dropped before it finished or failed
    #[error("stream dropped before settling")]
    Abandoned,
}

impl StreamError {
    /// Shorthand for a stage failure
    pub fn stage(stage: impl Into<String>, message: impl ToString) -> Self {
        StreamError::Stage {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// The underlying I/O error kind, if this is an I/O error
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            StreamError::Io(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Config(err.to_string())
    }
}
