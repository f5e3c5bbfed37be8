//! Error types for the streaming client

use thiserror::Error;
use uni_chat_shared::FrameError;

/// Result type alias for streaming client operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Everything that can end a turn, plus the synchronous rejections of
/// [`StreamingSession::start`](crate::client::StreamingSession::start).
///
/// Turn failures are reported once through
/// [`StreamObserver::on_error`](crate::observer::StreamObserver::on_error) and
/// are cloned into [`StreamState::Error`](crate::client::StreamState::Error),
/// hence the string payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("message must not be empty")]
    EmptyMessage,

    #[error("no Tokio runtime is running on this thread")]
    NoRuntime,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StreamError {
    /// True for the errors `start` returns before touching any connection.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            StreamError::EmptySessionId | StreamError::EmptyMessage | StreamError::NoRuntime
        )
    }
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        StreamError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::Transport(err.to_string())
    }
}
