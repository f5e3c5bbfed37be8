//! Streaming client for the Uni Chat backend.
//!
//! [`StreamingSession`] drives one `/ws/chat/{session_id}` turn at a time and
//! reports it through a [`StreamObserver`].

pub mod client;
pub mod config;
pub mod conversation_logger;
pub mod error;
pub mod observer;

pub use client::{StreamState, StreamingSession};
pub use config::ClientConfig;
pub use error::{Result, StreamError};
pub use observer::{ChannelObserver, StreamEvent, StreamObserver};
