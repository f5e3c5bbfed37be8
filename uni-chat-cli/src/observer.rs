//! Turn callbacks.
//!
//! A [`StreamingSession`](crate::client::StreamingSession) reports each turn
//! to a [`StreamObserver`]: zero or more [`on_token`](StreamObserver::on_token)
//! calls followed by exactly one of [`on_end`](StreamObserver::on_end) or
//! [`on_error`](StreamObserver::on_error). A cancelled turn reports nothing
//! further. Calls never overlap.

use crate::error::StreamError;
use tokio::sync::mpsc;
use uni_chat_shared::ChatMessage;

pub trait StreamObserver: Send + Sync + 'static {
    /// One fragment of the assistant reply, in arrival order.
    fn on_token(&self, fragment: &str);

    /// The reply finished; `message` holds every fragment concatenated.
    fn on_end(&self, message: &ChatMessage);

    /// The turn failed. Text received so far is discarded.
    fn on_error(&self, cause: &StreamError);
}

/// Tagged form of the observer callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    End(ChatMessage),
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End(_) | StreamEvent::Error(_))
    }
}

/// Forwards callbacks into an unbounded channel.
///
/// Events are sent while the turn is live, but a receiver that lags behind
/// may still hold events of a turn that was cancelled afterwards. Drain the
/// receiver before starting a new turn if that matters.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: StreamEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl StreamObserver for ChannelObserver {
    fn on_token(&self, fragment: &str) {
        self.send(StreamEvent::Token(fragment.to_string()));
    }

    fn on_end(&self, message: &ChatMessage) {
        self.send(StreamEvent::End(message.clone()));
    }

    fn on_error(&self, cause: &StreamError) {
        self.send(StreamEvent::Error(cause.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_preserves_order() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.on_token("Hi");
        observer.on_token(" there");
        let message = ChatMessage::assistant("Hi there");
        observer.on_end(&message);

        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Token("Hi".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Token(" there".to_string())
        );
        let last = rx.try_recv().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last, StreamEvent::End(message));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_error(&StreamError::Transport("gone".to_string()));
    }
}
