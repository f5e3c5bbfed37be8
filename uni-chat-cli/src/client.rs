use crate::config::ClientConfig;
use crate::error::{Result, StreamError};
use crate::observer::{ChannelObserver, StreamEvent, StreamObserver};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;
use uni_chat_shared::{new_id, ChatMessage, InboundFrame, MessageId, OutboundFrame, Role};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    Idle,
    Connecting {
        session_id: String,
    },
    Streaming {
        session_id: String,
        partial: String,
    },
    /// Held only while `on_error` runs.
    Error(StreamError),
}

impl StreamState {
    pub fn is_idle(&self) -> bool {
        matches!(self, StreamState::Idle)
    }
}

struct Shared {
    /// Bumped on every cancel; a turn only touches state or fires callbacks
    /// while its own generation is current.
    generation: u64,
    state: StreamState,
    last_activity: Instant,
    task: Option<JoinHandle<()>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs one streamed turn at a time against `/ws/chat/{session_id}`.
///
/// Each [`start`](Self::start) opens a fresh connection, sends the user
/// message once the socket is open, forwards fragments to the observer and
/// flushes them as one assistant [`ChatMessage`] when the server sends
/// `{"end": true}`. Starting again, [`stop`](Self::stop), or dropping the
/// session cancels the live turn without any further callback.
pub struct StreamingSession {
    config: ClientConfig,
    observer: Arc<dyn StreamObserver>,
    shared: Arc<Mutex<Shared>>,
}

impl StreamingSession {
    pub fn new(config: ClientConfig, observer: impl StreamObserver) -> Self {
        Self {
            config,
            observer: Arc::new(observer),
            shared: Arc::new(Mutex::new(Shared {
                generation: 0,
                state: StreamState::Idle,
                last_activity: Instant::now(),
                task: None,
            })),
        }
    }

    /// Session wired to a [`ChannelObserver`].
    pub fn with_channel(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (observer, rx) = ChannelObserver::new();
        (Self::new(config, observer), rx)
    }

    /// Starts a turn and returns the id the assistant reply will carry.
    ///
    /// Blank arguments are rejected before anything else happens, so a live
    /// turn keeps running. Otherwise the live turn is cancelled first.
    pub fn start(&mut self, session_id: &str, message: &str) -> Result<MessageId> {
        if session_id.trim().is_empty() {
            return Err(StreamError::EmptySessionId);
        }
        if message.trim().is_empty() {
            return Err(StreamError::EmptyMessage);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| StreamError::NoRuntime)?;
        let url = self.config.chat_url(session_id)?;
        let request = serde_json::to_string(&OutboundFrame::new(message))
            .map_err(|e| StreamError::Protocol(format!("failed to serialize request: {e}")))?;

        let message_id = new_id();
        let mut shared = lock(&self.shared);
        if cancel(&mut shared) {
            info!("Cancelled previous turn to start a new one");
        }
        shared.state = StreamState::Connecting {
            session_id: session_id.to_string(),
        };
        shared.last_activity = Instant::now();

        let turn = Turn {
            generation: shared.generation,
            session_id: session_id.to_string(),
            message_id: message_id.clone(),
            shared: self.shared.clone(),
            observer: self.observer.clone(),
        };
        debug!("Starting turn {} for session {}", message_id, session_id);
        shared.task = Some(runtime.spawn(run_turn(
            turn,
            url,
            request,
            self.config.connect_timeout,
            self.config.idle_timeout,
        )));

        Ok(message_id)
    }

    /// Cancels the live turn, if any. Never fires a callback.
    pub fn stop(&mut self) {
        let mut shared = lock(&self.shared);
        if cancel(&mut shared) {
            info!("Stopped active turn");
        }
    }

    /// Records user activity, pushing back the idle timeout.
    pub fn touch(&self) {
        lock(&self.shared).last_activity = Instant::now();
    }

    pub fn state(&self) -> StreamState {
        lock(&self.shared).state.clone()
    }

    pub fn is_active(&self) -> bool {
        !lock(&self.shared).state.is_idle()
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        cancel(&mut lock(&self.shared));
    }
}

/// Returns whether a turn was live.
fn cancel(shared: &mut Shared) -> bool {
    shared.generation += 1;
    if let Some(task) = shared.task.take() {
        task.abort();
    }
    let was_live = !shared.state.is_idle();
    shared.state = StreamState::Idle;
    was_live
}

struct Turn {
    generation: u64,
    session_id: String,
    message_id: MessageId,
    shared: Arc<Mutex<Shared>>,
    observer: Arc<dyn StreamObserver>,
}

impl Turn {
    /// Runs `f` under the lock if this turn has not been cancelled.
    /// Callbacks fire inside `f`, which serializes them against each other
    /// and against `start`/`stop`.
    fn if_live<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> Option<R> {
        let mut shared = lock(&self.shared);
        if shared.generation == self.generation {
            Some(f(&mut shared))
        } else {
            None
        }
    }

    fn opened(&self) -> bool {
        self.if_live(|shared| {
            shared.state = StreamState::Streaming {
                session_id: self.session_id.clone(),
                partial: String::new(),
            };
        })
        .is_some()
    }

    fn token(&self, fragment: &str) -> bool {
        self.if_live(|shared| {
            if let StreamState::Streaming { partial, .. } = &mut shared.state {
                partial.push_str(fragment);
            }
            self.observer.on_token(fragment);
        })
        .is_some()
    }

    fn finish(&self) {
        self.if_live(|shared| {
            let content = match std::mem::replace(&mut shared.state, StreamState::Idle) {
                StreamState::Streaming { partial, .. } => partial,
                _ => String::new(),
            };
            shared.task = None;
            let message = ChatMessage::with_id(self.message_id.clone(), Role::Assistant, content);
            info!(
                "Turn {} completed ({} chars)",
                self.message_id,
                message.content.len()
            );
            self.observer.on_end(&message);
        });
    }

    fn fail(&self, cause: StreamError) {
        self.if_live(|shared| {
            error!("Turn {} failed: {}", self.message_id, cause);
            shared.state = StreamState::Error(cause.clone());
            shared.task = None;
            self.observer.on_error(&cause);
            shared.state = StreamState::Idle;
        });
    }

    /// Closes the turn after inactivity, like `stop`.
    fn expire(&self) {
        self.if_live(|shared| {
            shared.state = StreamState::Idle;
            shared.task = None;
        });
    }

    fn idle_deadline(&self, idle_timeout: Option<Duration>) -> Option<Instant> {
        idle_timeout.map(|timeout| lock(&self.shared).last_activity + timeout)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_turn(
    turn: Turn,
    url: Url,
    request: String,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
) {
    debug!("Attempting to connect to {}", url);

    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await
    {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            turn.fail(StreamError::Transport(format!("failed to connect to {url}: {e}")));
            return;
        }
        Err(_) => {
            turn.fail(StreamError::Transport(format!(
                "connection to {url} did not open within {connect_timeout:?}"
            )));
            return;
        }
    };

    if !turn.opened() {
        return;
    }
    debug!("Connected to backend for session {}", turn.session_id);

    let (mut write, mut read) = ws_stream.split();
    if let Err(e) = write.send(Message::Text(request)).await {
        turn.fail(StreamError::Transport(format!("failed to send message: {e}")));
        return;
    }
    debug!("Request sent successfully");

    loop {
        let deadline = turn.idle_deadline(idle_timeout);
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match InboundFrame::decode(&text) {
                        Ok(InboundFrame::Token(fragment)) => {
                            if !turn.token(&fragment) {
                                break;
                            }
                        }
                        Ok(InboundFrame::End) => {
                            turn.finish();
                            break;
                        }
                        Ok(InboundFrame::Error(payload)) => {
                            turn.fail(StreamError::Backend(payload));
                            break;
                        }
                        Err(e) => {
                            warn!("Failed to parse frame: {}", e);
                            warn!("Raw text was: {}", text);
                            turn.fail(e.into());
                            break;
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        turn.fail(StreamError::Protocol("unexpected binary frame".to_string()));
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("WebSocket connection closed");
                        turn.fail(StreamError::Transport(
                            "connection closed before end of stream".to_string(),
                        ));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        turn.fail(e.into());
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                if turn.idle_deadline(idle_timeout).is_some_and(|d| d <= Instant::now()) {
                    info!("Closing idle connection for session {}", turn.session_id);
                    turn.expire();
                    break;
                }
            }
        }
    }

    if let Err(e) = write.close().await {
        debug!("Close handshake did not complete: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::StreamEvent;

    #[test]
    fn start_rejects_blank_arguments() {
        let (mut session, _rx) = StreamingSession::with_channel(ClientConfig::default());
        assert_eq!(session.start("", "hello"), Err(StreamError::EmptySessionId));
        assert_eq!(session.start("  ", "hello"), Err(StreamError::EmptySessionId));
        assert_eq!(session.start("s1", ""), Err(StreamError::EmptyMessage));
        assert_eq!(session.start("s1", " \n"), Err(StreamError::EmptyMessage));
        assert!(session.state().is_idle());
    }

    #[test]
    fn start_outside_runtime_fails_fast() {
        let (mut session, mut rx) = StreamingSession::with_channel(ClientConfig::default());
        assert_eq!(session.start("s1", "hello"), Err(StreamError::NoRuntime));
        assert!(session.state().is_idle());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let (mut session, mut rx) = StreamingSession::with_channel(ClientConfig::default());
        session.stop();
        session.stop();
        assert_eq!(session.state(), StreamState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_turn_cannot_fire_callbacks() {
        let (mut session, mut rx) = StreamingSession::with_channel(ClientConfig::default());
        let shared = session.shared.clone();
        let generation = lock(&shared).generation;
        let turn = Turn {
            generation,
            session_id: "s1".to_string(),
            message_id: new_id(),
            shared,
            observer: session.observer.clone(),
        };
        assert!(turn.opened());
        assert!(turn.token("a"));

        session.stop();
        assert!(!turn.token("b"));
        turn.finish();
        turn.fail(StreamError::Backend("late".to_string()));

        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Token("a".to_string()));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn finish_flushes_buffer_into_message() {
        let (session, mut rx) = StreamingSession::with_channel(ClientConfig::default());
        let message_id = new_id();
        let turn = Turn {
            generation: 0,
            session_id: "s1".to_string(),
            message_id: message_id.clone(),
            shared: session.shared.clone(),
            observer: session.observer.clone(),
        };
        turn.opened();
        turn.token("Hi");
        turn.token(" there");
        assert_eq!(
            session.state(),
            StreamState::Streaming {
                session_id: "s1".to_string(),
                partial: "Hi there".to_string(),
            }
        );
        turn.finish();

        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            StreamEvent::End(message) => {
                assert_eq!(message.id, message_id);
                assert_eq!(message.role, Role::Assistant);
                assert_eq!(message.content, "Hi there");
            }
            other => panic!("expected end, got {other:?}"),
        }
        assert!(session.state().is_idle());
    }
}
