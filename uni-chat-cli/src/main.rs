use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uni_chat_cli::config::idle_timeout_from_secs;
use uni_chat_cli::conversation_logger::{ConversationLogger, DEFAULT_LOG_DIR};
use uni_chat_cli::{ClientConfig, StreamError, StreamEvent, StreamState, StreamingSession};
use uni_chat_shared::{new_id, ChatMessage, ChatSession, MessageId};

#[derive(Debug, Parser)]
#[command(name = "uni-chat", about = "Chat with a Uni Chat backend from the terminal")]
struct Args {
    /// Chat session to talk to; a fresh id is generated when omitted
    #[arg(long, env = "UNI_CHAT_SESSION")]
    session: Option<String>,

    /// Base URL of the streaming endpoint [default: $UNI_CHAT_WS_URL or ws://127.0.0.1:8000/ws/chat]
    #[arg(long)]
    url: Option<String>,

    /// [default: $UNI_CHAT_CONNECT_TIMEOUT_SECS or 30]
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Close a live connection after this many seconds without input, 0 disables
    /// [default: $UNI_CHAT_IDLE_TIMEOUT_SECS or 300]
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    transcript_dir: PathBuf,

    #[arg(long, default_value = "uni-chat.log")]
    log_file: PathBuf,
}

impl Args {
    /// Environment settings with command-line flags taking precedence.
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_env().context("invalid UNI_CHAT_* environment")?;
        if let Some(url) = &self.url {
            config = config.with_endpoint(url)?;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout_secs {
            config = config.with_idle_timeout(idle_timeout_from_secs(secs));
        }
        Ok(config)
    }
}

struct App {
    chat: ChatSession,
    /// Assistant reply currently streaming, with the id it will be stored under.
    streaming_message: Option<(MessageId, String)>,
    logger: ConversationLogger,
    transcript_dir: PathBuf,
}

impl App {
    fn new(session_id: String, transcript_dir: PathBuf) -> Self {
        let logger = ConversationLogger::new_or_disabled(&transcript_dir, &session_id);
        if let Some(path) = logger.get_current_log_path() {
            info!("Logging conversation to: {:?}", path);
        }

        Self {
            chat: ChatSession::new(session_id),
            streaming_message: None,
            logger,
            transcript_dir,
        }
    }

    fn new_chat(&mut self) {
        *self = Self::new(new_id(), std::mem::take(&mut self.transcript_dir));
    }

    fn add_user_message(&mut self, content: String) {
        let message = ChatMessage::user(content);
        if let Err(e) = self.logger.log_message(&message) {
            error!("Failed to log user message: {}", e);
        }
        self.chat.push(message);
    }

    fn start_streaming(&mut self, message_id: MessageId) {
        self.streaming_message = Some((message_id, String::new()));
    }

    fn append_stream_chunk(&mut self, chunk: &str) {
        if let Some((_, ref mut text)) = self.streaming_message {
            text.push_str(chunk);
        }
    }

    fn finish_streaming(&mut self, message: ChatMessage) {
        let expected = self.streaming_message.take().map(|(id, _)| id);
        if expected.as_deref() != Some(message.id.as_str()) {
            return;
        }
        if let Err(e) = self.logger.log_message(&message) {
            error!("Failed to log assistant message: {}", e);
        }
        self.chat.push(message);
    }

    fn abort_streaming(&mut self, cause: &StreamError) {
        self.streaming_message = None;
        if let Err(e) = self.logger.log_failure(cause) {
            error!("Failed to log turn failure: {}", e);
        }
    }

    /// Drops a reply whose turn ended without an event, which only happens
    /// when the idle timeout closed it. Returns whether one was dropped.
    fn drop_expired_reply(&mut self, state: &StreamState) -> bool {
        if self.streaming_message.is_none() || !state.is_idle() {
            return false;
        }
        self.streaming_message = None;
        info!("Reply discarded after idle timeout");
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    // Log to a file so tracing output never interleaves with streamed text
    let log_file = std::fs::File::create(&args.log_file)
        .with_context(|| format!("failed to create log file {:?}", args.log_file))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let config = args.client_config()?;
    info!("Streaming endpoint: {}", config.endpoint);
    let (mut session, mut events) = StreamingSession::with_channel(config);

    let mut app = App::new(args.session.unwrap_or_else(new_id), args.transcript_dir);
    println!(
        "Session {}. Type a message, /stop to cancel a reply, /new for a new chat, /quit to exit.",
        app.chat.id
    );

    run_app(&mut app, &mut session, &mut events).await
}

async fn run_app(
    app: &mut App,
    session: &mut StreamingSession,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    session.stop();
                    return Ok(());
                };
                // A turn that went idle before this snapshot has queued its
                // terminal event already, unless the idle timeout ended it
                let state = session.state();
                while let Ok(event) = events.try_recv() {
                    handle_event(app, event)?;
                }
                if app.drop_expired_reply(&state) {
                    println!();
                    println!("[reply dropped after idle timeout]");
                }
                session.touch();
                let input = line.trim();
                match input {
                    "" => {}
                    "/quit" => {
                        session.stop();
                        return Ok(());
                    }
                    "/stop" => {
                        cancel_turn(session, events);
                        app.streaming_message = None;
                        println!("[stopped]");
                    }
                    "/new" => {
                        cancel_turn(session, events);
                        app.new_chat();
                        println!("Session {}", app.chat.id);
                    }
                    _ => {
                        if app.streaming_message.is_some() {
                            println!("[previous reply cancelled]");
                        }
                        cancel_turn(session, events);
                        app.add_user_message(input.to_string());
                        match session.start(&app.chat.id, input) {
                            Ok(message_id) => app.start_streaming(message_id),
                            Err(e) if e.is_caller_misuse() => eprintln!("Cannot send message: {e}"),
                            Err(e) => {
                                eprintln!("Streaming error: {e}");
                                app.abort_streaming(&e);
                            }
                        }
                    }
                }
            }
            Some(event) = events.recv() => handle_event(app, event)?,
        }
    }
}

fn handle_event(app: &mut App, event: StreamEvent) -> Result<()> {
    match event {
        StreamEvent::Token(fragment) => {
            app.append_stream_chunk(&fragment);
            print!("{fragment}");
            std::io::stdout().flush()?;
        }
        StreamEvent::End(message) => {
            println!();
            app.finish_streaming(message);
        }
        StreamEvent::Error(cause) => {
            println!();
            eprintln!("Streaming error: {cause}");
            app.abort_streaming(&cause);
        }
    }
    Ok(())
}

/// Stops the live turn and discards events it queued before stopping.
fn cancel_turn(session: &mut StreamingSession, events: &mut mpsc::UnboundedReceiver<StreamEvent>) {
    session.stop();
    while events.try_recv().is_ok() {}
}
