use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use uni_chat_shared::{ChatMessage, Role};

use crate::error::StreamError;

pub const DEFAULT_LOG_DIR: &str = "conversation_logs";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Local>,
    pub session_id: String,
    pub entry_type: EntryType,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryType {
    UserMessage { id: String, content: String },
    AssistantMessage { id: String, content: String },
    TurnFailed { error: String },
}

/// Appends completed messages of one chat session to a JSONL transcript.
pub struct ConversationLogger {
    session_id: String,
    current_log_file: Option<PathBuf>,
}

impl ConversationLogger {
    pub fn new(log_dir: impl AsRef<Path>, session_id: &str) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        if !log_dir.exists() {
            fs::create_dir_all(log_dir)?;
        }

        let session_start = Local::now();
        let filename = format!(
            "conversation_{}_{}.jsonl",
            sanitize(session_id),
            session_start.format("%Y%m%d_%H%M%S")
        );
        let log_file = log_dir.join(filename);

        debug!("Starting conversation logger: {:?}", log_file);

        Ok(Self {
            session_id: session_id.to_string(),
            current_log_file: Some(log_file),
        })
    }

    /// Logger that records nothing, used when the transcript file cannot be
    /// created.
    pub fn disabled(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            current_log_file: None,
        }
    }

    /// Falls back to [`disabled`](Self::disabled) when the directory cannot
    /// be created.
    pub fn new_or_disabled(log_dir: impl AsRef<Path>, session_id: &str) -> Self {
        Self::new(log_dir, session_id).unwrap_or_else(|e| {
            error!("Failed to create conversation logger: {}", e);
            Self::disabled(session_id)
        })
    }

    pub fn log_entry(&self, entry_type: EntryType) -> Result<()> {
        if let Some(ref log_file) = self.current_log_file {
            let entry = ConversationEntry {
                timestamp: Local::now(),
                session_id: self.session_id.clone(),
                entry_type,
            };

            let json = serde_json::to_string(&entry)?;

            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;

            writeln!(file, "{}", json)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn log_message(&self, message: &ChatMessage) -> Result<()> {
        let entry_type = match message.role {
            Role::User => EntryType::UserMessage {
                id: message.id.clone(),
                content: message.content.clone(),
            },
            Role::Assistant => EntryType::AssistantMessage {
                id: message.id.clone(),
                content: message.content.clone(),
            },
        };
        self.log_entry(entry_type)
    }

    pub fn log_failure(&self, cause: &StreamError) -> Result<()> {
        self.log_entry(EntryType::TurnFailed {
            error: cause.to_string(),
        })
    }

    pub fn get_current_log_path(&self) -> Option<&Path> {
        self.current_log_file.as_deref()
    }
}

fn sanitize(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
