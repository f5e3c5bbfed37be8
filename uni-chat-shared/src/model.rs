use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Opaque identifier for messages and sessions.
pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(deserialize_with = "opaque_id")]
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_id(new_id(), Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_id(new_id(), Role::Assistant, content)
    }

    /// Builds a message around an id that was handed out earlier, e.g. the
    /// placeholder id of a reply that is still streaming.
    pub fn with_id(id: impl Into<MessageId>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    #[serde(deserialize_with = "opaque_id")]
    pub id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            messages: Vec::new(),
            created_at: Some(Utc::now()),
        }
    }

    /// Appends a completed message. An untitled session takes its title from
    /// the first user message.
    pub fn push(&mut self, message: ChatMessage) {
        if self.title.is_none() && message.role == Role::User {
            let title = message.content.trim();
            if !title.is_empty() {
                self.title = Some(title.to_string());
            }
        }
        self.messages.push(message);
    }
}

/// Per-user model configuration as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub id: i64,
    pub user_id: i64,
    pub provider_id: i64,
    pub model_name: String,
    #[serde(default)]
    pub config_params: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

pub fn new_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

// The backend hands out integer primary keys, the client generates strings.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(id) => id,
        RawId::Number(id) => id.to_string(),
    })
}
