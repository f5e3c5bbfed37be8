use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uni_chat_shared::{ChatMessage, Role};

use crate::config::ServerConfig;
use crate::error::{describe_openai_error, Result};

/// One piece of a streamed reply. The channel closing after the last
/// `Token` means the reply is complete.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyChunk {
    Token(String),
    Failed(String),
}

/// Source of assistant replies for the WebSocket endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Starts streaming a reply to `history`, whose last entry is the new
    /// user message.
    async fn stream_reply(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<mpsc::UnboundedReceiver<ReplyChunk>>;

    fn model(&self) -> &str;
}

/// [`ChatBackend`] over any OpenAI-compatible chat completions API.
pub struct LlmService {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: String,
}

impl LlmService {
    pub fn new(config: &ServerConfig) -> Self {
        info!("Initializing LLM service with model: {}", config.model);
        let mut openai = OpenAIConfig::new().with_api_key(config.api_key.clone());
        if let Some(api_base) = &config.api_base {
            info!("Using API base: {}", api_base);
            openai = openai.with_api_base(api_base.clone());
        }
        Self {
            client: Client::with_config(openai),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        }
    }

    fn build_messages(&self, history: Vec<ChatMessage>) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::with_capacity(1 + history.len());
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.system_prompt.clone())
                .build()?,
        ));
        for msg in history {
            messages.push(convert_to_openai_message(msg)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChatBackend for LlmService {
    async fn stream_reply(
        &self,
        history: Vec<ChatMessage>,
    ) -> Result<mpsc::UnboundedReceiver<ReplyChunk>> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.build_messages(history)?)
            .temperature(0.0)
            .stream(true)
            .build()?;

        debug!("Requesting completion with {} messages", request.messages.len());

        let mut stream = self.client.chat().create_stream(request).await.map_err(|e| {
            error!("Failed to create completion stream: {:?}", e);
            e
        })?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(response) => {
                        let Some(delta) = response
                            .choices
                            .first()
                            .and_then(|choice| choice.delta.content.clone())
                        else {
                            continue;
                        };
                        if delta.is_empty() {
                            continue;
                        }
                        if tx.send(ReplyChunk::Token(delta)).is_err() {
                            debug!("Reply receiver dropped, abandoning stream");
                            return;
                        }
                    }
                    Err(e) => {
                        let message = describe_openai_error(&e);
                        error!("Completion stream error: {}", message);
                        let _ = tx.send(ReplyChunk::Failed(message));
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn convert_to_openai_message(msg: ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let message = match msg.role {
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(msg.content)
                .build()?,
        ),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> LlmService {
        LlmService::new(&ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            api_base: Some("http://127.0.0.1:9/v1".to_string()),
            system_prompt: "Be brief.".to_string(),
        })
    }

    #[test]
    fn system_prompt_leads_the_history() {
        let messages = service()
            .build_messages(vec![
                ChatMessage::user("hello"),
                ChatMessage::assistant("Hi there"),
                ChatMessage::user("bye"),
            ])
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn reports_configured_model() {
        assert_eq!(service().model(), "test-model");
    }
}
