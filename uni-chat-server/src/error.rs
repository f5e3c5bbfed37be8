//! Error types for the streaming server

use async_openai::error::OpenAIError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<OpenAIError> for ServerError {
    fn from(err: OpenAIError) -> Self {
        ServerError::Llm(describe_openai_error(&err))
    }
}

pub fn describe_openai_error(err: &OpenAIError) -> String {
    match err {
        OpenAIError::ApiError(api_err) => format!(
            "API error: {} (code: {:?}, type: {:?})",
            api_err.message, api_err.code, api_err.r#type
        ),
        other => other.to_string(),
    }
}
