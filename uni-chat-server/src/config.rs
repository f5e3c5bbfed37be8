use crate::error::{Result, ServerError};
use std::net::SocketAddr;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the user's question.";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub model: String,
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.groq.com/openai/v1`.
    pub api_base: Option<String>,
    pub system_prompt: String,
}

impl ServerConfig {
    /// Reads `HOST`, `PORT`, `OPENAI_API_KEY`, `OPENAI_MODEL`,
    /// `OPENAI_BASE_URL` and `UNI_CHAT_SYSTEM_PROMPT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ServerError::Config(format!("{name} must be set")))
        };

        let port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|e| ServerError::Config(format!("PORT={port}: {e}")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            api_key: required("OPENAI_API_KEY")?,
            model: required("OPENAI_MODEL")?,
            api_base: lookup("OPENAI_BASE_URL").filter(|url| !url.trim().is_empty()),
            system_prompt: lookup("UNI_CHAT_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ServerError::Config(format!("{}:{}: {e}", self.host, self.port)))
    }
}
