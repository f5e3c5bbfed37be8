use crate::error::{Result, StreamError};
use std::time::Duration;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/chat";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Connection settings for [`StreamingSession`](crate::client::StreamingSession).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base of the per-session endpoint; the session id is appended as the
    /// last path segment.
    pub endpoint: Url,
    pub connect_timeout: Duration,
    /// Closes a live connection after this long without user activity.
    /// `None` keeps connections open until the turn ends.
    pub idle_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::default().with_endpoint(endpoint)
    }

    /// Reads `UNI_CHAT_WS_URL`, `UNI_CHAT_CONNECT_TIMEOUT_SECS` and
    /// `UNI_CHAT_IDLE_TIMEOUT_SECS` (`0` disables the idle timeout). Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |name: &str| -> Result<Option<u64>> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|e| StreamError::Config(format!("{name}={value}: {e}")))
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(url) = lookup("UNI_CHAT_WS_URL") {
            config = config.with_endpoint(&url)?;
        }
        if let Some(secs) = secs("UNI_CHAT_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = secs("UNI_CHAT_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = idle_timeout_from_secs(secs);
        }

        Ok(config)
    }

    /// Replaces the endpoint, which must be a `ws://` or `wss://` URL.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = parse_endpoint(endpoint)?;
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// URL of the streaming endpoint for one chat session.
    pub fn chat_url(&self, session_id: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StreamError::Config(format!("{} cannot take a path", self.endpoint)))?
            .pop_if_empty()
            .push(session_id);
        Ok(url)
    }
}

pub fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| StreamError::Config(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(StreamError::Config(format!(
            "{raw}: expected a ws:// or wss:// URL, got {other}://"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn unset_environment_keeps_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.endpoint.as_str(), DEFAULT_ENDPOINT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
    }

    #[test]
    fn environment_overrides_every_setting() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("UNI_CHAT_WS_URL", "wss://chat.example.com/ws/chat"),
            ("UNI_CHAT_CONNECT_TIMEOUT_SECS", " 5 "),
            ("UNI_CHAT_IDLE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint.as_str(), "wss://chat.example.com/ws/chat");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn bad_environment_values_are_config_errors() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("UNI_CHAT_CONNECT_TIMEOUT_SECS", "soon")])),
            Err(StreamError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[("UNI_CHAT_WS_URL", "http://127.0.0.1:8000")])),
            Err(StreamError::Config(_))
        ));
    }

    #[test]
    fn chat_url_appends_session_segment() {
        let config = ClientConfig::default();
        assert_eq!(
            config.chat_url("42").unwrap().as_str(),
            "ws://127.0.0.1:8000/ws/chat/42"
        );
    }

    #[test]
    fn chat_url_tolerates_trailing_slash_and_encodes_id() {
        let config = ClientConfig::new("wss://chat.example.com/ws/chat/").unwrap();
        assert_eq!(
            config.chat_url("a b/c").unwrap().as_str(),
            "wss://chat.example.com/ws/chat/a%20b%2Fc"
        );
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        assert!(matches!(
            ClientConfig::new("http://127.0.0.1:8000/ws/chat"),
            Err(StreamError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::new("not a url"),
            Err(StreamError::Config(_))
        ));
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        assert_eq!(idle_timeout_from_secs(0), None);
        assert_eq!(idle_timeout_from_secs(90), Some(Duration::from_secs(90)));
    }
}
