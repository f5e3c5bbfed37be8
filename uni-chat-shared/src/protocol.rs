//! Wire frames exchanged over the `/ws/chat/{session_id}` socket.
//!
//! The client sends one [`OutboundFrame`] per turn. The server answers with a
//! run of [`InboundFrame::Token`] frames closed by a single
//! [`InboundFrame::End`], or aborts the turn with [`InboundFrame::Error`].

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Request from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(alias = "query")]
    pub message: String,
}

impl OutboundFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One frame pushed by the server while a reply is streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Token(String),
    End,
    /// Backend failure. Object payloads are kept as compact JSON text.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("unexpected frame shape: {0}")]
    Shape(String),
}

impl InboundFrame {
    /// Parses one text frame, requiring exactly one of `token`, `end` or
    /// `error`. Unknown extra fields are ignored.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        raw.classify()
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InboundFrame::End | InboundFrame::Error(_))
    }
}

impl Serialize for InboundFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            InboundFrame::Token(token) => map.serialize_entry("token", token)?,
            InboundFrame::End => map.serialize_entry("end", &true)?,
            InboundFrame::Error(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

// `null` counts as absent.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    token: Option<Value>,
    #[serde(default)]
    end: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl RawFrame {
    fn classify(self) -> Result<InboundFrame, FrameError> {
        match (self.token, self.end, self.error) {
            (Some(Value::String(token)), None, None) => Ok(InboundFrame::Token(token)),
            (Some(other), None, None) => Err(FrameError::Shape(format!(
                "token must be a string, got {other}"
            ))),
            (None, Some(Value::Bool(true)), None) => Ok(InboundFrame::End),
            (None, Some(other), None) => Err(FrameError::Shape(format!(
                "end must be true, got {other}"
            ))),
            (None, None, Some(error)) if is_falsy(&error) => Err(FrameError::Shape(format!(
                "error must carry a message, got {error}"
            ))),
            (None, None, Some(Value::String(error))) => Ok(InboundFrame::Error(error)),
            (None, None, Some(other)) => Ok(InboundFrame::Error(other.to_string())),
            (None, None, None) => Err(FrameError::Shape(
                "expected one of token, end or error".to_string(),
            )),
            _ => Err(FrameError::Shape(
                "more than one of token, end or error is set".to_string(),
            )),
        }
    }
}

// `false`, `0` and `""` say nothing went wrong.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_each_frame_kind() {
        assert_eq!(
            InboundFrame::decode(r#"{"token":"Hi"}"#),
            Ok(InboundFrame::Token("Hi".to_string()))
        );
        assert_eq!(InboundFrame::decode(r#"{"end":true}"#), Ok(InboundFrame::End));
        assert_eq!(
            InboundFrame::decode(r#"{"error":"boom"}"#),
            Ok(InboundFrame::Error("boom".to_string()))
        );
    }

    #[test]
    fn object_error_payload_is_kept_as_json() {
        let frame = InboundFrame::decode(r#"{"error":{"code":429}}"#).unwrap();
        assert_eq!(frame, InboundFrame::Error(r#"{"code":429}"#.to_string()));
    }

    #[test]
    fn falsy_error_payload_is_a_shape_error() {
        for text in [r#"{"error":false}"#, r#"{"error":""}"#, r#"{"error":0}"#] {
            assert!(
                matches!(InboundFrame::decode(text), Err(FrameError::Shape(_))),
                "{text} should be rejected"
            );
        }
        assert_eq!(
            InboundFrame::decode(r#"{"error":true}"#),
            Ok(InboundFrame::Error("true".to_string()))
        );
    }

    #[test]
    fn empty_token_is_still_a_token() {
        assert_eq!(
            InboundFrame::decode(r#"{"token":""}"#),
            Ok(InboundFrame::Token(String::new()))
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        assert_eq!(
            InboundFrame::decode(r#"{"token":"a","session_id":3}"#),
            Ok(InboundFrame::Token("a".to_string()))
        );
    }

    #[test]
    fn rejects_wrong_shapes() {
        for text in [
            r#"{}"#,
            r#"{"token":null}"#,
            r#"{"end":false}"#,
            r#"{"token":5}"#,
            r#"{"token":"last","end":true}"#,
        ] {
            assert!(
                matches!(InboundFrame::decode(text), Err(FrameError::Shape(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            InboundFrame::decode("data: hello"),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            InboundFrame::decode("42"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn encodes_single_field_objects() {
        assert_eq!(
            InboundFrame::Token("x".to_string()).encode().unwrap(),
            r#"{"token":"x"}"#
        );
        assert_eq!(InboundFrame::End.encode().unwrap(), r#"{"end":true}"#);
        assert_eq!(
            InboundFrame::Error("nope".to_string()).encode().unwrap(),
            r#"{"error":"nope"}"#
        );
    }

    #[test]
    fn outbound_accepts_legacy_query_field() {
        let frame: OutboundFrame = serde_json::from_str(r#"{"query":"hi"}"#).unwrap();
        assert_eq!(frame, OutboundFrame::new("hi"));
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"message":"hi"}"#
        );
    }
}
