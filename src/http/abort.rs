//! Abort records.
//!
//! An abort halts dispatch and selects the response status, content type and
//! body. Text messages are served as HTML, JSON values as JSON.

use serde_json::Value;

/// Body served when a fusing gate rejects a request.
pub const FUSING_DENY: &str = "fusing deny";
/// Body served when a security gate rejects a request.
pub const SECURITY_DENY: &str = "security deny";
/// Body served when the hop budget is spent with work remaining.
pub const TTL_EXCEEDED: &str = "this router ttl out";
/// Body served when the deadline passes before the stack drains.
pub const TIMEOUT: &str = "this router timeout";

pub const MIME_HTML: &str = "text/html; charset=utf-8";
pub const MIME_JSON: &str = "application/json; charset=utf-8";
pub const MIME_TEXT: &str = "text/plain; charset=utf-8";

/// Payload of an abort.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortMessage {
    Text(String),
    Json(Value),
}

impl AbortMessage {
    pub fn content_type(&self) -> &'static str {
        match self {
            AbortMessage::Text(_) => MIME_HTML,
            AbortMessage::Json(_) => MIME_JSON,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AbortMessage::Text(text) => text.as_bytes().to_vec(),
            AbortMessage::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<&str> for AbortMessage {
    fn from(text: &str) -> Self {
        AbortMessage::Text(text.to_string())
    }
}

impl From<String> for AbortMessage {
    fn from(text: String) -> Self {
        AbortMessage::Text(text)
    }
}

impl From<Value> for AbortMessage {
    fn from(value: Value) -> Self {
        AbortMessage::Json(value)
    }
}

/// Terminal state of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub status: u16,
    pub message: AbortMessage,
}

impl Abort {
    pub fn new(status: u16, message: impl Into<AbortMessage>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_and_json_select_content_type() {
        let text = Abort::new(403, "no");
        assert_eq!(text.message.content_type(), MIME_HTML);
        assert_eq!(text.message.to_bytes(), b"no");

        let json = Abort::new(401, json!({"error": "token"}));
        assert_eq!(json.message.content_type(), MIME_JSON);
        assert_eq!(json.message.to_bytes(), br#"{"error":"token"}"#);
    }
}
