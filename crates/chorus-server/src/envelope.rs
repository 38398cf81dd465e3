//! JSON envelopes exchanged over the websocket.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chorus_core::ids::{AgentId, SessionId, DEFAULT_SESSION};

/// Sender name used on error envelopes.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message is missing the target agent id")]
    MissingTarget,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

fn default_kind() -> String {
    "message".to_string()
}

fn default_stream() -> bool {
    true
}

/// A client request.
///
/// Everything except `to` has a default, and `to` itself is checked by
/// [`target`](Self::target) rather than at parse time so a missing target
/// gets its own error text.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Informational only.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn target(&self) -> Result<AgentId, EnvelopeError> {
        match self.to.as_deref() {
            Some(to) if !to.is_empty() => Ok(AgentId::from(to)),
            _ => Err(EnvelopeError::MissingTarget),
        }
    }

    pub fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// The addressed session; absent, null and empty all mean `"default"`.
    pub fn session(&self) -> SessionId {
        match self.session_id.as_deref() {
            Some(id) if !id.is_empty() => SessionId::from(id),
            _ => SessionId::from(DEFAULT_SESSION),
        }
    }
}

/// A server reply.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    MessageChunk {
        content: String,
        from: String,
        is_final: bool,
    },
    Message {
        content: String,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_final: Option<bool>,
    },
    Error {
        content: String,
        from: String,
    },
}

impl OutboundEnvelope {
    pub fn chunk(from: &AgentId, delta: impl Into<String>) -> Self {
        Self::MessageChunk {
            content: delta.into(),
            from: from.to_string(),
            is_final: false,
        }
    }

    /// Full reply. Only streamed replies carry `is_final`.
    pub fn message(from: &AgentId, content: impl Into<String>, streamed: bool) -> Self {
        Self::Message {
            content: content.into(),
            from: from.to_string(),
            is_final: streamed.then_some(true),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            from: SYSTEM_SENDER.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageChunk { .. } => "message_chunk",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn encode(envelope: &OutboundEnvelope) -> Value {
        serde_json::from_str(&envelope.to_json().unwrap()).unwrap()
    }

    #[test]
    fn inbound_defaults() {
        let env = InboundEnvelope::parse(r#"{"to":"story_master","content":"hi"}"#).unwrap();
        assert_eq!(env.target().unwrap().as_str(), "story_master");
        assert_eq!(env.content(), "hi");
        assert_eq!(env.kind, "message");
        assert!(env.stream);
        assert_eq!(env.session().as_str(), "default");
    }

    #[test]
    fn inbound_explicit_fields() {
        let env = InboundEnvelope::parse(
            r#"{"to":"python_expert","content":"x","type":"message","stream":false,"session_id":"s1"}"#,
        )
        .unwrap();
        assert!(!env.stream);
        assert_eq!(env.session().as_str(), "s1");
    }

    #[test]
    fn null_or_empty_session_is_default() {
        for raw in [
            r#"{"to":"a","content":"x","session_id":null}"#,
            r#"{"to":"a","content":"x","session_id":""}"#,
        ] {
            assert_eq!(InboundEnvelope::parse(raw).unwrap().session().as_str(), "default");
        }
    }

    #[test]
    fn missing_target() {
        for raw in [r#"{"content":"x"}"#, r#"{"to":"","content":"x"}"#, r#"{"to":null}"#] {
            let env = InboundEnvelope::parse(raw).unwrap();
            let err = env.target().unwrap_err();
            assert_eq!(err.to_string(), "Message is missing the target agent id");
        }
    }

    #[test]
    fn malformed_input() {
        let err = InboundEnvelope::parse("not json").unwrap_err();
        assert!(err.to_string().starts_with("Malformed message: "));

        // wrong field type is also a parse failure
        let err = InboundEnvelope::parse(r#"{"to":"a","stream":"yes"}"#).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn missing_content_reads_as_empty() {
        let env = InboundEnvelope::parse(r#"{"to":"a"}"#).unwrap();
        assert_eq!(env.content(), "");
    }

    #[test]
    fn outbound_wire_shapes() {
        let agent = AgentId::from("story_master");
        assert_eq!(
            encode(&OutboundEnvelope::chunk(&agent, "Once")),
            json!({"type":"message_chunk","content":"Once","from":"story_master","is_final":false})
        );
        assert_eq!(
            encode(&OutboundEnvelope::message(&agent, "Once upon", true)),
            json!({"type":"message","content":"Once upon","from":"story_master","is_final":true})
        );
        assert_eq!(
            encode(&OutboundEnvelope::message(&agent, "Once upon", false)),
            json!({"type":"message","content":"Once upon","from":"story_master"})
        );
        assert_eq!(
            encode(&OutboundEnvelope::error("boom")),
            json!({"type":"error","content":"boom","from":"system"})
        );
    }

    #[test]
    fn kind_matches_wire_tag() {
        let env = OutboundEnvelope::error("x");
        assert_eq!(encode(&env)["type"], env.kind());
    }
}
