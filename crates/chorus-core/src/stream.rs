use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;

/// Events emitted by a provider stream. Ordering contract:
///
/// Start → TextDelta* → Done
///
/// Error may appear at any point and terminates the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start,
    /// Text produced since the previous delta (never cumulative).
    TextDelta { delta: String },
    Done {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Error { error: GatewayError },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self::TextDelta { delta: text.into() }
    }

    pub fn done() -> Self {
        Self::Done {
            finish_reason: Some("stop".into()),
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::done().is_terminal());
        assert!(StreamEvent::Error {
            error: GatewayError::RateLimited { retry_after: None }
        }
        .is_terminal());
        assert!(!StreamEvent::delta("x").is_terminal());
        assert!(!StreamEvent::Start.is_terminal());
    }
}
