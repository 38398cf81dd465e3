use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::credentials::ApiKey;
use crate::errors::GatewayError;
use crate::messages::Message;
use crate::stream::StreamEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One completion call: the full ordered message list plus generation knobs.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    /// Model override; `None` uses the provider's configured model.
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Trait implemented by each hosted completion API.
///
/// The returned stream is lazy, finite and consumed exactly once. Failures
/// before the first byte are returned as `Err`; failures after that arrive as
/// a terminal `StreamEvent::Error`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, GatewayError>;

    /// Check a candidate key with a minimal request, without touching the active credential.
    async fn validate_key(&self, key: &ApiKey) -> Result<(), GatewayError>;
}
