use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tracing::{debug, warn};

use chorus_core::errors::GatewayError;
use chorus_core::ids::AgentId;
use chorus_core::messages::{last_user_content, Message};
use chorus_core::profile::{AgentProfile, HistoryMode};
use chorus_core::provider::{CompletionProvider, CompletionRequest, EventStream};
use chorus_core::stream::StreamEvent;
use chorus_telemetry::{names, MetricsRecorder};

use crate::error::AgentError;

/// Incremental reply text. Finite; consume once.
pub type DeltaStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Reply used by single-turn agents handed a list with no user turn.
pub const NO_USER_MESSAGE: &str = "No user message found.";

/// Reply used when the provider finished without producing any text.
pub const EMPTY_REPLY: &str = "The agent returned an empty reply. Please try again.";

/// A named persona that turns a conversation into streamed reply text.
#[async_trait]
pub trait Agent: Send + Sync {
    fn profile(&self) -> &AgentProfile;

    fn id(&self) -> &AgentId {
        &self.profile().id
    }

    /// One-time setup. Must be safe to call more than once.
    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Stream the reply to `messages` (system prompt first, then history).
    async fn stream_complete(&self, messages: Vec<Message>) -> Result<DeltaStream, AgentError>;

    /// The whole reply as one string.
    async fn complete(&self, messages: Vec<Message>) -> Result<String, AgentError> {
        let mut deltas = self.stream_complete(messages).await?;
        let mut text = String::new();
        while let Some(delta) = deltas.next().await {
            text.push_str(&delta);
        }
        Ok(text)
    }
}

/// The concrete agent: a static system prompt in front of a shared provider.
///
/// Provider failures never leave this type as errors. They end the reply
/// with a one-line diagnostic instead.
pub struct PromptAgent {
    profile: AgentProfile,
    mode: HistoryMode,
    model: Option<String>,
    temperature: Option<f64>,
    provider: Arc<dyn CompletionProvider>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl PromptAgent {
    pub fn new(profile: AgentProfile, provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            profile,
            mode: HistoryMode::default(),
            model: None,
            temperature: None,
            provider,
            metrics: None,
        }
    }

    /// Count provider failures under `llm.errors.total{kind}`.
    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_history(mut self, mode: HistoryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn history_mode(&self) -> HistoryMode {
        self.mode
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Reduce the supplied conversation to what this agent sends upstream.
    /// `None` means there is nothing to answer.
    fn provider_messages(&self, messages: Vec<Message>) -> Option<Vec<Message>> {
        match self.mode {
            HistoryMode::HistoryAware => Some(messages),
            HistoryMode::SingleTurn => {
                let user = last_user_content(&messages)?;
                Some(vec![
                    Message::system(self.profile.system_prompt.clone()),
                    Message::user(user),
                ])
            }
        }
    }
}

#[async_trait]
impl Agent for PromptAgent {
    fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    async fn stream_complete(&self, messages: Vec<Message>) -> Result<DeltaStream, AgentError> {
        let Some(messages) = self.provider_messages(messages) else {
            debug!(agent_id = %self.profile.id, "no user turn in conversation");
            return Ok(Box::pin(stream::once(async { NO_USER_MESSAGE.to_string() })));
        };

        let request = CompletionRequest::new(messages)
            .with_model(self.model.clone())
            .with_temperature(self.temperature);

        match self.provider.stream(&request).await {
            Ok(events) => Ok(deltas(events, self.profile.name.clone(), self.metrics.clone())),
            Err(error) => {
                warn!(agent_id = %self.profile.id, kind = error.error_kind(), %error, "provider call failed");
                record_failure(self.metrics.as_deref(), &error);
                let text = diagnostic(&self.profile.name, &error);
                Ok(Box::pin(stream::once(async move { text })))
            }
        }
    }
}

/// Human-readable stand-in for a failed reply.
pub fn diagnostic(agent_name: &str, error: &GatewayError) -> String {
    format!("{agent_name} could not finish the reply: {error}")
}

fn record_failure(metrics: Option<&MetricsRecorder>, error: &GatewayError) {
    if let Some(metrics) = metrics {
        metrics.counter_inc(names::PROVIDER_ERRORS, &[("kind", error.error_kind())], 1);
    }
}

struct DeltaState {
    events: Option<EventStream>,
    agent_name: String,
    produced_text: bool,
    metrics: Option<Arc<MetricsRecorder>>,
}

/// Map provider events to reply text, ending in a diagnostic on error and a
/// placeholder when nothing was written.
fn deltas(events: EventStream, agent_name: String, metrics: Option<Arc<MetricsRecorder>>) -> DeltaStream {
    let state = DeltaState {
        events: Some(events),
        agent_name,
        produced_text: false,
        metrics,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            let events = state.events.as_mut()?;
            match events.next().await {
                Some(StreamEvent::Start) => continue,
                Some(StreamEvent::TextDelta { delta }) => {
                    state.produced_text |= !delta.is_empty();
                    return Some((delta, state));
                }
                Some(StreamEvent::Error { error }) => {
                    state.events = None;
                    warn!(kind = error.error_kind(), %error, "provider stream failed");
                    record_failure(state.metrics.as_deref(), &error);
                    let text = diagnostic(&state.agent_name, &error);
                    return Some((text, state));
                }
                Some(StreamEvent::Done { .. }) | None => {
                    state.events = None;
                    if state.produced_text {
                        return None;
                    }
                    return Some((EMPTY_REPLY.to_string(), state));
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_llm::mock::{MockProvider, MockResponse};

    fn profile() -> AgentProfile {
        AgentProfile {
            id: AgentId::from("story_master"),
            name: "Story Master".into(),
            description: "Writes stories".into(),
            category: "Writing".into(),
            system_prompt: "You write short stories.".into(),
        }
    }

    fn conversation() -> Vec<Message> {
        vec![
            Message::system("You write short stories."),
            Message::user("a robot learns to love"),
            Message::assistant("Once upon a time..."),
            Message::user("make it shorter"),
        ]
    }

    async fn collect(agent: &PromptAgent, messages: Vec<Message>) -> Vec<String> {
        agent.stream_complete(messages).await.unwrap().collect().await
    }

    #[tokio::test]
    async fn single_turn_sends_system_and_last_user() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_chunks(&["Short", " one."])]));
        let agent = PromptAgent::new(profile(), provider.clone());

        let chunks = collect(&agent, conversation()).await;
        assert_eq!(chunks, vec!["Short", " one."]);

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Message::system("You write short stories."));
        assert_eq!(sent[1], Message::user("make it shorter"));
    }

    #[tokio::test]
    async fn history_aware_sends_everything() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_text("ok")]));
        let agent = PromptAgent::new(profile(), provider.clone())
            .with_history(HistoryMode::HistoryAware)
            .with_temperature(Some(0.8))
            .with_model(Some("qwen-plus".into()));

        collect(&agent, conversation()).await;

        let request = &provider.requests()[0];
        assert_eq!(request.messages, conversation());
        assert_eq!(request.temperature, Some(0.8));
        assert_eq!(request.model.as_deref(), Some("qwen-plus"));
    }

    #[tokio::test]
    async fn no_user_turn_skips_provider() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let agent = PromptAgent::new(profile(), provider.clone());

        let chunks = collect(&agent, vec![Message::system("x")]).await;
        assert_eq!(chunks, vec![NO_USER_MESSAGE]);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn call_failure_becomes_diagnostic() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("no API key configured".into()),
        )]));
        let agent = PromptAgent::new(profile(), provider);

        let chunks = collect(&agent, conversation()).await;
        assert_eq!(
            chunks,
            vec!["Story Master could not finish the reply: authentication failed: no API key configured"]
        );
    }

    #[tokio::test]
    async fn failures_are_counted_by_kind() {
        let metrics = Arc::new(MetricsRecorder::new());
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
            MockResponse::stream_error(&["x"], GatewayError::StreamInterrupted("reset".into())),
        ]));
        let agent = PromptAgent::new(profile(), provider).with_metrics(Some(metrics.clone()));

        collect(&agent, conversation()).await;
        collect(&agent, conversation()).await;

        assert_eq!(metrics.counter_get(names::PROVIDER_ERRORS, &[("kind", "rate_limited")]), 1);
        assert_eq!(metrics.counter_get(names::PROVIDER_ERRORS, &[("kind", "stream_interrupted")]), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_error(
            &["Once", " upon"],
            GatewayError::StreamInterrupted("connection reset".into()),
        )]));
        let agent = PromptAgent::new(profile(), provider);

        let chunks = collect(&agent, conversation()).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "Once");
        assert!(chunks[2].starts_with("Story Master could not finish the reply"));
        assert!(chunks[2].contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_reply_gets_placeholder() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_chunks(&["", ""])]));
        let agent = PromptAgent::new(profile(), provider);

        let chunks = collect(&agent, conversation()).await;
        // blank deltas are still passed through
        assert_eq!(chunks, vec!["", "", EMPTY_REPLY]);
    }

    #[tokio::test]
    async fn complete_concatenates() {
        let provider = Arc::new(MockProvider::new(vec![MockResponse::stream_chunks(&["a", "b", "c"])]));
        let agent = PromptAgent::new(profile(), provider);
        assert_eq!(agent.complete(conversation()).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let agent = PromptAgent::new(profile(), Arc::new(MockProvider::new(vec![])));
        agent.initialize().await.unwrap();
        agent.initialize().await.unwrap();
        assert_eq!(agent.id().as_str(), "story_master");
    }
}
