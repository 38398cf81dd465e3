use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use chorus_core::credentials::ApiKey;
use chorus_core::errors::GatewayError;
use chorus_core::provider::{CompletionProvider, CompletionRequest, EventStream};
use chorus_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Yield the events, then never finish. Used to exercise cancellation.
    Stall(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete stream delivering `chunks` as separate deltas.
    pub fn stream_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::delta(*c)));
        events.push(StreamEvent::done());
        Self::Stream(events)
    }

    /// Convenience: create a simple text response stream.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_chunks(&[text])
    }

    /// Deliver `chunks`, then fail mid-stream.
    pub fn stream_error(chunks: &[&str], error: GatewayError) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::delta(*c)));
        events.push(StreamEvent::Error { error });
        Self::Stream(events)
    }

    /// Deliver `chunks` and then hang.
    pub fn stall_after(chunks: &[&str]) -> Self {
        let mut events = vec![StreamEvent::Start];
        events.extend(chunks.iter().map(|c| StreamEvent::delta(*c)));
        Self::Stall(events)
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
///
/// Once the script is used up, calls fall back to the `repeat` response if
/// one is set, and fail otherwise. Every request is recorded.
#[derive(Debug)]
pub struct MockProvider {
    responses: Vec<MockResponse>,
    repeat: Option<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
    valid_keys: Vec<String>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            repeat: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            valid_keys: Vec::new(),
        }
    }

    /// Answer every call with the same response.
    pub fn repeating(response: MockResponse) -> Self {
        Self::new(Vec::new()).with_repeat(response)
    }

    pub fn with_repeat(mut self, response: MockResponse) -> Self {
        self.repeat = Some(response);
        self
    }

    /// Keys `validate_key` accepts. Anything else is rejected.
    pub fn with_valid_keys(mut self, keys: &[&str]) -> Self {
        self.valid_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let response = self
            .responses
            .get(idx)
            .or(self.repeat.as_ref())
            .cloned()
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                ))
            })?;

        resolve_response(response).await
    }

    async fn validate_key(&self, key: &ApiKey) -> Result<(), GatewayError> {
        if self.valid_keys.iter().any(|k| k == key.expose()) {
            Ok(())
        } else {
            Err(GatewayError::AuthenticationFailed(
                "Invalid API-key provided.".into(),
            ))
        }
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(mut current: MockResponse) -> Result<EventStream, GatewayError> {
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Stall(events) => {
                return Ok(Box::pin(stream::iter(events).chain(stream::pending())))
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
