use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use chorus_core::credentials::{ApiKey, Credentials};
use chorus_core::errors::GatewayError;
use chorus_core::messages::Message;
use chorus_core::provider::{CompletionProvider, CompletionRequest, EventStream};
use chorus_core::stream::StreamEvent;

use crate::sse::{self, DashScopeParser};

pub const DEFAULT_API_URL: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";
pub const DEFAULT_MODEL: &str = "qwen-turbo";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection options for [`DashScopeProvider`].
#[derive(Clone, Debug)]
pub struct DashScopeConfig {
    pub base_url: String,
    pub model: String,
    /// Request deltas from the service instead of cumulative text.
    pub incremental_output: bool,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    /// Whole-request timeout, including the streamed body.
    pub request_timeout: Option<Duration>,
}

impl Default for DashScopeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            incremental_output: false,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
            request_timeout: None,
        }
    }
}

/// Streaming client for the DashScope text-generation API.
pub struct DashScopeProvider {
    client: Client,
    config: DashScopeConfig,
    credentials: Arc<Credentials>,
}

impl DashScopeProvider {
    pub fn new(config: DashScopeConfig, credentials: Arc<Credentials>) -> Result<Self, GatewayError> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    fn build_body<'a>(
        &'a self,
        request: &'a CompletionRequest,
        max_tokens: Option<u32>,
    ) -> RequestBody<'a> {
        RequestBody {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            input: InputBody {
                messages: &request.messages,
            },
            parameters: Parameters {
                result_format: "message",
                incremental_output: self.config.incremental_output,
                temperature: request.temperature,
                max_tokens,
            },
        }
    }

    async fn send(
        &self,
        key: &ApiKey,
        request: &CompletionRequest,
        max_tokens: Option<u32>,
    ) -> Result<SseStream, GatewayError> {
        let body = self.build_body(request, max_tokens);

        let resp = self
            .client
            .post(&self.config.base_url)
            .bearer_auth(key.expose())
            .header("X-DashScope-SSE", "enable")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.connect_timeout)
                } else {
                    GatewayError::NetworkError(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_error_body(status, body));
        }

        Ok(SseStream::with_idle_timeout(
            resp.bytes_stream(),
            self.config.incremental_output,
            self.config.idle_timeout,
        ))
    }
}

/// Non-2xx bodies usually carry a `{code, message}` object; fall back to the
/// status when they do not.
fn classify_error_body(status: u16, body: String) -> GatewayError {
    #[derive(serde::Deserialize)]
    struct Body {
        code: String,
        #[serde(default)]
        message: String,
    }
    match serde_json::from_str::<Body>(&body) {
        Ok(b) if status != 429 && !(500..600).contains(&status) => {
            GatewayError::from_code(&b.code, b.message)
        }
        _ => GatewayError::from_status(status, body),
    }
}

#[async_trait]
impl CompletionProvider for DashScopeProvider {
    fn name(&self) -> &str {
        "dashscope"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip_all, fields(messages = request.messages.len()))]
    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream, GatewayError> {
        let (version, key) = self.credentials.current();
        let key = key.ok_or_else(|| {
            GatewayError::AuthenticationFailed("no API key configured".into())
        })?;
        debug!(credential_version = version, "sending completion request");

        let stream = self.send(&key, request, None).await?;
        Ok(Box::pin(stream))
    }

    async fn validate_key(&self, key: &ApiKey) -> Result<(), GatewayError> {
        let probe = CompletionRequest::new(vec![Message::user("Hello")]);
        let mut stream = self.send(key, &probe, Some(1)).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Error { error } => return Err(error),
                StreamEvent::Done { .. } => break,
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    input: InputBody<'a>,
    parameters: Parameters,
}

#[derive(Serialize)]
struct InputBody<'a> {
    messages: &'a [Message],
}

#[derive(Serialize)]
struct Parameters {
    result_format: &'static str,
    incremental_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Wraps a byte stream from reqwest and yields StreamEvents.
///
/// Bytes are buffered raw so multi-byte characters split across chunks
/// survive. If no data arrives within the idle timeout the stream ends with
/// an error. Nothing is yielded after the first terminal event.
struct SseStream {
    inner: ByteStream,
    parser: DashScopeParser,
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    closed: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        incremental: bool,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: DashScopeParser::new(incremental),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            closed: false,
        }
    }

    fn drain_frames(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let chunk: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.feed(&String::from_utf8_lossy(&chunk));
        }
    }

    fn feed(&mut self, raw: &str) {
        for frame in sse::parse_sse_lines(raw) {
            self.pending.extend(self.parser.parse_frame(&frame));
        }
    }

    fn next_pending(&mut self) -> Option<StreamEvent> {
        let event = self.pending.pop_front()?;
        if event.is_terminal() {
            self.closed = true;
            self.pending.clear();
        }
        Some(event)
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }
        if self.closed {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.buffer.extend(bytes.iter().filter(|b| **b != b'\r'));
                    self.drain_frames();

                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        self.feed(&String::from_utf8_lossy(&rest));
                    }
                    let tail = self.parser.finish();
                    self.pending.extend(tail);
                    let event = self.next_pending();
                    self.closed = true;
                    return Poll::Ready(event);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.closed = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
