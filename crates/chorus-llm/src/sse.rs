use serde::Deserialize;
use tracing::warn;

use chorus_core::errors::GatewayError;
use chorus_core::stream::{StreamEvent, TokenUsage};

/// One server-sent event: optional `event:` name plus the joined `data:` lines.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Parse raw SSE text (one or more frames separated by blank lines).
///
/// Field values may or may not have a space after the colon. Multiple `data:`
/// lines in one frame are joined with `\n`. Comment lines (leading `:`), `id:`
/// and `retry:` are ignored.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut current = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    let mut flush = |current: &mut SseFrame, data_lines: &mut Vec<&str>| {
        current.data = data_lines.join("\n");
        data_lines.clear();
        let frame = std::mem::take(current);
        if !frame.is_empty() {
            frames.push(frame);
        }
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut current, &mut data_lines);
        } else if line.starts_with(':') {
            continue;
        } else if let Some(value) = field(line, "event") {
            current.event = Some(value.to_string());
        } else if let Some(value) = field(line, "data") {
            data_lines.push(value);
        }
    }

    // Trailing frame without a blank line
    flush(&mut current, &mut data_lines);
    frames
}

fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Turns DashScope result frames into [`StreamEvent`]s.
///
/// Unless incremental output was requested, every frame carries the whole
/// reply so far; the parser diffs it against the previous frame so that
/// downstream only ever sees the newly produced text.
#[derive(Debug, Default)]
pub struct DashScopeParser {
    incremental: bool,
    previous: String,
    started: bool,
    finished: bool,
    usage: Option<TokenUsage>,
}

impl DashScopeParser {
    pub fn new(incremental: bool) -> Self {
        Self {
            incremental,
            ..Default::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse one frame and return zero or more events.
    pub fn parse_frame(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        if self.finished || frame.data.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if frame.event.as_deref() == Some("error") {
            events.push(self.fail(error_from_payload(&frame.data)));
            return events;
        }

        let payload: ResultPayload = match serde_json::from_str(&frame.data) {
            Ok(p) => p,
            Err(e) => {
                events.push(self.fail(GatewayError::MalformedResponse(format!(
                    "invalid result frame: {e}"
                ))));
                return events;
            }
        };

        // An error body can also arrive on a frame without `event:error`
        if let (Some(code), None) = (&payload.code, &payload.output) {
            let message = payload.message.clone().unwrap_or_default();
            events.push(self.fail(GatewayError::from_code(code, message)));
            return events;
        }

        if let Some(usage) = payload.usage {
            self.usage = Some(TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }

        let choice = payload
            .output
            .and_then(|o| o.choices)
            .and_then(|choices| choices.into_iter().next());

        match choice {
            Some(choice) => {
                let content = choice.message.map(|m| m.content).unwrap_or_default();
                events.push(StreamEvent::delta(self.next_delta(content)));
                if let Some(reason) = choice.finish_reason.filter(|r| r != "null") {
                    self.finished = true;
                    events.push(StreamEvent::Done {
                        finish_reason: Some(reason),
                        usage: self.usage.clone(),
                    });
                }
            }
            // Frames without choices still count as a (blank) step
            None => events.push(StreamEvent::delta("")),
        }

        events
    }

    /// Called once the byte stream ends. Closes a stream that never saw a
    /// finish reason.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }
        events.push(StreamEvent::Done {
            finish_reason: None,
            usage: self.usage.clone(),
        });
        events
    }

    fn fail(&mut self, error: GatewayError) -> StreamEvent {
        self.finished = true;
        StreamEvent::Error { error }
    }

    fn next_delta(&mut self, content: String) -> String {
        if self.incremental {
            self.previous.push_str(&content);
            return content;
        }
        let delta = diff_cumulative(&self.previous, &content);
        self.previous = content;
        delta
    }
}

/// The text `current` adds on top of `previous`.
///
/// If the provider rewrote earlier text the whole of `current` is returned.
pub fn diff_cumulative(previous: &str, current: &str) -> String {
    match current.strip_prefix(previous) {
        Some(rest) => rest.to_string(),
        None => {
            warn!(
                previous_len = previous.len(),
                current_len = current.len(),
                "cumulative text is not an extension of the previous frame"
            );
            current.to_string()
        }
    }
}

fn error_from_payload(data: &str) -> GatewayError {
    match serde_json::from_str::<ErrorPayload>(data) {
        Ok(ErrorPayload {
            code: Some(code),
            message,
        }) => GatewayError::from_code(&code, message.unwrap_or_default()),
        Ok(ErrorPayload { message, .. }) => GatewayError::ServerError {
            status: 500,
            body: message.unwrap_or_else(|| data.to_string()),
        },
        Err(_) => GatewayError::MalformedResponse(format!("unreadable error frame: {data}")),
    }
}

// --- Deserialization types for DashScope frames ---

#[derive(Deserialize)]
struct ResultPayload {
    output: Option<OutputPayload>,
    usage: Option<UsagePayload>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct OutputPayload {
    choices: Option<Vec<ChoicePayload>>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    message: Option<MessagePayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessagePayload {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    message: Option<String>,
}
