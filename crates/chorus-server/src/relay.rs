//! The per-connection protocol loop: parse a request, resolve the agent,
//! record the user turn, relay the reply, record the assistant turn.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use chorus_core::ids::SessionKey;
use chorus_core::messages::{preview, Message};
use chorus_engine::{Agent, AgentError, AgentRegistry, SessionStore};
use chorus_telemetry::{names, MetricsRecorder};

use crate::envelope::{InboundEnvelope, OutboundEnvelope};

const PREVIEW_CHARS: usize = 50;

/// The peer went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Disconnected;

/// Whether the connection loop should keep going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnected,
}

impl From<Result<(), Disconnected>> for Flow {
    fn from(result: Result<(), Disconnected>) -> Self {
        match result {
            Ok(()) => Flow::Continue,
            Err(Disconnected) => Flow::Disconnected,
        }
    }
}

/// Outbound half of a connection: the send queue plus the token that fires
/// when the socket closes.
#[derive(Clone)]
pub struct Outlet {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Outlet {
    pub fn new(tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Queue one envelope, waiting for room. Never drops.
    pub async fn send(&self, envelope: &OutboundEnvelope) -> Result<(), Disconnected> {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(kind = envelope.kind(), error = %e, "dropping unencodable envelope");
                return Ok(());
            }
        };
        tokio::select! {
            sent = self.tx.send(json) => sent.map_err(|_| Disconnected),
            () = self.cancel.cancelled() => Err(Disconnected),
        }
    }

    /// Resolves once the socket is gone.
    pub async fn closed(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.tx.closed() => {}
        }
    }
}

enum TurnError {
    Agent(AgentError),
    Disconnected,
}

impl From<Disconnected> for TurnError {
    fn from(_: Disconnected) -> Self {
        TurnError::Disconnected
    }
}

/// Serves requests for any number of connections. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    agents: Arc<AgentRegistry>,
    sessions: Arc<SessionStore>,
    metrics: Arc<MetricsRecorder>,
}

impl Relay {
    pub fn new(
        agents: Arc<AgentRegistry>,
        sessions: Arc<SessionStore>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            agents,
            sessions,
            metrics,
        }
    }

    /// Handle frames from `inbound` one at a time until the peer leaves.
    pub async fn run(&self, outlet: Outlet, mut inbound: mpsc::Receiver<String>) {
        loop {
            let frame = tokio::select! {
                frame = inbound.recv() => frame,
                () = outlet.closed() => None,
            };
            let Some(raw) = frame else { break };
            if self.handle_frame(&raw, &outlet).await == Flow::Disconnected {
                break;
            }
        }
        debug!("relay loop finished");
    }

    /// Process one raw inbound frame to completion.
    pub async fn handle_frame(&self, raw: &str, outlet: &Outlet) -> Flow {
        self.metrics.counter_inc(names::MESSAGES_RECEIVED, &[], 1);

        let envelope = match InboundEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "rejected inbound frame");
                return self.reject(outlet, "malformed", e.to_string()).await;
            }
        };
        let agent_id = match envelope.target() {
            Ok(id) => id,
            Err(e) => return self.reject(outlet, "missing_target", e.to_string()).await,
        };
        let Some(agent) = self.agents.get(agent_id.as_str()) else {
            warn!(%agent_id, "request for unknown agent");
            let text = format!("No agent registered with id {agent_id}");
            return self.reject(outlet, "unknown_agent", text).await;
        };
        if envelope.content().is_empty() {
            debug!(%agent_id, kind = %envelope.kind, "request without content, ignoring");
            return Flow::Continue;
        }

        let key = SessionKey::new(agent_id, envelope.session());
        let span = info_span!(
            "relay_turn",
            agent_id = %key.agent_id,
            session_id = %key.session_id,
            stream = envelope.stream,
        );
        self.turn(agent, key, &envelope, outlet).instrument(span).await
    }

    async fn reject(&self, outlet: &Outlet, reason: &str, text: String) -> Flow {
        self.metrics
            .counter_inc(names::MESSAGES_REJECTED, &[("reason", reason)], 1);
        outlet.send(&OutboundEnvelope::error(text)).await.into()
    }

    async fn turn(
        &self,
        agent: Arc<dyn Agent>,
        key: SessionKey,
        envelope: &InboundEnvelope,
        outlet: &Outlet,
    ) -> Flow {
        let started = Instant::now();
        let content = envelope.content();
        info!(preview = %preview(content, PREVIEW_CHARS), "user message");

        let history = self.sessions.append_user_turn(&key, content);
        let mut call = Vec::with_capacity(history.len() + 1);
        call.push(Message::system(agent.profile().system_prompt.clone()));
        call.extend(history);

        let reply = if envelope.stream {
            self.stream_reply(agent.as_ref(), call, outlet).await
        } else {
            self.whole_reply(agent.as_ref(), call, outlet).await
        };

        match reply {
            Ok(text) => {
                self.sessions.append_assistant_turn(&key, content, &text);
                let agent_label = [("agent", key.agent_id.as_str())];
                self.metrics.counter_inc(names::TURNS_TOTAL, &agent_label, 1);
                self.metrics.histogram_observe(
                    names::TURN_DURATION_MS,
                    &[],
                    started.elapsed().as_secs_f64() * 1000.0,
                );
                info!(
                    chars = text.chars().count(),
                    preview = %preview(&text, PREVIEW_CHARS),
                    "reply complete"
                );
                let done = OutboundEnvelope::message(&key.agent_id, text, envelope.stream);
                outlet.send(&done).await.into()
            }
            Err(TurnError::Agent(e)) => {
                self.sessions.retract_user_turn(&key, content);
                warn!(error = %e, "agent call failed");
                let text = format!("Failed to process message: {e}");
                outlet.send(&OutboundEnvelope::error(text)).await.into()
            }
            Err(TurnError::Disconnected) => {
                self.sessions.retract_user_turn(&key, content);
                info!("connection closed before the reply finished");
                Flow::Disconnected
            }
        }
    }

    async fn stream_reply(
        &self,
        agent: &dyn Agent,
        call: Vec<Message>,
        outlet: &Outlet,
    ) -> Result<String, TurnError> {
        let mut deltas = tokio::select! {
            deltas = agent.stream_complete(call) => deltas.map_err(TurnError::Agent)?,
            () = outlet.closed() => return Err(TurnError::Disconnected),
        };

        let mut text = String::new();
        let mut chunks = 0u64;
        loop {
            let next = tokio::select! {
                next = deltas.next() => next,
                () = outlet.closed() => return Err(TurnError::Disconnected),
            };
            let Some(delta) = next else { break };
            text.push_str(&delta);
            outlet.send(&OutboundEnvelope::chunk(agent.id(), delta)).await?;
            chunks += 1;
        }

        self.metrics
            .counter_inc(names::CHUNKS_SENT, &[("agent", agent.id().as_str())], chunks);
        debug!(chunks, "stream drained");
        Ok(text)
    }

    async fn whole_reply(
        &self,
        agent: &dyn Agent,
        call: Vec<Message>,
        outlet: &Outlet,
    ) -> Result<String, TurnError> {
        tokio::select! {
            text = agent.complete(call) => text.map_err(TurnError::Agent),
            () = outlet.closed() => Err(TurnError::Disconnected),
        }
    }
}
