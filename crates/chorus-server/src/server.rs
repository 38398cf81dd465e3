use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Instrument};

use chorus_core::credentials::{ApiKey, Credentials};
use chorus_core::ids::ClientId;
use chorus_core::provider::CompletionProvider;
use chorus_engine::{AgentRegistry, SessionStore};
use chorus_settings::ServerSettings;
use chorus_telemetry::MetricsRecorder;

use crate::client::{self, ConnectionRegistry};
use crate::error::ServerError;
use crate::relay::Relay;

/// Inbound frames buffered between the socket reader and the relay.
const INBOUND_QUEUE: usize = 32;

/// How long shutdown waits for the listener to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(settings.client_timeout_secs.max(1)),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs.max(1)),
            max_message_size: settings.max_message_size,
        }
    }
}

/// Long-lived services the server is built on. Owned by the caller.
#[derive(Clone)]
pub struct Services {
    pub agents: Arc<AgentRegistry>,
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<Credentials>,
    /// Used for key validation probes.
    pub provider: Arc<dyn CompletionProvider>,
    pub metrics: Arc<MetricsRecorder>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub connections: Arc<ConnectionRegistry>,
    pub relay: Relay,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, services: Services) -> Self {
        let connections = Arc::new(
            ConnectionRegistry::new(config.max_send_queue, config.client_timeout)
                .with_metrics(Arc::clone(&services.metrics)),
        );
        let relay = Relay::new(
            Arc::clone(&services.agents),
            Arc::clone(&services.sessions),
            Arc::clone(&services.metrics),
        );
        Self {
            services,
            connections,
            relay,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/agents", get(agents_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/{client_id}", get(ws_handler))
        .route("/api/validate-key", post(validate_key_handler))
        .route("/api/key", put(set_key_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start serving and start the dead-client sweep.
pub async fn start(config: ServerConfig, services: Services) -> Result<ServerHandle, ServerError> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, services);
    let shutdown = CancellationToken::new();
    let connections = Arc::clone(&state.connections);

    let cleanup = client::start_cleanup_task(
        Arc::clone(&connections),
        state.config.cleanup_interval,
        shutdown.clone(),
    );

    let router = build_router(state);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await });
        if let Err(e) = serve.await {
            warn!(error = %e, "server stopped with error");
        }
    });

    info!(addr = %local_addr, "chorus server started");

    Ok(ServerHandle {
        addr: local_addr,
        shutdown,
        connections,
        server,
        cleanup,
    })
}

/// Handle returned by [`start`]. Keeps the background tasks alive.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    connections: Arc<ConnectionRegistry>,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Stop accepting, close every websocket and wait for the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.connections.close_all();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            warn!("server did not drain in time");
        }
        let _ = self.cleanup.await;
        info!("chorus server stopped");
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({ "message": "Local agent server is running" }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "agents": state.services.agents.len(),
        "connections": state.connections.count(),
        "sessions": state.services.sessions.len(),
    }))
}

async fn agents_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "agents": state.services.agents.summaries() }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.services.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
struct KeyRequest {
    #[serde(alias = "apiKey", default)]
    api_key: String,
}

async fn validate_key_handler(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> impl IntoResponse {
    let candidate = request.api_key.trim();
    if candidate.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "message": "API key must not be empty" })),
        );
    }

    match state.services.provider.validate_key(&ApiKey::new(candidate)).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "valid": true, "message": "API key is valid" })),
        ),
        Err(e) => {
            info!(kind = e.error_kind(), "API key rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "valid": false, "message": e.to_string() })),
            )
        }
    }
}

async fn set_key_handler(
    State(state): State<AppState>,
    Json(request): Json<KeyRequest>,
) -> impl IntoResponse {
    let key = request.api_key.trim();
    let key = (!key.is_empty()).then(|| ApiKey::new(key));
    let configured = key.is_some();
    let version = state.services.credentials.rotate(key);
    info!(version, configured, "API key updated");
    Json(json!({ "version": version, "configured": configured }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max = state.config.max_message_size;
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_socket(socket, ClientId::from(client_id), state))
}

async fn handle_socket(socket: WebSocket, client_id: ClientId, state: AppState) {
    let (conn, outbound) = state.connections.register(client_id);
    let span = info_span!(
        "connection",
        client_id = %conn.client_id,
        connection_id = %conn.connection_id,
    );

    async move {
        info!("client connected");
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let pump = tokio::spawn(
            client::pump_socket(
                socket,
                Arc::clone(&conn),
                outbound,
                inbound_tx,
                state.config.heartbeat_interval,
            )
            .in_current_span(),
        );

        state.relay.run(conn.outlet(), inbound_rx).await;

        conn.close();
        let _ = pump.await;
        state.connections.remove(&conn);
        info!("client disconnected");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::ids::SessionKey;
    use chorus_core::messages::Message;
    use chorus_engine::{build_registry, SessionPolicy};
    use chorus_llm::mock::{MockProvider, MockResponse};
    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as WsFrame;

    fn services(provider: Arc<MockProvider>) -> Services {
        let metrics = Arc::new(MetricsRecorder::new());
        let agents = build_registry(provider.clone(), &[], Some(metrics.clone())).unwrap();
        Services {
            agents: Arc::new(agents),
            sessions: Arc::new(SessionStore::new(SessionPolicy::default()).with_metrics(metrics.clone())),
            credentials: Arc::new(Credentials::from_option(None)),
            provider,
            metrics,
        }
    }

    async fn spawn(provider: Arc<MockProvider>) -> (ServerHandle, Services) {
        let services = services(provider);
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        };
        let handle = start(config, services.clone()).await.unwrap();
        (handle, services)
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", handle.port(), path)
    }

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            port: 9000,
            heartbeat_interval_secs: 0,
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 9000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_send_queue, 256);
    }

    #[tokio::test]
    async fn liveness_and_health() {
        let (handle, _) = spawn(Arc::new(MockProvider::new(vec![]))).await;
        assert!(handle.port() > 0);

        let body: Value = reqwest::get(url(&handle, "/")).await.unwrap().json().await.unwrap();
        assert_eq!(body["message"], "Local agent server is running");

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["agents"], 11);
        assert_eq!(body["connections"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn agents_listing_in_registration_order() {
        let (handle, _) = spawn(Arc::new(MockProvider::new(vec![]))).await;
        let body: Value = reqwest::get(url(&handle, "/agents")).await.unwrap().json().await.unwrap();
        let agents = body["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 11);
        assert_eq!(agents[0]["id"], "story_master");
        assert_eq!(agents[0]["category"], "Writing");
        assert!(agents[0].get("system_prompt").is_none());
        assert_eq!(agents[10]["id"], "ancient_style");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn key_validation_and_rotation() {
        let provider = Arc::new(MockProvider::new(vec![]).with_valid_keys(&["sk-good"]));
        let (handle, services) = spawn(provider).await;
        let http = reqwest::Client::new();

        let resp = http
            .post(url(&handle, "/api/validate-key"))
            .json(&json!({ "api_key": "sk-good" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap()["valid"], true);

        let resp = http
            .post(url(&handle, "/api/validate-key"))
            .json(&json!({ "api_key": "sk-bad" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.json::<Value>().await.unwrap()["valid"], false);

        let before = services.credentials.version();
        let body: Value = http
            .put(url(&handle, "/api/key"))
            .json(&json!({ "api_key": "sk-good" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["configured"], true);
        assert!(body["version"].as_u64().unwrap() > before);
        assert!(services.credentials.is_set());

        let body: Value = http
            .put(url(&handle, "/api/key"))
            .json(&json!({ "api_key": "" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["configured"], false);
        assert!(!services.credentials.is_set());

        handle.shutdown().await;
    }

    async fn next_envelope<S>(ws: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for an envelope")
                .expect("socket closed")
                .expect("socket error");
            if let WsFrame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn websocket_round_trip() {
        let provider = Arc::new(MockProvider::new(vec![
            MockResponse::stream_chunks(&["Once", " upon", " a time"]),
            MockResponse::stream_text("Once."),
        ]));
        let (handle, services) = spawn(provider.clone()).await;

        let ws_url = format!("ws://127.0.0.1:{}/ws/client-1", handle.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();

        ws.send(WsFrame::text(
            r#"{"to":"story_master","content":"a robot learns to love","stream":true,"session_id":"s1"}"#,
        ))
        .await
        .unwrap();

        let mut streamed = String::new();
        let final_text = loop {
            let env = next_envelope(&mut ws).await;
            match env["type"].as_str().unwrap() {
                "message_chunk" => streamed.push_str(env["content"].as_str().unwrap()),
                "message" => {
                    assert_eq!(env["is_final"], true);
                    break env["content"].as_str().unwrap().to_string();
                }
                other => panic!("unexpected envelope {other}"),
            }
        };
        assert_eq!(streamed, final_text);
        assert_eq!(final_text, "Once upon a time");

        // unknown agent, then a follow-up on the same session
        ws.send(WsFrame::text(r#"{"to":"ghost","content":"boo"}"#)).await.unwrap();
        let env = next_envelope(&mut ws).await;
        assert_eq!(env["type"], "error");

        ws.send(WsFrame::text(
            r#"{"to":"story_master","content":"make it shorter","stream":false,"session_id":"s1"}"#,
        ))
        .await
        .unwrap();
        let env = next_envelope(&mut ws).await;
        assert_eq!(env["type"], "message");
        assert_eq!(env["content"], "Once.");

        let history = services.sessions.get(&SessionKey::new("story_master", "s1"));
        assert_eq!(history.len(), 4);
        assert_eq!(history[2], Message::user("make it shorter"));
        assert_eq!(handle.connections().count(), 1);

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if handle.connections().count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.connections().count(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_traffic() {
        let provider = Arc::new(MockProvider::repeating(MockResponse::stream_text("hi")));
        let (handle, _) = spawn(provider).await;

        let ws_url = format!("ws://127.0.0.1:{}/ws/m", handle.port());
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
        ws.send(WsFrame::text(r#"{"to":"deep_thinker","content":"why?"}"#)).await.unwrap();
        loop {
            if next_envelope(&mut ws).await["type"] == "message" {
                break;
            }
        }

        let body: Value = reqwest::get(url(&handle, "/metrics")).await.unwrap().json().await.unwrap();
        let counters = body["counters"].as_array().unwrap();
        assert!(counters
            .iter()
            .any(|c| c["name"] == "relay.turns.total" && c["labels"]["agent"] == "deep_thinker"));
        handle.shutdown().await;
    }
}
