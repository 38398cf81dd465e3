use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use chorus_core::ids::{ClientId, ConnectionId};
use chorus_telemetry::{names, MetricsRecorder};

use crate::relay::Outlet;

/// One live websocket.
///
/// `client_id` comes from the URL and may be reused by a reconnecting
/// client; `connection_id` is unique per socket.
pub struct Connection {
    pub client_id: ClientId,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    epoch: Instant,
    /// Millis since `epoch` of the last pong (or of registration).
    last_pong: AtomicU64,
}

impl Connection {
    fn new(client_id: ClientId, tx: mpsc::Sender<String>, epoch: Instant) -> Self {
        let conn = Self {
            client_id,
            connection_id: ConnectionId::new(),
            connected_at: Utc::now(),
            tx,
            cancel: CancellationToken::new(),
            epoch,
            last_pong: AtomicU64::new(0),
        };
        conn.record_pong();
        conn
    }

    /// Outbound half handed to the relay.
    pub fn outlet(&self) -> Outlet {
        Outlet::new(self.tx.clone(), self.cancel.clone())
    }

    pub fn record_pong(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_pong.store(millis, Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(last) < timeout.as_millis() as u64
    }

    /// Ask every task serving this socket to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Live connections keyed by client id.
///
/// The relay never routes through this table; it exists so connections can
/// be counted, enumerated and reaped.
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<Connection>>,
    max_send_queue: usize,
    client_timeout: Duration,
    epoch: Instant,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
            client_timeout,
            epoch: Instant::now(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a connection for `client_id`, returning it with the receiving end
    /// of its outbound queue. An existing connection under the same id is
    /// closed and replaced.
    pub fn register(&self, client_id: ClientId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let conn = Arc::new(Connection::new(client_id.clone(), tx, self.epoch));
        if let Some(previous) = self.connections.insert(client_id, Arc::clone(&conn)) {
            info!(
                client_id = %previous.client_id,
                replaced = %previous.connection_id,
                "client reconnected, closing previous socket"
            );
            previous.close();
        }
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::CONNECTIONS_TOTAL, &[], 1);
        }
        self.publish_count();
        (conn, rx)
    }

    /// Remove `conn` if it is still the registered connection for its
    /// client id. Returns whether anything was removed.
    pub fn remove(&self, conn: &Connection) -> bool {
        let removed = self
            .connections
            .remove_if(&conn.client_id, |_, current| {
                current.connection_id == conn.connection_id
            })
            .is_some();
        conn.close();
        if removed {
            self.publish_count();
        }
        removed
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Connection>> {
        self.connections.get(client_id).map(|c| Arc::clone(c.value()))
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.connections.contains_key(client_id)
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Close and drop connections that have not answered a ping within the
    /// client timeout.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive(self.client_timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed = 0;
        for conn in dead {
            if self.remove(&conn) {
                removed += 1;
                info!(client_id = %conn.client_id, "dropped unresponsive client");
            }
        }
        removed
    }

    /// Close every connection. Used at shutdown.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }

    fn publish_count(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set(names::CONNECTIONS_ACTIVE, &[], self.count() as f64);
        }
    }
}

/// Periodically reap dead connections until `cancel` fires.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead();
                    if removed > 0 {
                        info!(removed, "dead client cleanup");
                    }
                }
            }
        }
    })
}

/// Shuttle frames between `socket` and the relay.
///
/// Outbound text queued on `outbound` is written to the socket with a ping
/// every `heartbeat`; inbound text frames go to `inbound`. Either side
/// ending closes the connection.
pub async fn pump_socket(
    socket: WebSocket,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cancel = conn.cancelled();

    let writer_cancel = cancel.clone();
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await;

        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                msg = outbound.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_conn.client_id, "sent ping");
                }
            }
        }

        // flush whatever the relay queued before the close
        while let Ok(text) = outbound.try_recv() {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        writer_cancel.cancel();
    });

    let reader_cancel = cancel.clone();
    let reader_conn = Arc::clone(&conn);
    let reader = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = reader_cancel.cancelled() => break,
                frame = ws_rx.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => reader_conn.record_pong(),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client_id = %reader_conn.client_id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
        reader_cancel.cancel();
    });

    let _ = tokio::join!(writer, reader);
}
