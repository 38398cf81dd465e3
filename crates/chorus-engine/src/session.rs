//! Per-(agent, session) conversation histories.
//!
//! Histories live in memory only. The store is bounded two ways: at most
//! `max_sessions` keys (the least recently touched key is evicted to make
//! room) and an idle TTL (a key untouched for that long is dropped, lazily on
//! access and by a periodic sweep).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chorus_core::ids::SessionKey;
use chorus_core::messages::{Message, Role};
use chorus_telemetry::{names, MetricsRecorder};

/// Retention limits for a [`SessionStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionPolicy {
    /// `None` means no cap on the number of keys.
    pub max_sessions: Option<usize>,
    /// `None` means histories never expire.
    pub idle_ttl: Option<Duration>,
}

impl SessionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_sessions: None,
            idle_ttl: None,
        }
    }

    /// Build from settings values where `0` disables the limit.
    pub fn from_limits(max_sessions: usize, idle_ttl_secs: u64) -> Self {
        Self {
            max_sessions: (max_sessions > 0).then_some(max_sessions),
            idle_ttl: (idle_ttl_secs > 0).then(|| Duration::from_secs(idle_ttl_secs)),
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from_limits(10_000, 86_400)
    }
}

struct Entry {
    messages: Vec<Message>,
    last_access: Instant,
    /// Position in the recency index.
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SessionKey, Entry>,
    /// tick -> key, oldest first.
    recency: BTreeMap<u64, SessionKey>,
    next_tick: u64,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &SessionKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn is_expired(entry: &Entry, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.duration_since(entry.last_access) >= ttl)
    }

    /// Live entry for `key`, refreshed. Expired entries are dropped first.
    fn touch(&mut self, key: &SessionKey, ttl: Option<Duration>, now: Instant) -> Option<&mut Entry> {
        if self
            .entries
            .get(key)
            .is_some_and(|e| Self::is_expired(e, ttl, now))
        {
            self.remove(key);
            return None;
        }
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, key.clone());
        entry.tick = tick;
        entry.last_access = now;
        Some(entry)
    }
}

/// Thread-safe history store shared by every connection.
pub struct SessionStore {
    policy: SessionPolicy,
    inner: Mutex<Inner>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionPolicy::default())
    }
}

impl SessionStore {
    pub fn new(policy: SessionPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Append one message to the history for `key`, creating it if needed.
    pub fn append(&self, key: &SessionKey, message: Message) {
        let mut inner = self.inner.lock();
        self.entry_mut(&mut inner, key).messages.push(message);
    }

    /// Snapshot of the history for `key`; empty if there is none.
    pub fn get(&self, key: &SessionKey) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner
            .touch(key, self.policy.idle_ttl, now)
            .map(|e| e.messages.clone())
            .unwrap_or_default()
    }

    /// Append a user turn and return the resulting history, under one lock.
    pub fn append_user_turn(&self, key: &SessionKey, content: &str) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let entry = self.entry_mut(&mut inner, key);
        entry.messages.push(Message::user(content));
        entry.messages.clone()
    }

    /// Record `reply` as the answer to the user turn `user_content`.
    ///
    /// The reply is appended only while the history still ends with that user
    /// turn. A history evicted or expired during the reply is re-seeded with
    /// the full `[user, assistant]` pair. A history that has moved on in the
    /// meantime is left alone and the reply is dropped. Returns whether the
    /// reply was stored.
    pub fn append_assistant_turn(&self, key: &SessionKey, user_content: &str, reply: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(entry) = inner.touch(key, self.policy.idle_ttl, now) {
            let answers_turn = entry
                .messages
                .last()
                .is_some_and(|m| m.role == Role::User && m.content == user_content);
            if answers_turn {
                entry.messages.push(Message::assistant(reply));
                return true;
            }
            warn!(session = %key, "history changed during the reply, dropping it");
            return false;
        }

        info!(session = %key, "history dropped during the reply, re-seeding it");
        let entry = self.entry_mut(&mut inner, key);
        entry.messages.push(Message::user(user_content));
        entry.messages.push(Message::assistant(reply));
        true
    }

    /// Remove the most recent user turn with exactly this content, provided
    /// no assistant turn has been recorded after it. Used to undo a request
    /// that never produced a reply.
    pub fn retract_user_turn(&self, key: &SessionKey, content: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(key) else {
            return false;
        };
        let found = entry
            .messages
            .iter()
            .rposition(|m| m.role != Role::System)
            .filter(|&i| {
                let m = &entry.messages[i];
                m.role == Role::User && m.content == content
            });
        match found {
            Some(i) => {
                entry.messages.remove(i);
                if entry.messages.is_empty() {
                    inner.remove(key);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a history. Returns whether it existed.
    pub fn remove(&self, key: &SessionKey) -> bool {
        let removed = self.inner.lock().remove(key).is_some();
        if removed {
            self.publish_len();
        }
        removed
    }

    /// Number of stored histories (expired ones included until swept).
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every history idle for longer than the TTL. Returns the count.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.policy.idle_ttl else {
            return 0;
        };
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<SessionKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| Inner::is_expired(e, Some(ttl), now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        drop(inner);

        if !expired.is_empty() {
            debug!(count = expired.len(), "expired idle sessions");
            self.publish_len();
        }
        expired.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until cancelled.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep_expired();
                    }
                }
            }
            debug!("session sweeper stopped");
        })
    }

    /// Entry for `key`, creating it (and evicting the LRU key if full).
    fn entry_mut<'a>(&self, inner: &'a mut Inner, key: &SessionKey) -> &'a mut Entry {
        let now = Instant::now();
        let mut fresh_tick = 0;
        if inner.touch(key, self.policy.idle_ttl, now).is_none() {
            if let Some(max) = self.policy.max_sessions {
                while inner.entries.len() >= max {
                    let Some((_, oldest)) = inner.recency.pop_first() else {
                        break;
                    };
                    inner.entries.remove(&oldest);
                    info!(session = %oldest, "evicted least recently used session");
                    if let Some(metrics) = &self.metrics {
                        metrics.counter_inc(names::SESSIONS_EVICTED, &[], 1);
                    }
                }
            }
            fresh_tick = inner.bump();
            inner.recency.insert(fresh_tick, key.clone());
            if let Some(metrics) = &self.metrics {
                metrics.gauge_set(names::SESSIONS_ACTIVE, &[], (inner.entries.len() + 1) as f64);
            }
        }
        inner.entries.entry(key.clone()).or_insert_with(|| Entry {
            messages: Vec::new(),
            last_access: now,
            tick: fresh_tick,
        })
    }

    fn publish_len(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_set(names::SESSIONS_ACTIVE, &[], self.len() as f64);
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}
