//! Settings types. Every section is `#[serde(default)]` so a partial file
//! only needs to name the values it changes.

use std::collections::BTreeMap;

use chorus_core::HistoryMode;
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChorusSettings {
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    pub sessions: SessionSettings,
    pub logging: LoggingSettings,
    /// Additions to, or overrides of, the built-in agent catalog.
    pub agents: Vec<AgentSettings>,
}

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port.
    pub port: u16,
    /// Outbound envelopes buffered per connection before the relay waits.
    pub max_send_queue: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval_secs: u64,
    /// A client that has not answered a ping for this long is dropped.
    pub client_timeout_secs: u64,
    /// How often dead connections are swept.
    pub cleanup_interval_secs: u64,
    /// Largest accepted inbound frame.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Completion provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// Full URL of the streaming text-generation endpoint.
    pub base_url: String,
    /// Default model for agents that do not pick one.
    pub model: String,
    /// API key. Usually supplied through `DASHSCOPE_API_KEY` instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Ask the provider for incremental deltas instead of cumulative text.
    pub incremental_output: bool,
    pub connect_timeout_secs: u64,
    /// Abort a stream that delivers no bytes for this long.
    pub idle_timeout_secs: u64,
    /// Overall request timeout; `0` disables it.
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation"
                .to_string(),
            model: "qwen-turbo".to_string(),
            api_key: None,
            incremental_output: false,
            connect_timeout_secs: 30,
            idle_timeout_secs: 90,
            request_timeout_secs: 0,
        }
    }
}

/// Session history retention policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Maximum number of (agent, session) histories kept; `0` means unbounded.
    pub max_sessions: usize,
    /// Histories idle for longer than this are dropped; `0` keeps them forever.
    pub idle_ttl_secs: u64,
    /// How often the expiry sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            idle_ttl_secs: 86_400,
            sweep_interval_secs: 300,
        }
    }
}

/// Logging settings. `RUST_LOG` takes precedence over all of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"chorus_llm": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

/// One agent entry. Fields left out keep the built-in value when `id`
/// matches a catalog agent; a new `id` needs at least `name` and `systemPrompt`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}
