//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChorusSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::ChorusSettings;

/// Resolve the path to the settings file (`~/.chorus/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".chorus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ChorusSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or an invalid agent list, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChorusSettings> {
    let defaults = serde_json::to_value(ChorusSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChorusSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut ChorusSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_overrides_from<F>(settings: &mut ChorusSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read("CHORUS_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("CHORUS_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn_invalid("CHORUS_PORT", &v),
        }
    }

    // ── Provider ────────────────────────────────────────────────────
    if let Some(v) = read("CHORUS_PROVIDER_URL") {
        settings.provider.base_url = v;
    }
    if let Some(v) = read("CHORUS_MODEL") {
        settings.provider.model = v;
    }
    if let Some(v) = read("DASHSCOPE_API_KEY") {
        settings.provider.api_key = Some(v);
    }

    // ── Sessions ────────────────────────────────────────────────────
    if let Some(v) = read("CHORUS_MAX_SESSIONS") {
        match parse_usize_range(&v, 0, 10_000_000) {
            Some(n) => settings.sessions.max_sessions = n,
            None => warn_invalid("CHORUS_MAX_SESSIONS", &v),
        }
    }
    if let Some(v) = read("CHORUS_SESSION_TTL_SECS") {
        match parse_u64_range(&v, 0, 365 * 86_400) {
            Some(n) => settings.sessions.idle_ttl_secs = n,
            None => warn_invalid("CHORUS_SESSION_TTL_SECS", &v),
        }
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read("CHORUS_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn_invalid("CHORUS_LOG_JSON", &v),
        }
    }
}

/// Reject agent lists the registry could never accept.
pub fn validate(settings: &ChorusSettings) -> Result<()> {
    let mut seen = HashSet::new();
    for agent in &settings.agents {
        if agent.id.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "agent id must not be empty".into(),
            ));
        }
        if !seen.insert(agent.id.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "agent '{}' is listed more than once",
                agent.id
            )));
        }
        if let Some(t) = agent.temperature {
            if !(0.0..2.0).contains(&t) {
                return Err(SettingsError::InvalidValue(format!(
                    "agent '{}' temperature {t} is outside [0, 2)",
                    agent.id
                )));
            }
        }
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn warn_invalid(key: &str, value: &str) {
    tracing::warn!(key, value, "invalid env var, ignoring");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::types::AgentSettings;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn temp_file(contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("chorus-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8000, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_skipped() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_arrays_replaced() {
        let merged = deep_merge(
            serde_json::json!({"agents": [{"id": "a"}, {"id": "b"}]}),
            serde_json::json!({"agents": [{"id": "c"}]}),
        );
        assert_eq!(merged["agents"].as_array().unwrap().len(), 1);
        assert_eq!(merged["agents"][0]["id"], "c");
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut settings = ChorusSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("CHORUS_PORT", "9100"),
                ("CHORUS_HOST", "127.0.0.1"),
                ("CHORUS_MODEL", "qwen-plus"),
                ("DASHSCOPE_API_KEY", "sk-env"),
                ("CHORUS_MAX_SESSIONS", "50"),
                ("CHORUS_SESSION_TTL_SECS", "0"),
                ("CHORUS_LOG_JSON", "yes"),
            ]),
        );
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.provider.model, "qwen-plus");
        assert_eq!(settings.provider.api_key.as_deref(), Some("sk-env"));
        assert_eq!(settings.sessions.max_sessions, 50);
        assert_eq!(settings.sessions.idle_ttl_secs, 0);
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = ChorusSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("CHORUS_PORT", "0"),
                ("CHORUS_MAX_SESSIONS", "lots"),
                ("CHORUS_LOG_JSON", "maybe"),
                ("DASHSCOPE_API_KEY", ""),
            ]),
        );
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.sessions.max_sessions, 10_000);
        assert!(!settings.logging.json);
        assert!(settings.provider.api_key.is_none());
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("chorus-settings-does-not-exist.json");
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.provider.model, ChorusSettings::default().provider.model);
    }

    #[test]
    fn load_partial_file_merges() {
        let path = temp_file(
            r#"{"sessions":{"maxSessions":3},"agents":[{"id":"haiku","name":"Haiku","systemPrompt":"Only haiku."}]}"#,
        );
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.sessions.max_sessions, 3);
        assert_eq!(settings.sessions.sweep_interval_secs, 300);
        assert_eq!(settings.agents.len(), 1);
        assert_eq!(settings.agents[0].id, "haiku");
    }

    #[test]
    fn load_invalid_json_errors() {
        let path = temp_file("{not json");
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    // ── validation ──────────────────────────────────────────────────

    #[test]
    fn duplicate_agent_ids_rejected() {
        let mut settings = ChorusSettings::default();
        settings.agents = vec![
            AgentSettings { id: "a".into(), ..Default::default() },
            AgentSettings { id: "a".into(), ..Default::default() },
        ];
        let err = validate(&settings).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn empty_agent_id_rejected() {
        let mut settings = ChorusSettings::default();
        settings.agents = vec![AgentSettings { id: " ".into(), ..Default::default() }];
        assert!(validate(&settings).is_err());
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        let mut settings = ChorusSettings::default();
        settings.agents = vec![AgentSettings {
            id: "hot".into(),
            temperature: Some(2.5),
            ..Default::default()
        }];
        assert!(validate(&settings).is_err());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("70000", 1, 65535), None);
        assert_eq!(parse_u64_range("5", 10, 20), None);
        assert_eq!(parse_usize_range("15", 10, 20), Some(15));
    }
}
