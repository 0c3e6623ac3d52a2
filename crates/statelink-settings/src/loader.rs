//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::SyncSettings;

/// Resolve the settings file path (`~/.statelink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".statelink").join("settings.json")
}

/// Load settings from the default path with env overrides applied.
pub fn load_settings() -> Result<SyncSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env overrides applied, then validate.
///
/// A missing file yields the defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings> {
    let defaults = serde_json::to_value(SyncSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SyncSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `STATELINK_*` environment overrides.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut SyncSettings) {
    if let Some(v) = read_env_string("STATELINK_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("STATELINK_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = read_env_u64("STATELINK_MAX_CONNECTIONS", 1, 100_000) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(settings.server.max_connections);
    }
    if let Some(v) = read_env_string("STATELINK_ALLOWED_ORIGINS") {
        settings.server.allowed_origins = parse_list(&v);
    }
    if let Some(v) = read_env_u64("STATELINK_MAX_RETRIES", 0, 1_000) {
        settings.recovery.max_retries = u32::try_from(v).unwrap_or(settings.recovery.max_retries);
    }
    if let Some(v) = read_env_u64("STATELINK_HEALTH_CHECK_INTERVAL_MS", 100, 3_600_000) {
        settings.recovery.health_check_interval_ms = v;
    }
    if let Some(v) = read_env_u64("STATELINK_THROTTLE_MS", 0, 60_000) {
        settings.broadcast.preferences.throttle_ms = v;
    }
}

/// Parse a string as a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"port": 8765, "host": "127.0.0.1"}}),
            json!({"server": {"port": 9000}}),
        );
        assert_eq!(merged["server"]["port"], 9000);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            json!({"allowedOrigins": ["*"]}),
            json!({"allowedOrigins": ["*.example.com", "https://app.local"]}),
        );
        assert_eq!(merged["allowedOrigins"], json!(["*.example.com", "https://app.local"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null, "b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn missing_file_returns_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/statelink.json")).unwrap();
        assert_eq!(s.server.max_connections, SyncSettings::default().server.max_connections);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server":{"maxConnections":2,"allowedOrigins":["*.example.com"]},
                "recovery":{"maxRetries":3},
                "commands":{"allowed":["editor.save"]}}"#,
        )
        .unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.server.max_connections, 2);
        assert_eq!(s.server.allowed_origins, vec!["*.example.com"]);
        assert_eq!(s.recovery.max_retries, 3);
        assert_eq!(s.recovery.initial_delay_ms, 1000);
        assert_eq!(s.commands.allowed, vec!["editor.save"]);
        assert_eq!(s.broadcast.preferences.throttle_ms, 100);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_matches!(load_settings_from_path(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"maxConnections":0}}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        );
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_u64_range("42", 0, 100), Some(42));
        assert_eq!(parse_u64_range(" 7 ", 0, 100), Some(7));
        assert_eq!(parse_u64_range("101", 0, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 100), None);
        assert_eq!(parse_u64_range("abc", 0, 100), None);
    }

    #[test]
    fn parse_origin_list() {
        assert_eq!(
            parse_list("*.example.com, https://a.dev ,,"),
            vec!["*.example.com", "https://a.dev"]
        );
        assert!(parse_list(" , ").is_empty());
    }
}
