//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//! 4. Validate the result

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{BusBackend, CourierSettings};

/// Resolve the path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid resulting
/// configuration is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;
    if !path.exists() {
        debug!(?path, "settings file not found, using defaults");
        return Ok(serde_json::from_value(defaults)?);
    }

    debug!(?path, "loading settings from file");
    let parse_err = |source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let overlay: Value = serde_json::from_str(&content).map_err(parse_err)?;
    serde_json::from_value(deep_merge(defaults, overlay)).map_err(parse_err)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (the file/default value stays).
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    // ── Node / server ───────────────────────────────────────────────
    if let Some(v) = read_env_string("COURIER_NODE_NAME") {
        settings.node.name = v;
    }
    if let Some(v) = read_env_string("COURIER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_in("COURIER_PORT", 0..=u16::MAX) {
        settings.server.port = v;
    }

    // ── Fan-out ─────────────────────────────────────────────────────
    if let Some(v) = read_env_in("COURIER_HEALTH_CHECK_MS", 100..=600_000) {
        settings.fanout.health_check_interval_ms = v;
    }
    if let Some(v) = read_env_in("COURIER_SHARD_COUNT", 1..=4096) {
        settings.fanout.shard_count = Some(v);
    }

    // ── Presence / bus ──────────────────────────────────────────────
    if let Some(v) = read_env_string("COURIER_DB_PATH") {
        settings.presence.db_path = v;
    }
    if let Some(v) = read_env_string("COURIER_BUS_URL") {
        settings.bus.url = Some(v);
        settings.bus.backend = BusBackend::Redis;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Parse `val` and accept it only inside `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_env_in<T>(name: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd + Display + Clone,
{
    let raw = std::env::var(name).ok()?;
    let parsed = parse_in_range(&raw, range.clone());
    if parsed.is_none() {
        warn!(
            key = name,
            value = %raw,
            min = %range.start(),
            max = %range.end(),
            "ignoring out-of-range environment override"
        );
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    
    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "fanout": {"sessionQueueDepth": 256, "shardQueueDepth": 4096}
        });
        let source = serde_json::json!({
            "fanout": {"sessionQueueDepth": 64}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["fanout"]["sessionQueueDepth"], 64);
        assert_eq!(merged["fanout"]["shardQueueDepth"], 4096);
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        assert_eq!(deep_merge(target, source)["a"], 42);
    }

    // ── load_file_layer ─────────────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file_layer(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.fanout.session_queue_depth, 256);
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"node": {"name": "n1"}, "fanout": {"shardCount": 4}, "server": {"port": 9100}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.node.name, "n1");
        assert_eq!(settings.fanout.shard_count, Some(4));
        assert_eq!(settings.fanout.health_check_interval_ms, 5_000);
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"fanout": {"shardQueueDepth": 0}}"#).unwrap();
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Invalid {
                field: "fanout.sessionQueueDepth",
                ..
            }
        ));
    }

    // ── parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_in_range("9000", 0..=u16::MAX), Some(9000));
        assert_eq!(parse_in_range::<u16>("70000", 0..=u16::MAX), None);
        assert_eq!(parse_in_range("50", 100..=1000_u64), None);
        assert_eq!(parse_in_range(" 5000 ", 100..=600_000_u64), Some(5000));
        assert_eq!(parse_in_range("0", 1..=10_usize), None);
        assert_eq!(parse_in_range::<usize>("abc", 1..=10), None);
    }
}
