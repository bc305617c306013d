//! Shared timestamp/run-id helpers for reports and persisted documents.

use chrono::{SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// RFC 3339 UTC timestamp with second precision (e.g. `2026-10-15T09:12:44Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Calendar date used for registry `added` fields (e.g. `2026-10-15`).
pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub fn new_run_id() -> String {
    Ulid::new().to_string()
}

/// Standard command response envelope shape used for `--format json`.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_rfc3339(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
