use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::diff::diff_json;

/// How device list responses are written to the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Every response body in full.
    Full,
    /// The first body in full, then only changed fields.
    Diffed,
}

/// Append-only NDJSON record of API traffic and push notifications.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    previous_devices: Option<Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous_devices: None,
        })
    }

    pub fn log_request(&mut self, method: &str, path: &str) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "method": method,
            "path": path,
        }));
    }

    pub fn log_error(&mut self, path: &str, status: u16, body: &str) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "err",
            "path": path,
            "status": status,
            "body": body,
        }));
    }

    pub fn log_command(&mut self, path: &str, body: &Value) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "path": path,
            "body": body,
        }));
    }

    pub fn log_notification(&mut self, payload: &Value) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "push",
            "payload": payload,
        }));
    }

    /// Single-device responses are always logged in full.
    pub fn log_device(&mut self, body: &Value) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "device",
            "body": body,
        }));
    }

    pub fn log_devices(&mut self, body: &Value) {
        let indexed = index_by_serial(body);

        let entry = match (self.mode, &self.previous_devices) {
            (MessageLogMode::Full, _) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "devices",
                "body": body,
            }),
            (MessageLogMode::Diffed, None) => json!({
                "ts": Utc::now().to_rfc3339(),
                "dir": "devices",
                "full": true,
                "body": body,
            }),
            (MessageLogMode::Diffed, Some(previous)) => {
                let mut changes = Vec::new();
                diff_json(previous, &indexed, "", &mut changes);
                let changes: Vec<Value> = changes
                    .into_iter()
                    .map(|c| json!({ "path": c.path, "old": c.old, "new": c.new }))
                    .collect();
                json!({
                    "ts": Utc::now().to_rfc3339(),
                    "dir": "devices",
                    "changes": changes,
                })
            }
        };

        self.write_line(&entry);
        self.previous_devices = Some(indexed);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write message log entry: {e}");
        }
    }
}

/// Keys a device list by serial number so diffs survive reordering.
fn index_by_serial(body: &Value) -> Value {
    let Value::Array(items) = body else {
        return body.clone();
    };
    let mut map = Map::new();
    for (i, item) in items.iter().enumerate() {
        let key = item
            .get("serialNumber")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{i}"));
        map.insert(key, item.clone());
    }
    Value::Object(map)
}
