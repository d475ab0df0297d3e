use reqwest::Url;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.senzthermostat.nvent.com";

pub const DEVICES_PATH: &str = "/api/v1/Thermostat";
const MODE_PATH: &str = "/api/v1/Mode";
const NOTIFICATION_PATH: &str = "/v1/changenotifications";

/// Hub topic for device state change notifications.
pub const NOTIFICATION_TOPIC: &str = "2";
pub const SUBSCRIBE_METHOD: &str = "Subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "Unsubscribe";
/// Server-to-client hub method carrying changed devices.
pub const NOTIFY_EVENT: &str = "Notify";

const STATE_FIELDS: &[&str] = &[
    "online",
    "currentTemperature",
    "setPointTemperature",
    "isHeating",
    "mode",
];

/// Thermostat state as reported by the cloud. Absent fields mean "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(default)]
    pub serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_temperature: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_point_temperature: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_heating: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
}

impl DeviceRecord {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial_number: serial.into(),
            ..Default::default()
        }
    }
}

/// A device list element that did not decode. Its neighbours are unaffected.
#[derive(Debug)]
pub struct InvalidRecord {
    /// `None` when the element has no usable serial number.
    pub serial_number: Option<String>,
    pub error: Error,
}

/// Decode one element of a device list on its own.
pub fn decode_record(value: &Value) -> std::result::Result<DeviceRecord, InvalidRecord> {
    let serial = value
        .get("serialNumber")
        .and_then(value_to_id)
        .ok_or_else(|| InvalidRecord {
            serial_number: None,
            error: Error::Protocol("device record without serialNumber".into()),
        })?;
    let mut fields = value.clone();
    if let Value::Object(map) = &mut fields {
        // Numeric serials are accepted; the typed field only takes strings.
        map.remove("serialNumber");
    }
    let mut record: DeviceRecord =
        serde_json::from_value(fields).map_err(|e| InvalidRecord {
            serial_number: Some(serial.clone()),
            error: Error::Json(e),
        })?;
    record.serial_number = serial;
    Ok(record)
}

/// Mode names used in the write endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMode {
    Auto,
    Hold,
    Manual,
}

impl ApiMode {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            ApiMode::Auto => "auto",
            ApiMode::Hold => "hold",
            ApiMode::Manual => "manual",
        }
    }

    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ApiMode::Auto),
            "hold" => Some(ApiMode::Hold),
            "manual" => Some(ApiMode::Manual),
            _ => None,
        }
    }
}

/// Sent as its integer discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureType {
    Absolute = 0,
    Relative = 1,
}

impl Serialize for TemperatureType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// Body of `PUT /api/v1/Mode/{mode}`. The mode travels in the path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCommand {
    #[serde(skip)]
    pub mode: ApiMode,
    pub serial_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_type: Option<TemperatureType>,
}

impl WireCommand {
    pub fn path(&self) -> String {
        mode_path(self.mode)
    }
}

pub fn device_path(serial: &str) -> String {
    format!("{DEVICES_PATH}/{serial}")
}

pub fn mode_path(mode: ApiMode) -> String {
    format!("{MODE_PATH}/{}", mode.as_api_str())
}

pub fn notification_url(api_url: &str, token: &str) -> Result<Url> {
    let raw = format!("{}{NOTIFICATION_PATH}", api_url.trim_end_matches('/'));
    let mut url =
        Url::parse(&raw).map_err(|e| Error::Protocol(format!("invalid hub url {raw}: {e}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

/// First entry of the `Messages` array the API puts in error bodies.
pub fn parse_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("Messages")
        .or_else(|| parsed.get("messages"))?
        .get(0)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// What a `Notify` payload tells us about changed devices.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Full records; no fetch needed.
    Records(Vec<DeviceRecord>),
    /// Identifiers only.
    Devices(Vec<String>),
    /// Nothing usable; fall back to a full fetch.
    Ambiguous,
}

enum Entry {
    Record(DeviceRecord),
    Id(String),
}

pub fn parse_notification(payload: &Value) -> Notification {
    let items: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![payload],
        _ => return Notification::Ambiguous,
    };
    if items.is_empty() {
        return Notification::Ambiguous;
    }

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match classify(item) {
            Some(entry) => entries.push(entry),
            None => return Notification::Ambiguous,
        }
    }

    if entries.iter().all(|e| matches!(e, Entry::Record(_))) {
        let records = entries
            .into_iter()
            .filter_map(|e| match e {
                Entry::Record(r) => Some(r),
                Entry::Id(_) => None,
            })
            .collect();
        return Notification::Records(records);
    }

    let mut ids: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let id = match entry {
            Entry::Record(r) => r.serial_number,
            Entry::Id(id) => id,
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Notification::Devices(ids)
}

fn classify(item: &Value) -> Option<Entry> {
    match item {
        Value::Object(map) => {
            let has_state = STATE_FIELDS.iter().any(|f| map.contains_key(*f));
            if has_state && map.contains_key("serialNumber") {
                let record: DeviceRecord = serde_json::from_value(item.clone()).ok()?;
                if record.serial_number.is_empty() {
                    return None;
                }
                return Some(Entry::Record(record));
            }
            map.get("serialNumber")
                .or_else(|| map.get("id"))
                .and_then(value_to_id)
                .map(Entry::Id)
        }
        other => value_to_id(other).map(Entry::Id),
    }
}

fn value_to_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_elements_decode_independently() {
        let ok = decode_record(&json!({"serialNumber": "A1", "mode": 1})).unwrap();
        assert_eq!(ok.mode, Some(1));

        let bad = decode_record(&json!({"serialNumber": "B2", "currentTemperature": 2050.5}))
            .unwrap_err();
        assert_eq!(bad.serial_number.as_deref(), Some("B2"));
        assert!(matches!(bad.error, Error::Json(_)));

        let bad = decode_record(&json!({"serialNumber": "C3", "mode": "3"})).unwrap_err();
        assert_eq!(bad.serial_number.as_deref(), Some("C3"));

        for anonymous in [json!({"mode": 1}), json!({"serialNumber": ""}), json!(42)] {
            let bad = decode_record(&anonymous).unwrap_err();
            assert_eq!(bad.serial_number, None);
        }
    }

    #[test]
    fn partial_record_leaves_missing_fields_absent() {
        let record: DeviceRecord =
            serde_json::from_value(json!({"serialNumber": "123", "currentTemperature": 2137}))
                .unwrap();
        assert_eq!(record.serial_number, "123");
        assert_eq!(record.current_temperature, Some(2137));
        assert_eq!(record.mode, None);
        assert_eq!(record.online, None);
    }

    #[test]
    fn full_record_parses_all_fields() {
        let record: DeviceRecord = serde_json::from_value(json!({
            "serialNumber": "A1",
            "name": "Living room",
            "online": true,
            "currentTemperature": 2050,
            "setPointTemperature": 2100,
            "isHeating": true,
            "mode": 3,
            "somethingElse": [1, 2]
        }))
        .unwrap();
        assert_eq!(record.name.as_deref(), Some("Living room"));
        assert_eq!(record.online, Some(true));
        assert_eq!(record.set_point_temperature, Some(2100));
        assert_eq!(record.is_heating, Some(true));
        assert_eq!(record.mode, Some(3));
    }

    #[test]
    fn auto_command_body_is_serial_only() {
        let cmd = WireCommand {
            mode: ApiMode::Auto,
            serial_number: "A1".into(),
            temperature: None,
            temperature_type: None,
        };
        assert_eq!(serde_json::to_value(&cmd).unwrap(), json!({"serialNumber": "A1"}));
        assert_eq!(cmd.path(), "/api/v1/Mode/auto");
    }

    #[test]
    fn manual_command_body_carries_absolute_temperature() {
        let cmd = WireCommand {
            mode: ApiMode::Manual,
            serial_number: "A1".into(),
            temperature: Some(2150),
            temperature_type: Some(TemperatureType::Absolute),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"serialNumber": "A1", "temperature": 2150, "temperatureType": 0})
        );
        assert_eq!(cmd.path(), "/api/v1/Mode/manual");
    }

    #[test]
    fn api_mode_strings() {
        for mode in [ApiMode::Auto, ApiMode::Hold, ApiMode::Manual] {
            assert_eq!(ApiMode::from_api_str(mode.as_api_str()), Some(mode));
        }
        assert_eq!(ApiMode::from_api_str("holiday"), None);
    }

    #[test]
    fn notification_url_carries_token() {
        let url = notification_url("https://api.example.com/", "abc.def").unwrap();
        assert_eq!(url.path(), "/v1/changenotifications");
        assert_eq!(url.query(), Some("token=abc.def"));
    }

    #[test]
    fn notification_url_rejects_garbage() {
        assert!(matches!(
            notification_url("not a url", "t"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn error_message_from_body() {
        let body = r#"{"Messages": ["Thermostat is locked"]}"#;
        assert_eq!(parse_error_message(body).as_deref(), Some("Thermostat is locked"));
        assert_eq!(parse_error_message(r#"{"Messages": []}"#), None);
        assert_eq!(parse_error_message("<html>"), None);
    }

    #[test]
    fn notification_with_ids() {
        let payload = json!([{"id": 1234}, {"id": "5678"}, {"id": 1234}]);
        assert_eq!(
            parse_notification(&payload),
            Notification::Devices(vec!["1234".into(), "5678".into()])
        );
    }

    #[test]
    fn notification_with_full_records() {
        let payload = json!([{"serialNumber": "A1", "mode": 2, "isHeating": false}]);
        match parse_notification(&payload) {
            Notification::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].mode, Some(2));
            }
            other => panic!("expected Records, got {other:?}"),
        }
    }

    #[test]
    fn notification_mixed_entries_fall_back_to_ids() {
        let payload = json!([{"serialNumber": "A1", "mode": 2}, {"id": "B2"}]);
        assert_eq!(
            parse_notification(&payload),
            Notification::Devices(vec!["A1".into(), "B2".into()])
        );
    }

    #[test]
    fn notification_unusable_payloads_are_ambiguous() {
        assert_eq!(parse_notification(&json!([])), Notification::Ambiguous);
        assert_eq!(parse_notification(&json!(null)), Notification::Ambiguous);
        assert_eq!(parse_notification(&json!([{"foo": 1}])), Notification::Ambiguous);
        assert_eq!(parse_notification(&json!([true])), Notification::Ambiguous);
    }
}
