use serde_json::{Map, Value};

use crate::types::*;

/// A leaf that differs between two JSON documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JsonChange {
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// Walks `current` and records every leaf that differs from `previous`.
/// Keys missing from `current` are not reported; absent means unchanged.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<JsonChange>,
) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            for (key, curr_val) in curr_map {
                let path = if path_prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{path_prefix}.{key}")
                };
                match prev_map.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None if curr_val.is_object() => {
                        diff_json(&Value::Object(Map::new()), curr_val, &path, changes);
                    }
                    None => changes.push(JsonChange {
                        path,
                        old: Value::Null,
                        new: curr_val.clone(),
                    }),
                }
            }
        }
        (prev, curr) if prev != curr => changes.push(JsonChange {
            path: path_prefix.to_string(),
            old: prev.clone(),
            new: curr.clone(),
        }),
        _ => {}
    }
}

/// Typed change events between two reconciled states of one device.
pub(crate) fn diff_states(
    serial: &str,
    previous: &ReconciledState,
    current: &ReconciledState,
) -> Vec<Event> {
    let mut events = Vec::new();
    let serial = serial.to_string();

    if previous.connected != current.connected {
        events.push(Event::ConnectedChanged {
            serial: serial.clone(),
            connected: current.connected,
        });
    }
    if let Some(temp) = current.measure_temperature
        && previous.measure_temperature != Some(temp)
    {
        events.push(Event::MeasureTemperatureChanged {
            serial: serial.clone(),
            temp,
        });
    }
    if let Some(temp) = current.target_temperature
        && previous.target_temperature != Some(temp)
    {
        events.push(Event::TargetTemperatureChanged {
            serial: serial.clone(),
            temp,
        });
    }
    if previous.heating != current.heating {
        events.push(Event::HeatingChanged {
            serial: serial.clone(),
            heating: current.heating,
        });
    }
    if let Some(mode) = current.operating_mode
        && previous.operating_mode != Some(mode)
    {
        events.push(Event::OperatingModeChanged {
            serial: serial.clone(),
            mode,
        });
    }
    if let Some(mode) = current.settable_mode
        && previous.settable_mode != Some(mode)
    {
        events.push(Event::SettableModeChanged { serial, mode });
    }

    events
}
