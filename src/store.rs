use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::codec::{decode_mode, settable_for, EncodedCommand};
use crate::diff::diff_states;
use crate::protocol::DeviceRecord;
use crate::types::*;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// One device's entry in the store.
#[derive(Debug, Clone, Default)]
pub struct DeviceEntry {
    pub state: ReconciledState,
    pub availability: Availability,
    pub updated_at: Option<DateTime<Utc>>,
    /// Last raw set-point seen, for antifreeze detection on partial records.
    set_point_raw: Option<i64>,
}

/// Reconciled state of every known device. Writes come only from the engine.
pub struct DeviceStore {
    entries: RwLock<HashMap<String, DeviceEntry>>,
    events: broadcast::Sender<Event>,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn get(&self, serial: &str) -> Option<ReconciledState> {
        self.entries.read().get(serial).map(|e| e.state.clone())
    }

    pub fn availability(&self, serial: &str) -> Option<Availability> {
        self.entries.read().get(serial).map(|e| e.availability.clone())
    }

    pub fn serials(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Merge a wire record into the device's state. Absent fields leave the
    /// stored value untouched. A reconcile error marks the device unavailable
    /// with the error message and is returned to the caller.
    pub(crate) fn apply_record(&self, record: &DeviceRecord) -> Result<()> {
        let serial = record.serial_number.as_str();
        let (events, outcome) = {
            let mut entries = self.entries.write();
            let entry = entries.entry(serial.to_string()).or_default();
            let previous = entry.state.clone();
            let was_available = entry.availability.is_available() && entry.updated_at.is_some();

            let outcome = reconcile(entry, record);
            entry.updated_at = Some(Utc::now());
            entry.availability = match &outcome {
                Ok(()) => Availability::Available,
                Err(e) => Availability::Unavailable(e.to_string()),
            };

            let mut events = diff_states(serial, &previous, &entry.state);
            events.push(Event::DeviceUpdated {
                serial: serial.to_string(),
                state: entry.state.clone(),
            });
            match &entry.availability {
                Availability::Unavailable(reason) => events.push(Event::DeviceUnavailable {
                    serial: serial.to_string(),
                    reason: reason.clone(),
                }),
                Availability::Available if !was_available => events.push(Event::DeviceAvailable {
                    serial: serial.to_string(),
                }),
                Availability::Available => {}
            }
            (events, outcome)
        };

        if let Err(ref e) = outcome {
            debug!(serial, error = %e, "reconcile failed");
        }
        self.emit(events);
        outcome
    }

    /// The cloud no longer reports this device.
    pub(crate) fn mark_missing(&self, serial: &str) {
        let reason = Error::NotFound(serial.to_string()).to_string();
        self.set_unavailable(serial, reason, true);
    }

    pub(crate) fn mark_unavailable(&self, serial: &str, reason: impl Into<String>) {
        self.set_unavailable(serial, reason.into(), false);
    }

    fn set_unavailable(&self, serial: &str, reason: String, disconnect: bool) {
        let events = {
            let mut entries = self.entries.write();
            let entry = entries.entry(serial.to_string()).or_default();
            let previous = entry.state.clone();
            if disconnect {
                entry.state.connected = false;
            }
            let changed = entry.availability.reason() != Some(reason.as_str());
            entry.availability = Availability::Unavailable(reason.clone());

            let mut events = diff_states(serial, &previous, &entry.state);
            if changed {
                events.push(Event::DeviceUnavailable {
                    serial: serial.to_string(),
                    reason,
                });
            }
            events
        };
        self.emit(events);
    }

    /// Optimistic update after the cloud accepted a write.
    pub(crate) fn apply_command(&self, serial: &str, command: &EncodedCommand) {
        let events = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(serial) else {
                return;
            };
            let previous = entry.state.clone();

            if let Some(raw) = command.wire.temperature {
                entry.set_point_raw = Some(raw);
                entry.state.target_temperature = Some(Temperature::from_raw(raw));
            }
            entry.state.operating_mode = Some(command.operating_mode);
            entry.state.settable_mode =
                Some(settable_for(command.operating_mode, entry.set_point_raw));

            let mut events = diff_states(serial, &previous, &entry.state);
            if !events.is_empty() {
                events.push(Event::DeviceUpdated {
                    serial: serial.to_string(),
                    state: entry.state.clone(),
                });
            }
            events
        };
        self.emit(events);
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            debug!(count = entries.len(), "clearing device store");
            entries.clear();
        }
    }

    pub(crate) fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            // No receivers is not an error.
            let _ = self.events.send(event);
        }
    }
}

fn reconcile(entry: &mut DeviceEntry, record: &DeviceRecord) -> Result<()> {
    let state = &mut entry.state;

    if let Some(online) = record.online {
        state.connected = online;
        if !online {
            return Err(Error::Offline);
        }
    }
    if let Some(raw) = record.current_temperature {
        state.measure_temperature = Some(Temperature::from_raw(raw));
    }
    if let Some(heating) = record.is_heating {
        state.heating = heating;
    }
    if let Some(raw) = record.set_point_temperature {
        entry.set_point_raw = Some(raw);
        state.target_temperature = Some(Temperature::from_raw(raw));
    }
    if let Some(code) = record.mode {
        match decode_mode(code) {
            Ok((operating, _)) => state.operating_mode = Some(operating),
            Err(e) => warn!(serial = %record.serial_number, error = %e, "ignoring mode"),
        }
    }
    if (record.mode.is_some() || record.set_point_temperature.is_some())
        && let Some(operating) = state.operating_mode
    {
        state.settable_mode = Some(settable_for(operating, entry.set_point_raw));
    }
    Ok(())
}
