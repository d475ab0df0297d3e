use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::Result;
use crate::sync::Synchronizer;
use crate::types::*;

/// One paired thermostat. Holds only its serial; state lives in the store.
#[derive(Clone)]
pub struct Thermostat {
    serial: String,
    sync: Synchronizer,
}

impl Thermostat {
    /// Register `serial` with the synchronizer and return its handle.
    pub async fn attach(sync: &Synchronizer, serial: impl Into<String>) -> Self {
        let thermostat = Self {
            serial: serial.into(),
            sync: sync.clone(),
        };
        sync.register_device(&thermostat.serial).await;
        thermostat
    }

    pub async fn detach(self) {
        self.sync.unregister_device(&self.serial).await;
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn state(&self) -> Option<ReconciledState> {
        self.sync.state(&self.serial)
    }

    /// Unknown devices count as available until a fetch says otherwise.
    pub fn availability(&self) -> Availability {
        self.sync.availability(&self.serial).unwrap_or_default()
    }

    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        debug!(serial = %self.serial, celsius, "setting target temperature");
        self.sync.set_target_temperature(&self.serial, celsius).await
    }

    /// Holiday and off cannot be requested.
    pub async fn set_operating_mode(&self, mode: OperatingMode) -> Result<()> {
        if self.state().and_then(|s| s.operating_mode) == Some(mode) {
            return Ok(());
        }
        let settable = SettableMode::try_from(mode)?;
        debug!(serial = %self.serial, %mode, "setting operating mode");
        self.sync.set_mode(&self.serial, settable).await
    }

    pub async fn set_settable_mode(&self, mode: SettableMode) -> Result<()> {
        if self.state().and_then(|s| s.settable_mode) == Some(mode) {
            return Ok(());
        }
        debug!(serial = %self.serial, %mode, "setting settable mode");
        self.sync.set_mode(&self.serial, mode).await
    }

    /// Events for this device only.
    pub fn updates(&self) -> DeviceUpdates {
        DeviceUpdates {
            serial: self.serial.clone(),
            events: self.sync.subscribe(),
        }
    }
}

pub struct DeviceUpdates {
    serial: String,
    events: broadcast::Receiver<Event>,
}

impl DeviceUpdates {
    /// Next event for this device, or `None` once the synchronizer is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.serial() == Some(self.serial.as_str()) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(serial = %self.serial, skipped, "device update stream lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
