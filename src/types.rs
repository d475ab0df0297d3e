use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;

/// Temperature in degrees Celsius.
/// The cloud encodes temperatures as integer hundredths of a degree.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Temperature(f64);

impl Temperature {
    pub fn from_celsius(c: f64) -> Self {
        Self(c)
    }

    /// Decode a wire value (hundredths of a degree) at 0.1° resolution.
    pub fn from_raw(raw: i64) -> Self {
        Self(codec::decode_temperature(raw, codec::TEMPERATURE_DIVISOR))
    }

    pub fn celsius(&self) -> f64 {
        self.0
    }

    /// Wire encoding: degrees × 100, rounded to the nearest integer.
    pub fn to_raw(&self) -> i64 {
        codec::encode_temperature(self.0)
    }

    /// Round to the 0.5° steps accepted for target temperatures.
    pub fn to_half_degree(&self) -> Self {
        Self(codec::round_to_half(self.0))
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}\u{00b0}C", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Program,
    Boost,
    Constant,
    Holiday,
    Off,
}

impl OperatingMode {
    pub fn as_capability_str(&self) -> &'static str {
        match self {
            OperatingMode::Program => "program",
            OperatingMode::Boost => "boost",
            OperatingMode::Constant => "constant",
            OperatingMode::Holiday => "holiday",
            OperatingMode::Off => "off",
        }
    }

    pub fn from_capability_str(s: &str) -> Option<Self> {
        match s {
            "program" => Some(OperatingMode::Program),
            "boost" => Some(OperatingMode::Boost),
            "constant" => Some(OperatingMode::Constant),
            "holiday" => Some(OperatingMode::Holiday),
            "off" => Some(OperatingMode::Off),
            _ => None,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_capability_str())
    }
}

/// Modes a user may request directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettableMode {
    Program,
    Boost,
    Constant,
    Antifreeze,
    None,
}

impl SettableMode {
    pub fn as_capability_str(&self) -> &'static str {
        match self {
            SettableMode::Program => "program",
            SettableMode::Boost => "boost",
            SettableMode::Constant => "constant",
            SettableMode::Antifreeze => "antifreeze",
            SettableMode::None => "none",
        }
    }

    pub fn from_capability_str(s: &str) -> Option<Self> {
        match s {
            "program" => Some(SettableMode::Program),
            "boost" => Some(SettableMode::Boost),
            "constant" => Some(SettableMode::Constant),
            "antifreeze" => Some(SettableMode::Antifreeze),
            "none" => Some(SettableMode::None),
            _ => None,
        }
    }
}

impl fmt::Display for SettableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_capability_str())
    }
}

impl TryFrom<OperatingMode> for SettableMode {
    type Error = crate::Error;

    /// Holiday and off are entered by the device itself and cannot be requested.
    fn try_from(mode: OperatingMode) -> crate::Result<Self> {
        match mode {
            OperatingMode::Program => Ok(SettableMode::Program),
            OperatingMode::Boost => Ok(SettableMode::Boost),
            OperatingMode::Constant => Ok(SettableMode::Constant),
            OperatingMode::Holiday | OperatingMode::Off => Err(crate::Error::InvalidMode(format!(
                "'{mode}' cannot be set through the API"
            ))),
        }
    }
}

/// Decoded capability model of one thermostat.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciledState {
    pub connected: bool,
    pub measure_temperature: Option<Temperature>,
    pub target_temperature: Option<Temperature>,
    pub heating: bool,
    pub operating_mode: Option<OperatingMode>,
    pub settable_mode: Option<SettableMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum Availability {
    #[default]
    Available,
    Unavailable(String),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Availability::Available => None,
            Availability::Unavailable(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// States in which a `start()` has nothing left to do.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Events delivered to subscribers of the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceUpdated { serial: String, state: ReconciledState },
    DeviceUnavailable { serial: String, reason: String },
    DeviceAvailable { serial: String },
    ConnectionStateChanged(ConnectionState),

    MeasureTemperatureChanged { serial: String, temp: Temperature },
    TargetTemperatureChanged { serial: String, temp: Temperature },
    HeatingChanged { serial: String, heating: bool },
    OperatingModeChanged { serial: String, mode: OperatingMode },
    SettableModeChanged { serial: String, mode: SettableMode },
    ConnectedChanged { serial: String, connected: bool },
}

impl Event {
    /// Device the event belongs to; `None` for engine-wide events.
    pub fn serial(&self) -> Option<&str> {
        match self {
            Event::ConnectionStateChanged(_) => None,
            Event::DeviceUpdated { serial, .. }
            | Event::DeviceUnavailable { serial, .. }
            | Event::DeviceAvailable { serial }
            | Event::MeasureTemperatureChanged { serial, .. }
            | Event::TargetTemperatureChanged { serial, .. }
            | Event::HeatingChanged { serial, .. }
            | Event::OperatingModeChanged { serial, .. }
            | Event::SettableModeChanged { serial, .. }
            | Event::ConnectedChanged { serial, .. } => Some(serial),
        }
    }
}
