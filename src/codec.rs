//! Conversions between the cloud's wire encoding and the capability model.
//!
//! Mode codes: 1 = program ("auto"), 2 = boost ("hold"), 3 = constant
//! ("manual"), 4 = holiday, 5 = off. Holiday and off can only be entered by
//! the device. The API has no antifreeze mode; it is expressed as constant
//! mode at exactly 5.0°, which is indistinguishable from a genuine 5.0°
//! constant set-point.

use tracing::trace;

use crate::protocol::{ApiMode, TemperatureType, WireCommand};
use crate::types::{OperatingMode, SettableMode, Temperature};
use crate::{Error, Result};

pub const TEMPERATURE_DIVISOR: f64 = 100.0;

/// Raw set-point used as the antifreeze sentinel (5.0°).
pub const ANTIFREEZE_RAW: i64 = 500;
pub const ANTIFREEZE_TEMPERATURE: f64 = 5.0;
pub const MIN_CONSTANT_TEMPERATURE: f64 = 5.0;

/// Per-device temperatures used when switching modes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModeSettings {
    pub boost_temperature: Option<f64>,
    pub constant_temperature: Option<f64>,
}

/// A command ready for the wire plus the mode it leaves the device in.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedCommand {
    pub wire: WireCommand,
    pub operating_mode: OperatingMode,
}

impl EncodedCommand {
    pub fn temperature(&self) -> Option<Temperature> {
        self.wire.temperature.map(Temperature::from_raw)
    }
}

pub fn decode_mode(code: i64) -> Result<(OperatingMode, SettableMode)> {
    let operating = match code {
        1 => OperatingMode::Program,
        2 => OperatingMode::Boost,
        3 => OperatingMode::Constant,
        4 => OperatingMode::Holiday,
        5 => OperatingMode::Off,
        other => return Err(Error::UnknownMode(other)),
    };
    Ok((operating, settable_for(operating, None)))
}

/// Settable mode implied by an operating mode and the raw set-point.
pub fn settable_for(operating: OperatingMode, set_point_raw: Option<i64>) -> SettableMode {
    match operating {
        OperatingMode::Program => SettableMode::Program,
        OperatingMode::Boost => SettableMode::Boost,
        OperatingMode::Constant if set_point_raw == Some(ANTIFREEZE_RAW) => SettableMode::Antifreeze,
        OperatingMode::Constant => SettableMode::Constant,
        OperatingMode::Holiday | OperatingMode::Off => SettableMode::None,
    }
}

/// `round(raw / divisor * 10) / 10`, rounding halves up.
pub fn decode_temperature(raw: i64, divisor: f64) -> f64 {
    round_half_up(raw as f64 / divisor * 10.0) / 10.0
}

pub fn encode_temperature(celsius: f64) -> i64 {
    (celsius * TEMPERATURE_DIVISOR).round() as i64
}

pub fn round_to_half(celsius: f64) -> f64 {
    round_half_up(celsius * 2.0) / 2.0
}

fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Mode used when the user changes the target temperature.
/// Only boost and constant carry a set-point; everything else becomes constant.
pub fn setpoint_mode(current: Option<SettableMode>) -> SettableMode {
    match current {
        Some(SettableMode::Boost) => SettableMode::Boost,
        _ => SettableMode::Constant,
    }
}

/// Build the write payload for switching `serial` to `mode`.
///
/// `requested` is rounded to 0.5° and takes precedence over the configured
/// boost/constant temperatures. Program (and `none`) writes never carry a
/// temperature.
pub fn encode_command(
    serial: &str,
    mode: SettableMode,
    requested: Option<f64>,
    current: Option<OperatingMode>,
    settings: &ModeSettings,
) -> Result<EncodedCommand> {
    let requested = requested.map(round_to_half);

    let (api_mode, operating, temperature) = match mode {
        SettableMode::Boost => {
            if current == Some(OperatingMode::Off) {
                return Err(Error::InvalidMode(
                    "boost is not available while the thermostat is off".into(),
                ));
            }
            (
                ApiMode::Hold,
                OperatingMode::Boost,
                requested.or(settings.boost_temperature),
            )
        }
        SettableMode::Constant => (
            ApiMode::Manual,
            OperatingMode::Constant,
            requested.or_else(|| constant_setting(settings.constant_temperature)),
        ),
        SettableMode::Antifreeze => (
            ApiMode::Manual,
            OperatingMode::Constant,
            Some(ANTIFREEZE_TEMPERATURE),
        ),
        SettableMode::Program | SettableMode::None => (ApiMode::Auto, OperatingMode::Program, None),
    };

    let temperature = temperature.map(encode_temperature);
    trace!(serial, %mode, api_mode = api_mode.as_api_str(), ?temperature, "encoded command");

    Ok(EncodedCommand {
        wire: WireCommand {
            mode: api_mode,
            serial_number: serial.to_string(),
            temperature,
            temperature_type: temperature.map(|_| TemperatureType::Absolute),
        },
        operating_mode: operating,
    })
}

/// Configured constant temperature; non-positive means "keep the current set-point".
fn constant_setting(value: Option<f64>) -> Option<f64> {
    match value {
        Some(t) if t > 0.0 => Some(t.max(MIN_CONSTANT_TEMPERATURE)),
        _ => None,
    }
}
