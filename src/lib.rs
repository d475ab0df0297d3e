mod api;
pub mod codec;
mod device;
mod diff;
mod error;
mod logger;
mod notifications;
mod poller;
pub mod protocol;
mod signalr;
mod store;
mod sync;
mod types;

pub use api::{
    BOOST_TEMPERATURE_KEY, CONSTANT_TEMPERATURE_KEY, CredentialProvider, DeviceSettings, SenzClient,
    SenzClientBuilder, SettingsProvider, StaticCredentials, ThermostatApi,
};
pub use device::{DeviceUpdates, Thermostat};
pub use error::{Error, Result};
pub use logger::MessageLogMode;
pub use notifications::{HubConnection, NotificationTransport, TransportEvent};
pub use poller::PollScheduler;
pub use protocol::{DeviceRecord, WireCommand};
pub use signalr::SignalRTransport;
pub use store::{DeviceEntry, DeviceStore};
pub use sync::{SyncConfig, Synchronizer, SynchronizerBuilder};
pub use types::*;
