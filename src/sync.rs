use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{CredentialProvider, DeviceSettings, SettingsProvider, ThermostatApi};
use crate::codec::{ModeSettings, encode_command, setpoint_mode};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::notifications::{ChannelEvent, NotificationChannel, NotificationTransport};
use crate::poller::PollScheduler;
use crate::protocol::{
    DEFAULT_API_URL, DeviceRecord, InvalidRecord, Notification, decode_record, parse_notification,
};
use crate::store::DeviceStore;
use crate::types::*;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    pub api_url: String,
    pub sync_on_register: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            api_url: DEFAULT_API_URL.to_string(),
            sync_on_register: true,
        }
    }
}

pub struct SynchronizerBuilder {
    api: Arc<dyn ThermostatApi>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn NotificationTransport>,
    settings: Option<Arc<dyn SettingsProvider>>,
    config: SyncConfig,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl SynchronizerBuilder {
    pub fn new(
        api: Arc<dyn ThermostatApi>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        Self {
            api,
            credentials,
            transport,
            settings: None,
            config: SyncConfig::default(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_secs = interval.as_secs();
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_url = url.into();
        self
    }

    pub fn sync_on_register(mut self, enabled: bool) -> Self {
        self.config.sync_on_register = enabled;
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Synchronizer> {
        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = NotificationChannel::new(
            self.transport,
            self.credentials.clone(),
            self.config.api_url.clone(),
            events_tx,
        );
        let connection = channel.watch();
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));

        Ok(Synchronizer {
            shared: Arc::new(Shared {
                api: self.api,
                credentials: self.credentials,
                settings: self
                    .settings
                    .unwrap_or_else(|| Arc::new(DeviceSettings::default())),
                config: self.config,
                store: DeviceStore::new(),
                registry: Mutex::new(Registry::default()),
                poller: Mutex::new(PollScheduler::new(interval)),
                channel: tokio::sync::Mutex::new(channel),
                connection,
                gate: Mutex::new(FetchGate::default()),
                channel_events: Mutex::new(Some(events_rx)),
                coordinator: Mutex::new(None),
                logger,
            }),
        })
    }
}

#[derive(Default)]
struct Registry {
    devices: HashSet<String>,
    /// Bumped whenever the engine goes idle; fetches started under an older
    /// generation are discarded.
    generation: u64,
    shut_down: bool,
}

// `None` is the whole device list.
type FetchTarget = Option<String>;

/// Fetches in flight, keyed by target, each with a rerun flag.
#[derive(Default)]
struct FetchGate {
    running: HashMap<FetchTarget, bool>,
}

impl FetchGate {
    fn enter(&mut self, target: &FetchTarget) -> bool {
        match self.running.get_mut(target) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                self.running.insert(target.clone(), false);
                true
            }
        }
    }

    // Consumes a pending rerun or releases the target in one step.
    fn finish(&mut self, target: &FetchTarget) -> bool {
        match self.running.get_mut(target) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                self.running.remove(target);
                false
            }
        }
    }
}

struct FetchGuard<'a> {
    gate: &'a Mutex<FetchGate>,
    target: FetchTarget,
    released: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.gate.lock().running.remove(&self.target);
        }
    }
}

struct Shared {
    api: Arc<dyn ThermostatApi>,
    credentials: Arc<dyn CredentialProvider>,
    settings: Arc<dyn SettingsProvider>,
    config: SyncConfig,
    store: DeviceStore,
    // Lock order: registry, then poller, then store.
    registry: Mutex<Registry>,
    poller: Mutex<PollScheduler>,
    channel: tokio::sync::Mutex<NotificationChannel>,
    connection: watch::Receiver<ConnectionState>,
    gate: Mutex<FetchGate>,
    channel_events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    logger: Option<Mutex<MessageLogger>>,
}

/// Keeps every registered thermostat in step with the cloud.
///
/// One push channel and one poll timer serve all devices. Both run while at
/// least one device is registered and stop when the last one leaves.
#[derive(Clone)]
pub struct Synchronizer {
    shared: Arc<Shared>,
}

impl Synchronizer {
    pub fn builder(
        api: Arc<dyn ThermostatApi>,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn NotificationTransport>,
    ) -> SynchronizerBuilder {
        SynchronizerBuilder::new(api, credentials, transport)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &DeviceStore {
        &self.shared.store
    }

    pub fn state(&self, serial: &str) -> Option<ReconciledState> {
        self.shared.store.get(serial)
    }

    pub fn availability(&self, serial: &str) -> Option<Availability> {
        self.shared.store.availability(serial)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.store.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.shared.registry.lock().devices.is_empty()
    }

    pub fn registered_devices(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.shared.registry.lock().devices.iter().cloned().collect();
        serials.sort();
        serials
    }

    /// The first registration starts polling and the push channel.
    pub async fn register_device(&self, serial: &str) {
        let first = {
            let mut registry = self.shared.registry.lock();
            if registry.shut_down {
                warn!(serial, "synchronizer is shut down, ignoring registration");
                return;
            }
            if !registry.devices.insert(serial.to_string()) {
                debug!(serial, "device already registered");
                return;
            }
            let count = registry.devices.len();
            debug!(serial, from = count - 1, to = count, "device registered");
            if count == 1 {
                self.arm_poller();
            }
            count == 1
        };

        if first {
            info!("first device registered, starting synchronization");
            self.ensure_coordinator();
            self.reconcile_channel().await;
        }
        if self.shared.config.sync_on_register {
            self.refresh_device(serial).await;
        }
    }

    /// Removing the last device stops everything and clears the store. A
    /// fetch in flight finishes, but its result is dropped.
    pub async fn unregister_device(&self, serial: &str) {
        let idle = {
            let mut registry = self.shared.registry.lock();
            if !registry.devices.remove(serial) {
                debug!(serial, "device was not registered");
                return;
            }
            let count = registry.devices.len();
            debug!(serial, from = count + 1, to = count, "device unregistered");
            if count == 0 {
                registry.generation += 1;
                self.shared.poller.lock().disable();
                self.shared.store.clear();
            }
            count == 0
        };

        if idle {
            info!("last device unregistered, stopping synchronization");
            self.reconcile_channel().await;
        }
    }

    /// Calls made while a fetch is running collapse into one follow-up fetch.
    pub async fn fetch_all(&self) {
        self.coalesced(None).await;
    }

    pub async fn refresh_device(&self, serial: &str) {
        self.coalesced(Some(serial.to_string())).await;
    }

    /// Handle a `Notify` payload: pause polling, fetch what changed, resume.
    pub async fn on_push_notification(&self, payload: Value) {
        if !self.is_active() {
            debug!("ignoring push notification while idle");
            return;
        }
        if let Some(ref logger) = self.shared.logger {
            logger.lock().log_notification(&payload);
        }

        self.shared.poller.lock().disable();
        match parse_notification(&payload) {
            Notification::Records(records) => self.apply_records(&records),
            Notification::Devices(ids) if ids.len() == 1 => self.refresh_device(&ids[0]).await,
            Notification::Devices(_) | Notification::Ambiguous => self.fetch_all().await,
        }
        self.resume_polling();
    }

    /// Reconnecting afterwards is up to the caller, via `resume_notifications`.
    pub fn on_credentials_expired(&self) {
        info!("access token rejected, requesting refresh");
        let credentials = self.shared.credentials.clone();
        tokio::spawn(async move {
            if let Err(e) = credentials.refresh_token().await {
                warn!(error = %e, "token refresh failed");
            }
        });
    }

    pub async fn resume_notifications(&self) {
        if self.is_active() {
            self.reconcile_channel().await;
        }
    }

    /// The store is updated optimistically once the cloud accepts the write.
    pub async fn submit_command(
        &self,
        serial: &str,
        mode: SettableMode,
        temperature: Option<f64>,
    ) -> Result<()> {
        let current = self.shared.store.get(serial).and_then(|s| s.operating_mode);
        let settings = ModeSettings::load(self.shared.settings.as_ref(), serial);
        let command = encode_command(serial, mode, temperature, current, &settings)?;
        debug!(serial, %mode, path = %command.wire.path(), "submitting command");

        if let Err(e) = self.shared.api.write_command(&command.wire).await {
            warn!(serial, error = %e, "command failed");
            if e.is_auth() {
                self.on_credentials_expired();
            }
            return Err(e);
        }
        self.shared.store.apply_command(serial, &command);
        Ok(())
    }

    /// Boost keeps boosting; any other mode switches to constant.
    pub async fn set_target_temperature(&self, serial: &str, celsius: f64) -> Result<()> {
        let current = self.shared.store.get(serial).and_then(|s| s.settable_mode);
        self.submit_command(serial, setpoint_mode(current), Some(celsius))
            .await
    }

    pub async fn set_mode(&self, serial: &str, mode: SettableMode) -> Result<()> {
        self.submit_command(serial, mode, None).await
    }

    // Final: later registrations are ignored.
    pub async fn shutdown(&self) {
        {
            let mut registry = self.shared.registry.lock();
            registry.shut_down = true;
            registry.devices.clear();
            registry.generation += 1;
            self.shared.poller.lock().disable();
            self.shared.store.clear();
        }
        self.reconcile_channel().await;
        if let Some(task) = self.shared.coordinator.lock().take() {
            task.abort();
        }
        info!("synchronizer shut down");
    }

    async fn coalesced(&self, target: FetchTarget) {
        if !self.shared.gate.lock().enter(&target) {
            debug!(device = ?target, "fetch in flight, coalescing");
            return;
        }
        let mut guard = FetchGuard {
            gate: &self.shared.gate,
            target,
            released: false,
        };

        loop {
            match guard.target.as_deref() {
                None => self.fetch_once().await,
                Some(serial) => self.sync_device(serial).await,
            }
            if !self.shared.gate.lock().finish(&guard.target) {
                guard.released = true;
                break;
            }
            debug!(device = ?guard.target, "running coalesced fetch");
        }
    }

    async fn fetch_once(&self) {
        let generation = self.shared.registry.lock().generation;
        let records = match self.shared.api.fetch_devices().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "device list fetch failed");
                if e.is_auth() {
                    self.on_credentials_expired();
                }
                return;
            }
        };

        let registry = self.shared.registry.lock();
        if registry.devices.is_empty() || registry.generation != generation {
            debug!(count = records.len(), "engine went idle, discarding fetch result");
            return;
        }

        let mut seen = HashSet::with_capacity(records.len());
        for value in &records {
            match decode_record(value) {
                Ok(record) => {
                    // Errors stay with the device; the store marks it unavailable.
                    let _ = self.shared.store.apply_record(&record);
                    seen.insert(record.serial_number);
                }
                Err(InvalidRecord {
                    serial_number: Some(serial),
                    error,
                }) => {
                    warn!(serial = %serial, error = %error, "undecodable device record");
                    self.shared.store.mark_unavailable(&serial, error.to_string());
                    seen.insert(serial);
                }
                Err(InvalidRecord { error, .. }) => {
                    debug!(error = %error, "skipping device record without serial");
                }
            }
        }

        let mut known: HashSet<String> = self.shared.store.serials().into_iter().collect();
        known.extend(registry.devices.iter().cloned());
        for serial in known.iter().filter(|s| !seen.contains(*s)) {
            debug!(serial = %serial, "device missing from fetch result");
            self.shared.store.mark_missing(serial);
        }
    }

    async fn sync_device(&self, serial: &str) {
        let generation = self.shared.registry.lock().generation;
        let result = self.shared.api.fetch_device(serial).await;

        let registry = self.shared.registry.lock();
        if registry.devices.is_empty() || registry.generation != generation {
            debug!(serial, "engine went idle, discarding device fetch");
            return;
        }
        match result {
            Ok(mut record) => {
                if record.serial_number.is_empty() {
                    record.serial_number = serial.to_string();
                }
                let _ = self.shared.store.apply_record(&record);
            }
            Err(e) if e.is_not_found() => self.shared.store.mark_missing(serial),
            Err(e) => {
                warn!(serial, error = %e, "device fetch failed");
                self.shared.store.mark_unavailable(serial, e.to_string());
                drop(registry);
                if e.is_auth() {
                    self.on_credentials_expired();
                }
            }
        }
    }

    fn apply_records(&self, records: &[DeviceRecord]) {
        let registry = self.shared.registry.lock();
        if registry.devices.is_empty() {
            return;
        }
        for record in records {
            let _ = self.shared.store.apply_record(record);
        }
    }

    // Registry must be locked.
    fn arm_poller(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.poller.lock().enable(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => {
                        Synchronizer { shared }.fetch_all().await;
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            }
        });
    }

    fn resume_polling(&self) {
        let registry = self.shared.registry.lock();
        if !registry.devices.is_empty() {
            self.arm_poller();
        }
    }

    async fn reconcile_channel(&self) {
        let mut channel = self.shared.channel.lock().await;
        if self.is_active() {
            match channel.start().await {
                Ok(()) => {}
                Err(Error::NoCredentials) => {
                    info!("no access token, push notifications unavailable")
                }
                Err(e) => warn!(error = %e, "push notifications unavailable, polling only"),
            }
        } else {
            channel.stop().await;
        }
    }

    fn ensure_coordinator(&self) {
        let Some(events) = self.shared.channel_events.lock().take() else {
            return;
        };
        let task = tokio::spawn(coordinate(Arc::downgrade(&self.shared), events));
        *self.shared.coordinator.lock() = Some(task);
    }
}

async fn coordinate(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let sync = Synchronizer { shared };
        match event {
            ChannelEvent::Notification(payload) => {
                tokio::spawn(async move { sync.on_push_notification(payload).await });
            }
            ChannelEvent::StateChanged { from, to } => {
                sync.shared.store.publish(Event::ConnectionStateChanged(to));
                if from == ConnectionState::Reconnecting && to == ConnectionState::Connected {
                    debug!("channel reconnected, catching up");
                    tokio::spawn(async move { sync.fetch_all().await });
                }
            }
            ChannelEvent::CredentialsExpired => sync.on_credentials_expired(),
        }
    }
    debug!("coordinator stopped");
}
