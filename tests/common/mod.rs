#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore, mpsc};

use senz_sync::protocol::device_path;
use senz_sync::{
    CredentialProvider, DeviceRecord, Error, HubConnection, NotificationTransport, Result,
    Synchronizer, ThermostatApi, TransportEvent, WireCommand,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn record(serial: &str, mode: i64, set_point: i64) -> DeviceRecord {
    DeviceRecord {
        online: Some(true),
        current_temperature: Some(2050),
        set_point_temperature: Some(set_point),
        is_heating: Some(false),
        mode: Some(mode),
        ..DeviceRecord::new(serial)
    }
}

#[derive(Default)]
pub struct FakeApi {
    pub devices: Mutex<Vec<DeviceRecord>>,
    pub fetch_all_calls: AtomicUsize,
    pub fetch_device_calls: Mutex<Vec<String>>,
    /// Appended verbatim to every list response.
    pub raw_records: Mutex<Vec<Value>>,
    pub writes: Mutex<Vec<WireCommand>>,
    pub fail_next_fetch: Mutex<Option<Error>>,
    pub fail_next_write: Mutex<Option<Error>>,
    /// When set, list fetches wait for a permit before answering.
    pub block: Mutex<Option<Arc<Semaphore>>>,
    /// Same for single-device fetches.
    pub block_device: Mutex<Option<Arc<Semaphore>>>,
    pub entered: Notify,
    pub device_entered: Notify,
    device_in_flight: AtomicUsize,
    pub max_device_in_flight: AtomicUsize,
}

impl FakeApi {
    pub fn with_devices(devices: Vec<DeviceRecord>) -> Arc<Self> {
        let api = Self::default();
        *api.devices.lock() = devices;
        Arc::new(api)
    }

    pub fn set_devices(&self, devices: Vec<DeviceRecord>) {
        *self.devices.lock() = devices;
    }

    pub fn fetches(&self) -> usize {
        self.fetch_all_calls.load(Ordering::SeqCst)
    }

    pub fn block_fetches(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.block.lock() = Some(semaphore.clone());
        semaphore
    }

    pub fn block_device_fetches(&self) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.block_device.lock() = Some(semaphore.clone());
        semaphore
    }

    pub fn device_fetches(&self) -> usize {
        self.fetch_device_calls.lock().len()
    }
}

#[async_trait]
impl ThermostatApi for FakeApi {
    async fn fetch_devices(&self) -> Result<Vec<Value>> {
        self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let block = self.block.lock().clone();
        if let Some(semaphore) = block {
            semaphore.acquire().await.unwrap().forget();
        }
        if let Some(e) = self.fail_next_fetch.lock().take() {
            return Err(e);
        }
        let mut body: Vec<Value> = self
            .devices
            .lock()
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect();
        body.extend(self.raw_records.lock().iter().cloned());
        Ok(body)
    }

    async fn fetch_device(&self, serial: &str) -> Result<DeviceRecord> {
        self.fetch_device_calls.lock().push(serial.to_string());
        self.device_entered.notify_one();
        let now = self.device_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_device_in_flight.fetch_max(now, Ordering::SeqCst);
        let block = self.block_device.lock().clone();
        if let Some(semaphore) = block {
            semaphore.acquire().await.unwrap().forget();
        }
        self.device_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.devices
            .lock()
            .iter()
            .find(|r| r.serial_number == serial)
            .cloned()
            .ok_or_else(|| Error::NotFound(device_path(serial)))
    }

    async fn write_command(&self, command: &WireCommand) -> Result<()> {
        if let Some(e) = self.fail_next_write.lock().take() {
            return Err(e);
        }
        self.writes.lock().push(command.clone());
        Ok(())
    }
}

pub struct FakeCredentials {
    pub token: Mutex<Option<String>>,
    pub refreshes: AtomicUsize,
    pub refreshed: Notify,
}

impl FakeCredentials {
    pub fn new(token: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(token.map(str::to_string)),
            refreshes: AtomicUsize::new(0),
            refreshed: Notify::new(),
        })
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    fn access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    async fn refresh_token(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        *self.token.lock() = Some("refreshed".into());
        self.refreshed.notify_one();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnection {
    pub invocations: Mutex<Vec<(String, Vec<Value>)>>,
    pub stops: AtomicUsize,
}

impl FakeConnection {
    pub fn methods(&self) -> Vec<String> {
        self.invocations.lock().iter().map(|(m, _)| m.clone()).collect()
    }
}

#[async_trait]
impl HubConnection for FakeConnection {
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        self.invocations.lock().push((method.to_string(), arguments));
        Ok(Value::Null)
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub connects: AtomicUsize,
    pub fail_next: Mutex<Option<Error>>,
    pub connection: Arc<FakeConnection>,
    sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl FakeTransport {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn send(&self, event: TransportEvent) {
        let sender = self.sender.lock();
        sender
            .as_ref()
            .expect("transport not connected")
            .send(event)
            .expect("channel pump gone");
    }
}

#[async_trait]
impl NotificationTransport for FakeTransport {
    async fn connect(
        &self,
        _url: Url,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::UnboundedReceiver<TransportEvent>)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail_next.lock().take() {
            return Err(e);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        Ok((self.connection.clone(), rx))
    }
}

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub credentials: Arc<FakeCredentials>,
    pub transport: Arc<FakeTransport>,
    pub sync: Synchronizer,
}

pub fn harness(devices: Vec<DeviceRecord>, sync_on_register: bool) -> Harness {
    harness_with(devices, sync_on_register, Some("token"), Duration::from_secs(3600))
}

pub fn harness_with(
    devices: Vec<DeviceRecord>,
    sync_on_register: bool,
    token: Option<&str>,
    poll_interval: Duration,
) -> Harness {
    let api = FakeApi::with_devices(devices);
    let credentials = FakeCredentials::new(token);
    let transport = Arc::new(FakeTransport::default());
    let sync = Synchronizer::builder(api.clone(), credentials.clone(), transport.clone())
        .poll_interval(poll_interval)
        .sync_on_register(sync_on_register)
        .build()
        .unwrap();
    Harness {
        api,
        credentials,
        transport,
        sync,
    }
}

/// Waits until `check` holds, polling on the runtime.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
