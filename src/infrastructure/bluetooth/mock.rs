//! In-memory BLE stack for tests.
//!
//! Devices, services and characteristics are registered up front; every
//! handle minted carries a unique `instance` so tests can tell a cache hit
//! from a fresh OS query. Closes, CCCD writes and value writes are recorded.

use crate::domain::error::{BleError, GattStatus};
use crate::domain::models::{CharacteristicKey, ScanEvent, ScanFilter};
use crate::infrastructure::bluetooth::backend::{
    ActiveWatcher, CacheMode, GattBackend, NotifyConfig, ScanBackend, ValueChangedHandler,
    WriteMode,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MockDevice {
    pub address: u64,
    pub instance: u64,
}

#[derive(Debug, Clone)]
pub struct MockService {
    pub address: u64,
    pub uuid: Uuid,
    pub instance: u64,
}

#[derive(Debug, Clone)]
pub struct MockCharacteristic {
    pub key: CharacteristicKey,
    pub instance: u64,
}

#[derive(Debug)]
pub struct MockRegistration {
    id: u64,
}

#[derive(Default)]
struct MockCharacteristicDef {
    description: Option<String>,
    value: Vec<u8>,
}

type DescriptionHook = Box<dyn Fn(&CharacteristicKey) + Send + Sync>;
type ServiceHook = Box<dyn Fn(&Uuid) + Send + Sync>;
type RegistrationHook = Arc<dyn Fn(&CharacteristicKey) + Send + Sync>;

#[derive(Default)]
pub struct MockBackend {
    // address -> service -> characteristic (insertion ordered)
    devices: Mutex<HashMap<u64, Vec<(Uuid, Vec<(Uuid, MockCharacteristicDef)>)>>>,
    next_instance: AtomicU64,

    pub device_opens: AtomicUsize,
    pub service_queries: AtomicUsize,
    pub characteristic_queries: AtomicUsize,
    pub uncached_queries: AtomicUsize,

    query_delay: Mutex<Option<Duration>>,
    service_statuses: Mutex<VecDeque<GattStatus>>,
    cccd_status: Mutex<Option<GattStatus>>,
    description_hook: Mutex<Option<DescriptionHook>>,
    service_uuid_hook: Mutex<Option<ServiceHook>>,
    registration_hook: Mutex<Option<RegistrationHook>>,

    closed: Mutex<Vec<String>>,
    handlers: Mutex<HashMap<u64, (CharacteristicKey, ValueChangedHandler)>>,
    revocations: AtomicUsize,
    cccd_writes: Mutex<Vec<(CharacteristicKey, NotifyConfig)>>,
    writes: Mutex<Vec<(CharacteristicKey, Vec<u8>, WriteMode)>>,

    // Weak so the watcher holds the only sender, like the OS handlers do
    scan: Mutex<Option<(mpsc::WeakUnboundedSender<ScanEvent>, Arc<AtomicBool>)>>,
    silent_stop: AtomicBool,
    pub scan_filters: Mutex<Vec<ScanFilter>>,
    pub watcher_stops: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn instance(&self) -> u64 {
        self.next_instance.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_device(&self, address: u64) {
        self.devices.lock().unwrap().entry(address).or_default();
    }

    pub fn add_service(&self, address: u64, service: Uuid) {
        let mut devices = self.devices.lock().unwrap();
        devices.entry(address).or_default().push((service, Vec::new()));
    }

    pub fn add_characteristic(
        &self,
        address: u64,
        service: Uuid,
        characteristic: Uuid,
        description: Option<&str>,
    ) {
        let mut devices = self.devices.lock().unwrap();
        let services = devices.entry(address).or_default();
        let index = match services.iter().position(|(uuid, _)| *uuid == service) {
            Some(index) => index,
            None => {
                services.push((service, Vec::new()));
                services.len() - 1
            }
        };
        services[index].1.push((
            characteristic,
            MockCharacteristicDef {
                description: description.map(str::to_string),
                value: Vec::new(),
            },
        ));
    }

    pub fn set_value(&self, key: &CharacteristicKey, value: &[u8]) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(def) = Self::find_def(&mut devices, key) {
            def.value = value.to_vec();
        }
    }

    fn find_def<'a>(
        devices: &'a mut HashMap<u64, Vec<(Uuid, Vec<(Uuid, MockCharacteristicDef)>)>>,
        key: &CharacteristicKey,
    ) -> Option<&'a mut MockCharacteristicDef> {
        devices
            .get_mut(&key.address)?
            .iter_mut()
            .find(|(uuid, _)| *uuid == key.service)?
            .1
            .iter_mut()
            .find(|(uuid, _)| *uuid == key.characteristic)
            .map(|(_, def)| def)
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = Some(delay);
    }

    /// Statuses returned, in order, by full (unfiltered) service enumerations.
    pub fn script_service_statuses(&self, statuses: &[GattStatus]) {
        self.service_statuses
            .lock()
            .unwrap()
            .extend(statuses.iter().copied());
    }

    pub fn set_cccd_status(&self, status: GattStatus) {
        *self.cccd_status.lock().unwrap() = Some(status);
    }

    /// Called whenever a user description is read.
    pub fn on_description_read<F>(&self, hook: F)
    where
        F: Fn(&CharacteristicKey) + Send + Sync + 'static,
    {
        *self.description_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called whenever a service's uuid is read.
    pub fn on_service_uuid<F>(&self, hook: F)
    where
        F: Fn(&Uuid) + Send + Sync + 'static,
    {
        *self.service_uuid_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called after a value-changed handler is attached, with no mock lock held.
    pub fn on_handler_registered<F>(&self, hook: F)
    where
        F: Fn(&CharacteristicKey) + Send + Sync + 'static,
    {
        *self.registration_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Watchers started from now on drop their event sender on stop without
    /// reporting `Stopped`.
    pub fn set_silent_stop(&self, silent: bool) {
        self.silent_stop.store(silent, Ordering::SeqCst);
    }

    pub fn device_handle(&self, address: u64) -> MockDevice {
        MockDevice {
            address,
            instance: self.instance(),
        }
    }

    pub fn service_handle(&self, address: u64, uuid: Uuid) -> MockService {
        MockService {
            address,
            uuid,
            instance: self.instance(),
        }
    }

    pub fn characteristic_handle(
        &self,
        address: u64,
        service: Uuid,
        characteristic: Uuid,
    ) -> MockCharacteristic {
        MockCharacteristic {
            key: CharacteristicKey::new(address, service, characteristic),
            instance: self.instance(),
        }
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    pub fn active_handlers(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn revocations(&self) -> usize {
        self.revocations.load(Ordering::SeqCst)
    }

    pub fn cccd_writes(&self) -> Vec<(CharacteristicKey, NotifyConfig)> {
        self.cccd_writes.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(CharacteristicKey, Vec<u8>, WriteMode)> {
        self.writes.lock().unwrap().clone()
    }

    /// Simulate the peripheral pushing a new value.
    pub fn notify(&self, key: &CharacteristicKey, data: &[u8]) -> usize {
        let handlers: Vec<ValueChangedHandler> = self
            .handlers
            .lock()
            .unwrap()
            .values()
            .filter(|(k, _)| k == key)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }

    /// Simulate the OS watcher reporting an event. Returns false when the
    /// watcher has no data-event handlers attached.
    pub fn emit_scan_event(&self, event: ScanEvent) -> bool {
        let scan = self.scan.lock().unwrap();
        match scan.as_ref() {
            Some((tx, delivering)) if delivering.load(Ordering::SeqCst) => tx
                .upgrade()
                .is_some_and(|tx| tx.send(event).is_ok()),
            _ => false,
        }
    }

    async fn delay(&self) {
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn count_mode(&self, mode: CacheMode) {
        if mode == CacheMode::Uncached {
            self.uncached_queries.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl GattBackend for MockBackend {
    type Device = MockDevice;
    type Service = MockService;
    type Characteristic = MockCharacteristic;
    type Registration = MockRegistration;

    async fn open_device(&self, address: u64) -> Result<Option<MockDevice>, BleError> {
        self.device_opens.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let known = self.devices.lock().unwrap().contains_key(&address);
        Ok(known.then(|| self.device_handle(address)))
    }

    async fn services(
        &self,
        device: &MockDevice,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<MockService>, BleError> {
        self.service_queries.fetch_add(1, Ordering::SeqCst);
        self.count_mode(mode);
        self.delay().await;

        if filter.is_none() {
            let scripted = self.service_statuses.lock().unwrap().pop_front();
            if let Some(status) = scripted {
                BleError::check_status(status)?;
            }
        }

        let uuids: Vec<Uuid> = self
            .devices
            .lock()
            .unwrap()
            .get(&device.address)
            .map(|services| services.iter().map(|(uuid, _)| *uuid).collect())
            .unwrap_or_default();

        Ok(uuids
            .into_iter()
            .filter(|uuid| filter.map_or(true, |f| f == *uuid))
            .map(|uuid| self.service_handle(device.address, uuid))
            .collect())
    }

    async fn characteristics(
        &self,
        service: &MockService,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<MockCharacteristic>, BleError> {
        self.characteristic_queries.fetch_add(1, Ordering::SeqCst);
        self.count_mode(mode);
        self.delay().await;

        let uuids: Vec<Uuid> = self
            .devices
            .lock()
            .unwrap()
            .get(&service.address)
            .and_then(|services| services.iter().find(|(uuid, _)| *uuid == service.uuid))
            .map(|(_, chars)| chars.iter().map(|(uuid, _)| *uuid).collect())
            .unwrap_or_default();

        Ok(uuids
            .into_iter()
            .filter(|uuid| filter.map_or(true, |f| f == *uuid))
            .map(|uuid| self.characteristic_handle(service.address, service.uuid, uuid))
            .collect())
    }

    fn service_uuid(&self, service: &MockService) -> Result<Uuid, BleError> {
        if let Some(hook) = self.service_uuid_hook.lock().unwrap().as_ref() {
            hook(&service.uuid);
        }
        Ok(service.uuid)
    }

    fn characteristic_uuid(&self, characteristic: &MockCharacteristic) -> Result<Uuid, BleError> {
        Ok(characteristic.key.characteristic)
    }

    async fn user_description(
        &self,
        characteristic: &MockCharacteristic,
    ) -> Result<Option<String>, BleError> {
        if let Some(hook) = self.description_hook.lock().unwrap().as_ref() {
            hook(&characteristic.key);
        }
        let mut devices = self.devices.lock().unwrap();
        let description = Self::find_def(&mut devices, &characteristic.key)
            .and_then(|def| def.description.clone());
        match description.as_deref() {
            Some("<unreadable>") => Err(BleError::Communication(GattStatus::ProtocolError)),
            _ => Ok(description),
        }
    }

    async fn configure_notifications(
        &self,
        characteristic: &MockCharacteristic,
        config: NotifyConfig,
    ) -> Result<(), BleError> {
        self.cccd_writes
            .lock()
            .unwrap()
            .push((characteristic.key, config));
        match *self.cccd_status.lock().unwrap() {
            Some(status) => BleError::check_status(status),
            None => Ok(()),
        }
    }

    fn on_value_changed(
        &self,
        characteristic: &MockCharacteristic,
        handler: ValueChangedHandler,
    ) -> Result<MockRegistration, BleError> {
        let id = self.instance();
        self.handlers
            .lock()
            .unwrap()
            .insert(id, (characteristic.key, handler));
        let hook = self.registration_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&characteristic.key);
        }
        Ok(MockRegistration { id })
    }

    fn revoke(&self, _characteristic: &MockCharacteristic, registration: MockRegistration) {
        self.revocations.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().remove(&registration.id);
    }

    async fn read_value(&self, characteristic: &MockCharacteristic) -> Result<Vec<u8>, BleError> {
        let mut devices = self.devices.lock().unwrap();
        Self::find_def(&mut devices, &characteristic.key)
            .map(|def| def.value.clone())
            .ok_or(BleError::Communication(GattStatus::Unreachable))
    }

    async fn write_value(
        &self,
        characteristic: &MockCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        self.delay().await;
        self.writes
            .lock()
            .unwrap()
            .push((characteristic.key, data.to_vec(), mode));
        Ok(())
    }

    fn close_device(&self, device: &MockDevice) {
        self.closed
            .lock()
            .unwrap()
            .push(format!("device:{}", device.instance));
    }

    fn close_service(&self, service: &MockService) {
        self.closed
            .lock()
            .unwrap()
            .push(format!("service:{}", service.instance));
    }

    fn close_characteristic(&self, characteristic: &MockCharacteristic) {
        self.closed
            .lock()
            .unwrap()
            .push(format!("characteristic:{}", characteristic.instance));
    }
}

pub struct MockWatcher {
    events: mpsc::UnboundedSender<ScanEvent>,
    delivering: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
    silent: bool,
}

impl ActiveWatcher for MockWatcher {
    fn stop(self) -> Result<(), BleError> {
        self.delivering.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        // The OS confirms asynchronously
        if !self.silent {
            let _ = self.events.send(ScanEvent::Stopped);
        }
        Ok(())
    }
}

impl ScanBackend for MockBackend {
    type Watcher = MockWatcher;

    fn start(
        &self,
        filter: &ScanFilter,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<MockWatcher, BleError> {
        self.scan_filters.lock().unwrap().push(filter.clone());
        let delivering = Arc::new(AtomicBool::new(true));
        *self.scan.lock().unwrap() = Some((events.downgrade(), delivering.clone()));
        Ok(MockWatcher {
            events,
            delivering,
            stops: self.watcher_stops.clone(),
            silent: self.silent_stop.load(Ordering::SeqCst),
        })
    }
}
