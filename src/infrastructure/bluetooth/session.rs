//! BLE session
//!
//! One context object owning the cache, the resolution engine, the scan
//! controller and the subscription registry for a host session. Every public
//! operation checks the shutdown flag before it starts.

use crate::domain::error::BleError;
use crate::domain::ids;
use crate::domain::models::{
    CharacteristicKey, CharacteristicRecord, ScanFilter, ServiceRecord, ValueBuffer,
    VALUE_CAPACITY,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::backend::{GattBackend, ScanBackend, WriteMode};
use crate::infrastructure::bluetooth::cache::ConnectionCache;
use crate::infrastructure::bluetooth::resolver::{Resolver, ResolverOptions};
use crate::infrastructure::bluetooth::scanner::{ScanController, ScanSink, ScanState};
use crate::infrastructure::bluetooth::shutdown::ShutdownSignal;
use crate::infrastructure::bluetooth::subscriptions::{SubscriptionManager, ValueCallback};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub resolver: ResolverOptions,
    pub write_mode: WriteMode,
    pub scan_active: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            resolver: ResolverOptions::default(),
            write_mode: WriteMode::WithResponse,
            scan_active: true,
        }
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            resolver: ResolverOptions::from(settings),
            write_mode: if settings.write_with_response {
                WriteMode::WithResponse
            } else {
                WriteMode::WithoutResponse
            },
            scan_active: settings.scan_active,
        }
    }
}

pub struct BleSession<B: GattBackend, S: ScanBackend> {
    backend: Arc<B>,
    cache: Arc<ConnectionCache<B>>,
    resolver: Arc<Resolver<B>>,
    subscriptions: SubscriptionManager<B>,
    scanner: ScanController<S>,
    shutdown: Arc<ShutdownSignal>,
    runtime: Handle,
    options: SessionOptions,
}

impl<B: GattBackend, S: ScanBackend> BleSession<B, S> {
    pub fn new(gatt: Arc<B>, scan: Arc<S>, options: SessionOptions, runtime: Handle) -> Self {
        let shutdown = Arc::new(ShutdownSignal::new());
        let cache = Arc::new(ConnectionCache::new(gatt.clone(), shutdown.clone()));
        let resolver = Arc::new(Resolver::new(
            gatt.clone(),
            cache.clone(),
            shutdown.clone(),
            options.resolver.clone(),
        ));
        Self {
            subscriptions: SubscriptionManager::new(
                gatt.clone(),
                resolver.clone(),
                shutdown.clone(),
            ),
            scanner: ScanController::new(scan, shutdown.clone(), runtime.clone()),
            backend: gatt,
            cache,
            resolver,
            shutdown,
            runtime,
            options,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_requested()
    }

    fn ensure_running(&self) -> Result<(), BleError> {
        if self.shutdown.is_requested() {
            Err(BleError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Start a scan. Clears a previous shutdown request.
    pub fn start_scan(&self, filter: ScanFilter, sink: Arc<dyn ScanSink>) -> Result<(), BleError> {
        self.scanner.start(filter, sink)
    }

    pub fn stop_scan(&self) -> Result<(), BleError> {
        self.scanner.stop()
    }

    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    /// Open the device and keep its handle cached.
    pub async fn connect(&self, address: u64) -> Result<(), BleError> {
        self.ensure_running()?;
        self.resolver
            .device(address)
            .await
            .map(|_| ())
            .ok_or_else(|| BleError::not_found(format!("device {}", ids::format_mac(address))))
    }

    /// Release every cached handle for `address`. False when nothing was cached.
    pub fn disconnect(&self, address: u64) -> bool {
        let removed = self.cache.remove(address);
        if removed {
            info!("Disconnected {}", ids::format_mac(address));
        }
        removed
    }

    pub async fn scan_services(&self, address: u64) -> Result<Vec<ServiceRecord>, BleError> {
        self.ensure_running()?;
        Ok(self.resolver.enumerate_services(address).await)
    }

    pub async fn scan_characteristics(
        &self,
        address: u64,
        service: Uuid,
    ) -> Result<Vec<CharacteristicRecord>, BleError> {
        self.ensure_running()?;
        Ok(self.resolver.enumerate_characteristics(address, service).await)
    }

    pub async fn subscribe(
        &self,
        key: CharacteristicKey,
        on_value: ValueCallback,
    ) -> Result<(), BleError> {
        self.subscriptions.subscribe(key, on_value).await
    }

    pub async fn unsubscribe(&self, key: CharacteristicKey) -> Result<bool, BleError> {
        self.subscriptions.unsubscribe(key).await
    }

    async fn resolve(&self, key: &CharacteristicKey) -> Result<B::Characteristic, BleError> {
        self.resolver
            .characteristic(key.address, key.service, key.characteristic)
            .await
            .ok_or_else(|| BleError::not_found(format!("characteristic {}", key)))
    }

    pub async fn read_bytes(&self, key: CharacteristicKey) -> Result<ValueBuffer, BleError> {
        self.ensure_running()?;
        let characteristic = self.resolve(&key).await?;
        let data = self.backend.read_value(&characteristic).await.map_err(|e| {
            error!("Error reading from {}: {}", key, e);
            e
        })?;
        ValueBuffer::from_slice(&data)
    }

    /// Write `data` to the characteristic. Payloads over the value capacity
    /// are rejected before the device is touched.
    pub async fn write_bytes(&self, key: CharacteristicKey, data: &[u8]) -> Result<(), BleError> {
        if data.len() > VALUE_CAPACITY {
            return Err(BleError::PayloadTooLarge {
                len: data.len(),
                capacity: VALUE_CAPACITY,
            });
        }
        self.ensure_running()?;
        let characteristic = self.resolve(&key).await?;
        self.backend
            .write_value(&characteristic, data, self.options.write_mode)
            .await
            .map_err(|e| {
                error!("Error writing to {}: {}", key, e);
                e
            })
    }

    /// Write from a thread outside the runtime and block until the write
    /// completes or shutdown is requested.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn write_bytes_blocking(self: &Arc<Self>, key: CharacteristicKey, data: Vec<u8>) -> bool {
        if data.len() > VALUE_CAPACITY {
            error!(
                "Refusing to send {} bytes to {}: capacity is {}",
                data.len(),
                key,
                VALUE_CAPACITY
            );
            return false;
        }

        let outcome: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));
        {
            let session = self.clone();
            let outcome = outcome.clone();
            self.runtime.spawn(async move {
                let written = session.write_bytes(key, &data).await.is_ok();
                *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(written);
                session.shutdown.notify();
            });
        }

        let finished = self.shutdown.wait_until(|| {
            outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        });
        if !finished {
            warn!("Blocking write to {} interrupted by shutdown", key);
            return false;
        }
        let written = outcome.lock().unwrap_or_else(PoisonError::into_inner);
        written.unwrap_or(false)
    }

    /// Stop everything and release every OS handle. Safe to call repeatedly.
    pub fn shutdown(&self) {
        info!("Shutting down BLE session");
        self.shutdown.request();
        if let Err(e) = self.scanner.stop() {
            warn!("Failed to stop scan during shutdown: {}", e);
        }
        self.subscriptions.revoke_all();
        self.cache.clear();
    }
}
