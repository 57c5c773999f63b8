//! OS BLE stack abstraction
//!
//! The cache, resolver and subscription layers only talk to the platform
//! through these traits. The WinRT implementation lives in [`super::winrt`];
//! tests use an in-memory backend.

use crate::domain::error::BleError;
use crate::domain::models::{ScanEvent, ScanFilter};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Whether a GATT query may be answered from the OS attribute cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Cached,
    Uncached,
}

/// Client Characteristic Configuration Descriptor value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyConfig {
    None,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Raw payload handler registered on a characteristic.
pub type ValueChangedHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait GattBackend: Send + Sync + 'static {
    type Device: Clone + Send + Sync + 'static;
    type Service: Clone + Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;
    /// Revocation capability returned by [`GattBackend::on_value_changed`]
    type Registration: Send + Sync + 'static;

    /// Open a device by address. `Ok(None)` when the OS knows no such device.
    async fn open_device(&self, address: u64) -> Result<Option<Self::Device>, BleError>;

    /// Services of `device`, optionally filtered to a single UUID.
    async fn services(
        &self,
        device: &Self::Device,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<Self::Service>, BleError>;

    async fn characteristics(
        &self,
        service: &Self::Service,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<Self::Characteristic>, BleError>;

    fn service_uuid(&self, service: &Self::Service) -> Result<Uuid, BleError>;

    fn characteristic_uuid(&self, characteristic: &Self::Characteristic)
        -> Result<Uuid, BleError>;

    /// Contents of the User Description descriptor, `None` when absent.
    async fn user_description(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<Option<String>, BleError>;

    async fn configure_notifications(
        &self,
        characteristic: &Self::Characteristic,
        config: NotifyConfig,
    ) -> Result<(), BleError>;

    fn on_value_changed(
        &self,
        characteristic: &Self::Characteristic,
        handler: ValueChangedHandler,
    ) -> Result<Self::Registration, BleError>;

    /// Remove a handler. Consumes the registration so it can only happen once.
    fn revoke(&self, characteristic: &Self::Characteristic, registration: Self::Registration);

    async fn read_value(&self, characteristic: &Self::Characteristic)
        -> Result<Vec<u8>, BleError>;

    async fn write_value(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    // Release of OS resources. Only the connection cache calls these.
    fn close_device(&self, device: &Self::Device);
    fn close_service(&self, service: &Self::Service);
    fn close_characteristic(&self, characteristic: &Self::Characteristic);
}

/// A running OS watcher.
pub trait ActiveWatcher: Send + 'static {
    /// Detach data-event delivery and ask the OS to stop. The watcher keeps its
    /// stopped notification registered so [`ScanEvent::Stopped`] still arrives.
    fn stop(self) -> Result<(), BleError>;
}

pub trait ScanBackend: Send + Sync + 'static {
    type Watcher: ActiveWatcher;

    /// Start a watcher that reports into `events`.
    fn start(
        &self,
        filter: &ScanFilter,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<Self::Watcher, BleError>;
}
