//! Host-facing operations.
//!
//! Every entry point returns immediately and reports through the supplied
//! callback from a runtime worker. Failures are logged and surface to the
//! host only as an empty, zero or `false` result.

use crate::domain::models::{CharacteristicKey, Notification, ScanFilter, ScanKind};
use crate::ffi::carriers::{
    copy_utf16, BleCharacteristic, BleCharacteristicArray, BleGuid, BleService,
    BleServiceArray, CallbackSink, CharacteristicsFoundCallback, ConnectedCallback,
    DeviceAddedCallback, DeviceUpdatedCallback, DisconnectedCallback,
    EnumerationCompletedCallback, ReadBytesCallback, ReceivedCallback, ServicesFoundCallback,
    StoppedCallback, ValueChangedCallback, WriteBytesCallback, ID_SIZE,
};
use crate::infrastructure::bluetooth::backend::{GattBackend, ScanBackend};
use crate::infrastructure::bluetooth::session::{BleSession, SessionOptions};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Bridge<B: GattBackend, S: ScanBackend> {
    session: Arc<BleSession<B, S>>,
    runtime: Handle,
}

impl<B: GattBackend, S: ScanBackend> Bridge<B, S> {
    pub fn new(gatt: Arc<B>, scan: Arc<S>, options: SessionOptions, runtime: Handle) -> Self {
        Self {
            session: Arc::new(BleSession::new(gatt, scan, options, runtime.clone())),
            runtime,
        }
    }

    pub fn session(&self) -> &Arc<BleSession<B, S>> {
        &self.session
    }

    pub fn start_scan(
        &self,
        name: Option<String>,
        service: Option<Uuid>,
        received: Option<ReceivedCallback>,
        stopped: Option<StoppedCallback>,
    ) {
        let filter = ScanFilter {
            kind: ScanKind::Advertisement,
            name,
            service,
            active: self.session.options().scan_active,
        };
        let sink = CallbackSink {
            received,
            stopped,
            ..Default::default()
        };
        if let Err(e) = self.session.start_scan(filter, Arc::new(sink)) {
            error!("Unable to start scan: {}", e);
        }
    }

    pub fn start_device_scan(
        &self,
        added: Option<DeviceAddedCallback>,
        updated: Option<DeviceUpdatedCallback>,
        removed: Option<DeviceUpdatedCallback>,
        completed: Option<EnumerationCompletedCallback>,
        stopped: Option<StoppedCallback>,
    ) {
        let filter = ScanFilter {
            kind: ScanKind::DeviceEnumeration,
            ..Default::default()
        };
        let sink = CallbackSink {
            added,
            updated,
            removed,
            completed,
            stopped,
            ..Default::default()
        };
        if let Err(e) = self.session.start_scan(filter, Arc::new(sink)) {
            error!("Unable to start device scan: {}", e);
        }
    }

    pub fn stop_scan(&self) {
        if let Err(e) = self.session.stop_scan() {
            error!("Unable to stop scan: {}", e);
        }
    }

    pub fn connect(&self, address: u64, connected: Option<ConnectedCallback>) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let reported = match session.connect(address).await {
                Ok(()) => address,
                Err(e) => {
                    error!("Connect failed: {}", e);
                    0
                }
            };
            if let Some(cb) = connected {
                cb(reported);
            }
        });
    }

    pub fn disconnect(&self, address: u64, disconnected: Option<DisconnectedCallback>) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            session.disconnect(address);
            if let Some(cb) = disconnected {
                cb(address);
            }
        });
    }

    pub fn scan_services(&self, address: u64, found: Option<ServicesFoundCallback>) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let records = session.scan_services(address).await.unwrap_or_else(|e| {
                warn!("Service scan skipped: {}", e);
                Vec::new()
            });
            let services: Vec<BleService> = records
                .iter()
                .map(|record| BleService {
                    service_uuid: BleGuid::from(record.uuid),
                })
                .collect();
            let array = BleServiceArray {
                services: services.as_ptr(),
                count: services.len() as i32,
            };
            if let Some(cb) = found {
                cb(&array);
            }
        });
    }

    pub fn scan_characteristics(
        &self,
        address: u64,
        service: Uuid,
        found: Option<CharacteristicsFoundCallback>,
    ) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let records = session
                .scan_characteristics(address, service)
                .await
                .unwrap_or_else(|e| {
                    warn!("Characteristic scan skipped: {}", e);
                    Vec::new()
                });
            let characteristics: Vec<BleCharacteristic> = records
                .iter()
                .map(|record| {
                    let mut carrier = BleCharacteristic {
                        characteristic_uuid: BleGuid::from(record.uuid),
                        user_description: [0; ID_SIZE],
                    };
                    copy_utf16(&record.user_description, &mut carrier.user_description);
                    carrier
                })
                .collect();
            let array = BleCharacteristicArray {
                characteristics: characteristics.as_ptr(),
                count: characteristics.len() as i32,
            };
            if let Some(cb) = found {
                cb(&array);
            }
        });
    }

    pub fn subscribe(&self, key: CharacteristicKey, value_changed: Option<ValueChangedCallback>) {
        let Some(cb) = value_changed else {
            warn!("Subscribe to {} without a callback ignored", key);
            return;
        };
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let on_value = Arc::new(move |n: Notification| {
                let value = n.value.as_slice();
                cb(
                    n.key.address,
                    BleGuid::from(n.key.service),
                    BleGuid::from(n.key.characteristic),
                    value.as_ptr(),
                    value.len(),
                );
            });
            if let Err(e) = session.subscribe(key, on_value).await {
                error!("Subscribe to {} failed: {}", key, e);
            }
        });
    }

    pub fn unsubscribe(&self, key: CharacteristicKey) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            match session.unsubscribe(key).await {
                Ok(false) => info!("No subscription for {}", key),
                Ok(true) => {}
                Err(e) => error!("Unsubscribe from {} failed: {}", key, e),
            }
        });
    }

    pub fn read_bytes(&self, key: CharacteristicKey, read: Option<ReadBytesCallback>) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let value = session.read_bytes(key).await;
            let Some(cb) = read else {
                return;
            };
            match value {
                Ok(value) => cb(value.as_slice().as_ptr(), value.len()),
                Err(e) => {
                    error!("Read from {} failed: {}", key, e);
                    cb(std::ptr::null(), 0);
                }
            }
        });
    }

    pub fn write_bytes(
        &self,
        key: CharacteristicKey,
        data: Vec<u8>,
        written: Option<WriteBytesCallback>,
    ) {
        let session = self.session.clone();
        self.runtime.spawn(async move {
            let ok = match session.write_bytes(key, &data).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Write to {} failed: {}", key, e);
                    false
                }
            };
            if let Some(cb) = written {
                cb(ok);
            }
        });
    }

    /// Blocks the calling host thread until the write finishes or `quit` runs.
    pub fn send_data_blocking(&self, key: CharacteristicKey, data: Vec<u8>) -> bool {
        self.session.write_bytes_blocking(key, data)
    }

    pub fn quit(&self) {
        self.session.shutdown();
    }
}
