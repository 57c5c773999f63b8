//! Exported C entry points.
//!
//! The first call loads settings, installs logging and builds the runtime.
//! When that fails every entry point becomes a no-op that still answers its
//! callback with an empty result.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]

use crate::domain::models::CharacteristicKey;
use crate::domain::settings::SettingsService;
use crate::ffi::bridge::Bridge;
use crate::ffi::carriers::{
    read_utf16, BleCharacteristicArray, BleGuid, BleServiceArray, CharacteristicsFoundCallback,
    ConnectedCallback, DeviceAddedCallback, DeviceUpdatedCallback, DisconnectedCallback,
    EnumerationCompletedCallback, ErrorCallback, LogCallback, ReadBytesCallback,
    ReceivedCallback, ServicesFoundCallback, StoppedCallback, ValueChangedCallback,
    WriteBytesCallback,
};
use crate::infrastructure::bluetooth::session::SessionOptions;
use crate::infrastructure::bluetooth::winrt::{WinrtGatt, WinrtScanner};
use crate::infrastructure::logging::{init_logger, HostSinks, LoggingGuard};
use std::ffi::CString;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Runtime;
use tracing::{error, info};
use uuid::Uuid;

struct Host {
    bridge: Bridge<WinrtGatt, WinrtScanner>,
    _runtime: Runtime,
    _logging: LoggingGuard,
}

impl Host {
    fn create() -> anyhow::Result<Self> {
        let settings = SettingsService::new()?;
        let settings = settings.get();
        let logging = init_logger(&settings.log_settings)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.runtime_worker_threads.max(1))
            .thread_name("ble-bridge")
            .enable_all()
            .build()?;

        let bridge = Bridge::new(
            Arc::new(WinrtGatt::new()),
            Arc::new(WinrtScanner::new()),
            SessionOptions::from(settings),
            runtime.handle().clone(),
        );
        info!("BLE bridge ready");

        Ok(Self {
            bridge,
            _runtime: runtime,
            _logging: logging,
        })
    }
}

fn host() -> Option<&'static Host> {
    static HOST: OnceLock<Option<Host>> = OnceLock::new();
    HOST.get_or_init(|| match Host::create() {
        Ok(host) => Some(host),
        Err(e) => {
            error!("BLE bridge failed to initialize: {:#}", e);
            None
        }
    })
    .as_ref()
}

fn key(address: u64, service: BleGuid, characteristic: BleGuid) -> CharacteristicKey {
    CharacteristicKey::new(address, Uuid::from(service), Uuid::from(characteristic))
}

unsafe fn copy_payload(data: *const u8, size: usize) -> Vec<u8> {
    if data.is_null() || size == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(data, size).to_vec()
}

#[no_mangle]
pub extern "C" fn RegisterLogCallback(callback: Option<LogCallback>) {
    let sink = callback.map(|cb| {
        Arc::new(move |line: &str| {
            // Interior nuls would truncate the line on the host side anyway
            if let Ok(text) = CString::new(line.replace('\0', " ")) {
                cb(text.as_ptr());
            }
        }) as Arc<dyn Fn(&str) + Send + Sync>
    });
    HostSinks::global().set_log_sink(sink);
    let _ = host();
}

#[no_mangle]
pub extern "C" fn RegisterErrorCallback(callback: Option<ErrorCallback>) {
    let sink = callback.map(|cb| {
        Arc::new(move |line: &str| {
            let wide: Vec<u16> = line.encode_utf16().chain(std::iter::once(0)).collect();
            cb(wide.as_ptr());
        }) as Arc<dyn Fn(&str) + Send + Sync>
    });
    HostSinks::global().set_error_sink(sink);
    let _ = host();
}

#[no_mangle]
pub unsafe extern "C" fn StartScan(
    name_filter: *const u16,
    service_filter: BleGuid,
    received: Option<ReceivedCallback>,
    stopped: Option<StoppedCallback>,
) {
    let name = read_utf16(name_filter).filter(|n| !n.is_empty());
    let service = (!service_filter.is_zero()).then(|| Uuid::from(service_filter));
    if let Some(host) = host() {
        host.bridge.start_scan(name, service, received, stopped);
    }
}

#[no_mangle]
pub extern "C" fn StartDeviceScan(
    added: Option<DeviceAddedCallback>,
    updated: Option<DeviceUpdatedCallback>,
    removed: Option<DeviceUpdatedCallback>,
    completed: Option<EnumerationCompletedCallback>,
    stopped: Option<StoppedCallback>,
) {
    if let Some(host) = host() {
        host.bridge
            .start_device_scan(added, updated, removed, completed, stopped);
    }
}

#[no_mangle]
pub extern "C" fn StopScan() {
    if let Some(host) = host() {
        host.bridge.stop_scan();
    }
}

#[no_mangle]
pub extern "C" fn ConnectDevice(address: u64, connected: Option<ConnectedCallback>) {
    match host() {
        Some(host) => host.bridge.connect(address, connected),
        None => {
            if let Some(cb) = connected {
                cb(0);
            }
        }
    }
}

#[no_mangle]
pub extern "C" fn DisconnectDevice(address: u64, disconnected: Option<DisconnectedCallback>) {
    match host() {
        Some(host) => host.bridge.disconnect(address, disconnected),
        None => {
            if let Some(cb) = disconnected {
                cb(address);
            }
        }
    }
}

#[no_mangle]
pub extern "C" fn ScanServices(address: u64, found: Option<ServicesFoundCallback>) {
    match host() {
        Some(host) => host.bridge.scan_services(address, found),
        None => {
            if let Some(cb) = found {
                let empty = BleServiceArray {
                    services: std::ptr::null(),
                    count: 0,
                };
                cb(&empty);
            }
        }
    }
}

#[no_mangle]
pub extern "C" fn ScanCharacteristics(
    address: u64,
    service: BleGuid,
    found: Option<CharacteristicsFoundCallback>,
) {
    match host() {
        Some(host) => host
            .bridge
            .scan_characteristics(address, Uuid::from(service), found),
        None => {
            if let Some(cb) = found {
                let empty = BleCharacteristicArray {
                    characteristics: std::ptr::null(),
                    count: 0,
                };
                cb(&empty);
            }
        }
    }
}

#[no_mangle]
pub extern "C" fn SubscribeCharacteristic(
    address: u64,
    service: BleGuid,
    characteristic: BleGuid,
    value_changed: Option<ValueChangedCallback>,
) {
    if let Some(host) = host() {
        host.bridge
            .subscribe(key(address, service, characteristic), value_changed);
    }
}

#[no_mangle]
pub extern "C" fn UnsubscribeCharacteristic(
    address: u64,
    service: BleGuid,
    characteristic: BleGuid,
) {
    if let Some(host) = host() {
        host.bridge.unsubscribe(key(address, service, characteristic));
    }
}

#[no_mangle]
pub extern "C" fn ReadBytes(
    address: u64,
    service: BleGuid,
    characteristic: BleGuid,
    read: Option<ReadBytesCallback>,
) {
    match host() {
        Some(host) => host
            .bridge
            .read_bytes(key(address, service, characteristic), read),
        None => {
            if let Some(cb) = read {
                cb(std::ptr::null(), 0);
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn WriteBytes(
    address: u64,
    service: BleGuid,
    characteristic: BleGuid,
    data: *const u8,
    size: usize,
    written: Option<WriteBytesCallback>,
) {
    let payload = copy_payload(data, size);
    match host() {
        Some(host) => host
            .bridge
            .write_bytes(key(address, service, characteristic), payload, written),
        None => {
            if let Some(cb) = written {
                cb(false);
            }
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn SendDataBlocking(
    address: u64,
    service: BleGuid,
    characteristic: BleGuid,
    data: *const u8,
    size: usize,
) -> bool {
    let payload = copy_payload(data, size);
    match host() {
        Some(host) => host
            .bridge
            .send_data_blocking(key(address, service, characteristic), payload),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn Quit() {
    if let Some(host) = host() {
        host.bridge.quit();
    }
}
