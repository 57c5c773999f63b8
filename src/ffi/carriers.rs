//! C-compatible structs and callback signatures shared with the host.
//!
//! Strings are fixed-size, nul-terminated UTF-16 arrays. Pointers handed to a
//! callback are only valid for the duration of that call.

use crate::domain::models::{Advertisement, DeviceRecord, DeviceUpdate};
use crate::infrastructure::bluetooth::scanner::ScanSink;
use std::os::raw::c_char;
use uuid::Uuid;

/// Capacity of every UTF-16 text field, including the terminator
pub const ID_SIZE: usize = 128;

/// GUID in Windows memory layout
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BleGuid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl BleGuid {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl From<Uuid> for BleGuid {
    fn from(id: Uuid) -> Self {
        let (data1, data2, data3, data4) = id.as_fields();
        Self {
            data1,
            data2,
            data3,
            data4: *data4,
        }
    }
}

impl From<BleGuid> for Uuid {
    fn from(guid: BleGuid) -> Self {
        Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BleAdvert {
    pub mac: u64,
    pub name: [u16; ID_SIZE],
    pub signal_strength: i32,
    pub power_level: i16,
    /// 100ns ticks since 1601-01-01
    pub timestamp: i64,
}

impl From<&Advertisement> for BleAdvert {
    fn from(advertisement: &Advertisement) -> Self {
        let mut carrier = Self {
            mac: advertisement.address,
            name: [0; ID_SIZE],
            signal_strength: i32::from(advertisement.signal_strength),
            power_level: advertisement.power_level,
            timestamp: advertisement.timestamp,
        };
        copy_utf16(&advertisement.name, &mut carrier.name);
        carrier
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub id: [u16; ID_SIZE],
    pub name: [u16; ID_SIZE],
    pub mac: u64,
    pub signal_strength: i32,
    pub signal_strength_present: bool,
    pub is_connected: bool,
    pub is_connected_present: bool,
    pub is_connectable: bool,
    pub is_connectable_present: bool,
}

impl From<&DeviceRecord> for DeviceInfo {
    fn from(device: &DeviceRecord) -> Self {
        let mut carrier = Self {
            id: [0; ID_SIZE],
            name: [0; ID_SIZE],
            mac: device.address,
            signal_strength: device.signal_strength.unwrap_or_default(),
            signal_strength_present: device.signal_strength.is_some(),
            is_connected: device.is_connected.unwrap_or_default(),
            is_connected_present: device.is_connected.is_some(),
            is_connectable: device.is_connectable.unwrap_or_default(),
            is_connectable_present: device.is_connectable.is_some(),
        };
        copy_utf16(&device.id, &mut carrier.id);
        copy_utf16(&device.name, &mut carrier.name);
        carrier
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfoUpdate {
    pub id: [u16; ID_SIZE],
    pub name: [u16; ID_SIZE],
    pub name_present: bool,
    pub signal_strength: i32,
    pub signal_strength_present: bool,
    pub is_connected: bool,
    pub is_connected_present: bool,
    pub is_connectable: bool,
    pub is_connectable_present: bool,
}

impl From<&DeviceUpdate> for DeviceInfoUpdate {
    fn from(update: &DeviceUpdate) -> Self {
        let mut carrier = Self {
            id: [0; ID_SIZE],
            name: [0; ID_SIZE],
            name_present: update.name.is_some(),
            signal_strength: update.signal_strength.unwrap_or_default(),
            signal_strength_present: update.signal_strength.is_some(),
            is_connected: update.is_connected.unwrap_or_default(),
            is_connected_present: update.is_connected.is_some(),
            is_connectable: update.is_connectable.unwrap_or_default(),
            is_connectable_present: update.is_connectable.is_some(),
        };
        copy_utf16(&update.id, &mut carrier.id);
        if let Some(name) = &update.name {
            copy_utf16(name, &mut carrier.name);
        }
        carrier
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BleService {
    pub service_uuid: BleGuid,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BleCharacteristic {
    pub characteristic_uuid: BleGuid,
    pub user_description: [u16; ID_SIZE],
}

#[repr(C)]
#[derive(Debug)]
pub struct BleServiceArray {
    pub services: *const BleService,
    pub count: i32,
}

#[repr(C)]
#[derive(Debug)]
pub struct BleCharacteristicArray {
    pub characteristics: *const BleCharacteristic,
    pub count: i32,
}

pub type LogCallback = extern "C" fn(*const c_char);
pub type ErrorCallback = extern "C" fn(*const u16);
pub type ReceivedCallback = extern "C" fn(*const BleAdvert);
pub type StoppedCallback = extern "C" fn();
pub type DeviceAddedCallback = extern "C" fn(*const DeviceInfo);
pub type DeviceUpdatedCallback = extern "C" fn(*const DeviceInfoUpdate);
pub type EnumerationCompletedCallback = extern "C" fn();
pub type ConnectedCallback = extern "C" fn(u64);
pub type DisconnectedCallback = extern "C" fn(u64);
pub type ServicesFoundCallback = extern "C" fn(*const BleServiceArray);
pub type CharacteristicsFoundCallback = extern "C" fn(*const BleCharacteristicArray);
pub type ValueChangedCallback = extern "C" fn(u64, BleGuid, BleGuid, *const u8, usize);
pub type ReadBytesCallback = extern "C" fn(*const u8, usize);
pub type WriteBytesCallback = extern "C" fn(bool);

/// Copy `text` into a fixed UTF-16 field, truncating so the terminator fits.
pub fn copy_utf16<const N: usize>(text: &str, field: &mut [u16; N]) {
    let Some(capacity) = N.checked_sub(1) else {
        return;
    };
    let mut written = 0;
    for (slot, unit) in field.iter_mut().zip(text.encode_utf16().take(capacity)) {
        *slot = unit;
        written += 1;
    }
    field[written..].fill(0);
}

/// Read a nul-terminated UTF-16 string. Null pointers read as `None`.
///
/// # Safety
/// `ptr` must be null or point to a readable, nul-terminated UTF-16 sequence.
pub unsafe fn read_utf16(ptr: *const u16) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    let units = std::slice::from_raw_parts(ptr, len);
    Some(String::from_utf16_lossy(units))
}

/// Scan sink that forwards to host function pointers.
#[derive(Default)]
pub struct CallbackSink {
    pub received: Option<ReceivedCallback>,
    pub added: Option<DeviceAddedCallback>,
    pub updated: Option<DeviceUpdatedCallback>,
    pub removed: Option<DeviceUpdatedCallback>,
    pub completed: Option<EnumerationCompletedCallback>,
    pub stopped: Option<StoppedCallback>,
}

impl ScanSink for CallbackSink {
    fn advertisement(&self, advertisement: &Advertisement) {
        if let Some(cb) = self.received {
            let carrier = BleAdvert::from(advertisement);
            cb(&carrier);
        }
    }

    fn device_added(&self, device: &DeviceRecord) {
        if let Some(cb) = self.added {
            let carrier = DeviceInfo::from(device);
            cb(&carrier);
        }
    }

    fn device_updated(&self, update: &DeviceUpdate) {
        if let Some(cb) = self.updated {
            let carrier = DeviceInfoUpdate::from(update);
            cb(&carrier);
        }
    }

    fn device_removed(&self, update: &DeviceUpdate) {
        if let Some(cb) = self.removed {
            let carrier = DeviceInfoUpdate::from(update);
            cb(&carrier);
        }
    }

    fn enumeration_completed(&self) {
        if let Some(cb) = self.completed {
            cb();
        }
    }

    fn stopped(&self) {
        if let Some(cb) = self.stopped {
            cb();
        }
    }
}
