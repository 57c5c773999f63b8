use crate::domain::error::BleError;
use crate::domain::ids;
use std::fmt;
use uuid::Uuid;

/// Capacity of every characteristic value handed to the host.
pub const VALUE_CAPACITY: usize = 512;

/// A characteristic value copied into a fixed-size buffer.
#[derive(Clone)]
pub struct ValueBuffer {
    buf: [u8; VALUE_CAPACITY],
    len: u16,
}

impl ValueBuffer {
    /// Copy `data` into a new buffer. Longer payloads are rejected, never truncated.
    pub fn from_slice(data: &[u8]) -> Result<Self, BleError> {
        if data.len() > VALUE_CAPACITY {
            return Err(BleError::PayloadTooLarge {
                len: data.len(),
                capacity: VALUE_CAPACITY,
            });
        }

        let mut buf = [0u8; VALUE_CAPACITY];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            buf,
            len: data.len() as u16,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ValueBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueBuffer({:02X?})", self.as_slice())
    }
}

/// Identity of one characteristic on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub address: u64,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(address: u64, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            address,
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            ids::format_mac(self.address),
            self.service,
            self.characteristic
        )
    }
}

/// Value-changed notification delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Notification {
    pub key: CharacteristicKey,
    pub value: ValueBuffer,
}

/// One received advertisement packet
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub address: u64,
    pub name: String,
    pub signal_strength: i16,
    /// Advertised TX power, 0 when the packet carries none
    pub power_level: i16,
    /// 100ns ticks since 1601-01-01 (WinRT `DateTime`)
    pub timestamp: i64,
    pub service_uuids: Vec<Uuid>,
}

/// Device reported by an enumeration scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub address: u64,
    pub signal_strength: Option<i32>,
    pub is_connected: Option<bool>,
    pub is_connectable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub id: String,
    pub name: Option<String>,
    pub signal_strength: Option<i32>,
    pub is_connected: Option<bool>,
    pub is_connectable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRecord {
    pub uuid: Uuid,
    pub user_description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanKind {
    /// Continuous advertisement watching
    #[default]
    Advertisement,
    /// Bounded device-information enumeration
    DeviceEnumeration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub kind: ScanKind,
    pub name: Option<String>,
    pub service: Option<Uuid>,
    /// Active scanning requests scan responses from peripherals
    pub active: bool,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            kind: ScanKind::Advertisement,
            name: None,
            service: None,
            active: true,
        }
    }
}

/// Everything an OS watcher reports while a scan runs.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    DeviceAdded(DeviceRecord),
    DeviceUpdated(DeviceUpdate),
    DeviceRemoved(DeviceUpdate),
    EnumerationCompleted,
    Stopped,
}
