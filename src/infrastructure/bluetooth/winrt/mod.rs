//! WinRT implementation of the backend traits.

mod gatt;
mod watcher;

pub use gatt::WinrtGatt;
pub use watcher::{WinrtScanner, WinrtWatcher};

use crate::domain::error::{BleError, GattStatus};
use crate::infrastructure::bluetooth::backend::CacheMode;
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::BluetoothCacheMode;
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCommunicationStatus;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for BleError {
    fn from(err: windows::core::Error) -> Self {
        BleError::Platform(format!("{} ({:#010X})", err.message(), err.code().0))
    }
}

pub(crate) fn to_guid(id: Uuid) -> GUID {
    GUID::from_u128(id.as_u128())
}

pub(crate) fn from_guid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

pub(crate) fn cache_mode(mode: CacheMode) -> BluetoothCacheMode {
    match mode {
        CacheMode::Cached => BluetoothCacheMode::Cached,
        CacheMode::Uncached => BluetoothCacheMode::Uncached,
    }
}

pub(crate) fn status(status: GattCommunicationStatus) -> GattStatus {
    match status {
        GattCommunicationStatus::Success => GattStatus::Success,
        GattCommunicationStatus::Unreachable => GattStatus::Unreachable,
        GattCommunicationStatus::AccessDenied => GattStatus::AccessDenied,
        _ => GattStatus::ProtocolError,
    }
}

pub(crate) fn check(result: GattCommunicationStatus) -> Result<(), BleError> {
    BleError::check_status(status(result))
}

pub(crate) fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

pub(crate) fn write_buffer(data: &[u8]) -> windows::core::Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(data)?;
    writer.DetachBuffer()
}
