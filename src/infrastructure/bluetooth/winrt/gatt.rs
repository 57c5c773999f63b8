//! GATT access through `Windows.Devices.Bluetooth`.

use super::{cache_mode, check, from_guid, read_buffer, to_guid, write_buffer};
use crate::domain::error::BleError;
use crate::domain::ids::USER_DESCRIPTION_UUID;
use crate::infrastructure::bluetooth::backend::{
    CacheMode, GattBackend, NotifyConfig, ValueChangedHandler, WriteMode,
};
use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattDeviceService, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;

#[derive(Debug, Default)]
pub struct WinrtGatt;

impl WinrtGatt {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattBackend for WinrtGatt {
    type Device = BluetoothLEDevice;
    type Service = GattDeviceService;
    type Characteristic = GattCharacteristic;
    /// `ValueChanged` event token
    type Registration = i64;

    async fn open_device(&self, address: u64) -> Result<Option<BluetoothLEDevice>, BleError> {
        match BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await {
            Ok(device) => Ok(Some(device)),
            // A null result means the OS has never seen the address
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn services(
        &self,
        device: &BluetoothLEDevice,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<GattDeviceService>, BleError> {
        let result = match filter {
            Some(uuid) => {
                device
                    .GetGattServicesForUuidWithCacheModeAsync(to_guid(uuid), cache_mode(mode))?
                    .await?
            }
            None => {
                device
                    .GetGattServicesWithCacheModeAsync(cache_mode(mode))?
                    .await?
            }
        };
        check(result.Status()?)?;

        let services = result.Services()?;
        let mut found = Vec::with_capacity(services.Size()? as usize);
        for i in 0..services.Size()? {
            found.push(services.GetAt(i)?);
        }
        Ok(found)
    }

    async fn characteristics(
        &self,
        service: &GattDeviceService,
        filter: Option<Uuid>,
        mode: CacheMode,
    ) -> Result<Vec<GattCharacteristic>, BleError> {
        let result = match filter {
            Some(uuid) => {
                service
                    .GetCharacteristicsForUuidWithCacheModeAsync(to_guid(uuid), cache_mode(mode))?
                    .await?
            }
            None => {
                service
                    .GetCharacteristicsWithCacheModeAsync(cache_mode(mode))?
                    .await?
            }
        };
        check(result.Status()?)?;

        let characteristics = result.Characteristics()?;
        let mut found = Vec::with_capacity(characteristics.Size()? as usize);
        for i in 0..characteristics.Size()? {
            found.push(characteristics.GetAt(i)?);
        }
        Ok(found)
    }

    fn service_uuid(&self, service: &GattDeviceService) -> Result<Uuid, BleError> {
        Ok(from_guid(service.Uuid()?))
    }

    fn characteristic_uuid(&self, characteristic: &GattCharacteristic) -> Result<Uuid, BleError> {
        Ok(from_guid(characteristic.Uuid()?))
    }

    async fn user_description(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<Option<String>, BleError> {
        let result = characteristic
            .GetDescriptorsForUuidWithCacheModeAsync(
                to_guid(USER_DESCRIPTION_UUID),
                BluetoothCacheMode::Cached,
            )?
            .await?;
        check(result.Status()?)?;

        let descriptors = result.Descriptors()?;
        if descriptors.Size()? == 0 {
            return Ok(None);
        }

        let read = descriptors.GetAt(0)?.ReadValueAsync()?.await?;
        check(read.Status()?)?;
        let bytes = read_buffer(&read.Value()?)?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn configure_notifications(
        &self,
        characteristic: &GattCharacteristic,
        config: NotifyConfig,
    ) -> Result<(), BleError> {
        let value = match config {
            NotifyConfig::None => GattClientCharacteristicConfigurationDescriptorValue::None,
            NotifyConfig::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
        };
        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
            .await?;
        check(status)
    }

    fn on_value_changed(
        &self,
        characteristic: &GattCharacteristic,
        handler: ValueChangedHandler,
    ) -> Result<i64, BleError> {
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    handler(&bytes);
                }
                Ok(())
            },
        );
        Ok(characteristic.ValueChanged(&value_handler)?)
    }

    fn revoke(&self, characteristic: &GattCharacteristic, registration: i64) {
        if let Err(e) = characteristic.RemoveValueChanged(registration) {
            warn!("Failed to remove value handler: {}", e);
        }
    }

    async fn read_value(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>, BleError> {
        let result = characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check(result.Status()?)?;
        Ok(read_buffer(&result.Value()?)?)
    }

    async fn write_value(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let option = match mode {
            WriteMode::WithResponse => GattWriteOption::WriteWithResponse,
            WriteMode::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let buffer = write_buffer(data)?;
        let status = characteristic
            .WriteValueWithOptionAsync(&buffer, option)?
            .await?;
        check(status)
    }

    fn close_device(&self, device: &BluetoothLEDevice) {
        if let Err(e) = device.Close() {
            debug!("Closing device handle failed: {}", e);
        }
    }

    fn close_service(&self, service: &GattDeviceService) {
        if let Err(e) = service.Close() {
            debug!("Closing service handle failed: {}", e);
        }
    }

    // GattCharacteristic is not closable; the reference is released on drop
    fn close_characteristic(&self, _characteristic: &GattCharacteristic) {}
}
