//! Advertisement and device-information watchers
//!
//! Both watchers translate OS callbacks into [`ScanEvent`]s. Stopping removes
//! the data handlers but keeps the `Stopped` handler attached, so the OS
//! confirmation still reaches the controller.

use super::{from_guid, to_guid};
use crate::domain::error::BleError;
use crate::domain::ids;
use crate::domain::models::{
    Advertisement, DeviceRecord, DeviceUpdate, ScanEvent, ScanFilter, ScanKind,
};
use crate::infrastructure::bluetooth::backend::{ActiveWatcher, ScanBackend};
use tokio::sync::mpsc;
use tracing::{debug, info};
use windows::core::{IInspectable, Interface, Ref, HSTRING};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Enumeration::{
    DeviceInformation, DeviceInformationKind, DeviceInformationUpdate, DeviceWatcher,
};
use windows::Foundation::Collections::{IIterable, IMapView};
use windows::Foundation::{IReference, TypedEventHandler};

/// Bluetooth LE protocol in the association-endpoint namespace
const BLE_PROTOCOL_AQS: &str =
    "(System.Devices.Aep.ProtocolId:=\"{bb7bb05e-5972-42b5-94fc-76eaa7084d49}\")";

const PROP_ADDRESS: &str = "System.Devices.Aep.DeviceAddress";
const PROP_CONNECTABLE: &str = "System.Devices.Aep.Bluetooth.Le.IsConnectable";
const PROP_CONNECTED: &str = "System.Devices.Aep.IsConnected";
const PROP_SIGNAL: &str = "System.Devices.Aep.SignalStrength";
const PROP_NAME: &str = "System.ItemNameDisplay";

#[derive(Debug, Default)]
pub struct WinrtScanner;

impl WinrtScanner {
    pub fn new() -> Self {
        Self
    }
}

pub enum WinrtWatcher {
    Advertisement {
        watcher: BluetoothLEAdvertisementWatcher,
        received: i64,
    },
    Device {
        watcher: DeviceWatcher,
        added: i64,
        updated: i64,
        removed: i64,
        completed: i64,
    },
}

impl ActiveWatcher for WinrtWatcher {
    fn stop(self) -> Result<(), BleError> {
        match self {
            WinrtWatcher::Advertisement { watcher, received } => {
                watcher.RemoveReceived(received)?;
                watcher.Stop()?;
            }
            WinrtWatcher::Device {
                watcher,
                added,
                updated,
                removed,
                completed,
            } => {
                watcher.RemoveAdded(added)?;
                watcher.RemoveUpdated(updated)?;
                watcher.RemoveRemoved(removed)?;
                watcher.RemoveEnumerationCompleted(completed)?;
                watcher.Stop()?;
            }
        }
        Ok(())
    }
}

impl ScanBackend for WinrtScanner {
    type Watcher = WinrtWatcher;

    fn start(
        &self,
        filter: &ScanFilter,
        events: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<WinrtWatcher, BleError> {
        match filter.kind {
            ScanKind::Advertisement => start_advertisement_watcher(filter, events),
            ScanKind::DeviceEnumeration => start_device_watcher(events),
        }
    }
}

fn start_advertisement_watcher(
    filter: &ScanFilter,
    events: mpsc::UnboundedSender<ScanEvent>,
) -> Result<WinrtWatcher, BleError> {
    let watcher = BluetoothLEAdvertisementWatcher::new()?;
    watcher.SetScanningMode(if filter.active {
        BluetoothLEScanningMode::Active
    } else {
        BluetoothLEScanningMode::Passive
    })?;

    let advertisement = watcher.AdvertisementFilter()?.Advertisement()?;
    if let Some(name) = filter.name.as_deref().filter(|n| !n.is_empty()) {
        advertisement.SetLocalName(&HSTRING::from(name))?;
    }
    if let Some(service) = filter.service {
        advertisement.ServiceUuids()?.Append(to_guid(service))?;
    }

    let sender = events.clone();
    let received_handler = TypedEventHandler::new(
        move |_: Ref<BluetoothLEAdvertisementWatcher>,
              args: Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
            if let Some(args) = args.as_ref() {
                let _ = sender.send(ScanEvent::Advertisement(read_advertisement(args)?));
            }
            Ok(())
        },
    );
    let stopped_handler = TypedEventHandler::new(
        move |_: Ref<BluetoothLEAdvertisementWatcher>,
              _: Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
            let _ = events.send(ScanEvent::Stopped);
            Ok(())
        },
    );

    let received = watcher.Received(&received_handler)?;
    watcher.Stopped(&stopped_handler)?;
    watcher.Start()?;
    info!("Advertisement watcher started");

    Ok(WinrtWatcher::Advertisement { watcher, received })
}

fn read_advertisement(
    args: &BluetoothLEAdvertisementReceivedEventArgs,
) -> windows::core::Result<Advertisement> {
    let advertisement = args.Advertisement()?;
    let uuids = advertisement.ServiceUuids()?;
    let mut service_uuids = Vec::with_capacity(uuids.Size()? as usize);
    for i in 0..uuids.Size()? {
        service_uuids.push(from_guid(uuids.GetAt(i)?));
    }

    Ok(Advertisement {
        address: args.BluetoothAddress()?,
        name: advertisement.LocalName()?.to_string(),
        signal_strength: args.RawSignalStrengthInDBm()?,
        // Absent unless the packet carries a TX power level
        power_level: args
            .TransmitPowerLevelInDBm()
            .and_then(|level| level.Value())
            .unwrap_or(0),
        timestamp: args.Timestamp()?.UniversalTime,
        service_uuids,
    })
}

fn start_device_watcher(events: mpsc::UnboundedSender<ScanEvent>) -> Result<WinrtWatcher, BleError> {
    let properties: Vec<HSTRING> = [PROP_ADDRESS, PROP_CONNECTABLE, PROP_CONNECTED, PROP_SIGNAL]
        .into_iter()
        .map(HSTRING::from)
        .collect();
    let watcher = DeviceInformation::CreateWatcherWithKindAqsFilterAndAdditionalProperties(
        &HSTRING::from(BLE_PROTOCOL_AQS),
        &IIterable::<HSTRING>::from(properties),
        DeviceInformationKind::AssociationEndpoint,
    )?;

    let sender = events.clone();
    let added_handler = TypedEventHandler::new(
        move |_: Ref<DeviceWatcher>, info: Ref<DeviceInformation>| {
            if let Some(info) = info.as_ref() {
                let properties = info.Properties()?;
                let device = DeviceRecord {
                    id: info.Id()?.to_string(),
                    name: info.Name()?.to_string(),
                    address: string_property(&properties, PROP_ADDRESS)
                        .map(|text| ids::mac_text_to_integer(&text))
                        .unwrap_or(0),
                    signal_strength: value_property(&properties, PROP_SIGNAL),
                    is_connected: value_property(&properties, PROP_CONNECTED),
                    is_connectable: value_property(&properties, PROP_CONNECTABLE),
                };
                let _ = sender.send(ScanEvent::DeviceAdded(device));
            }
            Ok(())
        },
    );

    let sender = events.clone();
    let updated_handler = TypedEventHandler::new(
        move |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
            if let Some(update) = update.as_ref() {
                let _ = sender.send(ScanEvent::DeviceUpdated(read_update(update)?));
            }
            Ok(())
        },
    );

    let sender = events.clone();
    let removed_handler = TypedEventHandler::new(
        move |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
            if let Some(update) = update.as_ref() {
                let _ = sender.send(ScanEvent::DeviceRemoved(read_update(update)?));
            }
            Ok(())
        },
    );

    let sender = events.clone();
    let completed_handler = TypedEventHandler::new(
        move |_: Ref<DeviceWatcher>, _: Ref<IInspectable>| {
            let _ = sender.send(ScanEvent::EnumerationCompleted);
            Ok(())
        },
    );

    let stopped_handler = TypedEventHandler::new(
        move |_: Ref<DeviceWatcher>, _: Ref<IInspectable>| {
            let _ = events.send(ScanEvent::Stopped);
            Ok(())
        },
    );

    let added = watcher.Added(&added_handler)?;
    let updated = watcher.Updated(&updated_handler)?;
    let removed = watcher.Removed(&removed_handler)?;
    let completed = watcher.EnumerationCompleted(&completed_handler)?;
    watcher.Stopped(&stopped_handler)?;
    watcher.Start()?;
    info!("Device watcher started");

    Ok(WinrtWatcher::Device {
        watcher,
        added,
        updated,
        removed,
        completed,
    })
}

fn read_update(update: &DeviceInformationUpdate) -> windows::core::Result<DeviceUpdate> {
    let properties = update.Properties()?;
    Ok(DeviceUpdate {
        id: update.Id()?.to_string(),
        name: string_property(&properties, PROP_NAME),
        signal_strength: value_property(&properties, PROP_SIGNAL),
        is_connected: value_property(&properties, PROP_CONNECTED),
        is_connectable: value_property(&properties, PROP_CONNECTABLE),
    })
}

/// Unbox a property value. Missing keys and empty values read as `None`.
fn value_property<T>(properties: &IMapView<HSTRING, IInspectable>, key: &str) -> Option<T>
where
    T: windows::core::RuntimeType + 'static,
{
    let boxed = properties.Lookup(&HSTRING::from(key)).ok()?;
    match boxed.cast::<IReference<T>>().and_then(|r| r.Value()) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Property {} unreadable: {}", key, e);
            None
        }
    }
}

fn string_property(properties: &IMapView<HSTRING, IInspectable>, key: &str) -> Option<String> {
    value_property::<HSTRING>(properties, key).map(|s| s.to_string())
}
