//! Connection cache
//!
//! Keeps every device, service and characteristic handle that has been
//! resolved once, so later calls reuse it instead of asking the OS again.
//! WinRT denies access when a GATT object is queried a second time while a
//! reference to the first result is still held, which makes the OS-provided
//! attribute cache unusable for this purpose.
//!
//! Handles leave the cache only through [`ConnectionCache::remove`] or
//! [`ConnectionCache::clear`]; both detach the subtree while holding the lock,
//! so each handle is closed by exactly one caller.
//!
//! Inserts check the session's quit flag under the same lock. Shutdown sets
//! the flag before it clears the cache, so a resolution that finishes after
//! the clear is refused instead of repopulating the map. A refused handle is
//! closed right away.

use crate::domain::error::BleError;
use crate::domain::ids;
use crate::infrastructure::bluetooth::backend::GattBackend;
use crate::infrastructure::bluetooth::shutdown::ShutdownSignal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

struct ServiceEntry<B: GattBackend> {
    service: B::Service,
    characteristics: HashMap<Uuid, B::Characteristic>,
}

struct DeviceEntry<B: GattBackend> {
    device: B::Device,
    services: HashMap<Uuid, ServiceEntry<B>>,
}

pub struct ConnectionCache<B: GattBackend> {
    backend: Arc<B>,
    shutdown: Arc<ShutdownSignal>,
    entries: Mutex<HashMap<u64, DeviceEntry<B>>>,
}

impl<B: GattBackend> ConnectionCache<B> {
    pub fn new(backend: Arc<B>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            backend,
            shutdown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, DeviceEntry<B>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self, address: u64) -> Option<B::Device> {
        self.entries().get(&address).map(|e| e.device.clone())
    }

    /// Insert or replace the handle for `address`. Services already cached
    /// under the address are kept.
    ///
    /// Fails with `Cancelled` once shutdown is requested.
    pub fn insert_device(&self, address: u64, device: B::Device) -> Result<(), BleError> {
        let mut entries = self.entries();
        if self.shutdown.is_requested() {
            drop(entries);
            self.backend.close_device(&device);
            return Err(BleError::Cancelled);
        }

        match entries.get_mut(&address) {
            Some(entry) => entry.device = device,
            None => {
                entries.insert(
                    address,
                    DeviceEntry {
                        device,
                        services: HashMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    pub fn service(&self, address: u64, service: Uuid) -> Option<B::Service> {
        self.entries()
            .get(&address)?
            .services
            .get(&service)
            .map(|e| e.service.clone())
    }

    /// Insert or replace a service handle. The device must already be cached.
    pub fn insert_service(
        &self,
        address: u64,
        uuid: Uuid,
        service: B::Service,
    ) -> Result<(), BleError> {
        let mut entries = self.entries();
        let refused = if self.shutdown.is_requested() {
            BleError::Cancelled
        } else if let Some(device) = entries.get_mut(&address) {
            match device.services.get_mut(&uuid) {
                Some(entry) => entry.service = service,
                None => {
                    device.services.insert(
                        uuid,
                        ServiceEntry {
                            service,
                            characteristics: HashMap::new(),
                        },
                    );
                }
            }
            return Ok(());
        } else {
            BleError::not_found(format!("device {}", ids::format_mac(address)))
        };

        drop(entries);
        self.backend.close_service(&service);
        Err(refused)
    }

    pub fn characteristic(
        &self,
        address: u64,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<B::Characteristic> {
        self.entries()
            .get(&address)?
            .services
            .get(&service)?
            .characteristics
            .get(&characteristic)
            .cloned()
    }

    /// Insert or replace a characteristic handle. The service must already be cached.
    pub fn insert_characteristic(
        &self,
        address: u64,
        service: Uuid,
        uuid: Uuid,
        characteristic: B::Characteristic,
    ) -> Result<(), BleError> {
        let mut entries = self.entries();
        let refused = if self.shutdown.is_requested() {
            BleError::Cancelled
        } else if let Some(entry) = entries
            .get_mut(&address)
            .and_then(|d| d.services.get_mut(&service))
        {
            entry.characteristics.insert(uuid, characteristic);
            return Ok(());
        } else {
            BleError::not_found(format!(
                "service {} on {}",
                service,
                ids::format_mac(address)
            ))
        };

        drop(entries);
        self.backend.close_characteristic(&characteristic);
        Err(refused)
    }

    /// Drop `address` and everything under it, closing each handle.
    /// Returns false when nothing was cached.
    pub fn remove(&self, address: u64) -> bool {
        let removed = self.entries().remove(&address);
        match removed {
            Some(entry) => {
                debug!("Releasing cached device {}", ids::format_mac(address));
                self.release(entry);
                true
            }
            None => false,
        }
    }

    /// Release every cached handle and empty the cache.
    pub fn clear(&self) {
        let drained: Vec<(u64, DeviceEntry<B>)> = self.entries().drain().collect();
        if !drained.is_empty() {
            debug!("Releasing {} cached devices", drained.len());
        }
        for (_, entry) in drained {
            self.release(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    // Children before parents; the entry is already detached from the map.
    fn release(&self, entry: DeviceEntry<B>) {
        for service in entry.services.into_values() {
            for characteristic in service.characteristics.values() {
                self.backend.close_characteristic(characteristic);
            }
            self.backend.close_service(&service.service);
        }
        self.backend.close_device(&entry.device);
    }
}
