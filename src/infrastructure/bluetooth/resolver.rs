//! Discovery and resolution
//!
//! `device` → `service` → `characteristic` each return the cached handle or
//! perform one OS query, inserting the result. Each stage short-circuits on
//! `None`. Failures are logged here and never surface as errors: callers
//! decide whether "not found" matters to the host.
//!
//! The two enumerations bypass the cache on purpose and always ask the OS
//! for a fresh list.

use crate::domain::ids;
use crate::domain::models::{CharacteristicRecord, ServiceRecord};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::backend::{CacheMode, GattBackend};
use crate::infrastructure::bluetooth::cache::ConnectionCache;
use crate::infrastructure::bluetooth::shutdown::ShutdownSignal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub retry_unreachable_cached: bool,
    pub description_placeholder: String,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            retry_unreachable_cached: true,
            description_placeholder: String::new(),
        }
    }
}

impl From<&Settings> for ResolverOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            retry_unreachable_cached: settings.retry_unreachable_cached,
            description_placeholder: settings.user_description_placeholder.clone(),
        }
    }
}

pub struct Resolver<B: GattBackend> {
    backend: Arc<B>,
    cache: Arc<ConnectionCache<B>>,
    shutdown: Arc<ShutdownSignal>,
    options: ResolverOptions,
}

impl<B: GattBackend> Resolver<B> {
    pub fn new(
        backend: Arc<B>,
        cache: Arc<ConnectionCache<B>>,
        shutdown: Arc<ShutdownSignal>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            backend,
            cache,
            shutdown,
            options,
        }
    }

    pub async fn device(&self, address: u64) -> Option<B::Device> {
        if let Some(device) = self.cache.device(address) {
            return Some(device);
        }

        let device = match self.backend.open_device(address).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!("Unable to connect: no device at {}", ids::format_mac(address));
                return None;
            }
            Err(e) => {
                error!("Unable to connect to {}: {}", ids::format_mac(address), e);
                return None;
            }
        };

        if let Err(e) = self.cache.insert_device(address, device.clone()) {
            debug!("Dropping device {}: {}", ids::format_mac(address), e);
            return None;
        }
        info!("Device {} connected", ids::format_mac(address));
        Some(device)
    }

    pub async fn service(&self, address: u64, uuid: Uuid) -> Option<B::Service> {
        let device = self.device(address).await?;

        if let Some(service) = self.cache.service(address, uuid) {
            return Some(service);
        }

        let services = match self
            .backend
            .services(&device, Some(uuid), CacheMode::Cached)
            .await
        {
            Ok(services) => services,
            Err(e) => {
                error!(
                    "Failed retrieving service {} on {}: {}",
                    uuid,
                    ids::format_mac(address),
                    e
                );
                return None;
            }
        };

        if services.len() > 1 {
            debug!("{} services match {}, using the first", services.len(), uuid);
        }
        let Some(service) = services.into_iter().next() else {
            error!(
                "No service found with uuid {} on {}",
                uuid,
                ids::format_mac(address)
            );
            return None;
        };

        if let Err(e) = self.cache.insert_service(address, uuid, service.clone()) {
            // Disconnected or shut down while the query was in flight
            warn!("Dropping service {}: {}", uuid, e);
            return None;
        }
        Some(service)
    }

    pub async fn characteristic(
        &self,
        address: u64,
        service_uuid: Uuid,
        uuid: Uuid,
    ) -> Option<B::Characteristic> {
        let service = self.service(address, service_uuid).await?;

        if let Some(characteristic) = self.cache.characteristic(address, service_uuid, uuid) {
            return Some(characteristic);
        }

        let characteristics = match self
            .backend
            .characteristics(&service, Some(uuid), CacheMode::Cached)
            .await
        {
            Ok(characteristics) => characteristics,
            Err(e) => {
                error!(
                    "Error retrieving characteristic {} from service {}: {}",
                    uuid, service_uuid, e
                );
                return None;
            }
        };

        let Some(characteristic) = characteristics.into_iter().next() else {
            error!(
                "No characteristic found with uuid {} in service {}",
                uuid, service_uuid
            );
            return None;
        };

        if let Err(e) =
            self.cache
                .insert_characteristic(address, service_uuid, uuid, characteristic.clone())
        {
            warn!("Dropping characteristic {}: {}", uuid, e);
            return None;
        }
        Some(characteristic)
    }

    /// Fresh list of every service on the device.
    ///
    /// Stops at the first shutdown checkpoint and returns what was collected.
    pub async fn enumerate_services(&self, address: u64) -> Vec<ServiceRecord> {
        let mut records = Vec::new();

        let Some(device) = self.device(address).await else {
            return records;
        };

        let mut result = self
            .backend
            .services(&device, None, CacheMode::Uncached)
            .await;
        if self.shutdown.is_requested() {
            return records;
        }

        if self.options.retry_unreachable_cached
            && matches!(&result, Err(e) if e.is_unreachable())
        {
            debug!(
                "{} unreachable, retrying service list from the OS cache",
                ids::format_mac(address)
            );
            result = self.backend.services(&device, None, CacheMode::Cached).await;
            if self.shutdown.is_requested() {
                return records;
            }
        }

        let services = match result {
            Ok(services) => services,
            Err(e) => {
                error!(
                    "Scanning services of {} failed: {}",
                    ids::format_mac(address),
                    e
                );
                return records;
            }
        };

        if services.is_empty() {
            info!("No services found for device {}", ids::format_mac(address));
        }

        for service in &services {
            match self.backend.service_uuid(service) {
                Ok(uuid) => records.push(ServiceRecord { uuid }),
                Err(e) => warn!("Skipping service without readable uuid: {}", e),
            }

            if self.shutdown.is_requested() {
                break;
            }
        }

        records
    }

    /// Fresh list of every characteristic of a cached (or newly resolved)
    /// service, each with its user description.
    pub async fn enumerate_characteristics(
        &self,
        address: u64,
        service_uuid: Uuid,
    ) -> Vec<CharacteristicRecord> {
        let mut records = Vec::new();

        let Some(service) = self.service(address, service_uuid).await else {
            return records;
        };
        if self.shutdown.is_requested() {
            return records;
        }

        let characteristics = match self
            .backend
            .characteristics(&service, None, CacheMode::Uncached)
            .await
        {
            Ok(characteristics) => characteristics,
            Err(e) => {
                error!(
                    "Error scanning characteristics from service {}: {}",
                    service_uuid, e
                );
                return records;
            }
        };

        for characteristic in &characteristics {
            let uuid = match self.backend.characteristic_uuid(characteristic) {
                Ok(uuid) => uuid,
                Err(e) => {
                    warn!("Skipping characteristic without readable uuid: {}", e);
                    continue;
                }
            };

            let user_description = match self.backend.user_description(characteristic).await {
                Ok(Some(description)) => description,
                Ok(None) => self.options.description_placeholder.clone(),
                Err(e) => {
                    warn!(
                        "Couldn't read user description for characteristic {}: {}",
                        uuid, e
                    );
                    self.options.description_placeholder.clone()
                }
            };

            records.push(CharacteristicRecord {
                uuid,
                user_description,
            });

            if self.shutdown.is_requested() {
                break;
            }
        }

        records
    }
}
