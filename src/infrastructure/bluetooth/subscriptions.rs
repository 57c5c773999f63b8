//! Notification subscriptions
//!
//! Every active subscription holds the revocation capability returned by the
//! backend. The registry is the only owner, so each registration is revoked
//! exactly once: by `unsubscribe`, or by `revoke_all` at shutdown.
//!
//! A new registration is admitted only after checking the quit flag while the
//! registry lock is held. Shutdown sets the flag before `revoke_all` takes the
//! lock, so a subscribe that finishes late revokes its own registration.

use crate::domain::error::BleError;
use crate::domain::models::{CharacteristicKey, Notification, ValueBuffer};
use crate::infrastructure::bluetooth::backend::{GattBackend, NotifyConfig, ValueChangedHandler};
use crate::infrastructure::bluetooth::resolver::Resolver;
use crate::infrastructure::bluetooth::shutdown::ShutdownSignal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

pub type ValueCallback = Arc<dyn Fn(Notification) + Send + Sync>;

struct Subscription<B: GattBackend> {
    key: CharacteristicKey,
    characteristic: B::Characteristic,
    registration: B::Registration,
}

pub struct SubscriptionManager<B: GattBackend> {
    backend: Arc<B>,
    resolver: Arc<Resolver<B>>,
    shutdown: Arc<ShutdownSignal>,
    subscriptions: Mutex<Vec<Subscription<B>>>,
}

impl<B: GattBackend> SubscriptionManager<B> {
    pub fn new(backend: Arc<B>, resolver: Arc<Resolver<B>>, shutdown: Arc<ShutdownSignal>) -> Self {
        Self {
            backend,
            resolver,
            shutdown,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription<B>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable notifications and route every value to `on_value`.
    ///
    /// Subscribing to a key that is already active succeeds without
    /// replacing the existing handler.
    pub async fn subscribe(
        &self,
        key: CharacteristicKey,
        on_value: ValueCallback,
    ) -> Result<(), BleError> {
        if self.shutdown.is_requested() {
            return Err(BleError::Cancelled);
        }
        if self.is_subscribed(&key) {
            debug!("Already subscribed to {}", key);
            return Ok(());
        }

        let Some(characteristic) = self
            .resolver
            .characteristic(key.address, key.service, key.characteristic)
            .await
        else {
            if self.shutdown.is_requested() {
                return Err(BleError::Cancelled);
            }
            return Err(BleError::not_found(format!("characteristic {}", key)));
        };

        if let Err(e) = self
            .backend
            .configure_notifications(&characteristic, NotifyConfig::Notify)
            .await
        {
            error!("Error subscribing to characteristic {}: {}", key, e);
            return Err(e);
        }

        let registration = self
            .backend
            .on_value_changed(&characteristic, self.value_handler(key, on_value))?;

        let mut subscriptions = self.subscriptions();
        let rejected = if self.shutdown.is_requested() {
            Some(Err(BleError::Cancelled))
        } else if subscriptions.iter().any(|s| s.key == key) {
            // Lost a race with a concurrent subscribe for the same key
            Some(Ok(()))
        } else {
            None
        };
        if let Some(result) = rejected {
            drop(subscriptions);
            self.backend.revoke(&characteristic, registration);
            return result;
        }
        subscriptions.push(Subscription {
            key,
            characteristic,
            registration,
        });
        drop(subscriptions);

        info!("Subscribed to {}", key);
        Ok(())
    }

    fn value_handler(&self, key: CharacteristicKey, on_value: ValueCallback) -> ValueChangedHandler {
        let shutdown = self.shutdown.clone();
        Arc::new(move |data: &[u8]| {
            if shutdown.is_requested() {
                return;
            }
            match ValueBuffer::from_slice(data) {
                Ok(value) => on_value(Notification { key, value }),
                Err(e) => error!("Dropping notification from {}: {}", key, e),
            }
        })
    }

    /// Disable notifications for `key`.
    ///
    /// Returns `Ok(false)` when no subscription is active. When the device
    /// rejects the CCCD write the handler is still revoked and the error is
    /// returned.
    pub async fn unsubscribe(&self, key: CharacteristicKey) -> Result<bool, BleError> {
        let characteristic = self
            .subscriptions()
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.characteristic.clone());
        let Some(characteristic) = characteristic else {
            return Ok(false);
        };

        let written = self
            .backend
            .configure_notifications(&characteristic, NotifyConfig::None)
            .await;

        let removed = {
            let mut subscriptions = self.subscriptions();
            subscriptions
                .iter()
                .position(|s| s.key == key)
                .map(|index| subscriptions.remove(index))
        };
        if let Some(subscription) = removed {
            self.backend
                .revoke(&subscription.characteristic, subscription.registration);
        }

        match written {
            Ok(()) => {
                info!("Unsubscribed from {}", key);
                Ok(true)
            }
            Err(e) => {
                error!("Error unsubscribing from characteristic {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Revoke every handler without touching the devices.
    pub fn revoke_all(&self) {
        let drained: Vec<Subscription<B>> = self.subscriptions().drain(..).collect();
        if !drained.is_empty() {
            debug!("Revoking {} subscriptions", drained.len());
        }
        for subscription in drained {
            self.backend
                .revoke(&subscription.characteristic, subscription.registration);
        }
    }

    pub fn is_subscribed(&self, key: &CharacteristicKey) -> bool {
        self.subscriptions().iter().any(|s| s.key == *key)
    }

    pub fn len(&self) -> usize {
        self.subscriptions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::GattStatus;
    use crate::infrastructure::bluetooth::cache::ConnectionCache;
    use crate::infrastructure::bluetooth::mock::MockBackend;
    use crate::infrastructure::bluetooth::resolver::ResolverOptions;
    use uuid::Uuid;

    const ADDR: u64 = 0x0C0F_FEE0_0001;

    fn key(n: u128) -> CharacteristicKey {
        CharacteristicKey::new(ADDR, Uuid::from_u128(0x180D), Uuid::from_u128(0x2A37 + n))
    }

    struct Fixture {
        backend: Arc<MockBackend>,
        shutdown: Arc<ShutdownSignal>,
        manager: SubscriptionManager<MockBackend>,
        received: Arc<Mutex<Vec<Notification>>>,
    }

    impl Fixture {
        fn callback(&self) -> ValueCallback {
            let received = self.received.clone();
            Arc::new(move |n| received.lock().unwrap().push(n))
        }
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        for n in 0..3 {
            let k = key(n);
            backend.add_characteristic(ADDR, k.service, k.characteristic, None);
        }
        let shutdown = Arc::new(ShutdownSignal::new());
        let cache = Arc::new(ConnectionCache::new(backend.clone(), shutdown.clone()));
        let resolver = Arc::new(Resolver::new(
            backend.clone(),
            cache,
            shutdown.clone(),
            ResolverOptions::default(),
        ));
        let manager = SubscriptionManager::new(backend.clone(), resolver, shutdown.clone());
        Fixture {
            backend,
            shutdown,
            manager,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_values() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();

        assert_eq!(f.backend.cccd_writes(), vec![(key(0), NotifyConfig::Notify)]);
        assert_eq!(f.backend.notify(&key(0), &[1, 2, 3]), 1);

        let received = f.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].key, key(0));
        assert_eq!(received[0].value.as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_oversized_notification_rejected() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();

        f.backend.notify(&key(0), &[0u8; 600]);
        assert!(f.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_keeps_one_handler() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();

        assert_eq!(f.manager.len(), 1);
        assert_eq!(f.backend.active_handlers(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_characteristic() {
        let f = fixture();
        let missing = CharacteristicKey::new(ADDR, Uuid::from_u128(0x180D), Uuid::from_u128(1));
        let err = f.manager.subscribe(missing, f.callback()).await.unwrap_err();
        assert!(matches!(err, BleError::NotFound(_)));
        assert!(f.manager.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_cccd_failure() {
        let f = fixture();
        f.backend.set_cccd_status(GattStatus::AccessDenied);

        let err = f.manager.subscribe(key(0), f.callback()).await.unwrap_err();
        assert!(matches!(
            err,
            BleError::Communication(GattStatus::AccessDenied)
        ));
        assert_eq!(f.backend.active_handlers(), 0);
        assert!(f.manager.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription_is_noop() {
        let f = fixture();
        assert!(!f.manager.unsubscribe(key(1)).await.unwrap());
        assert!(f.backend.cccd_writes().is_empty());
        assert_eq!(f.backend.revocations(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_disables_and_revokes() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();
        f.manager.subscribe(key(1), f.callback()).await.unwrap();

        assert!(f.manager.unsubscribe(key(0)).await.unwrap());

        assert_eq!(
            f.backend.cccd_writes().last(),
            Some(&(key(0), NotifyConfig::None))
        );
        assert_eq!(f.backend.revocations(), 1);
        assert!(!f.manager.is_subscribed(&key(0)));
        assert!(f.manager.is_subscribed(&key(1)));
        assert_eq!(f.backend.notify(&key(0), &[9]), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_failure_still_revokes() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();
        f.backend.set_cccd_status(GattStatus::Unreachable);

        assert!(f.manager.unsubscribe(key(0)).await.is_err());
        assert!(f.manager.is_empty());
        assert_eq!(f.backend.active_handlers(), 0);
    }

    #[tokio::test]
    async fn test_revoke_all_revokes_each_once() {
        let f = fixture();
        for n in 0..3 {
            f.manager.subscribe(key(n), f.callback()).await.unwrap();
        }

        f.manager.revoke_all();
        f.manager.revoke_all();

        assert_eq!(f.backend.revocations(), 3);
        assert_eq!(f.backend.active_handlers(), 0);
        // No CCCD writes beyond the three enables
        assert_eq!(f.backend.cccd_writes().len(), 3);
    }

    #[tokio::test]
    async fn test_no_delivery_after_shutdown() {
        let f = fixture();
        f.manager.subscribe(key(0), f.callback()).await.unwrap();
        f.shutdown.request();

        f.backend.notify(&key(0), &[1]);
        assert!(f.received.lock().unwrap().is_empty());
        assert!(matches!(
            f.manager.subscribe(key(1), f.callback()).await,
            Err(BleError::Cancelled)
        ));
    }
}
