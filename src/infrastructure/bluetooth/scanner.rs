//! Scan controller
//!
//! Drives one OS watcher at a time. Every `start` opens a new generation with
//! its own event channel, sink and pump task, so a late `Stopped` from an
//! earlier scan reaches that scan's sink without disturbing the current one.

use crate::domain::error::BleError;
use crate::domain::ids;
use crate::domain::models::{
    Advertisement, DeviceRecord, DeviceUpdate, ScanEvent, ScanFilter, ScanKind,
};
use crate::infrastructure::bluetooth::backend::{ActiveWatcher, ScanBackend};
use crate::infrastructure::bluetooth::shutdown::ShutdownSignal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    /// Stop requested, waiting for the OS to confirm
    Stopping,
}

/// Receives scan results. Methods run on a runtime worker thread.
pub trait ScanSink: Send + Sync + 'static {
    fn advertisement(&self, _advertisement: &Advertisement) {}
    fn device_added(&self, _device: &DeviceRecord) {}
    fn device_updated(&self, _update: &DeviceUpdate) {}
    fn device_removed(&self, _update: &DeviceUpdate) {}
    fn enumeration_completed(&self) {}
    fn stopped(&self) {}
}

struct ScanInner<W> {
    state: ScanState,
    watcher: Option<W>,
    generation: u64,
}

type SharedInner<W> = Arc<Mutex<ScanInner<W>>>;

fn lock<W>(inner: &Mutex<ScanInner<W>>) -> MutexGuard<'_, ScanInner<W>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ScanController<S: ScanBackend> {
    backend: Arc<S>,
    shutdown: Arc<ShutdownSignal>,
    runtime: Handle,
    inner: SharedInner<S::Watcher>,
}

impl<S: ScanBackend> ScanController<S> {
    pub fn new(backend: Arc<S>, shutdown: Arc<ShutdownSignal>, runtime: Handle) -> Self {
        Self {
            backend,
            shutdown,
            runtime,
            inner: Arc::new(Mutex::new(ScanInner {
                state: ScanState::Idle,
                watcher: None,
                generation: 0,
            })),
        }
    }

    /// Start scanning, replacing any scan already running.
    pub fn start(&self, filter: ScanFilter, sink: Arc<dyn ScanSink>) -> Result<(), BleError> {
        if let Err(e) = self.stop() {
            warn!("Failed to stop previous scan: {}", e);
        }
        self.shutdown.reset();

        match filter.kind {
            ScanKind::Advertisement => info!(
                "Starting advertisement scan (name: {:?}, service: {:?})",
                filter.name, filter.service
            ),
            ScanKind::DeviceEnumeration => info!("Starting device enumeration"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = self.backend.start(&filter, tx)?;

        let (generation, previous) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.state = ScanState::Scanning;
            (inner.generation, inner.watcher.replace(watcher))
        };
        // A concurrent start slipped in between our stop and insert
        if let Some(previous) = previous {
            if let Err(e) = previous.stop() {
                warn!("Failed to stop replaced watcher: {}", e);
            }
        }

        self.runtime.spawn(pump(
            self.inner.clone(),
            self.shutdown.clone(),
            generation,
            rx,
            sink,
        ));
        Ok(())
    }

    /// Ask the OS to stop the current scan.
    ///
    /// Data events may still arrive briefly; the sink's `stopped` fires once
    /// the OS confirms.
    pub fn stop(&self) -> Result<(), BleError> {
        stop_generation(&self.inner, None).map(|_| ())
    }

    pub fn state(&self) -> ScanState {
        lock(&self.inner).state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScanState::Scanning
    }
}

impl<S: ScanBackend> Drop for ScanController<S> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Stop the running watcher. With `only` set, a newer generation is left alone.
fn stop_generation<W: ActiveWatcher>(
    inner: &Mutex<ScanInner<W>>,
    only: Option<u64>,
) -> Result<bool, BleError> {
    let (watcher, generation) = {
        let mut guard = lock(inner);
        if only.is_some_and(|g| g != guard.generation) {
            return Ok(false);
        }
        match guard.watcher.take() {
            Some(watcher) => {
                guard.state = ScanState::Stopping;
                (watcher, guard.generation)
            }
            None => return Ok(false),
        }
    };

    info!("Stopping scan");
    if let Err(e) = watcher.stop() {
        // No Stopped notification will follow
        let mut guard = lock(inner);
        if guard.generation == generation {
            guard.state = ScanState::Idle;
        }
        return Err(e);
    }
    Ok(true)
}

async fn pump<W: ActiveWatcher>(
    inner: SharedInner<W>,
    shutdown: Arc<ShutdownSignal>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    sink: Arc<dyn ScanSink>,
) {
    let mut confirmed = false;
    while let Some(event) = events.recv().await {
        match event {
            ScanEvent::Stopped => {
                confirmed = true;
                break;
            }
            _ if shutdown.is_requested() => {}
            ScanEvent::Advertisement(advertisement) => {
                debug!(
                    "Advertisement from {} ({} dBm)",
                    ids::format_mac(advertisement.address),
                    advertisement.signal_strength
                );
                sink.advertisement(&advertisement);
            }
            ScanEvent::DeviceAdded(device) => sink.device_added(&device),
            ScanEvent::DeviceUpdated(update) => sink.device_updated(&update),
            ScanEvent::DeviceRemoved(update) => sink.device_removed(&update),
            ScanEvent::EnumerationCompleted => {
                info!("Device enumeration completed");
                if let Err(e) = stop_generation(&inner, Some(generation)) {
                    warn!("Failed to stop enumeration watcher: {}", e);
                }
                sink.enumeration_completed();
            }
        }
    }

    // Every sender is gone when the OS released the watcher before its
    // Stopped handler ran. Nothing more can arrive, so the scan is over.
    if !confirmed {
        debug!("Scan {} event channel closed without confirmation", generation);
    }
    let orphan = {
        let mut guard = lock(&inner);
        if guard.generation == generation {
            guard.state = ScanState::Idle;
            guard.watcher.take()
        } else {
            None
        }
    };
    if let Some(watcher) = orphan.filter(|_| !confirmed) {
        if let Err(e) = watcher.stop() {
            warn!("Failed to stop abandoned watcher: {}", e);
        }
    }
    debug!("Scan {} stopped", generation);
    sink.stopped();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockBackend;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    struct RecordingSink(mpsc::UnboundedSender<String>);

    impl ScanSink for RecordingSink {
        fn advertisement(&self, advertisement: &Advertisement) {
            let _ = self.0.send(format!("advertisement:{}", advertisement.name));
        }
        fn device_added(&self, device: &DeviceRecord) {
            let _ = self.0.send(format!("added:{}", device.id));
        }
        fn device_updated(&self, update: &DeviceUpdate) {
            let _ = self.0.send(format!("updated:{}", update.id));
        }
        fn device_removed(&self, update: &DeviceUpdate) {
            let _ = self.0.send(format!("removed:{}", update.id));
        }
        fn enumeration_completed(&self) {
            let _ = self.0.send("completed".to_string());
        }
        fn stopped(&self) {
            let _ = self.0.send("stopped".to_string());
        }
    }

    fn recording() -> (Arc<dyn ScanSink>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RecordingSink(tx)), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sink event")
            .expect("sink open")
    }

    fn controller() -> (Arc<MockBackend>, Arc<ShutdownSignal>, ScanController<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let controller = ScanController::new(backend.clone(), shutdown.clone(), Handle::current());
        (backend, shutdown, controller)
    }

    fn advert(name: &str) -> ScanEvent {
        ScanEvent::Advertisement(Advertisement {
            address: 0x1122_3344_5566,
            name: name.to_string(),
            signal_strength: -60,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_advertisement_scan_lifecycle() {
        let (backend, _, controller) = controller();
        let (sink, mut rx) = recording();

        let filter = ScanFilter {
            name: Some("Pad".to_string()),
            service: Some(Uuid::from_u128(0x180D)),
            ..Default::default()
        };
        controller.start(filter.clone(), sink).unwrap();
        assert_eq!(controller.state(), ScanState::Scanning);
        assert_eq!(backend.scan_filters.lock().unwrap().as_slice(), &[filter]);

        assert!(backend.emit_scan_event(advert("Pad")));
        assert_eq!(next(&mut rx).await, "advertisement:Pad");

        controller.stop().unwrap();
        assert_eq!(controller.state(), ScanState::Stopping);
        assert!(!backend.emit_scan_event(advert("Pad")));

        assert_eq!(next(&mut rx).await, "stopped");
        assert_eq!(controller.state(), ScanState::Idle);
        assert_eq!(backend.watcher_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enumeration_stops_itself() {
        let (backend, _, controller) = controller();
        let (sink, mut rx) = recording();

        let filter = ScanFilter {
            kind: ScanKind::DeviceEnumeration,
            ..Default::default()
        };
        controller.start(filter, sink).unwrap();

        backend.emit_scan_event(ScanEvent::DeviceAdded(DeviceRecord {
            id: "dev-1".to_string(),
            ..Default::default()
        }));
        backend.emit_scan_event(ScanEvent::DeviceUpdated(DeviceUpdate {
            id: "dev-1".to_string(),
            ..Default::default()
        }));
        backend.emit_scan_event(ScanEvent::EnumerationCompleted);

        assert_eq!(next(&mut rx).await, "added:dev-1");
        assert_eq!(next(&mut rx).await, "updated:dev-1");
        assert_eq!(next(&mut rx).await, "completed");
        assert_eq!(next(&mut rx).await, "stopped");
        assert_eq!(controller.state(), ScanState::Idle);
        assert_eq!(backend.watcher_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_isolates_generations() {
        let (backend, _, controller) = controller();
        let (first, mut first_rx) = recording();
        let (second, mut second_rx) = recording();

        controller.start(ScanFilter::default(), first).unwrap();
        controller.start(ScanFilter::default(), second).unwrap();

        // The first scan sees its own Stopped, the new one keeps running
        assert_eq!(next(&mut first_rx).await, "stopped");
        assert_eq!(controller.state(), ScanState::Scanning);

        backend.emit_scan_event(advert("Second"));
        assert_eq!(next(&mut second_rx).await, "advertisement:Second");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_resets_shutdown() {
        let (_, shutdown, controller) = controller();
        let (sink, _rx) = recording();
        shutdown.request();

        controller.start(ScanFilter::default(), sink).unwrap();
        assert!(!shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let (backend, _, controller) = controller();
        controller.stop().unwrap();
        assert_eq!(controller.state(), ScanState::Idle);
        assert_eq!(backend.watcher_stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_ends_scan() {
        let (backend, _, controller) = controller();
        backend.set_silent_stop(true);
        let (sink, mut rx) = recording();
        controller.start(ScanFilter::default(), sink).unwrap();

        // The watcher drops its sender without a Stopped event
        controller.stop().unwrap();

        assert_eq!(next(&mut rx).await, "stopped");
        assert_eq!(controller.state(), ScanState::Idle);
        assert_eq!(backend.watcher_stops.load(Ordering::SeqCst), 1);

        // A later scan starts cleanly
        backend.set_silent_stop(false);
        let (sink, mut rx) = recording();
        controller.start(ScanFilter::default(), sink).unwrap();
        assert!(backend.emit_scan_event(advert("Again")));
        assert_eq!(next(&mut rx).await, "advertisement:Again");
    }

    #[tokio::test]
    async fn test_events_dropped_after_shutdown() {
        let (backend, shutdown, controller) = controller();
        let (sink, mut rx) = recording();
        controller.start(ScanFilter::default(), sink).unwrap();

        shutdown.request();
        backend.emit_scan_event(advert("Late"));
        controller.stop().unwrap();

        // Stopped is still reported
        assert_eq!(next(&mut rx).await, "stopped");
    }
}
