//! Device discovery with per-session de-duplication

use futures::Stream;
use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Mutex, broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    core::{
        error::{DiscoveryError, DiscoveryResult},
        transfer::deadline_after,
        types::{DeviceHandle, DeviceId},
    },
    transport::{DiscoveryEvents, PairingTransport},
};

/// Scan window used when the caller does not choose one
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(50);

const NOTIFICATION_CAPACITY: usize = 64;

/// Devices admitted during one scan
#[derive(Debug, Default)]
struct DiscoverySession {
    seen: HashMap<DeviceId, DeviceHandle>,
    order: Vec<DeviceId>,
}

impl DiscoverySession {
    /// Admit a device, returning `false` if its identifier was already seen
    fn admit(&mut self, device: &DeviceHandle) -> bool {
        if self.seen.contains_key(&device.id) {
            return false;
        }
        self.order.push(device.id.clone());
        self.seen.insert(device.id.clone(), device.clone());
        true
    }

    /// Admitted devices in first-seen order
    fn into_devices(mut self) -> Vec<DeviceHandle> {
        self.order
            .iter()
            .filter_map(|id| self.seen.remove(id))
            .collect()
    }
}

/// Bookkeeping for the scan currently running
struct ActiveScan {
    generation: u64,
    stop_tx: oneshot::Sender<()>,
    pump: JoinHandle<DiscoverySession>,
}

#[derive(Default)]
struct CoordinatorState {
    active: Option<ActiveScan>,
    generation: u64,
}

/// Stream of newly discovered devices
///
/// Ends once the scan is stopped.
pub struct DiscoveryStream {
    rx: mpsc::UnboundedReceiver<DeviceHandle>,
}

impl Stream for DiscoveryStream {
    type Item = DeviceHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Discovery coordinator
///
/// Owns the transport's discovery subscription while a scan runs and admits
/// each device at most once per scan.
pub struct DiscoveryCoordinator<T: PairingTransport> {
    shared: Arc<Shared<T>>,
}

/// State reachable from both the coordinator and a background teardown
struct Shared<T: PairingTransport> {
    transport: Arc<T>,
    state: Mutex<CoordinatorState>,
    scanning: watch::Sender<bool>,
    notifications: broadcast::Sender<DeviceHandle>,
}

/// Tears down a bounded scan when its caller goes away before the window ends
///
/// `release` stops the scan in place. An unreleased guard spawns the
/// teardown onto the current runtime when dropped.
struct ScanGuard<T: PairingTransport> {
    shared: Arc<Shared<T>>,
    generation: u64,
    released: bool,
}

impl<T: PairingTransport> ScanGuard<T> {
    fn new(shared: Arc<Shared<T>>, generation: u64) -> Self {
        Self {
            shared,
            generation,
            released: false,
        }
    }

    /// Stop the scan; `None` if another caller already stopped it
    async fn release(mut self) -> Option<Vec<DeviceHandle>> {
        self.released = true;
        self.shared.finish(Some(self.generation)).await
    }
}

impl<T: PairingTransport> Drop for ScanGuard<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("Discovery abandoned, stopping scan in background");
        match Handle::try_current() {
            Ok(handle) => {
                let shared = self.shared.clone();
                let generation = self.generation;
                handle.spawn(async move {
                    shared.finish(Some(generation)).await;
                });
            }
            Err(_) => error!("No runtime available, scan left running"),
        }
    }
}

impl<T: PairingTransport> DiscoveryCoordinator<T> {
    /// Create a new coordinator on top of `transport`
    pub fn new(transport: Arc<T>) -> Self {
        let (scanning, _) = watch::channel(false);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(CoordinatorState::default()),
                scanning,
                notifications,
            }),
        }
    }

    /// Scan for `window` and return every distinct device seen
    ///
    /// Returns early with what was found so far if `stop` is called.
    pub async fn discover(
        &self,
        service_filter: Uuid,
        window: Duration,
    ) -> DiscoveryResult<Vec<DeviceHandle>> {
        let (generation, mut found) = self.shared.start(service_filter).await?;
        let guard = ScanGuard::new(self.shared.clone(), generation);
        let deadline = deadline_after(window);
        let mut received = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, found.recv()).await {
                Ok(Some(device)) => received.push(device),
                Ok(None) => {
                    debug!("Scan ended before the window elapsed");
                    break;
                }
                Err(_) => break,
            }
        }

        // The session also holds devices admitted after the window closed.
        // `None` means a `stop` elsewhere took the session and closed `found`.
        let devices = match guard.release().await {
            Some(session) => session,
            None => {
                while let Ok(device) = found.try_recv() {
                    received.push(device);
                }
                received
            }
        };
        info!("Discovery finished with {} device(s)", devices.len());
        Ok(devices)
    }

    /// Scan until `stop` is called, yielding each new device as it appears
    pub async fn start_discovery(&self, service_filter: Uuid) -> DiscoveryResult<DiscoveryStream> {
        let (_, rx) = self.shared.start(service_filter).await?;
        Ok(DiscoveryStream { rx })
    }

    /// Stop the running scan and return the devices it admitted
    ///
    /// Does nothing when no scan is running.
    pub async fn stop(&self) -> Vec<DeviceHandle> {
        self.shared.finish(None).await.unwrap_or_default()
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning.borrow()
    }

    /// Observe the scanning flag
    pub fn scanning(&self) -> watch::Receiver<bool> {
        self.shared.scanning.subscribe()
    }

    /// Receive one notification per newly admitted device
    pub fn notifications(&self) -> broadcast::Receiver<DeviceHandle> {
        self.shared.notifications.subscribe()
    }
}

impl<T: PairingTransport> Shared<T> {
    async fn start(
        &self,
        service_filter: Uuid,
    ) -> DiscoveryResult<(u64, mpsc::UnboundedReceiver<DeviceHandle>)> {
        let mut state = self.state.lock().await;
        if state.active.is_some() {
            return Err(DiscoveryError::ScanInProgress);
        }

        if !self.transport.adapter_ready().await? {
            return Err(DiscoveryError::AdapterUnavailable);
        }

        let events = self.transport.subscribe_discoveries().await?;
        if let Err(e) = self.transport.start_scan(service_filter).await {
            warn!("Failed to start scan: {}", e);
            return Err(e.into());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let (found_tx, found_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_discoveries(
            events,
            stop_rx,
            found_tx,
            self.notifications.clone(),
        ));

        state.generation += 1;
        state.active = Some(ActiveScan {
            generation: state.generation,
            stop_tx,
            pump,
        });
        self.scanning.send_replace(true);

        info!("Scanning for devices advertising {}", service_filter);
        Ok((state.generation, found_rx))
    }

    /// Tear down the active scan, or only scan `generation` if given
    ///
    /// Returns `None` when there was nothing of ours to stop.
    async fn finish(&self, generation: Option<u64>) -> Option<Vec<DeviceHandle>> {
        let mut state = self.state.lock().await;

        let owned = match (&state.active, generation) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(active), Some(g)) => active.generation == g,
        };
        if !owned {
            return None;
        }
        let active = state.active.take()?;

        let _ = active.stop_tx.send(());
        let session = match active.pump.await {
            Ok(session) => session,
            Err(e) => {
                warn!("Discovery task ended abnormally: {}", e);
                DiscoverySession::default()
            }
        };

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.scanning.send_replace(false);

        debug!("Scan stopped");
        Some(session.into_devices())
    }
}

/// Forward transport events, admitting each device once
///
/// Dropping `events` on return releases the subscription.
async fn pump_discoveries(
    mut events: DiscoveryEvents,
    mut stop_rx: oneshot::Receiver<()>,
    found_tx: mpsc::UnboundedSender<DeviceHandle>,
    notifications: broadcast::Sender<DeviceHandle>,
) -> DiscoverySession {
    let mut session = DiscoverySession::default();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            event = events.recv() => {
                let Some(device) = event else {
                    debug!("Transport closed the discovery stream");
                    break;
                };
                if !session.admit(&device) {
                    continue;
                }

                debug!(
                    "Discovered {} ({}), rssi {:?}",
                    device.display_name(),
                    device.id,
                    device.rssi
                );
                let _ = notifications.send(device.clone());
                let _ = found_tx.send(device);
            }
        }
    }

    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::error::TransportError,
        protocol::PAIRING_SERVICE_UUID,
        transport::mock_transport::{FailurePoint, MockCall, MockTransport},
    };
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use tokio::time::Instant;
    use tokio_test::assert_ok;

    fn ids(devices: &[DeviceHandle]) -> Vec<&str> {
        devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_session_admits_once() {
        let mut session = DiscoverySession::default();
        assert!(session.admit(&DeviceHandle::new("A")));
        assert!(session.admit(&DeviceHandle::new("B")));
        assert!(!session.admit(&DeviceHandle::new("A").with_rssi(-30)));

        let devices = session.into_devices();
        assert_eq!(ids(&devices), vec!["A", "B"]);
        // First advertisement wins
        assert_eq!(devices[0].rssi, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_deduplicates() {
        let transport = Arc::new(MockTransport::new());
        transport
            .set_advertisements(vec![
                DeviceHandle::new("A").with_name("pico-a"),
                DeviceHandle::new("B"),
                DeviceHandle::new("A"),
                DeviceHandle::new("C"),
                DeviceHandle::new("B"),
                DeviceHandle::new("A"),
            ])
            .await;

        let coordinator = DiscoveryCoordinator::new(transport.clone());
        let mut notifications = coordinator.notifications();

        let devices = coordinator
            .discover(PAIRING_SERVICE_UUID, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(ids(&devices), vec!["A", "B", "C"]);
        assert_eq!(devices[0].name.as_deref(), Some("pico-a"));

        let mut notified = vec![];
        while let Ok(device) = notifications.try_recv() {
            notified.push(device.id.to_string());
        }
        assert_eq!(notified, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_filters_by_service_and_cleans_up() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let devices = coordinator
            .discover(PAIRING_SERVICE_UUID, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(devices.is_empty());

        assert_eq!(
            transport.calls().await,
            vec![MockCall::StartScan(PAIRING_SERVICE_UUID), MockCall::StopScan]
        );
        assert!(!transport.is_scanning().await);
        assert!(!transport.has_subscriber().await);
        assert!(!coordinator.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_waits_for_window() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = Arc::new(DiscoveryCoordinator::new(transport.clone()));

        let started = Instant::now();
        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .discover(PAIRING_SERVICE_UUID, Duration::from_secs(10))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(coordinator.is_scanning());
        transport.advertise(DeviceHandle::new("late")).await;

        let devices = task.await.unwrap().unwrap();
        assert_eq!(ids(&devices), vec!["late"]);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!coordinator.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_bounded_discovery_early() {
        let transport = Arc::new(MockTransport::new());
        transport
            .set_advertisements(vec![DeviceHandle::new("A")])
            .await;
        let coordinator = Arc::new(DiscoveryCoordinator::new(transport.clone()));

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .discover(PAIRING_SERVICE_UUID, Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped = coordinator.stop().await;
        assert_eq!(ids(&stopped), vec!["A"]);
        assert!(!coordinator.is_scanning());

        let devices = task.await.unwrap().unwrap();
        assert_eq!(ids(&devices), vec!["A"]);
    }

    #[tokio::test]
    async fn test_streaming_discovery() {
        let transport = Arc::new(MockTransport::new());
        transport
            .set_advertisements(vec![DeviceHandle::new("A"), DeviceHandle::new("A")])
            .await;
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let mut stream = coordinator
            .start_discovery(PAIRING_SERVICE_UUID)
            .await
            .unwrap();
        assert!(coordinator.is_scanning());

        assert_eq!(stream.next().await.unwrap().id.as_str(), "A");
        transport.advertise(DeviceHandle::new("A")).await;
        transport.advertise(DeviceHandle::new("B")).await;
        assert_eq!(stream.next().await.unwrap().id.as_str(), "B");

        let devices = coordinator.stop().await;
        assert_eq!(ids(&devices), vec!["A", "B"]);
        assert!(!coordinator.is_scanning());

        // Stream terminates once stopped
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_start_while_scanning_is_rejected() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let _stream = coordinator
            .start_discovery(PAIRING_SERVICE_UUID)
            .await
            .unwrap();

        let second = coordinator.start_discovery(PAIRING_SERVICE_UUID).await;
        assert!(matches!(second, Err(DiscoveryError::ScanInProgress)));
        assert!(coordinator.is_scanning());

        coordinator.stop().await;
        assert_ok!(coordinator.start_discovery(PAIRING_SERVICE_UUID).await);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        assert!(coordinator.stop().await.is_empty());
        assert!(coordinator.stop().await.is_empty());
        assert!(!coordinator.is_scanning());
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_scanning_flag_observable() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = DiscoveryCoordinator::new(transport);
        let flag = coordinator.scanning();
        assert!(!*flag.borrow());

        let _stream = coordinator
            .start_discovery(PAIRING_SERVICE_UUID)
            .await
            .unwrap();
        assert!(*flag.borrow());

        coordinator.stop().await;
        assert!(!*flag.borrow());
    }

    #[tokio::test]
    async fn test_stop_scan_failure_is_swallowed() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_at(FailurePoint::StopScan).await;
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        coordinator
            .start_discovery(PAIRING_SERVICE_UUID)
            .await
            .unwrap();
        coordinator.stop().await;
        assert!(!coordinator.is_scanning());
    }

    #[tokio::test]
    async fn test_start_scan_failure_releases_subscription() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_at(FailurePoint::StartScan).await;
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let result = coordinator.start_discovery(PAIRING_SERVICE_UUID).await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Transport(TransportError::Ble(_)))
        ));
        assert!(!coordinator.is_scanning());
        assert!(!transport.has_subscriber().await);
    }

    #[tokio::test]
    async fn test_adapter_unavailable() {
        let transport = Arc::new(MockTransport::new());
        transport.set_adapter_ready(false).await;
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let result = coordinator
            .discover(PAIRING_SERVICE_UUID, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(DiscoveryError::AdapterUnavailable)));
        assert!(transport.calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_at_window_edge_is_returned_and_notified() {
        let window = Duration::from_secs(5);

        for _ in 0..50 {
            let transport = Arc::new(MockTransport::new());
            transport.set_advertisements(vec![DeviceHandle::new("A")]).await;
            let coordinator = DiscoveryCoordinator::new(transport.clone());
            let mut notifications = coordinator.notifications();

            let edge = {
                let transport = transport.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    transport.advertise(DeviceHandle::new("edge")).await;
                })
            };

            let devices = coordinator
                .discover(PAIRING_SERVICE_UUID, window)
                .await
                .unwrap();
            edge.await.unwrap();

            let mut notified = vec![];
            while let Ok(device) = notifications.try_recv() {
                notified.push(device.id.to_string());
            }
            let returned: Vec<String> = devices.iter().map(|d| d.id.to_string()).collect();
            assert_eq!(notified, returned);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_discover_stops_scan() {
        let transport = Arc::new(MockTransport::new());
        let coordinator = DiscoveryCoordinator::new(transport.clone());

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.discover(PAIRING_SERVICE_UUID, Duration::from_secs(10)),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!coordinator.is_scanning());
        assert!(!transport.is_scanning().await);
        assert!(!transport.has_subscriber().await);

        assert_ok!(
            coordinator
                .discover(PAIRING_SERVICE_UUID, Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_ends_on_stop() {
        let transport = Arc::new(MockTransport::new());
        transport.set_advertisements(vec![DeviceHandle::new("A")]).await;
        let coordinator = Arc::new(DiscoveryCoordinator::new(transport.clone()));

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .discover(PAIRING_SERVICE_UUID, Duration::MAX)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        coordinator.stop().await;

        let devices = task.await.unwrap().unwrap();
        assert_eq!(ids(&devices), vec!["A"]);
        assert!(!coordinator.is_scanning());
    }
}
