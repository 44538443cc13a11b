//! Simulated BLE transport for testing

use std::{collections::HashSet, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    core::{
        error::{TransportError, TransportResult},
        types::{DeviceHandle, DeviceId},
    },
    protocol::{PAIRING_RX_CHAR_UUID, PAIRING_SERVICE_UUID, PAIRING_TX_CHAR_UUID},
    transport::{DiscoveryEvents, PairingTransport},
};

/// Where the mock injects a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    StartScan,
    StopScan,
    Connect,
    /// Service lookup returns an error
    ServiceLookup,
    /// Device does not expose the pairing service
    ServiceMissing,
    /// Characteristic lookup returns an error
    CharacteristicLookup,
    /// Service does not contain the RX characteristic
    CharacteristicMissing,
    /// Write of the chunk with this index fails
    Write(usize),
    Disconnect,
}

/// Transport call as recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    StartScan(Uuid),
    StopScan,
    Connect(DeviceId),
    Service(Uuid),
    Characteristic(Uuid),
    Write(usize),
    Disconnect(DeviceId),
}

/// Internal state for the mock transport
#[derive(Debug)]
struct MockState {
    adapter_ready: bool,
    advertisements: Vec<DeviceHandle>,
    subscriber: Option<mpsc::UnboundedSender<DeviceHandle>>,
    scanning: bool,
    failures: HashSet<FailurePoint>,
    stall_connect: bool,
    stall_service: bool,
    stall_characteristic: bool,
    stall_write_at: Option<usize>,
    calls: Vec<MockCall>,
    writes: Vec<Vec<u8>>,
    last_deadline: Option<Instant>,
}

/// Service handle handed out by the mock
#[derive(Debug, Clone)]
pub struct MockService {
    uuid: Uuid,
}

/// Characteristic handle handed out by the mock
#[derive(Debug, Clone)]
pub struct MockCharacteristic {
    uuid: Uuid,
}

/// Mock BLE transport for testing
///
/// Plays back scripted advertisements and exposes a pairing service with RX
/// and TX characteristics unless told otherwise. Faults and stalls can be
/// injected at every transport call.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock with a powered adapter and no advertisements
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                adapter_ready: true,
                advertisements: vec![],
                subscriber: None,
                scanning: false,
                failures: HashSet::new(),
                stall_connect: false,
                stall_service: false,
                stall_characteristic: false,
                stall_write_at: None,
                calls: vec![],
                writes: vec![],
                last_deadline: None,
            })),
        }
    }

    /// Advertisements played back when a scan starts
    pub async fn set_advertisements(&self, devices: Vec<DeviceHandle>) {
        self.inner.lock().await.advertisements = devices;
    }

    /// Deliver an advertisement to the current subscriber while scanning
    pub async fn advertise(&self, device: DeviceHandle) {
        let state = self.inner.lock().await;
        if state.scanning {
            if let Some(tx) = &state.subscriber {
                let _ = tx.send(device);
            }
        }
    }

    pub async fn set_adapter_ready(&self, ready: bool) {
        self.inner.lock().await.adapter_ready = ready;
    }

    pub async fn fail_at(&self, point: FailurePoint) {
        self.inner.lock().await.failures.insert(point);
    }

    /// Drop every injected failure
    pub async fn clear_failures(&self) {
        self.inner.lock().await.failures.clear();
    }

    /// Make connect never complete
    pub async fn stall_connect(&self) {
        self.inner.lock().await.stall_connect = true;
    }

    /// Make the service lookup never complete
    pub async fn stall_service(&self) {
        self.inner.lock().await.stall_service = true;
    }

    /// Make the characteristic lookup never complete
    pub async fn stall_characteristic(&self) {
        self.inner.lock().await.stall_characteristic = true;
    }

    /// Make the write of chunk `index` never complete
    pub async fn stall_write_at(&self, index: usize) {
        self.inner.lock().await.stall_write_at = Some(index);
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Chunks acknowledged so far, in write order
    pub async fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().await.writes.clone()
    }

    pub async fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Connect(_))).await
    }

    pub async fn disconnect_count(&self) -> usize {
        self.count(|c| matches!(c, MockCall::Disconnect(_))).await
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.lock().await.scanning
    }

    /// Whether a live discovery subscription exists
    pub async fn has_subscriber(&self) -> bool {
        self.inner
            .lock()
            .await
            .subscriber
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn last_deadline(&self) -> Option<Instant> {
        self.inner.lock().await.last_deadline
    }

    async fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.inner.lock().await.calls.iter().filter(|c| pred(c)).count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn fails(&self, point: FailurePoint) -> bool {
        self.failures.contains(&point)
    }
}

impl PairingTransport for MockTransport {
    type Service = MockService;
    type Characteristic = MockCharacteristic;

    async fn adapter_ready(&self) -> TransportResult<bool> {
        Ok(self.inner.lock().await.adapter_ready)
    }

    async fn subscribe_discoveries(&self) -> TransportResult<DiscoveryEvents> {
        let mut state = self.inner.lock().await;
        if state.subscriber.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriber = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self, service_filter: Uuid) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::StartScan(service_filter));
        if state.fails(FailurePoint::StartScan) {
            return Err(TransportError::Ble("Mock start scan failure".into()));
        }
        state.scanning = true;
        if let Some(tx) = &state.subscriber {
            for device in &state.advertisements {
                let _ = tx.send(device.clone());
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::StopScan);
        state.scanning = false;
        if state.fails(FailurePoint::StopScan) {
            return Err(TransportError::Ble("Mock stop scan failure".into()));
        }
        Ok(())
    }

    async fn connect(&self, device: &DeviceHandle, deadline: Instant) -> TransportResult<()> {
        let stall = {
            let mut state = self.inner.lock().await;
            state.calls.push(MockCall::Connect(device.id.clone()));
            state.last_deadline = Some(deadline);
            if state.fails(FailurePoint::Connect) {
                return Err(TransportError::Ble("Mock connect failure".into()));
            }
            state.stall_connect
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> TransportResult<()> {
        let mut state = self.inner.lock().await;
        state.calls.push(MockCall::Disconnect(device.id.clone()));
        if state.fails(FailurePoint::Disconnect) {
            return Err(TransportError::Ble("Mock disconnect failure".into()));
        }
        Ok(())
    }

    async fn service(
        &self,
        _device: &DeviceHandle,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Service>> {
        let stall = {
            let mut state = self.inner.lock().await;
            state.calls.push(MockCall::Service(uuid));
            if state.fails(FailurePoint::ServiceLookup) {
                return Err(TransportError::Ble("Mock service lookup failure".into()));
            }
            if state.fails(FailurePoint::ServiceMissing) || uuid != PAIRING_SERVICE_UUID {
                return Ok(None);
            }
            state.stall_service
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(Some(MockService { uuid }))
    }

    async fn characteristic(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Characteristic>> {
        let stall = {
            let mut state = self.inner.lock().await;
            state.calls.push(MockCall::Characteristic(uuid));
            if state.fails(FailurePoint::CharacteristicLookup) {
                return Err(TransportError::Ble(
                    "Mock characteristic lookup failure".into(),
                ));
            }
            let known = service.uuid == PAIRING_SERVICE_UUID
                && (uuid == PAIRING_RX_CHAR_UUID || uuid == PAIRING_TX_CHAR_UUID);
            if state.fails(FailurePoint::CharacteristicMissing) || !known {
                return Ok(None);
            }
            state.stall_characteristic
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(Some(MockCharacteristic { uuid }))
    }

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> TransportResult<()> {
        let stall = {
            let mut state = self.inner.lock().await;
            let index = state.writes.len();
            state.calls.push(MockCall::Write(index));
            if characteristic.uuid != PAIRING_RX_CHAR_UUID {
                return Err(TransportError::Ble("Characteristic not writable".into()));
            }
            if state.fails(FailurePoint::Write(index)) {
                return Err(TransportError::Ble(format!(
                    "Mock write failure at chunk {index}"
                )));
            }
            if state.stall_write_at == Some(index) {
                true
            } else {
                state.writes.push(data.to_vec());
                false
            }
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
