//! Main provisioning service facade

use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;

use crate::{
    core::{
        cancel::CancelToken,
        discovery::{DiscoveryCoordinator, DiscoveryStream},
        error::DiscoveryResult,
        transfer::{PairingEngine, TransferConfig, TransferOutcome},
        types::DeviceHandle,
    },
    protocol::{PAIRING_SERVICE_UUID, PairingPayload},
    transport::PairingTransport,
};

/// Main provisioning service facade
///
/// Discovery and transfers share one transport. Credential transfers are
/// serialized, since the radio cannot safely run two at once.
pub struct ProvisioningService<T: PairingTransport> {
    pub discovery: Arc<DiscoveryCoordinator<T>>,
    engine: Mutex<PairingEngine<T>>,
}

impl<T: PairingTransport> ProvisioningService<T> {
    /// Create a new provisioning service
    pub fn new(transport: Arc<T>, config: TransferConfig) -> Self {
        let discovery = Arc::new(DiscoveryCoordinator::new(transport.clone()));
        let engine = Mutex::new(PairingEngine::new(transport, config));

        Self { discovery, engine }
    }

    /// Scan for pairing-capable devices for `window`
    pub async fn discover(&self, window: Duration) -> DiscoveryResult<Vec<DeviceHandle>> {
        self.discovery.discover(PAIRING_SERVICE_UUID, window).await
    }

    /// Scan for pairing-capable devices until `stop_discovery` is called
    pub async fn start_discovery(&self) -> DiscoveryResult<DiscoveryStream> {
        self.discovery.start_discovery(PAIRING_SERVICE_UUID).await
    }

    /// Stop a running scan
    pub async fn stop_discovery(&self) -> Vec<DeviceHandle> {
        self.discovery.stop().await
    }

    /// Whether a scan is running
    pub fn is_scanning(&self) -> bool {
        self.discovery.is_scanning()
    }

    /// Send credentials to `device`
    pub async fn send_credentials(
        &self,
        device: &DeviceHandle,
        payload: &PairingPayload,
        timeout: Duration,
    ) -> TransferOutcome {
        self.engine
            .lock()
            .await
            .transfer(device, payload, timeout)
            .await
    }

    /// Send credentials to `device`, aborting when `cancel` fires
    pub async fn send_credentials_with_cancel(
        &self,
        device: &DeviceHandle,
        payload: &PairingPayload,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> TransferOutcome {
        self.engine
            .lock()
            .await
            .transfer_with_cancel(device, payload, timeout, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{error::TransferFailure, transfer::DEFAULT_TRANSFER_TIMEOUT},
        transport::mock_transport::{FailurePoint, MockCall, MockTransport},
    };
    use futures::StreamExt;

    fn payload() -> PairingPayload {
        PairingPayload::new("Home", "secret123", "10.0.0.5", 1883, "devices/ble/detections")
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_then_pair() {
        let transport = Arc::new(MockTransport::new());
        transport
            .set_advertisements(vec![
                DeviceHandle::new("AA:BB:CC:DD:EE:01").with_name("pico-1"),
                DeviceHandle::new("AA:BB:CC:DD:EE:01").with_name("pico-1"),
            ])
            .await;
        let service = ProvisioningService::new(transport.clone(), TransferConfig::default());

        let devices = service.discover(Duration::from_secs(5)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!service.is_scanning());

        let report = service
            .send_credentials(&devices[0], &payload(), DEFAULT_TRANSFER_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(report.chunks_written, 7);
        assert_eq!(transport.writes().await.concat(), payload().to_json_bytes().unwrap());
        assert_eq!(
            transport.calls().await.first(),
            Some(&MockCall::StartScan(PAIRING_SERVICE_UUID))
        );
    }

    #[tokio::test]
    async fn test_streaming_discovery_through_service() {
        let transport = Arc::new(MockTransport::new());
        let service = ProvisioningService::new(transport.clone(), TransferConfig::default());

        let mut stream = service.start_discovery().await.unwrap();
        transport.advertise(DeviceHandle::new("A")).await;
        assert_eq!(stream.next().await.unwrap().id.as_str(), "A");
        assert!(service.is_scanning());

        let devices = service.stop_discovery().await;
        assert_eq!(devices.len(), 1);
        assert!(!service.is_scanning());
        assert!(service.stop_discovery().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_transfers_are_serialized() {
        let transport = Arc::new(MockTransport::new());
        let service = Arc::new(ProvisioningService::new(
            transport.clone(),
            TransferConfig::default(),
        ));

        let tasks: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|id| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .send_credentials(&DeviceHandle::new(id), &payload(), DEFAULT_TRANSFER_TIMEOUT)
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        // Each transaction ran to its disconnect before the next connected
        let calls = transport.calls().await;
        let connects: Vec<_> = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, MockCall::Connect(_)))
            .map(|(i, _)| i)
            .collect();
        let first_disconnect = calls
            .iter()
            .position(|c| matches!(c, MockCall::Disconnect(_)))
            .unwrap();
        assert_eq!(connects.len(), 2);
        assert!(first_disconnect < connects[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reported_as_reason() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_at(FailurePoint::ServiceMissing).await;
        let service = ProvisioningService::new(transport.clone(), TransferConfig::default());

        let outcome = service
            .send_credentials(&DeviceHandle::new("A"), &payload(), DEFAULT_TRANSFER_TIMEOUT)
            .await;
        assert_eq!(outcome, Err(TransferFailure::ServiceNotFound));
        assert_eq!(transport.disconnect_count().await, 1);
    }
}
