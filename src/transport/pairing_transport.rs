//! Transport adapter trait definition

use tokio::{sync::mpsc, time::Instant};
use trait_variant::make;
use uuid::Uuid;

use crate::core::{error::TransportResult, types::DeviceHandle};

/// Receiving side of a discovery subscription
///
/// Dropping it unsubscribes.
pub type DiscoveryEvents = mpsc::UnboundedReceiver<DeviceHandle>;

/// Abstraction over the platform BLE central stack
///
/// The core only talks to the radio through this trait, which lets tests
/// drive discovery and transfers against a simulated transport. Every call
/// may fail independently.
#[make(Send)]
pub trait PairingTransport: Send + Sync + 'static {
    /// Resolved GATT service on a connected device
    type Service: Send + Sync;

    /// Resolved GATT characteristic within a service
    type Characteristic: Send + Sync;

    /// Whether the radio is present and powered
    async fn adapter_ready(&self) -> TransportResult<bool>;

    /// Subscribe to discovered devices
    ///
    /// Only one subscriber may exist at a time. Fails with
    /// `TransportError::AlreadySubscribed` while a previous receiver is alive.
    async fn subscribe_discoveries(&self) -> TransportResult<DiscoveryEvents>;

    /// Start scanning for devices advertising `service_filter`
    async fn start_scan(&self, service_filter: Uuid) -> TransportResult<()>;

    /// Stop scanning; succeeds when no scan is running
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Open a connection, giving up at `deadline`
    async fn connect(&self, device: &DeviceHandle, deadline: Instant) -> TransportResult<()>;

    /// Close the connection to `device`
    async fn disconnect(&self, device: &DeviceHandle) -> TransportResult<()>;

    /// Look up a primary service on a connected device
    ///
    /// Returns `Ok(None)` when the device does not expose it.
    async fn service(
        &self,
        device: &DeviceHandle,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Service>>;

    /// Look up a characteristic of a resolved service
    async fn characteristic(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Characteristic>>;

    /// Write one value and wait for the peer's acknowledgement
    ///
    /// `data` must already fit into the link's transfer unit.
    async fn write(&self, characteristic: &Self::Characteristic, data: &[u8])
    -> TransportResult<()>;
}
