//! BlueZ central transport

use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DiscoveryFilter, DiscoveryTransport,
    gatt::{
        WriteOp,
        remote::{Characteristic, CharacteristicWriteRequest, Service},
    },
};
use futures::StreamExt;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    core::{
        error::{TransportError, TransportResult},
        types::DeviceHandle,
    },
    transport::{DiscoveryEvents, PairingTransport},
};

const SERVICE_RESOLVE_INTERVAL: Duration = Duration::from_millis(100);
const SERVICE_RESOLVE_ATTEMPTS: usize = 50;

type Subscriber = Arc<Mutex<Option<mpsc::UnboundedSender<DeviceHandle>>>>;

impl From<bluer::Error> for TransportError {
    fn from(e: bluer::Error) -> Self {
        TransportError::Ble(e.to_string())
    }
}

/// BLE central transport backed by BlueZ
pub struct BluerTransport {
    adapter: Adapter,
    subscriber: Subscriber,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BluerTransport {
    /// Open the named adapter, or the default one, and power it on
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, bluer::Error> {
        let session = bluer::Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        info!("Using BLE adapter: {}", adapter.name());
        adapter.set_powered(true).await?;

        Ok(Self {
            adapter,
            subscriber: Arc::new(Mutex::new(None)),
            scan: Mutex::new(None),
        })
    }

    /// Log adapter power changes until the event stream ends
    pub async fn watch_adapter_state(&self) -> Result<(), bluer::Error> {
        let mut events = self.adapter.events().await?;

        while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                info!(
                    "Bluetooth adapter {} powered {}",
                    self.adapter.name(),
                    if powered { "on" } else { "off" }
                );
            }
        }

        warn!("BLE adapter event stream ended");
        Ok(())
    }

    fn device(&self, handle: &DeviceHandle) -> TransportResult<Device> {
        let address: Address = handle
            .id
            .as_str()
            .parse()
            .map_err(|_| TransportError::UnknownDevice(handle.id.to_string()))?;
        Ok(self.adapter.device(address)?)
    }
}

/// Run a BlueZ discovery session, forwarding matching devices to the subscriber
///
/// Discovery stops when this task is aborted and the event stream dropped.
async fn forward_discoveries(
    adapter: Adapter,
    service_filter: Uuid,
    subscriber: Subscriber,
    ready: oneshot::Sender<TransportResult<()>>,
) {
    let events = match adapter.discover_devices().await {
        Ok(events) => {
            let _ = ready.send(Ok(()));
            events
        }
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let mut events = std::pin::pin!(events);

    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };

        match inspect_device(&adapter, address, service_filter).await {
            Ok(Some(device)) => {
                if let Some(tx) = subscriber.lock().await.as_ref() {
                    let _ = tx.send(device);
                }
            }
            Ok(None) => trace!("Ignoring {}: pairing service not advertised", address),
            Err(e) => debug!("Failed to inspect {}: {}", address, e),
        }
    }

    warn!("BlueZ discovery stream ended");
}

/// Build a handle for `address` if it advertises `service_filter`
async fn inspect_device(
    adapter: &Adapter,
    address: Address,
    service_filter: Uuid,
) -> Result<Option<DeviceHandle>, bluer::Error> {
    let device = adapter.device(address)?;

    // BlueZ also reports cached devices that may not match the filter
    let advertised = device.uuids().await?.unwrap_or_default();
    if !advertised.contains(&service_filter) {
        return Ok(None);
    }

    let mut handle = DeviceHandle::new(address.to_string());
    handle.name = device.name().await?;
    handle.rssi = device.rssi().await?;
    Ok(Some(handle))
}

impl PairingTransport for BluerTransport {
    type Service = Service;
    type Characteristic = Characteristic;

    async fn adapter_ready(&self) -> TransportResult<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    async fn subscribe_discoveries(&self) -> TransportResult<DiscoveryEvents> {
        let mut subscriber = self.subscriber.lock().await;
        if subscriber.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *subscriber = Some(tx);
        Ok(rx)
    }

    async fn start_scan(&self, service_filter: Uuid) -> TransportResult<()> {
        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            debug!("BlueZ discovery already running");
            return Ok(());
        }

        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: HashSet::from([service_filter]),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            })
            .await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(forward_discoveries(
            self.adapter.clone(),
            service_filter,
            self.subscriber.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                *scan = Some(task);
                debug!("BlueZ discovery started");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Ble(
                "Discovery task ended before starting".into(),
            )),
        }
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(task) = self.scan.lock().await.take() {
            task.abort();
            debug!("BlueZ discovery stopped");
        }
        Ok(())
    }

    async fn connect(&self, handle: &DeviceHandle, deadline: Instant) -> TransportResult<()> {
        let device = self.device(handle)?;
        if device.is_connected().await? {
            debug!("{} already connected", handle.id);
            return Ok(());
        }

        tokio::time::timeout_at(deadline, device.connect())
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!("Connected to {}", handle.id);
        Ok(())
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> TransportResult<()> {
        self.device(handle)?.disconnect().await?;
        Ok(())
    }

    async fn service(
        &self,
        handle: &DeviceHandle,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Service>> {
        let device = self.device(handle)?;

        for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
            if device.is_services_resolved().await? {
                break;
            }
            tokio::time::sleep(SERVICE_RESOLVE_INTERVAL).await;
        }

        for service in device.services().await? {
            if service.uuid().await? == uuid {
                return Ok(Some(service));
            }
        }
        Ok(None)
    }

    async fn characteristic(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> TransportResult<Option<Self::Characteristic>> {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(Some(characteristic));
            }
        }
        Ok(None)
    }

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
    ) -> TransportResult<()> {
        // Write request: resolves only after the peripheral acknowledged it
        let request = CharacteristicWriteRequest {
            op_type: WriteOp::Request,
            ..Default::default()
        };
        characteristic.write_ext(data, &request).await?;
        Ok(())
    }
}
