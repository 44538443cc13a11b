//! Pairing transfer engine
//!
//! Runs one provisioning transaction against a selected device:
//!
//! ```text
//! Idle -> Connecting -> ServiceResolving -> CharacteristicResolving
//!      -> Transmitting -> Disconnecting -> Succeeded | Failed(reason)
//! ```
//!
//! Any failure jumps straight to `Disconnecting`. The disconnect is attempted
//! exactly once per transaction, whatever the outcome, and its own failure
//! never changes the outcome.

use std::{future::Future, num::NonZeroUsize, sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::watch, time::Instant};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::{
    core::{
        cancel::CancelToken,
        chunking::{self, DEFAULT_MAX_CHUNK_SIZE},
        error::TransferFailure,
        types::{DeviceHandle, TransactionId, TransferReport, TransferState},
    },
    protocol::{PAIRING_RX_CHAR_UUID, PAIRING_SERVICE_UUID, PairingPayload},
    transport::PairingTransport,
};

/// Delay between consecutive chunk writes
pub const DEFAULT_CHUNK_PACING: Duration = Duration::from_millis(150);

/// Budget for a whole transaction, matching the device's pairing-mode window
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(180);

/// Upper bound for the cleanup disconnect, which runs outside the budget
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in for "no deadline" when a budget does not fit into an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Result of a pairing transaction
pub type TransferOutcome = Result<TransferReport, TransferFailure>;

/// Framing parameters for the credential transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Largest value written in one go
    pub max_chunk_size: NonZeroUsize,
    /// Pause between two writes, for peripherals without flow control
    pub chunk_pacing: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            chunk_pacing: DEFAULT_CHUNK_PACING,
        }
    }
}

/// Deadline `budget` from now, saturating instead of overflowing
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Holds the connection for the duration of one transaction
///
/// `release` disconnects. If the guard is dropped unreleased (the
/// transaction future was dropped or panicked) the disconnect is spawned
/// onto the current runtime instead.
struct ConnectionGuard<T: PairingTransport> {
    transport: Arc<T>,
    device: DeviceHandle,
    released: bool,
}

impl<T: PairingTransport> ConnectionGuard<T> {
    fn new(transport: Arc<T>, device: DeviceHandle) -> Self {
        Self {
            transport,
            device,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        disconnect_quietly(self.transport.as_ref(), &self.device).await;
    }
}

impl<T: PairingTransport> Drop for ConnectionGuard<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            "Transaction aborted, releasing connection to {} in background",
            self.device.id
        );
        match Handle::try_current() {
            Ok(handle) => {
                let transport = self.transport.clone();
                let device = self.device.clone();
                handle.spawn(async move {
                    disconnect_quietly(transport.as_ref(), &device).await;
                });
            }
            Err(_) => error!(
                "No runtime available, connection to {} not released",
                self.device.id
            ),
        }
    }
}

/// Disconnect, logging instead of propagating any failure
async fn disconnect_quietly<T: PairingTransport>(transport: &T, device: &DeviceHandle) {
    match tokio::time::timeout(DISCONNECT_TIMEOUT, transport.disconnect(device)).await {
        Ok(Ok(())) => debug!("Disconnected from {}", device.id),
        Ok(Err(e)) => warn!("disconnect-failed: {}: {}", device.id, e),
        Err(_) => warn!("disconnect-failed: {}: timed out", device.id),
    }
}

/// Pairing transfer engine
///
/// One transaction at a time: `transfer` takes `&mut self`.
pub struct PairingEngine<T: PairingTransport> {
    transport: Arc<T>,
    config: TransferConfig,
    state: watch::Sender<TransferState>,
}

impl<T: PairingTransport> PairingEngine<T> {
    pub fn new(transport: Arc<T>, config: TransferConfig) -> Self {
        let (state, _) = watch::channel(TransferState::Idle);
        Self {
            transport,
            config,
            state,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// State of the current or last transaction
    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn states(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Provision `device` with `payload`, giving up after `timeout`
    pub async fn transfer(
        &mut self,
        device: &DeviceHandle,
        payload: &PairingPayload,
        timeout: Duration,
    ) -> TransferOutcome {
        self.transfer_with_cancel(device, payload, timeout, &CancelToken::never())
            .await
    }

    /// Like `transfer`, additionally aborting when `cancel` fires
    pub async fn transfer_with_cancel(
        &mut self,
        device: &DeviceHandle,
        payload: &PairingPayload,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> TransferOutcome {
        let transaction = TransactionId::new();
        let span = info_span!("pairing", %transaction, device = %device.id);

        self.run(transaction, device, payload, timeout, cancel)
            .instrument(span)
            .await
    }

    async fn run(
        &mut self,
        transaction: TransactionId,
        device: &DeviceHandle,
        payload: &PairingPayload,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> TransferOutcome {
        let deadline = deadline_after(timeout);
        self.state.send_replace(TransferState::Idle);
        info!("Sending credentials to {}", device.display_name());

        let guard = ConnectionGuard::new(self.transport.clone(), device.clone());
        let result = self.provision(device, payload, deadline, cancel).await;

        self.advance(TransferState::Disconnecting);
        guard.release().await;

        match result {
            Ok((chunks_written, bytes_written)) => {
                self.advance(TransferState::Succeeded);
                info!(
                    "Credentials delivered in {} chunk(s), {} bytes",
                    chunks_written, bytes_written
                );
                Ok(TransferReport {
                    transaction,
                    chunks_written,
                    bytes_written,
                })
            }
            Err(failure) => {
                self.advance(TransferState::Failed(failure));
                error!("Pairing failed: {}", failure);
                Err(failure)
            }
        }
    }

    /// Connect, resolve and transmit; returns chunk and byte counts
    async fn provision(
        &self,
        device: &DeviceHandle,
        payload: &PairingPayload,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<(usize, usize), TransferFailure> {
        self.advance(TransferState::Connecting);
        self.guarded(deadline, cancel, self.transport.connect(device, deadline))
            .await?
            .map_err(|e| {
                warn!("Connect failed: {}", e);
                TransferFailure::ConnectFailed
            })?;

        self.advance(TransferState::ServiceResolving);
        let service = match self
            .guarded(
                deadline,
                cancel,
                self.transport.service(device, PAIRING_SERVICE_UUID),
            )
            .await?
        {
            Ok(Some(service)) => service,
            Ok(None) => {
                warn!("Device does not expose pairing service {}", PAIRING_SERVICE_UUID);
                return Err(TransferFailure::ServiceNotFound);
            }
            Err(e) => {
                warn!("Pairing service lookup failed: {}", e);
                return Err(TransferFailure::ServiceNotFound);
            }
        };

        self.advance(TransferState::CharacteristicResolving);
        let rx = match self
            .guarded(
                deadline,
                cancel,
                self.transport.characteristic(&service, PAIRING_RX_CHAR_UUID),
            )
            .await?
        {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                warn!("Pairing service lacks RX characteristic {}", PAIRING_RX_CHAR_UUID);
                return Err(TransferFailure::CharacteristicNotFound);
            }
            Err(e) => {
                warn!("RX characteristic lookup failed: {}", e);
                return Err(TransferFailure::CharacteristicNotFound);
            }
        };

        self.advance(TransferState::Transmitting);
        let bytes = payload.to_json_bytes().map_err(|e| {
            error!("Failed to serialize payload: {}", e);
            TransferFailure::WriteFailed
        })?;
        let max_chunk_size = self.config.max_chunk_size;
        let total = chunking::chunk_count(bytes.len(), max_chunk_size);
        debug!(
            "Transmitting {} bytes in {} chunk(s) of at most {}",
            bytes.len(),
            total,
            max_chunk_size
        );

        for (index, chunk) in chunking::chunks(&bytes, max_chunk_size).enumerate() {
            if index > 0 {
                self.guarded(
                    deadline,
                    cancel,
                    tokio::time::sleep(self.config.chunk_pacing),
                )
                .await?;
            }

            self.guarded(deadline, cancel, self.transport.write(&rx, chunk))
                .await?
                .map_err(|e| {
                    warn!("Write of chunk {}/{} failed: {}", index + 1, total, e);
                    TransferFailure::WriteFailed
                })?;
            trace!("Chunk {}/{} written ({} bytes)", index + 1, total, chunk.len());
        }

        Ok((total, bytes.len()))
    }

    /// Await `fut` unless the caller cancels or the deadline passes first
    async fn guarded<F: Future>(
        &self,
        deadline: Instant,
        cancel: &CancelToken,
        fut: F,
    ) -> Result<F::Output, TransferFailure> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelled by caller during {:?}", self.state());
                Err(TransferFailure::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Transaction timed out during {:?}", self.state());
                Err(TransferFailure::Cancelled)
            }
            output = fut => Ok(output),
        }
    }

    fn advance(&self, next: TransferState) {
        let current = self.state();
        debug_assert!(
            current.can_advance_to(next),
            "invalid transition {current:?} -> {next:?}"
        );
        debug!("{:?} -> {:?}", current, next);
        self.state.send_replace(next);
    }
}
