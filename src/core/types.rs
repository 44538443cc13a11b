//! Domain types for BLE credential provisioning

use serde::Serialize;

use crate::core::error::TransferFailure;

/// Stable identifier of a discovered peer (the Bluetooth address on BlueZ)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device advertising the pairing service
///
/// Opaque to the core: only the transport that produced it knows how to
/// connect to it. Equality and hashing follow the identifier alone.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceHandle {
    /// Stable identifier used for de-duplication
    pub id: DeviceId,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Signal strength in dBm at discovery time
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: None,
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Advertised name, or the identifier when the device sent none
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

impl PartialEq for DeviceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceHandle {}

impl std::hash::Hash for DeviceHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Pairing transaction state machine states
///
/// Transitions only move forward; `Succeeded` and `Failed` are the two
/// terminal forms of "done".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Connecting,
    ServiceResolving,
    CharacteristicResolving,
    Transmitting,
    Disconnecting,
    Succeeded,
    Failed(TransferFailure),
}

impl TransferState {
    fn rank(&self) -> u8 {
        match self {
            TransferState::Idle => 0,
            TransferState::Connecting => 1,
            TransferState::ServiceResolving => 2,
            TransferState::CharacteristicResolving => 3,
            TransferState::Transmitting => 4,
            TransferState::Disconnecting => 5,
            TransferState::Succeeded | TransferState::Failed(_) => 6,
        }
    }

    /// Whether `next` is reachable from this state without going back
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed(_))
    }
}

/// Identifier attached to one pairing transaction for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Summary of a successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transaction: TransactionId,
    pub chunks_written: usize,
    pub bytes_written: usize,
}
