//! Error types for BLE credential provisioning

use serde::Serialize;
use thiserror::Error;

/// Result type for transport adapter operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors raised by a transport adapter
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("BLE error: {0}")]
    Ble(String),

    #[error("Discovery events already have a subscriber")]
    AlreadySubscribed,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Errors related to device discovery
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Scan already in progress")]
    ScanInProgress,

    #[error("Bluetooth adapter unavailable or powered off")]
    AdapterUnavailable,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Reason a pairing transaction failed
///
/// Every fault between connecting and transmitting is converted into one of
/// these tags; the caller never sees the underlying transport error.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferFailure {
    #[error("connect-failed")]
    ConnectFailed,

    #[error("service-not-found")]
    ServiceNotFound,

    #[error("characteristic-not-found")]
    CharacteristicNotFound,

    #[error("write-failed")]
    WriteFailed,

    #[error("cancelled")]
    Cancelled,
}

/// Errors in user-supplied configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
