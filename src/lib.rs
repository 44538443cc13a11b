//! BLE WiFi Provisioner
//!
//! Provisions headless IoT boards with WiFi and MQTT credentials over a BLE
//! pairing service:
//! - Discovery of devices advertising the pairing service
//! - Chunked, paced transfer of the JSON credential payload
//! - Guaranteed disconnect after every transaction

pub mod config;
pub mod core;
pub mod protocol;
pub mod transport;

pub use core::{
    error::{DiscoveryError, TransferFailure, TransportError},
    service::ProvisioningService,
    transfer::{TransferConfig, TransferOutcome},
    types::{DeviceHandle, DeviceId, TransferReport, TransferState},
};
pub use protocol::PairingPayload;
