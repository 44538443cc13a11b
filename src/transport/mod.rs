//! Transport adapters consumed by the core

pub mod ble;
pub mod mock_transport;
pub mod pairing_transport;

pub use pairing_transport::{DiscoveryEvents, PairingTransport};

#[cfg(test)]
pub use mock_transport::MockTransport;
