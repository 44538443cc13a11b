//! BLE GATT UUIDs of the pairing service exposed by the device firmware
//!
//! The firmware implements a Nordic UART style service: the central writes
//! the credential payload to the RX characteristic. TX is reserved for
//! device-to-central traffic and is not used by the transfer path.

use uuid::Uuid;

/// Pairing service UUID, also the advertisement filter used during discovery
pub const PAIRING_SERVICE_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x01, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Inbound characteristic (central -> device), receives the payload chunks
pub const PAIRING_RX_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x02, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);

/// Outbound characteristic (device -> central)
pub const PAIRING_TX_CHAR_UUID: Uuid = Uuid::from_bytes([
    0x6e, 0x40, 0x00, 0x03, 0xb5, 0xa3, 0xf3, 0x93, 0xe0, 0xa9, 0xe5, 0x0e, 0x24, 0xdc, 0xca, 0x9e,
]);
