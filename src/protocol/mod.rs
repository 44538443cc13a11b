//! Wire-level definitions shared with the device firmware

pub mod payload;
pub mod uuids;

pub use {
    payload::{DEFAULT_MQTT_PORT, DEFAULT_MQTT_TOPIC, PairingPayload},
    uuids::*,
};
