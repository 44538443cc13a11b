//! Credential payload written to the pairing RX characteristic

use serde::{Deserialize, Serialize};

/// MQTT port pre-filled when the caller does not provide one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// MQTT topic pre-filled when the caller does not provide one
pub const DEFAULT_MQTT_TOPIC: &str = "devices/ble/detections";

/// WiFi and MQTT credentials for one device
///
/// Serialized as a flat UTF-8 JSON object. The firmware parses exactly these
/// five field names, so none of them is ever renamed or skipped.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingPayload {
    wifi_ssid: String,
    wifi_password: String,
    mqtt_broker: String,
    mqtt_port: u16,
    mqtt_topic: String,
}

impl PairingPayload {
    pub fn new(
        wifi_ssid: impl Into<String>,
        wifi_password: impl Into<String>,
        mqtt_broker: impl Into<String>,
        mqtt_port: u16,
        mqtt_topic: impl Into<String>,
    ) -> Self {
        Self {
            wifi_ssid: wifi_ssid.into(),
            wifi_password: wifi_password.into(),
            mqtt_broker: mqtt_broker.into(),
            mqtt_port,
            mqtt_topic: mqtt_topic.into(),
        }
    }

    pub fn wifi_ssid(&self) -> &str {
        &self.wifi_ssid
    }

    pub fn wifi_password(&self) -> &str {
        &self.wifi_password
    }

    pub fn mqtt_broker(&self) -> &str {
        &self.mqtt_broker
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    /// Serialize to the wire representation
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// Keeps the WiFi password out of logs
impl std::fmt::Debug for PairingPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingPayload")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &"<redacted>")
            .field("mqtt_broker", &self.mqtt_broker)
            .field("mqtt_port", &self.mqtt_port)
            .field("mqtt_topic", &self.mqtt_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn sample() -> PairingPayload {
        PairingPayload::new(
            "Home",
            "secret123",
            "10.0.0.5",
            DEFAULT_MQTT_PORT,
            DEFAULT_MQTT_TOPIC,
        )
    }

    #[test]
    fn test_payload_wire_format() {
        let json = String::from_utf8(sample().to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"wifi_ssid":"Home","wifi_password":"secret123","mqtt_broker":"10.0.0.5","mqtt_port":1883,"mqtt_topic":"devices/ble/detections"}"#
        );
        assert_eq!(json.len(), 128);
    }

    #[test]
    fn test_payload_keeps_empty_fields() {
        let payload = PairingPayload::new("", "", "", 0, "");
        let value: Value = serde_json::from_slice(&payload.to_json_bytes().unwrap()).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object.len(), 5);
        for field in [
            "wifi_ssid",
            "wifi_password",
            "mqtt_broker",
            "mqtt_port",
            "mqtt_topic",
        ] {
            assert!(object.contains_key(field), "missing field {field}");
        }
        assert!(object["mqtt_port"].is_u64());
    }

    #[test]
    fn test_payload_utf8_and_escaping() {
        let payload = PairingPayload::new("Café \"5G\"", "pässwörd", "broker.local", 8883, "a/b");
        let bytes = payload.to_json_bytes().unwrap();

        let decoded: PairingPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.wifi_ssid(), "Café \"5G\"");
        assert_eq!(decoded.mqtt_port(), 8883);
    }

    #[test]
    fn test_payload_debug_redacts_password() {
        let debug = format!("{:?}", sample());
        assert!(!debug.contains("secret123"));
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("Home"));
    }
}
