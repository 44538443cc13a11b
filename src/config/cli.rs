//! Command-line argument parsing

use clap::{Args, Parser, Subcommand};
use std::num::NonZeroUsize;

use crate::protocol::{DEFAULT_MQTT_PORT, DEFAULT_MQTT_TOPIC};

#[derive(Parser, Debug, Clone)]
#[clap(name = "ble-wifi-provisioner", version, author)]
#[clap(about = "Provision IoT boards with WiFi and MQTT credentials over BLE")]
pub struct CliArgs {
    /// Bluetooth adapter to use (e.g. hci0), defaults to the system default
    #[clap(short, long, global = true)]
    pub adapter: Option<String>,

    /// Largest chunk written to the RX characteristic in bytes
    #[clap(long, default_value = "20", global = true)]
    pub chunk_size: NonZeroUsize,

    /// Delay between chunk writes in milliseconds
    #[clap(long, default_value = "150", global = true)]
    pub chunk_delay_ms: u64,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan for a fixed time and list pairing-capable devices
    Discover {
        /// Scan duration in seconds
        #[clap(long, default_value = "50")]
        scan_seconds: u64,

        /// Print devices as JSON
        #[clap(long)]
        json: bool,
    },

    /// Print devices as they appear until interrupted
    Watch {
        /// Stop automatically after this many seconds
        #[clap(long)]
        duration_seconds: Option<u64>,
    },

    /// Send WiFi and MQTT credentials to a device
    Pair(PairArgs),
}

#[derive(Args, Clone)]
pub struct PairArgs {
    /// Bluetooth address of the target; may be omitted if exactly one device is found
    #[clap(short, long)]
    pub device: Option<String>,

    /// How long to scan for the target in seconds
    #[clap(long, default_value = "10")]
    pub scan_seconds: u64,

    /// Budget for the whole transfer in seconds
    #[clap(long, default_value = "180")]
    pub timeout_seconds: u64,

    /// WiFi network name
    #[clap(long)]
    pub ssid: String,

    /// WiFi password
    #[clap(long, env = "WIFI_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// MQTT broker host or address
    #[clap(long)]
    pub broker: String,

    /// MQTT broker port
    #[clap(long, default_value_t = DEFAULT_MQTT_PORT)]
    pub port: u16,

    /// MQTT topic the device publishes to
    #[clap(long, default_value = DEFAULT_MQTT_TOPIC)]
    pub topic: String,
}

// Keeps the WiFi password out of the startup log line
impl std::fmt::Debug for PairArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairArgs")
            .field("device", &self.device)
            .field("scan_seconds", &self.scan_seconds)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("ssid", &self.ssid)
            .field("broker", &self.broker)
            .field("port", &self.port)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
