//! Runtime settings

use std::time::Duration;

use crate::{
    config::cli::{CliArgs, PairArgs},
    core::{error::ConfigError, transfer::TransferConfig},
    protocol::PairingPayload,
};

/// Longest pacing delay accepted; longer ones would eat the transfer budget
const MAX_CHUNK_DELAY: Duration = Duration::from_secs(5);

const MAX_SCAN_SECONDS: u64 = 3600;
const MAX_WATCH_SECONDS: u64 = 86400;
const MAX_TIMEOUT_SECONDS: u64 = 3600;

fn bounded_seconds(field: &'static str, seconds: u64, max: u64) -> Result<Duration, ConfigError> {
    if seconds > max {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("must not exceed {max} s"),
        });
    }
    Ok(Duration::from_secs(seconds))
}

/// Bounded scan window from `--scan-seconds`
pub fn scan_window(seconds: u64) -> Result<Duration, ConfigError> {
    bounded_seconds("scan-seconds", seconds, MAX_SCAN_SECONDS)
}

/// Optional auto-stop for `watch` from `--duration-seconds`
pub fn watch_duration(seconds: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    seconds
        .map(|s| bounded_seconds("duration-seconds", s, MAX_WATCH_SECONDS))
        .transpose()
}

/// Runtime configuration settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub adapter: Option<String>,
    pub transfer: TransferConfig,
}

impl TryFrom<&CliArgs> for Settings {
    type Error = ConfigError;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        let chunk_pacing = Duration::from_millis(args.chunk_delay_ms);
        if chunk_pacing > MAX_CHUNK_DELAY {
            return Err(ConfigError::InvalidValue {
                field: "chunk-delay-ms",
                reason: format!("must not exceed {} ms", MAX_CHUNK_DELAY.as_millis()),
            });
        }

        Ok(Settings {
            adapter: args.adapter.clone(),
            transfer: TransferConfig {
                max_chunk_size: args.chunk_size,
                chunk_pacing,
            },
        })
    }
}

/// Settings for a single pairing run
#[derive(Debug, Clone)]
pub struct PairSettings {
    pub device: Option<String>,
    pub scan_window: Duration,
    pub timeout: Duration,
    pub payload: PairingPayload,
}

impl TryFrom<&PairArgs> for PairSettings {
    type Error = ConfigError;

    fn try_from(args: &PairArgs) -> Result<Self, Self::Error> {
        if args.ssid.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ssid",
                reason: "must not be empty".into(),
            });
        }
        if args.broker.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "broker",
                reason: "must not be empty".into(),
            });
        }
        if args.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timeout-seconds",
                reason: "must be positive".into(),
            });
        }
        let timeout = bounded_seconds(
            "timeout-seconds",
            args.timeout_seconds,
            MAX_TIMEOUT_SECONDS,
        )?;

        Ok(PairSettings {
            device: args.device.clone(),
            scan_window: scan_window(args.scan_seconds)?,
            timeout,
            payload: PairingPayload::new(
                args.ssid.clone(),
                args.password.clone(),
                args.broker.clone(),
                args.port,
                args.topic.clone(),
            ),
        })
    }
}
