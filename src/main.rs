//! BLE WiFi Provisioner - Main Entry Point

use std::{sync::Arc, time::Duration};

use ble_wifi_provisioner::{
    DeviceHandle, ProvisioningService,
    config::{CliArgs, Command, PairArgs, PairSettings, Settings, scan_window, watch_duration},
    core::cancel::cancel_pair,
    transport::ble::BluerTransport,
};
use clap::Parser;
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Service = ProvisioningService<BluerTransport>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ble_wifi_provisioner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();
    info!(?args, "Starting BLE WiFi provisioner");

    let settings = Settings::try_from(&args)?;

    let transport = Arc::new(BluerTransport::new(settings.adapter.as_deref()).await?);
    let watcher = transport.clone();
    tokio::spawn(async move {
        if let Err(e) = watcher.watch_adapter_state().await {
            error!("BLE adapter error: {}", e);
        }
    });

    let service = ProvisioningService::new(transport, settings.transfer);

    match args.command {
        Command::Discover { scan_seconds, json } => {
            discover(&service, scan_window(scan_seconds)?, json).await
        }
        Command::Watch { duration_seconds } => {
            watch(&service, watch_duration(duration_seconds)?).await
        }
        Command::Pair(pair) => pair_device(&service, &pair).await,
    }
}

async fn discover(
    service: &Service,
    window: Duration,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Scanning for {}s", window.as_secs());
    let devices = service.discover(window).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No pairing-capable devices found");
    } else {
        for device in &devices {
            print_device(device);
        }
    }
    Ok(())
}

async fn watch(
    service: &Service,
    duration: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = service.start_discovery().await?;
    info!("Watching for devices, press Ctrl+C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            device = stream.next() => match device {
                Some(device) => print_device(&device),
                None => {
                    warn!("Discovery stream ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), stopping scan");
                break;
            }
            _ = shutdown_signal() => {
                info!("Received SIGTERM, stopping scan");
                break;
            }
            _ = &mut deadline => {
                info!("Watch duration elapsed");
                break;
            }
        }
    }

    let devices = service.stop_discovery().await;
    info!("Scan stopped, {} device(s) seen", devices.len());
    Ok(())
}

async fn pair_device(service: &Service, args: &PairArgs) -> Result<(), Box<dyn std::error::Error>> {
    let pair = PairSettings::try_from(args)?;

    info!("Scanning for {}s", pair.scan_window.as_secs());
    let devices = service.discover(pair.scan_window).await?;
    let device = select_device(devices, pair.device.as_deref())?;
    info!("Sending credentials to {}", device.display_name());

    let (cancel, token) = cancel_pair();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_signal() => {}
        }
        warn!("Interrupted, cancelling transfer");
        cancel.cancel();
    });

    match service
        .send_credentials_with_cancel(&device, &pair.payload, pair.timeout, &token)
        .await
    {
        Ok(report) => {
            println!(
                "Credentials sent to {} ({} bytes in {} chunks)",
                device.display_name(),
                report.bytes_written,
                report.chunks_written
            );
            Ok(())
        }
        Err(reason) => {
            error!("Pairing with {} failed: {}", device.id, reason);
            Err(reason.into())
        }
    }
}

/// Pick the target by address, or the only device found when none is given
fn select_device(
    devices: Vec<DeviceHandle>,
    address: Option<&str>,
) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    match address {
        Some(address) => devices
            .into_iter()
            .find(|d| d.id.as_str().eq_ignore_ascii_case(address))
            .ok_or_else(|| format!("Device {address} not found").into()),
        None => {
            let mut devices = devices.into_iter();
            match (devices.next(), devices.next()) {
                (Some(device), None) => Ok(device),
                (None, _) => Err("No pairing-capable devices found".into()),
                (Some(_), Some(_)) => {
                    Err("Several devices found, choose one with --device".into())
                }
            }
        }
    }
}

fn print_device(device: &DeviceHandle) {
    match device.rssi {
        Some(rssi) => println!("{}  {}  {} dBm", device.id, device.display_name(), rssi),
        None => println!("{}  {}", device.id, device.display_name()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await
}
