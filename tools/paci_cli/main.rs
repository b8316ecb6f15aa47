// Smart Paci diagnostic CLI.
//
// Scans for devices, watches the live event stream, queries firmware
// metadata and drives OTA updates from the command line. Built with
// `--features cli`.

use clap::{Parser, Subcommand};
use smartpaci::{DeviceEvent, McuMgrClient, OtaOrchestrator, Session};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "paci_cli", about = "Smart Paci diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan for Smart Paci devices.
    Scan {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Connect and print the event stream.
    Watch {
        /// Substring of the device name to connect to; first match wins.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },
    /// Connect and print firmware metadata.
    Version {
        #[arg(long)]
        name: Option<String>,
    },
    /// Upload a firmware image, apply it and reboot into the test slot.
    Update {
        #[arg(long)]
        name: Option<String>,
        /// Path to the MCUboot image file.
        file: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> smartpaci::Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Scan { seconds } => {
            let devices = smartpaci::ble::scan(Duration::from_secs(seconds)).await?;
            for device in &devices {
                println!("{}  {}  RSSI {:?}", device.id, device.name, device.rssi);
            }
            if devices.is_empty() {
                println!("No Smart Paci devices found");
            }
        }
        Command::Watch { name, seconds } => {
            let session = connect(name).await?;
            let mut events = session.subscribe();
            let deadline = tokio::time::sleep(Duration::from_secs(seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => println!("{event:?}"),
                        Err(_) => break,
                    },
                    _ = &mut deadline => break,
                }
            }
            session.disconnect().await?;
        }
        Command::Version { name } => {
            let session = connect(name).await?;
            println!("version: {}", session.get_firmware_version().await?);
            println!("commit:  {}", session.get_firmware_commit().await?);
            println!("hash:    {}", session.get_firmware_hash().await?);
            match session.get_firmware_date().await? {
                Some(date) => println!("built:   {date}"),
                None => println!("built:   unknown"),
            }
            session.disconnect().await?;
        }
        Command::Update { name, file } => {
            let image = std::fs::read(&file)
                .map_err(|e| smartpaci::Error::InvalidImage(format!("{}: {e}", file.display())))?;
            let session = Arc::new(connect(name).await?);
            let mut events = session.subscribe();

            let ota = OtaOrchestrator::new(session.clone());
            let progress = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        DeviceEvent::FirmwareUploadProgress { percent } => {
                            print!("\rUploading: {percent:.0}%");
                        }
                        DeviceEvent::FirmwareUploadComplete => {
                            println!("\rUpload complete          ");
                            break;
                        }
                        _ => {}
                    }
                }
            });

            ota.upload_firmware(&image).await?;
            let _ = progress.await;
            ota.apply_update().await?;
            println!("Device is rebooting into the new image; reconnect to confirm it.");
        }
    }

    Ok(())
}

/// Scan and connect to the first device matching `name` (or the first seen).
async fn connect(name: Option<String>) -> smartpaci::Result<Session> {
    let mut devices = smartpaci::ble::scan(Duration::from_secs(10)).await?;
    if let Some(name) = &name {
        devices.retain(|d| d.name.contains(name.as_str()));
    }
    if devices.is_empty() {
        return Err(smartpaci::Error::NotFound(
            "no matching Smart Paci device".to_string(),
        ));
    }
    let device = devices.remove(0);
    println!("Connecting to {} ({})", device.name, device.id);

    let link = Arc::new(device.into_link());
    let session = Session::with_link(link, Arc::new(McuMgrClient::new()));
    session.connect().await?;
    Ok(session)
}
