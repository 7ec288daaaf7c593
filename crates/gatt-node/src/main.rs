//! GATT Node - demo host for the peripheral engine
//!
//! This binary runs the four built-in services with:
//! - A simulated radio transport that loops pushes back as completions
//! - A scripted central that reads, writes and subscribes
//! - UI events printed to stdout as JSON lines

mod sim;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gatt_peripheral::services::default_services;
use gatt_peripheral::uuids::{ENVIRONMENTAL_SENSING_SERVICE, HEART_RATE_SERVICE};
use gatt_peripheral::{BroadcastSink, PeripheralConfig, PeripheralServer};
use sim::SimulatedTransport;

#[derive(Parser)]
#[command(name = "gatt-node")]
#[command(about = "BLE GATT peripheral demo over a simulated radio")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Local name to advertise (overrides the configuration)
    #[arg(long, short)]
    name: Option<String>,

    /// Model number the scripted central writes
    #[arg(long, default_value = "gatt-node-demo")]
    model: String,

    /// Seconds the scripted central stays subscribed
    #[arg(long, short, default_value_t = 10)]
    duration: u64,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            PeripheralConfig::from_json_file(path)?
        }
        None => PeripheralConfig::default(),
    };
    if let Some(name) = args.name {
        config.device.name = name;
    }
    config.validate()?;

    info!("Starting GATT node: {}", config.device.name);
    info!(
        "Device: {} {} (notify every {:?})",
        config.device.manufacturer, config.device.model, config.notifications.interval
    );

    let sink = BroadcastSink::default();
    let mut events = sink.subscribe();

    let transport = SimulatedTransport::new();
    let (mut server, handle) = PeripheralServer::new(transport.clone(), sink, config.clone());
    transport.attach(handle.clone());

    for service in default_services(&config) {
        server.register_service(service)?;
    }
    server.start_advertising(HEART_RATE_SERVICE, &[])?;
    server.start_advertising(ENVIRONMENTAL_SENSING_SERVICE, &[])?;

    // Print UI events as JSON lines
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event printer lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    let hold = Duration::from_secs(args.duration);
    tokio::select! {
        result = sim::run_scripted_central(&handle, &args.model, hold) => {
            if let Err(e) = result {
                error!("Scripted central failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    let stats = handle.stats().await?;
    info!("Server stats: {}", serde_json::to_string(&stats)?);
    info!("Simulated radio accepted {} pushes", transport.pushes());

    handle.stop_advertising().await?;
    handle.shutdown().await?;
    server_task.await?;
    // Sink is dropped with the server, which ends the printer
    printer.await?;

    Ok(())
}
