#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

use anyhow::{Context, Result};
use clap::Parser;
use mavlink::common::MavMissionType;
use mavsession::{Config, ConnectionManager, EndpointConfig, Event, EventPayload};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Connects to a MAVLink vehicle and logs its session events", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Connection string, overrides [endpoint] (e.g. serial:/dev/ttyACM0:57600, tcp:127.0.0.1:5760, udpin:0.0.0.0:14550)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Seconds to wait for the first heartbeat
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Download the full parameter list after connecting
    #[arg(long)]
    params: bool,

    /// Download the mission after connecting
    #[arg(long)]
    mission: bool,

    /// Request the standard per-group stream rates instead of one rate for all
    #[arg(long)]
    standard_streams: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            match Config::load(path).await {
                Ok(c) => c,
                Err(e) => {
                    error!("Error loading config: {:#}", e);
                    return Err(e);
                }
            }
        }
        None => Config::default(),
    };

    let endpoint: EndpointConfig = match (&args.endpoint, &config.endpoint) {
        (Some(s), _) => s.parse()?,
        (None, Some(configured)) => configured.clone(),
        (None, None) => anyhow::bail!("No endpoint given; use --endpoint or an [endpoint] section"),
    };
    endpoint.validate()?;

    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.connect_timeout());

    let manager = ConnectionManager::new(config);
    let events = manager.events();

    manager.connect(endpoint, timeout).await?;

    if args.standard_streams {
        manager.configure_standard_streams().await?;
    }
    if args.params {
        manager.request_all_parameters().await?;
    }
    if args.mission {
        manager
            .request_mission_list(MavMissionType::MAV_MISSION_TYPE_MISSION)
            .await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received. Disconnecting...");
                break;
            }
            event = events.poll(Some(Duration::from_secs(1))) => {
                if let Some(event) = event {
                    log_event(&event);
                }
            }
        }
    }

    let stats = manager.stats();
    info!(
        "Frames received={} sent={} malformed={} unrecognized={} reconnects={}",
        stats.frames_received,
        stats.frames_sent,
        stats.malformed_dropped,
        stats.unrecognized,
        stats.reconnects
    );
    manager.dispose().await;
    info!("Shutdown complete.");

    Ok(())
}

fn log_event(event: &Event) {
    match event.payload() {
        EventPayload::ConnectionStateChanged { previous, current } => {
            info!("Connection {} -> {}", previous, current);
        }
        EventPayload::Heartbeat(hb) => debug!(
            "Heartbeat from {}/{}: mode={} armed={}",
            hb.system_id, hb.component_id, hb.mode, hb.armed
        ),
        EventPayload::StatusText(text) => info!("[{:?}] {}", text.severity, text.text),
        EventPayload::CommandAck(ack) => info!("Command {:?} -> {:?}", ack.command, ack.result),
        EventPayload::AllParametersReceived(values) => {
            info!("Parameter sync complete: {} parameters", values.len());
        }
        EventPayload::MissionDownloadComplete(items) => {
            info!("Mission download complete: {} items", items.len());
            for item in items {
                info!(
                    "  #{} {:?} ({:.7}, {:.7}, {:.1})",
                    item.seq, item.command, item.x, item.y, item.z
                );
            }
        }
        EventPayload::MissionUploadComplete { result, accepted } => {
            info!("Mission upload finished: {:?} (accepted={})", result, accepted);
        }
        EventPayload::MissionUploadAborted(reason) => warn!("Mission upload aborted: {:?}", reason),
        other => debug!("{:?}", other),
    }
}
