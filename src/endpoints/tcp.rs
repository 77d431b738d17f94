//! TCP client transport (SITL, MAVProxy/mavlink-router TCP ports).

use crate::error::{Result, SessionError};
use crate::link::Link;
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Connects to `address` (`host:port`).
pub async fn open(address: &str) -> Result<Link> {
    info!("Connecting to TCP endpoint at {}", address);
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| SessionError::transport(format!("tcp:{}", address), e))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
    }

    info!("Connected to {}", address);
    Ok(Link::from_stream(stream, format!("tcp:{}", address)))
}
