//! Serial transport.
//!
//! Opens the flight controller's serial port (USB CDC or telemetry radio).
//! Retry policy lives in the connection manager, not here.

use crate::error::{Result, SessionError};
use crate::link::Link;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Opens `device` at `baud`.
///
/// # Arguments
///
/// * `device` - Path to the serial device (e.g., "/dev/ttyACM0" on Linux, "COM3" on Windows).
/// * `baud` - The baud rate (e.g., 57600 for SiK radios, 115200 for USB).
///
/// # Errors
///
/// Returns [`SessionError::Serial`] if the port cannot be opened or configured.
#[allow(unused_mut)]
pub async fn open(device: &str, baud: u32) -> Result<Link> {
    let mut port = tokio_serial::new(device, baud)
        .open_native_async()
        .map_err(|e| SessionError::serial(device, e))?;

    #[cfg(unix)]
    if let Err(e) = port.set_exclusive(false) {
        tracing::warn!("Failed to set exclusive mode on {}: {}", device, e);
    }

    info!("Serial port {} opened at {} baud", device, baud);

    Ok(Link::from_stream(port, format!("serial:{}:{}", device, baud)))
}
