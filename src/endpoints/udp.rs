//! UDP transport.
//!
//! Server mode binds the given address and replies to whoever sent the most
//! recent datagram (the usual `udpin:0.0.0.0:14550` setup). Client mode binds
//! an ephemeral port and sends to a fixed address.

use crate::config::EndpointMode;
use crate::error::{Result, SessionError};
use crate::link::Link;
use tokio::net::{lookup_host, UdpSocket};
use tracing::info;

pub async fn open(address: &str, mode: EndpointMode) -> Result<Link> {
    let description = match mode {
        EndpointMode::Server => format!("udpin:{}", address),
        EndpointMode::Client => format!("udpout:{}", address),
    };

    let (bind_addr, peer) = match mode {
        EndpointMode::Server => (address.to_string(), None),
        EndpointMode::Client => {
            let target = lookup_host(address)
                .await
                .map_err(|e| SessionError::transport(&description, e))?
                .next()
                .ok_or_else(|| {
                    SessionError::transport(
                        &description,
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Could not resolve remote address",
                        ),
                    )
                })?;
            let any = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            (any.to_string(), Some(target))
        }
    };

    let socket = UdpSocket::bind(&bind_addr)
        .await
        .map_err(|e| SessionError::transport(&description, e))?;

    info!("UDP endpoint {} bound to {}", description, bind_addr);
    Ok(Link::from_udp(socket, peer, description))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_resolves_peer() {
        let link = open("127.0.0.1:14999", EndpointMode::Client)
            .await
            .expect("bind ephemeral");
        assert_eq!(link.description, "udpout:127.0.0.1:14999");
    }

    #[tokio::test]
    async fn test_server_bind_conflict() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = taken.local_addr().expect("addr").to_string();
        let result = open(&addr, EndpointMode::Server).await;
        assert!(matches!(result, Err(SessionError::Transport { .. })));
    }
}
