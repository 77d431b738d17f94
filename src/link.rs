//! Transport handles.
//!
//! A [`Link`] is an opened transport split into a frame reader and a frame
//! writer. Stream transports (serial, TCP, in-memory pipes) go through the
//! [`StreamParser`]; UDP delivers whole frames per datagram and learns its peer
//! from the first datagram when bound as a server.

use crate::config::EndpointConfig;
use crate::endpoints::{serial, tcp, udp};
use crate::error::Result;
use crate::framing::{decode_datagram, MavlinkFrame, StreamParser};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;
const MAX_DATAGRAM: usize = 65535;

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens links. The default is [`NetworkConnector`]; tests substitute a
/// scripted one.
pub trait Connector: Send + Sync {
    fn open<'a>(&'a self, endpoint: &'a EndpointConfig) -> BoxFuture<'a, Result<Link>>;
}

/// Opens real serial ports and sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkConnector;

impl Connector for NetworkConnector {
    fn open<'a>(&'a self, endpoint: &'a EndpointConfig) -> BoxFuture<'a, Result<Link>> {
        Box::pin(async move {
            match endpoint {
                EndpointConfig::Serial { device, baud } => serial::open(device, *baud).await,
                EndpointConfig::Tcp { address } => tcp::open(address).await,
                EndpointConfig::Udp { address, mode } => udp::open(address, *mode).await,
            }
        })
    }
}

pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
    pub description: String,
}

impl Link {
    /// Wraps any bidirectional byte stream.
    pub fn from_stream<S>(stream: S, description: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LinkReader::Stream {
                reader: Box::new(read_half),
                parser: StreamParser::new(),
            },
            writer: LinkWriter::Stream(BufWriter::new(Box::new(write_half))),
            description: description.into(),
        }
    }

    /// UDP link. `peer` is fixed for client mode and learned for server mode.
    pub fn from_udp(
        socket: UdpSocket,
        peer: Option<SocketAddr>,
        description: impl Into<String>,
    ) -> Self {
        let socket = Arc::new(socket);
        let fixed = peer.is_some();
        let peer = Arc::new(Mutex::new(peer));
        Self {
            reader: LinkReader::Datagram {
                socket: socket.clone(),
                peer: peer.clone(),
                learn_peer: !fixed,
                pending: VecDeque::new(),
                buf: vec![0u8; MAX_DATAGRAM],
            },
            writer: LinkWriter::Datagram { socket, peer },
            description: description.into(),
        }
    }
}

pub enum LinkReader {
    Stream {
        reader: BoxedReader,
        parser: StreamParser,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Arc<Mutex<Option<SocketAddr>>>,
        learn_peer: bool,
        pending: VecDeque<MavlinkFrame>,
        buf: Vec<u8>,
    },
}

impl LinkReader {
    /// Waits for the next frame. End of stream is reported as
    /// `UnexpectedEof` so the caller treats it like any read failure.
    ///
    /// Cancel safe: partially received data stays buffered.
    pub async fn next_frame(&mut self) -> io::Result<MavlinkFrame> {
        match self {
            LinkReader::Stream { reader, parser } => {
                let mut chunk = [0u8; READ_CHUNK];
                loop {
                    if let Some(frame) = parser.parse_next() {
                        return Ok(frame);
                    }
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "link closed by peer",
                        ));
                    }
                    parser.push(&chunk[..n]);
                }
            }
            LinkReader::Datagram {
                socket,
                peer,
                learn_peer,
                pending,
                buf,
            } => loop {
                if let Some(frame) = pending.pop_front() {
                    return Ok(frame);
                }
                let (len, from) = socket.recv_from(buf).await?;
                if *learn_peer {
                    let mut current = peer.lock();
                    if *current != Some(from) {
                        debug!("UDP peer is now {}", from);
                        *current = Some(from);
                    }
                }
                pending.extend(decode_datagram(&buf[..len]));
            },
        }
    }

    /// Frames skipped by the stream parser.
    pub fn skipped_frames(&self) -> u64 {
        match self {
            LinkReader::Stream { parser, .. } => parser.skipped_frames(),
            LinkReader::Datagram { .. } => 0,
        }
    }
}

pub enum LinkWriter {
    Stream(BufWriter<BoxedWriter>),
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Arc<Mutex<Option<SocketAddr>>>,
    },
}

impl LinkWriter {
    /// Writes one encoded frame and flushes it.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            LinkWriter::Stream(writer) => {
                writer.write_all(frame).await?;
                writer.flush().await
            }
            LinkWriter::Datagram { socket, peer } => {
                let target = *peer.lock();
                match target {
                    Some(addr) => socket.send_to(frame, addr).await.map(|_| ()),
                    None => {
                        trace!("UDP peer unknown, dropping {} byte frame", frame.len());
                        Ok(())
                    }
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        if let LinkWriter::Stream(writer) = self {
            if let Err(e) = writer.shutdown().await {
                debug!("Link shutdown: {}", e);
            }
        }
    }
}
