//! Scripted transport for session tests.
//!
//! Each `open` pops the next step of a script. `Accept` hands the session one
//! end of an in-memory pipe and gives the test the other end as a
//! [`SimVehicle`]; `Refuse` fails the open. An exhausted script refuses.

#![allow(clippy::expect_used, dead_code)]

use futures::future::BoxFuture;
use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use mavlink::MavHeader;
use mavsession::config::{Config, EndpointConfig};
use mavsession::event::{EventKind, EventPayload};
use mavsession::framing::{encode_frame, StreamParser};
use mavsession::link::{Connector, Link};
use mavsession::{ConnectionManager, ConnectionState, Event, Result, SessionError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Accept,
    Refuse,
}

pub struct ScriptedConnector {
    script: Mutex<VecDeque<Step>>,
    opens: AtomicUsize,
    vehicles: mpsc::UnboundedSender<SimVehicle>,
}

impl ScriptedConnector {
    pub fn new(script: &[Step]) -> (Arc<Self>, mpsc::UnboundedReceiver<SimVehicle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            opens: AtomicUsize::new(0),
            vehicles: tx,
        });
        (connector, rx)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn open<'a>(&'a self, endpoint: &'a EndpointConfig) -> BoxFuture<'a, Result<Link>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front().unwrap_or(Step::Refuse);
            match step {
                Step::Accept => {
                    let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                    // Test may have dropped the receiver already
                    let _ = self.vehicles.send(SimVehicle::new(theirs));
                    Ok(Link::from_stream(ours, endpoint.to_string()))
                }
                Step::Refuse => Err(SessionError::transport(
                    endpoint.to_string(),
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted refusal"),
                )),
            }
        })
    }
}

/// Vehicle end of a scripted link.
pub struct SimVehicle {
    stream: DuplexStream,
    parser: StreamParser,
    sequence: u8,
}

impl SimVehicle {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            parser: StreamParser::new(),
            sequence: 0,
        }
    }

    pub async fn send(&mut self, message: MavMessage) {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        let bytes = encode_frame(header, &message).expect("encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("vehicle write");
    }

    pub async fn heartbeat(&mut self) {
        self.send(heartbeat(10, false)).await;
    }

    /// Next message from the session, or `None` after `timeout`.
    pub async fn recv_within(&mut self, timeout: Duration) -> Option<MavMessage> {
        tokio::time::timeout(timeout, async {
            let mut chunk = [0u8; 1024];
            loop {
                if let Some(frame) = self.parser.parse_next() {
                    return Some(frame.message);
                }
                let n = self.stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                self.parser.push(&chunk[..n]);
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Next message the predicate accepts; others are skipped.
    pub async fn expect<T>(&mut self, mut pick: impl FnMut(MavMessage) -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let message = self
                .recv_within(remaining)
                .await
                .expect("expected message from session");
            if let Some(found) = pick(message) {
                return found;
            }
        }
    }
}

pub fn heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
    let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode,
        mavtype: MavType::MAV_TYPE_FIXED_WING,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

pub fn endpoint() -> EndpointConfig {
    EndpointConfig::Tcp {
        address: "127.0.0.1:5760".to_string(),
    }
}

/// Config with short reconnect delays.
pub fn fast_config(max_attempts: u32) -> Config {
    let mut config = Config::default();
    config.reconnect.delay_ms = 10;
    config.reconnect.max_attempts = max_attempts;
    config.general.shutdown_timeout_ms = 500;
    config
}

/// Connects a manager whose first open is answered by a heartbeat.
pub async fn connected(
    config: Config,
    script: &[Step],
) -> (
    ConnectionManager,
    Arc<ScriptedConnector>,
    mpsc::UnboundedReceiver<SimVehicle>,
    SimVehicle,
) {
    let (connector, mut vehicles) = ScriptedConnector::new(script);
    let manager = ConnectionManager::with_connector(config, connector.clone());

    let answer = tokio::spawn(async move {
        let mut vehicle = vehicles.recv().await.expect("link opened");
        vehicle.heartbeat().await;
        (vehicle, vehicles)
    });
    manager.connect(endpoint(), WAIT).await.expect("connect");
    let (vehicle, vehicles) = answer.await.expect("vehicle task");
    (manager, connector, vehicles, vehicle)
}

pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        while manager.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {}, still {}", state, manager.state()));
}

/// Polls the queue until an event of `kind` shows up.
pub async fn next_event(manager: &ConnectionManager, kind: EventKind) -> Event {
    let events = manager.events();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = events
            .poll(Some(remaining))
            .await
            .unwrap_or_else(|| panic!("no {:?} event", kind));
        if event.kind() == kind {
            return event;
        }
    }
}

/// Payloads of every queued event of `kind`, without waiting.
pub fn drain(manager: &ConnectionManager, kind: EventKind) -> Vec<EventPayload> {
    let events = manager.events();
    std::iter::from_fn(|| events.try_poll())
        .filter(|event| event.kind() == kind)
        .map(Event::into_payload)
        .collect()
}
