//! Connection manager: link lifecycle, the session task and the send path.
//!
//! One spawned task per connection owns the link reader. It dispatches every
//! inbound frame, sends the mission protocol's reactive replies, drives the
//! optional stall tick and, when the link fails, runs the reconnection loop
//! itself. Callers on any task share the single outbound writer.

use crate::backoff::ExponentialBackoff;
use crate::config::{Config, EndpointConfig};
use crate::dispatcher::MessageDispatcher;
use crate::error::{Result, SessionError};
use crate::event::EventPayload;
use crate::event_bus::EventBus;
use crate::framing::encode_frame;
use crate::link::{Connector, Link, LinkReader, LinkWriter, NetworkConnector};
use crate::mission::{
    AbortReason, MissionItem, MissionTransfer, Transition, UploadState,
};
use crate::outbound::{self, Command, DataStream, Target, STANDARD_STREAMS};
use crate::params::{ParamValue, Parameter, ParameterSync};
use crate::state::VehicleStateCache;
use crate::telemetry::flight_mode_number;
use mavlink::common::{MavMessage, MavMissionType};
use mavlink::{MavHeader, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const MIN_STALL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Link counters, copied out by [`ConnectionManager::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Frames that failed to parse plus messages a handler rejected
    pub malformed_dropped: u64,
    pub unrecognized: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    skipped_frames: AtomicU64,
    reconnects: AtomicU64,
}

struct Shared {
    config: Config,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    bus: Arc<EventBus>,
    vehicle: Arc<VehicleStateCache>,
    params: Arc<Mutex<ParameterSync>>,
    mission: Arc<Mutex<MissionTransfer>>,
    dispatcher: MessageDispatcher,
    writer: tokio::sync::Mutex<Option<LinkWriter>>,
    target: RwLock<Target>,
    sequence: AtomicU8,
    endpoint: RwLock<Option<EndpointConfig>>,
    auto_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    counters: Counters,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one vehicle connection and exposes the session API.
///
/// All methods take `&self` and may be called concurrently from any task;
/// wrap the manager in an `Arc` to share it.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    /// Held for the whole of `connect` and `disconnect`
    lifecycle: tokio::sync::Mutex<()>,
    /// Cancels a `connect` still waiting for its heartbeat
    pending: Mutex<Option<CancellationToken>>,
}

impl ConnectionManager {
    /// Manager using real serial ports and sockets.
    pub fn new(config: Config) -> Self {
        Self::with_connector(config, Arc::new(NetworkConnector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let bus = Arc::new(EventBus::new(config.general.event_queue_capacity));
        let vehicle = Arc::new(VehicleStateCache::new());
        let params = Arc::new(Mutex::new(ParameterSync::new()));
        let mission = Arc::new(Mutex::new(MissionTransfer::new(config.stall_timeout())));
        let dispatcher = MessageDispatcher::new(
            bus.clone(),
            vehicle.clone(),
            params.clone(),
            mission.clone(),
        );
        let auto_reconnect = config.reconnect.enabled;

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state: RwLock::new(ConnectionState::Disconnected),
                bus,
                vehicle,
                params,
                mission,
                dispatcher,
                writer: tokio::sync::Mutex::new(None),
                target: RwLock::new(Target::default()),
                sequence: AtomicU8::new(0),
                endpoint: RwLock::new(None),
                auto_reconnect: AtomicBool::new(auto_reconnect),
                reconnect_attempts: AtomicU32::new(0),
                counters: Counters::default(),
            }),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
        }
    }

    /// Opens `endpoint` and waits up to `timeout` for the first heartbeat.
    ///
    /// On success the state is `Connected`, the session task is running and
    /// the default data streams have been requested. On failure the state is
    /// `Error` and the link is released; no retry happens here.
    ///
    /// # Errors
    ///
    /// * [`SessionError::Transport`] / [`SessionError::Serial`] if the link cannot be opened or read
    /// * [`SessionError::ProtocolTimeout`] if no heartbeat arrives in time
    /// * [`SessionError::Cancelled`] if `disconnect` runs during the handshake
    ///
    /// Concurrent calls are serialized; a caller that finds the session
    /// already connected returns `Ok` without opening another link.
    pub async fn connect(&self, endpoint: EndpointConfig, timeout: Duration) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            warn!("Already connected, ignoring connect to {}", endpoint);
            return Ok(());
        }
        // A previous session may still be retrying or may have given up
        self.stop_session().await;

        let shared = &self.shared;
        shared
            .auto_reconnect
            .store(shared.config.reconnect.enabled, Ordering::SeqCst);
        shared.reconnect_attempts.store(0, Ordering::SeqCst);
        *shared.endpoint.write() = Some(endpoint.clone());

        let cancel = CancellationToken::new();
        *self.pending.lock() = Some(cancel.clone());
        info!("Connecting to {} (timeout {:?})", endpoint, timeout);
        shared.set_state(ConnectionState::Connecting);

        let established = shared.establish(&endpoint, timeout, &cancel).await;
        self.pending.lock().take();
        match established {
            Ok(reader) => {
                let handle = tokio::spawn(run_session(shared.clone(), reader, cancel.clone()));
                *self.session.lock() = Some(Session { cancel, handle });
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", endpoint, e);
                shared.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Connects to the `[endpoint]` from the configuration.
    pub async fn connect_configured(&self) -> Result<()> {
        let endpoint = self
            .shared
            .config
            .endpoint
            .clone()
            .ok_or_else(|| SessionError::config("No [endpoint] configured"))?;
        self.connect(endpoint, self.shared.config.connect_timeout())
            .await
    }

    /// Stops the session and clears all session state. Idempotent.
    ///
    /// Auto-reconnect stays off until the next `connect`. An upload still in
    /// progress ends as `Aborted(Disconnected)`.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.auto_reconnect.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.pending.lock().as_ref() {
            cancel.cancel();
        }
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_session().await;

        if let Some(mut writer) = shared.writer.lock().await.take() {
            writer.shutdown().await;
            info!("Link closed");
        }
        shared.set_state(ConnectionState::Disconnected);

        shared.vehicle.reset();
        shared.params.lock().reset();
        let transition = shared.mission.lock().reset();
        shared.dispatcher.apply(transition);
    }

    /// Disconnects, drops every listener and drains the event queue.
    pub async fn dispose(&self) {
        self.disconnect().await;
        self.shared.bus.clear_listeners();
        let dropped = self.shared.bus.clear_queue();
        debug!("Disposed session, {} queued events discarded", dropped);
    }

    async fn stop_session(&self) {
        let session = self.session.lock().take();
        let Some(Session { cancel, mut handle }) = session else {
            return;
        };
        cancel.cancel();

        let timeout = self.shared.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => debug!("Session task stopped"),
            Ok(Err(e)) => warn!("Session task ended abnormally: {}", e),
            Err(_) => {
                warn!("Session task did not stop within {:?}, aborting", timeout);
                handle.abort();
            }
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// System/component commands are addressed to.
    pub fn target(&self) -> Target {
        *self.shared.target.read()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.shared.bus.clone()
    }

    pub fn vehicle(&self) -> Arc<VehicleStateCache> {
        self.shared.vehicle.clone()
    }

    pub fn parameters(&self) -> BTreeMap<String, f32> {
        self.shared.params.lock().values()
    }

    pub fn parameter(&self, name: &str) -> Option<Parameter> {
        self.shared.params.lock().get(name).cloned()
    }

    pub fn upload_state(&self) -> UploadState {
        self.shared.mission.lock().upload_state()
    }

    /// Items received by the current or last download, in sequence order.
    pub fn downloaded_mission(&self) -> Vec<MissionItem> {
        self.shared.mission.lock().downloaded_items()
    }

    pub fn stats(&self) -> LinkStats {
        let counters = &self.shared.counters;
        let dispatch = self.shared.dispatcher.stats();
        LinkStats {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            malformed_dropped: counters.skipped_frames.load(Ordering::Relaxed)
                + dispatch.malformed.load(Ordering::Relaxed),
            unrecognized: dispatch.unrecognized.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
        }
    }

    // -- commands ----------------------------------------------------------

    /// Sends a COMMAND_LONG. The vehicle's COMMAND_ACK arrives later as an event.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        let message = command.to_message(self.target());
        self.shared.send_message(&message).await
    }

    /// Switches to a named flight mode (`"AUTO"`, `"rtl"`, ...).
    pub async fn set_flight_mode(&self, name: &str) -> Result<()> {
        let custom_mode =
            flight_mode_number(name).ok_or_else(|| SessionError::UnknownMode(name.to_string()))?;
        self.send_command(&Command::SetMode { custom_mode }).await
    }

    pub async fn request_data_stream(
        &self,
        stream: DataStream,
        rate_hz: u16,
        start: bool,
    ) -> Result<()> {
        let message = outbound::request_data_stream(self.target(), stream, rate_hz, start);
        self.shared.send_message(&message).await
    }

    pub async fn request_all_data_streams(&self, rate_hz: u16) -> Result<()> {
        self.shared.request_all_data_streams(rate_hz).await
    }

    /// Requests the usual ground-station stream set at per-group rates.
    pub async fn configure_standard_streams(&self) -> Result<()> {
        for (stream, rate_hz) in STANDARD_STREAMS {
            self.request_data_stream(stream, rate_hz, true).await?;
        }
        Ok(())
    }

    pub async fn stop_all_data_streams(&self) -> Result<()> {
        self.request_data_stream(DataStream::All, 0, false).await
    }

    /// SET_MESSAGE_INTERVAL for a message given by name; `rate_hz <= 0` stops it.
    pub async fn set_message_interval(&self, message_name: &str, rate_hz: f32) -> Result<()> {
        let command = outbound::message_interval(message_name, rate_hz)?;
        self.send_command(&command).await
    }

    // -- parameters --------------------------------------------------------

    /// Starts a full parameter sync. Previously received values are dropped.
    pub async fn request_all_parameters(&self) -> Result<()> {
        let message = outbound::param_request_list(self.target());
        self.shared.params.lock().begin_sync();
        self.shared.send_message(&message).await
    }

    pub async fn request_parameter(&self, name: &str) -> Result<()> {
        let message = outbound::param_request_read(self.target(), name)?;
        self.shared.send_message(&message).await
    }

    /// Writes a parameter. The wire type is inferred from the value; the
    /// vehicle echoes the stored value as PARAM_VALUE.
    pub async fn set_parameter(&self, name: &str, value: impl Into<ParamValue>) -> Result<()> {
        let message = outbound::param_set(self.target(), name, value.into())?;
        self.shared.send_message(&message).await
    }

    // -- missions ----------------------------------------------------------

    /// Announces `items` to the vehicle. The items themselves are sent as the
    /// vehicle requests them; progress and completion arrive as events.
    pub async fn start_mission_upload(
        &self,
        items: Vec<MissionItem>,
        mission_type: MavMissionType,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let transition = self.shared.mission.lock().start_upload(items, mission_type)?;
        self.shared.perform(transition).await
    }

    /// Abandons the upload in progress, if any.
    pub fn complete_mission_upload(&self) {
        let transition = self.shared.mission.lock().complete_upload();
        self.shared.dispatcher.apply(transition);
    }

    /// Starts a mission download.
    pub async fn request_mission_list(&self, mission_type: MavMissionType) -> Result<()> {
        let transition = self.shared.mission.lock().request_list(mission_type);
        self.shared.perform(transition).await
    }

    pub async fn request_mission_item(&self, seq: u16, mission_type: MavMissionType) -> Result<()> {
        let transition = self.shared.mission.lock().request_item(seq, mission_type);
        self.shared.perform(transition).await
    }

    pub async fn clear_mission(&self, mission_type: MavMissionType) -> Result<()> {
        let transition = self.shared.mission.lock().clear(mission_type);
        self.shared.perform(transition).await
    }

    pub async fn set_current_mission_item(&self, seq: u16) -> Result<()> {
        let transition = self.shared.mission.lock().set_current(seq);
        self.shared.perform(transition).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.pending.get_mut().take() {
            cancel.cancel();
        }
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            info!("Connection state {} -> {}", previous, next);
            self.bus.publish(EventPayload::ConnectionStateChanged {
                previous,
                current: next,
            });
        }
    }

    /// Opens the link and waits for a heartbeat. On success the writer is
    /// installed, the state is `Connected` and the reader is handed back for
    /// the session task.
    async fn establish(
        &self,
        endpoint: &EndpointConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LinkReader> {
        let own_system = self.config.general.system_id;
        let handshake = async {
            let Link {
                mut reader,
                writer,
                description,
            } = self.connector.open(endpoint).await?;
            debug!("Link {} open, waiting for heartbeat", description);
            loop {
                let frame = reader
                    .next_frame()
                    .await
                    .map_err(|e| SessionError::transport(description.as_str(), e))?;
                let is_vehicle_heartbeat = matches!(frame.message, MavMessage::HEARTBEAT(_))
                    && frame.header.system_id != own_system;
                if is_vehicle_heartbeat {
                    return Ok::<_, SessionError>((reader, writer, frame));
                }
                trace!("Discarding {} before heartbeat", frame.message.message_name());
            }
        };

        let (reader, writer, heartbeat) = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = tokio::time::timeout(timeout, handshake) => match result {
                Ok(opened) => opened?,
                Err(_) => {
                    return Err(SessionError::ProtocolTimeout {
                        endpoint: endpoint.to_string(),
                        timeout,
                    })
                }
            },
        };

        let general = &self.config.general;
        let target = Target {
            system_id: general.target_system.unwrap_or(heartbeat.header.system_id),
            component_id: general
                .target_component
                .unwrap_or(heartbeat.header.component_id),
        };
        *self.target.write() = target;
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);
        info!(
            "Connected to {}, vehicle {}/{}",
            endpoint, target.system_id, target.component_id
        );

        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        self.dispatcher
            .dispatch(&heartbeat.header, &heartbeat.message);
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        if self.config.streams.request_on_connect {
            if let Err(e) = self
                .request_all_data_streams(self.config.streams.default_rate_hz)
                .await
            {
                warn!("Default data stream request failed: {}", e);
            }
        }
        Ok(reader)
    }

    /// Encodes and writes one frame under the writer lock.
    async fn send_message(&self, message: &MavMessage) -> Result<()> {
        let header = MavHeader {
            system_id: self.config.general.system_id,
            component_id: self.config.general.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let bytes = encode_frame(header, message)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        writer.send(&bytes).await.map_err(|e| {
            let endpoint = self
                .endpoint
                .read()
                .as_ref()
                .map_or_else(|| "unknown".to_string(), |ep| ep.to_string());
            SessionError::transport(endpoint, e)
        })?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent {}", message.message_name());
        Ok(())
    }

    async fn request_all_data_streams(&self, rate_hz: u16) -> Result<()> {
        let message =
            outbound::request_data_stream(*self.target.read(), DataStream::All, rate_hz, true);
        self.send_message(&message).await
    }

    /// Publishes a mission transition's events, then sends its messages.
    /// A failed send aborts an upload in progress.
    async fn perform(&self, transition: Transition) -> Result<()> {
        let actions = self.dispatcher.apply(transition);
        let target = *self.target.read();
        for action in actions {
            if let Err(e) = self.send_message(&action.to_message(target)).await {
                let abort = self.mission.lock().abort_upload(AbortReason::SendFailed);
                self.dispatcher.apply(abort);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Retries the last endpoint until it answers, the attempt budget runs
    /// out or the session is cancelled. Returns the new reader on success.
    async fn reconnect(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
    ) -> Option<LinkReader> {
        if cancel.is_cancelled() {
            return None;
        }
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Error);
            return None;
        }
        let endpoint = self.endpoint.read().clone()?;

        let reconnect = &self.config.reconnect;
        self.set_state(ConnectionState::Connecting);

        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > reconnect.max_attempts {
                error!(
                    "Giving up on {} after {} reconnection attempts",
                    endpoint, reconnect.max_attempts
                );
                self.set_state(ConnectionState::Error);
                return None;
            }

            let delay = backoff.next_backoff();
            info!(
                "Reconnecting to {} in {:?} (attempt {}/{})",
                endpoint, delay, attempt, reconnect.max_attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.auto_reconnect.load(Ordering::SeqCst) {
                return None;
            }

            match self
                .establish(&endpoint, self.config.connect_timeout(), cancel)
                .await
            {
                Ok(reader) => {
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    return Some(reader);
                }
                Err(SessionError::Cancelled) => return None,
                Err(e) => warn!("Reconnection attempt {} failed: {}", attempt, e),
            }
        }
    }
}

async fn stall_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Session task body. Exits on cancellation or when reconnection gives up.
async fn run_session(shared: Arc<Shared>, mut reader: LinkReader, cancel: CancellationToken) {
    let mut stall = shared.config.stall_timeout().map(|timeout| {
        let mut interval = tokio::time::interval((timeout / 4).max(MIN_STALL_TICK));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut skipped_seen = 0u64;
    let mut backoff = ExponentialBackoff::from_config(&shared.config.reconnect);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session task received cancellation signal");
                break;
            }
            _ = stall_tick(&mut stall) => {
                let transition = shared.mission.lock().tick(Instant::now());
                if !transition.is_empty() {
                    if let Err(e) = shared.perform(transition).await {
                        warn!("Mission retry failed: {}", e);
                    }
                }
                continue;
            }
            frame = reader.next_frame() => frame,
        };

        match result {
            Ok(frame) => {
                shared.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                let skipped = reader.skipped_frames();
                if skipped > skipped_seen {
                    shared
                        .counters
                        .skipped_frames
                        .fetch_add(skipped - skipped_seen, Ordering::Relaxed);
                    skipped_seen = skipped;
                }

                let actions = shared.dispatcher.dispatch(&frame.header, &frame.message);
                if actions.is_empty() {
                    continue;
                }
                let transition = Transition {
                    actions,
                    events: Vec::new(),
                };
                if let Err(e) = shared.perform(transition).await {
                    warn!("Mission reply failed: {}", e);
                }
            }
            Err(e) => {
                warn!("Link read failed: {}", e);
                if let Some(mut writer) = shared.writer.lock().await.take() {
                    writer.shutdown().await;
                }
                match shared.reconnect(&cancel, &mut backoff).await {
                    Some(next) => {
                        reader = next;
                        skipped_seen = 0;
                        backoff.reset();
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Session task exiting");
}
