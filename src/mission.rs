//! Mission transfer protocol.
//!
//! Upload is pulled by the vehicle: after MISSION_COUNT it asks for each item
//! by sequence number and finishes with MISSION_ACK. Download is pulled by us:
//! MISSION_REQUEST_LIST, then MISSION_COUNT, then one request per item.
//!
//! [`MissionTransfer`] is a plain state machine. Every input returns a
//! [`Transition`] listing the messages to send and the events to publish; the
//! caller does the I/O after releasing its lock on the machine.

use crate::error::{Result, SessionError};
use crate::event::EventPayload;
use crate::outbound::Target;
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MavMissionType, MISSION_ACK_DATA,
    MISSION_CLEAR_ALL_DATA, MISSION_COUNT_DATA, MISSION_ITEM_DATA, MISSION_ITEM_INT_DATA,
    MISSION_REQUEST_INT_DATA, MISSION_REQUEST_LIST_DATA, MISSION_SET_CURRENT_DATA,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEG_E7: f64 = 1e7;

#[derive(Debug, Clone, PartialEq)]
pub struct MissionItem {
    pub seq: u16,
    pub frame: MavFrame,
    pub command: MavCmd,
    pub current: u8,
    pub autocontinue: u8,
    pub param1: f32,
    pub param2: f32,
    pub param3: f32,
    pub param4: f32,
    /// Latitude in degrees for global frames, otherwise frame-specific
    pub x: f64,
    /// Longitude in degrees for global frames, otherwise frame-specific
    pub y: f64,
    pub z: f32,
    pub mission_type: MavMissionType,
}

/// Optional NAV_WAYPOINT parameters. A NaN `yaw` keeps the current heading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaypointParams {
    /// Seconds to loiter at the waypoint
    pub hold_time: f32,
    pub accept_radius: f32,
    pub pass_radius: f32,
    pub yaw: f32,
}

impl Default for WaypointParams {
    fn default() -> Self {
        Self {
            hold_time: 0.0,
            accept_radius: 0.0,
            pass_radius: 0.0,
            yaw: f32::NAN,
        }
    }
}

/// Optional NAV_TAKEOFF parameters. Zero `lat`/`lon` take off from the
/// current position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeoffParams {
    /// Minimum pitch in degrees
    pub pitch: f32,
    pub yaw: f32,
    pub lat: f64,
    pub lon: f64,
}

impl Default for TakeoffParams {
    fn default() -> Self {
        Self {
            pitch: 0.0,
            yaw: f32::NAN,
            lat: 0.0,
            lon: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandParams {
    pub abort_alt: f32,
    pub precision_land: u8,
    pub yaw: f32,
}

impl Default for LandParams {
    fn default() -> Self {
        Self {
            abort_alt: 0.0,
            precision_land: 0,
            yaw: f32::NAN,
        }
    }
}

impl MissionItem {
    /// Item 0 is marked current; yaw defaults to NaN (unchanged heading).
    fn blank(seq: u16, command: MavCmd) -> Self {
        Self {
            seq,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            command,
            current: u8::from(seq == 0),
            autocontinue: 1,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: f32::NAN,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
        }
    }

    /// NAV_WAYPOINT at `lat`/`lon`, `alt` meters above home.
    pub fn waypoint(seq: u16, lat: f64, lon: f64, alt: f32) -> Self {
        Self::waypoint_with(seq, lat, lon, alt, WaypointParams::default())
    }

    pub fn waypoint_with(seq: u16, lat: f64, lon: f64, alt: f32, params: WaypointParams) -> Self {
        Self {
            param1: params.hold_time,
            param2: params.accept_radius,
            param3: params.pass_radius,
            param4: params.yaw,
            x: lat,
            y: lon,
            z: alt,
            ..Self::blank(seq, MavCmd::MAV_CMD_NAV_WAYPOINT)
        }
    }

    pub fn takeoff(seq: u16, alt: f32) -> Self {
        Self::takeoff_with(seq, alt, TakeoffParams::default())
    }

    pub fn takeoff_with(seq: u16, alt: f32, params: TakeoffParams) -> Self {
        Self {
            param1: params.pitch,
            param4: params.yaw,
            x: params.lat,
            y: params.lon,
            z: alt,
            ..Self::blank(seq, MavCmd::MAV_CMD_NAV_TAKEOFF)
        }
    }

    /// NAV_LAND at `lat`/`lon`; zeros land at the current position.
    pub fn land(seq: u16, lat: f64, lon: f64) -> Self {
        Self::land_with(seq, lat, lon, LandParams::default())
    }

    pub fn land_with(seq: u16, lat: f64, lon: f64, params: LandParams) -> Self {
        Self {
            current: 0,
            param1: params.abort_alt,
            param2: f32::from(params.precision_land),
            param4: params.yaw,
            x: lat,
            y: lon,
            ..Self::blank(seq, MavCmd::MAV_CMD_NAV_LAND)
        }
    }

    /// Frames whose x/y are latitude/longitude.
    pub fn is_global(&self) -> bool {
        is_global_frame(self.frame)
    }

    pub fn from_item_int(data: &MISSION_ITEM_INT_DATA) -> Self {
        let (x, y) = if is_global_frame(data.frame) {
            (f64::from(data.x) / DEG_E7, f64::from(data.y) / DEG_E7)
        } else {
            (f64::from(data.x), f64::from(data.y))
        };
        Self {
            seq: data.seq,
            frame: data.frame,
            command: data.command,
            current: data.current,
            autocontinue: data.autocontinue,
            param1: data.param1,
            param2: data.param2,
            param3: data.param3,
            param4: data.param4,
            x,
            y,
            z: data.z,
            mission_type: data.mission_type,
        }
    }

    pub fn from_item(data: &MISSION_ITEM_DATA) -> Self {
        Self {
            seq: data.seq,
            frame: data.frame,
            command: data.command,
            current: data.current,
            autocontinue: data.autocontinue,
            param1: data.param1,
            param2: data.param2,
            param3: data.param3,
            param4: data.param4,
            x: f64::from(data.x),
            y: f64::from(data.y),
            z: data.z,
            mission_type: data.mission_type,
        }
    }

    /// MISSION_ITEM_INT with degE7 coordinates for global frames.
    pub fn to_item_int(&self, target: Target) -> MISSION_ITEM_INT_DATA {
        let (x, y) = if self.is_global() {
            (
                (self.x * DEG_E7).round() as i32,
                (self.y * DEG_E7).round() as i32,
            )
        } else {
            (self.x as i32, self.y as i32)
        };
        MISSION_ITEM_INT_DATA {
            target_system: target.system_id,
            target_component: target.component_id,
            seq: self.seq,
            frame: self.frame,
            command: self.command,
            current: self.current,
            autocontinue: self.autocontinue,
            param1: self.param1,
            param2: self.param2,
            param3: self.param3,
            param4: self.param4,
            x,
            y,
            z: self.z,
            mission_type: self.mission_type,
            ..Default::default()
        }
    }

    /// Legacy MISSION_ITEM with float coordinates.
    pub fn to_item(&self, target: Target) -> MISSION_ITEM_DATA {
        MISSION_ITEM_DATA {
            target_system: target.system_id,
            target_component: target.component_id,
            seq: self.seq,
            frame: self.frame,
            command: self.command,
            current: self.current,
            autocontinue: self.autocontinue,
            param1: self.param1,
            param2: self.param2,
            param3: self.param3,
            param4: self.param4,
            x: self.x as f32,
            y: self.y as f32,
            z: self.z,
            mission_type: self.mission_type,
            ..Default::default()
        }
    }
}

/// Numbered NAV_WAYPOINTs from `(lat, lon, alt)` triples, ready to upload.
pub fn simple_mission(points: &[(f64, f64, f32)]) -> Vec<MissionItem> {
    points
        .iter()
        .zip(0u16..)
        .map(|(&(lat, lon, alt), seq)| MissionItem::waypoint(seq, lat, lon, alt))
        .collect()
}

pub fn is_global_frame(frame: MavFrame) -> bool {
    matches!(
        frame,
        MavFrame::MAV_FRAME_GLOBAL
            | MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT
            | MavFrame::MAV_FRAME_GLOBAL_INT
            | MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT
            | MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT
            | MavFrame::MAV_FRAME_GLOBAL_TERRAIN_ALT_INT
    )
}

/// Mission protocol input, decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionWireEvent {
    Count {
        count: u16,
        mission_type: MavMissionType,
    },
    /// MISSION_ITEM or MISSION_ITEM_INT, already converted
    Item(MissionItem),
    /// MISSION_REQUEST (`int == false`) or MISSION_REQUEST_INT
    Request {
        seq: u16,
        mission_type: MavMissionType,
        int: bool,
    },
    Ack {
        result: MavMissionResult,
        mission_type: MavMissionType,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemEncoding {
    /// MISSION_ITEM_INT
    Int,
    /// MISSION_ITEM
    Float,
}

/// Message the session must send on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MissionAction {
    SendCount {
        count: u16,
        mission_type: MavMissionType,
    },
    SendItem {
        item: MissionItem,
        encoding: ItemEncoding,
    },
    RequestList {
        mission_type: MavMissionType,
    },
    RequestItem {
        seq: u16,
        mission_type: MavMissionType,
    },
    SendAck {
        result: MavMissionResult,
        mission_type: MavMissionType,
    },
    ClearAll {
        mission_type: MavMissionType,
    },
    SetCurrent {
        seq: u16,
    },
}

impl MissionAction {
    pub fn to_message(&self, target: Target) -> MavMessage {
        let target_system = target.system_id;
        let target_component = target.component_id;
        match self {
            MissionAction::SendCount {
                count,
                mission_type,
            } => MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                target_system,
                target_component,
                count: *count,
                mission_type: *mission_type,
                ..Default::default()
            }),
            MissionAction::SendItem {
                item,
                encoding: ItemEncoding::Int,
            } => MavMessage::MISSION_ITEM_INT(item.to_item_int(target)),
            MissionAction::SendItem {
                item,
                encoding: ItemEncoding::Float,
            } => MavMessage::MISSION_ITEM(item.to_item(target)),
            MissionAction::RequestList { mission_type } => {
                MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
                    target_system,
                    target_component,
                    mission_type: *mission_type,
                })
            }
            MissionAction::RequestItem { seq, mission_type } => {
                MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                    target_system,
                    target_component,
                    seq: *seq,
                    mission_type: *mission_type,
                })
            }
            MissionAction::SendAck {
                result,
                mission_type,
            } => MavMessage::MISSION_ACK(MISSION_ACK_DATA {
                target_system,
                target_component,
                mavtype: *result,
                mission_type: *mission_type,
                ..Default::default()
            }),
            MissionAction::ClearAll { mission_type } => {
                MavMessage::MISSION_CLEAR_ALL(MISSION_CLEAR_ALL_DATA {
                    target_system,
                    target_component,
                    mission_type: *mission_type,
                })
            }
            MissionAction::SetCurrent { seq } => {
                MavMessage::MISSION_SET_CURRENT(MISSION_SET_CURRENT_DATA {
                    target_system,
                    target_component,
                    seq: *seq,
                })
            }
        }
    }
}

/// Why an upload ended without an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    SequenceOutOfRange { requested: u16, total: u16 },
    Cancelled,
    Disconnected,
    SendFailed,
    Stalled,
}

impl AbortReason {
    pub fn to_error(self) -> Option<SessionError> {
        match self {
            AbortReason::SequenceOutOfRange { requested, total } => {
                Some(SessionError::SequenceMismatch { requested, total })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum UploadState {
    #[default]
    Idle,
    CountSent {
        total: u16,
    },
    ItemRequested {
        seq: u16,
        total: u16,
    },
    Complete {
        result: MavMissionResult,
    },
    Aborted {
        reason: AbortReason,
    },
}

impl UploadState {
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            UploadState::CountSent { .. } | UploadState::ItemRequested { .. }
        )
    }
}

/// Outcome of one input to the state machine.
#[derive(Debug, Default, PartialEq)]
pub struct Transition {
    pub actions: Vec<MissionAction>,
    pub events: Vec<EventPayload>,
}

impl Transition {
    fn action(mut self, action: MissionAction) -> Self {
        self.actions.push(action);
        self
    }

    fn event(mut self, event: EventPayload) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug)]
struct Upload {
    items: Vec<MissionItem>,
    mission_type: MavMissionType,
}

#[derive(Debug)]
struct Download {
    slots: Vec<Option<MissionItem>>,
    expected: Option<u16>,
    mission_type: MavMissionType,
    /// Set by `request_list`; only then do we drive item requests and ack.
    active: bool,
    completed: bool,
}

impl Default for Download {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            expected: None,
            mission_type: MavMissionType::MAV_MISSION_TYPE_MISSION,
            active: false,
            completed: false,
        }
    }
}

impl Download {
    fn filled(&self, total: u16) -> u16 {
        let n = self
            .slots
            .iter()
            .take(usize::from(total))
            .filter(|slot| slot.is_some())
            .count();
        u16::try_from(n).unwrap_or(u16::MAX)
    }

    fn first_missing(&self, total: u16) -> Option<u16> {
        (0..total).find(|&seq| {
            self.slots
                .get(usize::from(seq))
                .map_or(true, |slot| slot.is_none())
        })
    }

    /// Received items, bounded by the announced count once it is known.
    fn items(&self) -> Vec<MissionItem> {
        let bound = self.expected.map_or(self.slots.len(), usize::from);
        self.slots.iter().take(bound).flatten().cloned().collect()
    }
}

#[derive(Debug)]
pub struct MissionTransfer {
    state: UploadState,
    upload: Option<Upload>,
    download: Download,
    clear_pending: Option<MavMissionType>,
    stall_timeout: Option<Duration>,
    last_activity: Instant,
}

impl Default for MissionTransfer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MissionTransfer {
    /// `stall_timeout` of `None` waits forever for the next request.
    pub fn new(stall_timeout: Option<Duration>) -> Self {
        Self {
            state: UploadState::Idle,
            upload: None,
            download: Download::default(),
            clear_pending: None,
            stall_timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn upload_state(&self) -> UploadState {
        self.state
    }

    pub fn is_upload_in_progress(&self) -> bool {
        self.state.is_in_progress()
    }

    /// Items received so far, in sequence order.
    pub fn downloaded_items(&self) -> Vec<MissionItem> {
        self.download.items()
    }

    pub fn download_expected(&self) -> Option<u16> {
        self.download.expected
    }

    pub fn is_download_complete(&self) -> bool {
        self.download.completed
    }

    /// Begins an upload. `seq` is renumbered to the list index and
    /// `mission_type` stamped onto every item.
    pub fn start_upload(
        &mut self,
        items: Vec<MissionItem>,
        mission_type: MavMissionType,
    ) -> Result<Transition> {
        if self.state.is_in_progress() {
            return Err(SessionError::UploadInProgress);
        }
        let total = u16::try_from(items.len())
            .map_err(|_| SessionError::Encode(format!("{} mission items", items.len())))?;

        let items = items
            .into_iter()
            .zip(0u16..)
            .map(|(item, seq)| MissionItem {
                seq,
                mission_type,
                ..item
            })
            .collect();

        self.upload = Some(Upload {
            items,
            mission_type,
        });
        self.state = UploadState::CountSent { total };
        self.last_activity = Instant::now();
        info!("Starting mission upload of {} items", total);

        Ok(Transition::default().action(MissionAction::SendCount {
            count: total,
            mission_type,
        }))
    }

    /// Abandons an in-progress upload. No-op otherwise.
    pub fn complete_upload(&mut self) -> Transition {
        self.abort_upload(AbortReason::Cancelled)
    }

    pub fn abort_upload(&mut self, reason: AbortReason) -> Transition {
        if !self.state.is_in_progress() {
            return Transition::default();
        }
        warn!("Mission upload aborted: {:?}", reason);
        self.state = UploadState::Aborted { reason };
        self.upload = None;
        Transition::default().event(EventPayload::MissionUploadAborted(reason))
    }

    pub fn request_list(&mut self, mission_type: MavMissionType) -> Transition {
        self.download = Download {
            mission_type,
            active: true,
            ..Download::default()
        };
        self.last_activity = Instant::now();
        Transition::default().action(MissionAction::RequestList { mission_type })
    }

    pub fn request_item(&mut self, seq: u16, mission_type: MavMissionType) -> Transition {
        Transition::default().action(MissionAction::RequestItem { seq, mission_type })
    }

    pub fn clear(&mut self, mission_type: MavMissionType) -> Transition {
        self.clear_pending = Some(mission_type);
        Transition::default().action(MissionAction::ClearAll { mission_type })
    }

    pub fn set_current(&mut self, seq: u16) -> Transition {
        Transition::default().action(MissionAction::SetCurrent { seq })
    }

    /// Drops all transfer state. An in-progress upload ends as
    /// `Aborted(Disconnected)`; the returned transition carries that event.
    pub fn reset(&mut self) -> Transition {
        let transition = self.abort_upload(AbortReason::Disconnected);
        self.upload = None;
        self.download = Download::default();
        self.clear_pending = None;
        transition
    }

    pub fn on_event(&mut self, event: MissionWireEvent) -> Transition {
        match event {
            MissionWireEvent::Request {
                seq,
                mission_type,
                int,
            } => self.on_request(seq, mission_type, int),
            MissionWireEvent::Ack {
                result,
                mission_type,
            } => self.on_ack(result, mission_type),
            MissionWireEvent::Count {
                count,
                mission_type,
            } => self.on_count(count, mission_type),
            MissionWireEvent::Item(item) => self.on_item(item),
        }
    }

    /// Stall handling, driven periodically by the session. Does nothing
    /// unless a stall timeout is configured.
    pub fn tick(&mut self, now: Instant) -> Transition {
        let Some(timeout) = self.stall_timeout else {
            return Transition::default();
        };
        if now.saturating_duration_since(self.last_activity) < timeout {
            return Transition::default();
        }

        if self.state.is_in_progress() {
            return self.abort_upload(AbortReason::Stalled);
        }

        let download = &self.download;
        if !download.active || download.completed {
            return Transition::default();
        }
        self.last_activity = now;
        let mission_type = download.mission_type;
        match download.expected {
            None => {
                debug!("Mission download stalled before count, re-requesting list");
                Transition::default().action(MissionAction::RequestList { mission_type })
            }
            Some(total) => match download.first_missing(total) {
                Some(seq) => {
                    debug!("Mission download stalled, re-requesting item {}", seq);
                    Transition::default().action(MissionAction::RequestItem { seq, mission_type })
                }
                None => Transition::default(),
            },
        }
    }

    fn on_request(&mut self, seq: u16, mission_type: MavMissionType, int: bool) -> Transition {
        let Some(upload) = self.upload.as_ref().filter(|_| self.state.is_in_progress()) else {
            debug!("Ignoring request for mission item {} with no upload in progress", seq);
            return Transition::default();
        };
        if mission_type != upload.mission_type {
            debug!(
                "Ignoring request for {:?} item {} during {:?} upload",
                mission_type, seq, upload.mission_type
            );
            return Transition::default();
        }

        let total = u16::try_from(upload.items.len()).unwrap_or(u16::MAX);
        let Some(item) = upload.items.get(usize::from(seq)).cloned() else {
            warn!(
                "Vehicle requested mission item {} but upload holds {} items",
                seq, total
            );
            return self.abort_upload(AbortReason::SequenceOutOfRange {
                requested: seq,
                total,
            });
        };

        self.state = UploadState::ItemRequested { seq, total };
        self.last_activity = Instant::now();
        debug!("Sending mission item {}/{}", seq + 1, total);

        let encoding = if int {
            ItemEncoding::Int
        } else {
            ItemEncoding::Float
        };
        Transition::default()
            .action(MissionAction::SendItem { item, encoding })
            .event(EventPayload::MissionUploadProgress { seq, total })
    }

    fn on_ack(&mut self, result: MavMissionResult, mission_type: MavMissionType) -> Transition {
        if self.state.is_in_progress() {
            let accepted = result == MavMissionResult::MAV_MISSION_ACCEPTED;
            if accepted {
                info!("Mission upload complete");
            } else {
                warn!("Mission upload finished with {:?}", result);
            }
            self.state = UploadState::Complete { result };
            self.upload = None;
            return Transition::default()
                .event(EventPayload::MissionUploadComplete { result, accepted });
        }

        if self.clear_pending.take().is_some() {
            info!("Mission cleared ({:?})", result);
            return Transition::default().event(EventPayload::MissionCleared { mission_type });
        }

        Transition::default().event(EventPayload::MissionAck {
            result,
            mission_type,
        })
    }

    fn on_count(&mut self, count: u16, mission_type: MavMissionType) -> Transition {
        let download = &mut self.download;
        if download.completed && download.expected == Some(count) {
            debug!("Duplicate MISSION_COUNT {} after completed download", count);
            return Transition::default();
        }
        if download.completed {
            debug!("New MISSION_COUNT after completed download, dropping old items");
            download.slots.clear();
        }
        download.expected = Some(count);
        download.mission_type = mission_type;
        download.completed = false;
        if download.slots.len() < usize::from(count) {
            download.slots.resize(usize::from(count), None);
        }
        self.last_activity = Instant::now();
        info!("Vehicle reports {} mission items", count);

        let transition = Transition::default().event(EventPayload::MissionCount {
            count,
            mission_type,
        });
        self.advance_download(transition, count)
    }

    fn on_item(&mut self, item: MissionItem) -> Transition {
        let seq = usize::from(item.seq);
        let download = &mut self.download;
        if download.slots.len() <= seq {
            download.slots.resize(seq + 1, None);
        }
        download.slots[seq] = Some(item.clone());
        self.last_activity = Instant::now();

        let transition = Transition::default().event(EventPayload::MissionItem(item));
        match self.download.expected {
            Some(total) if !self.download.completed => {
                let received = self.download.filled(total);
                let transition = transition
                    .event(EventPayload::MissionDownloadProgress { received, total });
                self.advance_download(transition, total)
            }
            _ => transition,
        }
    }

    /// Completes the download if every slot is filled, otherwise asks for the
    /// lowest missing one when we are driving the transfer.
    fn advance_download(&mut self, transition: Transition, total: u16) -> Transition {
        let download = &mut self.download;
        let mission_type = download.mission_type;

        match download.first_missing(total) {
            None => {
                download.completed = true;
                let items: Vec<MissionItem> = download
                    .slots
                    .iter()
                    .take(usize::from(total))
                    .flatten()
                    .cloned()
                    .collect();
                info!("Mission download complete ({} items)", items.len());
                let mut transition =
                    transition.event(EventPayload::MissionDownloadComplete(items));
                if download.active {
                    download.active = false;
                    transition = transition.action(MissionAction::SendAck {
                        result: MavMissionResult::MAV_MISSION_ACCEPTED,
                        mission_type,
                    });
                }
                transition
            }
            Some(seq) if download.active => {
                transition.action(MissionAction::RequestItem { seq, mission_type })
            }
            Some(_) => transition,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    const TARGET: Target = Target {
        system_id: 1,
        component_id: 1,
    };
    const MISSION: MavMissionType = MavMissionType::MAV_MISSION_TYPE_MISSION;

    fn plan(n: u16) -> Vec<MissionItem> {
        (0..n)
            .map(|i| MissionItem::waypoint(99, 47.0 + f64::from(i) * 0.001, 8.5, 50.0))
            .collect()
    }

    fn request(seq: u16) -> MissionWireEvent {
        MissionWireEvent::Request {
            seq,
            mission_type: MISSION,
            int: true,
        }
    }

    fn kinds(t: &Transition) -> Vec<EventKind> {
        t.events.iter().map(EventPayload::kind).collect()
    }

    #[test]
    fn test_upload_serves_each_request() {
        let mut mt = MissionTransfer::default();
        let items = plan(3);
        let start = mt.start_upload(items.clone(), MISSION).expect("idle");
        assert_eq!(
            start.actions,
            vec![MissionAction::SendCount {
                count: 3,
                mission_type: MISSION
            }]
        );
        assert_eq!(mt.upload_state(), UploadState::CountSent { total: 3 });

        for seq in [0u16, 2, 1] {
            let t = mt.on_event(request(seq));
            match t.actions.as_slice() {
                [MissionAction::SendItem { item, encoding }] => {
                    assert_eq!(item.seq, seq);
                    assert_eq!(item.x, items[usize::from(seq)].x);
                    assert_eq!(*encoding, ItemEncoding::Int);
                }
                other => panic!("unexpected actions {:?}", other),
            }
            assert_eq!(kinds(&t), vec![EventKind::MissionUploadProgress]);
        }
        assert_eq!(mt.upload_state(), UploadState::ItemRequested { seq: 1, total: 3 });

        let done = mt.on_event(MissionWireEvent::Ack {
            result: MavMissionResult::MAV_MISSION_ACCEPTED,
            mission_type: MISSION,
        });
        assert_eq!(
            done.events,
            vec![EventPayload::MissionUploadComplete {
                result: MavMissionResult::MAV_MISSION_ACCEPTED,
                accepted: true
            }]
        );
        assert!(!mt.is_upload_in_progress());

        // Requests after completion are ignored
        assert!(mt.on_event(request(0)).is_empty());
    }

    #[test]
    fn test_out_of_range_request_aborts() {
        let mut mt = MissionTransfer::default();
        mt.start_upload(plan(2), MISSION).expect("idle");
        mt.on_event(request(0));

        let t = mt.on_event(request(2));
        assert!(t.actions.is_empty());
        let reason = AbortReason::SequenceOutOfRange {
            requested: 2,
            total: 2,
        };
        assert_eq!(t.events, vec![EventPayload::MissionUploadAborted(reason)]);
        assert_eq!(mt.upload_state(), UploadState::Aborted { reason });
        assert!(matches!(
            reason.to_error(),
            Some(SessionError::SequenceMismatch {
                requested: 2,
                total: 2
            })
        ));

        // Nothing more is sent for this upload
        assert!(mt.on_event(request(1)).actions.is_empty());
    }

    #[test]
    fn test_second_upload_rejected_while_in_progress() {
        let mut mt = MissionTransfer::default();
        mt.start_upload(plan(1), MISSION).expect("idle");
        assert!(matches!(
            mt.start_upload(plan(1), MISSION),
            Err(SessionError::UploadInProgress)
        ));

        // Force-abandon is idempotent
        assert_eq!(mt.complete_upload().events.len(), 1);
        assert!(mt.complete_upload().is_empty());
        assert!(mt.start_upload(plan(1), MISSION).is_ok());
    }

    #[test]
    fn test_reset_aborts_upload_and_next_start_is_fresh() {
        let mut mt = MissionTransfer::default();
        mt.start_upload(plan(4), MISSION).expect("idle");
        mt.on_event(request(0));
        mt.on_event(request(1));

        let t = mt.reset();
        assert_eq!(
            t.events,
            vec![EventPayload::MissionUploadAborted(AbortReason::Disconnected)]
        );
        assert_eq!(
            mt.upload_state(),
            UploadState::Aborted {
                reason: AbortReason::Disconnected
            }
        );

        let start = mt.start_upload(plan(2), MISSION).expect("fresh upload");
        assert_eq!(start.actions.len(), 1);
        assert_eq!(mt.upload_state(), UploadState::CountSent { total: 2 });
        // A stale request for the old list's range is now out of range
        let t = mt.on_event(request(3));
        assert_eq!(kinds(&t), vec![EventKind::MissionUploadAborted]);
    }

    #[test]
    fn test_legacy_request_gets_float_item() {
        let mut mt = MissionTransfer::default();
        mt.start_upload(plan(1), MISSION).expect("idle");
        let t = mt.on_event(MissionWireEvent::Request {
            seq: 0,
            mission_type: MISSION,
            int: false,
        });
        let [MissionAction::SendItem { encoding, .. }] = t.actions.as_slice() else {
            panic!("expected one item");
        };
        assert_eq!(*encoding, ItemEncoding::Float);
        assert!(matches!(
            t.actions[0].to_message(TARGET),
            MavMessage::MISSION_ITEM(_)
        ));
    }

    #[test]
    fn test_item_int_encoding() {
        let wp = MissionItem::waypoint(0, 47.397_742_1, 8.545_594_2, 30.0);
        let data = wp.to_item_int(TARGET);
        assert_eq!(data.x, 473_977_421);
        assert_eq!(data.y, 85_455_942);
        assert_eq!(data.target_system, 1);
        let back = MissionItem::from_item_int(&data);
        assert!((back.x - wp.x).abs() < 1e-7);

        let local = MissionItem {
            frame: MavFrame::MAV_FRAME_LOCAL_NED,
            x: 12.9,
            y: -3.2,
            ..wp
        };
        let data = local.to_item_int(TARGET);
        assert_eq!((data.x, data.y), (12, -3));
    }

    #[test]
    fn test_download_out_of_order_completes_once() {
        let mut mt = MissionTransfer::default();
        let count = mt.on_event(MissionWireEvent::Count {
            count: 5,
            mission_type: MISSION,
        });
        assert_eq!(kinds(&count), vec![EventKind::MissionCount]);

        let mut completions = 0;
        for seq in [4u16, 2, 0, 3, 1] {
            let t = mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(
                seq,
                f32::from(seq),
            )));
            completions += kinds(&t)
                .iter()
                .filter(|k| **k == EventKind::MissionDownloadComplete)
                .count();
            if seq != 1 {
                assert_eq!(completions, 0);
            }
        }
        assert_eq!(completions, 1);

        let items = mt.downloaded_items();
        assert_eq!(
            items.iter().map(|i| i.seq).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );
        assert!(mt.is_download_complete());

        // Late duplicate overwrites but does not re-complete
        let t = mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(2, 99.0)));
        assert_eq!(kinds(&t), vec![EventKind::MissionItem]);
        assert_eq!(mt.downloaded_items()[2].z, 99.0);
    }

    #[test]
    fn test_item_constructors() {
        let takeoff = MissionItem::takeoff(0, 30.0);
        assert_eq!(takeoff.current, 1);
        assert!(takeoff.param4.is_nan());

        let wp = MissionItem::waypoint_with(
            1,
            47.0,
            8.5,
            50.0,
            WaypointParams {
                hold_time: 5.0,
                accept_radius: 2.0,
                ..WaypointParams::default()
            },
        );
        assert_eq!(wp.current, 0);
        assert_eq!((wp.param1, wp.param2, wp.param3), (5.0, 2.0, 0.0));
        assert!(wp.param4.is_nan());
        assert!(wp.to_item_int(TARGET).param4.is_nan());

        let land = MissionItem::land_with(
            0,
            47.1,
            8.6,
            LandParams {
                abort_alt: 15.0,
                precision_land: 2,
                yaw: 90.0,
            },
        );
        assert_eq!(land.current, 0, "land is never the start item");
        assert_eq!((land.param1, land.param2, land.param4), (15.0, 2.0, 90.0));
        assert_eq!(land.z, 0.0);
    }

    #[test]
    fn test_simple_mission_numbers_waypoints() {
        let items = simple_mission(&[(47.0, 8.5, 40.0), (47.001, 8.501, 45.0)]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].seq, 0);
        assert_eq!(items[0].current, 1);
        assert_eq!(items[1].seq, 1);
        assert_eq!(items[1].command, MavCmd::MAV_CMD_NAV_WAYPOINT);
        assert_eq!(items[1].z, 45.0);
        assert!(simple_mission(&[]).is_empty());
    }

    #[test]
    fn test_new_count_after_completed_download_starts_empty() {
        let mut mt = MissionTransfer::default();
        mt.on_event(MissionWireEvent::Count {
            count: 3,
            mission_type: MISSION,
        });
        for seq in 0..3 {
            mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(seq, 10.0)));
        }
        assert!(mt.is_download_complete());

        // A smaller list must not complete from the previous download's items
        let t = mt.on_event(MissionWireEvent::Count {
            count: 2,
            mission_type: MISSION,
        });
        assert_eq!(kinds(&t), vec![EventKind::MissionCount]);
        assert!(!mt.is_download_complete());
        assert!(mt.downloaded_items().is_empty());

        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(0, 20.0)));
        let t = mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(1, 20.0)));
        assert!(kinds(&t).contains(&EventKind::MissionDownloadComplete));
        assert_eq!(mt.downloaded_items().len(), 2);
    }

    #[test]
    fn test_downloaded_items_bounded_by_count() {
        let mut mt = MissionTransfer::default();
        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(4, 10.0)));
        mt.on_event(MissionWireEvent::Count {
            count: 2,
            mission_type: MISSION,
        });
        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(0, 10.0)));
        assert_eq!(
            mt.downloaded_items()
                .iter()
                .map(|i| i.seq)
                .collect::<Vec<_>>(),
            vec![0]
        );
    }

    #[test]
    fn test_item_before_count_is_kept() {
        let mut mt = MissionTransfer::default();
        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(1, 10.0)));
        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(0, 10.0)));
        let t = mt.on_event(MissionWireEvent::Count {
            count: 2,
            mission_type: MISSION,
        });
        assert_eq!(
            kinds(&t),
            vec![EventKind::MissionCount, EventKind::MissionDownloadComplete]
        );
    }

    #[test]
    fn test_requested_download_drives_item_requests() {
        let mut mt = MissionTransfer::default();
        let t = mt.request_list(MISSION);
        assert_eq!(
            t.actions,
            vec![MissionAction::RequestList {
                mission_type: MISSION
            }]
        );

        let t = mt.on_event(MissionWireEvent::Count {
            count: 2,
            mission_type: MISSION,
        });
        assert_eq!(
            t.actions,
            vec![MissionAction::RequestItem {
                seq: 0,
                mission_type: MISSION
            }]
        );

        let t = mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(0, 20.0)));
        assert_eq!(
            t.actions,
            vec![MissionAction::RequestItem {
                seq: 1,
                mission_type: MISSION
            }]
        );

        let t = mt.on_event(MissionWireEvent::Item(MissionItem::land(1, 47.0, 8.0)));
        assert_eq!(
            t.actions,
            vec![MissionAction::SendAck {
                result: MavMissionResult::MAV_MISSION_ACCEPTED,
                mission_type: MISSION
            }]
        );
    }

    #[test]
    fn test_zero_count_completes_immediately() {
        let mut mt = MissionTransfer::default();
        mt.request_list(MISSION);
        let t = mt.on_event(MissionWireEvent::Count {
            count: 0,
            mission_type: MISSION,
        });
        assert_eq!(
            t.events,
            vec![
                EventPayload::MissionCount {
                    count: 0,
                    mission_type: MISSION
                },
                EventPayload::MissionDownloadComplete(vec![])
            ]
        );
        assert_eq!(t.actions.len(), 1);
    }

    #[test]
    fn test_clear_ack_reports_cleared() {
        let mut mt = MissionTransfer::default();
        let t = mt.clear(MISSION);
        assert_eq!(
            t.actions,
            vec![MissionAction::ClearAll {
                mission_type: MISSION
            }]
        );
        let ack = MissionWireEvent::Ack {
            result: MavMissionResult::MAV_MISSION_ACCEPTED,
            mission_type: MISSION,
        };
        assert_eq!(kinds(&mt.on_event(ack.clone())), vec![EventKind::MissionCleared]);
        assert_eq!(kinds(&mt.on_event(ack)), vec![EventKind::MissionAck]);
    }

    #[test]
    fn test_stall_timeout() {
        let mut mt = MissionTransfer::new(Some(Duration::from_millis(100)));
        mt.start_upload(plan(2), MISSION).expect("idle");
        assert!(mt.tick(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_millis(150);
        let t = mt.tick(later);
        assert_eq!(
            t.events,
            vec![EventPayload::MissionUploadAborted(AbortReason::Stalled)]
        );

        let mut never = MissionTransfer::default();
        never.start_upload(plan(2), MISSION).expect("idle");
        assert!(never
            .tick(Instant::now() + Duration::from_secs(3600))
            .is_empty());
    }

    #[test]
    fn test_stalled_download_re_requests_missing_item() {
        let mut mt = MissionTransfer::new(Some(Duration::from_millis(100)));
        mt.request_list(MISSION);
        mt.on_event(MissionWireEvent::Count {
            count: 3,
            mission_type: MISSION,
        });
        mt.on_event(MissionWireEvent::Item(MissionItem::takeoff(0, 5.0)));

        let t = mt.tick(Instant::now() + Duration::from_millis(200));
        assert_eq!(
            t.actions,
            vec![MissionAction::RequestItem {
                seq: 1,
                mission_type: MISSION
            }]
        );
    }
}
