//! Typed events produced by the session.

use crate::connection::ConnectionState;
use crate::mission::{AbortReason, MissionItem};
use crate::params::Parameter;
use crate::telemetry::{
    Attitude, BatteryStatus, CommandAck, GlobalPosition, GpsInfo, HeartbeatInfo, HomePosition,
    MissionCurrent, StatusText, SysStatus, VfrHud,
};
use mavlink::common::{MavMissionResult, MavMissionType};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Discriminant used to subscribe to a class of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Heartbeat,
    Attitude,
    Position,
    StatusText,
    BatteryStatus,
    GpsInfo,
    VfrHud,
    ParameterReceived,
    AllParametersReceived,
    SysStatus,
    CommandAck,
    ConnectionStateChanged,
    MissionCount,
    MissionItem,
    MissionDownloadProgress,
    MissionDownloadComplete,
    MissionUploadProgress,
    MissionUploadComplete,
    MissionUploadAborted,
    MissionCurrent,
    MissionItemReached,
    MissionAck,
    MissionCleared,
    HomePosition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Heartbeat(HeartbeatInfo),
    Attitude(Attitude),
    Position(GlobalPosition),
    StatusText(StatusText),
    BatteryStatus(BatteryStatus),
    GpsInfo(GpsInfo),
    VfrHud(VfrHud),
    ParameterReceived(Parameter),
    /// Name to value for every parameter received in this sync cycle
    AllParametersReceived(BTreeMap<String, f32>),
    SysStatus(SysStatus),
    CommandAck(CommandAck),
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    MissionCount {
        count: u16,
        mission_type: MavMissionType,
    },
    MissionItem(MissionItem),
    MissionDownloadProgress {
        received: u16,
        total: u16,
    },
    MissionDownloadComplete(Vec<MissionItem>),
    MissionUploadProgress {
        seq: u16,
        total: u16,
    },
    MissionUploadComplete {
        result: MavMissionResult,
        accepted: bool,
    },
    MissionUploadAborted(AbortReason),
    MissionCurrent(MissionCurrent),
    MissionItemReached {
        seq: u16,
    },
    MissionAck {
        result: MavMissionResult,
        mission_type: MavMissionType,
    },
    MissionCleared {
        mission_type: MavMissionType,
    },
    HomePosition(HomePosition),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Heartbeat(_) => EventKind::Heartbeat,
            EventPayload::Attitude(_) => EventKind::Attitude,
            EventPayload::Position(_) => EventKind::Position,
            EventPayload::StatusText(_) => EventKind::StatusText,
            EventPayload::BatteryStatus(_) => EventKind::BatteryStatus,
            EventPayload::GpsInfo(_) => EventKind::GpsInfo,
            EventPayload::VfrHud(_) => EventKind::VfrHud,
            EventPayload::ParameterReceived(_) => EventKind::ParameterReceived,
            EventPayload::AllParametersReceived(_) => EventKind::AllParametersReceived,
            EventPayload::SysStatus(_) => EventKind::SysStatus,
            EventPayload::CommandAck(_) => EventKind::CommandAck,
            EventPayload::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            EventPayload::MissionCount { .. } => EventKind::MissionCount,
            EventPayload::MissionItem(_) => EventKind::MissionItem,
            EventPayload::MissionDownloadProgress { .. } => EventKind::MissionDownloadProgress,
            EventPayload::MissionDownloadComplete(_) => EventKind::MissionDownloadComplete,
            EventPayload::MissionUploadProgress { .. } => EventKind::MissionUploadProgress,
            EventPayload::MissionUploadComplete { .. } => EventKind::MissionUploadComplete,
            EventPayload::MissionUploadAborted(_) => EventKind::MissionUploadAborted,
            EventPayload::MissionCurrent(_) => EventKind::MissionCurrent,
            EventPayload::MissionItemReached { .. } => EventKind::MissionItemReached,
            EventPayload::MissionAck { .. } => EventKind::MissionAck,
            EventPayload::MissionCleared { .. } => EventKind::MissionCleared,
            EventPayload::HomePosition(_) => EventKind::HomePosition,
        }
    }
}

/// An immutable, timestamped event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    payload: EventPayload,
    timestamp: SystemTime,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: SystemTime::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl From<EventPayload> for Event {
    fn from(payload: EventPayload) -> Self {
        Self::new(payload)
    }
}
