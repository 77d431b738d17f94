//! MAVLink vehicle session layer.
//!
//! [`ConnectionManager`] opens a serial, TCP or UDP link to a flight
//! controller, waits for its heartbeat and keeps a session task running that
//! turns inbound traffic into a typed [`VehicleStateCache`] and ordered
//! [`Event`]s on an [`EventBus`]. Parameter sync and the mission
//! upload/download protocols are driven from the same task.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod endpoints {
    pub mod serial;
    pub mod tcp;
    pub mod udp;
}
pub mod error;
pub mod event;
pub mod event_bus;
pub mod framing;
pub mod link;
pub mod mission;
pub mod outbound;
pub mod params;
pub mod state;
pub mod telemetry;

pub use config::{Config, EndpointConfig, EndpointMode};
pub use connection::{ConnectionManager, ConnectionState, LinkStats};
pub use error::{Result, SessionError};
pub use event::{Event, EventKind, EventPayload};
pub use event_bus::{EventBus, ListenerFailure, ListenerId};
pub use mission::{
    simple_mission, AbortReason, LandParams, MissionItem, TakeoffParams, UploadState,
    WaypointParams,
};
pub use outbound::{Command, DataStream, Target};
pub use params::{ParamValue, Parameter};
pub use state::{VehicleSnapshot, VehicleStateCache};
