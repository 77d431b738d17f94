//! Inbound message dispatch.
//!
//! A decoded [`MavMessage`] is first narrowed into [`InboundMessage`], the set
//! of messages the session understands, with units already normalized. Anything
//! else becomes [`InboundMessage::Unrecognized`] and is ignored. Each
//! recognised message updates the vehicle cache or one of the protocol state
//! machines, then publishes its events in order.

use crate::error::{Result, SessionError};
use crate::event::EventPayload;
use crate::event_bus::EventBus;
use crate::mission::{MissionAction, MissionItem, MissionTransfer, MissionWireEvent, Transition};
use crate::params::{Parameter, ParameterSync};
use crate::state::VehicleStateCache;
use crate::telemetry::{
    Attitude, BatteryStatus, CommandAck, GlobalPosition, GpsInfo, HeartbeatInfo, HomePosition,
    MissionCurrent, StatusText, SysStatus, VfrHud,
};
use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Messages the session acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Heartbeat(HeartbeatInfo),
    Attitude(Attitude),
    GlobalPosition(GlobalPosition),
    GpsRaw(GpsInfo),
    VfrHud(VfrHud),
    BatteryStatus(BatteryStatus),
    SysStatus(SysStatus),
    StatusText(StatusText),
    ParamValue(Parameter),
    CommandAck(CommandAck),
    MissionCurrent(MissionCurrent),
    MissionItemReached { seq: u16 },
    HomePosition(HomePosition),
    Mission(MissionWireEvent),
    /// Valid message the session has no handler for
    Unrecognized { id: u32, name: &'static str },
}

impl InboundMessage {
    pub fn decode(header: &MavHeader, message: &MavMessage) -> Result<Self> {
        let inbound = match message {
            MavMessage::HEARTBEAT(data) => {
                InboundMessage::Heartbeat(HeartbeatInfo::from_mavlink(header, data))
            }
            MavMessage::ATTITUDE(data) => InboundMessage::Attitude(data.into()),
            MavMessage::GLOBAL_POSITION_INT(data) => InboundMessage::GlobalPosition(data.into()),
            MavMessage::GPS_RAW_INT(data) => InboundMessage::GpsRaw(data.into()),
            MavMessage::VFR_HUD(data) => InboundMessage::VfrHud(data.into()),
            MavMessage::BATTERY_STATUS(data) => InboundMessage::BatteryStatus(data.into()),
            MavMessage::SYS_STATUS(data) => InboundMessage::SysStatus(data.into()),
            MavMessage::STATUSTEXT(data) => InboundMessage::StatusText(data.into()),
            MavMessage::PARAM_VALUE(data) => {
                InboundMessage::ParamValue(Parameter::from_mavlink(data)?)
            }
            MavMessage::COMMAND_ACK(data) => InboundMessage::CommandAck(data.into()),
            MavMessage::MISSION_CURRENT(data) => InboundMessage::MissionCurrent(data.into()),
            MavMessage::MISSION_ITEM_REACHED(data) => {
                InboundMessage::MissionItemReached { seq: data.seq }
            }
            MavMessage::HOME_POSITION(data) => InboundMessage::HomePosition(data.into()),
            MavMessage::MISSION_COUNT(data) => InboundMessage::Mission(MissionWireEvent::Count {
                count: data.count,
                mission_type: data.mission_type,
            }),
            MavMessage::MISSION_ITEM_INT(data) => InboundMessage::Mission(MissionWireEvent::Item(
                MissionItem::from_item_int(data),
            )),
            MavMessage::MISSION_ITEM(data) => {
                if !data.x.is_finite() || !data.y.is_finite() {
                    return Err(SessionError::malformed(
                        "MISSION_ITEM",
                        format!("non-finite coordinates for item {}", data.seq),
                    ));
                }
                InboundMessage::Mission(MissionWireEvent::Item(MissionItem::from_item(data)))
            }
            MavMessage::MISSION_REQUEST_INT(data) => {
                InboundMessage::Mission(MissionWireEvent::Request {
                    seq: data.seq,
                    mission_type: data.mission_type,
                    int: true,
                })
            }
            MavMessage::MISSION_REQUEST(data) => InboundMessage::Mission(MissionWireEvent::Request {
                seq: data.seq,
                mission_type: data.mission_type,
                int: false,
            }),
            MavMessage::MISSION_ACK(data) => InboundMessage::Mission(MissionWireEvent::Ack {
                result: data.mavtype,
                mission_type: data.mission_type,
            }),
            other => InboundMessage::Unrecognized {
                id: other.message_id(),
                name: other.message_name(),
            },
        };
        Ok(inbound)
    }
}

/// Counters kept by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub handled: AtomicU64,
    pub malformed: AtomicU64,
    pub unrecognized: AtomicU64,
}

pub struct MessageDispatcher {
    bus: Arc<EventBus>,
    vehicle: Arc<VehicleStateCache>,
    params: Arc<Mutex<ParameterSync>>,
    mission: Arc<Mutex<MissionTransfer>>,
    stats: DispatchStats,
}

impl MessageDispatcher {
    pub fn new(
        bus: Arc<EventBus>,
        vehicle: Arc<VehicleStateCache>,
        params: Arc<Mutex<ParameterSync>>,
        mission: Arc<Mutex<MissionTransfer>>,
    ) -> Self {
        Self {
            bus,
            vehicle,
            params,
            mission,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Handles one decoded message. Returns the mission messages that must be
    /// sent in response; the caller sends them once this returns, so no lock
    /// is held during I/O.
    pub fn dispatch(&self, header: &MavHeader, message: &MavMessage) -> Vec<MissionAction> {
        match InboundMessage::decode(header, message) {
            Ok(inbound) => self.handle(inbound),
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping {} from {}/{}: {}",
                    message.message_name(),
                    header.system_id,
                    header.component_id,
                    e
                );
                Vec::new()
            }
        }
    }

    pub fn handle(&self, inbound: InboundMessage) -> Vec<MissionAction> {
        let payload = match inbound {
            InboundMessage::Heartbeat(hb) => {
                self.vehicle.set_heartbeat(hb.clone());
                EventPayload::Heartbeat(hb)
            }
            InboundMessage::Attitude(attitude) => {
                self.vehicle.set_attitude(attitude);
                EventPayload::Attitude(attitude)
            }
            InboundMessage::GlobalPosition(position) => {
                self.vehicle.set_position(position);
                EventPayload::Position(position)
            }
            InboundMessage::GpsRaw(gps) => {
                self.vehicle.set_gps(gps);
                EventPayload::GpsInfo(gps)
            }
            InboundMessage::VfrHud(hud) => {
                self.vehicle.set_vfr_hud(hud);
                EventPayload::VfrHud(hud)
            }
            InboundMessage::BatteryStatus(battery) => {
                self.vehicle.set_battery(battery.clone());
                EventPayload::BatteryStatus(battery)
            }
            InboundMessage::SysStatus(status) => {
                self.vehicle.set_sys_status(status);
                EventPayload::SysStatus(status)
            }
            InboundMessage::StatusText(text) => EventPayload::StatusText(text),
            InboundMessage::CommandAck(ack) => EventPayload::CommandAck(ack),
            InboundMessage::HomePosition(home) => {
                self.vehicle.set_home(home);
                EventPayload::HomePosition(home)
            }
            InboundMessage::MissionCurrent(current) => {
                self.vehicle.set_mission_current(current);
                EventPayload::MissionCurrent(current)
            }
            InboundMessage::MissionItemReached { seq } => {
                self.vehicle.set_last_reached_seq(seq);
                EventPayload::MissionItemReached { seq }
            }
            InboundMessage::ParamValue(param) => {
                let completed = self.params.lock().on_param_value(param.clone());
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
                self.bus.publish(EventPayload::ParameterReceived(param));
                if let Some(all) = completed {
                    self.bus.publish(EventPayload::AllParametersReceived(all));
                }
                return Vec::new();
            }
            InboundMessage::Mission(wire) => {
                let transition = self.mission.lock().on_event(wire);
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
                return self.apply(transition);
            }
            InboundMessage::Unrecognized { id, name } => {
                self.stats.unrecognized.fetch_add(1, Ordering::Relaxed);
                trace!("No handler for {} ({})", name, id);
                return Vec::new();
            }
        };

        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(payload);
        Vec::new()
    }

    /// Publishes a transition's events and hands back its actions.
    pub fn apply(&self, transition: Transition) -> Vec<MissionAction> {
        for event in transition.events {
            self.bus.publish(event);
        }
        transition.actions
    }
}
