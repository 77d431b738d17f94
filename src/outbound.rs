//! Builders for messages sent to the vehicle.
//!
//! Everything here is a pure encode: commands are fire-and-forget, and the
//! matching COMMAND_ACK surfaces later as an event.

use crate::error::{Result, SessionError};
use crate::params::{encode_param_id, ParamValue};
use mavlink::common::{
    MavCmd, MavDataStream, MavMessage, MavModeFlag, COMMAND_LONG_DATA, PARAM_REQUEST_LIST_DATA,
    PARAM_REQUEST_READ_DATA, PARAM_SET_DATA, REQUEST_DATA_STREAM_DATA,
};
use mavlink::Message;

/// Magic value for param2 of arm/disarm that bypasses pre-arm checks.
pub const FORCE_ARM_MAGIC: f32 = 21196.0;

/// System/component the session addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system_id: u8,
    pub component_id: u8,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            system_id: 1,
            component_id: 1,
        }
    }
}

/// One-shot vehicle commands, all sent as COMMAND_LONG.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Arm {
        force: bool,
    },
    Disarm {
        force: bool,
    },
    SetMode {
        custom_mode: u32,
    },
    Takeoff {
        altitude: f32,
        pitch: f32,
        yaw: f32,
    },
    Land {
        lat: f64,
        lon: f64,
        altitude: f32,
        abort_altitude: f32,
        precision: f32,
        yaw: f32,
    },
    ReturnToLaunch,
    Goto {
        lat: f64,
        lon: f64,
        altitude: f32,
        hold: f32,
        accept_radius: f32,
        pass_radius: f32,
        yaw: f32,
    },
    SetServo {
        servo: u8,
        pwm: u16,
    },
    CameraTrigger {
        session: f32,
        zoom_position: f32,
        zoom_step: f32,
        focus_lock: f32,
        shutter: f32,
        command_id: f32,
        shot_id: f32,
    },
    Reboot {
        onboard_computer: bool,
    },
    GetHomePosition,
    /// Interval request for one message id; `rate_hz <= 0` disables it.
    SetMessageInterval {
        message_id: u32,
        rate_hz: f32,
    },
    Long {
        command: MavCmd,
        params: [f32; 7],
    },
}

impl Command {
    /// Plain takeoff to `altitude` meters.
    pub fn takeoff(altitude: f32) -> Self {
        Command::Takeoff {
            altitude,
            pitch: 0.0,
            yaw: f32::NAN,
        }
    }

    /// Land at the current position.
    pub fn land_here() -> Self {
        Command::Land {
            lat: 0.0,
            lon: 0.0,
            altitude: 0.0,
            abort_altitude: 0.0,
            precision: 0.0,
            yaw: f32::NAN,
        }
    }

    pub fn goto(lat: f64, lon: f64, altitude: f32) -> Self {
        Command::Goto {
            lat,
            lon,
            altitude,
            hold: 0.0,
            accept_radius: 0.0,
            pass_radius: 0.0,
            yaw: f32::NAN,
        }
    }

    pub fn mav_cmd(&self) -> MavCmd {
        match self {
            Command::Arm { .. } | Command::Disarm { .. } => {
                MavCmd::MAV_CMD_COMPONENT_ARM_DISARM
            }
            Command::SetMode { .. } => MavCmd::MAV_CMD_DO_SET_MODE,
            Command::Takeoff { .. } => MavCmd::MAV_CMD_NAV_TAKEOFF,
            Command::Land { .. } => MavCmd::MAV_CMD_NAV_LAND,
            Command::ReturnToLaunch => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            Command::Goto { .. } => MavCmd::MAV_CMD_NAV_WAYPOINT,
            Command::SetServo { .. } => MavCmd::MAV_CMD_DO_SET_SERVO,
            Command::CameraTrigger { .. } => MavCmd::MAV_CMD_DO_DIGICAM_CONTROL,
            Command::Reboot { .. } => MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
            Command::GetHomePosition => MavCmd::MAV_CMD_GET_HOME_POSITION,
            Command::SetMessageInterval { .. } => MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL,
            Command::Long { command, .. } => *command,
        }
    }

    /// param1..param7 of the COMMAND_LONG.
    pub fn params(&self) -> [f32; 7] {
        let force = |f: bool| if f { FORCE_ARM_MAGIC } else { 0.0 };
        match *self {
            Command::Arm { force: f } => [1.0, force(f), 0.0, 0.0, 0.0, 0.0, 0.0],
            Command::Disarm { force: f } => [0.0, force(f), 0.0, 0.0, 0.0, 0.0, 0.0],
            Command::SetMode { custom_mode } => [
                f32::from(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits()),
                custom_mode as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
            Command::Takeoff {
                altitude,
                pitch,
                yaw,
            } => [pitch, 0.0, 0.0, yaw, 0.0, 0.0, altitude],
            Command::Land {
                lat,
                lon,
                altitude,
                abort_altitude,
                precision,
                yaw,
            } => [
                abort_altitude,
                precision,
                0.0,
                yaw,
                lat as f32,
                lon as f32,
                altitude,
            ],
            Command::ReturnToLaunch | Command::GetHomePosition => [0.0; 7],
            Command::Goto {
                lat,
                lon,
                altitude,
                hold,
                accept_radius,
                pass_radius,
                yaw,
            } => [
                hold,
                accept_radius,
                pass_radius,
                yaw,
                lat as f32,
                lon as f32,
                altitude,
            ],
            Command::SetServo { servo, pwm } => {
                [f32::from(servo), f32::from(pwm), 0.0, 0.0, 0.0, 0.0, 0.0]
            }
            Command::CameraTrigger {
                session,
                zoom_position,
                zoom_step,
                focus_lock,
                shutter,
                command_id,
                shot_id,
            } => [
                session,
                zoom_position,
                zoom_step,
                focus_lock,
                shutter,
                command_id,
                shot_id,
            ],
            Command::Reboot { onboard_computer } => [
                1.0,
                if onboard_computer { 1.0 } else { 0.0 },
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
            Command::SetMessageInterval {
                message_id,
                rate_hz,
            } => {
                let interval_us = if rate_hz > 0.0 {
                    1_000_000.0 / rate_hz
                } else {
                    -1.0
                };
                [message_id as f32, interval_us, 0.0, 0.0, 0.0, 0.0, 0.0]
            }
            Command::Long { params, .. } => params,
        }
    }

    pub fn to_message(&self, target: Target) -> MavMessage {
        let [param1, param2, param3, param4, param5, param6, param7] = self.params();
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: target.system_id,
            target_component: target.component_id,
            command: self.mav_cmd(),
            confirmation: 0,
            param1,
            param2,
            param3,
            param4,
            param5,
            param6,
            param7,
        })
    }
}

/// Builds a SET_MESSAGE_INTERVAL command for a message given by name.
pub fn message_interval(name: &str, rate_hz: f32) -> Result<Command> {
    let message_id = MavMessage::message_id_from_name(name)
        .map_err(|_| SessionError::UnknownMessage(name.to_string()))?;
    Ok(Command::SetMessageInterval {
        message_id,
        rate_hz,
    })
}

/// Legacy stream groups for REQUEST_DATA_STREAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStream {
    All,
    RawSensors,
    ExtendedStatus,
    RcChannels,
    RawController,
    Position,
    Extra1,
    Extra2,
    Extra3,
}

impl DataStream {
    pub fn mav_stream(self) -> MavDataStream {
        match self {
            DataStream::All => MavDataStream::MAV_DATA_STREAM_ALL,
            DataStream::RawSensors => MavDataStream::MAV_DATA_STREAM_RAW_SENSORS,
            DataStream::ExtendedStatus => MavDataStream::MAV_DATA_STREAM_EXTENDED_STATUS,
            DataStream::RcChannels => MavDataStream::MAV_DATA_STREAM_RC_CHANNELS,
            DataStream::RawController => MavDataStream::MAV_DATA_STREAM_RAW_CONTROLLER,
            DataStream::Position => MavDataStream::MAV_DATA_STREAM_POSITION,
            DataStream::Extra1 => MavDataStream::MAV_DATA_STREAM_EXTRA1,
            DataStream::Extra2 => MavDataStream::MAV_DATA_STREAM_EXTRA2,
            DataStream::Extra3 => MavDataStream::MAV_DATA_STREAM_EXTRA3,
        }
    }
}

/// Rates (Hz) used by `configure_standard_streams`: attitude fast, position
/// and HUD moderate, status slow.
pub const STANDARD_STREAMS: [(DataStream, u16); 6] = [
    (DataStream::Extra1, 10),
    (DataStream::Position, 3),
    (DataStream::Extra2, 5),
    (DataStream::ExtendedStatus, 2),
    (DataStream::RawSensors, 2),
    (DataStream::RcChannels, 5),
];

pub fn request_data_stream(
    target: Target,
    stream: DataStream,
    rate_hz: u16,
    start: bool,
) -> MavMessage {
    MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
        req_stream_id: stream.mav_stream() as u8,
        req_message_rate: rate_hz,
        start_stop: u8::from(start),
    })
}

pub fn param_request_list(target: Target) -> MavMessage {
    MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
        target_system: target.system_id,
        target_component: target.component_id,
    })
}

/// Read of a single parameter by name (`param_index = -1`).
pub fn param_request_read(target: Target, name: &str) -> Result<MavMessage> {
    Ok(MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
        param_index: -1,
        target_system: target.system_id,
        target_component: target.component_id,
        param_id: encode_param_id(name)?,
    }))
}

pub fn param_set(target: Target, name: &str, value: ParamValue) -> Result<MavMessage> {
    Ok(MavMessage::PARAM_SET(PARAM_SET_DATA {
        param_value: value.as_f32(),
        target_system: target.system_id,
        target_component: target.component_id,
        param_id: encode_param_id(name)?,
        param_type: value.infer_type(),
    }))
}
