//! Normalized telemetry records.
//!
//! Raw MAVLink fields are converted here, once, into the units the rest of the
//! crate works in: degrees, meters, meters per second, volts, amperes and
//! percent. Sentinel values for "unknown" become `None`.

use mavlink::common::{
    MavAutopilot, MavBatteryChargeState, MavBatteryFunction, MavBatteryType, MavCmd, MavModeFlag,
    MavResult, MavSeverity, MavState, MavType, ATTITUDE_DATA, BATTERY_STATUS_DATA,
    COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, GpsFixType, HEARTBEAT_DATA,
    HOME_POSITION_DATA, MISSION_CURRENT_DATA, STATUSTEXT_DATA, SYS_STATUS_DATA, VFR_HUD_DATA,
};
use mavlink::MavHeader;

const DEG_E7: f64 = 1e7;

/// ArduPlane custom flight modes, indexed by `custom_mode`.
pub const ARDUPLANE_MODES: [&str; 24] = [
    "MANUAL",
    "CIRCLE",
    "STABILIZE",
    "TRAINING",
    "ACRO",
    "FLY_BY_WIRE_A",
    "FLY_BY_WIRE_B",
    "CRUISE",
    "AUTOTUNE",
    "AUTO",
    "RTL",
    "LOITER",
    "TAKEOFF",
    "LAND",
    "GUIDED",
    "INITIALISING",
    "QSTABILIZE",
    "QHOVER",
    "QLOITER",
    "QLAND",
    "QRTL",
    "QTAKEOFF",
    "QAUTOTUNE",
    "QACRO",
];

/// Maps a `custom_mode` to its name, `UNKNOWN(n)` for unmapped values.
pub fn flight_mode_name(custom_mode: u32) -> String {
    usize::try_from(custom_mode)
        .ok()
        .and_then(|i| ARDUPLANE_MODES.get(i))
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("UNKNOWN({})", custom_mode))
}

/// Reverse lookup of [`flight_mode_name`], case-insensitive.
pub fn flight_mode_number(name: &str) -> Option<u32> {
    ARDUPLANE_MODES
        .iter()
        .position(|mode| mode.eq_ignore_ascii_case(name))
        .and_then(|i| u32::try_from(i).ok())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatInfo {
    pub system_id: u8,
    pub component_id: u8,
    pub vehicle_type: MavType,
    pub autopilot: MavAutopilot,
    pub base_mode: u8,
    pub custom_mode: u32,
    pub system_status: MavState,
    pub mavlink_version: u8,
    pub armed: bool,
    pub mode: String,
}

impl HeartbeatInfo {
    pub fn from_mavlink(header: &MavHeader, data: &HEARTBEAT_DATA) -> Self {
        Self {
            system_id: header.system_id,
            component_id: header.component_id,
            vehicle_type: data.mavtype,
            autopilot: data.autopilot,
            base_mode: data.base_mode.bits(),
            custom_mode: data.custom_mode,
            system_status: data.system_status,
            mavlink_version: data.mavlink_version,
            armed: data.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
            mode: flight_mode_name(data.custom_mode),
        }
    }
}

/// Vehicle attitude in degrees and degrees per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub rollspeed: f64,
    pub pitchspeed: f64,
    pub yawspeed: f64,
    pub time_boot_ms: u32,
}

impl From<&ATTITUDE_DATA> for Attitude {
    fn from(data: &ATTITUDE_DATA) -> Self {
        Self {
            roll: f64::from(data.roll).to_degrees(),
            pitch: f64::from(data.pitch).to_degrees(),
            yaw: f64::from(data.yaw).to_degrees(),
            rollspeed: f64::from(data.rollspeed).to_degrees(),
            pitchspeed: f64::from(data.pitchspeed).to_degrees(),
            yawspeed: f64::from(data.yawspeed).to_degrees(),
            time_boot_ms: data.time_boot_ms,
        }
    }
}

/// Fused global position. Altitudes in meters, velocities in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlobalPosition {
    pub lat: f64,
    pub lon: f64,
    /// MSL altitude
    pub alt: f64,
    pub relative_alt: f64,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub heading: Option<f64>,
    pub time_boot_ms: u32,
}

impl From<&GLOBAL_POSITION_INT_DATA> for GlobalPosition {
    fn from(data: &GLOBAL_POSITION_INT_DATA) -> Self {
        Self {
            lat: f64::from(data.lat) / DEG_E7,
            lon: f64::from(data.lon) / DEG_E7,
            alt: f64::from(data.alt) / 1000.0,
            relative_alt: f64::from(data.relative_alt) / 1000.0,
            vx: f64::from(data.vx) / 100.0,
            vy: f64::from(data.vy) / 100.0,
            vz: f64::from(data.vz) / 100.0,
            heading: known_u16(data.hdg).map(|h| f64::from(h) / 100.0),
            time_boot_ms: data.time_boot_ms,
        }
    }
}

/// Raw GPS receiver state. Fields the receiver reports as unknown are `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsInfo {
    pub fix_type: GpsFixType,
    pub satellites_visible: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub ground_speed: Option<f64>,
    pub course_over_ground: Option<f64>,
}

impl From<&GPS_RAW_INT_DATA> for GpsInfo {
    fn from(data: &GPS_RAW_INT_DATA) -> Self {
        Self {
            fix_type: data.fix_type,
            satellites_visible: (data.satellites_visible != u8::MAX)
                .then_some(data.satellites_visible),
            lat: (data.lat != 0).then(|| f64::from(data.lat) / DEG_E7),
            lon: (data.lon != 0).then(|| f64::from(data.lon) / DEG_E7),
            alt: (data.alt != 0).then(|| f64::from(data.alt) / 1000.0),
            hdop: known_u16(data.eph).map(|v| f64::from(v) / 100.0),
            vdop: known_u16(data.epv).map(|v| f64::from(v) / 100.0),
            ground_speed: known_u16(data.vel).map(|v| f64::from(v) / 100.0),
            course_over_ground: known_u16(data.cog).map(|v| f64::from(v) / 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VfrHud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub heading: i16,
    pub throttle: u16,
    pub alt: f32,
    pub climb: f32,
}

impl From<&VFR_HUD_DATA> for VfrHud {
    fn from(data: &VFR_HUD_DATA) -> Self {
        Self {
            airspeed: data.airspeed,
            groundspeed: data.groundspeed,
            heading: data.heading,
            throttle: data.throttle,
            alt: data.alt,
            climb: data.climb,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryStatus {
    pub id: u8,
    pub function: MavBatteryFunction,
    pub battery_type: MavBatteryType,
    /// Degrees Celsius
    pub temperature: Option<f64>,
    /// Per-cell voltages in volts, unused cells omitted
    pub voltages: Vec<f64>,
    /// Amperes
    pub current: Option<f64>,
    /// mAh
    pub current_consumed: Option<i32>,
    /// hJ
    pub energy_consumed: Option<i32>,
    pub remaining_percent: Option<i8>,
    pub time_remaining: Option<i32>,
    pub charge_state: MavBatteryChargeState,
}

impl BatteryStatus {
    pub fn total_voltage(&self) -> f64 {
        self.voltages.iter().sum()
    }
}

impl From<&BATTERY_STATUS_DATA> for BatteryStatus {
    fn from(data: &BATTERY_STATUS_DATA) -> Self {
        Self {
            id: data.id,
            function: data.battery_function,
            battery_type: data.mavtype,
            temperature: (data.temperature != i16::MAX)
                .then(|| f64::from(data.temperature) / 100.0),
            voltages: data
                .voltages
                .iter()
                .filter(|&&mv| mv != u16::MAX)
                .map(|&mv| f64::from(mv) / 1000.0)
                .collect(),
            current: (data.current_battery != -1).then(|| f64::from(data.current_battery) / 100.0),
            current_consumed: (data.current_consumed != -1).then_some(data.current_consumed),
            energy_consumed: (data.energy_consumed != -1).then_some(data.energy_consumed),
            remaining_percent: (data.battery_remaining != -1).then_some(data.battery_remaining),
            time_remaining: (data.time_remaining != 0).then_some(data.time_remaining),
            charge_state: data.charge_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SysStatus {
    pub sensors_present: u32,
    pub sensors_enabled: u32,
    pub sensors_health: u32,
    /// Main loop load, percent
    pub load: f64,
    pub voltage_battery: Option<f64>,
    pub current_battery: Option<f64>,
    pub battery_remaining: Option<i8>,
    /// Communication drop rate, percent
    pub drop_rate_comm: f64,
    pub errors_comm: u16,
    pub errors_count: [u16; 4],
}

impl From<&SYS_STATUS_DATA> for SysStatus {
    fn from(data: &SYS_STATUS_DATA) -> Self {
        Self {
            sensors_present: data.onboard_control_sensors_present.bits(),
            sensors_enabled: data.onboard_control_sensors_enabled.bits(),
            sensors_health: data.onboard_control_sensors_health.bits(),
            load: f64::from(data.load) / 10.0,
            voltage_battery: known_u16(data.voltage_battery).map(|mv| f64::from(mv) / 1000.0),
            current_battery: (data.current_battery != -1)
                .then(|| f64::from(data.current_battery) / 100.0),
            battery_remaining: (data.battery_remaining != -1).then_some(data.battery_remaining),
            drop_rate_comm: f64::from(data.drop_rate_comm) / 100.0,
            errors_comm: data.errors_comm,
            errors_count: [
                data.errors_count1,
                data.errors_count2,
                data.errors_count3,
                data.errors_count4,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusText {
    pub severity: MavSeverity,
    pub text: String,
    pub id: u16,
    pub chunk_seq: u8,
}

impl From<&STATUSTEXT_DATA> for StatusText {
    fn from(data: &STATUSTEXT_DATA) -> Self {
        let end = data
            .text
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(data.text.len());
        Self {
            severity: data.severity,
            text: String::from_utf8_lossy(&data.text[..end]).trim_end().to_string(),
            id: data.id,
            chunk_seq: data.chunk_seq,
        }
    }
}

/// Acknowledgement for a previously sent command. Correlating it with the
/// call that caused it is left to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandAck {
    pub command: MavCmd,
    pub result: MavResult,
    pub progress: u8,
    pub result_param2: i32,
    pub target_system: u8,
    pub target_component: u8,
}

impl CommandAck {
    pub fn accepted(&self) -> bool {
        self.result == MavResult::MAV_RESULT_ACCEPTED
    }
}

impl From<&COMMAND_ACK_DATA> for CommandAck {
    fn from(data: &COMMAND_ACK_DATA) -> Self {
        Self {
            command: data.command,
            result: data.result,
            progress: data.progress,
            result_param2: data.result_param2,
            target_system: data.target_system,
            target_component: data.target_component,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HomePosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub q: [f32; 4],
    pub approach: [f32; 3],
}

impl From<&HOME_POSITION_DATA> for HomePosition {
    fn from(data: &HOME_POSITION_DATA) -> Self {
        Self {
            lat: f64::from(data.latitude) / DEG_E7,
            lon: f64::from(data.longitude) / DEG_E7,
            alt: f64::from(data.altitude) / 1000.0,
            x: data.x,
            y: data.y,
            z: data.z,
            q: data.q,
            approach: [data.approach_x, data.approach_y, data.approach_z],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MissionCurrent {
    pub seq: u16,
    pub total: u16,
    pub mission_state: u8,
    pub mission_mode: u8,
}

impl From<&MISSION_CURRENT_DATA> for MissionCurrent {
    fn from(data: &MISSION_CURRENT_DATA) -> Self {
        Self {
            seq: data.seq,
            total: data.total,
            mission_state: data.mission_state as u8,
            mission_mode: data.mission_mode,
        }
    }
}

/// `0` and `UINT16_MAX` both mean "not available" for the unsigned GPS and
/// heading fields.
fn known_u16(value: u16) -> Option<u16> {
    (value != 0 && value != u16::MAX).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_attitude_radians_to_degrees() {
        let data = ATTITUDE_DATA {
            roll: 0.1,
            pitch: -0.5,
            yaw: std::f32::consts::PI,
            ..Default::default()
        };
        let attitude = Attitude::from(&data);
        assert!(approx(attitude.roll, f64::from(0.1f32) * 180.0 / std::f64::consts::PI));
        assert!(approx(attitude.pitch, f64::from(-0.5f32).to_degrees()));
        assert!((attitude.yaw - 180.0).abs() < 1e-4);
    }

    #[test]
    fn test_position_scaling() {
        let data = GLOBAL_POSITION_INT_DATA {
            lat: 473_977_418,
            lon: 85_455_939,
            alt: 488_000,
            relative_alt: 12_500,
            vx: 150,
            vy: -250,
            vz: 10,
            hdg: 9_000,
            ..Default::default()
        };
        let pos = GlobalPosition::from(&data);
        assert!(approx(pos.lat, 47.3977418));
        assert!(approx(pos.lon, 8.5455939));
        assert!(approx(pos.alt, 488.0));
        assert!(approx(pos.relative_alt, 12.5));
        assert!(approx(pos.vx, 1.5));
        assert!(approx(pos.vy, -2.5));
        assert_eq!(pos.heading, Some(90.0));

        let unknown_heading = GlobalPosition::from(&GLOBAL_POSITION_INT_DATA {
            hdg: u16::MAX,
            ..Default::default()
        });
        assert_eq!(unknown_heading.heading, None);
    }

    #[test]
    fn test_gps_sentinels() {
        let data = GPS_RAW_INT_DATA {
            eph: u16::MAX,
            epv: 0,
            vel: 1234,
            cog: 18_000,
            satellites_visible: 11,
            ..Default::default()
        };
        let gps = GpsInfo::from(&data);
        assert_eq!(gps.hdop, None);
        assert_eq!(gps.vdop, None);
        assert_eq!(gps.lat, None);
        assert_eq!(gps.satellites_visible, Some(11));
        assert_eq!(gps.ground_speed, Some(12.34));
        assert_eq!(gps.course_over_ground, Some(180.0));
    }

    #[test]
    fn test_battery_filters_unused_cells() {
        let mut voltages = [u16::MAX; 10];
        voltages[0] = 4_100;
        voltages[1] = 4_050;
        let data = BATTERY_STATUS_DATA {
            voltages,
            temperature: 2_550,
            current_battery: 1_234,
            battery_remaining: 77,
            current_consumed: -1,
            ..Default::default()
        };
        let battery = BatteryStatus::from(&data);
        assert_eq!(battery.voltages, vec![4.1, 4.05]);
        assert!(approx(battery.total_voltage(), 8.15));
        assert_eq!(battery.temperature, Some(25.5));
        assert_eq!(battery.current, Some(12.34));
        assert_eq!(battery.remaining_percent, Some(77));
        assert_eq!(battery.current_consumed, None);
    }

    #[test]
    fn test_sys_status_units() {
        let data = SYS_STATUS_DATA {
            load: 456,
            voltage_battery: 12_600,
            current_battery: -1,
            drop_rate_comm: 250,
            battery_remaining: 80,
            ..Default::default()
        };
        let status = SysStatus::from(&data);
        assert!(approx(status.load, 45.6));
        assert_eq!(status.voltage_battery, Some(12.6));
        assert_eq!(status.current_battery, None);
        assert!(approx(status.drop_rate_comm, 2.5));
    }

    #[test]
    fn test_heartbeat_armed_and_mode() {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        };
        let data = HEARTBEAT_DATA {
            custom_mode: 10,
            base_mode: MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED
                | MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            ..Default::default()
        };
        let hb = HeartbeatInfo::from_mavlink(&header, &data);
        assert!(hb.armed);
        assert_eq!(hb.mode, "RTL");

        let idle = HeartbeatInfo::from_mavlink(
            &header,
            &HEARTBEAT_DATA {
                custom_mode: 99,
                ..Default::default()
            },
        );
        assert!(!idle.armed);
        assert_eq!(idle.mode, "UNKNOWN(99)");
    }

    #[test]
    fn test_mode_lookup() {
        assert_eq!(flight_mode_number("guided"), Some(14));
        assert_eq!(flight_mode_number("QACRO"), Some(23));
        assert_eq!(flight_mode_number("SPORT"), None);
        assert_eq!(flight_mode_name(5), "FLY_BY_WIRE_A");
    }

    #[test]
    fn test_status_text_trimmed_at_nul() {
        let mut text = [0u8; 50];
        text[..12].copy_from_slice(b"PreArm: GPS ");
        let data = STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_WARNING,
            text,
            ..Default::default()
        };
        let status = StatusText::from(&data);
        assert_eq!(status.text, "PreArm: GPS");
        assert_eq!(status.severity, MavSeverity::MAV_SEVERITY_WARNING);
    }
}
