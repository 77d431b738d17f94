//! Last-known vehicle state.
//!
//! Each telemetry group sits behind its own lock, so a reader sees a whole
//! record from one message or the previous one, never a mix. Reads copy out.

use crate::telemetry::{
    Attitude, BatteryStatus, GlobalPosition, GpsInfo, HeartbeatInfo, HomePosition,
    MissionCurrent, SysStatus, VfrHud,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Copy of every group at (roughly) one instant.
///
/// Groups are read one after another, so two groups in the same snapshot may
/// come from different messages; each group on its own is consistent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleSnapshot {
    pub version: u64,
    pub heartbeat: Option<HeartbeatInfo>,
    pub attitude: Option<Attitude>,
    pub position: Option<GlobalPosition>,
    pub gps: Option<GpsInfo>,
    pub vfr_hud: Option<VfrHud>,
    pub battery: Option<BatteryStatus>,
    pub sys_status: Option<SysStatus>,
    pub home: Option<HomePosition>,
    pub mission_current: Option<MissionCurrent>,
    pub last_reached_seq: Option<u16>,
}

#[derive(Debug, Default)]
pub struct VehicleStateCache {
    version: AtomicU64,
    heartbeat: RwLock<Option<HeartbeatInfo>>,
    attitude: RwLock<Option<Attitude>>,
    position: RwLock<Option<GlobalPosition>>,
    gps: RwLock<Option<GpsInfo>>,
    vfr_hud: RwLock<Option<VfrHud>>,
    battery: RwLock<Option<BatteryStatus>>,
    sys_status: RwLock<Option<SysStatus>>,
    home: RwLock<Option<HomePosition>>,
    mission_current: RwLock<Option<MissionCurrent>>,
    last_reached_seq: RwLock<Option<u16>>,
}

macro_rules! group {
    ($field:ident, $setter:ident, $ty:ty) => {
        pub fn $field(&self) -> Option<$ty> {
            self.$field.read().clone()
        }

        pub fn $setter(&self, value: $ty) {
            *self.$field.write() = Some(value);
            self.version.fetch_add(1, Ordering::Release);
        }
    };
}

impl VehicleStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    group!(heartbeat, set_heartbeat, HeartbeatInfo);
    group!(attitude, set_attitude, Attitude);
    group!(position, set_position, GlobalPosition);
    group!(gps, set_gps, GpsInfo);
    group!(vfr_hud, set_vfr_hud, VfrHud);
    group!(battery, set_battery, BatteryStatus);
    group!(sys_status, set_sys_status, SysStatus);
    group!(home, set_home, HomePosition);
    group!(mission_current, set_mission_current, MissionCurrent);
    group!(last_reached_seq, set_last_reached_seq, u16);

    /// Incremented on every group write.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_armed(&self) -> bool {
        self.heartbeat.read().as_ref().is_some_and(|hb| hb.armed)
    }

    pub fn flight_mode(&self) -> Option<String> {
        self.heartbeat.read().as_ref().map(|hb| hb.mode.clone())
    }

    pub fn snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            version: self.version(),
            heartbeat: self.heartbeat(),
            attitude: self.attitude(),
            position: self.position(),
            gps: self.gps(),
            vfr_hud: self.vfr_hud(),
            battery: self.battery(),
            sys_status: self.sys_status(),
            home: self.home(),
            mission_current: self.mission_current(),
            last_reached_seq: self.last_reached_seq(),
        }
    }

    /// Clears every group. The version keeps counting so observers can still
    /// tell that something changed.
    pub fn reset(&self) {
        *self.heartbeat.write() = None;
        *self.attitude.write() = None;
        *self.position.write() = None;
        *self.gps.write() = None;
        *self.vfr_hud.write() = None;
        *self.battery.write() = None;
        *self.sys_status.write() = None;
        *self.home.write() = None;
        *self.mission_current.write() = None;
        *self.last_reached_seq.write() = None;
        self.version.fetch_add(1, Ordering::Release);
    }
}
