use std::fmt;

use tracing::info;
use vcu_params::{Param, ParamStore};
use vcu_proto::mavlink::common::MavState;
use vcu_proto::DrivingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SystemState {
    Uninit = 0,
    Boot = 1,
    Calibrating = 2,
    Standby = 3,
    Active = 4,
    Critical = 5,
    Emergency = 6,
    Poweroff = 7,
    FlightTermination = 8,
}

impl SystemState {
    pub fn from_f64(v: f64) -> Self {
        match v as i64 {
            1 => SystemState::Boot,
            2 => SystemState::Calibrating,
            3 => SystemState::Standby,
            4 => SystemState::Active,
            5 => SystemState::Critical,
            6 => SystemState::Emergency,
            7 => SystemState::Poweroff,
            8 => SystemState::FlightTermination,
            _ => SystemState::Uninit,
        }
    }

    pub fn as_mav(self) -> MavState {
        match self {
            SystemState::Uninit => MavState::MAV_STATE_UNINIT,
            SystemState::Boot => MavState::MAV_STATE_BOOT,
            SystemState::Calibrating => MavState::MAV_STATE_CALIBRATING,
            SystemState::Standby => MavState::MAV_STATE_STANDBY,
            SystemState::Active => MavState::MAV_STATE_ACTIVE,
            SystemState::Critical => MavState::MAV_STATE_CRITICAL,
            SystemState::Emergency => MavState::MAV_STATE_EMERGENCY,
            SystemState::Poweroff => MavState::MAV_STATE_POWEROFF,
            SystemState::FlightTermination => MavState::MAV_STATE_FLIGHT_TERMINATION,
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemState::Uninit => "uninit",
            SystemState::Boot => "boot",
            SystemState::Calibrating => "calibrating",
            SystemState::Standby => "standby",
            SystemState::Active => "active",
            SystemState::Critical => "critical",
            SystemState::Emergency => "emergency",
            SystemState::Poweroff => "poweroff",
            SystemState::FlightTermination => "flight_termination",
        };
        f.write_str(s)
    }
}

/// MAV_MODE_FLAG bits the vehicle uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags(u8);

impl ModeFlags {
    pub const TEST_ENABLED: ModeFlags = ModeFlags(0x02);
    pub const HIL_ENABLED: ModeFlags = ModeFlags(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: ModeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ModeFlags, on: bool) -> Self {
        if on {
            Self(self.0 | other.0)
        } else {
            Self(self.0 & !other.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TsMode {
    #[default]
    Normal = 0,
    Service = 1,
    Track = 2,
}

impl TsMode {
    pub fn from_f64(v: f64) -> Option<Self> {
        match v as i64 {
            0 => Some(TsMode::Normal),
            1 => Some(TsMode::Service),
            2 => Some(TsMode::Track),
            _ => None,
        }
    }
}

impl fmt::Display for TsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsMode::Normal => f.write_str("normal"),
            TsMode::Service => f.write_str("service"),
            TsMode::Track => f.write_str("track"),
        }
    }
}

/// Typed view of the system-wide parameters.
pub trait VehicleState {
    fn system_state(&self) -> SystemState;
    fn set_system_state(&self, state: SystemState);
    fn system_mode(&self) -> ModeFlags;
    fn in_mode(&self, flag: ModeFlags) -> bool;
    fn set_mode_flag(&self, flag: ModeFlags, on: bool);
    fn driving_mode(&self) -> DrivingMode;
    fn ts_mode(&self) -> TsMode;
}

impl VehicleState for ParamStore {
    fn system_state(&self) -> SystemState {
        SystemState::from_f64(self.number(Param::SystemState))
    }

    fn set_system_state(&self, state: SystemState) {
        self.set(Param::SystemState, state as u8).ok();
        info!("Setting system in {} state.", state);
    }

    fn system_mode(&self) -> ModeFlags {
        ModeFlags::from_bits(self.number(Param::SystemMode) as u8)
    }

    fn in_mode(&self, flag: ModeFlags) -> bool {
        self.system_mode().contains(flag)
    }

    fn set_mode_flag(&self, flag: ModeFlags, on: bool) {
        let mode = self.system_mode().with(flag, on);
        self.set(Param::SystemMode, mode.bits()).ok();
    }

    fn driving_mode(&self) -> DrivingMode {
        DrivingMode::from_f64(self.number(Param::DrivingMode))
    }

    fn ts_mode(&self) -> TsMode {
        TsMode::from_f64(self.number(Param::TsMode)).unwrap_or_default()
    }
}
