//! Vehicle specific MAVLink messages (ids 50000..=50005).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtoError;

pub const THROTTLE_DATA_ID: u32 = 50000;
pub const BRAKE_DATA_ID: u32 = 50001;
pub const DRIVING_MODE_ID: u32 = 50002;
pub const VEHICLE_DATA_ID: u32 = 50003;
pub const DIGITAL_OUTPUTS_ID: u32 = 50004;
pub const COMPUTER_STATUS_ID: u32 = 50005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DrivingMode {
    #[default]
    Neutral = 0,
    Forward = 1,
    Reverse = 2,
}

impl DrivingMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DrivingMode::Neutral),
            1 => Some(DrivingMode::Forward),
            2 => Some(DrivingMode::Reverse),
            _ => None,
        }
    }

    pub fn from_f64(v: f64) -> Self {
        Self::from_u8(v.round().clamp(0.0, 255.0) as u8).unwrap_or_default()
    }
}

impl std::fmt::Display for DrivingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DrivingMode::Neutral => "neutral",
            DrivingMode::Forward => "forward",
            DrivingMode::Reverse => "reverse",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThrottleData {
    pub input: f32,
    pub output: f32,
    pub raw: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BrakeData {
    pub input: f32,
    pub output: f32,
    pub raw: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleData {
    pub power: f32,
    pub speed: f32,
    pub heading: f32,
    pub steering: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitalOutputs {
    pub forward_switch: bool,
    pub reverse_switch: bool,
    pub foot_switch: bool,
    pub brake_light: bool,
    pub coolant_pump: bool,
    pub ts_active: bool,
    pub red_led: bool,
    pub green_led: bool,
    pub blue_led: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputerStatus {
    pub uptime: u32,
    pub ram_usage: u32,
    pub ram_total: u32,
    pub storage_usage: u32,
    pub storage_total: u32,
    pub temperature_core: i16,
    pub temperature_board: i16,
    pub cpu_load: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LfsMessage {
    ThrottleData(ThrottleData),
    BrakeData(BrakeData),
    DrivingMode(DrivingMode),
    VehicleData(VehicleData),
    DigitalOutputs(DigitalOutputs),
    ComputerStatus(ComputerStatus),
}

/// `(payload length, crc extra)` for a vehicle message id.
pub fn lfs_meta(id: u32) -> Option<(usize, u8)> {
    match id {
        THROTTLE_DATA_ID => Some((9, 109)),
        BRAKE_DATA_ID => Some((9, 36)),
        DRIVING_MODE_ID => Some((1, 253)),
        VEHICLE_DATA_ID => Some((16, 211)),
        DIGITAL_OUTPUTS_ID => Some((9, 35)),
        COMPUTER_STATUS_ID => Some((25, 252)),
        _ => None,
    }
}

impl LfsMessage {
    pub fn message_id(&self) -> u32 {
        match self {
            LfsMessage::ThrottleData(_) => THROTTLE_DATA_ID,
            LfsMessage::BrakeData(_) => BRAKE_DATA_ID,
            LfsMessage::DrivingMode(_) => DRIVING_MODE_ID,
            LfsMessage::VehicleData(_) => VEHICLE_DATA_ID,
            LfsMessage::DigitalOutputs(_) => DIGITAL_OUTPUTS_ID,
            LfsMessage::ComputerStatus(_) => COMPUTER_STATUS_ID,
        }
    }

    pub fn message_name(&self) -> &'static str {
        match self {
            LfsMessage::ThrottleData(_) => "THROTTLE_DATA",
            LfsMessage::BrakeData(_) => "BRAKE_DATA",
            LfsMessage::DrivingMode(_) => "DRIVING_MODE",
            LfsMessage::VehicleData(_) => "VEHICLE_DATA",
            LfsMessage::DigitalOutputs(_) => "DIGITAL_OUTPUTS",
            LfsMessage::ComputerStatus(_) => "COMPUTER_STATUS",
        }
    }

    /// Full length payload in wire order (largest fields first).
    pub fn ser(&self) -> BytesMut {
        let mut b = BytesMut::with_capacity(25);
        match self {
            LfsMessage::ThrottleData(m) => {
                b.put_f32_le(m.input);
                b.put_f32_le(m.output);
                b.put_u8(m.raw);
            }
            LfsMessage::BrakeData(m) => {
                b.put_f32_le(m.input);
                b.put_f32_le(m.output);
                b.put_u8(m.raw);
            }
            LfsMessage::DrivingMode(m) => b.put_u8(*m as u8),
            LfsMessage::VehicleData(m) => {
                b.put_f32_le(m.power);
                b.put_f32_le(m.speed);
                b.put_f32_le(m.heading);
                b.put_f32_le(m.steering);
            }
            LfsMessage::DigitalOutputs(m) => {
                for v in [
                    m.forward_switch,
                    m.reverse_switch,
                    m.foot_switch,
                    m.brake_light,
                    m.coolant_pump,
                    m.ts_active,
                    m.red_led,
                    m.green_led,
                    m.blue_led,
                ] {
                    b.put_u8(v as u8);
                }
            }
            LfsMessage::ComputerStatus(m) => {
                b.put_u32_le(m.uptime);
                b.put_u32_le(m.ram_usage);
                b.put_u32_le(m.ram_total);
                b.put_u32_le(m.storage_usage);
                b.put_u32_le(m.storage_total);
                b.put_i16_le(m.temperature_core);
                b.put_i16_le(m.temperature_board);
                b.put_u8(m.cpu_load);
            }
        }
        b
    }

    /// Parses a payload that may have had its trailing zeros truncated.
    pub fn parse(id: u32, payload: &[u8]) -> Result<Self, ProtoError> {
        let (len, _) = lfs_meta(id).ok_or(ProtoError::UnknownMessage(id))?;
        if payload.len() > len {
            return Err(ProtoError::Malformed { id, reason: format!("payload {} > {}", payload.len(), len) });
        }
        let mut full = [0u8; 25];
        full[..payload.len()].copy_from_slice(payload);
        let mut b = &full[..len];

        let msg = match id {
            THROTTLE_DATA_ID => LfsMessage::ThrottleData(ThrottleData {
                input: b.get_f32_le(),
                output: b.get_f32_le(),
                raw: b.get_u8(),
            }),
            BRAKE_DATA_ID => LfsMessage::BrakeData(BrakeData {
                input: b.get_f32_le(),
                output: b.get_f32_le(),
                raw: b.get_u8(),
            }),
            DRIVING_MODE_ID => {
                let raw = b.get_u8();
                let mode = DrivingMode::from_u8(raw)
                    .ok_or_else(|| ProtoError::Malformed { id, reason: format!("driving mode {}", raw) })?;
                LfsMessage::DrivingMode(mode)
            }
            VEHICLE_DATA_ID => LfsMessage::VehicleData(VehicleData {
                power: b.get_f32_le(),
                speed: b.get_f32_le(),
                heading: b.get_f32_le(),
                steering: b.get_f32_le(),
            }),
            DIGITAL_OUTPUTS_ID => LfsMessage::DigitalOutputs(DigitalOutputs {
                forward_switch: b.get_u8() != 0,
                reverse_switch: b.get_u8() != 0,
                foot_switch: b.get_u8() != 0,
                brake_light: b.get_u8() != 0,
                coolant_pump: b.get_u8() != 0,
                ts_active: b.get_u8() != 0,
                red_led: b.get_u8() != 0,
                green_led: b.get_u8() != 0,
                blue_led: b.get_u8() != 0,
            }),
            _ => LfsMessage::ComputerStatus(ComputerStatus {
                uptime: b.get_u32_le(),
                ram_usage: b.get_u32_le(),
                ram_total: b.get_u32_le(),
                storage_usage: b.get_u32_le(),
                storage_total: b.get_u32_le(),
                temperature_core: b.get_i16_le(),
                temperature_board: b.get_i16_le(),
                cpu_load: b.get_u8(),
            }),
        };
        Ok(msg)
    }
}
