use crate::value::{Bounds, ParamKind, ParamValue};

/// Longest key the MAVLink parameter protocol can carry.
pub const MAX_KEY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub key: &'static str,
    pub default: ParamValue,
    pub bounds: Bounds,
}

impl ParamSpec {
    pub fn kind(&self) -> ParamKind {
        self.default.kind()
    }
}

macro_rules! param_schema {
    ($( $variant:ident => $key:literal : $kind:ident = $default:expr $(, min = $min:expr)? $(, max = $max:expr)? ;)*) => {
        /// Every parameter the vehicle knows about.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Param {
            $($variant),*
        }

        impl Param {
            pub const ALL: &'static [Param] = &[$(Param::$variant),*];

            pub fn key(self) -> &'static str {
                match self {
                    $(Param::$variant => $key),*
                }
            }

            pub fn spec(self) -> ParamSpec {
                match self {
                    $(Param::$variant => ParamSpec {
                        key: $key,
                        default: param_schema!(@value $kind $default),
                        bounds: Bounds::new(
                            param_schema!(@opt $($min)?),
                            param_schema!(@opt $($max)?),
                        ),
                    }),*
                }
            }
        }
    };
    (@value num $v:expr) => { ParamValue::Number(($v) as f64) };
    (@value flag $v:expr) => { ParamValue::Bool($v) };
    (@value text $v:expr) => { ParamValue::Text(String::from($v)) };
    (@opt) => { None };
    (@opt $v:expr) => { Some(($v) as f64) };
}

param_schema! {
    VcuVersion => "vcu_version": text = env!("CARGO_PKG_VERSION");
    GConstant => "g_constant": num = 9.82;
    SystemState => "system_state": num = 0;
    SystemMode => "system_mode": num = 0;
    TsMode => "ts_mode": num = 0, min = 0, max = 2;
    DrivingMode => "driving_mode": num = 0, min = 0, max = 2;

    ThrottleRaw => "throttle_raw": num = 0, min = 0, max = 255;
    ThrottleInput => "throttle_input": num = 0, min = 0, max = 1;
    ThrottleOutput => "throttle_output": num = 0, min = 0, max = 1;
    ThrottleRawMax => "throttle_raw_max": num = 255;
    ThrottleRawMin => "throttle_raw_min": num = 0;
    ThrottleMaxVal => "throttle_max_val": num = 1, min = 0, max = 1;
    ThrottleDz => "throttle_dz": num = 0;
    ThrottleMaxRev => "throttle_max_rev": num = 0.3;

    BrakeRaw => "brake_raw": num = 0, min = 0, max = 255;
    BrakeInput => "brake_input": num = 0, min = 0, max = 1;
    BrakeOutput => "brake_output": num = 0, min = 0, max = 1;
    BrakeRawMax => "brake_raw_max": num = 255;
    BrakeRawMin => "brake_raw_min": num = 0;
    BrakeMaxVal => "brake_max_val": num = 1;
    BrakeDz => "brake_dz": num = 0;
    BrakeLightAct => "brake_light_act": num = 0.05, min = 0, max = 1;
    FootSwitchAct => "foot_switch_act": num = 0.05, min = 0, max = 1;

    DataFetchTime => "data_fetch_time": num = 10, min = 1, max = 100;
    FrontWheelRad => "front_wheel_rad": num = 0.250;
    RearWheelRad => "rear_wheel_rad": num = 0.250;
    Ind1RawFreq => "ind_1_raw_freq": num = 0, min = 0, max = 700;
    Ind2RawFreq => "ind_2_raw_freq": num = 0, min = 0, max = 700;
    Ind3RawFreq => "ind_3_raw_freq": num = 0, min = 0, max = 700;
    FlWheelSpeed => "fl_wheel_speed": num = 0;
    FrWheelSpeed => "fr_wheel_speed": num = 0;
    RearAxleSpeed => "rear_axle_speed": num = 0;
    SteeringRaw => "steering_raw": num = 0;
    VehicleSpeed => "vehicle_speed": num = 0, min = 0, max = 150;
    VehiclePower => "vehicle_power": num = 0, min = -70000, max = 70000;
    VehicleHeading => "vehicle_heading": num = 0;
    VehicleSteering => "vehicle_steering": num = 0;

    GpsTime => "gps_time": num = 0;
    GpsSpeed => "gps_speed": num = 0, min = 0, max = 150;
    GpsLongitude => "gps_longitude": num = 0;
    GpsLatitude => "gps_latitude": num = 0;
    GpsNumSats => "gps_num_sats": num = 0, min = 0, max = 100;
    GpsAltitude => "gps_altitude": num = 0, min = -2000, max = 2000;
    GpsMode => "gps_mode": num = 0;
    GpsHdop => "gps_hdop": num = 0, min = 0;
    GpsVdop => "gps_vdop": num = 0;
    GpsHeading => "gps_heading": num = 0;

    RedLedOutput => "red_led_output": flag = false;
    GreenLedOutput => "green_led_output": flag = false;
    BlueLedOutput => "blue_led_output": flag = false;
    FsOutput => "fs_output": flag = false;
    ForwardSwitch => "forward_switch": flag = false;
    ReverseSwitch => "reverse_switch": flag = false;
    CoolPumpOutput => "cool_pump_output": flag = false;
    BrakeLightOut => "brake_light_out": flag = false;
    CoolPumpStart => "cool_pump_start": flag = false;
    TsActiveOut => "ts_active_out": flag = false;

    LvBdi => "lv_bdi": num = 1, min = 0, max = 1;
    LvMaxEnergy => "lv_max_energy": num = 3.45 * 55.0 * 4.0, min = 0;
    LvConsCap => "lv_cons_cap": num = 0;
    LvMaxCap => "lv_max_cap": num = 50;
    LvConsEnergy => "lv_cons_energy": num = 0, min = 0;
    LvMaxVoltage => "lv_max_voltage": num = 3.45 * 4.0, min = 0;
    LvCurVoltage => "lv_cur_voltage": num = 0;
    LvMaxAmp => "lv_max_amp": num = 15, min = 0;
    LvCurAmp => "lv_cur_amp": num = 0;
    LvCurTemp => "lv_cur_temp": num = 0;
    LvCurPower => "lv_cur_power": num = 0;

    HvBdi => "hv_bdi": num = 1, min = 0, max = 1;
    HvConsCali => "hv_cons_cali": num = 1;
    HvMaxEnergy => "hv_max_energy": num = 5018, min = 0;
    HvMaxCap => "hv_max_cap": num = 55;
    HvConsCap => "hv_cons_cap": num = 0;
    HvConsEnergy => "hv_cons_energy": num = 0, min = 0;
    HvMaxVoltage => "hv_max_voltage": num = 3.45 * 32.0, min = 0;
    HvCurVoltage => "hv_cur_voltage": num = 0, min = 0, max = 130;
    HvMaxAmp => "hv_max_amp": num = 650, min = 0;
    HvCurAmp => "hv_cur_amp": num = 0, min = -700, max = 700;
    HvCurTemp => "hv_cur_temp": num = 0;

    AccLonRaw => "acc_lon_raw": num = 0;
    AccLatRaw => "acc_lat_raw": num = 0;
    AccVerRaw => "acc_ver_raw": num = 0;
    GyroLonRaw => "gyro_lon_raw": num = 0;
    GyroLatRaw => "gyro_lat_raw": num = 0;
    GyroVerRaw => "gyro_ver_raw": num = 0;
    AccLon => "acc_lon": num = 0;
    AccLat => "acc_lat": num = 0;
    AccVer => "acc_ver": num = 0;
    GyroLon => "gyro_lon": num = 0;
    GyroLat => "gyro_lat": num = 0;
    GyroVer => "gyro_ver": num = 0;
    ImuTemp => "imu_temp": num = 0;
    ImuLonSpeed => "imu_lon_speed": num = 0;

    TsTorque => "ts_torque": num = 0;
    TsRpm => "ts_rpm": num = 0;
    TsTemp => "ts_temp": num = 0;

    RadioRssi => "radio_rssi": num = 0;
    RadioRemrssi => "radio_remrssi": num = 0;
    RadioTxbuf => "radio_txbuf": num = 0;
    RadioNoise => "radio_noise": num = 0;
    RadioRemnoise => "radio_remnoise": num = 0;
    RadioRxerrors => "radio_rxerrors": num = 0;
    RadioFixed => "radio_fixed": num = 0;

    ComputerType => "computer_type": num = 0;
    CpuCores => "cpu_cores": num = 0;
    CpuTemp => "cpu_temp": num = 0;
    GpuCores => "gpu_cores": num = 0;
    BoardTemp => "board_temp": num = 0;
    RamUsage => "ram_usage": num = 0;
    RamTotal => "ram_total": num = 0;
    StorageType => "storage_type": num = 0;
    StorageUsage => "storage_usage": num = 0;
    StorageTotal => "storage_total": num = 0;
}

impl Param {
    pub fn from_key(key: &str) -> Option<Param> {
        Param::ALL.iter().copied().find(|p| p.key() == key)
    }

    /// Position in the wire parameter list.
    pub fn index(self) -> usize {
        Param::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<Param> {
        Param::ALL.get(index).copied()
    }

    pub fn kind(self) -> ParamKind {
        self.spec().kind()
    }
}

impl std::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_fit_wire_limit_and_are_unique() {
        let mut seen = HashSet::new();
        for p in Param::ALL {
            assert!(p.key().len() <= MAX_KEY_LEN, "{} too long", p.key());
            assert!(seen.insert(p.key()), "duplicate key {}", p.key());
        }
    }

    #[test]
    fn test_defaults_respect_bounds() {
        for p in Param::ALL {
            let spec = p.spec();
            if let ParamValue::Number(v) = spec.default {
                assert_eq!(spec.bounds.violation(v), None, "{} default out of bounds", p);
            }
        }
    }

    #[test]
    fn test_lookup_by_key_and_index() {
        assert_eq!(Param::from_key("throttle_input"), Some(Param::ThrottleInput));
        assert_eq!(Param::from_key("nope"), None);
        let idx = Param::BrakeLightAct.index();
        assert_eq!(Param::from_index(idx), Some(Param::BrakeLightAct));
        assert_eq!(Param::ThrottleMaxRev.spec().default, ParamValue::Number(0.3));
        assert_eq!(Param::ThrottleInput.spec().bounds, Bounds::new(Some(0.0), Some(1.0)));
    }
}
