//! Turns driver events into parameter writes and derived values.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use vcu_params::{Param, ParamStore};

use crate::system::{ModeFlags, SystemState, VehicleState};
use crate::traction::TractionSystem;

/// Wheel pulses per revolution, as velocity factor per Hz and meter of radius.
pub const FREQ_TO_VELOCITY: f64 = std::f64::consts::PI * 2.0 / 24.0;
const HV_CELLS: f64 = 32.0;
const HV_INTERNAL_RESISTANCE: f64 = 0.7e-3;

/// NMEA GGA fix quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgaQuality {
    Fix = 1,
    Dgps = 2,
    Pps = 3,
    Rtk = 4,
    RtkFloat = 5,
    Estimated = 6,
    Manual = 7,
    Simulated = 8,
}

impl GgaQuality {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(GgaQuality::Fix),
            2 => Some(GgaQuality::Dgps),
            3 => Some(GgaQuality::Pps),
            4 => Some(GgaQuality::Rtk),
            5 => Some(GgaQuality::RtkFloat),
            6 => Some(GgaQuality::Estimated),
            7 => Some(GgaQuality::Manual),
            8 => Some(GgaQuality::Simulated),
            _ => None,
        }
    }

    /// MAVLink GPS_FIX_TYPE.
    pub fn fix_type(self) -> u8 {
        match self {
            GgaQuality::Fix => 2,
            GgaQuality::Dgps => 4,
            GgaQuality::Pps => 8,
            GgaQuality::Rtk => 6,
            GgaQuality::RtkFloat => 5,
            GgaQuality::Estimated | GgaQuality::Manual | GgaQuality::Simulated => 7,
        }
    }
}

/// Whatever subset of fields one NMEA sentence carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpsFix {
    pub time: Option<OffsetDateTime>,
    pub position: Option<(f64, f64)>,
    pub altitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub satellites: Option<u8>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub quality: Option<GgaQuality>,
    pub fix3d: Option<bool>,
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    pub cpu_load: f64,
    pub cpu_temp: f64,
    pub ram_usage_mb: f64,
    pub ram_total_mb: f64,
    pub storage_type: f64,
    pub storage_usage_mb: f64,
    pub storage_total_mb: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Analog { throttle_raw: f64, brake_raw: f64, steering_raw: f64, board_temp_raw: f64 },
    /// Index sensor frequencies in Hz.
    WheelIndex { rear: f64, front_right: f64, front_left: f64 },
    TsActive(bool),
    /// Accelerations in g, rates in deg/s.
    Imu { temp: f64, acc_lat: f64, acc_lon: f64, acc_ver: f64, gyro_lat: f64, gyro_lon: f64, gyro_ver: f64 },
    Power { power_mw: f64, voltage: f64, current_ma: f64 },
    Gps(GpsFix),
    Can { current: f64, temps: [f64; 3] },
    System(SystemInfo),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Largest accepted LV energy step, as a fraction of the reference value.
    pub ina_glitch_fraction: f64,
    pub channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { ina_glitch_fraction: 0.1, channel_capacity: 256 }
    }
}

/// `value` mapped linearly from `[low1, high1]` onto `[low2, high2]`; 0 when undefined.
pub fn map_range(value: f64, low1: f64, high1: f64, low2: f64, high2: f64) -> f64 {
    let v = low2 + (high2 - low2) * (value - low1) / (high1 - low1);
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Raw pedal reading to [0, 1]; everything below the deadzone reads 0.
pub fn shape_pedal(raw: f64, raw_min: f64, raw_max: f64, deadzone: f64) -> f64 {
    let normalized = map_range(raw, raw_min, raw_max, 0.0, 1.0);
    map_range(normalized.max(deadzone), deadzone, 1.0, 0.0, 1.0).clamp(0.0, 1.0)
}

/// Open circuit voltage of one LFP cell against depth of discharge.
const LFP_OCV: &[(f64, f64)] = &[
    (0.0, 3.40),
    (0.1, 3.33),
    (0.3, 3.30),
    (0.5, 3.28),
    (0.7, 3.25),
    (0.8, 3.22),
    (0.9, 3.20),
    (0.95, 3.10),
    (1.0, 2.50),
];

pub fn cell_ocv(depth_of_discharge: f64) -> f64 {
    let x = depth_of_discharge.clamp(0.0, 1.0);
    for w in LFP_OCV.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    LFP_OCV[LFP_OCV.len() - 1].1
}

/// Average of the speed sources above 1 km/h, rounded.
pub fn fuse_speed(speeds_ms: &[f64]) -> f64 {
    let used: Vec<f64> = speeds_ms.iter().map(|s| s * 3.6).filter(|s| s.is_finite() && *s > 1.0).collect();
    if used.is_empty() {
        return 0.0;
    }
    (used.iter().sum::<f64>() / used.len() as f64).round()
}

#[derive(Default)]
struct Integrators {
    last_imu: Option<Instant>,
    prev_acc_lon: f64,
    last_current: Option<Instant>,
    prev_current: f64,
    last_power: Option<Instant>,
    prev_power: f64,
}

pub struct SensorIngest {
    params: Arc<ParamStore>,
    traction: Arc<TractionSystem>,
    cfg: IngestConfig,
    state: Mutex<Integrators>,
}

impl SensorIngest {
    pub fn new(params: Arc<ParamStore>, traction: Arc<TractionSystem>, cfg: IngestConfig) -> Arc<Self> {
        Arc::new(Self { params, traction, cfg, state: Mutex::new(Integrators::default()) })
    }

    fn state(&self) -> MutexGuard<'_, Integrators> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, param: Param, value: f64) {
        if let Err(e) = self.params.set(param, value) {
            debug!("ingest: {}", e);
        }
    }

    /// Registers the listeners for derived battery and speed values.
    pub fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::GpsSpeed], move |_| {
            if let Some(i) = weak.upgrade() {
                i.update_vehicle_speed();
            }
        });

        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::LvCurAmp], move |c| {
            if let Some(i) = weak.upgrade() {
                i.integrate_lv_current(c.value.as_f64());
            }
        });
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::LvCurPower], move |c| {
            if let Some(i) = weak.upgrade() {
                i.integrate_lv_power(c.value.as_f64());
            }
        });

        let params = Arc::downgrade(&self.params);
        self.params.subscribe(&[Param::LvConsEnergy, Param::LvMaxEnergy], move |_| {
            let Some(p) = params.upgrade() else { return };
            let max = p.number(Param::LvMaxEnergy);
            if max > 0.0 {
                let bdi = ((max - p.number(Param::LvConsEnergy)) / max).clamp(0.0, 1.0);
                p.set(Param::LvBdi, bdi).ok();
            }
        });

        let params = Arc::downgrade(&self.params);
        self.params.subscribe(&[Param::HvConsCap, Param::HvMaxCap], move |_| {
            let Some(p) = params.upgrade() else { return };
            let max = p.number(Param::HvMaxCap);
            if max > 0.0 {
                let bdi = ((max - p.number(Param::HvConsCap)) / max).clamp(0.0, 1.0);
                p.set(Param::HvBdi, bdi).ok();
                persist(&p, Param::HvBdi);
            }
        });

        let params = Arc::downgrade(&self.params);
        self.params.subscribe(&[Param::HvConsCap, Param::HvConsEnergy], move |c| {
            if let Some(p) = params.upgrade() {
                persist(&p, c.param);
            }
        });

        let params = Arc::downgrade(&self.params);
        self.params.subscribe(&[Param::HvCurAmp], move |c| {
            let Some(p) = params.upgrade() else { return };
            let amp = c.value.as_f64();
            let voltage = cell_ocv(1.0 - p.number(Param::HvBdi)) * HV_CELLS - amp * HV_INTERNAL_RESISTANCE;
            if let Err(e) = p.set(Param::HvCurVoltage, voltage) {
                debug!("ingest: {}", e);
            }
            if let Err(e) = p.set(Param::VehiclePower, amp * p.number(Param::HvCurVoltage)) {
                debug!("ingest: {}", e);
            }
        });
    }

    fn integrate_lv_current(&self, amp: f64) {
        let now = Instant::now();
        let mut st = self.state();
        if let Some(last) = st.last_current {
            let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            let change = dt_ms * (st.prev_current + amp) / 2000.0;
            let limit = self.cfg.ina_glitch_fraction * self.params.number(Param::LvMaxEnergy) / 13.2;
            if change < limit {
                st.prev_current = amp;
                drop(st);
                self.put(Param::LvConsCap, self.params.number(Param::LvConsCap) + change);
                persist(&self.params, Param::LvConsCap);
                self.state().last_current = Some(now);
                return;
            }
            debug!("ingest: rejected capacity step {} (amp {}, dt {} ms)", change, amp, dt_ms);
        }
        st.last_current = Some(now);
    }

    fn integrate_lv_power(&self, watt: f64) {
        let now = Instant::now();
        let mut st = self.state();
        if let Some(last) = st.last_power {
            let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            let change = dt_ms * (st.prev_power + watt) / (2000.0 * 3600.0);
            if change < self.cfg.ina_glitch_fraction * watt {
                st.prev_power = watt;
                drop(st);
                self.put(Param::LvConsEnergy, self.params.number(Param::LvConsEnergy) + change);
                persist(&self.params, Param::LvConsEnergy);
                self.state().last_power = Some(now);
                return;
            }
            debug!("ingest: rejected energy step {} (power {}, dt {} ms)", change, watt, dt_ms);
        }
        st.last_power = Some(now);
    }

    pub fn update_vehicle_speed(&self) {
        let p = &self.params;
        let speed = fuse_speed(&[
            p.number(Param::FlWheelSpeed),
            p.number(Param::FrWheelSpeed),
            p.number(Param::RearAxleSpeed),
            p.number(Param::GpsSpeed),
        ]);
        self.put(Param::VehicleSpeed, speed);
    }

    pub fn handle(&self, event: SensorEvent) {
        let hil = self.params.in_mode(ModeFlags::HIL_ENABLED);
        match event {
            SensorEvent::Analog { throttle_raw, brake_raw, steering_raw, board_temp_raw } => {
                let p = &self.params;
                self.put(Param::ThrottleRaw, throttle_raw);
                self.put(Param::BrakeRaw, brake_raw);
                self.put(Param::SteeringRaw, steering_raw);
                self.put(Param::BoardTemp, (board_temp_raw - 100.0) / 10.0);
                let throttle = shape_pedal(
                    p.number(Param::ThrottleRaw),
                    p.number(Param::ThrottleRawMin),
                    p.number(Param::ThrottleRawMax),
                    p.number(Param::ThrottleDz),
                );
                self.put(Param::ThrottleInput, throttle);
                let brake = shape_pedal(
                    p.number(Param::BrakeRaw),
                    p.number(Param::BrakeRawMin),
                    p.number(Param::BrakeRawMax),
                    p.number(Param::BrakeDz),
                );
                self.put(Param::BrakeInput, brake);
            }
            SensorEvent::WheelIndex { rear, front_right, front_left } => {
                self.put(Param::Ind3RawFreq, rear);
                self.put(Param::Ind2RawFreq, front_right);
                self.put(Param::Ind1RawFreq, front_left);
                let p = &self.params;
                let front = p.number(Param::FrontWheelRad) * FREQ_TO_VELOCITY;
                self.put(Param::FlWheelSpeed, p.number(Param::Ind1RawFreq) * front);
                self.put(Param::FrWheelSpeed, p.number(Param::Ind2RawFreq) * front);
                self.put(
                    Param::RearAxleSpeed,
                    p.number(Param::Ind3RawFreq) * p.number(Param::RearWheelRad) * FREQ_TO_VELOCITY,
                );
                self.update_vehicle_speed();
            }
            SensorEvent::TsActive(on) => self.on_ts_active(on),
            SensorEvent::Imu { .. } | SensorEvent::Power { .. } if hil => {}
            SensorEvent::Imu { temp, acc_lat, acc_lon, acc_ver, gyro_lat, gyro_lon, gyro_ver } => {
                let g = self.params.number(Param::GConstant);
                self.put(Param::ImuTemp, temp);
                self.put(Param::AccLatRaw, acc_lat);
                self.put(Param::AccLonRaw, acc_lon);
                self.put(Param::AccVerRaw, acc_ver);
                self.put(Param::GyroLatRaw, gyro_lat);
                self.put(Param::GyroLonRaw, gyro_lon);
                self.put(Param::GyroVerRaw, gyro_ver);
                self.put(Param::AccLat, acc_lat * g);
                self.put(Param::AccLon, acc_lon * g);
                self.put(Param::AccVer, acc_ver * g);
                self.put(Param::GyroLat, gyro_lat);
                self.put(Param::GyroLon, gyro_lon);
                self.put(Param::GyroVer, gyro_ver);
                self.integrate_imu();
            }
            SensorEvent::Power { power_mw, voltage, current_ma } => {
                self.put(Param::LvCurPower, power_mw / 1000.0);
                self.put(Param::LvCurVoltage, voltage);
                self.put(Param::LvCurAmp, current_ma / 1000.0);
            }
            SensorEvent::Gps(fix) => self.on_gps(fix),
            SensorEvent::Can { current, temps } => {
                let hottest = temps.iter().copied().fold(f64::MIN, f64::max);
                self.put(Param::HvCurTemp, hottest / 100.0);
                self.put(Param::HvCurAmp, current / 10.0);
            }
            SensorEvent::System(info) => {
                self.put(Param::CpuCores, info.cpu_load);
                self.put(Param::CpuTemp, info.cpu_temp);
                self.put(Param::RamTotal, info.ram_total_mb);
                self.put(Param::RamUsage, info.ram_usage_mb);
                self.put(Param::StorageType, info.storage_type);
                self.put(Param::StorageUsage, info.storage_usage_mb);
                self.put(Param::StorageTotal, info.storage_total_mb);
            }
        }
    }

    fn integrate_imu(&self) {
        let now = Instant::now();
        let acc_lon = self.params.number(Param::AccLon);
        let mut st = self.state();
        if let Some(last) = st.last_imu {
            let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            let dv = dt_ms * (st.prev_acc_lon + acc_lon) / 2000.0;
            st.prev_acc_lon = acc_lon;
            st.last_imu = Some(now);
            drop(st);
            self.put(Param::ImuLonSpeed, self.params.number(Param::ImuLonSpeed) + dv);
            self.update_vehicle_speed();
            return;
        }
        st.last_imu = Some(now);
    }

    fn on_ts_active(&self, on: bool) {
        let state = self.params.system_state();
        if state == SystemState::Standby && on {
            self.params.set_system_state(SystemState::Active);
        } else if state == SystemState::Active && !on {
            self.params.set_system_state(SystemState::Standby);
            if self.params.flag(Param::TsActiveOut) {
                let traction = self.traction.clone();
                tokio::spawn(async move { traction.on_unexpected_ts_shutdown().await });
            }
        }
    }

    fn on_gps(&self, fix: GpsFix) {
        if let Some(t) = fix.time {
            let ms = t.unix_timestamp_nanos() / 1_000_000;
            self.put(Param::GpsTime, ms as f64);
        }
        if let Some((lat, lon)) = fix.position {
            self.put(Param::GpsLatitude, lat);
            self.put(Param::GpsLongitude, lon);
        }
        if let Some(alt) = fix.altitude {
            self.put(Param::GpsAltitude, alt);
        }
        if let Some(kmh) = fix.speed_kmh {
            self.put(Param::GpsSpeed, kmh / 3.6);
        }
        if let Some(n) = fix.satellites {
            self.put(Param::GpsNumSats, n as f64);
        }
        if let Some(h) = fix.hdop {
            self.put(Param::GpsHdop, h);
        }
        if let Some(v) = fix.vdop {
            self.put(Param::GpsVdop, v);
        }
        if let Some(q) = fix.quality {
            self.put(Param::GpsMode, q.fix_type() as f64);
        }
        if let Some(fix3d) = fix.fix3d {
            self.put(Param::GpsMode, if fix3d { 3.0 } else { 2.0 });
        }
        if let Some(h) = fix.heading {
            self.put(Param::GpsHeading, h);
        }
        if self.params.number(Param::GpsMode) == 0.0 {
            self.put(Param::GpsMode, 1.0);
        }
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SensorEvent>, cancel: CancellationToken) {
        info!("ingest: running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => {
                        error!("ingest: all sensor sources closed");
                        break;
                    }
                },
            }
        }
    }
}

fn persist(params: &ParamStore, param: Param) {
    if let Err(e) = params.persist(param) {
        error!("ingest: {}", e);
    }
}
