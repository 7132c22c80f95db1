//! Periodic telemetry: one timer per message id, built from the current
//! parameter values at every tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use vcu_core::TelemetrySink;
use vcu_params::{Param, ParamStore};
use vcu_proto::lfs::{self, BrakeData, ComputerStatus, ThrottleData, VehicleData};
use vcu_proto::mavlink::common::{
    GpsFixType, MavBatteryFunction, MavBatteryType, MavMessage, BATTERY_STATUS_DATA, GPS_RAW_INT_DATA,
    RAW_IMU_DATA, SCALED_IMU_DATA,
};
use vcu_proto::{LfsMessage, VcuMessage};

use crate::outbox::{Outbox, TelemetryGate};

pub const BATTERY_STATUS_ID: u32 = 147;
pub const GPS_RAW_INT_ID: u32 = 24;
pub const RAW_IMU_ID: u32 = 27;
pub const SCALED_IMU_ID: u32 = 26;

/// `(message id, interval ms)` started on every connect.
pub const DEFAULT_INTERVALS: &[(u32, u64)] = &[
    (BATTERY_STATUS_ID, 500),
    (lfs::VEHICLE_DATA_ID, 100),
    (lfs::THROTTLE_DATA_ID, 200),
    (lfs::BRAKE_DATA_ID, 200),
    (GPS_RAW_INT_ID, 500),
    (RAW_IMU_ID, 100),
    (lfs::COMPUTER_STATUS_ID, 1000),
];

fn sat<T: TryFrom<i64> + Copy>(v: f64, lo: T, hi: T) -> T
where
    i64: From<T>,
{
    if v.is_nan() {
        return lo;
    }
    let r = v.round();
    if r <= i64::from(lo) as f64 {
        lo
    } else if r >= i64::from(hi) as f64 {
        hi
    } else {
        T::try_from(r as i64).unwrap_or(lo)
    }
}

fn i16s(v: f64) -> i16 {
    sat(v, i16::MIN, i16::MAX)
}

fn i32s(v: f64) -> i32 {
    sat(v, i32::MIN, i32::MAX)
}

fn u16s(v: f64) -> u16 {
    sat(v, u16::MIN, u16::MAX)
}

fn u32s(v: f64) -> u32 {
    sat(v, u32::MIN, u32::MAX)
}

fn u8s(v: f64) -> u8 {
    sat(v, u8::MIN, u8::MAX)
}

fn fix_type(mode: f64) -> GpsFixType {
    match u8s(mode) {
        1 => GpsFixType::GPS_FIX_TYPE_NO_FIX,
        2 => GpsFixType::GPS_FIX_TYPE_2D_FIX,
        3 => GpsFixType::GPS_FIX_TYPE_3D_FIX,
        4 => GpsFixType::GPS_FIX_TYPE_DGPS,
        5 => GpsFixType::GPS_FIX_TYPE_RTK_FLOAT,
        6 => GpsFixType::GPS_FIX_TYPE_RTK_FIXED,
        7 => GpsFixType::GPS_FIX_TYPE_STATIC,
        8 => GpsFixType::GPS_FIX_TYPE_PPP,
        _ => GpsFixType::GPS_FIX_TYPE_NO_GPS,
    }
}

/// Builds telemetry messages from the parameter store.
pub struct TelemetrySource {
    params: Arc<ParamStore>,
    started: Instant,
}

impl TelemetrySource {
    pub fn new(params: Arc<ParamStore>, started: Instant) -> Self {
        Self { params, started }
    }

    pub fn supports(id: u32) -> bool {
        matches!(
            id,
            BATTERY_STATUS_ID
                | GPS_RAW_INT_ID
                | RAW_IMU_ID
                | SCALED_IMU_ID
                | lfs::THROTTLE_DATA_ID
                | lfs::BRAKE_DATA_ID
                | lfs::VEHICLE_DATA_ID
                | lfs::COMPUTER_STATUS_ID
        )
    }

    pub fn build(&self, id: u32) -> Option<VcuMessage> {
        let n = |p| self.params.number(p);
        let msg: VcuMessage = match id {
            BATTERY_STATUS_ID => {
                let mut voltages = [u16::MAX; 10];
                voltages[0] = u16s(n(Param::LvCurVoltage) * 100.0);
                MavMessage::BATTERY_STATUS(BATTERY_STATUS_DATA {
                    current_consumed: i32s(n(Param::LvConsCap) * 1000.0),
                    energy_consumed: i32s(n(Param::LvConsEnergy) * 1000.0),
                    temperature: i16s(n(Param::LvCurTemp) * 100.0),
                    voltages,
                    current_battery: i16s(n(Param::LvCurAmp) * 10.0),
                    id: 0,
                    battery_function: MavBatteryFunction::MAV_BATTERY_FUNCTION_AVIONICS,
                    mavtype: MavBatteryType::MAV_BATTERY_TYPE_LIFE,
                    battery_remaining: sat(n(Param::LvBdi) * 100.0, 0i8, 100i8),
                    ..Default::default()
                })
                .into()
            }
            GPS_RAW_INT_ID => MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
                time_usec: (n(Param::GpsTime).max(0.0) * 1000.0) as u64,
                lat: i32s(n(Param::GpsLatitude) * 1e7),
                lon: i32s(n(Param::GpsLongitude) * 1e7),
                alt: i32s(n(Param::GpsAltitude) * 1000.0),
                eph: u16s(n(Param::GpsHdop) * 100.0),
                epv: u16s(n(Param::GpsVdop) * 100.0),
                vel: u16s(n(Param::GpsSpeed) * 100.0),
                cog: u16s(n(Param::GpsHeading) * 100.0),
                fix_type: fix_type(n(Param::GpsMode)),
                satellites_visible: u8s(n(Param::GpsNumSats)),
                ..Default::default()
            })
            .into(),
            RAW_IMU_ID => MavMessage::RAW_IMU(RAW_IMU_DATA {
                time_usec: self.started.elapsed().as_micros() as u64,
                xacc: i16s(n(Param::AccLatRaw) * 1000.0),
                yacc: i16s(n(Param::AccLonRaw) * 1000.0),
                zacc: i16s(n(Param::AccVerRaw) * 1000.0),
                xgyro: i16s(n(Param::GyroLatRaw) * 1000.0),
                ygyro: i16s(n(Param::GyroLonRaw) * 1000.0),
                zgyro: i16s(n(Param::GyroVerRaw) * 1000.0),
                ..Default::default()
            })
            .into(),
            SCALED_IMU_ID => {
                let g = n(Param::GConstant);
                MavMessage::SCALED_IMU(SCALED_IMU_DATA {
                    time_boot_ms: self.started.elapsed().as_millis() as u32,
                    xacc: i16s(n(Param::AccLat) * 1000.0 / g),
                    yacc: i16s(n(Param::AccLon) * 1000.0 / g),
                    zacc: i16s(n(Param::AccVer) * 1000.0 / g),
                    xgyro: i16s(n(Param::GyroLat) * 1000.0),
                    ygyro: i16s(n(Param::GyroLon) * 1000.0),
                    zgyro: i16s(n(Param::GyroVer) * 1000.0),
                    ..Default::default()
                })
                .into()
            }
            lfs::THROTTLE_DATA_ID => LfsMessage::ThrottleData(ThrottleData {
                input: n(Param::ThrottleInput) as f32,
                output: n(Param::ThrottleOutput) as f32,
                raw: u8s(n(Param::ThrottleRaw)),
            })
            .into(),
            lfs::BRAKE_DATA_ID => LfsMessage::BrakeData(BrakeData {
                input: n(Param::BrakeInput) as f32,
                output: n(Param::BrakeOutput) as f32,
                raw: u8s(n(Param::BrakeRaw)),
            })
            .into(),
            lfs::VEHICLE_DATA_ID => LfsMessage::VehicleData(VehicleData {
                power: n(Param::VehiclePower) as f32,
                speed: n(Param::VehicleSpeed) as f32,
                heading: n(Param::VehicleHeading) as f32,
                steering: n(Param::VehicleSteering) as f32,
            })
            .into(),
            lfs::COMPUTER_STATUS_ID => LfsMessage::ComputerStatus(ComputerStatus {
                uptime: self.started.elapsed().as_secs() as u32,
                ram_usage: u32s(n(Param::RamUsage)),
                ram_total: u32s(n(Param::RamTotal)),
                storage_usage: u32s(n(Param::StorageUsage)),
                storage_total: u32s(n(Param::StorageTotal)),
                temperature_core: i16s(n(Param::CpuTemp) * 100.0),
                temperature_board: i16s(n(Param::BoardTemp) * 100.0),
                cpu_load: u8s(n(Param::CpuCores)),
            })
            .into(),
            _ => return None,
        };
        Some(msg)
    }
}

/// What SET_MESSAGE_INTERVAL asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalChange {
    Set(Duration),
    Disabled,
    Default,
}

impl IntervalChange {
    /// `< 0` disables, `0` restores the default, anything else is milliseconds.
    pub fn from_param(ms: f32) -> Self {
        if ms < 0.0 {
            IntervalChange::Disabled
        } else if ms == 0.0 {
            IntervalChange::Default
        } else {
            IntervalChange::Set(Duration::from_secs_f64(f64::from(ms) / 1000.0))
        }
    }
}

pub struct Periodic {
    source: Arc<TelemetrySource>,
    outbox: Arc<Outbox>,
    gate: Arc<TelemetryGate>,
    intervals: Mutex<BTreeMap<u32, Duration>>,
    timers: Mutex<HashMap<u32, AbortHandle>>,
}

fn defaults() -> BTreeMap<u32, Duration> {
    DEFAULT_INTERVALS.iter().map(|(id, ms)| (*id, Duration::from_millis(*ms))).collect()
}

impl Periodic {
    pub fn new(source: Arc<TelemetrySource>, outbox: Arc<Outbox>, gate: Arc<TelemetryGate>) -> Self {
        Self {
            source,
            outbox,
            gate,
            intervals: Mutex::new(defaults()),
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn intervals(&self) -> MutexGuard<'_, BTreeMap<u32, Duration>> {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<u32, AbortHandle>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interval(&self, id: u32) -> Option<Duration> {
        self.intervals().get(&id).copied()
    }

    /// Arms a timer for every configured message.
    pub fn start(&self) {
        let current: Vec<(u32, Duration)> = self.intervals().iter().map(|(k, v)| (*k, *v)).collect();
        for (id, every) in current {
            self.arm(id, every);
        }
    }

    pub fn stop(&self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }

    /// Returns false for ids there is no message builder for.
    pub fn set(&self, id: u32, change: IntervalChange) -> bool {
        if !TelemetrySource::supports(id) {
            warn!("periodic: no telemetry for message id {}", id);
            return false;
        }
        let every = match change {
            IntervalChange::Set(d) => Some(d),
            IntervalChange::Disabled => None,
            IntervalChange::Default => defaults().get(&id).copied(),
        };
        match every {
            Some(d) => {
                self.intervals().insert(id, d);
            }
            None => {
                self.intervals().remove(&id);
            }
        }
        let running = self.timers().remove(&id).map(|t| t.abort()).is_some();
        if let Some(d) = every {
            if running || self.outbox.is_open() {
                self.arm(id, d);
            }
        }
        debug!("periodic: message {} every {:?}", id, every);
        true
    }

    fn arm(&self, id: u32, every: Duration) {
        let source = self.source.clone();
        let outbox = self.outbox.clone();
        let gate = self.gate.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + every, every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if !gate.is_open() {
                    continue;
                }
                if let Some(msg) = source.build(id) {
                    outbox.send(msg);
                }
            }
        });
        if let Some(old) = self.timers().insert(id, task.abort_handle()) {
            old.abort();
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (Arc<ParamStore>, Arc<Outbox>, Arc<TelemetryGate>, Periodic) {
        let params = Arc::new(ParamStore::in_memory());
        let outbox = Outbox::new();
        let gate = TelemetryGate::new();
        let source = Arc::new(TelemetrySource::new(params.clone(), Instant::now()));
        let periodic = Periodic::new(source, outbox.clone(), gate.clone());
        (params, outbox, gate, periodic)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<VcuMessage>) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Ok(m) = rx.try_recv() {
            ids.push(m.message_id());
        }
        ids
    }

    #[test]
    fn test_interval_param_semantics() {
        assert_eq!(IntervalChange::from_param(-1.0), IntervalChange::Disabled);
        assert_eq!(IntervalChange::from_param(0.0), IntervalChange::Default);
        assert_eq!(IntervalChange::from_param(250.0), IntervalChange::Set(Duration::from_millis(250)));
    }

    #[test]
    fn test_builders_scale_values() {
        let (params, ..) = rig();
        params.set(Param::ThrottleInput, 0.5).unwrap();
        params.set(Param::ThrottleRaw, 200.0).unwrap();
        params.set(Param::LvBdi, 0.42).unwrap();
        params.set(Param::LvCurAmp, 3.3).unwrap();
        params.set(Param::GpsLatitude, 57.7).unwrap();
        let source = TelemetrySource::new(params, Instant::now());

        match source.build(lfs::THROTTLE_DATA_ID) {
            Some(VcuMessage::Lfs(LfsMessage::ThrottleData(t))) => {
                assert_eq!(t.input, 0.5);
                assert_eq!(t.raw, 200);
            }
            other => panic!("unexpected {:?}", other),
        }
        match source.build(BATTERY_STATUS_ID) {
            Some(VcuMessage::Common(MavMessage::BATTERY_STATUS(b))) => {
                assert_eq!(b.battery_remaining, 42);
                assert_eq!(b.current_battery, 33);
            }
            other => panic!("unexpected {:?}", other),
        }
        match source.build(GPS_RAW_INT_ID) {
            Some(VcuMessage::Common(MavMessage::GPS_RAW_INT(g))) => assert_eq!(g.lat, 577_000_000),
            other => panic!("unexpected {:?}", other),
        }
        assert!(source.build(0).is_none());
    }

    #[test]
    fn test_saturating_conversions() {
        assert_eq!(i16s(1e9), i16::MAX);
        assert_eq!(u8s(-3.0), 0);
        assert_eq!(u16s(f64::NAN), 0);
        assert_eq!(u8s(12.6), 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_rates_and_gate() {
        let (_params, outbox, gate, periodic) = rig();
        let mut rx = outbox.open();
        periodic.start();

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let ids = drain(&mut rx.normal);
        let count = |id| ids.iter().filter(|x| **x == id).count();
        assert_eq!(count(lfs::VEHICLE_DATA_ID), 10);
        assert_eq!(count(lfs::THROTTLE_DATA_ID), 5);
        assert_eq!(count(BATTERY_STATUS_ID), 2);
        assert_eq!(count(lfs::COMPUTER_STATUS_ID), 1);

        let hold = gate.suspend();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(drain(&mut rx.normal).is_empty());
        drop(hold);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!drain(&mut rx.normal).is_empty());
        periodic.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_changes_rate() {
        let (_params, outbox, _gate, periodic) = rig();
        let mut rx = outbox.open();
        periodic.start();

        assert!(periodic.set(lfs::VEHICLE_DATA_ID, IntervalChange::Disabled));
        assert!(periodic.set(lfs::BRAKE_DATA_ID, IntervalChange::Set(Duration::from_millis(50))));
        assert!(periodic.set(SCALED_IMU_ID, IntervalChange::Set(Duration::from_millis(500))));
        assert!(!periodic.set(12345, IntervalChange::Default));

        tokio::time::sleep(Duration::from_millis(1010)).await;
        let ids = drain(&mut rx.normal);
        let count = |id| ids.iter().filter(|x| **x == id).count();
        assert_eq!(count(lfs::VEHICLE_DATA_ID), 0);
        assert_eq!(count(lfs::BRAKE_DATA_ID), 20);
        assert_eq!(count(SCALED_IMU_ID), 2);

        periodic.set(lfs::VEHICLE_DATA_ID, IntervalChange::Default);
        assert_eq!(periodic.interval(lfs::VEHICLE_DATA_ID), Some(Duration::from_millis(100)));
        periodic.stop();
    }
}
