//! Drive recording: parameter changes while the TS is active, one series
//! per key, a new drive on every entry into ACTIVE.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;
use vcu_params::{ParamChange, ParamStore, ParamValue, Param};

use crate::system::{ModeFlags, SystemState, VehicleState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub t: i64,
    pub v: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriveInfo {
    pub id: usize,
    /// Start time, unix ms.
    pub date: i64,
}

struct Drive {
    started: OffsetDateTime,
    series: BTreeMap<&'static str, Vec<Sample>>,
}

fn unix_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn to_json(v: &ParamValue) -> Value {
    match v {
        ParamValue::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        ParamValue::Bool(b) => Value::Bool(*b),
        ParamValue::Text(s) => Value::String(s.clone()),
    }
}

#[derive(Default)]
pub struct DriveHistory {
    drives: Mutex<Vec<Drive>>,
}

impl DriveHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Drive>> {
        self.drives.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(self: &Arc<Self>, params: &Arc<ParamStore>) {
        let history = Arc::downgrade(self);
        let store = Arc::downgrade(params);
        params.subscribe_all(move |change| {
            if let (Some(h), Some(p)) = (history.upgrade(), store.upgrade()) {
                h.record(&p, change);
            }
        });
    }

    fn record(&self, params: &ParamStore, change: &ParamChange) {
        if change.param == Param::SystemState
            && SystemState::from_f64(change.value.as_f64()) == SystemState::Active
        {
            self.start_drive(change.timestamp);
        }
        if params.system_state() != SystemState::Active || params.in_mode(ModeFlags::TEST_ENABLED) {
            return;
        }
        let mut drives = self.lock();
        if let Some(drive) = drives.last_mut() {
            drive
                .series
                .entry(change.param.key())
                .or_default()
                .push(Sample { t: unix_ms(change.timestamp), v: to_json(&change.value) });
        }
    }

    fn start_drive(&self, at: OffsetDateTime) {
        let mut drives = self.lock();
        drives.push(Drive { started: at, series: BTreeMap::new() });
        info!("history: recording drive {}", drives.len() - 1);
    }

    pub fn drives(&self) -> Vec<DriveInfo> {
        self.lock()
            .iter()
            .enumerate()
            .map(|(id, d)| DriveInfo { id, date: unix_ms(d.started) })
            .collect()
    }

    /// `{key: [{t, v}]}` with `t` in ms relative to the first sample of the drive.
    pub fn export(&self, index: usize) -> Option<Value> {
        let drives = self.lock();
        let drive = drives.get(index)?;
        let origin = drive.series.values().flatten().map(|s| s.t).min().unwrap_or(0);
        let mut out = serde_json::Map::new();
        for (key, samples) in &drive.series {
            let rel: Vec<Sample> = samples.iter().map(|s| Sample { t: s.t - origin, v: s.v.clone() }).collect();
            out.insert((*key).to_string(), serde_json::to_value(rel).unwrap_or(Value::Null));
        }
        Some(Value::Object(out))
    }
}
