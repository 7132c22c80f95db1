//! Actuator capabilities. Each has a present (sysfs/IIO) and a simulated
//! implementation, chosen once at startup from [`HardwareConfig`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::ingest::SensorEvent;

/// Relay board channel that closes the TS activation loop.
pub const TS_RELAY_CHANNEL: u8 = 2;
pub const RELAY_CHANNELS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Red,
    Green,
    Blue,
}

pub trait RelayBoard: Send + Sync {
    /// `channel` is 1-based.
    fn set_output(&self, channel: u8, on: bool) -> io::Result<()>;
}

/// Digital potentiometer feeding the motor controller, normalized to [0, 1].
pub trait Wiper: Send + Sync {
    fn write(&self, value: f64) -> io::Result<()>;
}

pub trait LedDriver: Send + Sync {
    fn set(&self, led: Led, on: bool) -> io::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub simulated: bool,
    pub gpio_root: PathBuf,
    /// GPIO number per relay channel, channel 1 first.
    pub relay_gpios: Vec<u32>,
    /// Red, green, blue.
    pub led_gpios: [u32; 3],
    pub throttle_wiper: PathBuf,
    pub brake_wiper: PathBuf,
    pub wiper_max_raw: u32,
    /// Delay before the simulated TS feedback follows the relay.
    pub sim_ts_delay_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            simulated: true,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            relay_gpios: vec![512, 513, 514, 515, 516, 517, 519, 520],
            led_gpios: [518, 533, 538],
            throttle_wiper: PathBuf::from("/sys/bus/iio/devices/iio:device0/out_resistance0_raw"),
            brake_wiper: PathBuf::from("/sys/bus/iio/devices/iio:device0/out_resistance1_raw"),
            wiper_max_raw: 127,
            sim_ts_delay_ms: 1000,
        }
    }
}

impl HardwareConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.relay_gpios.len() == RELAY_CHANNELS,
            "hardware.relay_gpios needs {} entries, got {}",
            RELAY_CHANNELS,
            self.relay_gpios.len()
        );
        ensure!(self.wiper_max_raw > 0, "hardware.wiper_max_raw must be > 0");
        Ok(())
    }
}

fn export_gpio(root: &Path, gpio: u32) -> Result<PathBuf> {
    let dir = root.join(format!("gpio{}", gpio));
    if !dir.exists() {
        std::fs::write(root.join("export"), gpio.to_string())
            .with_context(|| format!("export gpio {}", gpio))?;
    }
    std::fs::write(dir.join("direction"), "out").with_context(|| format!("set gpio {} as output", gpio))?;
    Ok(dir.join("value"))
}

fn write_value(path: &Path, on: bool) -> io::Result<()> {
    std::fs::write(path, if on { "1" } else { "0" })
}

pub struct SysfsRelayBoard {
    values: Vec<PathBuf>,
}

impl SysfsRelayBoard {
    pub fn open(cfg: &HardwareConfig) -> Result<Self> {
        cfg.validate()?;
        let values = cfg
            .relay_gpios
            .iter()
            .map(|g| export_gpio(&cfg.gpio_root, *g))
            .collect::<Result<Vec<_>>>()?;
        info!("relays: {} channels on {}", values.len(), cfg.gpio_root.display());
        Ok(Self { values })
    }
}

impl RelayBoard for SysfsRelayBoard {
    fn set_output(&self, channel: u8, on: bool) -> io::Result<()> {
        let path = (channel as usize)
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no relay channel {}", channel)))?;
        write_value(path, on)
    }
}

pub struct SysfsLeds {
    values: [PathBuf; 3],
}

impl SysfsLeds {
    pub fn open(cfg: &HardwareConfig) -> Result<Self> {
        let [r, g, b] = cfg.led_gpios;
        Ok(Self {
            values: [
                export_gpio(&cfg.gpio_root, r)?,
                export_gpio(&cfg.gpio_root, g)?,
                export_gpio(&cfg.gpio_root, b)?,
            ],
        })
    }
}

impl LedDriver for SysfsLeds {
    fn set(&self, led: Led, on: bool) -> io::Result<()> {
        write_value(&self.values[led as usize], on)
    }
}

pub struct IioWiper {
    path: PathBuf,
    max_raw: u32,
}

impl IioWiper {
    pub fn new(path: impl Into<PathBuf>, max_raw: u32) -> Self {
        Self { path: path.into(), max_raw }
    }

    pub fn raw_for(&self, value: f64) -> u32 {
        let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        (v * self.max_raw as f64).round() as u32
    }
}

impl Wiper for IioWiper {
    fn write(&self, value: f64) -> io::Result<()> {
        std::fs::write(&self.path, self.raw_for(value).to_string())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay board that keeps channel state in memory and records every write.
///
/// With feedback attached, switching the TS relay reports the new TS state
/// on the sensor channel after a delay, like the real precharge circuit does.
#[derive(Default)]
pub struct SimRelayBoard {
    writes: Mutex<Vec<(u8, bool)>>,
    feedback: Option<(mpsc::Sender<SensorEvent>, Duration)>,
    fail: Mutex<bool>,
}

impl SimRelayBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feedback(tx: mpsc::Sender<SensorEvent>, delay: Duration) -> Self {
        Self { feedback: Some((tx, delay)), ..Self::default() }
    }

    pub fn writes(&self) -> Vec<(u8, bool)> {
        lock(&self.writes).clone()
    }

    pub fn clear(&self) {
        lock(&self.writes).clear();
    }

    /// Makes subsequent writes fail with an I/O error.
    pub fn set_failing(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }
}

impl RelayBoard for SimRelayBoard {
    fn set_output(&self, channel: u8, on: bool) -> io::Result<()> {
        if *lock(&self.fail) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated relay failure"));
        }
        lock(&self.writes).push((channel, on));
        debug!("relays: sim channel {} -> {}", channel, on);

        if channel == TS_RELAY_CHANNEL {
            if let (Some((tx, delay)), Ok(handle)) = (&self.feedback, tokio::runtime::Handle::try_current()) {
                let tx = tx.clone();
                let delay = *delay;
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.send(SensorEvent::TsActive(on)).await.ok();
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SimLeds {
    state: Mutex<[bool; 3]>,
}

impl SimLeds {
    pub fn state(&self, led: Led) -> bool {
        lock(&self.state)[led as usize]
    }
}

impl LedDriver for SimLeds {
    fn set(&self, led: Led, on: bool) -> io::Result<()> {
        lock(&self.state)[led as usize] = on;
        Ok(())
    }
}

#[derive(Default)]
pub struct SimWiper {
    writes: Mutex<Vec<f64>>,
}

impl SimWiper {
    pub fn writes(&self) -> Vec<f64> {
        lock(&self.writes).clone()
    }

    pub fn last(&self) -> Option<f64> {
        lock(&self.writes).last().copied()
    }
}

impl Wiper for SimWiper {
    fn write(&self, value: f64) -> io::Result<()> {
        lock(&self.writes).push(value);
        Ok(())
    }
}

/// One owner per hardware handle.
#[derive(Clone)]
pub struct Hardware {
    pub relays: Arc<dyn RelayBoard>,
    pub leds: Arc<dyn LedDriver>,
    pub throttle: Arc<dyn Wiper>,
    pub brake: Arc<dyn Wiper>,
}

impl Hardware {
    pub fn from_config(cfg: &HardwareConfig, sensors: mpsc::Sender<SensorEvent>) -> Result<Self> {
        if cfg.simulated {
            info!("hardware: using simulated actuators");
            return Ok(Self {
                relays: Arc::new(SimRelayBoard::with_feedback(sensors, Duration::from_millis(cfg.sim_ts_delay_ms))),
                leds: Arc::new(SimLeds::default()),
                throttle: Arc::new(SimWiper::default()),
                brake: Arc::new(SimWiper::default()),
            });
        }
        Ok(Self {
            relays: Arc::new(SysfsRelayBoard::open(cfg)?),
            leds: Arc::new(SysfsLeds::open(cfg)?),
            throttle: Arc::new(IioWiper::new(&cfg.throttle_wiper, cfg.wiper_max_raw)),
            brake: Arc::new(IioWiper::new(&cfg.brake_wiper, cfg.wiper_max_raw)),
        })
    }
}
