//! NMEA 0183 receiver: GGA, RMC and GSA sentences turned into GPS fixes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vcu_core::{GgaQuality, GpsFix, SensorEvent};

const KNOTS_TO_KMH: f64 = 1.852;
const REOPEN_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub enabled: bool,
    pub device: String,
    pub baud: u32,
    /// Replays an NMEA log instead of opening `device`.
    pub replay: Option<PathBuf>,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self { enabled: false, device: "/dev/ttyAMA5".into(), baud: 9600, replay: None }
    }
}

pub enum NmeaSource {
    Serial(BufReader<SerialStream>),
    File(BufReader<File>),
}

impl NmeaSource {
    pub fn open(cfg: &GpsConfig) -> Result<Self> {
        if let Some(path) = &cfg.replay {
            let f = std::fs::File::open(path).with_context(|| format!("open nmea log {}", path.display()))?;
            return Ok(Self::File(BufReader::new(File::from_std(f))));
        }
        let port = tokio_serial::new(&cfg.device, cfg.baud)
            .open_native_async()
            .with_context(|| format!("open serial {}", cfg.device))?;
        Ok(Self::Serial(BufReader::new(port)))
    }

    /// Next line; a replay file is read at most once per 100 ms and loops
    /// back to waiting at its end.
    async fn next_line(&mut self, line: &mut String) -> Result<()> {
        loop {
            line.clear();
            match self {
                NmeaSource::Serial(r) => {
                    if r.read_line(line).await? == 0 {
                        anyhow::bail!("serial port closed");
                    }
                    return Ok(());
                }
                NmeaSource::File(r) => {
                    if r.read_line(line).await? > 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}

/// Keeps the previous position to derive a heading from consecutive fixes.
#[derive(Debug, Default)]
pub struct NmeaParser {
    last_position: Option<(f64, f64)>,
    date: Option<Date>,
}

fn checksum_ok(body: &str, sum: &str) -> bool {
    let calc = body.bytes().fold(0u8, |acc, b| acc ^ b);
    u8::from_str_radix(sum.trim(), 16).map(|s| s == calc).unwrap_or(false)
}

/// `ddmm.mmmm` (or `dddmm.mmmm`) with its hemisphere to signed degrees.
fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    let dot = v.find('.').unwrap_or(v.len());
    if dot < 3 {
        return None;
    }
    let deg_len = dot - 2;
    let deg: f64 = v[..deg_len].parse().ok()?;
    let min: f64 = v[deg_len..].parse().ok()?;
    let out = deg + min / 60.0;
    match hemi {
        "S" | "W" => Some(-out),
        "N" | "E" => Some(out),
        _ => None,
    }
}

fn parse_time(v: &str) -> Option<Time> {
    if v.len() < 6 {
        return None;
    }
    let h: u8 = v[0..2].parse().ok()?;
    let m: u8 = v[2..4].parse().ok()?;
    let s: f64 = v[4..].parse().ok()?;
    let millis = ((s.fract() * 1000.0).round() as u16).min(999);
    Time::from_hms_milli(h, m, s.trunc() as u8, millis).ok()
}

fn parse_date(v: &str) -> Option<Date> {
    if v.len() != 6 {
        return None;
    }
    let d: u8 = v[0..2].parse().ok()?;
    let m: u8 = v[2..4].parse().ok()?;
    let y: i32 = v[4..6].parse().ok()?;
    Date::from_calendar_date(2000 + y, Month::try_from(m).ok()?, d).ok()
}

/// Initial great-circle bearing from `a` to `b`, degrees in [0, 360).
pub fn bearing((lat1, lon1): (f64, f64), (lat2, lon2): (f64, f64)) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dl = (lon2 - lon1).to_radians();
    let y = dl.sin() * p2.cos();
    let x = p1.cos() * p2.sin() - p1.sin() * p2.cos() * dl.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields carried by one sentence; None for foreign, empty or corrupt lines.
    pub fn parse(&mut self, line: &str) -> Option<GpsFix> {
        let line = line.trim();
        let body = line.strip_prefix('$')?;
        let body = match body.split_once('*') {
            Some((body, sum)) => {
                if !checksum_ok(body, sum) {
                    debug!("gps: checksum mismatch: {}", line);
                    return None;
                }
                body
            }
            None => body,
        };
        let f: Vec<&str> = body.split(',').collect();
        let kind = f.first()?.get(2..)?;
        let field = |i: usize| f.get(i).copied().unwrap_or("");
        let mut fix = GpsFix::default();
        match kind {
            "GGA" => {
                let quality = field(6).parse::<u8>().ok().and_then(GgaQuality::from_u8);
                if quality.is_some() {
                    fix.position = self.position(field(2), field(3), field(4), field(5), &mut fix.heading);
                }
                fix.quality = quality;
                fix.satellites = field(7).parse().ok();
                fix.hdop = field(8).parse().ok();
                fix.altitude = field(9).parse().ok();
            }
            "RMC" => {
                if let Some(date) = parse_date(field(9)) {
                    self.date = Some(date);
                }
                if let (Some(date), Some(t)) = (self.date, parse_time(field(1))) {
                    fix.time = Some(PrimitiveDateTime::new(date, t).assume_utc());
                }
                if field(2) == "A" {
                    fix.position = self.position(field(3), field(4), field(5), field(6), &mut fix.heading);
                    fix.speed_kmh = field(7).parse::<f64>().ok().map(|kn| kn * KNOTS_TO_KMH);
                }
            }
            "GSA" => {
                fix.fix3d = match field(2) {
                    "2" => Some(false),
                    "3" => Some(true),
                    _ => None,
                };
                fix.hdop = field(16).parse().ok();
                fix.vdop = field(17).parse().ok();
            }
            _ => return None,
        }
        Some(fix)
    }

    fn position(&mut self, lat: &str, ns: &str, lon: &str, ew: &str, heading: &mut Option<f64>) -> Option<(f64, f64)> {
        let pos = (parse_deg_min(lat, ns)?, parse_deg_min(lon, ew)?);
        if let Some(prev) = self.last_position {
            if prev != pos {
                *heading = Some(bearing(prev, pos));
            }
        }
        self.last_position = Some(pos);
        Some(pos)
    }
}

/// Reads fixes until cancelled, reopening the source after failures.
pub async fn run(cfg: GpsConfig, tx: mpsc::Sender<SensorEvent>, cancel: CancellationToken) {
    info!("gps: reading {}", cfg.replay.as_ref().map(|p| p.display().to_string()).unwrap_or(cfg.device.clone()));
    let mut parser = NmeaParser::new();
    let mut line = String::new();
    while !cancel.is_cancelled() {
        let mut source = match NmeaSource::open(&cfg) {
            Ok(s) => s,
            Err(e) => {
                warn!("gps: {:#}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(REOPEN_DELAY) => continue,
                }
            }
        };
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                r = source.next_line(&mut line) => r,
            };
            if let Err(e) = read {
                warn!("gps: {:#}", e);
                break;
            }
            if let Some(fix) = parser.parse(&line) {
                if tx.send(SensorEvent::Gps(fix)).await.is_err() {
                    return;
                }
            }
        }
    }
}
