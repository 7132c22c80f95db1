//! Host resource usage for COMPUTER_STATUS, polled from procfs and sysfs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vcu_core::{SensorEvent, SystemInfo};

/// MAV_STORAGE_TYPE_SD.
const STORAGE_TYPE_SD: f64 = 4.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SysInfoConfig {
    pub interval_ms: u64,
    pub proc_root: PathBuf,
    pub thermal_zone: PathBuf,
    /// Mount point reported as storage.
    pub storage_path: PathBuf,
}

impl Default for SysInfoConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            proc_root: PathBuf::from("/proc"),
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            storage_path: PathBuf::from("/"),
        }
    }
}

/// Aggregate CPU jiffies from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

pub fn parse_proc_stat(s: &str) -> Option<CpuTimes> {
    let line = s.lines().find(|l| l.starts_with("cpu "))?;
    let v: Vec<u64> = line.split_whitespace().skip(1).filter_map(|x| x.parse().ok()).collect();
    if v.len() < 4 {
        return None;
    }
    let total: u64 = v.iter().sum();
    // idle + iowait
    let idle = v[3] + v.get(4).copied().unwrap_or(0);
    Some(CpuTimes { busy: total - idle, total })
}

/// Percent busy between two samples.
pub fn cpu_load(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    cur.busy.saturating_sub(prev.busy) as f64 * 100.0 / total as f64
}

/// `(used_mb, total_mb)` from /proc/meminfo.
pub fn parse_meminfo(s: &str) -> Option<(f64, f64)> {
    let field = |name: &str| -> Option<f64> {
        let line = s.lines().find(|l| l.starts_with(name))?;
        line.split_whitespace().nth(1)?.parse::<f64>().ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some(((total - available) / 1024.0, total / 1024.0))
}

/// `(used_mb, total_mb)` from `df -Pk` output.
pub fn parse_df(s: &str) -> Option<(f64, f64)> {
    let cols: Vec<&str> = s.lines().nth(1)?.split_whitespace().collect();
    let total: f64 = cols.get(1)?.parse().ok()?;
    let used: f64 = cols.get(2)?.parse().ok()?;
    Some((used / 1024.0, total / 1024.0))
}

async fn read_cpu(root: &Path) -> Result<CpuTimes> {
    let path = root.join("stat");
    let s = tokio::fs::read_to_string(&path).await.with_context(|| format!("read {}", path.display()))?;
    parse_proc_stat(&s).with_context(|| format!("parse {}", path.display()))
}

async fn read_memory(root: &Path) -> Result<(f64, f64)> {
    let path = root.join("meminfo");
    let s = tokio::fs::read_to_string(&path).await.with_context(|| format!("read {}", path.display()))?;
    parse_meminfo(&s).with_context(|| format!("parse {}", path.display()))
}

/// Millidegrees in the thermal zone file to degrees.
async fn read_temp(path: &Path) -> Result<f64> {
    let s = tokio::fs::read_to_string(path).await.with_context(|| format!("read {}", path.display()))?;
    let milli: f64 = s.trim().parse().with_context(|| format!("parse {}", path.display()))?;
    Ok(milli / 1000.0)
}

async fn read_storage(path: &Path) -> Result<(f64, f64)> {
    let out = Command::new("df").arg("-Pk").arg(path).output().await.context("spawn df")?;
    parse_df(&String::from_utf8_lossy(&out.stdout)).context("parse df output")
}

pub struct SysInfoPoller {
    cfg: SysInfoConfig,
    prev_cpu: Option<CpuTimes>,
}

impl SysInfoPoller {
    pub fn new(cfg: SysInfoConfig) -> Self {
        Self { cfg, prev_cpu: None }
    }

    /// One sample. Sources that cannot be read report 0.
    pub async fn sample(&mut self) -> SystemInfo {
        let mut info = SystemInfo { storage_type: STORAGE_TYPE_SD, ..SystemInfo::default() };
        match read_cpu(&self.cfg.proc_root).await {
            Ok(cur) => {
                if let Some(prev) = self.prev_cpu {
                    info.cpu_load = cpu_load(prev, cur);
                }
                self.prev_cpu = Some(cur);
            }
            Err(e) => debug!("sysinfo: {:#}", e),
        }
        match read_memory(&self.cfg.proc_root).await {
            Ok((used, total)) => {
                info.ram_usage_mb = used;
                info.ram_total_mb = total;
            }
            Err(e) => debug!("sysinfo: {:#}", e),
        }
        match read_temp(&self.cfg.thermal_zone).await {
            Ok(t) => info.cpu_temp = t,
            Err(e) => debug!("sysinfo: {:#}", e),
        }
        match read_storage(&self.cfg.storage_path).await {
            Ok((used, total)) => {
                info.storage_usage_mb = used;
                info.storage_total_mb = total;
            }
            Err(e) => debug!("sysinfo: {:#}", e),
        }
        info
    }

    pub async fn run(mut self, tx: mpsc::Sender<SensorEvent>, cancel: CancellationToken) {
        info!("sysinfo: polling every {} ms", self.cfg.interval_ms);
        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let info = self.sample().await;
                    if tx.send(SensorEvent::System(info)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
