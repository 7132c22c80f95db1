use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vcu_core::{Hardware, HardwareConfig, IngestConfig, LogBook, LogBookLayer, TractionConfig, Vehicle, VehicleConfig};
use vcu_drivers::{gps, hil, GpsConfig, HilConfig, SysInfoConfig, SysInfoPoller};
use vcu_link::{LinkConfig, MavlinkSession, Outbox};
use vcu_params::{FileStorage, ParamStore};
use vcu_router::{Router, RouterConfig};

#[derive(Debug, Parser)]
#[command(name = "vcu", version, about = "LFS vehicle control unit")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration and the data directory.
    Doctor,
    /// Run the vehicle controller.
    Run,
    /// Run the MAVLink router.
    Router,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    log: LogCfg,
    hardware: HardwareConfig,
    traction: TractionConfig,
    ingest: IngestConfig,
    link: LinkConfig,
    router: RouterConfig,
    gps: GpsConfig,
    sysinfo: SysInfoConfig,
    hil: HilConfig,
    params: ParamsCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogCfg {
    /// Also keep debug lines in the log book.
    debug: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ParamsCfg {
    dir: PathBuf,
}

impl Default for ParamsCfg {
    fn default() -> Self {
        Self { dir: PathBuf::from("data/params") }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).context("parse config toml")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    let book = LogBook::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(LogBookLayer::new(book.clone(), cfg.log.debug))
        .init();

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().context("build runtime")?;
    rt.block_on(async move {
        match cli.cmd {
            Command::Doctor => doctor(&cfg),
            Command::Run => run(cfg, book).await,
            Command::Router => router(cfg).await,
        }
    })
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    cfg.hardware.validate()?;
    let ep = cfg.link.validate()?;
    info!("doctor: link endpoint {}", ep);
    cfg.router.validate()?;
    ensure!(cfg.traction.poll_ms > 0, "traction.poll_ms must be > 0");
    ensure!(cfg.ingest.channel_capacity > 0, "ingest.channel_capacity must be > 0");
    ensure!(cfg.sysinfo.interval_ms > 0, "sysinfo.interval_ms must be > 0");
    ensure!(
        (0.0..=1.0).contains(&cfg.ingest.ina_glitch_fraction),
        "ingest.ina_glitch_fraction must be in [0, 1]"
    );
    if cfg.hil.enabled {
        cfg.hil.bind.parse::<std::net::SocketAddr>().with_context(|| format!("hil.bind {}", cfg.hil.bind))?;
    }

    std::fs::create_dir_all(&cfg.params.dir).with_context(|| format!("create {}", cfg.params.dir.display()))?;
    std::fs::create_dir_all(&cfg.link.data_dir).with_context(|| format!("create {}", cfg.link.data_dir.display()))?;
    if !cfg.link.firmware.source_dir.exists() {
        warn!("doctor: firmware source dir {} missing, uploads will not be extracted", cfg.link.firmware.source_dir.display());
    }
    if cfg.hardware.simulated {
        warn!("doctor: hardware is simulated");
    }

    info!("doctor: OK");
    Ok(())
}

async fn run(cfg: Config, book: Arc<LogBook>) -> Result<()> {
    cfg.hardware.validate()?;
    let params = Arc::new(ParamStore::with_schema(FileStorage::new(&cfg.params.dir)));

    let (sensor_tx, sensor_rx) = mpsc::channel(cfg.ingest.channel_capacity);
    let hw = Hardware::from_config(&cfg.hardware, sensor_tx.clone())?;
    let outbox = Outbox::new();
    let vehicle = Vehicle::new(
        params.clone(),
        hw,
        outbox.clone(),
        book,
        VehicleConfig { traction: cfg.traction.clone(), ingest: cfg.ingest.clone() },
    );
    vehicle.start(cfg.hil.enabled);
    let session = MavlinkSession::new(cfg.link.clone(), vehicle.clone(), outbox)?;

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    tasks.spawn(vehicle.ingest.clone().run(sensor_rx, cancel.clone()));
    tasks.spawn(vehicle.clone().run_buttons(cancel.clone()));
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = session.run(cancel).await {
                error!("link: {:#}", e);
            }
        });
    }
    if cfg.gps.enabled {
        tasks.spawn(gps::run(cfg.gps.clone(), sensor_tx.clone(), cancel.clone()));
    }
    tasks.spawn(SysInfoPoller::new(cfg.sysinfo.clone()).run(sensor_tx.clone(), cancel.clone()));
    {
        let (params, hil_cfg, cancel) = (params.clone(), cfg.hil.clone(), cancel.clone());
        tasks.spawn(async move {
            if let Err(e) = hil::run(params, hil_cfg, cancel).await {
                error!("HIL Server error: {:#}", e);
            }
        });
    }
    drop(sensor_tx);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("run: shutting down");
    vehicle.shutdown(false).await;
    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    Ok(())
}

async fn router(cfg: Config) -> Result<()> {
    cfg.router.validate()?;
    let cancel = CancellationToken::new();
    let mut task = tokio::spawn(Router::new(cfg.router).run(cancel.clone()));
    tokio::select! {
        r = &mut task => return r.context("router task")?,
        r = tokio::signal::ctrl_c() => r.context("wait for ctrl-c")?,
    }
    info!("router: shutting down");
    cancel.cancel();
    task.await.context("router task")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.link.endpoint, "tcp:host.docker.internal:5432");
        assert_eq!(cfg.router.listen, "0.0.0.0:5432");
        assert!(cfg.hardware.simulated);
        assert!(!cfg.hil.enabled);
    }

    #[test]
    fn test_sections_override_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [link]
            endpoint = "serial:/dev/ttyUSB0:57600"
            sys_id = 3

            [link.transfer]
            max_attempts = 2

            [traction]
            hil_policy = "refuse"

            [router]
            serial_devices = ["/dev/ttyAMA1"]

            [hil]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.link.sys_id, 3);
        assert_eq!(cfg.link.transfer.max_attempts, 2);
        assert_eq!(cfg.link.transfer.chunk_size, 200);
        assert_eq!(cfg.traction.hil_policy, vcu_core::HilPolicy::Refuse);
        assert_eq!(cfg.router.serial_devices, vec!["/dev/ttyAMA1".to_string()]);
        assert!(cfg.hil.enabled);
    }

    #[test]
    fn test_doctor_rejects_bad_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.params.dir = dir.path().join("params");
        cfg.link.data_dir = dir.path().join("data");
        assert!(doctor(&cfg).is_ok());
        cfg.link.endpoint = "carrier-pigeon".into();
        assert!(doctor(&cfg).is_err());
    }
}
