use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{error, info};

/// Commands run on an uploaded firmware package. The package path is appended
/// to `test` and `extract`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub test: Vec<String>,
    pub extract: Vec<String>,
    pub source_dir: PathBuf,
    pub reboot: Vec<String>,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            test: vec!["unzip".into(), "-tq".into()],
            extract: vec!["unzip".into(), "-oq".into()],
            source_dir: PathBuf::from("./source"),
            reboot: vec!["sudo".into(), "/sbin/shutdown".into(), "-r".into(), "now".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Rebooting,
    Corrupt,
    Failed,
}

pub struct FirmwareInstaller {
    cfg: FirmwareConfig,
}

async fn run(argv: &[String], extra: &[&OsStr]) -> Result<bool> {
    let Some((prog, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let status = Command::new(prog)
        .args(args)
        .args(extra)
        .status()
        .await
        .with_context(|| format!("spawn {}", prog))?;
    Ok(status.success())
}

impl FirmwareInstaller {
    pub fn new(cfg: FirmwareConfig) -> Self {
        Self { cfg }
    }

    pub async fn install(&self, package: &Path) -> InstallOutcome {
        match self.try_install(package).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Problem handling firmware, maybe it is corrupt: {:#}", e);
                InstallOutcome::Failed
            }
        }
    }

    async fn try_install(&self, package: &Path) -> Result<InstallOutcome> {
        if !run(&self.cfg.test, &[package.as_os_str()]).await? {
            error!("Firmware did not pass testing, maybe it is corrupt");
            return Ok(InstallOutcome::Corrupt);
        }
        info!("Testing firmware passed!");
        info!("Extracting files..");
        if tokio::fs::try_exists(&self.cfg.source_dir).await.unwrap_or(false) {
            let dest = self.cfg.source_dir.as_os_str();
            if !run(&self.cfg.extract, &[package.as_os_str(), OsStr::new("-d"), dest]).await? {
                bail!("extracting {} failed", package.display());
            }
        } else {
            error!("Source folder does not exist! Skipping extracting");
        }
        info!("Done!");
        info!("Rebooting system..");
        if !run(&self.cfg.reboot, &[]).await? {
            bail!("reboot command failed");
        }
        Ok(InstallOutcome::Rebooting)
    }
}
