//! Upload-only MAVLink FTP server. Files land under the data directory.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info};
use vcu_proto::{FtpNak, FtpOpcode, FtpPayload};

use crate::error::FtpError;

struct Upload {
    file: File,
    path: PathBuf,
}

/// What the session should do after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum FtpAction {
    /// Send this reply.
    Reply(FtpPayload),
    /// Send the reply, then hand the finished file to the installer.
    Finished(FtpPayload, PathBuf),
    /// Stale or foreign session; nothing is sent.
    Ignore,
}

pub struct FtpServer {
    root: PathBuf,
    session: u8,
    upload: Option<Upload>,
}

/// `name` relative to `root`, refusing anything that climbs out of it.
pub fn sanitize(root: &Path, name: &str) -> Result<PathBuf, FtpError> {
    let mut out = root.to_path_buf();
    let mut parts = 0;
    for c in Path::new(name.trim_end_matches('\0')).components() {
        match c {
            Component::Normal(p) => {
                out.push(p);
                parts += 1;
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return Err(FtpError::BadName(name.to_string())),
        }
    }
    if parts == 0 {
        return Err(FtpError::BadName(name.to_string()));
    }
    Ok(out)
}

impl FtpServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), session: 1, upload: None }
    }

    pub fn session(&self) -> u8 {
        self.session
    }

    pub fn uploading(&self) -> bool {
        self.upload.is_some()
    }

    pub async fn handle(&mut self, req: &FtpPayload) -> FtpAction {
        match req.opcode {
            FtpOpcode::CreateFile => match self.create(req).await {
                Ok(()) => FtpAction::Reply(FtpPayload::ack(req, self.session)),
                Err(e) => {
                    error!("ftp: {}", e);
                    FtpAction::Reply(FtpPayload::nak(req, self.session, FtpNak::Fail))
                }
            },
            FtpOpcode::WriteFile => {
                if req.session != self.session {
                    return FtpAction::Ignore;
                }
                let Some(upload) = self.upload.as_mut() else {
                    return FtpAction::Ignore;
                };
                match write_at(&mut upload.file, req.offset, req.body()).await {
                    Ok(()) => FtpAction::Reply(FtpPayload::ack(req, self.session)),
                    Err(e) => {
                        error!("ftp: write {}: {}", upload.path.display(), e);
                        FtpAction::Reply(FtpPayload::nak(req, self.session, FtpNak::FailErrno))
                    }
                }
            }
            FtpOpcode::TerminateSession => {
                if req.session != self.session {
                    return FtpAction::Ignore;
                }
                info!("Terminating FTP session.");
                let reply = FtpPayload::ack(req, self.session);
                self.session = 0;
                match self.upload.take() {
                    Some(mut upload) => {
                        if let Err(e) = upload.file.flush().await {
                            error!("ftp: flush {}: {}", upload.path.display(), e);
                        }
                        FtpAction::Finished(reply, upload.path)
                    }
                    None => FtpAction::Reply(reply),
                }
            }
            FtpOpcode::ResetSessions => {
                if self.upload.take().is_some() {
                    info!("ftp: upload dropped");
                }
                FtpAction::Reply(FtpPayload::ack(req, self.session))
            }
            _ => FtpAction::Reply(FtpPayload::nak(req, self.session, FtpNak::UnknownCommand)),
        }
    }

    async fn create(&mut self, req: &FtpPayload) -> Result<(), FtpError> {
        let name = String::from_utf8_lossy(req.body()).into_owned();
        info!("Got request for upload file: {}", name);
        let path = sanitize(&self.root, &name)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(FtpError::io(format!("create {}", dir.display())))?;
        }
        if fs::try_exists(&path).await.unwrap_or(false) {
            info!("Removing old firmware file..");
        }
        let file = File::create(&path).await.map_err(FtpError::io(format!("create {}", path.display())))?;
        self.upload = Some(Upload { file, path });
        self.session = rand::random::<u8>();
        Ok(())
    }
}

async fn write_at(file: &mut File, offset: u32, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(u64::from(offset))).await?;
    file.write_all(data).await
}
