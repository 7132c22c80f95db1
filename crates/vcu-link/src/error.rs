use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no drive with index {0}")]
    NoSuchDrive(usize),

    #[error("no answer to the info packet")]
    NoInfoAck,

    #[error("chunk {seq} not acknowledged after {attempts} tries")]
    Retries { seq: usize, attempts: u32 },

    #[error("encode drive dump: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("compress drive dump: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FtpError {
    #[error("invalid file name {0:?}")]
    BadName(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FtpError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> FtpError {
        let context = context.into();
        move |source| FtpError::Io { context, source }
    }
}
