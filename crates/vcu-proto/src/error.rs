use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown message id {0}")]
    UnknownMessage(u32),

    #[error("malformed message {id}: {reason}")]
    Malformed { id: u32, reason: String },

    #[error("message id {0} cannot be sent as MAVLink v1")]
    NotV1(u32),

    #[error("payload of {0} bytes exceeds 255")]
    PayloadTooLong(usize),

    #[error("ftp payload too short ({0} bytes)")]
    FtpTooShort(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
