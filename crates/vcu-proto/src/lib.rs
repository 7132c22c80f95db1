pub mod codec;
pub mod crc;
pub mod error;
pub mod ftp;
pub mod lfs;
pub mod message;
pub mod transport;

pub use codec::{CodecStats, MavCodec, RawFrame};
pub use error::ProtoError;
pub use ftp::{FtpNak, FtpOpcode, FtpPayload};
pub use lfs::{DrivingMode, LfsMessage};
pub use message::{crc_extra, VcuMessage};
pub use transport::{Endpoint, LinkStream};

pub use mavlink;
pub use mavlink::MavlinkVersion;
