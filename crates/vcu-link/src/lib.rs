//! Ground-station side of the vehicle: the MAVLink session, its outbound
//! lanes, periodic telemetry and the transfer protocols riding on it.

pub mod error;
pub mod firmware;
pub mod ftp;
pub mod logs;
pub mod outbox;
pub mod param;
pub mod periodic;
pub mod session;
pub mod transfer;

pub use error::{FtpError, TransferError};
pub use firmware::{FirmwareConfig, FirmwareInstaller, InstallOutcome};
pub use ftp::{FtpAction, FtpServer};
pub use outbox::{Identity, Outbox, OutboxReceiver, TelemetryGate};
pub use periodic::{IntervalChange, Periodic, TelemetrySource};
pub use session::{heartbeat, LinkConfig, LinkState, MavlinkSession};
pub use transfer::{LogTransfer, TransferConfig, TransferOutcome};
