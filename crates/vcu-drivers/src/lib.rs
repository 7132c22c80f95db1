//! Sensor sources that run beside the controller and feed the ingest channel.

pub mod gps;
pub mod hil;
pub mod sysinfo;

pub use gps::{GpsConfig, NmeaParser};
pub use hil::HilConfig;
pub use sysinfo::{SysInfoConfig, SysInfoPoller};
