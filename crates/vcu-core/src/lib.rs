pub mod hal;
pub mod history;
pub mod ingest;
pub mod logbook;
pub mod outputs;
pub mod steering;
pub mod system;
pub mod telemetry;
pub mod traction;
pub mod vehicle;
pub mod wait;

pub use hal::{Hardware, HardwareConfig, Led};
pub use history::{DriveHistory, DriveInfo};
pub use ingest::{GgaQuality, GpsFix, IngestConfig, SensorEvent, SensorIngest, SystemInfo};
pub use logbook::{LogBook, LogBookLayer, LogEntry};
pub use outputs::{DigitalOutputsController, Output};
pub use steering::{ButtonAction, SteeringWheel};
pub use system::{ModeFlags, SystemState, TsMode, VehicleState};
pub use telemetry::{NullSink, TelemetrySink};
pub use traction::{HilPolicy, TractionConfig, TractionError, TractionSystem};
pub use vehicle::{Vehicle, VehicleConfig};
