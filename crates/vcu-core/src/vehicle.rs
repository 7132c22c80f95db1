use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vcu_params::ParamStore;

use crate::hal::{Hardware, Led};
use crate::history::DriveHistory;
use crate::ingest::{IngestConfig, SensorIngest};
use crate::logbook::LogBook;
use crate::outputs::DigitalOutputsController;
use crate::steering::{ButtonAction, SteeringWheel};
use crate::system::{ModeFlags, SystemState, VehicleState};
use crate::telemetry::TelemetrySink;
use crate::traction::{TractionConfig, TractionSystem};

const BUTTON_TICK: Duration = Duration::from_millis(50);

/// Controller sections of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub traction: TractionConfig,
    pub ingest: IngestConfig,
}

/// Everything that runs on the vehicle, owned in one place.
pub struct Vehicle {
    pub params: Arc<ParamStore>,
    pub outputs: Arc<DigitalOutputsController>,
    pub traction: Arc<TractionSystem>,
    pub ingest: Arc<SensorIngest>,
    pub history: Arc<DriveHistory>,
    pub logbook: Arc<LogBook>,
    steering: Mutex<SteeringWheel>,
    started: Instant,
}

impl Vehicle {
    pub fn new(
        params: Arc<ParamStore>,
        hw: Hardware,
        sink: Arc<dyn TelemetrySink>,
        logbook: Arc<LogBook>,
        cfg: VehicleConfig,
    ) -> Arc<Self> {
        let outputs = Arc::new(DigitalOutputsController::new(params.clone(), hw.clone(), sink.clone()));
        let traction = TractionSystem::new(params.clone(), outputs.clone(), hw.throttle, hw.brake, sink, cfg.traction);
        let ingest = SensorIngest::new(params.clone(), traction.clone(), cfg.ingest);
        Arc::new(Self {
            params,
            outputs,
            traction,
            ingest,
            history: DriveHistory::new(),
            logbook,
            steering: Mutex::new(SteeringWheel::new()),
            started: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Boot sequence; leaves the vehicle in STANDBY.
    pub fn start(&self, hil: bool) {
        info!("Starting initialization of system..");
        info!("Version: {}", env!("CARGO_PKG_VERSION"));
        self.params.set_system_state(SystemState::Boot);
        self.params.on_warning(|w| warn!("{} value triggered for {}={}", w.kind, w.param.key(), w.value));
        if hil {
            self.params.set_mode_flag(ModeFlags::HIL_ENABLED, true);
            info!("System is in HIL mode.");
        }

        self.history.attach(&self.params);
        self.ingest.attach();
        self.outputs.init();
        self.traction.attach();

        info!("Done initializing system!");
        self.params.set_system_state(SystemState::Standby);
        self.outputs.set_led(Led::Blue, false);
        self.outputs.set_led(Led::Green, true);
    }

    /// Leaves the outputs safe. `error` lights the red LED.
    pub async fn shutdown(&self, error: bool) {
        self.outputs.set_forward_switch(false);
        self.outputs.set_reverse_switch(false);
        if self.params.system_state() == SystemState::Active {
            self.traction.deactivate_ts().await.ok();
            self.outputs.set_ts_active_relay(false);
        }
        self.outputs.set_led(Led::Green, false);
        self.outputs.set_led(Led::Blue, false);
        if error {
            self.outputs.set_led(Led::Red, true);
        }
        info!("Exiting..");
    }

    pub fn on_buttons(self: &Arc<Self>, state: u8) {
        let actions = self.steering.lock().unwrap_or_else(PoisonError::into_inner).on_button_change(state, Instant::now());
        self.run_actions(actions);
    }

    fn run_actions(self: &Arc<Self>, actions: Vec<ButtonAction>) {
        for action in actions {
            self.handle_button_action(action);
        }
    }

    pub fn handle_button_action(self: &Arc<Self>, action: ButtonAction) {
        match action {
            ButtonAction::ToggleTs => {
                let traction = self.traction.clone();
                if self.params.system_state() == SystemState::Active {
                    tokio::spawn(async move { traction.deactivate_ts().await });
                } else {
                    tokio::spawn(async move { traction.activate_ts().await });
                }
            }
            ButtonAction::Direction(mode) => self.traction.set_driving_direction(mode),
        }
    }

    /// Drives the long-press timers of the steering wheel.
    pub async fn run_buttons(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(BUTTON_TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let actions = self.steering.lock().unwrap_or_else(PoisonError::into_inner).tick(Instant::now());
                    self.run_actions(actions);
                }
            }
        }
    }
}
