//! Traction system (TS) arbitration: activation, deactivation, driving
//! direction, motor test and throttle/brake shaping.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};
use vcu_params::{Param, ParamStore};
use vcu_proto::mavlink::common::{MavCmd, MavMessage, MavResult, COMMAND_ACK_DATA};
use vcu_proto::{DrivingMode, LfsMessage};

use crate::hal::Wiper;
use crate::outputs::{DigitalOutputsController, Output};
use crate::system::{ModeFlags, SystemState, TsMode, VehicleState};
use crate::telemetry::TelemetrySink;
use crate::wait::wait_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HilPolicy {
    /// Log and activate anyway.
    #[default]
    Warn,
    Refuse,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TractionConfig {
    pub activate_timeout_ms: u64,
    pub deactivate_timeout_ms: u64,
    pub poll_ms: u64,
    /// Delay between dropping throttle and opening the TS relay.
    pub settle_ms: u64,
    pub direction_delay_ms: u64,
    pub throttle_delay_ms: u64,
    pub hil_policy: HilPolicy,
}

impl Default for TractionConfig {
    fn default() -> Self {
        Self {
            activate_timeout_ms: 5000,
            deactivate_timeout_ms: 5000,
            poll_ms: 100,
            settle_ms: 1000,
            direction_delay_ms: 500,
            throttle_delay_ms: 1000,
            hil_policy: HilPolicy::Warn,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TractionError {
    #[error("cannot activate traction system in HIL mode")]
    HilRefused,
    #[error("system is not in standby ({0})")]
    NotStandby(SystemState),
    #[error("traction system did not activate in time")]
    ActivationTimeout,
    #[error("traction system did not deactivate in time")]
    DeactivationTimeout,
}

struct MotorTestSession {
    direction: DrivingMode,
    throttle: f64,
    timer: AbortHandle,
}

/// At most one motor test exists at a time.
enum MotorTest {
    Idle,
    /// Activating the TS or spinning up; no timer yet.
    Starting,
    Armed(MotorTestSession),
}

pub struct TractionSystem {
    params: Arc<ParamStore>,
    outputs: Arc<DigitalOutputsController>,
    throttle_wiper: Arc<dyn Wiper>,
    brake_wiper: Arc<dyn Wiper>,
    sink: Arc<dyn TelemetrySink>,
    cfg: TractionConfig,
    motor_test: Mutex<MotorTest>,
}

impl TractionSystem {
    pub fn new(
        params: Arc<ParamStore>,
        outputs: Arc<DigitalOutputsController>,
        throttle_wiper: Arc<dyn Wiper>,
        brake_wiper: Arc<dyn Wiper>,
        sink: Arc<dyn TelemetrySink>,
        cfg: TractionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            outputs,
            throttle_wiper,
            brake_wiper,
            sink,
            cfg,
            motor_test: Mutex::new(MotorTest::Idle),
        })
    }

    /// Registers the shaping listeners.
    pub fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::ThrottleInput], move |c| {
            if let Some(ts) = weak.upgrade() {
                ts.on_throttle_input(c.value.as_f64());
            }
        });
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::ThrottleOutput], move |c| {
            if let Some(ts) = weak.upgrade() {
                ts.on_throttle_output(c.value.as_f64());
            }
        });
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::BrakeInput], move |c| {
            if let Some(ts) = weak.upgrade() {
                ts.on_brake_input(c.value.as_f64());
            }
        });
        let weak = Arc::downgrade(self);
        self.params.subscribe(&[Param::BrakeOutput], move |c| {
            if let Some(ts) = weak.upgrade() {
                ts.on_brake_output(c.value.as_f64());
            }
        });
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn is_active(&self) -> bool {
        self.params.system_state() == SystemState::Active
    }

    fn on_throttle_input(&self, input: f64) {
        if self.params.in_mode(ModeFlags::TEST_ENABLED) {
            return;
        }
        let max = if self.params.driving_mode() == DrivingMode::Reverse {
            self.params.number(Param::ThrottleMaxRev)
        } else {
            self.params.number(Param::ThrottleMaxVal)
        };
        if let Err(e) = self.params.set(Param::ThrottleOutput, input * max) {
            warn!("traction: throttle output: {}", e);
        }
    }

    fn on_throttle_output(&self, output: f64) {
        let active = self.is_active();
        self.outputs.set_foot_switch(active && output > self.params.number(Param::FootSwitchAct));
        if active {
            if let Err(e) = self.throttle_wiper.write(output) {
                error!("Error with throttle device: {}", e);
            }
        }
    }

    fn on_brake_input(&self, input: f64) {
        if let Err(e) = self.params.set(Param::BrakeOutput, input * self.params.number(Param::BrakeMaxVal)) {
            warn!("traction: brake output: {}", e);
        }
    }

    fn on_brake_output(&self, output: f64) {
        self.outputs.set_brake_light_output(output > self.params.number(Param::BrakeLightAct));
        if self.is_active() {
            if let Err(e) = self.brake_wiper.write(output) {
                error!("Error with brake device: {}", e);
            }
        }
    }

    pub fn set_ts_mode(&self, mode: TsMode) {
        if let Err(e) = self.params.set(Param::TsMode, mode as u8) {
            warn!("traction: ts mode: {}", e);
            return;
        }
        info!("Setting vehicle in {} mode.", mode);
        if mode == TsMode::Track {
            self.outputs.set_coolant_pump_output(true);
        }
    }

    /// Break-before-make: the opposite relay is always opened first and only
    /// the final state is announced.
    pub fn set_driving_direction(&self, mode: DrivingMode) {
        self.params.set(Param::DrivingMode, mode as u8).ok();
        let (open, close) = match mode {
            DrivingMode::Neutral => (Output::Reverse, None),
            DrivingMode::Forward => (Output::Reverse, Some(Output::Forward)),
            DrivingMode::Reverse => (Output::Forward, Some(Output::Reverse)),
        };
        let mut changed = self.outputs.set(open, false, false);
        changed |= match (mode, close) {
            (DrivingMode::Neutral, _) => self.outputs.set(Output::Forward, false, false),
            (_, Some(out)) => self.outputs.set(out, true, false),
            _ => false,
        };
        if changed {
            self.outputs.announce();
        }
        self.sink.send(LfsMessage::DrivingMode(mode).into());
        info!("Setting vehicle in {} mode.", mode);
    }

    pub async fn activate_ts(&self) -> Result<(), TractionError> {
        if self.params.in_mode(ModeFlags::HIL_ENABLED) {
            match self.cfg.hil_policy {
                HilPolicy::Warn => warn!("Activating traction system while in HIL mode!"),
                HilPolicy::Refuse => {
                    warn!("Cannot activate traction system when in HIL mode!");
                    return Err(TractionError::HilRefused);
                }
            }
        }

        let state = self.params.system_state();
        if state != SystemState::Standby {
            info!("System is not in standby mode");
            return Err(TractionError::NotStandby(state));
        }

        info!("Trying to activate traction system..");
        self.outputs.set_ts_active_relay(true);

        let params = &self.params;
        let res = wait_for(
            || params.system_state() == SystemState::Active,
            Self::ms(self.cfg.activate_timeout_ms),
            Self::ms(self.cfg.poll_ms),
        )
        .await;
        if res.is_err() {
            self.outputs.set_ts_active_relay(false);
            error!("Traction system did not activate in time!");
            return Err(TractionError::ActivationTimeout);
        }
        info!("Traction system activated!");
        Ok(())
    }

    pub async fn deactivate_ts(&self) -> Result<(), TractionError> {
        info!("Trying to deactivate TS");
        self.params.set(Param::ThrottleOutput, 0.0).ok();
        self.set_driving_direction(DrivingMode::Neutral);
        tokio::time::sleep(Self::ms(self.cfg.settle_ms)).await;
        self.outputs.set_ts_active_relay(false);

        let params = &self.params;
        let res = wait_for(
            || params.system_state() == SystemState::Standby,
            Self::ms(self.cfg.deactivate_timeout_ms),
            Self::ms(self.cfg.poll_ms),
        )
        .await;
        if res.is_err() {
            error!("Traction system did not deactivate in time!");
            return Err(TractionError::DeactivationTimeout);
        }

        if self.params.ts_mode() == TsMode::Service {
            self.set_ts_mode(TsMode::Normal);
        }
        info!("Traction system deactivated.");
        Ok(())
    }

    pub async fn on_unexpected_ts_shutdown(&self) {
        if self.params.ts_mode() == TsMode::Service {
            error!("Traction system unexpectedly turned off, ignoring because in service mode..");
            return;
        }
        error!("Traction system unexpectedly turned off, probably an error occurred!");
        self.deactivate_ts().await.ok();
    }

    fn ack(&self, result: MavResult) {
        self.sink.send(
            MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                command: MavCmd::MAV_CMD_DO_MOTOR_TEST,
                result,
                ..Default::default()
            })
            .into(),
        );
    }

    fn session(&self) -> MutexGuard<'_, MotorTest> {
        self.motor_test.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn motor_test_running(&self) -> bool {
        !matches!(*self.session(), MotorTest::Idle)
    }

    fn test_still_requested(&self) -> bool {
        self.params.in_mode(ModeFlags::TEST_ENABLED)
    }

    fn end_motor_test(&self) {
        *self.session() = MotorTest::Idle;
        self.params.set_mode_flag(ModeFlags::TEST_ENABLED, false);
    }

    pub async fn do_motor_test(self: &Arc<Self>, throttle: f64, direction: DrivingMode, duration: Duration) {
        {
            let mut slot = self.session();
            if !matches!(*slot, MotorTest::Idle) {
                drop(slot);
                warn!("Motor test already in progress, ignoring request.");
                self.ack(MavResult::MAV_RESULT_TEMPORARILY_REJECTED);
                return;
            }
            *slot = MotorTest::Starting;
        }
        self.ack(MavResult::MAV_RESULT_IN_PROGRESS);
        self.params.set_mode_flag(ModeFlags::TEST_ENABLED, true);
        info!("Initiating motor test..");
        info!(
            "Testing motor in {} direction with throttle at {}% for {} s.",
            direction,
            throttle * 100.0,
            duration.as_secs_f64()
        );

        if self.activate_ts().await.is_err() {
            warn!("Could not activate TS, skipping motor test.");
            self.ack(MavResult::MAV_RESULT_FAILED);
            self.end_motor_test();
            return;
        }

        info!("Starting test!");
        tokio::time::sleep(Self::ms(self.cfg.direction_delay_ms)).await;
        if !self.test_still_requested() {
            return self.cancel_setup().await;
        }
        self.set_driving_direction(direction);
        tokio::time::sleep(Self::ms(self.cfg.throttle_delay_ms)).await;
        if !self.test_still_requested() {
            return self.cancel_setup().await;
        }
        if let Err(e) = self.params.set(Param::ThrottleOutput, throttle) {
            warn!("traction: motor test throttle: {}", e);
        }

        let weak = Arc::downgrade(self);
        let mut slot = self.session();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(ts) = weak.upgrade() {
                ts.finish_motor_test().await;
            }
        });
        *slot = MotorTest::Armed(MotorTestSession { direction, throttle, timer: timer.abort_handle() });
    }

    /// Aborted while still spinning up; no timer is armed yet.
    async fn cancel_setup(&self) {
        info!("Motor test cancelled before start.");
        if self.deactivate_ts().await.is_ok() {
            self.ack(MavResult::MAV_RESULT_DENIED);
        } else {
            self.ack(MavResult::MAV_RESULT_FAILED);
        }
        self.end_motor_test();
    }

    fn take_armed(&self) -> Option<MotorTestSession> {
        let mut slot = self.session();
        match std::mem::replace(&mut *slot, MotorTest::Idle) {
            MotorTest::Armed(session) => Some(session),
            other => {
                *slot = other;
                None
            }
        }
    }

    async fn finish_motor_test(&self) {
        let Some(session) = self.take_armed() else {
            return;
        };
        info!(
            "Finishing motor test ({} at {}%)..",
            session.direction,
            session.throttle * 100.0
        );
        if self.deactivate_ts().await.is_ok() {
            info!("Motor test done!");
            self.ack(MavResult::MAV_RESULT_ACCEPTED);
        } else {
            info!("Could not deactivate TS, something is wrong!");
            self.ack(MavResult::MAV_RESULT_FAILED);
        }
        self.end_motor_test();
    }

    /// An armed test is always torn down. A test still starting sees the
    /// cleared flag and cancels itself.
    pub async fn abort_motor_test(&self) {
        if let Some(session) = self.take_armed() {
            info!("Aborting motor test..");
            session.timer.abort();
            if self.deactivate_ts().await.is_ok() {
                self.ack(MavResult::MAV_RESULT_DENIED);
                info!("Aborting motor test done!");
            } else {
                self.ack(MavResult::MAV_RESULT_FAILED);
                info!("Aborting motor test failed!");
            }
            self.end_motor_test();
            return;
        }
        if self.motor_test_running() {
            info!("Aborting motor test before start..");
        } else {
            info!("No motor test is going on..");
        }
        self.params.set_mode_flag(ModeFlags::TEST_ENABLED, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Hardware, SimLeds, SimRelayBoard, SimWiper};
    use crate::telemetry::testing::RecordingSink;

    struct Rig {
        params: Arc<ParamStore>,
        relays: Arc<SimRelayBoard>,
        throttle: Arc<SimWiper>,
        brake: Arc<SimWiper>,
        sink: Arc<RecordingSink>,
        ts: Arc<TractionSystem>,
    }

    fn rig_with(cfg: TractionConfig) -> Rig {
        let params = Arc::new(ParamStore::in_memory());
        let relays = Arc::new(SimRelayBoard::new());
        let throttle = Arc::new(SimWiper::default());
        let brake = Arc::new(SimWiper::default());
        let sink = Arc::new(RecordingSink::new());
        let hw = Hardware {
            relays: relays.clone(),
            leds: Arc::new(SimLeds::default()),
            throttle: throttle.clone(),
            brake: brake.clone(),
        };
        let outputs = Arc::new(DigitalOutputsController::new(params.clone(), hw, sink.clone()));
        let ts = TractionSystem::new(params.clone(), outputs, throttle.clone(), brake.clone(), sink.clone(), cfg);
        ts.attach();
        params.set_system_state(SystemState::Standby);
        Rig { params, relays, throttle, brake, sink, ts }
    }

    fn rig() -> Rig {
        rig_with(TractionConfig::default())
    }

    /// Mimics the precharge circuit: the system state follows the TS relay
    /// after one second.
    fn follow_relay(params: &Arc<ParamStore>) {
        let weak = Arc::downgrade(params);
        params.subscribe(&[Param::TsActiveOut], move |c| {
            let on = c.value.as_bool();
            let weak = weak.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                if let Some(p) = weak.upgrade() {
                    p.set_system_state(if on { SystemState::Active } else { SystemState::Standby });
                }
            });
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_requires_standby() {
        let r = rig();
        r.params.set_system_state(SystemState::Boot);
        assert_eq!(r.ts.activate_ts().await, Err(TractionError::NotStandby(SystemState::Boot)));
        assert!(r.relays.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_timeout_releases_relay() {
        let r = rig();
        let start = tokio::time::Instant::now();
        assert_eq!(r.ts.activate_ts().await, Err(TractionError::ActivationTimeout));
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
        assert_eq!(r.relays.writes(), vec![(2, true), (2, false)]);
        assert!(!r.params.flag(Param::TsActiveOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_and_deactivate() {
        let r = rig();
        follow_relay(&r.params);
        r.ts.activate_ts().await.unwrap();
        assert_eq!(r.params.system_state(), SystemState::Active);

        r.ts.set_driving_direction(DrivingMode::Forward);
        r.params.set(Param::ThrottleInput, 0.5).unwrap();
        assert!(r.params.flag(Param::FsOutput));

        r.ts.deactivate_ts().await.unwrap();
        assert_eq!(r.params.system_state(), SystemState::Standby);
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.0);
        assert_eq!(r.params.driving_mode(), DrivingMode::Neutral);
        assert!(!r.params.flag(Param::ForwardSwitch));
        assert!(!r.params.flag(Param::FsOutput));
        assert!(!r.params.flag(Param::TsActiveOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hil_policy() {
        let r = rig_with(TractionConfig { hil_policy: HilPolicy::Refuse, ..Default::default() });
        r.params.set_mode_flag(ModeFlags::HIL_ENABLED, true);
        assert_eq!(r.ts.activate_ts().await, Err(TractionError::HilRefused));
        assert!(r.relays.writes().is_empty());

        let r = rig();
        follow_relay(&r.params);
        r.params.set_mode_flag(ModeFlags::HIL_ENABLED, true);
        assert!(r.ts.activate_ts().await.is_ok());
    }

    #[test]
    fn test_forward_to_reverse_is_break_before_make() {
        let r = rig();
        r.ts.set_driving_direction(DrivingMode::Forward);
        r.relays.clear();
        r.sink.clear();
        r.ts.set_driving_direction(DrivingMode::Reverse);
        // forward (ch 6) opens before reverse (ch 4, active low) closes
        assert_eq!(r.relays.writes(), vec![(6, false), (4, false)]);
        assert_eq!(r.sink.count("DIGITAL_OUTPUTS"), 1);
        assert_eq!(r.sink.count("DRIVING_MODE"), 1);
        assert_eq!(r.params.driving_mode(), DrivingMode::Reverse);
    }

    #[test]
    fn test_same_direction_sends_no_outputs() {
        let r = rig();
        r.ts.set_driving_direction(DrivingMode::Neutral);
        assert!(r.relays.writes().is_empty());
        assert_eq!(r.sink.count("DIGITAL_OUTPUTS"), 0);
        assert_eq!(r.sink.count("DRIVING_MODE"), 1);
    }

    #[test]
    fn test_throttle_shaping_by_direction() {
        let r = rig();
        r.params.set(Param::ThrottleMaxVal, 0.8).unwrap();
        r.params.set(Param::ThrottleInput, 0.5).unwrap();
        assert!((r.params.number(Param::ThrottleOutput) - 0.4).abs() < 1e-9);

        r.ts.set_driving_direction(DrivingMode::Reverse);
        r.params.set(Param::ThrottleInput, 1.0).unwrap();
        assert!((r.params.number(Param::ThrottleOutput) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_outputs_gated_on_active() {
        let r = rig();
        r.params.set(Param::ThrottleInput, 0.9).unwrap();
        r.params.set(Param::BrakeInput, 0.5).unwrap();
        assert!(!r.params.flag(Param::FsOutput));
        assert!(r.throttle.writes().is_empty());
        assert!(r.brake.writes().is_empty());
        assert!(r.params.flag(Param::BrakeLightOut));

        r.params.set_system_state(SystemState::Active);
        r.params.set(Param::ThrottleInput, 0.9).unwrap();
        r.params.set(Param::BrakeInput, 0.02).unwrap();
        assert!(r.params.flag(Param::FsOutput));
        assert_eq!(r.throttle.last(), Some(0.9));
        assert_eq!(r.brake.last(), Some(0.02));
        assert!(!r.params.flag(Param::BrakeLightOut));
    }

    #[test]
    fn test_throttle_input_ignored_in_test_mode() {
        let r = rig();
        r.params.set_mode_flag(ModeFlags::TEST_ENABLED, true);
        r.params.set(Param::ThrottleInput, 1.0).unwrap();
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.0);
    }

    #[test]
    fn test_track_mode_starts_coolant() {
        let r = rig();
        r.ts.set_ts_mode(TsMode::Track);
        assert_eq!(r.params.ts_mode(), TsMode::Track);
        assert!(r.params.flag(Param::CoolPumpOutput));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_mode_returns_to_normal_after_deactivation() {
        let r = rig();
        follow_relay(&r.params);
        r.ts.set_ts_mode(TsMode::Service);
        r.ts.activate_ts().await.unwrap();
        r.ts.on_unexpected_ts_shutdown().await;
        assert_eq!(r.params.system_state(), SystemState::Active);
        r.ts.deactivate_ts().await.unwrap();
        assert_eq!(r.params.ts_mode(), TsMode::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_test_runs_to_completion() {
        let r = rig();
        follow_relay(&r.params);
        r.ts.do_motor_test(0.2, DrivingMode::Reverse, Duration::from_secs(3)).await;
        assert!(r.ts.motor_test_running());
        assert!(r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.2);
        assert_eq!(r.params.driving_mode(), DrivingMode::Reverse);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!r.ts.motor_test_running());
        assert!(!r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert_eq!(r.params.system_state(), SystemState::Standby);
        assert_eq!(r.sink.acks(), vec![MavResult::MAV_RESULT_IN_PROGRESS, MavResult::MAV_RESULT_ACCEPTED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_test_fails_when_ts_does_not_activate() {
        let r = rig();
        r.ts.do_motor_test(0.2, DrivingMode::Forward, Duration::from_secs(3)).await;
        assert!(!r.ts.motor_test_running());
        assert!(!r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert_eq!(r.sink.acks(), vec![MavResult::MAV_RESULT_IN_PROGRESS, MavResult::MAV_RESULT_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_cancels_timer() {
        let r = rig();
        follow_relay(&r.params);
        r.ts.do_motor_test(0.2, DrivingMode::Forward, Duration::from_secs(10)).await;
        r.ts.abort_motor_test().await;
        assert!(!r.params.in_mode(ModeFlags::TEST_ENABLED));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(r.sink.acks(), vec![MavResult::MAV_RESULT_IN_PROGRESS, MavResult::MAV_RESULT_DENIED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_without_test_clears_flag() {
        let r = rig();
        r.params.set_mode_flag(ModeFlags::TEST_ENABLED, true);
        r.ts.abort_motor_test().await;
        assert!(!r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert!(r.sink.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_motor_test_is_rejected_and_abort_still_stops_ts() {
        let r = rig();
        follow_relay(&r.params);
        r.ts.do_motor_test(0.2, DrivingMode::Forward, Duration::from_secs(10)).await;
        r.ts.do_motor_test(0.2, DrivingMode::Forward, Duration::from_secs(10)).await;
        assert!(r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert!(r.ts.motor_test_running());

        // pedal input stays ignored while the first test owns the throttle
        r.params.set(Param::ThrottleInput, 0.9).unwrap();
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.2);

        r.ts.abort_motor_test().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(r.params.system_state(), SystemState::Standby);
        assert!(!r.params.flag(Param::TsActiveOut));
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.0);
        assert!(!r.params.in_mode(ModeFlags::TEST_ENABLED));
        assert_eq!(
            r.sink.acks(),
            vec![
                MavResult::MAV_RESULT_IN_PROGRESS,
                MavResult::MAV_RESULT_TEMPORARILY_REJECTED,
                MavResult::MAV_RESULT_DENIED,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_spin_up_sends_final_ack() {
        let r = rig();
        follow_relay(&r.params);
        let ts = r.ts.clone();
        let test = tokio::spawn(async move {
            ts.do_motor_test(0.2, DrivingMode::Forward, Duration::from_secs(10)).await;
        });
        // TS is active after 1 s, then the direction delay starts
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(r.params.system_state(), SystemState::Active);
        r.ts.abort_motor_test().await;
        test.await.unwrap();

        assert!(!r.ts.motor_test_running());
        assert_eq!(r.params.system_state(), SystemState::Standby);
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.0);
        assert_eq!(r.sink.acks(), vec![MavResult::MAV_RESULT_IN_PROGRESS, MavResult::MAV_RESULT_DENIED]);

        // a new test can start afterwards
        r.ts.do_motor_test(0.1, DrivingMode::Forward, Duration::from_secs(1)).await;
        assert!(r.ts.motor_test_running());
    }

    #[test]
    fn test_raw_pedals_drive_outputs_only_when_active() {
        use crate::ingest::{IngestConfig, SensorEvent, SensorIngest};

        let r = rig();
        let ingest = SensorIngest::new(r.params.clone(), r.ts.clone(), IngestConfig::default());
        ingest.attach();
        r.params.set(Param::ThrottleMaxVal, 0.5).unwrap();
        r.params.set(Param::ThrottleDz, 0.1).unwrap();
        let analog = |throttle_raw: f64, brake_raw: f64| SensorEvent::Analog {
            throttle_raw,
            brake_raw,
            steering_raw: 0.0,
            board_temp_raw: 0.0,
        };

        ingest.handle(analog(255.0, 102.0));
        assert!((r.params.number(Param::ThrottleOutput) - 0.5).abs() < 1e-9);
        assert!(!r.params.flag(Param::FsOutput));
        assert!(r.throttle.writes().is_empty());
        assert!(r.brake.writes().is_empty());
        assert!(r.params.flag(Param::BrakeLightOut));

        r.params.set_system_state(SystemState::Active);
        ingest.handle(analog(153.0, 51.0));
        let expected = (0.6 - 0.1) / 0.9 * 0.5;
        assert!((r.params.number(Param::ThrottleOutput) - expected).abs() < 1e-9);
        assert!(r.params.flag(Param::FsOutput));
        assert!((r.throttle.last().unwrap() - expected).abs() < 1e-9);
        assert!((r.brake.last().unwrap() - 0.2).abs() < 1e-9);

        // inside the deadzone the foot switch opens again
        ingest.handle(analog(20.0, 0.0));
        assert_eq!(r.params.number(Param::ThrottleOutput), 0.0);
        assert!(!r.params.flag(Param::FsOutput));
        assert_eq!(r.throttle.last(), Some(0.0));
    }
}
