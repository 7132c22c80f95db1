//! Point-to-point MAVLink session with the ground station.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use bytes::BytesMut;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vcu_core::{TelemetrySink, TsMode, Vehicle, VehicleState};
use vcu_params::Param;
use vcu_proto::mavlink::Message;
use vcu_proto::mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavType, MotorTestThrottleType, COMMAND_ACK_DATA,
    COMMAND_LONG_DATA, FILE_TRANSFER_PROTOCOL_DATA, HEARTBEAT_DATA,
};
use vcu_proto::{DrivingMode, Endpoint, FtpPayload, LinkStream, MavCodec, MavlinkVersion, RawFrame, VcuMessage};

use crate::firmware::{FirmwareConfig, FirmwareInstaller};
use crate::ftp::{FtpAction, FtpServer};
use crate::outbox::{write_loop, Identity, Outbox, TelemetryGate};
use crate::param;
use crate::periodic::{IntervalChange, Periodic, TelemetrySource};
use crate::logs;
use crate::transfer::{drive_list, LogTransfer, TransferConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// `tcp:host:port` or `serial:/dev/ttyX:baud`.
    pub endpoint: String,
    pub sys_id: u8,
    pub comp_id: u8,
    /// 1 or 2.
    pub mavlink_version: u8,
    pub heartbeat_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    /// Uploads land here.
    pub data_dir: PathBuf,
    pub transfer: TransferConfig,
    pub firmware: FirmwareConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "tcp:host.docker.internal:5432".into(),
            sys_id: 1,
            comp_id: 1,
            mavlink_version: 2,
            heartbeat_ms: 1000,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
            data_dir: PathBuf::from("data"),
            transfer: TransferConfig::default(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<Endpoint> {
        let ep: Endpoint = self.endpoint.parse().context("link.endpoint")?;
        ensure!(self.sys_id != 0, "link.sys_id must be nonzero");
        ensure!(matches!(self.mavlink_version, 1 | 2), "link.mavlink_version must be 1 or 2");
        ensure!(self.heartbeat_ms > 0, "link.heartbeat_ms must be > 0");
        ensure!(
            self.reconnect_min_ms > 0 && self.reconnect_min_ms <= self.reconnect_max_ms,
            "link.reconnect_min_ms must be in 1..=reconnect_max_ms"
        );
        ensure!(self.transfer.max_attempts > 0, "link.transfer.max_attempts must be > 0");
        Ok(ep)
    }

    fn version(&self) -> MavlinkVersion {
        if self.mavlink_version == 1 {
            MavlinkVersion::V1
        } else {
            MavlinkVersion::V2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
}

pub struct MavlinkSession {
    cfg: LinkConfig,
    endpoint: Endpoint,
    vehicle: Arc<Vehicle>,
    outbox: Arc<Outbox>,
    gate: Arc<TelemetryGate>,
    periodic: Periodic,
    transfer: Arc<LogTransfer>,
    ftp: Mutex<FtpServer>,
    firmware: Arc<FirmwareInstaller>,
    state: watch::Sender<LinkState>,
    tasks: TaskTracker,
}

pub fn heartbeat(vehicle: &Vehicle) -> MavMessage {
    let p = &vehicle.params;
    let base = MavModeFlag::MAV_MODE_FLAG_MANUAL_INPUT_ENABLED.bits() | p.system_mode().bits();
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: p.ts_mode() as u32,
        mavtype: MavType::MAV_TYPE_GROUND_ROVER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_GENERIC,
        base_mode: MavModeFlag::from_bits_truncate(base),
        system_status: p.system_state().as_mav(),
        mavlink_version: 3,
    })
}

impl MavlinkSession {
    /// `outbox` must be the sink the vehicle was built with.
    pub fn new(cfg: LinkConfig, vehicle: Arc<Vehicle>, outbox: Arc<Outbox>) -> Result<Arc<Self>> {
        let endpoint = cfg.validate()?;
        let gate = TelemetryGate::new();
        let source = Arc::new(TelemetrySource::new(vehicle.params.clone(), vehicle.started_at()));
        let (state, _) = watch::channel(LinkState::Disconnected);
        Ok(Arc::new(Self {
            endpoint,
            periodic: Periodic::new(source, outbox.clone(), gate.clone()),
            transfer: Arc::new(LogTransfer::new(cfg.transfer.clone())),
            ftp: Mutex::new(FtpServer::new(cfg.data_dir.clone())),
            firmware: Arc::new(FirmwareInstaller::new(cfg.firmware.clone())),
            cfg,
            vehicle,
            outbox,
            gate,
            state,
            tasks: TaskTracker::new(),
        }))
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn periodic(&self) -> &Periodic {
        &self.periodic
    }

    fn identity(&self) -> Identity {
        Identity { sys: self.cfg.sys_id, comp: self.cfg.comp_id, version: self.cfg.version() }
    }

    /// Frames addressed to every system, or to us on any or our component.
    pub fn accepts(&self, (sys, comp): (u8, u8)) -> bool {
        sys == 0 || (sys == self.cfg.sys_id && (comp == 0 || comp == self.cfg.comp_id))
    }

    /// Connects, serves and reconnects with backoff until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Mavlink controller starting, endpoint {}", self.endpoint);
        let live = self.vehicle.logbook.subscribe();
        self.tasks.spawn(logs::forward_live(live, self.outbox.clone(), cancel.clone()));

        let min = Duration::from_millis(self.cfg.reconnect_min_ms);
        let max = Duration::from_millis(self.cfg.reconnect_max_ms);
        let mut backoff = min;
        while !cancel.is_cancelled() {
            self.state.send_replace(LinkState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.endpoint.connect() => r,
            };
            match connected {
                Ok(stream) => {
                    backoff = min;
                    info!("link: connected to {}", self.endpoint);
                    self.serve(stream, &cancel).await;
                    warn!("link: connection to {} closed", self.endpoint);
                }
                Err(e) => warn!("link: {:#}, retrying in {:?}", e, backoff),
            }
            self.state.send_replace(LinkState::Disconnected);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max);
        }
        self.state.send_replace(LinkState::Disconnected);
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }

    /// One connection: READY until the stream closes or fails.
    pub async fn serve(self: &Arc<Self>, stream: Box<dyn LinkStream>, cancel: &CancellationToken) {
        let (reader, writer) = tokio::io::split(stream);
        let conn = cancel.child_token();
        let rx = self.outbox.open();
        self.state.send_replace(LinkState::Ready);

        let id = self.identity();
        let wconn = conn.clone();
        let writer = tokio::spawn(async move {
            write_loop(rx, writer, id, wconn.clone()).await;
            wconn.cancel();
        });
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(conn.clone()));
        self.periodic.start();

        self.read_loop(reader, &conn).await;

        conn.cancel();
        self.periodic.stop();
        self.outbox.close();
        writer.await.ok();
        heartbeat.await.ok();
    }

    async fn heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.heartbeat_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.outbox.send_priority(heartbeat(&self.vehicle).into()),
            }
        }
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: &Arc<Self>, mut reader: R, cancel: &CancellationToken) {
        let mut codec = MavCodec::new();
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                r = reader.read_buf(&mut buf) => r,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("link: read: {}", e);
                    break;
                }
            }
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => self.on_frame(frame).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("link: decode: {}", e);
                        break;
                    }
                }
            }
        }
        let stats = codec.stats();
        debug!("link: {} frames, {} crc errors", stats.frames, stats.crc_errors);
    }

    async fn on_frame(self: &Arc<Self>, frame: RawFrame) {
        let msg = match frame.message() {
            Ok(m) => m,
            Err(e) => {
                debug!("link: skipping frame {}: {}", frame.msg_id, e);
                return;
            }
        };
        if self.accepts(msg.target()) {
            self.handle_message(msg, frame.sys, frame.comp).await;
        }
    }

    fn put(&self, param: Param, value: f64) {
        if let Err(e) = self.vehicle.params.set(param, value) {
            warn!("link: {}", e);
        }
    }

    fn ack(&self, command: MavCmd, result: MavResult) {
        self.outbox.send(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result, ..Default::default() }).into());
    }

    pub async fn handle_message(self: &Arc<Self>, msg: VcuMessage, sys: u8, comp: u8) {
        let msg = match msg {
            VcuMessage::Common(m) => m,
            VcuMessage::Lfs(m) => {
                warn!("Received unknown msg: {} from: {}|{}", m.message_name(), sys, comp);
                return;
            }
        };
        let params = &self.vehicle.params;
        match msg {
            MavMessage::HEARTBEAT(_) => {}
            MavMessage::PARAM_REQUEST_LIST(_) => {
                let this = self.clone();
                self.tasks.spawn(async move { this.stream_params().await });
            }
            MavMessage::PARAM_REQUEST_READ(d) => {
                let name = param::param_name(&d.param_id);
                match param::lookup(params, d.param_index, &name) {
                    Some(p) => {
                        let (index, count) = param::position(params, p);
                        self.outbox.send(param::param_value(params, p, index, count).into());
                    }
                    None => warn!("link: no parameter {:?} (index {})", name, d.param_index),
                }
            }
            MavMessage::PARAM_SET(d) => {
                let name = param::param_name(&d.param_id);
                let Some(p) = param::lookup(params, -1, &name) else {
                    error!("Error setting parameter: ({} = {}). unknown parameter", name, d.param_value);
                    return;
                };
                match param::apply(params, p, d.param_value) {
                    Ok(()) => {
                        let (index, count) = param::position(params, p);
                        self.outbox.send(param::param_value(params, p, index, count).into());
                        info!("Setting parameter: {} = {}", name, d.param_value);
                        if let Err(e) = params.persist(p) {
                            error!("link: {}", e);
                        }
                    }
                    Err(e) => error!("Error setting parameter: ({} = {}). {}", name, d.param_value, e),
                }
            }
            MavMessage::COMMAND_LONG(d) => self.on_command(d, sys, comp),
            MavMessage::LOG_REQUEST_LIST(d) => {
                let this = self.clone();
                self.tasks.spawn(async move {
                    logs::replay(&this.vehicle.logbook, this.outbox.as_ref(), d.start, d.end).await;
                });
            }
            MavMessage::LOGGING_DATA(_) => {
                info!("Got request for transferring data log list.");
                match drive_list(&self.vehicle.history.drives(), (sys, comp)) {
                    Ok(msgs) => {
                        for m in msgs {
                            self.outbox.send(m.into());
                        }
                    }
                    Err(e) => error!("Could not send drive list: {}", e),
                }
            }
            MavMessage::LOGGING_ACK(d) => self.transfer.on_ack(d.sequence),
            MavMessage::FILE_TRANSFER_PROTOCOL(d) => self.on_ftp(&d.payload, sys, comp).await,
            MavMessage::BUTTON_CHANGE(d) => self.vehicle.on_buttons(d.state),
            MavMessage::BATTERY_STATUS(d) => {
                if d.id == 1 {
                    self.put(Param::HvCurAmp, f64::from(d.current_battery) / 10.0);
                    self.put(Param::HvCurTemp, f64::from(d.temperature) / 100.0);
                    let cap = params.number(Param::HvConsCap) + f64::from(d.current_consumed) / 1000.0;
                    self.put(Param::HvConsCap, cap);
                    let energy = params.number(Param::HvConsEnergy) + f64::from(d.energy_consumed) / 1000.0;
                    self.put(Param::HvConsEnergy, energy);
                }
            }
            MavMessage::RADIO_STATUS(d) => {
                self.put(Param::RadioRssi, f64::from(d.rssi));
                self.put(Param::RadioRemrssi, f64::from(d.remrssi));
                self.put(Param::RadioTxbuf, f64::from(d.txbuf));
                self.put(Param::RadioNoise, f64::from(d.noise));
                self.put(Param::RadioRemnoise, f64::from(d.remnoise));
                self.put(Param::RadioRxerrors, f64::from(d.rxerrors));
                self.put(Param::RadioFixed, f64::from(d.fixed));
            }
            other => warn!("Received unknown msg: {} from: {}|{}", other.message_name(), sys, comp),
        }
    }

    async fn stream_params(&self) {
        let params = &self.vehicle.params;
        let all = params.params();
        let _hold = self.gate.suspend();
        for (i, p) in all.iter().enumerate() {
            self.outbox.send(param::param_value(params, *p, i as u16, all.len() as u16).into());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn on_command(self: &Arc<Self>, d: COMMAND_LONG_DATA, sys: u8, comp: u8) {
        let vehicle = &self.vehicle;
        match d.command {
            MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL => {
                let ok = self.periodic.set(d.param1 as u32, IntervalChange::from_param(d.param2));
                let result = if ok { MavResult::MAV_RESULT_ACCEPTED } else { MavResult::MAV_RESULT_UNSUPPORTED };
                self.ack(d.command, result);
            }
            MavCmd::MAV_CMD_DO_MOTOR_TEST => {
                let percent = MotorTestThrottleType::MOTOR_TEST_THROTTLE_PERCENT as u8 as f32;
                if d.param2 != percent {
                    self.ack(d.command, MavResult::MAV_RESULT_UNSUPPORTED);
                    return;
                }
                let traction = vehicle.traction.clone();
                if d.param3 == 0.0 {
                    self.tasks.spawn(async move { traction.abort_motor_test().await });
                } else {
                    let throttle = f64::from(d.param3.abs()) / 100.0;
                    let direction = if d.param3 > 0.0 { DrivingMode::Forward } else { DrivingMode::Reverse };
                    let duration = Duration::from_secs_f32(d.param4.max(0.0));
                    self.tasks.spawn(async move { traction.do_motor_test(throttle, direction, duration).await });
                }
            }
            MavCmd::MAV_CMD_LOGGING_START => {
                let index = d.param1.max(0.0) as usize;
                let this = self.clone();
                self.tasks.spawn(async move {
                    let dump = this.vehicle.history.export(index);
                    this.transfer.send_drive(dump, index, (sys, comp), this.outbox.as_ref(), &this.gate).await;
                });
            }
            MavCmd::MAV_CMD_LOGGING_STOP => self.transfer.stop(),
            MavCmd::MAV_CMD_DO_SET_MODE => match TsMode::from_f64(f64::from(d.param2)) {
                Some(mode) => {
                    vehicle.traction.set_ts_mode(mode);
                    self.ack(d.command, MavResult::MAV_RESULT_ACCEPTED);
                }
                None => self.ack(d.command, MavResult::MAV_RESULT_DENIED),
            },
            MavCmd::MAV_CMD_USER_1 => {
                vehicle.outputs.coolant_command(d.param1, d.param2);
                self.ack(d.command, MavResult::MAV_RESULT_ACCEPTED);
            }
            other => {
                debug!("link: unsupported command {:?}", other);
                self.ack(other, MavResult::MAV_RESULT_UNSUPPORTED);
            }
        }
    }

    async fn on_ftp(self: &Arc<Self>, raw: &[u8], sys: u8, comp: u8) {
        let req = match FtpPayload::decode(raw) {
            Ok(r) => r,
            Err(e) => {
                warn!("link: {}", e);
                return;
            }
        };
        let mut ftp = self.ftp.lock().await;
        let action = ftp.handle(&req).await;
        drop(ftp);

        let reply = |p: FtpPayload| {
            MavMessage::FILE_TRANSFER_PROTOCOL(FILE_TRANSFER_PROTOCOL_DATA {
                target_network: 0,
                target_system: sys,
                target_component: comp,
                payload: p.encode(),
            })
        };
        match action {
            FtpAction::Ignore => {}
            FtpAction::Reply(p) => self.outbox.send_priority(reply(p).into()),
            FtpAction::Finished(p, path) => {
                self.outbox.send_priority(reply(p).into());
                let firmware = self.firmware.clone();
                self.tasks.spawn(async move { firmware.install(&path).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::FirmwareConfig;
    use crate::outbox::OutboxReceiver;
    use vcu_core::hal::{Hardware, SimLeds, SimRelayBoard, SimWiper};
    use vcu_core::{LogBook, ModeFlags, SystemState, VehicleConfig};
    use vcu_params::ParamStore;
    use vcu_proto::mavlink::common::{
        BATTERY_STATUS_DATA, PARAM_REQUEST_LIST_DATA, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA,
    };
    use vcu_proto::FtpOpcode;

    struct Rig {
        session: Arc<MavlinkSession>,
        vehicle: Arc<Vehicle>,
        outbox: Arc<Outbox>,
        rx: OutboxReceiver,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let outbox = Outbox::new();
        let hw = Hardware {
            relays: Arc::new(SimRelayBoard::new()),
            leds: Arc::new(SimLeds::default()),
            throttle: Arc::new(SimWiper::default()),
            brake: Arc::new(SimWiper::default()),
        };
        let vehicle = Vehicle::new(
            Arc::new(ParamStore::in_memory()),
            hw,
            outbox.clone(),
            LogBook::new(),
            VehicleConfig::default(),
        );
        vehicle.start(false);
        let cfg = LinkConfig {
            data_dir: dir.path().to_path_buf(),
            firmware: FirmwareConfig { test: vec!["false".into()], ..FirmwareConfig::default() },
            ..LinkConfig::default()
        };
        let session = MavlinkSession::new(cfg, vehicle.clone(), outbox.clone()).unwrap();
        let rx = outbox.open();
        Rig { session, vehicle, outbox, rx, _dir: dir }
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<VcuMessage>) -> Vec<MavMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            if let VcuMessage::Common(m) = m {
                out.push(m);
            }
        }
        out
    }

    fn command(command: MavCmd, p: [f32; 4]) -> VcuMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            command,
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            target_system: 1,
            target_component: 1,
            ..Default::default()
        })
        .into()
    }

    fn acks(msgs: &[MavMessage]) -> Vec<(MavCmd, MavResult)> {
        msgs.iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_ACK(a) => Some((a.command, a.result)),
                _ => None,
            })
            .collect()
    }

    fn id16(s: &str) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[..s.len()].copy_from_slice(s.as_bytes());
        id
    }

    #[test]
    fn test_target_filter() {
        let r = rig();
        assert!(r.session.accepts((0, 0)));
        assert!(r.session.accepts((0, 77)));
        assert!(r.session.accepts((1, 0)));
        assert!(r.session.accepts((1, 1)));
        assert!(!r.session.accepts((1, 2)));
        assert!(!r.session.accepts((2, 1)));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_state_and_mode() {
        let r = rig();
        r.vehicle.params.set_mode_flag(ModeFlags::HIL_ENABLED, true);
        r.vehicle.traction.set_ts_mode(TsMode::Track);
        match heartbeat(&r.vehicle) {
            MavMessage::HEARTBEAT(h) => {
                assert_eq!(h.base_mode.bits(), 0x40 | 0x20);
                assert_eq!(h.custom_mode, 2);
                assert_eq!(h.system_status, SystemState::Standby.as_mav());
                assert_eq!(h.mavtype, MavType::MAV_TYPE_GROUND_ROVER);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(LinkConfig::default().validate().is_ok());
        let bad = LinkConfig { endpoint: "udp:x:1".into(), ..LinkConfig::default() };
        assert!(bad.validate().is_err());
        let bad = LinkConfig { reconnect_min_ms: 5000, reconnect_max_ms: 10, ..LinkConfig::default() };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_param_list_streams_and_suspends_telemetry() {
        let mut r = rig();
        let total = r.vehicle.params.params().len();
        r.session.handle_message(MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA::default()).into(), 255, 190).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!r.session.gate.is_open());
        tokio::time::sleep(Duration::from_millis(100 * total as u64)).await;
        assert!(r.session.gate.is_open());

        let values: Vec<_> = drain(&mut r.rx.normal)
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::PARAM_VALUE(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(values.len(), total);
        assert_eq!(values[3].param_index, 3);
        assert_eq!(values[3].param_count as usize, total);
    }

    #[tokio::test]
    async fn test_param_read_and_set() {
        let mut r = rig();
        let read = PARAM_REQUEST_READ_DATA { param_index: -1, param_id: id16("brake_dz"), ..Default::default() };
        r.session.handle_message(MavMessage::PARAM_REQUEST_READ(read).into(), 255, 190).await;

        let set = PARAM_SET_DATA { param_value: 0.5, param_id: id16("throttle_max_val"), ..Default::default() };
        r.session.handle_message(MavMessage::PARAM_SET(set).into(), 255, 190).await;
        assert_eq!(r.vehicle.params.number(Param::ThrottleMaxVal), 0.5);

        let bad = PARAM_SET_DATA { param_value: 7.0, param_id: id16("throttle_max_val"), ..Default::default() };
        r.session.handle_message(MavMessage::PARAM_SET(bad).into(), 255, 190).await;
        assert_eq!(r.vehicle.params.number(Param::ThrottleMaxVal), 0.5);

        let names: Vec<String> = drain(&mut r.rx.normal)
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::PARAM_VALUE(v) => Some(param::param_name(&v.param_id)),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["brake_dz", "throttle_max_val"]);
    }

    #[tokio::test]
    async fn test_commands() {
        let mut r = rig();
        let s = &r.session;
        s.handle_message(command(MavCmd::MAV_CMD_DO_MOTOR_TEST, [1.0, 1.0, 50.0, 2.0]), 255, 190).await;
        s.handle_message(command(MavCmd::MAV_CMD_NAV_LAND, [0.0; 4]), 255, 190).await;
        s.handle_message(command(MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, [50003.0, 250.0, 0.0, 0.0]), 255, 190).await;
        s.handle_message(command(MavCmd::MAV_CMD_DO_SET_MODE, [0.0, 1.0, 0.0, 0.0]), 255, 190).await;
        s.handle_message(command(MavCmd::MAV_CMD_DO_SET_MODE, [0.0, 9.0, 0.0, 0.0]), 255, 190).await;
        s.handle_message(command(MavCmd::MAV_CMD_USER_1, [1.0, 0.0, 0.0, 0.0]), 255, 190).await;

        assert_eq!(
            acks(&drain(&mut r.rx.normal)),
            vec![
                (MavCmd::MAV_CMD_DO_MOTOR_TEST, MavResult::MAV_RESULT_UNSUPPORTED),
                (MavCmd::MAV_CMD_NAV_LAND, MavResult::MAV_RESULT_UNSUPPORTED),
                (MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL, MavResult::MAV_RESULT_ACCEPTED),
                (MavCmd::MAV_CMD_DO_SET_MODE, MavResult::MAV_RESULT_ACCEPTED),
                (MavCmd::MAV_CMD_DO_SET_MODE, MavResult::MAV_RESULT_DENIED),
                (MavCmd::MAV_CMD_USER_1, MavResult::MAV_RESULT_ACCEPTED),
            ]
        );
        assert_eq!(s.periodic().interval(50003), Some(Duration::from_millis(250)));
        assert_eq!(r.vehicle.params.ts_mode(), TsMode::Service);
        assert!(r.vehicle.params.flag(Param::CoolPumpOutput));
        r.session.periodic().stop();
    }

    #[tokio::test]
    async fn test_hv_battery_and_radio_ingest() {
        let r = rig();
        r.vehicle.params.set(Param::HvConsCap, 2.0).unwrap();
        let hv = BATTERY_STATUS_DATA {
            id: 1,
            current_battery: 1234,
            temperature: 2550,
            current_consumed: 500,
            energy_consumed: 1500,
            ..Default::default()
        };
        r.session.handle_message(MavMessage::BATTERY_STATUS(hv).into(), 255, 190).await;
        let lv = BATTERY_STATUS_DATA { id: 0, current_battery: 99, ..Default::default() };
        r.session.handle_message(MavMessage::BATTERY_STATUS(lv).into(), 255, 190).await;

        let p = &r.vehicle.params;
        assert!((p.number(Param::HvCurAmp) - 123.4).abs() < 1e-9);
        assert!((p.number(Param::HvCurTemp) - 25.5).abs() < 1e-9);
        assert!((p.number(Param::HvConsCap) - 2.5).abs() < 1e-9);
        assert!((p.number(Param::HvConsEnergy) - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ftp_replies_go_first_while_telemetry_continues() {
        let mut r = rig();
        let ftp = |opcode, session, data: &[u8]| {
            let p = FtpPayload {
                seq: 1,
                session,
                opcode,
                size: data.len() as u8,
                req_opcode: FtpOpcode::None,
                burst_complete: 0,
                offset: 0,
                data: data.to_vec(),
            };
            MavMessage::FILE_TRANSFER_PROTOCOL(FILE_TRANSFER_PROTOCOL_DATA {
                target_system: 1,
                target_component: 1,
                payload: p.encode(),
                ..Default::default()
            })
            .into()
        };
        r.session.handle_message(ftp(FtpOpcode::CreateFile, 0, b"fw.zip"), 255, 190).await;
        let replies = drain(&mut r.rx.priority);
        let session = match &replies[0] {
            MavMessage::FILE_TRANSFER_PROTOCOL(d) => {
                let p = FtpPayload::decode(&d.payload).unwrap();
                assert_eq!(p.opcode, FtpOpcode::Ack);
                assert_eq!(d.target_system, 255);
                p.session
            }
            other => panic!("unexpected {:?}", other),
        };
        while r.rx.normal.try_recv().is_ok() {}
        r.vehicle.outputs.announce();
        assert_eq!(r.rx.normal.try_recv().unwrap().message_name(), "DIGITAL_OUTPUTS");

        r.session.handle_message(ftp(FtpOpcode::WriteFile, session, b"PK"), 255, 190).await;
        r.session.handle_message(ftp(FtpOpcode::TerminateSession, session, b""), 255, 190).await;
        assert_eq!(drain(&mut r.rx.priority).len(), 2);
        r.session.tasks.close();
        r.session.tasks.wait().await;
    }

    #[tokio::test]
    async fn test_serves_tcp_peer() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let r = rig();
        let cfg = LinkConfig {
            endpoint: format!("tcp:127.0.0.1:{}", port),
            data_dir: r._dir.path().to_path_buf(),
            ..LinkConfig::default()
        };
        let session = MavlinkSession::new(cfg, r.vehicle.clone(), r.outbox.clone()).unwrap();
        let mut state = session.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(session.clone().run(cancel.clone()));

        let (mut peer, _) = listener.accept().await.unwrap();
        state.wait_for(|s| *s == LinkState::Ready).await.unwrap();

        let read = PARAM_REQUEST_READ_DATA {
            target_system: 1,
            target_component: 1,
            param_index: -1,
            param_id: id16("lv_bdi"),
        };
        let frame = RawFrame::encode(MavlinkVersion::V2, 0, 255, 190, &MavMessage::PARAM_REQUEST_READ(read).into()).unwrap();
        peer.write_all(&frame.bytes).await.unwrap();

        let mut codec = MavCodec::new();
        let mut buf = BytesMut::new();
        let (mut saw_heartbeat, mut saw_param) = (false, false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(saw_heartbeat && saw_param) && tokio::time::Instant::now() < deadline {
            tokio::time::timeout(Duration::from_secs(1), peer.read_buf(&mut buf)).await.ok();
            while let Some(f) = codec.decode(&mut buf).unwrap() {
                assert_eq!((f.sys, f.comp), (1, 1));
                match f.message().unwrap() {
                    VcuMessage::Common(MavMessage::HEARTBEAT(_)) => saw_heartbeat = true,
                    VcuMessage::Common(MavMessage::PARAM_VALUE(v)) => {
                        saw_param = param::param_name(&v.param_id) == "lv_bdi";
                    }
                    _ => {}
                }
            }
        }
        assert!(saw_heartbeat && saw_param);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), LinkState::Disconnected);
    }
}
