//! Hardware-in-the-loop input: a simulator streams little-endian f64 arrays
//! over TCP and they are written straight onto the parameters.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};
use vcu_core::{ModeFlags, VehicleState};
use vcu_params::{Param, ParamStore};

/// Values per simulator frame.
pub const FRAME_VALUES: usize = 22;
pub const FRAME_LEN: usize = FRAME_VALUES * 8;

const KELVIN: f64 = 273.15;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HilConfig {
    /// Boot with HIL_ENABLED set.
    pub enabled: bool,
    pub bind: String,
}

impl Default for HilConfig {
    fn default() -> Self {
        Self { enabled: false, bind: "0.0.0.0:6000".into() }
    }
}

/// Frame slot to parameter. Slot 2 is unused; slot 4 is in kelvin.
const MAPPING: &[(usize, Param)] = &[
    (0, Param::HvCurAmp),
    (1, Param::HvConsEnergy),
    (3, Param::HvCurVoltage),
    (4, Param::HvCurTemp),
    (5, Param::HvBdi),
    (6, Param::GpsLatitude),
    (7, Param::GpsLongitude),
    (8, Param::VehicleHeading),
    (9, Param::GpsAltitude),
    (10, Param::GpsSpeed),
    (11, Param::AccLon),
    (12, Param::AccLat),
    (13, Param::AccVer),
    (14, Param::GyroLon),
    (15, Param::GyroLat),
    (16, Param::GyroVer),
    (17, Param::TsTorque),
    (18, Param::TsRpm),
    (19, Param::VehicleSteering),
    (20, Param::ThrottleOutput),
    (21, Param::BrakeInput),
];

/// Splits complete frames off the front of `buf`.
pub fn take_frames(buf: &mut Vec<u8>) -> Vec<[f64; FRAME_VALUES]> {
    let whole = buf.len() / FRAME_LEN * FRAME_LEN;
    let frames = buf[..whole]
        .chunks_exact(FRAME_LEN)
        .map(|raw| {
            let mut values = [0.0; FRAME_VALUES];
            for (v, b) in values.iter_mut().zip(raw.chunks_exact(8)) {
                let mut le = [0u8; 8];
                le.copy_from_slice(b);
                *v = f64::from_le_bytes(le);
            }
            values
        })
        .collect();
    buf.drain(..whole);
    frames
}

pub fn apply(params: &ParamStore, values: &[f64; FRAME_VALUES]) {
    for (slot, param) in MAPPING {
        let mut v = values[*slot];
        if *param == Param::HvCurTemp {
            v -= KELVIN;
        }
        if let Err(e) = params.set(*param, v) {
            debug!("hil: {}", e);
        }
    }
}

async fn serve_client(params: Arc<ParamStore>, mut sock: TcpStream, cancel: CancellationToken) {
    let mut buf = Vec::with_capacity(FRAME_LEN * 2);
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            r = sock.read(&mut chunk) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("Error on HIL Client socket: {}", e);
                    break;
                }
            },
        };
        buf.extend_from_slice(&chunk[..n]);
        for frame in take_frames(&mut buf) {
            apply(&params, &frame);
        }
    }
    info!("HIL Client disconnected!");
}

/// Serves simulator clients while HIL mode is on. Returns immediately otherwise.
pub async fn run(params: Arc<ParamStore>, cfg: HilConfig, cancel: CancellationToken) -> Result<()> {
    if !params.in_mode(ModeFlags::HIL_ENABLED) {
        debug!("hil: not in HIL mode");
        return Ok(());
    }
    info!("Initializing HIL server..");
    let listener = TcpListener::bind(&cfg.bind).await.with_context(|| format!("bind {}", cfg.bind))?;
    info!("HIL Server started!");
    let clients = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((sock, peer)) => {
                info!("HIL Client connected! ({})", peer);
                clients.spawn(serve_client(params.clone(), sock, cancel.clone()));
            }
            Err(e) => error!("HIL Server error: {}", e),
        }
    }
    clients.close();
    clients.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn frame() -> Vec<u8> {
        let mut values = [0.0f64; FRAME_VALUES];
        values[0] = 120.0;
        values[4] = 300.0;
        values[6] = 57.7;
        values[20] = 0.4;
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_partial_frames_are_kept() {
        let raw = frame();
        let mut buf = raw[..100].to_vec();
        assert!(take_frames(&mut buf).is_empty());
        buf.extend_from_slice(&raw[100..]);
        buf.extend_from_slice(&raw[..8]);
        let frames = take_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][6], 57.7);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_apply_maps_slots() {
        let params = ParamStore::in_memory();
        let mut buf = frame();
        apply(&params, &take_frames(&mut buf)[0]);
        assert_eq!(params.number(Param::HvCurAmp), 120.0);
        assert!((params.number(Param::HvCurTemp) - 26.85).abs() < 1e-9);
        assert_eq!(params.number(Param::GpsLatitude), 57.7);
        assert_eq!(params.number(Param::ThrottleOutput), 0.4);
    }

    #[tokio::test]
    async fn test_idle_without_hil_mode() {
        let params = Arc::new(ParamStore::in_memory());
        run(params, HilConfig { enabled: false, bind: "127.0.0.1:0".into() }, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_frames_reach_params() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let params = Arc::new(ParamStore::in_memory());
        params.set_mode_flag(ModeFlags::HIL_ENABLED, true);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(run(params.clone(), HilConfig { enabled: true, bind: addr.to_string() }, cancel.clone()));

        let mut client = loop {
            match TcpStream::connect(addr).await {
                Ok(c) => break c,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        client.write_all(&frame()).await.unwrap();
        for _ in 0..100 {
            if params.number(Param::HvCurAmp) == 120.0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(params.number(Param::HvCurAmp), 120.0);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
