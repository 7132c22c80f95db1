//! Outbound side of the link: two message lanes drained by a single writer.
//!
//! Nothing is queued while the link is down. The priority lane (file transfer,
//! status text) is always drained before normal telemetry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use vcu_core::TelemetrySink;
use vcu_proto::{MavlinkVersion, RawFrame, VcuMessage};

type Lanes = (mpsc::UnboundedSender<VcuMessage>, mpsc::UnboundedSender<VcuMessage>);

#[derive(Default)]
pub struct Outbox {
    lanes: Mutex<Option<Lanes>>,
}

/// Receiving ends handed to the writer of one connection.
pub struct OutboxReceiver {
    pub priority: mpsc::UnboundedReceiver<VcuMessage>,
    pub normal: mpsc::UnboundedReceiver<VcuMessage>,
}

impl Outbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lanes(&self) -> MutexGuard<'_, Option<Lanes>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Link is up. Replaces the lanes of any previous connection.
    pub fn open(&self) -> OutboxReceiver {
        let (ptx, prx) = mpsc::unbounded_channel();
        let (ntx, nrx) = mpsc::unbounded_channel();
        *self.lanes() = Some((ptx, ntx));
        OutboxReceiver { priority: prx, normal: nrx }
    }

    pub fn close(&self) {
        *self.lanes() = None;
    }

    pub fn is_open(&self) -> bool {
        self.lanes().is_some()
    }
}

impl TelemetrySink for Outbox {
    fn send(&self, msg: VcuMessage) {
        if let Some((_, normal)) = self.lanes().as_ref() {
            normal.send(msg).ok();
        }
    }

    fn send_priority(&self, msg: VcuMessage) {
        if let Some((priority, _)) = self.lanes().as_ref() {
            priority.send(msg).ok();
        }
    }
}

/// Counts who currently wants periodic telemetry off.
#[derive(Default)]
pub struct TelemetryGate {
    holds: AtomicUsize,
}

impl TelemetryGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_open(&self) -> bool {
        self.holds.load(Ordering::Relaxed) == 0
    }

    pub fn suspend(self: &Arc<Self>) -> SuspendGuard {
        if self.holds.fetch_add(1, Ordering::Relaxed) == 0 {
            debug!("Stopping sending mav messages.");
        }
        SuspendGuard { gate: self.clone() }
    }
}

/// Resumes telemetry when dropped.
pub struct SuspendGuard {
    gate: Arc<TelemetryGate>,
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if self.gate.holds.fetch_sub(1, Ordering::Relaxed) == 1 {
            debug!("Start sending mav messages.");
        }
    }
}

/// Frame header fields for everything this node sends.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub sys: u8,
    pub comp: u8,
    pub version: MavlinkVersion,
}

/// Serializes queued messages onto `writer`, priority lane first.
/// Returns when the connection fails, the lanes close or `cancel` fires.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut rx: OutboxReceiver,
    mut writer: W,
    id: Identity,
    cancel: CancellationToken,
) {
    let mut seq: u8 = 0;
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(m) = rx.priority.recv() => m,
            Some(m) = rx.normal.recv() => m,
            else => break,
        };
        let frame = match RawFrame::encode(id.version, seq, id.sys, id.comp, &msg) {
            Ok(f) => f,
            Err(e) => {
                warn!("Error when sending msg ({}): {}", msg.message_name(), e);
                continue;
            }
        };
        seq = seq.wrapping_add(1);
        if let Err(e) = writer.write_all(&frame.bytes).await {
            error!("Error when sending msg ({}): {}", msg.message_name(), e);
            break;
        }
    }
}
