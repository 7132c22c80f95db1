//! Acknowledged chunked transfer of a recorded drive.
//!
//! The dump is raw-deflated and cut into chunks. A sizing frame comes first,
//! then every chunk is sent as LOGGING_DATA_ACKED and must be echoed by a
//! LOGGING_ACK with the same sequence before the next one goes out. The final
//! chunk is always empty.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};
use vcu_core::TelemetrySink;
use vcu_proto::mavlink::common::{MavMessage, LOGGING_DATA_ACKED_DATA, LOGGING_DATA_DATA};

use crate::error::TransferError;
use crate::outbox::TelemetryGate;

pub const LOGGING_DATA_LEN: usize = 249;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub info_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { chunk_size: 200, info_timeout_ms: 5000, ack_timeout_ms: 2000, max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Stopped,
}

pub fn compress(dump: &serde_json::Value) -> Result<Vec<u8>, TransferError> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&serde_json::to_vec(dump)?)?;
    Ok(enc.finish()?)
}

fn data_field(bytes: &[u8]) -> ([u8; LOGGING_DATA_LEN], u8) {
    let mut data = [0u8; LOGGING_DATA_LEN];
    let n = bytes.len().min(LOGGING_DATA_LEN);
    data[..n].copy_from_slice(&bytes[..n]);
    (data, n as u8)
}

fn acked(target: (u8, u8), seq: u16, offset: u8, bytes: &[u8]) -> MavMessage {
    let (data, length) = data_field(bytes);
    MavMessage::LOGGING_DATA_ACKED(LOGGING_DATA_ACKED_DATA {
        sequence: seq,
        target_system: target.0,
        target_component: target.1,
        length,
        first_message_offset: offset,
        data,
    })
}

/// One LOGGING_DATA per recorded drive, `{"id", "date"}` as JSON.
pub fn drive_list(drives: &[vcu_core::DriveInfo], target: (u8, u8)) -> Result<Vec<MavMessage>, TransferError> {
    drives
        .iter()
        .map(|d| {
            let body = serde_json::to_vec(&json!({ "id": d.id, "date": d.date }))?;
            let (data, length) = data_field(&body);
            Ok(MavMessage::LOGGING_DATA(LOGGING_DATA_DATA {
                sequence: d.id as u16,
                target_system: target.0,
                target_component: target.1,
                length,
                first_message_offset: (d.id % 256) as u8,
                data,
            }))
        })
        .collect()
}

pub struct LogTransfer {
    cfg: TransferConfig,
    acks_tx: mpsc::UnboundedSender<u16>,
    acks: Mutex<mpsc::UnboundedReceiver<u16>>,
    stop: AtomicBool,
}

impl LogTransfer {
    pub fn new(cfg: TransferConfig) -> Self {
        let (acks_tx, acks) = mpsc::unbounded_channel();
        Self { cfg, acks_tx, acks: Mutex::new(acks), stop: AtomicBool::new(false) }
    }

    /// LOGGING_ACK from the peer.
    pub fn on_ack(&self, seq: u16) {
        self.acks_tx.send(seq).ok();
    }

    /// Ends a running transfer at the next chunk boundary.
    pub fn stop(&self) {
        info!("Stopping..");
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Sends `data` to `target`. Only one transfer runs at a time; a second
    /// request waits for the first one.
    pub async fn send(
        &self,
        data: &[u8],
        target: (u8, u8),
        sink: &dyn TelemetrySink,
        gate: &std::sync::Arc<TelemetryGate>,
    ) -> Result<TransferOutcome, TransferError> {
        let mut acks = self.acks.lock().await;
        self.stop.store(false, Ordering::Relaxed);
        while acks.try_recv().is_ok() {}

        let size = self.cfg.chunk_size.clamp(1, LOGGING_DATA_LEN);
        let chunks = data.len().div_ceil(size);
        info!("Start transferring log..");

        let info = serde_json::to_vec(&json!({ "packets": chunks }))?;
        sink.send(acked(target, 0, 0, &info).into());
        let info_wait = Duration::from_millis(self.cfg.info_timeout_ms);
        if !matches!(tokio::time::timeout(info_wait, acks.recv()).await, Ok(Some(_))) {
            return Err(TransferError::NoInfoAck);
        }

        let _hold = gate.suspend();
        let ack_wait = Duration::from_millis(self.cfg.ack_timeout_ms);
        let mut i = 0;
        let mut attempts = 0;
        while i <= chunks {
            if self.stop.load(Ordering::Relaxed) {
                info!("Stopped sending logging data.");
                return Ok(TransferOutcome::Stopped);
            }
            if attempts >= self.cfg.max_attempts {
                return Err(TransferError::Retries { seq: i, attempts });
            }
            let body = if i < chunks { &data[i * size..((i + 1) * size).min(data.len())] } else { &[][..] };
            let seq = (i % 255) as u16;
            sink.send(acked(target, seq, seq as u8, body).into());
            attempts += 1;
            match tokio::time::timeout(ack_wait, acks.recv()).await {
                Ok(Some(got)) if got == seq => {
                    i += 1;
                    attempts = 0;
                }
                _ => {}
            }
        }
        Ok(TransferOutcome::Completed)
    }

    /// Compresses and sends one drive dump, logging the outcome.
    pub async fn send_drive(
        &self,
        dump: Option<serde_json::Value>,
        index: usize,
        target: (u8, u8),
        sink: &dyn TelemetrySink,
        gate: &std::sync::Arc<TelemetryGate>,
    ) -> Option<TransferOutcome> {
        info!("Got request for transferring data log: {}", index);
        let result = match dump {
            Some(dump) => match compress(&dump) {
                Ok(data) => self.send(&data, target, sink, gate).await,
                Err(e) => Err(e),
            },
            None => Err(TransferError::NoSuchDrive(index)),
        };
        match result {
            Ok(TransferOutcome::Completed) => {
                info!("Transferred data log succeeded!");
                Some(TransferOutcome::Completed)
            }
            Ok(outcome) => Some(outcome),
            Err(TransferError::NoInfoAck) => {
                error!("Failed to send info packet, skipping the rest.");
                None
            }
            Err(TransferError::Retries { attempts, .. }) => {
                error!("Sending data log failed after {} tries.", attempts);
                None
            }
            Err(e) => {
                error!("transfer: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use vcu_core::telemetry::testing::RecordingSink;
    use vcu_proto::VcuMessage;

    fn frames(sink: &RecordingSink) -> Vec<LOGGING_DATA_ACKED_DATA> {
        sink.messages()
            .into_iter()
            .filter_map(|m| match m {
                VcuMessage::Common(MavMessage::LOGGING_DATA_ACKED(d)) => Some(d),
                _ => None,
            })
            .collect()
    }

    /// Peer that acknowledges every frame it sees, once.
    fn auto_ack(transfer: Arc<LogTransfer>, sink: Arc<RecordingSink>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut seen = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let sent = frames(&sink);
                for f in &sent[seen..] {
                    transfer.on_ack(f.sequence);
                }
                seen = sent.len();
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_transfer_send_count() {
        let transfer = Arc::new(LogTransfer::new(TransferConfig::default()));
        let sink = Arc::new(RecordingSink::new());
        let gate = TelemetryGate::new();
        let peer = auto_ack(transfer.clone(), sink.clone());

        let data: Vec<u8> = (0..450u32).map(|v| v as u8).collect();
        let out = transfer.send(&data, (255, 190), sink.as_ref(), &gate).await.unwrap();
        peer.abort();

        assert_eq!(out, TransferOutcome::Completed);
        let sent = frames(&sink);
        // sizing frame + 3 data chunks + empty terminator
        assert_eq!(sent.len(), 5);
        assert_eq!(&sent[0].data[..sent[0].length as usize], br#"{"packets":3}"#);
        assert_eq!(sent[1].length, 200);
        assert_eq!(sent[3].length, 50);
        assert_eq!(sent[4].length, 0);
        assert_eq!(sent[4].sequence, 3);
        assert_eq!(sent[2].target_component, 190);
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_info_ack_aborts() {
        let transfer = LogTransfer::new(TransferConfig::default());
        let sink = RecordingSink::new();
        let gate = TelemetryGate::new();
        let started = tokio::time::Instant::now();
        let err = transfer.send(&[1, 2, 3], (1, 1), &sink, &gate).await.unwrap_err();
        assert!(matches!(err, TransferError::NoInfoAck));
        assert_eq!(started.elapsed(), Duration::from_millis(5000));
        assert_eq!(frames(&sink).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_five_attempts() {
        let transfer = Arc::new(LogTransfer::new(TransferConfig::default()));
        let sink = RecordingSink::new();
        let gate = TelemetryGate::new();
        transfer.on_ack(0);
        let t = transfer.clone();
        // acknowledge the sizing frame only; the channel is drained on start
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.on_ack(0);
        });
        let err = transfer.send(&[7; 10], (1, 1), &sink, &gate).await.unwrap_err();
        assert!(matches!(err, TransferError::Retries { seq: 0, attempts: 5 }));
        assert_eq!(frames(&sink).len(), 6);
        assert!(gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_sequence_is_retried() {
        let transfer = Arc::new(LogTransfer::new(TransferConfig::default()));
        let sink = Arc::new(RecordingSink::new());
        let gate = TelemetryGate::new();
        let (t, s) = (transfer.clone(), sink.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.on_ack(0); // sizing
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.on_ack(9); // wrong, chunk 0 is resent
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(frames(&s).len(), 3);
            t.on_ack(0);
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.on_ack(1);
        });
        let out = transfer.send(&[1; 20], (1, 1), sink.as_ref(), &gate).await.unwrap();
        assert_eq!(out, TransferOutcome::Completed);
        assert_eq!(frames(&sink).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_at_chunk_boundary() {
        let transfer = Arc::new(LogTransfer::new(TransferConfig::default()));
        let sink = Arc::new(RecordingSink::new());
        let gate = TelemetryGate::new();
        let (t, s) = (transfer.clone(), sink.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.on_ack(0);
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.stop();
            let seq = frames(&s).last().map(|f| f.sequence).unwrap_or_default();
            t.on_ack(seq);
        });
        let out = transfer.send(&[1; 1000], (1, 1), sink.as_ref(), &gate).await.unwrap();
        assert_eq!(out, TransferOutcome::Stopped);
        assert_eq!(frames(&sink).len(), 2);
    }

    #[test]
    fn test_compress_is_raw_deflate_json() {
        let dump = json!({ "speed": [{ "t": 0, "v": 1.5 }] });
        let packed = compress(&dump).unwrap();
        let mut text = String::new();
        DeflateDecoder::new(&packed[..]).read_to_string(&mut text).unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), dump);
    }

    #[test]
    fn test_drive_list_frames() {
        let drives = [vcu_core::DriveInfo { id: 0, date: 1_700_000_000_000 }, vcu_core::DriveInfo { id: 1, date: 5 }];
        let msgs = drive_list(&drives, (255, 0)).unwrap();
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            MavMessage::LOGGING_DATA(d) => {
                assert_eq!(d.sequence, 1);
                assert_eq!(&d.data[..d.length as usize], br#"{"date":5,"id":1}"#);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drive_list(&[], (255, 0)).unwrap().is_empty());
    }
}
