//! Frame switch between the ground station, the vehicle and radio links.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use vcu_proto::{Endpoint, LinkStream, MavCodec, RawFrame};

use crate::table::{LinkId, Route, RoutingTable};

const HEARTBEAT_ID: u32 = 0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen: String,
    pub serial_devices: Vec<String>,
    pub serial_baud: u32,
    /// One queued frame leaves a slow link per interval.
    pub slow_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0:5432".into(), serial_devices: Vec::new(), serial_baud: 57600, slow_interval_ms: 15 }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.slow_interval_ms > 0, "router.slow_interval_ms must be > 0");
        ensure!(self.serial_baud > 0, "router.serial_baud must be > 0");
        for dev in &self.serial_devices {
            ensure!(!dev.trim().is_empty(), "router.serial_devices contains an empty entry");
        }
        Ok(())
    }
}

pub struct Router {
    cfg: RouterConfig,
    table: Mutex<RoutingTable>,
    links: Mutex<HashMap<LinkId, mpsc::UnboundedSender<Bytes>>>,
    next_id: AtomicU64,
    tasks: TaskTracker,
}

impl Router {
    pub fn new(cfg: RouterConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            table: Mutex::new(RoutingTable::new()),
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tasks: TaskTracker::new(),
        })
    }

    fn table(&self) -> MutexGuard<'_, RoutingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<LinkId, mpsc::UnboundedSender<Bytes>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.table().routes().to_vec()
    }

    /// Starts reading and writing `stream`. Slow links are drained one frame
    /// per `slow_interval_ms`.
    pub fn add_link<S: LinkStream + 'static>(self: &Arc<Self>, stream: S, slow: bool, cancel: &CancellationToken) -> LinkId {
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        self.links().insert(id, tx);

        let conn = cancel.child_token();
        let every = Duration::from_millis(self.cfg.slow_interval_ms);
        let wconn = conn.clone();
        self.tasks.spawn(async move {
            if slow {
                drain_slow(rx, writer, every, wconn.clone()).await;
            } else {
                drain_fast(rx, writer, wconn.clone()).await;
            }
            wconn.cancel();
        });
        let this = self.clone();
        self.tasks.spawn(async move {
            this.read_link(id, reader, &conn).await;
            conn.cancel();
            this.remove_link(id);
        });
        id
    }

    fn remove_link(&self, id: LinkId) {
        self.links().remove(&id);
        for r in self.table().drop_link(id) {
            debug!("Removed connection: SYS ID: {} | COMP ID: {}", r.sys, r.comp);
        }
    }

    async fn read_link<S: LinkStream>(&self, id: LinkId, mut reader: ReadHalf<S>, cancel: &CancellationToken) {
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
                    error!("Error on routing message: {}", e);
                    break;
                }
            }
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => self.route(id, &frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("router: decode: {}", e);
                        break;
                    }
                }
            }
        }
    }

    /// Learns the sender on a heartbeat, then forwards the frame untouched.
    pub fn route(&self, origin: LinkId, frame: &RawFrame) {
        let target = frame.message().map(|m| m.target()).unwrap_or((0, 0));
        let dests = {
            let mut table = self.table();
            if frame.msg_id == HEARTBEAT_ID && table.learn(origin, frame.sys, frame.comp) {
                debug!("Added new connection: SYS ID: {} | COMP ID: {}", frame.sys, frame.comp);
            }
            table.destinations(origin, target)
        };
        debug!(
            "Got {} from: {}|{} to {}|{}, ({} bytes)",
            frame.msg_id,
            frame.sys,
            frame.comp,
            target.0,
            target.1,
            frame.payload.len()
        );
        let links = self.links();
        for d in dests {
            if let Some(tx) = links.get(&d) {
                tx.send(frame.bytes.clone()).ok();
            }
        }
    }

    /// Listens for TCP peers and opens the serial devices until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Initiating mavlink router..");
        info!("Version: {}", env!("CARGO_PKG_VERSION"));
        let listener = TcpListener::bind(&self.cfg.listen).await.with_context(|| format!("bind {}", self.cfg.listen))?;
        info!("TCP Server started!");

        for dev in &self.cfg.serial_devices {
            let ep = Endpoint::Serial { dev: dev.trim().to_string(), baud: self.cfg.serial_baud };
            match ep.connect().await {
                Ok(stream) => {
                    info!("Registered new port: {}", dev);
                    self.add_link(stream, true, &cancel);
                }
                Err(e) => error!("router: {:#}", e),
            }
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                a = listener.accept() => a,
            };
            match accepted {
                Ok((sock, peer)) => {
                    sock.set_nodelay(true).ok();
                    self.add_link(sock, false, &cancel);
                    info!("New tcp connection. ({})", peer);
                }
                Err(e) => error!("router: accept: {}", e),
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }
}

async fn drain_fast<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            f = rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            error!("Error when routing msg: {}", e);
            break;
        }
    }
}

/// The channel is the backlog; it is dropped with the link. Consecutive
/// frames leave at least `every` apart.
async fn drain_slow<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    every: Duration,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            f = rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&frame).await {
            error!("Error when routing msg: {}", e);
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::time::Instant;
    use vcu_proto::mavlink::common::{MavCmd, MavMessage, COMMAND_LONG_DATA, HEARTBEAT_DATA, SYSTEM_TIME_DATA};
    use vcu_proto::{MavlinkVersion, VcuMessage};

    struct Peer {
        io: DuplexStream,
        codec: MavCodec,
        buf: BytesMut,
    }

    impl Peer {
        async fn send(&mut self, sys: u8, comp: u8, msg: MavMessage) {
            let frame = RawFrame::encode(MavlinkVersion::V2, 0, sys, comp, &VcuMessage::Common(msg)).unwrap();
            self.io.write_all(&frame.bytes).await.unwrap();
        }

        async fn recv(&mut self) -> RawFrame {
            loop {
                if let Some(f) = self.codec.decode(&mut self.buf).unwrap() {
                    return f;
                }
                assert!(self.io.read_buf(&mut self.buf).await.unwrap() > 0);
            }
        }

        async fn nothing(&mut self) -> bool {
            tokio::time::timeout(Duration::from_millis(200), self.recv()).await.is_err()
        }
    }

    fn link(router: &Arc<Router>, slow: bool, cancel: &CancellationToken) -> Peer {
        let (ours, theirs) = tokio::io::duplex(8192);
        router.add_link(ours, slow, cancel);
        Peer { io: theirs, codec: MavCodec::new(), buf: BytesMut::new() }
    }

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA::default())
    }

    fn command(sys: u8, comp: u8) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            target_system: sys,
            target_component: comp,
            ..Default::default()
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_targeted_and_broadcast() {
        let router = Router::new(RouterConfig::default());
        let cancel = CancellationToken::new();
        let mut gcs = link(&router, false, &cancel);
        let mut vcu = link(&router, false, &cancel);
        let mut radio = link(&router, false, &cancel);

        gcs.send(255, 190, heartbeat()).await;
        settle().await;
        vcu.send(1, 1, heartbeat()).await;
        assert_eq!(gcs.recv().await.sys, 1);
        radio.send(2, 1, heartbeat()).await;
        assert_eq!(gcs.recv().await.sys, 2);
        assert_eq!(vcu.recv().await.sys, 2);
        assert_eq!(router.routes().len(), 3);

        gcs.send(255, 190, command(1, 0)).await;
        let f = vcu.recv().await;
        assert_eq!((f.sys, f.comp), (255, 190));
        assert!(radio.nothing().await);

        let time = MavMessage::SYSTEM_TIME(SYSTEM_TIME_DATA::default());
        vcu.send(1, 1, time).await;
        assert_eq!(gcs.recv().await.msg_id, 2);
        assert_eq!(radio.recv().await.msg_id, 2);
        assert!(vcu.nothing().await);

        drop(radio);
        settle().await;
        assert_eq!(router.routes().len(), 2);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_forwarded_byte_for_byte() {
        let router = Router::new(RouterConfig::default());
        let cancel = CancellationToken::new();
        let mut a = link(&router, false, &cancel);
        let mut b = link(&router, false, &cancel);
        b.send(1, 1, heartbeat()).await;
        settle().await;

        let original = RawFrame::encode(MavlinkVersion::V2, 77, 255, 190, &VcuMessage::Common(command(1, 1))).unwrap();
        a.io.write_all(&original.bytes).await.unwrap();
        assert_eq!(b.recv().await.bytes, original.bytes);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_link_drains_one_frame_per_interval() {
        let router = Router::new(RouterConfig::default());
        let cancel = CancellationToken::new();
        let mut gcs = link(&router, false, &cancel);
        let mut radio = link(&router, true, &cancel);
        radio.send(2, 1, heartbeat()).await;
        settle().await;

        for _ in 0..4 {
            gcs.send(255, 190, command(2, 1)).await;
        }
        let first = radio.recv().await;
        assert_eq!(first.sys, 255);
        let start = Instant::now();
        for _ in 0..3 {
            radio.recv().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(45));
        cancel.cancel();
    }
}
