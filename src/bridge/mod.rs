use crate::config::SensorConfig;
use crate::util::now_ts_millis;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod protocol;

use protocol::{
    decode_message, encode_message, frame_codec, AgentDeath, ObservationFrame, SensorUpdate,
    ServerTick, SpawnConfirm, WireMessage,
};

/// Connection lifecycle. Every error path falls back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Authenticated,
    Registered,
    Streaming,
}

/// Events fanned out to subscribers. Frames are not delivered through this
/// channel: the frame path is keep-latest per agent (see `latest`), while
/// these are FIFO with the broadcast channel's bounded capacity.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Tick(ServerTick),
    Checkpoint { tick: u64 },
    Evolution { tick: u64 },
    ServerShutdown,
    SpawnConfirm(SpawnConfirm),
    AgentDeath(AgentDeath),
    /// Terminal for this client instance; the process decides what to do.
    ReconnectFailed,
}

/// Result of a latest-frame lookup.
#[derive(Debug, Clone)]
pub enum FrameQuery {
    Fresh(ObservationFrame),
    /// Present but older than the stale window.
    Stale(ObservationFrame),
    None,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
}

const OUTBOUND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;

/// Client for the sensor hub: one authenticated duplex stream, typed event
/// fanout, a keep-latest frame cache, and an outbound command queue that
/// survives reconnects.
pub struct SensorBridge {
    config: SensorConfig,
    state: RwLock<ConnState>,
    frames: RwLock<HashMap<String, ObservationFrame>>,
    registered: RwLock<HashSet<String>>,
    frame_notify: Notify,
    events_tx: broadcast::Sender<BridgeEvent>,
    out_tx: mpsc::Sender<WireMessage>,
    out_rx: Mutex<Option<mpsc::Receiver<WireMessage>>>,
    running: AtomicBool,
    cancel: CancellationToken,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl SensorBridge {
    pub fn new(config: SensorConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Arc::new(Self {
            config,
            state: RwLock::new(ConnState::Disconnected),
            frames: RwLock::new(HashMap::new()),
            registered: RwLock::new(HashSet::new()),
            frame_notify: Notify::new(),
            events_tx,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Starts the connection task. Idempotent: a second call while running is
    /// a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bridge = self.clone();
        tokio::spawn(async move {
            bridge.run().await;
            bridge.running.store(false, Ordering::SeqCst);
        });
    }

    /// Stops the connection task. Idempotent and safe in any state.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        *self.state.write().await = ConnState::Disconnected;
    }

    /// Tells the hub this core consumes frames for `bot`. Registration is
    /// replayed automatically after every reconnect.
    pub async fn register(&self, bot: &str) {
        self.registered.write().await.insert(bot.to_string());
        let _ = self
            .out_tx
            .send(WireMessage::RegisterBot {
                bot: bot.to_string(),
            })
            .await;
    }

    pub async fn unregister(&self, bot: &str) {
        self.registered.write().await.remove(bot);
        self.frames.write().await.remove(bot);
    }

    /// Queues an outbound message (action, spawn, remove). The queue is
    /// bounded; a full queue is reported to the caller rather than blocking
    /// the tick path.
    pub fn send(&self, msg: WireMessage) -> Result<()> {
        self.out_tx
            .try_send(msg)
            .map_err(|e| anyhow::anyhow!("bridge outbound queue full: {e}"))
    }

    /// Most recent frame for `bot`, stale-marked past the configured window.
    pub async fn latest(&self, bot: &str) -> FrameQuery {
        let frames = self.frames.read().await;
        match frames.get(bot) {
            None => FrameQuery::None,
            Some(frame) => {
                let age = now_ts_millis().saturating_sub(frame.received_at_ms);
                if age > self.config.stale_window_ms {
                    FrameQuery::Stale(frame.clone())
                } else {
                    FrameQuery::Fresh(frame.clone())
                }
            }
        }
    }

    /// Waits until a frame with sequence strictly greater than `after_seq`
    /// arrives for `bot`, or the budget elapses.
    pub async fn await_frame_after(
        &self,
        bot: &str,
        after_seq: u64,
        budget: Duration,
    ) -> Option<ObservationFrame> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            // Register with the notifier before checking the map; a publish
            // landing between the check and the await would otherwise be a
            // lost wakeup (notify_waiters stores no permit).
            let notified = self.frame_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let frames = self.frames.read().await;
                if let Some(frame) = frames.get(bot) {
                    if frame.seq() > after_seq {
                        return Some(frame.clone());
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    async fn run(self: &Arc<Self>) {
        let mut out_rx = match self.out_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Bridge connection task already consumed its outbound queue");
                return;
            }
        };
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.connect_once(&mut out_rx).await {
                Ok(reached_streaming) => {
                    if reached_streaming {
                        attempts = 0;
                    }
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!("Sensor hub stream ended, reconnecting");
                }
                Err(e) => {
                    warn!("Sensor hub connection failed: {e}");
                }
            }
            *self.state.write().await = ConnState::Disconnected;
            attempts += 1;
            if attempts >= self.config.max_reconnect_attempts {
                warn!(
                    "Sensor hub unreachable after {} attempts, giving up",
                    attempts
                );
                let _ = self.events_tx.send(BridgeEvent::ReconnectFailed);
                break;
            }
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            // Linear backoff: delay grows with the attempt count.
            let delay = Duration::from_millis(self.config.reconnect_delay_ms * attempts as u64);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        *self.state.write().await = ConnState::Disconnected;
    }

    /// One connection attempt: dial, authenticate, re-register, stream.
    /// Returns whether the connection reached the streaming state.
    async fn connect_once(
        self: &Arc<Self>,
        out_rx: &mut mpsc::Receiver<WireMessage>,
    ) -> Result<bool> {
        *self.state.write().await = ConnState::Connecting;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr).await?;
        info!("Connected to sensor hub at {addr}");
        *self.state.write().await = ConnState::AwaitingAuth;

        let mut framed = Framed::new(stream, frame_codec());
        let mut reached_streaming = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(reached_streaming);
                }
                outbound = out_rx.recv() => {
                    let Some(msg) = outbound else { return Ok(reached_streaming) };
                    framed.send(encode_message(&msg)?).await?;
                }
                inbound = framed.next() => {
                    let Some(payload) = inbound else { return Ok(reached_streaming) };
                    let payload = payload?;
                    let msg = match decode_message(&payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            // Parse errors log and continue; the stream itself is fine.
                            warn!("Undecodable hub message ({} bytes): {e}", payload.len());
                            continue;
                        }
                    };
                    if self.handle_inbound(msg, &mut framed, &mut reached_streaming).await? {
                        return Ok(reached_streaming);
                    }
                }
            }
        }
    }

    /// Returns true when the connection should close cleanly.
    async fn handle_inbound(
        self: &Arc<Self>,
        msg: WireMessage,
        framed: &mut Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        reached_streaming: &mut bool,
    ) -> Result<bool> {
        match msg {
            WireMessage::AuthRequired => {
                framed
                    .send(encode_message(&WireMessage::Auth {
                        token: self.config.token.clone(),
                    })?)
                    .await?;
            }
            WireMessage::AuthSuccess => {
                *self.state.write().await = ConnState::Authenticated;
                let bots: Vec<String> = self.registered.read().await.iter().cloned().collect();
                for bot in bots {
                    framed
                        .send(encode_message(&WireMessage::RegisterBot { bot })?)
                        .await?;
                }
            }
            WireMessage::RegistrationSuccess { bot } => {
                debug!("Hub confirmed registration for {bot}");
                let mut state = self.state.write().await;
                if *state == ConnState::Authenticated {
                    *state = ConnState::Registered;
                }
            }
            WireMessage::SensorUpdate(update) => {
                if !*reached_streaming {
                    *reached_streaming = true;
                    *self.state.write().await = ConnState::Streaming;
                }
                self.publish_frame(update).await;
            }
            WireMessage::ServerTick(tick) => {
                let _ = self.events_tx.send(BridgeEvent::Tick(tick));
            }
            WireMessage::Checkpoint { tick } => {
                let _ = self.events_tx.send(BridgeEvent::Checkpoint { tick });
            }
            WireMessage::Evolution { tick } => {
                let _ = self.events_tx.send(BridgeEvent::Evolution { tick });
            }
            WireMessage::SpawnConfirm(confirm) => {
                let _ = self.events_tx.send(BridgeEvent::SpawnConfirm(confirm));
            }
            WireMessage::AgentDeath(death) => {
                let _ = self.events_tx.send(BridgeEvent::AgentDeath(death));
            }
            WireMessage::ServerShutdown => {
                info!("Sensor hub announced server shutdown");
                let _ = self.events_tx.send(BridgeEvent::ServerShutdown);
                return Ok(true);
            }
            WireMessage::Error { message } => {
                warn!("Hub error: {message}");
            }
            other => {
                // Core-originated kinds echoed back; protocol noise, not fatal.
                debug!("Ignoring unexpected hub message: {other:?}");
            }
        }
        Ok(false)
    }

    async fn publish_frame(&self, update: SensorUpdate) {
        let bot = update.bot.clone();
        let mut frames = self.frames.write().await;
        if let Some(existing) = frames.get(&bot) {
            // Per-agent sequence is monotonic; keep-last on reorder.
            if update.ts <= existing.seq() {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        frames.insert(
            bot,
            ObservationFrame {
                update,
                received_at_ms: now_ts_millis(),
            },
        );
        drop(frames);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.frame_notify.notify_waiters();
    }
    #[cfg(test)]
    pub(crate) async fn inject_frame(&self, update: SensorUpdate) {
        self.publish_frame(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::protocol::Location;
    use super::*;

    fn test_bridge() -> Arc<SensorBridge> {
        SensorBridge::new(SensorConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            token: "t".to_string(),
            stale_window_ms: 5000,
            reconnect_delay_ms: 10,
            max_reconnect_attempts: 1,
        })
    }

    fn update(bot: &str, ts: u64) -> SensorUpdate {
        SensorUpdate {
            bot: bot.to_string(),
            ts,
            location: Location::default(),
            health: 20.0,
            food: 20.0,
            saturation: 5.0,
            oxygen: 20.0,
            xp: 0.0,
            armor: 0.0,
            blocks: vec![],
            entities: vec![],
            items: vec![],
            weather: Default::default(),
            time: 0,
            chunks: 0,
            mob_ai: vec![],
        }
    }

    #[tokio::test]
    async fn latest_returns_none_for_unknown_bot() {
        let bridge = test_bridge();
        assert!(matches!(bridge.latest("ghost").await, FrameQuery::None));
    }

    #[tokio::test]
    async fn out_of_order_frames_are_dropped() {
        let bridge = test_bridge();
        bridge.publish_frame(update("a", 5)).await;
        bridge.publish_frame(update("a", 3)).await;
        match bridge.latest("a").await {
            FrameQuery::Fresh(frame) => assert_eq!(frame.seq(), 5),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(bridge.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn await_frame_after_times_out_without_newer_frame() {
        let bridge = test_bridge();
        bridge.publish_frame(update("a", 5)).await;
        let got = bridge
            .await_frame_after("a", 5, Duration::from_millis(20))
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn await_frame_after_wakes_on_publish() {
        let bridge = test_bridge();
        bridge.publish_frame(update("a", 5)).await;
        let waiter = bridge.clone();
        let handle = tokio::spawn(async move {
            waiter
                .await_frame_after("a", 5, Duration::from_secs(2))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge.publish_frame(update("a", 6)).await;
        let got = handle.await.expect("join");
        assert_eq!(got.expect("frame").seq(), 6);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let bridge = test_bridge();
        bridge.disconnect().await;
        bridge.disconnect().await;
        assert_eq!(bridge.state().await, ConnState::Disconnected);
    }
}
