// =============================================================================
// Chart Session — the single task that owns the chart pipeline
// =============================================================================
//
// Everything that touches chart state funnels through this loop:
//
//   * commands from the API (switch pair, indicator set, price queries,
//     snapshot),
//   * historical fetch results, tagged with the key and request generation
//     they were issued for,
//   * events from the one live subscription currently held,
//   * the reconnect timer after the live stream drops.
//
// Switch sequence: the old subscription is cancelled before anything else,
// the pipeline is cleared, the new stream is opened (its early events are
// buffered by the pipeline) and the historical fetch is spawned.
//
// After the stream drops, the same pair is re-subscribed and re-fetched but
// the chart and price history stay up until the new snapshot lands.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::indicators::IndicatorSettings;
use crate::market_data::{HistoricalSource, KlineSubscription, LiveSource, LiveTick, StreamEvent};
use crate::pipeline::{ChartPipeline, SnapshotOutcome, TickOutcome};
use crate::render::RenderSink;
use crate::types::{Candle, CandleKey, PriceSample, RenderEvent, StreamStatus};

/// Queue depth for API commands.
const COMMAND_CAPACITY: usize = 64;

// =============================================================================
// Shared status
// =============================================================================

/// What the session is doing right now, readable without a round trip.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub key: CandleKey,
    pub stream: StreamStatus,
    pub bars: usize,
    /// Open time of the most recent bar.
    pub last_bar_time: Option<i64>,
    pub subscription_id: Option<Uuid>,
    /// Wall-clock seconds of the last accepted live tick.
    pub last_tick_at: Option<i64>,
    /// Enough history for the enabled indicators to draw.
    pub indicators_ready: bool,
}

impl SessionStatus {
    pub fn new(key: CandleKey) -> Self {
        Self {
            key,
            stream: StreamStatus::Connecting,
            bars: 0,
            last_bar_time: None,
            subscription_id: None,
            last_tick_at: None,
            indicators_ready: false,
        }
    }
}

/// Full chart state for a client that has just connected.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub key: CandleKey,
    pub stream: StreamStatus,
    pub events: Vec<RenderEvent>,
}

// =============================================================================
// Commands and handle
// =============================================================================

#[derive(Debug)]
pub enum SessionCommand {
    Switch {
        key: CandleKey,
        reply: oneshot::Sender<()>,
    },
    SetIndicators {
        settings: IndicatorSettings,
        reply: oneshot::Sender<()>,
    },
    CurrentPrice {
        reply: oneshot::Sender<Option<PriceSample>>,
    },
    PriceBefore {
        now: i64,
        lag: i64,
        reply: oneshot::Sender<Option<PriceSample>>,
    },
    Snapshot {
        reply: oneshot::Sender<ChartSnapshot>,
    },
}

/// Cloneable front door to a running `ChartSession`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("chart session is not running"))?;
        rx.await.map_err(|_| anyhow!("chart session dropped the request"))
    }

    /// Watch a different pair. Returns once the switch has started; the
    /// snapshot follows asynchronously.
    pub async fn switch(&self, key: CandleKey) -> Result<()> {
        self.request(|reply| SessionCommand::Switch { key, reply }).await
    }

    /// Replace the indicator set; enabled series are redrawn from the
    /// candles already loaded.
    pub async fn set_indicators(&self, settings: IndicatorSettings) -> Result<()> {
        self.request(|reply| SessionCommand::SetIndicators { settings, reply }).await
    }

    pub async fn current_price(&self) -> Result<Option<PriceSample>> {
        self.request(|reply| SessionCommand::CurrentPrice { reply }).await
    }

    /// Price `lag` seconds ago, measured from the wall clock.
    pub async fn price_ago(&self, lag: i64) -> Result<Option<PriceSample>> {
        let now = Utc::now().timestamp();
        self.request(|reply| SessionCommand::PriceBefore { now, lag, reply }).await
    }

    pub async fn snapshot(&self) -> Result<ChartSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub settings: IndicatorSettings,
    pub history_limit: u32,
    pub price_retention_secs: i64,
    /// `None` leaves the feed disconnected after the stream drops.
    pub reconnect_delay: Option<Duration>,
}

struct SnapshotResult {
    generation: u64,
    key: CandleKey,
    result: Result<Vec<Candle>>,
}

enum Wake {
    Command(Option<SessionCommand>),
    Snapshot(SnapshotResult),
    Stream(Option<StreamEvent>),
    Reconnect,
}

pub struct ChartSession<H, L, S> {
    pipeline: ChartPipeline,
    historical: H,
    live: L,
    sink: S,
    history_limit: u32,
    reconnect_delay: Option<Duration>,
    status: Arc<RwLock<SessionStatus>>,
    commands: mpsc::Receiver<SessionCommand>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotResult>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotResult>,
    subscription: Option<KlineSubscription>,
    generation: u64,
    reconnect_at: Option<Instant>,
}

impl<H, L, S> ChartSession<H, L, S>
where
    H: HistoricalSource,
    L: LiveSource,
    S: RenderSink + Send + 'static,
{
    /// Build a session watching `key`. Nothing is fetched until `run`.
    pub fn new(
        key: CandleKey,
        options: SessionOptions,
        historical: H,
        live: L,
        sink: S,
        status: Arc<RwLock<SessionStatus>>,
    ) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        *status.write() = SessionStatus::new(key.clone());

        let session = Self {
            pipeline: ChartPipeline::new(key, options.settings, options.price_retention_secs),
            historical,
            live,
            sink,
            history_limit: options.history_limit,
            reconnect_delay: options.reconnect_delay,
            status,
            commands,
            snapshot_tx,
            snapshot_rx,
            subscription: None,
            generation: 0,
            reconnect_at: None,
        };
        (session, SessionHandle { tx })
    }

    /// Drive the session until every `SessionHandle` is dropped.
    pub async fn run(mut self) {
        let key = self.pipeline.key().clone();
        info!(key = %key, "chart session started");
        self.start(key);

        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some(res) = self.snapshot_rx.recv() => Wake::Snapshot(res),
                event = next_event(self.subscription.as_mut()) => Wake::Stream(event),
                _ = reconnect_timer(self.reconnect_at) => Wake::Reconnect,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Snapshot(res) => self.on_snapshot(res),
                Wake::Stream(Some(StreamEvent::Tick(tick))) => self.on_tick(tick),
                Wake::Stream(Some(StreamEvent::Closed { reason })) => self.on_closed(reason),
                Wake::Stream(None) => self.on_closed(Some("stream producer ended".to_string())),
                Wake::Reconnect => self.resubscribe(),
            }
        }

        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
        info!("chart session stopped");
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Switch { key, reply } => {
                self.switch(key);
                let _ = reply.send(());
            }
            SessionCommand::SetIndicators { settings, reply } => {
                if self.pipeline.set_indicators(settings, &mut self.sink) {
                    self.publish_chart();
                }
                let _ = reply.send(());
            }
            SessionCommand::CurrentPrice { reply } => {
                let _ = reply.send(self.pipeline.current_price());
            }
            SessionCommand::PriceBefore { now, lag, reply } => {
                let _ = reply.send(self.pipeline.price_before(now, lag));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(ChartSnapshot {
                    key: self.pipeline.key().clone(),
                    stream: self.status.read().stream,
                    events: self.pipeline.snapshot(),
                });
            }
        }
    }

    /// Tear down the current pair and start over on `key`.
    fn switch(&mut self, key: CandleKey) {
        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
        self.pipeline.switch(key.clone(), &mut self.sink);
        *self.status.write() = SessionStatus::new(key.clone());
        self.start(key);
    }

    /// Same pair, new stream: the chart stays up while the snapshot is
    /// re-fetched.
    fn resubscribe(&mut self) {
        let key = self.pipeline.key().clone();
        info!(key = %key, "re-subscribing after stream loss");
        self.pipeline.resync();
        self.start(key);
    }

    /// Open the live stream, then request the snapshot.
    fn start(&mut self, key: CandleKey) {
        self.reconnect_at = None;
        self.generation += 1;

        let subscription = self.live.subscribe(&key);
        {
            let mut status = self.status.write();
            status.key = key.clone();
            status.stream = StreamStatus::Connecting;
            status.subscription_id = Some(subscription.id());
        }
        debug!(key = %key, id = %subscription.id(), "live subscription opened");
        self.subscription = Some(subscription);

        let generation = self.generation;
        let historical = self.historical.clone();
        let limit = self.history_limit;
        let tx = self.snapshot_tx.clone();
        tokio::spawn(async move {
            let result = historical.fetch(&key, limit).await;
            // Receiver lives as long as the session.
            let _ = tx.send(SnapshotResult { generation, key, result });
        });
    }

    fn on_snapshot(&mut self, res: SnapshotResult) {
        if res.generation != self.generation {
            debug!(key = %res.key, generation = res.generation, "discarding superseded snapshot");
            return;
        }
        let outcome = self.pipeline.on_snapshot(&res.key, res.result, &mut self.sink);
        if let SnapshotOutcome::Loaded { .. } = outcome {
            self.publish_chart();
        }
    }

    fn on_tick(&mut self, tick: LiveTick) {
        let outcome = self.pipeline.on_tick(tick, &mut self.sink);
        {
            let mut status = self.status.write();
            if status.stream != StreamStatus::Live {
                info!(key = %status.key, "live stream delivering");
                status.stream = StreamStatus::Live;
            }
            if let TickOutcome::Applied(applied) = outcome {
                if applied.is_accepted() {
                    status.last_tick_at = Some(Utc::now().timestamp());
                } else {
                    debug!(key = %status.key, time = tick.candle.time, "stale live update dropped");
                }
            }
        }
        self.publish_chart();
    }

    fn on_closed(&mut self, reason: Option<String>) {
        self.subscription = None;
        let key = self.pipeline.key().clone();
        {
            let mut status = self.status.write();
            status.stream = StreamStatus::Disconnected;
            status.subscription_id = None;
        }
        match self.reconnect_delay {
            Some(delay) => {
                warn!(key = %key, reason = ?reason, delay_secs = delay.as_secs(), "live stream lost, will re-subscribe");
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                warn!(key = %key, reason = ?reason, "live stream lost, reconnect disabled");
            }
        }
    }

    fn publish_chart(&self) {
        let mut status = self.status.write();
        status.bars = self.pipeline.candles().len();
        status.last_bar_time = self.pipeline.candles().last().map(|c| c.time);
        status.indicators_ready = self.pipeline.indicators().is_active();
    }
}

async fn next_event(subscription: Option<&mut KlineSubscription>) -> Option<StreamEvent> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn reconnect_timer(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;

    use super::*;
    use crate::types::SeriesId;

    /// Serves canned bars per key; a key listed in `gates` waits until its
    /// gate is released.
    #[derive(Clone, Default)]
    struct FakeHistory {
        bars: Arc<HashMap<CandleKey, Vec<Candle>>>,
        gates: Arc<parking_lot::Mutex<HashMap<CandleKey, oneshot::Receiver<()>>>>,
    }

    impl HistoricalSource for FakeHistory {
        fn fetch(&self, key: &CandleKey, _limit: u32) -> impl Future<Output = Result<Vec<Candle>>> + Send {
            let bars = self.bars.get(key).cloned();
            let gate = self.gates.lock().remove(key);
            let key = key.clone();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                bars.ok_or_else(|| anyhow!("no bars for {key}"))
            }
        }
    }

    /// Hands out channel-backed subscriptions and keeps the senders.
    #[derive(Clone, Default)]
    struct FakeLive {
        senders: Arc<parking_lot::Mutex<Vec<(CandleKey, mpsc::Sender<StreamEvent>)>>>,
    }

    impl FakeLive {
        fn sender(&self, index: usize) -> (CandleKey, mpsc::Sender<StreamEvent>) {
            self.senders.lock()[index].clone()
        }

        fn count(&self) -> usize {
            self.senders.lock().len()
        }
    }

    impl LiveSource for FakeLive {
        fn subscribe(&self, key: &CandleKey) -> KlineSubscription {
            let (tx, sub) = KlineSubscription::channel(key.clone(), 16);
            self.senders.lock().push((key.clone(), tx));
            sub
        }
    }

    fn key(symbol: &str) -> CandleKey {
        CandleKey::new(symbol, "1m").unwrap()
    }

    fn bars(n: i64, base: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let c = base + i as f64;
                Candle::new(i * 60, c, c + 1.0, c - 1.0, c, 5.0)
            })
            .collect()
    }

    fn options(reconnect: Option<Duration>) -> SessionOptions {
        SessionOptions {
            settings: IndicatorSettings { ema: Some(3), ..Default::default() },
            history_limit: 100,
            price_retention_secs: 120,
            reconnect_delay: reconnect,
        }
    }

    fn spawn_session(
        history: FakeHistory,
        live: FakeLive,
        reconnect: Option<Duration>,
    ) -> (SessionHandle, Arc<RwLock<SessionStatus>>) {
        let status = Arc::new(RwLock::new(SessionStatus::new(key("BTCUSDT"))));
        let (session, handle) = ChartSession::new(
            key("BTCUSDT"),
            options(reconnect),
            history,
            live,
            Vec::<RenderEvent>::new(),
            status.clone(),
        );
        tokio::spawn(session.run());
        (handle, status)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn candle_count(snapshot: &ChartSnapshot) -> usize {
        snapshot
            .events
            .iter()
            .find_map(|ev| match ev {
                RenderEvent::SetSeries { series: SeriesId::Candles, points } => Some(points.len()),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn history_with(entries: Vec<(CandleKey, Vec<Candle>)>) -> FakeHistory {
        FakeHistory {
            bars: Arc::new(entries.into_iter().collect()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn loads_snapshot_then_applies_live_ticks() {
        let history = history_with(vec![(key("BTCUSDT"), bars(10, 100.0))]);
        let live = FakeLive::default();
        let (handle, status) = spawn_session(history, live.clone(), None);

        wait_for(|| status.read().bars == 10).await;
        assert_eq!(live.count(), 1);

        let (_, tx) = live.sender(0);
        let candle = Candle::new(600, 1.0, 2.0, 0.5, 1.5, 3.0);
        tx.send(StreamEvent::Tick(LiveTick { candle, event_time: 610 }))
            .await
            .unwrap();
        wait_for(|| status.read().bars == 11).await;
        assert_eq!(status.read().stream, StreamStatus::Live);

        let price = handle.current_price().await.unwrap().unwrap();
        assert_eq!(price.price, 1.5);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(candle_count(&snapshot), 11);
        assert_eq!(snapshot.key, key("BTCUSDT"));
    }

    #[tokio::test]
    async fn switch_cancels_old_stream_and_ignores_its_snapshot() {
        let (release_btc, gate) = oneshot::channel();
        let history = history_with(vec![(key("BTCUSDT"), bars(10, 100.0)), (key("ETHUSDT"), bars(4, 10.0))]);
        history.gates.lock().insert(key("BTCUSDT"), gate);
        let live = FakeLive::default();
        let (handle, status) = spawn_session(history, live.clone(), None);

        wait_for(|| live.count() == 1).await;
        handle.switch(key("ETHUSDT")).await.unwrap();
        assert_eq!(live.count(), 2);

        // Old stream is gone.
        let (old_key, old_tx) = live.sender(0);
        assert_eq!(old_key, key("BTCUSDT"));
        assert!(old_tx.is_closed());

        wait_for(|| status.read().bars == 4).await;

        // The BTC fetch completes late and must not replace ETH's chart.
        let _ = release_btc.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.key, key("ETHUSDT"));
        assert_eq!(candle_count(&snapshot), 4);
        assert_eq!(status.read().key, key("ETHUSDT"));
    }

    #[tokio::test]
    async fn failed_fetch_leaves_empty_chart_but_live_continues() {
        let live = FakeLive::default();
        let (handle, status) = spawn_session(FakeHistory::default(), live.clone(), None);
        wait_for(|| live.count() == 1).await;

        let (_, tx) = live.sender(0);
        let candle = Candle::new(60, 1.0, 1.0, 1.0, 1.0, 1.0);
        tx.send(StreamEvent::Tick(LiveTick { candle, event_time: 60 }))
            .await
            .unwrap();
        wait_for(|| status.read().bars == 1).await;
        assert!(handle.price_ago(60).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_stream_reconnects_after_delay() {
        let history = history_with(vec![(key("BTCUSDT"), bars(5, 1.0))]);
        let live = FakeLive::default();
        let (handle, status) = spawn_session(history.clone(), live.clone(), Some(Duration::from_millis(20)));

        wait_for(|| status.read().bars == 5).await;
        let (release, gate) = oneshot::channel();
        history.gates.lock().insert(key("BTCUSDT"), gate);
        let (_, tx) = live.sender(0);
        let candle = Candle::new(300, 9.0, 9.5, 8.5, 9.25, 1.0);
        tx.send(StreamEvent::Tick(LiveTick { candle, event_time: 330 }))
            .await
            .unwrap();
        wait_for(|| status.read().bars == 6).await;
        tx.send(StreamEvent::Closed { reason: Some("reset".to_string()) })
            .await
            .unwrap();

        wait_for(|| live.count() == 2).await;
        assert_eq!(status.read().stream, StreamStatus::Connecting);
        // The chart is not blanked while the snapshot is re-fetched.
        assert_eq!(status.read().bars, 6);
        assert!(candle_count(&handle.snapshot().await.unwrap()) >= 5);

        // The fresh snapshot has no bar 300, but its tick sample survives.
        let _ = release.send(());
        wait_for(|| status.read().bars == 5).await;
        let sample = handle.price_ago(0).await.unwrap().unwrap();
        assert_eq!((sample.time, sample.price), (330, 9.25));
    }

    #[tokio::test]
    async fn enabling_rsi_after_load_redraws_from_loaded_candles() {
        let history = history_with(vec![(key("BTCUSDT"), bars(20, 100.0))]);
        let live = FakeLive::default();
        let (handle, status) = spawn_session(history, live, None);
        wait_for(|| status.read().bars == 20).await;
        assert!(status.read().indicators_ready);

        let settings = IndicatorSettings { rsi: Some(5), ..Default::default() };
        handle.set_indicators(settings).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        let rsi = snapshot.events.iter().find_map(|ev| match ev {
            RenderEvent::SetSeries { series: SeriesId::Rsi, points } => Some(points.len()),
            _ => None,
        });
        assert_eq!(rsi, Some(15));
        assert!(!snapshot
            .events
            .iter()
            .any(|ev| matches!(ev, RenderEvent::SetSeries { series: SeriesId::Ema, .. })));
        assert!(status.read().indicators_ready);
    }

    #[tokio::test]
    async fn closed_stream_stays_down_without_reconnect() {
        let history = history_with(vec![(key("BTCUSDT"), bars(5, 1.0))]);
        let live = FakeLive::default();
        let (_handle, status) = spawn_session(history, live.clone(), None);

        wait_for(|| status.read().bars == 5).await;
        let (_, tx) = live.sender(0);
        tx.send(StreamEvent::Closed { reason: None }).await.unwrap();
        wait_for(|| status.read().stream == StreamStatus::Disconnected).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(live.count(), 1);
    }

    #[tokio::test]
    async fn handle_errors_once_session_is_gone() {
        let status = Arc::new(RwLock::new(SessionStatus::new(key("BTCUSDT"))));
        let (session, handle) = ChartSession::new(
            key("BTCUSDT"),
            options(None),
            FakeHistory::default(),
            FakeLive::default(),
            Vec::<RenderEvent>::new(),
            status,
        );
        drop(session);
        assert!(handle.current_price().await.is_err());
    }
}
