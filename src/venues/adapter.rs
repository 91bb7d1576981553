//! Venue adapter contract and the shared stream worker.
//!
//! Every venue exposes the same capability set behind [`VenueAdapter`]; the
//! venue-specific wire protocol (endpoints, frames, symbol bijection) lives
//! behind [`VenueWire`]. One multiplexed websocket per venue carries all
//! subscribed instruments:
//! - a command channel feeds subscribe/unsubscribe/shutdown into the worker
//! - the worker re-subscribes its full desired set on every fresh session
//! - reconnects back off geometrically from `reconnect_delay`, capped at
//!   six times the base delay

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::{FailureKind, FailureNotifier};
use crate::models::{CatalogEntry, Instrument, Tick, Venue, VenueStatus};

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;
pub use tokio_tungstenite::tungstenite::Message;

/// Receives every parsed tick for a subscribed instrument exactly once.
pub trait TickSink: Send + Sync {
    fn deliver(&self, tick: Tick);
}

/// Uniform per-venue capability set.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Idempotent. Spawns the stream worker; no socket is opened until the
    /// first subscription arrives.
    async fn start(&self) -> Result<()>;

    /// Terminal. Closes the socket and clears connection state; no tick is
    /// delivered after this returns, in-flight frames included.
    async fn stop(&self);

    /// Venue instrument catalog, filtered to tradable entries. Failures are
    /// surfaced through the failure notifier; the returned list degrades to
    /// the configured fallback instruments (or nothing) instead of erroring.
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>>;

    async fn subscribe(&self, instrument: Instrument, sink: Arc<dyn TickSink>) -> Result<()>;

    async fn unsubscribe(&self, instrument: &Instrument);

    fn status(&self) -> VenueStatus;
}

/// Ticker payload parsed from a venue frame, before normalization.
#[derive(Debug, Clone)]
pub struct WireTick {
    pub instrument: Instrument,
    pub price: f64,
    pub volume: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

/// Venue-specific wire protocol. Everything behind this trait is private to
/// one venue module and is NOT part of the cross-cutting contract.
#[async_trait]
pub trait VenueWire: Send + Sync + 'static {
    fn venue(&self) -> Venue;

    /// Canonical instrument -> venue wire symbol.
    fn wire_symbol(&self, instrument: &Instrument) -> String;

    /// Venue wire symbol -> canonical instrument; `None` when unmapped.
    fn canonical(&self, symbol: &str) -> Option<Instrument>;

    /// Open a fresh websocket session. Venues with a pre-connect handshake
    /// (KuCoin's bullet token) perform it here.
    async fn connect(&self) -> Result<WsStream>;

    fn subscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message>;
    fn unsubscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message>;

    /// Client keepalive period; `None` when the server drives pings.
    fn ping_interval(&self) -> Option<Duration> {
        None
    }

    fn ping_frame(&self) -> Message {
        Message::Ping(Vec::new())
    }

    /// Parse one text frame. `Ok(vec![])` for control/ack frames; `Err` for
    /// a ticker frame that could not be parsed.
    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>>;

    /// Full instrument catalog over the venue's HTTP API.
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>>;
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub ws_timeout: Duration,
    pub reconnect_delay: Duration,
    pub enable_fallbacks: bool,
    pub fallback_instruments: Vec<Instrument>,
}

enum Command {
    Subscribe(Instrument, Arc<dyn TickSink>),
    Unsubscribe(Instrument),
    Shutdown,
}

#[derive(Default)]
struct AdapterState {
    connected: AtomicBool,
    connection_count: AtomicUsize,
    // Cleared by stop(); gates delivery so an in-flight frame cannot reach
    // the sink after termination.
    accepting: AtomicBool,
    subscribed: RwLock<HashSet<Instrument>>,
    last_error: RwLock<Option<String>>,
    dropped_invalid: AtomicU64,
}

impl AdapterState {
    fn record_error(&self, msg: impl Into<String>) {
        *self.last_error.write() = Some(msg.into());
    }
}

/// [`VenueAdapter`] implementation shared by all venues, generic over the
/// wire protocol.
pub struct WsAdapter<W: VenueWire> {
    wire: Arc<W>,
    settings: AdapterSettings,
    notifier: Arc<dyn FailureNotifier>,
    state: Arc<AdapterState>,
    cmd_tx: Mutex<Option<mpsc::Sender<Command>>>,
}

impl<W: VenueWire> WsAdapter<W> {
    pub fn new(wire: W, settings: AdapterSettings, notifier: Arc<dyn FailureNotifier>) -> Self {
        Self {
            wire: Arc::new(wire),
            settings,
            notifier,
            state: Arc::new(AdapterState::default()),
            cmd_tx: Mutex::new(None),
        }
    }

    fn fallback_catalog(&self) -> Vec<CatalogEntry> {
        self.settings
            .fallback_instruments
            .iter()
            .map(|i| CatalogEntry::new(i.base(), i.quote()))
            .collect()
    }
}

#[async_trait]
impl<W: VenueWire> VenueAdapter for WsAdapter<W> {
    fn venue(&self) -> Venue {
        self.wire.venue()
    }

    async fn start(&self) -> Result<()> {
        let mut guard = self.cmd_tx.lock();
        if guard.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(64);
        *guard = Some(tx);
        self.state.accepting.store(true, Ordering::Release);

        let worker = StreamWorker {
            wire: self.wire.clone(),
            settings: self.settings.clone(),
            notifier: self.notifier.clone(),
            state: self.state.clone(),
            sinks: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));

        info!(venue = %self.wire.venue(), "adapter initialized");
        Ok(())
    }

    async fn stop(&self) {
        self.state.accepting.store(false, Ordering::Release);
        let tx = self.cmd_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(Command::Shutdown).await;
        }
        self.state.connected.store(false, Ordering::Release);
        self.state.connection_count.store(0, Ordering::Release);
        self.state.subscribed.write().clear();
        info!(venue = %self.wire.venue(), "adapter terminated");
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let fetched: Result<Vec<CatalogEntry>> = match timeout(self.settings.ws_timeout, self.wire.fetch_catalog()).await {
            Ok(Ok(entries)) => return Ok(entries),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow::anyhow!(
                "catalog fetch timed out after {:?}",
                self.settings.ws_timeout
            )),
        };

        let err = fetched.unwrap_err();
        self.state.record_error(err.to_string());
        self.notifier.notify(
            self.wire.venue(),
            FailureKind::CatalogFetchFailed,
            &err.to_string(),
        );

        if self.settings.enable_fallbacks && !self.settings.fallback_instruments.is_empty() {
            warn!(
                venue = %self.wire.venue(),
                fallback = self.settings.fallback_instruments.len(),
                "catalog fetch failed, using fallback instruments"
            );
            Ok(self.fallback_catalog())
        } else {
            warn!(venue = %self.wire.venue(), "catalog fetch failed, returning empty catalog");
            Ok(Vec::new())
        }
    }

    async fn subscribe(&self, instrument: Instrument, sink: Arc<dyn TickSink>) -> Result<()> {
        let tx = match self.cmd_tx.lock().clone() {
            Some(tx) => tx,
            None => bail!("{} adapter not started", self.wire.venue()),
        };

        self.state.subscribed.write().insert(instrument.clone());
        tx.send(Command::Subscribe(instrument, sink))
            .await
            .map_err(|_| anyhow::anyhow!("{} stream worker gone", self.wire.venue()))
    }

    async fn unsubscribe(&self, instrument: &Instrument) {
        self.state.subscribed.write().remove(instrument);
        let tx = self.cmd_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Command::Unsubscribe(instrument.clone())).await;
        }
    }

    fn status(&self) -> VenueStatus {
        let mut subscribed: Vec<Instrument> =
            self.state.subscribed.read().iter().cloned().collect();
        subscribed.sort();

        VenueStatus {
            connected: self.state.connected.load(Ordering::Acquire),
            connection_count: self.state.connection_count.load(Ordering::Acquire),
            subscribed,
            last_error: self.state.last_error.read().clone(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    /// `None`: server closed gracefully. `Some`: error description.
    Closed(Option<String>),
}

struct StreamWorker<W: VenueWire> {
    wire: Arc<W>,
    settings: AdapterSettings,
    notifier: Arc<dyn FailureNotifier>,
    state: Arc<AdapterState>,
    sinks: HashMap<Instrument, Arc<dyn TickSink>>,
}

impl<W: VenueWire> StreamWorker<W> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let venue = self.wire.venue();
        let base_delay = self.settings.reconnect_delay;
        let max_delay = base_delay * 6;
        let mut delay = base_delay;

        'outer: loop {
            // No subscriptions, no socket.
            while self.sinks.is_empty() {
                match cmd_rx.recv().await {
                    Some(Command::Subscribe(i, sink)) => {
                        self.sinks.insert(i, sink);
                    }
                    Some(Command::Unsubscribe(i)) => {
                        self.sinks.remove(&i);
                    }
                    Some(Command::Shutdown) | None => break 'outer,
                }
            }

            match timeout(self.settings.ws_timeout, self.wire.connect()).await {
                Ok(Ok(stream)) => {
                    info!(venue = %venue, subscriptions = self.sinks.len(), "🔌 stream connected");
                    self.state.connected.store(true, Ordering::Release);
                    self.state.connection_count.store(1, Ordering::Release);
                    delay = base_delay;

                    let end = self.stream_session(stream, &mut cmd_rx).await;

                    self.state.connected.store(false, Ordering::Release);
                    self.state.connection_count.store(0, Ordering::Release);

                    match end {
                        SessionEnd::Shutdown => break 'outer,
                        SessionEnd::Closed(None) => {
                            debug!(venue = %venue, "stream closed by server");
                        }
                        SessionEnd::Closed(Some(msg)) => {
                            self.state.record_error(&msg);
                            self.notifier.notify(
                                venue,
                                FailureKind::StreamClosedUnexpectedly,
                                &msg,
                            );
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.state.record_error(e.to_string());
                    self.notifier
                        .notify(venue, FailureKind::StreamOpenFailed, &e.to_string());
                }
                Err(_) => {
                    let msg = format!("connect timed out after {:?}", self.settings.ws_timeout);
                    self.state.record_error(&msg);
                    self.notifier.notify(venue, FailureKind::StreamOpenFailed, &msg);
                }
            }

            warn!(venue = %venue, delay = ?delay, "stream down, reconnecting");
            if self.idle(&mut cmd_rx, delay).await {
                break 'outer;
            }
            delay = (delay * 2).min(max_delay);
        }

        self.state.connected.store(false, Ordering::Release);
        self.state.connection_count.store(0, Ordering::Release);
        debug!(
            venue = %venue,
            dropped_invalid = self.state.dropped_invalid.load(Ordering::Relaxed),
            "stream worker exited"
        );
    }

    /// Sleep out the reconnect delay while still absorbing commands.
    /// Returns true on shutdown.
    async fn idle(&mut self, cmd_rx: &mut mpsc::Receiver<Command>, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe(i, sink)) => {
                        self.sinks.insert(i, sink);
                    }
                    Some(Command::Unsubscribe(i)) => {
                        self.sinks.remove(&i);
                    }
                    Some(Command::Shutdown) | None => return true,
                },
            }
        }
    }

    async fn stream_session(
        &mut self,
        stream: WsStream,
        cmd_rx: &mut mpsc::Receiver<Command>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // Fresh session: subscribe the whole desired set.
        let desired: Vec<Instrument> = self.sinks.keys().cloned().collect();
        for frame in self.wire.subscribe_frames(&desired) {
            if let Err(e) = write.send(frame).await {
                return SessionEnd::Closed(Some(format!("subscribe send failed: {e}")));
            }
        }

        let ping_period = self.wire.ping_interval();
        let mut ping = {
            let period = ping_period.unwrap_or(Duration::from_secs(3600));
            let mut t = interval_at(Instant::now() + period, period);
            t.set_missed_tick_behavior(MissedTickBehavior::Skip);
            t
        };

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if ping_period.is_some() {
                        let _ = write.send(self.wire.ping_frame()).await;
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Subscribe(i, sink)) => {
                        if self.sinks.insert(i.clone(), sink).is_none() {
                            for frame in self.wire.subscribe_frames(&[i]) {
                                let _ = write.send(frame).await;
                            }
                        }
                    }
                    Some(Command::Unsubscribe(i)) => {
                        if self.sinks.remove(&i).is_some() {
                            for frame in self.wire.unsubscribe_frames(&[i]) {
                                let _ = write.send(frame).await;
                            }
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return SessionEnd::Closed(Some("stream ended".to_string()));
                    };
                    match msg {
                        Ok(Message::Text(text)) => self.handle_text(&text),
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(venue = %self.wire.venue(), ?frame, "close frame");
                            return SessionEnd::Closed(None);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return SessionEnd::Closed(Some(format!("stream error: {e}")));
                        }
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let ticks = match self.wire.parse_text(text) {
            Ok(ticks) => ticks,
            Err(e) => {
                self.notifier
                    .notify(self.wire.venue(), FailureKind::ParseFailed, &e.to_string());
                return;
            }
        };

        for wt in ticks {
            if !wt.price.is_finite() || wt.price <= 0.0 {
                self.state.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                debug!(
                    venue = %self.wire.venue(),
                    instrument = %wt.instrument,
                    price = wt.price,
                    "dropping invalid price frame"
                );
                continue;
            }

            let Some(sink) = self.sinks.get(&wt.instrument) else {
                continue;
            };

            // Frames racing a stop() are dropped here.
            if !self.state.accepting.load(Ordering::Acquire) {
                return;
            }

            sink.deliver(Tick {
                instrument: wt.instrument,
                venue: self.wire.venue(),
                price: wt.price,
                ingest_time: Utc::now(),
                volume: wt.volume,
                high: wt.high,
                low: wt.low,
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    /// Wire whose catalog always fails; connect is never reached in tests.
    struct BrokenWire;

    #[async_trait]
    impl VenueWire for BrokenWire {
        fn venue(&self) -> Venue {
            Venue::Binance
        }
        fn wire_symbol(&self, instrument: &Instrument) -> String {
            format!("{}{}", instrument.base(), instrument.quote())
        }
        fn canonical(&self, _symbol: &str) -> Option<Instrument> {
            None
        }
        async fn connect(&self) -> Result<WsStream> {
            bail!("no network in tests")
        }
        fn subscribe_frames(&self, _instruments: &[Instrument]) -> Vec<Message> {
            Vec::new()
        }
        fn unsubscribe_frames(&self, _instruments: &[Instrument]) -> Vec<Message> {
            Vec::new()
        }
        fn parse_text(&self, _text: &str) -> Result<Vec<WireTick>> {
            Ok(Vec::new())
        }
        async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
            bail!("catalog endpoint down")
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub(crate) events: PlMutex<Vec<(Venue, FailureKind, String)>>,
    }

    impl FailureNotifier for RecordingNotifier {
        fn notify(&self, venue: Venue, kind: FailureKind, message: &str) {
            self.events.lock().push((venue, kind, message.to_string()));
        }
    }

    fn settings(enable_fallbacks: bool) -> AdapterSettings {
        AdapterSettings {
            ws_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(10),
            enable_fallbacks,
            fallback_instruments: vec![
                Instrument::new("BTC", "USDT"),
                Instrument::new("ETH", "USDT"),
            ],
        }
    }

    #[tokio::test]
    async fn catalog_failure_degrades_to_fallback_and_notifies() {
        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = WsAdapter::new(BrokenWire, settings(true), notifier.clone());

        let entries = adapter.fetch_catalog().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].instrument, Instrument::new("BTC", "USDT"));
        assert!(entries.iter().all(|e| e.tradable));

        let events = notifier.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, FailureKind::CatalogFetchFailed);
    }

    #[tokio::test]
    async fn catalog_failure_without_fallbacks_is_empty() {
        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = WsAdapter::new(BrokenWire, settings(false), notifier.clone());

        let entries = adapter.fetch_catalog().await.unwrap();
        assert!(entries.is_empty());
        assert_eq!(notifier.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_before_start_is_rejected() {
        struct NullSink;
        impl TickSink for NullSink {
            fn deliver(&self, _tick: Tick) {}
        }

        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = WsAdapter::new(BrokenWire, settings(true), notifier);
        let err = adapter
            .subscribe(Instrument::new("BTC", "USDT"), Arc::new(NullSink))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not started"));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_state() {
        let notifier = Arc::new(RecordingNotifier::default());
        let adapter = WsAdapter::new(BrokenWire, settings(true), notifier);

        adapter.start().await.unwrap();
        adapter.start().await.unwrap();

        let status = adapter.status();
        assert!(!status.connected);
        assert_eq!(status.connection_count, 0);

        adapter.stop().await;
        let status = adapter.status();
        assert!(!status.connected);
        assert!(status.subscribed.is_empty());
    }
}
