//! Cross-venue spread detection engine.
//!
//! One scan per interval, never overlapping: close checks first, then open
//! discovery over every unordered venue pair of every active instrument.
//! All lifecycle state (active map, cooldown map, closed history) is owned
//! by the engine value and dies with it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::catalog::CatalogService;
use crate::engine::opportunity::{
    ActiveOpportunity, AlertEvent, CloseReason, ClosedOpportunity, OpportunityId, SpreadSnapshot,
};
use crate::engine::spread::compute_spread;
use crate::models::{Config, Tick};
use crate::store::PriceStore;

const ALERT_RETRY_BUDGET: u32 = 3;

/// Spread below this percentage counts as full price convergence.
const CONVERGENCE_PCT: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scan_interval: Duration,
    pub open_threshold_pct: f64,
    pub close_threshold_pct: f64,
    pub alert_cooldown: TimeDelta,
    pub min_profit: f64,
    pub notional_units: f64,
    pub min_close_alert_duration: TimeDelta,
    pub max_opportunity_age: TimeDelta,
    pub enable_close_alerts: bool,
    pub closed_history_size: usize,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            scan_interval: cfg.scan_interval,
            open_threshold_pct: cfg.open_threshold_pct,
            close_threshold_pct: cfg.close_threshold_pct,
            alert_cooldown: TimeDelta::from_std(cfg.alert_cooldown)
                .unwrap_or(TimeDelta::minutes(5)),
            min_profit: cfg.min_profit,
            notional_units: cfg.notional_units,
            min_close_alert_duration: TimeDelta::from_std(cfg.min_close_alert_duration)
                .unwrap_or(TimeDelta::minutes(2)),
            max_opportunity_age: TimeDelta::from_std(cfg.max_opportunity_age)
                .unwrap_or(TimeDelta::hours(2)),
            enable_close_alerts: cfg.enable_close_alerts,
            closed_history_size: cfg.closed_history_size,
        }
    }
}

/// Operator commands into the running engine.
#[derive(Debug)]
pub enum EngineCommand {
    CloseManual(OpportunityId),
}

/// Read-only engine view for the status surface, refreshed after each scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub last_scan: Option<DateTime<Utc>>,
    pub active_count: usize,
    pub closed_count: usize,
    pub active: Vec<ActiveOpportunity>,
    pub recent_closed: Vec<ClosedOpportunity>,
}

enum CloseCheck {
    Keep(SpreadSnapshot),
    Close(CloseReason, Option<SpreadSnapshot>),
}

pub struct OpportunityEngine {
    store: Arc<PriceStore>,
    catalog: Arc<CatalogService>,
    sink: Arc<dyn AlertSink>,
    cfg: EngineConfig,
    active: HashMap<OpportunityId, ActiveOpportunity>,
    recent_alerts: HashMap<OpportunityId, DateTime<Utc>>,
    closed: VecDeque<ClosedOpportunity>,
    status: Arc<RwLock<EngineSnapshot>>,
}

impl OpportunityEngine {
    pub fn new(
        store: Arc<PriceStore>,
        catalog: Arc<CatalogService>,
        sink: Arc<dyn AlertSink>,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            sink,
            cfg,
            active: HashMap::new(),
            recent_alerts: HashMap::new(),
            closed: VecDeque::new(),
            status: Arc::new(RwLock::new(EngineSnapshot::default())),
        }
    }

    /// Shared handle to the post-scan snapshot. Grab before `run` consumes
    /// the engine.
    pub fn status_handle(&self) -> Arc<RwLock<EngineSnapshot>> {
        self.status.clone()
    }

    /// Scan loop. Late scans are coalesced: the timer never stacks a second
    /// scan behind a slow one. A failed scan is logged and the next one runs
    /// on the normal cadence.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) {
        let mut ticker = interval(self.cfg.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.cfg.scan_interval, "🎯 opportunity engine started");

        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.scan(now).await {
                        warn!(error = %e, "scan failed, waiting for next interval");
                    }
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(EngineCommand::CloseManual(id)) => {
                        self.close_manually(&id, Utc::now()).await;
                    }
                    None => commands_open = false,
                },
                _ = shutdown.changed() => break,
            }
        }

        // Lifecycle state does not survive the engine.
        self.active.clear();
        self.recent_alerts.clear();
        self.closed.clear();
        info!("opportunity engine stopped");
    }

    /// One atomic scan: close checks first, then open discovery.
    pub async fn scan(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_closes(now).await;
        self.find_opens(now).await;
        self.publish_status(now);
        Ok(())
    }

    async fn find_opens(&mut self, now: DateTime<Utc>) {
        let active_set = self.catalog.active();

        for instrument in &active_set.instruments {
            let fresh: Vec<Tick> = self
                .store
                .prices_for(instrument)
                .into_iter()
                .filter(|t| !self.store.is_stale(instrument, t.venue, now))
                .collect();
            if fresh.len() < 2 {
                continue;
            }

            for i in 0..fresh.len() {
                for j in (i + 1)..fresh.len() {
                    let (a, b) = order_pair(&fresh[i], &fresh[j]);
                    let Some(snapshot) = compute_spread(a, b, self.cfg.notional_units) else {
                        continue;
                    };
                    if snapshot.spread_pct < self.cfg.open_threshold_pct {
                        continue;
                    }
                    if snapshot.implied_profit < self.cfg.min_profit {
                        continue;
                    }

                    let id = OpportunityId::new(instrument.clone(), a.venue, b.venue);
                    let event = self.open_or_update(id, snapshot, now);
                    if let Some(event) = event {
                        self.dispatch(event).await;
                    }
                }
            }
        }
    }

    /// Drive the open/update half of the state machine for one qualifying
    /// pair. Returns the alert to dispatch, if any: updates inside the
    /// cooldown window still advance current and peak but stay silent.
    fn open_or_update(
        &mut self,
        id: OpportunityId,
        snapshot: SpreadSnapshot,
        now: DateTime<Utc>,
    ) -> Option<AlertEvent> {
        if let Some(existing) = self.active.get_mut(&id) {
            existing.update(snapshot, now);

            let cooldown_over = self
                .recent_alerts
                .get(&id)
                .map(|last| now - *last >= self.cfg.alert_cooldown)
                .unwrap_or(true);
            if !cooldown_over {
                return None;
            }

            existing.alerts_sent += 1;
            let event = AlertEvent::OpenOrUpdate(existing.clone());
            self.recent_alerts.insert(id, now);
            Some(event)
        } else {
            let opened = ActiveOpportunity::open(id.clone(), snapshot, now);
            info!(
                id = %id,
                spread_pct = format!("{:.3}", snapshot.spread_pct),
                implied_profit = format!("{:.2}", snapshot.implied_profit),
                "📈 opportunity opened"
            );
            let event = AlertEvent::OpenOrUpdate(opened.clone());
            self.active.insert(id.clone(), opened);
            self.recent_alerts.insert(id, now);
            Some(event)
        }
    }

    async fn check_closes(&mut self, now: DateTime<Utc>) {
        let ids: Vec<OpportunityId> = self.active.keys().cloned().collect();

        for id in ids {
            let Some(open_time) = self.active.get(&id).map(|o| o.open_time) else {
                continue;
            };

            let tick_a = self
                .store
                .get(&id.instrument, id.venue_a)
                .filter(|_| !self.store.is_stale(&id.instrument, id.venue_a, now));
            let tick_b = self
                .store
                .get(&id.instrument, id.venue_b)
                .filter(|_| !self.store.is_stale(&id.instrument, id.venue_b, now));

            let check = match (tick_a, tick_b) {
                (Some(a), Some(b)) => {
                    match compute_spread(&a, &b, self.cfg.notional_units) {
                        Some(snapshot) => {
                            // Threshold check runs first: a spread under both
                            // bounds closes as BELOW_THRESHOLD.
                            if snapshot.spread_pct < self.cfg.close_threshold_pct {
                                CloseCheck::Close(CloseReason::BelowThreshold, Some(snapshot))
                            } else if snapshot.spread_pct < CONVERGENCE_PCT {
                                CloseCheck::Close(CloseReason::PriceConverged, Some(snapshot))
                            } else if now - open_time > self.cfg.max_opportunity_age {
                                CloseCheck::Close(CloseReason::Timeout, Some(snapshot))
                            } else {
                                CloseCheck::Keep(snapshot)
                            }
                        }
                        None => CloseCheck::Close(CloseReason::PriceConverged, None),
                    }
                }
                // A missing or stale leg closes as converged; there is no
                // separate data-loss reason.
                _ => CloseCheck::Close(CloseReason::PriceConverged, None),
            };

            match check {
                CloseCheck::Keep(snapshot) => {
                    if let Some(o) = self.active.get_mut(&id) {
                        o.update(snapshot, now);
                    }
                }
                CloseCheck::Close(reason, closing) => {
                    if let Some(mut o) = self.active.remove(&id) {
                        if let Some(snapshot) = closing {
                            o.update(snapshot, now);
                        }
                        self.close_opportunity(o, now, reason).await;
                    }
                }
            }
        }
    }

    /// Operator-initiated close; the only path to `MANUAL`.
    pub async fn close_manually(&mut self, id: &OpportunityId, now: DateTime<Utc>) {
        if let Some(o) = self.active.remove(id) {
            self.close_opportunity(o, now, CloseReason::Manual).await;
        } else {
            warn!(id = %id, "manual close for unknown opportunity");
        }
    }

    async fn close_opportunity(
        &mut self,
        opportunity: ActiveOpportunity,
        now: DateTime<Utc>,
        reason: CloseReason,
    ) {
        self.recent_alerts.remove(&opportunity.id);
        let closed = opportunity.into_closed(now, reason);

        info!(
            id = %closed.id,
            reason = %closed.close_reason,
            duration_secs = closed.duration_secs,
            peak_spread_pct = format!("{:.3}", closed.peak_spread_pct),
            "📉 opportunity closed"
        );

        let long_enough =
            closed.close_time - closed.open_time >= self.cfg.min_close_alert_duration;
        if self.cfg.enable_close_alerts && long_enough {
            self.dispatch(AlertEvent::Close(closed.clone())).await;
        }

        self.closed.push_back(closed);
        while self.closed.len() > self.cfg.closed_history_size {
            self.closed.pop_front();
        }
    }

    async fn dispatch(&self, event: AlertEvent) {
        let priority = event.priority();
        if let Err(e) = self.sink.enqueue(event, priority, ALERT_RETRY_BUDGET).await {
            // Detection state is unaffected; only the outbound event is lost.
            warn!(error = %e, "dropping alert after terminal enqueue failure");
        }
    }

    fn publish_status(&self, now: DateTime<Utc>) {
        let mut active: Vec<ActiveOpportunity> = self.active.values().cloned().collect();
        active.sort_by(|a, b| {
            b.current
                .spread_pct
                .partial_cmp(&a.current.spread_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        *self.status.write() = EngineSnapshot {
            last_scan: Some(now),
            active_count: self.active.len(),
            closed_count: self.closed.len(),
            active,
            recent_closed: self.closed.iter().rev().take(20).cloned().collect(),
        };
    }
}

fn order_pair<'t>(x: &'t Tick, y: &'t Tick) -> (&'t Tick, &'t Tick) {
    if x.venue.as_str() <= y.venue.as_str() {
        (x, y)
    } else {
        (y, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::MockAdapter;
    use crate::engine::opportunity::Direction;
    use crate::models::{Instrument, Venue};
    use crate::venues::VenueAdapter;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(AlertEvent, u32, u32)>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(AlertEvent, u32, u32)> {
            self.events.lock().clone()
        }
        fn len(&self) -> usize {
            self.events.lock().len()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn enqueue(&self, event: AlertEvent, priority: u32, retries: u32) -> Result<()> {
            self.events.lock().push((event, priority, retries));
            Ok(())
        }
    }

    struct Harness {
        engine: OpportunityEngine,
        store: Arc<PriceStore>,
        sink: Arc<RecordingSink>,
        instrument: Instrument,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_config(test_config()).await
        }

        async fn with_config(cfg: EngineConfig) -> Self {
            let mut app_cfg = Config::from_env().unwrap();
            app_cfg.min_venues_per_instrument = 2;
            app_cfg.fallback_instruments = Vec::new();

            let adapters: HashMap<Venue, Arc<dyn crate::venues::VenueAdapter>> = [
                MockAdapter::new(Venue::Binance, &[("BTC", "USDT")]),
                MockAdapter::new(Venue::Bybit, &[("BTC", "USDT")]),
                MockAdapter::new(Venue::Okx, &[("BTC", "USDT")]),
            ]
            .into_iter()
            .map(|a| (a.venue(), a as Arc<dyn crate::venues::VenueAdapter>))
            .collect();

            let catalog = Arc::new(CatalogService::new(adapters, &app_cfg));
            catalog.refresh().await.unwrap();

            let store = Arc::new(PriceStore::new(
                100,
                Duration::from_secs(60),
                Duration::from_secs(300),
            ));
            let sink = Arc::new(RecordingSink::default());
            let engine =
                OpportunityEngine::new(store.clone(), catalog, sink.clone(), cfg);

            Self {
                engine,
                store,
                sink,
                instrument: Instrument::new("BTC", "USDT"),
            }
        }

        fn feed(&self, venue: Venue, price: f64, at: DateTime<Utc>) {
            assert!(self.store.put(Tick {
                instrument: self.instrument.clone(),
                venue,
                price,
                ingest_time: at,
                volume: None,
                high: None,
                low: None,
            }));
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            scan_interval: Duration::from_secs(10),
            open_threshold_pct: 0.7,
            close_threshold_pct: 0.5,
            alert_cooldown: TimeDelta::minutes(5),
            min_profit: 10.0,
            notional_units: 1000.0,
            min_close_alert_duration: TimeDelta::minutes(2),
            max_opportunity_age: TimeDelta::hours(2),
            enable_close_alerts: true,
            closed_history_size: 1000,
        }
    }

    fn open_events(sink: &RecordingSink) -> Vec<ActiveOpportunity> {
        sink.events()
            .into_iter()
            .filter_map(|(e, _, _)| match e {
                AlertEvent::OpenOrUpdate(o) => Some(o),
                AlertEvent::Close(_) => None,
            })
            .collect()
    }

    fn close_events(sink: &RecordingSink) -> Vec<ClosedOpportunity> {
        sink.events()
            .into_iter()
            .filter_map(|(e, _, _)| match e {
                AlertEvent::Close(c) => Some(c),
                AlertEvent::OpenOrUpdate(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn simple_open() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);

        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        let (event, priority, retries) = &events[0];
        assert_eq!(*priority, 9); // floor(0.995 * 10)
        assert_eq!(*retries, ALERT_RETRY_BUDGET);

        let AlertEvent::OpenOrUpdate(o) = event else {
            panic!("expected open event");
        };
        assert_eq!(o.alerts_sent, 1);
        assert_eq!(o.current.direction, Direction::BuyASellB);
        assert_eq!(o.id.venue_a, Venue::Binance);
        assert_eq!(o.id.venue_b, Venue::Bybit);
        assert!((o.current.spread_pct - 0.995).abs() < 0.001);
        assert_eq!(o.current.implied_profit, 1000.0);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_alerts_but_updates_state() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();
        assert_eq!(h.sink.len(), 1);

        // Spread widens during the cooldown window: silent, but peak moves.
        for secs in [11, 21, 31] {
            let now = t0 + TimeDelta::seconds(secs);
            h.feed(Venue::Binance, 100.0, now);
            h.feed(Venue::Bybit, 102.0, now);
            h.engine.scan(now).await.unwrap();
        }
        assert_eq!(h.sink.len(), 1);

        let id = OpportunityId::new(h.instrument.clone(), Venue::Binance, Venue::Bybit);
        let active = h.engine.active.get(&id).unwrap();
        assert!(active.peak_spread_pct > 1.9);
        assert_eq!(active.alerts_sent, 1);

        // First scan at/after the cooldown re-alerts exactly once.
        let later = t0 + TimeDelta::seconds(301);
        h.feed(Venue::Binance, 100.0, later);
        h.feed(Venue::Bybit, 102.0, later);
        h.engine.scan(later).await.unwrap();

        let opens = open_events(&h.sink);
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].alerts_sent, 2);
    }

    #[tokio::test]
    async fn swapped_venue_prices_hit_the_same_opportunity() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        // Prices swap sides: same id, no second open, direction flips.
        let t1 = t0 + TimeDelta::seconds(11);
        h.feed(Venue::Binance, 101.0, t1);
        h.feed(Venue::Bybit, 100.0, t1);
        h.engine.scan(t1).await.unwrap();

        assert_eq!(h.engine.active.len(), 1);
        assert_eq!(h.sink.len(), 1); // still in cooldown, no second alert

        let id = OpportunityId::new(h.instrument.clone(), Venue::Bybit, Venue::Binance);
        let active = h.engine.active.get(&id).unwrap();
        assert_eq!(active.current.direction, Direction::BuyBSellA);
        assert_eq!(active.alerts_sent, 1);
    }

    #[tokio::test]
    async fn close_below_threshold() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        // ~0.399%: inside [0.1, 0.5) so the first branch fires.
        let t1 = t0 + TimeDelta::seconds(150);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.40, t1);
        h.engine.scan(t1).await.unwrap();

        assert!(h.engine.active.is_empty());
        let closes = close_events(&h.sink);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].close_reason, CloseReason::BelowThreshold);
        assert!((closes[0].peak_spread_pct - 0.995).abs() < 0.001);
        assert!(closes[0].duration_secs >= 120);
    }

    #[tokio::test]
    async fn tight_spread_close_prefers_below_threshold_branch() {
        // A spread under both the close threshold and the convergence floor
        // closes as BELOW_THRESHOLD; the threshold branch runs first.
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        let t1 = t0 + TimeDelta::seconds(150);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.05, t1); // ~0.05%
        h.engine.scan(t1).await.unwrap();

        let closes = close_events(&h.sink);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].close_reason, CloseReason::BelowThreshold);
    }

    #[tokio::test]
    async fn close_by_convergence_when_band_allows_it() {
        // With a close threshold under the convergence floor, the second
        // branch becomes reachable.
        let mut cfg = test_config();
        cfg.close_threshold_pct = 0.03;
        let mut h = Harness::with_config(cfg).await;

        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        let t1 = t0 + TimeDelta::seconds(150);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.05, t1); // ~0.05%: not < 0.03, but < 0.1
        h.engine.scan(t1).await.unwrap();

        let closes = close_events(&h.sink);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].close_reason, CloseReason::PriceConverged);
        assert!((closes[0].peak_spread_pct - 0.995).abs() < 0.001);
    }

    #[tokio::test]
    async fn stale_feed_closes_the_opportunity() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        // Bybit goes quiet; binance keeps ticking.
        let t1 = t0 + TimeDelta::seconds(70);
        h.feed(Venue::Binance, 100.0, t1);
        h.engine.scan(t1).await.unwrap();

        assert!(h.engine.active.is_empty());
        assert_eq!(h.engine.closed.len(), 1);
        let closed = h.engine.closed.back().unwrap();
        assert_eq!(closed.close_reason, CloseReason::PriceConverged);

        // Short-lived: 70s < 2min, so no CLOSE event reaches the sink.
        assert!(close_events(&h.sink).is_empty());

        // Nothing reopens while one leg stays stale.
        let t2 = t0 + TimeDelta::seconds(80);
        h.feed(Venue::Binance, 100.0, t2);
        h.engine.scan(t2).await.unwrap();
        assert!(h.engine.active.is_empty());
        assert_eq!(open_events(&h.sink).len(), 1);

        // A fresh qualifying tick opens and alerts again from scratch.
        let t3 = t0 + TimeDelta::seconds(90);
        h.feed(Venue::Bybit, 101.0, t3);
        h.engine.scan(t3).await.unwrap();
        let opens = open_events(&h.sink);
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].alerts_sent, 1);
    }

    #[tokio::test]
    async fn timeout_closes_long_lived_opportunity() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        // Two hours later the spread still holds, with fresh ticks.
        let t1 = t0 + TimeDelta::seconds(7201);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 101.0, t1);
        h.engine.scan(t1).await.unwrap();

        let closes = close_events(&h.sink);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].close_reason, CloseReason::Timeout);
        // CLOSE priority comes from the peak spread.
        let close_priority = h
            .sink
            .events()
            .iter()
            .find_map(|(e, p, _)| matches!(e, AlertEvent::Close(_)).then_some(*p))
            .unwrap();
        assert_eq!(close_priority, 9);
    }

    #[tokio::test]
    async fn three_venue_fanout_opens_independent_pairs() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.feed(Venue::Okx, 102.0, t0);

        h.engine.scan(t0 + TimeDelta::seconds(1)).await.unwrap();

        assert_eq!(h.engine.active.len(), 3);
        assert_eq!(open_events(&h.sink).len(), 3);

        for (x, y) in [
            (Venue::Binance, Venue::Bybit),
            (Venue::Binance, Venue::Okx),
            (Venue::Bybit, Venue::Okx),
        ] {
            let id = OpportunityId::new(h.instrument.clone(), x, y);
            assert!(h.engine.active.contains_key(&id), "missing {id}");
        }
    }

    #[tokio::test]
    async fn exactly_open_threshold_opens() {
        let mut cfg = test_config();
        // Threshold set to the exact computed spread: >= must open.
        cfg.open_threshold_pct = 100.0 * 1.0 / 100.5;
        let mut h = Harness::with_config(cfg).await;

        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        assert_eq!(h.engine.active.len(), 1);
    }

    #[tokio::test]
    async fn exactly_close_threshold_stays_open() {
        // Mirror the engine's float ops exactly so the threshold equals the
        // computed spread (binance 100.0, bybit 100.55).
        let spread_abs = (100.0f64 - 100.55).abs();
        let mid = (100.0 + 100.55) / 2.0;
        let mut cfg = test_config();
        cfg.close_threshold_pct = 100.0 * spread_abs / mid;
        let mut h = Harness::with_config(cfg).await;

        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        let t1 = t0 + TimeDelta::seconds(30);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.55, t1);
        h.engine.scan(t1).await.unwrap();

        // Strictly-below semantics: equality does not close.
        assert_eq!(h.engine.active.len(), 1);
        assert!(close_events(&h.sink).is_empty());
    }

    #[tokio::test]
    async fn below_min_profit_does_not_open() {
        let mut cfg = test_config();
        cfg.min_profit = 2000.0;
        let mut h = Harness::with_config(cfg).await;

        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0); // implied profit 1000 < 2000
        h.engine.scan(t0).await.unwrap();

        assert!(h.engine.active.is_empty());
        assert_eq!(h.sink.len(), 0);
    }

    #[tokio::test]
    async fn short_lived_close_emits_no_event_but_is_recorded() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        let t1 = t0 + TimeDelta::seconds(30);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.05, t1);
        h.engine.scan(t1).await.unwrap();

        assert!(close_events(&h.sink).is_empty());
        assert_eq!(h.engine.closed.len(), 1);
    }

    #[tokio::test]
    async fn manual_close_uses_manual_reason() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        let id = OpportunityId::new(h.instrument.clone(), Venue::Binance, Venue::Bybit);
        h.engine
            .close_manually(&id, t0 + TimeDelta::seconds(200))
            .await;

        assert!(h.engine.active.is_empty());
        let closes = close_events(&h.sink);
        assert_eq!(closes.len(), 1);
        assert_eq!(closes[0].close_reason, CloseReason::Manual);
    }

    #[tokio::test]
    async fn open_survives_scans_without_matching_close_condition() {
        let mut h = Harness::new().await;
        let t0 = Utc::now();
        h.feed(Venue::Binance, 100.0, t0);
        h.feed(Venue::Bybit, 101.0, t0);
        h.engine.scan(t0).await.unwrap();

        // Spread drifts inside the hysteresis band (close <= pct < open):
        // no re-qualification, no close, opportunity persists.
        let t1 = t0 + TimeDelta::seconds(20);
        h.feed(Venue::Binance, 100.0, t1);
        h.feed(Venue::Bybit, 100.6, t1); // ~0.598%
        h.engine.scan(t1).await.unwrap();

        assert_eq!(h.engine.active.len(), 1);
        let id = OpportunityId::new(h.instrument.clone(), Venue::Binance, Venue::Bybit);
        let active = h.engine.active.get(&id).unwrap();
        assert!(active.current.spread_pct < 0.7);
        assert_eq!(active.last_seen_time, t1);
    }
}
