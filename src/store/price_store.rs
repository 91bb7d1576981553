//! Latest-price cache keyed by (instrument, venue).
//!
//! Concurrency hotspot of the core: one adapter writes per venue, the
//! opportunity engine and status views read. Short critical sections behind
//! `parking_lot::RwLock`; readers never observe a partially written entry.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::models::{Instrument, Tick, Venue};

type PriceKey = (Instrument, Venue);

#[derive(Debug, Default)]
struct PriceEntry {
    latest: Option<Tick>,
    history: VecDeque<Tick>,
}

pub struct PriceStore {
    inner: RwLock<HashMap<PriceKey, PriceEntry>>,
    history_size: usize,
    stale_after: TimeDelta,
    drop_after: TimeDelta,
    dropped_invalid: AtomicU64,
    dropped_regressing: AtomicU64,
}

impl PriceStore {
    pub fn new(history_size: usize, stale_after: Duration, drop_after: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            history_size: history_size.max(1),
            stale_after: TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::seconds(60)),
            drop_after: TimeDelta::from_std(drop_after).unwrap_or(TimeDelta::seconds(300)),
            dropped_invalid: AtomicU64::new(0),
            dropped_regressing: AtomicU64::new(0),
        }
    }

    /// Insert a tick as the latest for its key and append it to the history
    /// ring. Returns false when the tick is rejected.
    ///
    /// Rejected: non-finite or non-positive prices, and ticks whose
    /// `ingest_time` regresses below the stored latest (per-key ingest time
    /// is monotonically non-decreasing).
    pub fn put(&self, tick: Tick) -> bool {
        if !tick.has_valid_price() {
            self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            debug!(
                instrument = %tick.instrument,
                venue = %tick.venue,
                price = tick.price,
                "dropping invalid tick"
            );
            return false;
        }

        let key = (tick.instrument.clone(), tick.venue);
        let mut map = self.inner.write();
        let entry = map.entry(key).or_default();

        if let Some(latest) = &entry.latest {
            if tick.ingest_time < latest.ingest_time {
                self.dropped_regressing.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        entry.history.push_back(tick.clone());
        while entry.history.len() > self.history_size {
            entry.history.pop_front();
        }
        entry.latest = Some(tick);
        true
    }

    pub fn get(&self, instrument: &Instrument, venue: Venue) -> Option<Tick> {
        let map = self.inner.read();
        map.get(&(instrument.clone(), venue))
            .and_then(|e| e.latest.clone())
    }

    /// Latest tick per venue that has ever reported this instrument.
    /// May include stale entries; callers filter with [`Self::is_stale`].
    pub fn prices_for(&self, instrument: &Instrument) -> Vec<Tick> {
        let map = self.inner.read();
        let mut out: Vec<Tick> = map
            .iter()
            .filter(|((i, _), _)| i == instrument)
            .filter_map(|(_, e)| e.latest.clone())
            .collect();
        out.sort_by_key(|t| t.venue.as_str());
        out
    }

    /// A key is stale when its latest tick is older than the staleness
    /// window, or when it has never reported.
    pub fn is_stale(&self, instrument: &Instrument, venue: Venue, now: DateTime<Utc>) -> bool {
        match self.get(instrument, venue) {
            Some(tick) => now - tick.ingest_time > self.stale_after,
            None => true,
        }
    }

    /// History ring for a key, oldest first.
    pub fn history(&self, instrument: &Instrument, venue: Venue) -> Vec<Tick> {
        let map = self.inner.read();
        map.get(&(instrument.clone(), venue))
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop keys untouched for the GC window. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, entry| match &entry.latest {
            Some(latest) => now - latest.ingest_time <= self.drop_after,
            None => false,
        });
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StoreSnapshot {
        let map = self.inner.read();
        let mut entries: Vec<StoreEntrySummary> = map
            .iter()
            .filter_map(|((instrument, venue), e)| {
                let latest = e.latest.as_ref()?;
                Some(StoreEntrySummary {
                    instrument: instrument.clone(),
                    venue: *venue,
                    price: latest.price,
                    age_ms: (now - latest.ingest_time).num_milliseconds().max(0),
                    history_len: e.history.len(),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.instrument
                .cmp(&b.instrument)
                .then(a.venue.as_str().cmp(b.venue.as_str()))
        });

        StoreSnapshot {
            keys: map.len(),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            dropped_regressing: self.dropped_regressing.load(Ordering::Relaxed),
            entries,
        }
    }
}

/// Adapters publish straight into the store.
impl crate::venues::TickSink for PriceStore {
    fn deliver(&self, tick: Tick) {
        self.put(tick);
    }
}

/// Read-only store view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub keys: usize,
    pub dropped_invalid: u64,
    pub dropped_regressing: u64,
    pub entries: Vec<StoreEntrySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreEntrySummary {
    pub instrument: Instrument,
    pub venue: Venue,
    pub price: f64,
    pub age_ms: i64,
    pub history_len: usize,
}
