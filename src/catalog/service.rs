//! Common-instrument discovery.
//!
//! Fetches every venue catalog in parallel, keeps quote-filtered tradable
//! instruments, and publishes the set of instruments present on at least
//! `min_venues_per_instrument` venues. The published `ActiveSet` sits behind
//! an `ArcSwap` so readers (the engine's scan, status views) never block a
//! refresh.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::{Config, Instrument, Venue};
use crate::venues::VenueAdapter;

/// The current subscription universe.
#[derive(Debug, Default)]
pub struct ActiveSet {
    /// Sorted by venue-count descending, then lexicographic.
    pub instruments: Vec<Instrument>,
    pub venues: HashMap<Instrument, Vec<Venue>>,
}

impl ActiveSet {
    pub fn venues_for(&self, instrument: &Instrument) -> &[Venue] {
        self.venues
            .get(instrument)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.venues.contains_key(instrument)
    }

    /// Every (instrument, venue) wiring the set implies.
    pub fn pairs(&self) -> Vec<(Instrument, Venue)> {
        self.instruments
            .iter()
            .flat_map(|i| {
                self.venues_for(i)
                    .iter()
                    .map(move |v| (i.clone(), *v))
            })
            .collect()
    }
}

/// Subscription changes implied by a refresh.
#[derive(Debug, Clone, Default)]
pub struct CatalogDiff {
    pub added: Vec<(Instrument, Venue)>,
    pub removed: Vec<(Instrument, Venue)>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct CatalogService {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    quote_filter: String,
    min_venues: usize,
    fallback_instruments: Vec<Instrument>,
    active: ArcSwap<ActiveSet>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

impl CatalogService {
    pub fn new(adapters: HashMap<Venue, Arc<dyn VenueAdapter>>, cfg: &Config) -> Self {
        Self {
            adapters,
            quote_filter: cfg.quote_filter.clone(),
            min_venues: cfg.min_venues_per_instrument,
            fallback_instruments: cfg.fallback_instruments.clone(),
            active: ArcSwap::from_pointee(ActiveSet::default()),
            last_refresh: RwLock::new(None),
        }
    }

    /// Fetch all catalogs in parallel, recompute the intersection, publish
    /// the new set, and return the subscription diff against the previous
    /// one. Idempotent when the underlying catalogs are unchanged.
    pub async fn refresh(&self) -> Result<CatalogDiff> {
        let fetches = self.adapters.iter().map(|(venue, adapter)| {
            let venue = *venue;
            let adapter = adapter.clone();
            async move { (venue, adapter.fetch_catalog().await) }
        });

        let mut per_venue: HashMap<Venue, HashSet<Instrument>> = HashMap::new();
        for (venue, result) in join_all(fetches).await {
            match result {
                Ok(entries) => {
                    let instruments: HashSet<Instrument> = entries
                        .into_iter()
                        .filter(|e| e.tradable && e.quote == self.quote_filter)
                        .map(|e| e.instrument)
                        .collect();
                    info!(venue = %venue, instruments = instruments.len(), "catalog fetched");
                    per_venue.insert(venue, instruments);
                }
                Err(e) => {
                    warn!(venue = %venue, error = %e, "catalog fetch errored");
                    per_venue.insert(venue, HashSet::new());
                }
            }
        }

        let next = self.intersect(&per_venue);
        let prev = self.active.load_full();
        let diff = diff_pairs(&prev, &next);

        info!(
            instruments = next.instruments.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "🧭 active set refreshed"
        );

        self.active.store(Arc::new(next));
        *self.last_refresh.write() = Some(Utc::now());
        Ok(diff)
    }

    fn intersect(&self, per_venue: &HashMap<Venue, HashSet<Instrument>>) -> ActiveSet {
        let mut venues_by_instrument: HashMap<Instrument, Vec<Venue>> = HashMap::new();
        // Walk the closed venue set in declaration order so venue lists come
        // out deterministic.
        for venue in Venue::ALL {
            if let Some(instruments) = per_venue.get(&venue) {
                for instrument in instruments {
                    venues_by_instrument
                        .entry(instrument.clone())
                        .or_default()
                        .push(venue);
                }
            }
        }

        venues_by_instrument.retain(|_, venues| venues.len() >= self.min_venues);

        let mut instruments: Vec<Instrument> = venues_by_instrument.keys().cloned().collect();
        instruments.sort_by(|a, b| {
            let count_a = venues_by_instrument[a].len();
            let count_b = venues_by_instrument[b].len();
            count_b.cmp(&count_a).then_with(|| a.cmp(b))
        });

        if instruments.is_empty() {
            warn!(
                fallback = self.fallback_instruments.len(),
                "no instrument on enough venues, using fallback list"
            );
            let venues: HashMap<Instrument, Vec<Venue>> = self
                .fallback_instruments
                .iter()
                .map(|i| (i.clone(), Venue::ALL.to_vec()))
                .collect();
            return ActiveSet {
                instruments: self.fallback_instruments.clone(),
                venues,
            };
        }

        ActiveSet {
            instruments,
            venues: venues_by_instrument,
        }
    }

    /// Current published set. Cheap; safe to call from any task.
    pub fn active(&self) -> Arc<ActiveSet> {
        self.active.load_full()
    }

    /// Venues quoting this instrument in the current set.
    pub fn exchanges_for(&self, instrument: &Instrument) -> Vec<Venue> {
        self.active.load().venues_for(instrument).to_vec()
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        let active = self.active.load();
        CatalogSnapshot {
            instruments: active.instruments.len(),
            subscriptions: active.venues.values().map(|v| v.len()).sum(),
            last_refresh: *self.last_refresh.read(),
        }
    }
}

fn diff_pairs(prev: &ActiveSet, next: &ActiveSet) -> CatalogDiff {
    let prev_pairs: HashSet<(Instrument, Venue)> = prev.pairs().into_iter().collect();
    let next_pairs: HashSet<(Instrument, Venue)> = next.pairs().into_iter().collect();

    let mut added: Vec<_> = next_pairs.difference(&prev_pairs).cloned().collect();
    let mut removed: Vec<_> = prev_pairs.difference(&next_pairs).cloned().collect();
    let by_label = |a: &(Instrument, Venue), b: &(Instrument, Venue)| {
        a.0.cmp(&b.0).then(a.1.as_str().cmp(b.1.as_str()))
    };
    added.sort_by(by_label);
    removed.sort_by(by_label);

    CatalogDiff { added, removed }
}

/// Read-only catalog view for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub instruments: usize,
    pub subscriptions: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}
