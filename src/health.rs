//! Adapter liveness probing.
//!
//! One probe shortly after startup, then a fixed cadence. A venue reporting
//! no live connection gets bounced through the subscription manager; each
//! probe publishes a single aggregated snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::catalog::SubscriptionManager;
use crate::models::Venue;
use crate::venues::VenueAdapter;

const STARTUP_PROBE_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub at: DateTime<Utc>,
    pub working: Vec<Venue>,
    pub failed: Vec<Venue>,
}

pub struct HealthMonitor {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    subs: Arc<SubscriptionManager>,
    probe_interval: Duration,
    snapshot: Arc<RwLock<Option<HealthSnapshot>>>,
}

impl HealthMonitor {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        subs: Arc<SubscriptionManager>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            adapters,
            subs,
            probe_interval,
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Shared handle to the latest probe result.
    pub fn snapshot_handle(&self) -> Arc<RwLock<Option<HealthSnapshot>>> {
        self.snapshot.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(STARTUP_PROBE_DELAY) => {
                self.probe().await;
            }
            _ = shutdown.changed() => return,
        }

        let mut ticker = interval_at(Instant::now() + self.probe_interval, self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe().await;
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    pub async fn probe(&self) {
        let mut working = Vec::new();
        let mut failed = Vec::new();

        for venue in Venue::ALL {
            let Some(adapter) = self.adapters.get(&venue) else {
                continue;
            };
            let status = adapter.status();
            if status.connected && status.connection_count > 0 {
                working.push(venue);
            } else {
                failed.push(venue);
                if let Err(e) = self.subs.reconnect_venue(venue).await {
                    warn!(venue = %venue, error = %e, "reconnect attempt failed");
                }
            }
        }

        info!(working = ?working, failed = ?failed, "🩺 health probe");
        *self.snapshot.write() = Some(HealthSnapshot {
            at: Utc::now(),
            working,
            failed,
        });
    }
}
