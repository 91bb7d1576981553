//! Wires discovered instruments to venue adapters.
//!
//! Each (instrument, venue) pair of the active set gets a subscription whose
//! sink forwards into `PriceStore::put`. Adapters re-subscribe their own set
//! on internal reconnects; this manager only re-issues subscriptions after
//! an explicit [`SubscriptionManager::reconnect_venue`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::catalog::service::{CatalogDiff, CatalogService};
use crate::models::Venue;
use crate::store::PriceStore;
use crate::venues::{TickSink, VenueAdapter};

pub struct SubscriptionManager {
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    store: Arc<PriceStore>,
    catalog: Arc<CatalogService>,
}

impl SubscriptionManager {
    pub fn new(
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        store: Arc<PriceStore>,
        catalog: Arc<CatalogService>,
    ) -> Self {
        Self {
            adapters,
            store,
            catalog,
        }
    }

    fn sink(&self) -> Arc<dyn TickSink> {
        self.store.clone()
    }

    /// Initial wiring after catalog discovery.
    pub async fn apply(&self) -> Result<()> {
        let active = self.catalog.active();
        let mut wired = 0usize;

        for (instrument, venue) in active.pairs() {
            let Some(adapter) = self.adapters.get(&venue) else {
                continue;
            };
            adapter
                .subscribe(instrument.clone(), self.sink())
                .await
                .with_context(|| format!("subscribe {instrument} on {venue}"))?;
            wired += 1;
        }

        info!(
            instruments = active.instruments.len(),
            subscriptions = wired,
            "✅ subscriptions wired"
        );
        Ok(())
    }

    /// Apply a refresh diff: removals first, then additions.
    pub async fn apply_diff(&self, diff: &CatalogDiff) {
        for (instrument, venue) in &diff.removed {
            if let Some(adapter) = self.adapters.get(venue) {
                adapter.unsubscribe(instrument).await;
            }
        }

        for (instrument, venue) in &diff.added {
            let Some(adapter) = self.adapters.get(venue) else {
                continue;
            };
            if let Err(e) = adapter.subscribe(instrument.clone(), self.sink()).await {
                warn!(instrument = %instrument, venue = %venue, error = %e, "subscribe failed");
            }
        }

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                "subscriptions updated"
            );
        }
    }

    /// Bounce one venue's adapter and re-issue its active subscriptions.
    pub async fn reconnect_venue(&self, venue: Venue) -> Result<()> {
        let Some(adapter) = self.adapters.get(&venue) else {
            bail!("no adapter registered for {venue}");
        };

        warn!(venue = %venue, "forcing venue reconnect");
        adapter.stop().await;
        adapter.start().await?;

        let active = self.catalog.active();
        let mut wired = 0usize;
        for instrument in &active.instruments {
            if active.venues_for(instrument).contains(&venue) {
                if let Err(e) = adapter.subscribe(instrument.clone(), self.sink()).await {
                    warn!(instrument = %instrument, venue = %venue, error = %e, "re-subscribe failed");
                } else {
                    wired += 1;
                }
            }
        }

        info!(venue = %venue, subscriptions = wired, "venue reconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testing::MockAdapter;
    use crate::models::{Config, Instrument};
    use std::time::Duration;

    fn harness(
        adapters: Vec<Arc<MockAdapter>>,
    ) -> (SubscriptionManager, Arc<CatalogService>, Vec<Arc<MockAdapter>>) {
        let mut cfg = Config::from_env().unwrap();
        cfg.min_venues_per_instrument = 2;
        cfg.fallback_instruments = Vec::new();

        let map: HashMap<Venue, Arc<dyn VenueAdapter>> = adapters
            .iter()
            .map(|a| (a.venue(), a.clone() as Arc<dyn VenueAdapter>))
            .collect();
        let catalog = Arc::new(CatalogService::new(map.clone(), &cfg));
        let store = Arc::new(PriceStore::new(
            16,
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        (
            SubscriptionManager::new(map, store, catalog.clone()),
            catalog,
            adapters,
        )
    }

    #[tokio::test]
    async fn apply_wires_every_pair_of_the_active_set() {
        let (subs, catalog, adapters) = harness(vec![
            MockAdapter::new(Venue::Binance, &[("BTC", "USDT"), ("ETH", "USDT")]),
            MockAdapter::new(Venue::Bybit, &[("BTC", "USDT"), ("ETH", "USDT")]),
            MockAdapter::new(Venue::Okx, &[("BTC", "USDT")]),
        ]);
        catalog.refresh().await.unwrap();
        subs.apply().await.unwrap();

        assert_eq!(adapters[0].subscribed.lock().len(), 2); // binance: BTC+ETH
        assert_eq!(adapters[1].subscribed.lock().len(), 2); // bybit: BTC+ETH
        assert_eq!(adapters[2].subscribed.lock().len(), 1); // okx: BTC only
    }

    #[tokio::test]
    async fn diff_application_unsubscribes_then_subscribes() {
        let binance = MockAdapter::new(Venue::Binance, &[("BTC", "USDT")]);
        let (subs, _, _) = harness(vec![binance.clone()]);

        let diff = CatalogDiff {
            added: vec![(Instrument::new("ETH", "USDT"), Venue::Binance)],
            removed: vec![(Instrument::new("BTC", "USDT"), Venue::Binance)],
        };
        subs.apply_diff(&diff).await;

        assert_eq!(
            binance.unsubscribed.lock().as_slice(),
            &[Instrument::new("BTC", "USDT")]
        );
        assert_eq!(
            binance.subscribed.lock().as_slice(),
            &[Instrument::new("ETH", "USDT")]
        );
    }

    #[tokio::test]
    async fn reconnect_venue_restarts_and_rewires_only_that_venue() {
        let (subs, catalog, adapters) = harness(vec![
            MockAdapter::new(Venue::Binance, &[("BTC", "USDT")]),
            MockAdapter::new(Venue::Bybit, &[("BTC", "USDT")]),
        ]);
        catalog.refresh().await.unwrap();

        subs.reconnect_venue(Venue::Binance).await.unwrap();

        assert_eq!(*adapters[0].restarts.lock(), 1);
        assert_eq!(
            adapters[0].subscribed.lock().as_slice(),
            &[Instrument::new("BTC", "USDT")]
        );
        assert_eq!(*adapters[1].restarts.lock(), 0);
        assert!(adapters[1].subscribed.lock().is_empty());
    }
}
