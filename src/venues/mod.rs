pub mod adapter;
pub mod binance;
pub mod bybit;
pub mod gateio;
pub mod kucoin;
pub mod okx;

use std::collections::HashMap;
use std::sync::Arc;

pub use adapter::{
    AdapterSettings, TickSink, VenueAdapter, VenueWire, WireTick, WsAdapter, WsStream,
};

use crate::alerts::FailureNotifier;
use crate::models::{Config, Venue};

/// One adapter per venue in the closed set.
pub fn build_adapters(
    cfg: &Config,
    client: &reqwest::Client,
    notifier: Arc<dyn FailureNotifier>,
) -> HashMap<Venue, Arc<dyn VenueAdapter>> {
    let settings = AdapterSettings {
        ws_timeout: cfg.ws_timeout,
        reconnect_delay: cfg.reconnect_delay,
        enable_fallbacks: cfg.enable_fallbacks,
        fallback_instruments: cfg.fallback_instruments.clone(),
    };

    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    for venue in Venue::ALL {
        let adapter: Arc<dyn VenueAdapter> = match venue {
            Venue::Binance => Arc::new(WsAdapter::new(
                binance::BinanceWire::new(client.clone()),
                settings.clone(),
                notifier.clone(),
            )),
            Venue::Bybit => Arc::new(WsAdapter::new(
                bybit::BybitWire::new(client.clone()),
                settings.clone(),
                notifier.clone(),
            )),
            Venue::Okx => Arc::new(WsAdapter::new(
                okx::OkxWire::new(client.clone()),
                settings.clone(),
                notifier.clone(),
            )),
            Venue::Gateio => Arc::new(WsAdapter::new(
                gateio::GateioWire::new(client.clone()),
                settings.clone(),
                notifier.clone(),
            )),
            Venue::Kucoin => Arc::new(WsAdapter::new(
                kucoin::KucoinWire::new(client.clone()),
                settings.clone(),
                notifier.clone(),
            )),
        };
        adapters.insert(venue, adapter);
    }
    adapters
}
