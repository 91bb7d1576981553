use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading venues with a live adapter. Closed set, known at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Okx,
    Gateio,
    Kucoin,
}

impl Venue {
    pub const ALL: [Venue; 5] = [
        Venue::Binance,
        Venue::Bybit,
        Venue::Okx,
        Venue::Gateio,
        Venue::Kucoin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Okx => "okx",
            Venue::Gateio => "gateio",
            Venue::Kucoin => "kucoin",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Venue::Binance),
            "bybit" => Ok(Venue::Bybit),
            "okx" => Ok(Venue::Okx),
            "gateio" | "gate" => Ok(Venue::Gateio),
            "kucoin" => Ok(Venue::Kucoin),
            other => bail!("unknown venue: {other}"),
        }
    }
}

/// Canonical trading pair identifier, always `BASE/QUOTE` upper-case.
///
/// This is the only instrument form used inside the core; each venue adapter
/// owns the bijection to its wire symbol (`BTCUSDT`, `BTC-USDT`, `BTC_USDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(base: &str, quote: &str) -> Self {
        Self(format!(
            "{}/{}",
            base.trim().to_ascii_uppercase(),
            quote.trim().to_ascii_uppercase()
        ))
    }

    /// Parse a canonical `BASE/QUOTE` string. Case-insensitive input.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('/')?;
        let base = base.trim();
        let quote = quote.trim();
        if base.is_empty() || quote.is_empty() || quote.contains('/') {
            return None;
        }
        Some(Self::new(base, quote))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn base(&self) -> &str {
        self.0.split_once('/').map(|(b, _)| b).unwrap_or(&self.0)
    }

    pub fn quote(&self) -> &str {
        self.0.split_once('/').map(|(_, q)| q).unwrap_or("")
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One normalized price observation for an (instrument, venue).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tick {
    pub instrument: Instrument,
    pub venue: Venue,
    pub price: f64,
    pub ingest_time: DateTime<Utc>,
    pub volume: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
}

impl Tick {
    /// Adapters must drop anything that fails this before it reaches a sink.
    pub fn has_valid_price(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

/// One tradable instrument from a venue catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub instrument: Instrument,
    pub base: String,
    pub quote: String,
    pub tradable: bool,
    pub tick_size: Option<f64>,
    pub min_size: Option<f64>,
}

impl CatalogEntry {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            instrument: Instrument::new(base, quote),
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
            tradable: true,
            tick_size: None,
            min_size: None,
        }
    }
}

/// Read-only adapter status, consumed by the health monitor and status views.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VenueStatus {
    pub connected: bool,
    pub connection_count: usize,
    pub subscribed: Vec<Instrument>,
    pub last_error: Option<String>,
}

/// Application configuration
///
/// One immutable value constructed at startup; components receive only the
/// fields they need.
#[derive(Debug, Clone)]
pub struct Config {
    pub scan_interval: Duration,
    pub open_threshold_pct: f64,
    pub close_threshold_pct: f64,
    pub alert_cooldown: Duration,
    pub min_profit: f64,
    pub notional_units: f64,
    pub min_close_alert_duration: Duration,
    pub max_opportunity_age: Duration,
    pub enable_close_alerts: bool,
    pub stale_after: Duration,
    pub drop_after: Duration,
    pub history_size: usize,
    pub closed_history_size: usize,
    pub min_venues_per_instrument: usize,
    pub quote_filter: String,
    pub enable_fallbacks: bool,
    pub fallback_instruments: Vec<Instrument>,
    pub ws_timeout: Duration,
    pub reconnect_delay: Duration,
    pub failure_cooldown: Duration,
    pub health_interval: Duration,
    pub alert_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let fallback_instruments = std::env::var("FALLBACK_INSTRUMENTS")
            .unwrap_or_else(|_| "BTC/USDT,ETH/USDT,SOL/USDT,XRP/USDT,BNB/USDT".to_string())
            .split(',')
            .filter_map(|s| Instrument::parse(s.trim()))
            .collect();

        Ok(Self {
            scan_interval: Duration::from_secs(env_u64("SCAN_INTERVAL_SECS", 10)),
            open_threshold_pct: env_f64("OPEN_THRESHOLD_PCT", 0.7),
            close_threshold_pct: env_f64("CLOSE_THRESHOLD_PCT", 0.5),
            alert_cooldown: Duration::from_secs(env_u64("ALERT_COOLDOWN_SECS", 300)),
            min_profit: env_f64("MIN_PROFIT", 10.0),
            notional_units: env_f64("NOTIONAL_UNITS", 1000.0),
            min_close_alert_duration: Duration::from_secs(env_u64(
                "MIN_CLOSE_ALERT_DURATION_SECS",
                120,
            )),
            max_opportunity_age: Duration::from_secs(env_u64("MAX_OPPORTUNITY_AGE_SECS", 7200)),
            enable_close_alerts: env_bool("ENABLE_CLOSE_ALERTS", true),
            stale_after: Duration::from_secs(env_u64("STALE_AFTER_SECS", 60)),
            drop_after: Duration::from_secs(env_u64("DROP_AFTER_SECS", 300)),
            history_size: env_u64("HISTORY_SIZE", 100) as usize,
            closed_history_size: env_u64("CLOSED_HISTORY_SIZE", 1000) as usize,
            min_venues_per_instrument: env_u64("MIN_VENUES_PER_INSTRUMENT", 2) as usize,
            quote_filter: std::env::var("QUOTE_FILTER")
                .unwrap_or_else(|_| "USDT".to_string())
                .to_ascii_uppercase(),
            enable_fallbacks: env_bool("ENABLE_FALLBACKS", true),
            fallback_instruments,
            ws_timeout: Duration::from_secs(env_u64("WS_TIMEOUT_SECS", 10)),
            reconnect_delay: Duration::from_secs(env_u64("RECONNECT_DELAY_SECS", 5)),
            failure_cooldown: Duration::from_secs(env_u64("FAILURE_COOLDOWN_SECS", 1800)),
            health_interval: Duration::from_secs(env_u64("HEALTH_INTERVAL_SECS", 300)),
            alert_queue_capacity: env_u64("ALERT_QUEUE_CAPACITY", 1024) as usize,
        })
    }

    /// Reject nonsensical thresholds at startup rather than mid-scan.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("OPEN_THRESHOLD_PCT", self.open_threshold_pct),
            ("CLOSE_THRESHOLD_PCT", self.close_threshold_pct),
            ("MIN_PROFIT", self.min_profit),
            ("NOTIONAL_UNITS", self.notional_units),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("configuration error: {name} must be finite and non-negative, got {value}");
            }
        }
        if self.close_threshold_pct > self.open_threshold_pct {
            bail!(
                "configuration error: CLOSE_THRESHOLD_PCT ({}) must not exceed OPEN_THRESHOLD_PCT ({})",
                self.close_threshold_pct,
                self.open_threshold_pct
            );
        }
        if self.history_size == 0 {
            bail!("configuration error: HISTORY_SIZE must be at least 1");
        }
        if self.min_venues_per_instrument < 2 {
            bail!("configuration error: MIN_VENUES_PER_INSTRUMENT must be at least 2");
        }
        if self.scan_interval.is_zero() {
            bail!("configuration error: SCAN_INTERVAL_SECS must be positive");
        }
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_parse_canonicalizes() {
        let i = Instrument::parse("btc/usdt").unwrap();
        assert_eq!(i.as_str(), "BTC/USDT");
        assert_eq!(i.base(), "BTC");
        assert_eq!(i.quote(), "USDT");
    }

    #[test]
    fn instrument_parse_rejects_garbage() {
        assert!(Instrument::parse("BTCUSDT").is_none());
        assert!(Instrument::parse("/USDT").is_none());
        assert!(Instrument::parse("BTC/").is_none());
        assert!(Instrument::parse("BTC/USDT/X").is_none());
    }

    #[test]
    fn venue_round_trips_through_str() {
        for v in Venue::ALL {
            assert_eq!(v.as_str().parse::<Venue>().unwrap(), v);
        }
    }

    #[test]
    fn tick_price_validity() {
        let mut tick = Tick {
            instrument: Instrument::new("BTC", "USDT"),
            venue: Venue::Binance,
            price: 50_000.0,
            ingest_time: Utc::now(),
            volume: None,
            high: None,
            low: None,
        };
        assert!(tick.has_valid_price());

        tick.price = 0.0;
        assert!(!tick.has_valid_price());
        tick.price = -1.0;
        assert!(!tick.has_valid_price());
        tick.price = f64::NAN;
        assert!(!tick.has_valid_price());
        tick.price = f64::INFINITY;
        assert!(!tick.has_valid_price());
    }

    #[test]
    fn config_validation_rejects_inverted_band() {
        let mut cfg = Config::from_env().unwrap();
        assert!(cfg.validate().is_ok());

        cfg.close_threshold_pct = cfg.open_threshold_pct + 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_nan_threshold() {
        let mut cfg = Config::from_env().unwrap();
        cfg.open_threshold_pct = f64::NAN;
        assert!(cfg.validate().is_err());
    }
}
