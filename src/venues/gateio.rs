//! Gate.io v4 wire protocol.
//!
//! `spot.tickers` channel with underscore pairs (`BTC/USDT ↔ BTC_USDT`);
//! application-level `spot.ping` keepalive; catalog via `spot/currency_pairs`.
//! Price precision arrives as decimal places, converted to a tick size.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_tungstenite::connect_async;

use crate::models::{CatalogEntry, Instrument, Venue};
use crate::venues::adapter::{Message, VenueWire, WireTick, WsStream};

const GATEIO_WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const GATEIO_API_BASE: &str = "https://api.gateio.ws/api/v4";
const PING_INTERVAL: Duration = Duration::from_secs(15);

pub struct GateioWire {
    client: reqwest::Client,
}

impl GateioWire {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn event_frame(&self, event: &str, instruments: &[Instrument]) -> Vec<Message> {
        if instruments.is_empty() {
            return Vec::new();
        }
        let payload: Vec<String> = instruments.iter().map(|i| self.wire_symbol(i)).collect();
        let frame = serde_json::json!({
            "time": Utc::now().timestamp(),
            "channel": "spot.tickers",
            "event": event,
            "payload": payload,
        });
        vec![Message::Text(frame.to_string())]
    }
}

#[derive(Debug, Deserialize)]
struct TickerUpdate {
    result: TickerResult,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    currency_pair: String,
    last: String,
    #[serde(rename = "high_24h")]
    high_24h: Option<String>,
    #[serde(rename = "low_24h")]
    low_24h: Option<String>,
    #[serde(rename = "base_volume")]
    base_volume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrencyPair {
    base: String,
    quote: String,
    trade_status: String,
    #[serde(default)]
    precision: Option<i32>,
    #[serde(rename = "min_base_amount")]
    min_base_amount: Option<String>,
}

fn entries_from(pairs: Vec<CurrencyPair>) -> Vec<CatalogEntry> {
    pairs
        .into_iter()
        .filter(|p| p.trade_status == "tradable")
        .map(|p| CatalogEntry {
            instrument: Instrument::new(&p.base, &p.quote),
            base: p.base,
            quote: p.quote,
            tradable: true,
            tick_size: p.precision.map(|places| 10f64.powi(-places)),
            min_size: p.min_base_amount.and_then(|v| v.parse().ok()),
        })
        .collect()
}

#[async_trait]
impl VenueWire for GateioWire {
    fn venue(&self) -> Venue {
        Venue::Gateio
    }

    fn wire_symbol(&self, instrument: &Instrument) -> String {
        format!("{}_{}", instrument.base(), instrument.quote())
    }

    fn canonical(&self, symbol: &str) -> Option<Instrument> {
        let (base, quote) = symbol.split_once('_')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Instrument::new(base, quote))
    }

    async fn connect(&self) -> Result<WsStream> {
        let (stream, _) = connect_async(GATEIO_WS_URL)
            .await
            .context("gateio ws connect")?;
        Ok(stream)
    }

    fn subscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.event_frame("subscribe", instruments)
    }

    fn unsubscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.event_frame("unsubscribe", instruments)
    }

    fn ping_interval(&self) -> Option<Duration> {
        Some(PING_INTERVAL)
    }

    fn ping_frame(&self) -> Message {
        let frame = serde_json::json!({
            "time": Utc::now().timestamp(),
            "channel": "spot.ping",
        });
        Message::Text(frame.to_string())
    }

    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("gateio frame is not json")?;

        // Subscribe acks carry event "subscribe"; pongs come back on
        // spot.pong. Only ticker updates carry prices.
        let channel = value.get("channel").and_then(|c| c.as_str()).unwrap_or("");
        let event = value.get("event").and_then(|e| e.as_str()).unwrap_or("");
        if channel != "spot.tickers" || event != "update" {
            return Ok(Vec::new());
        }

        let update: TickerUpdate =
            serde_json::from_value(value).context("malformed gateio ticker")?;
        let Some(instrument) = self.canonical(&update.result.currency_pair) else {
            bail!("unmapped gateio pair: {}", update.result.currency_pair);
        };
        let price: f64 = update
            .result
            .last
            .parse()
            .context("gateio ticker price is not a number")?;

        Ok(vec![WireTick {
            instrument,
            price,
            volume: update.result.base_volume.and_then(|v| v.parse().ok()),
            high: update.result.high_24h.and_then(|v| v.parse().ok()),
            low: update.result.low_24h.and_then(|v| v.parse().ok()),
        }])
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{GATEIO_API_BASE}/spot/currency_pairs");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("gateio currency_pairs request")?;
        if !response.status().is_success() {
            bail!("gateio currency_pairs returned {}", response.status());
        }
        let pairs: Vec<CurrencyPair> = response
            .json()
            .await
            .context("gateio currency_pairs decode")?;
        Ok(entries_from(pairs))
    }
}
