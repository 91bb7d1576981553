//! Binance spot wire protocol.
//!
//! Ticker stream over the raw `/ws` endpoint with dynamic SUBSCRIBE frames;
//! catalog via `exchangeInfo`. Wire symbols are concatenated upper-case
//! (`BTC/USDT ↔ BTCUSDT`).

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::connect_async;

use crate::models::{CatalogEntry, Instrument, Venue};
use crate::venues::adapter::{Message, VenueWire, WireTick, WsStream};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const BINANCE_API_BASE: &str = "https://api.binance.com";

// Quote assets recognized when splitting a concatenated wire symbol.
const KNOWN_QUOTES: [&str; 8] = ["USDT", "FDUSD", "USDC", "TUSD", "BUSD", "BTC", "ETH", "BNB"];

pub struct BinanceWire {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl BinanceWire {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }

    fn method_frame(&self, method: &str, instruments: &[Instrument]) -> Vec<Message> {
        if instruments.is_empty() {
            return Vec::new();
        }
        let params: Vec<String> = instruments
            .iter()
            .map(|i| format!("{}@ticker", self.wire_symbol(i).to_ascii_lowercase()))
            .collect();
        let frame = serde_json::json!({
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        vec![Message::Text(frame.to_string())]
    }
}

/// 24hr ticker event (`e` = `24hrTicker`); numbers arrive as strings.
#[derive(Debug, Deserialize)]
struct TickerFrame {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "h")]
    high: Option<String>,
    #[serde(rename = "l")]
    low: Option<String>,
    #[serde(rename = "v")]
    volume: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    status: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
struct SymbolFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
}

fn entries_from(info: ExchangeInfo) -> Vec<CatalogEntry> {
    info.symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| {
            let tick_size = s
                .filters
                .iter()
                .find(|f| f.filter_type == "PRICE_FILTER")
                .and_then(|f| f.tick_size.as_deref())
                .and_then(|v| v.parse().ok());
            let min_size = s
                .filters
                .iter()
                .find(|f| f.filter_type == "LOT_SIZE")
                .and_then(|f| f.min_qty.as_deref())
                .and_then(|v| v.parse().ok());

            CatalogEntry {
                instrument: Instrument::new(&s.base_asset, &s.quote_asset),
                base: s.base_asset,
                quote: s.quote_asset,
                tradable: true,
                tick_size,
                min_size,
            }
        })
        .collect()
}

#[async_trait]
impl VenueWire for BinanceWire {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn wire_symbol(&self, instrument: &Instrument) -> String {
        format!("{}{}", instrument.base(), instrument.quote())
    }

    fn canonical(&self, symbol: &str) -> Option<Instrument> {
        let upper = symbol.to_ascii_uppercase();
        KNOWN_QUOTES.iter().find_map(|quote| {
            upper
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| Instrument::new(base, quote))
        })
    }

    async fn connect(&self) -> Result<WsStream> {
        let (stream, _) = connect_async(BINANCE_WS_URL)
            .await
            .context("binance ws connect")?;
        Ok(stream)
    }

    fn subscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.method_frame("SUBSCRIBE", instruments)
    }

    fn unsubscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.method_frame("UNSUBSCRIBE", instruments)
    }

    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("binance frame is not json")?;

        // Method acks look like {"result":null,"id":1}; other event types
        // pass through untouched.
        if value.get("e").and_then(|e| e.as_str()) != Some("24hrTicker") {
            return Ok(Vec::new());
        }

        let frame: TickerFrame =
            serde_json::from_value(value).context("malformed binance ticker")?;
        let Some(instrument) = self.canonical(&frame.symbol) else {
            bail!("unmapped binance symbol: {}", frame.symbol);
        };
        let price: f64 = frame
            .last_price
            .parse()
            .context("binance ticker price is not a number")?;

        Ok(vec![WireTick {
            instrument,
            price,
            volume: frame.volume.and_then(|v| v.parse().ok()),
            high: frame.high.and_then(|v| v.parse().ok()),
            low: frame.low.and_then(|v| v.parse().ok()),
        }])
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{BINANCE_API_BASE}/api/v3/exchangeInfo");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("binance exchangeInfo request")?;
        if !response.status().is_success() {
            bail!("binance exchangeInfo returned {}", response.status());
        }
        let info: ExchangeInfo = response
            .json()
            .await
            .context("binance exchangeInfo decode")?;
        Ok(entries_from(info))
    }
}
