//! Bybit v5 spot wire protocol.
//!
//! Public spot stream with `tickers.<SYMBOL>` topics; client-side
//! `{"op":"ping"}` keepalive; catalog via `instruments-info`. Wire symbols
//! match Binance's concatenated form (`BTC/USDT ↔ BTCUSDT`).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::connect_async;

use crate::models::{CatalogEntry, Instrument, Venue};
use crate::venues::adapter::{Message, VenueWire, WireTick, WsStream};

const BYBIT_WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const BYBIT_API_BASE: &str = "https://api.bybit.com";
const PING_INTERVAL: Duration = Duration::from_secs(20);

const KNOWN_QUOTES: [&str; 6] = ["USDT", "USDC", "EUR", "BTC", "ETH", "DAI"];

pub struct BybitWire {
    client: reqwest::Client,
}

impl BybitWire {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn op_frame(&self, op: &str, instruments: &[Instrument]) -> Vec<Message> {
        if instruments.is_empty() {
            return Vec::new();
        }
        let args: Vec<String> = instruments
            .iter()
            .map(|i| format!("tickers.{}", self.wire_symbol(i)))
            .collect();
        let frame = serde_json::json!({ "op": op, "args": args });
        vec![Message::Text(frame.to_string())]
    }
}

#[derive(Debug, Deserialize)]
struct TickerPush {
    topic: String,
    data: TickerData,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "highPrice24h")]
    high_24h: Option<String>,
    #[serde(rename = "lowPrice24h")]
    low_24h: Option<String>,
    #[serde(rename = "volume24h")]
    volume_24h: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: InstrumentsResult,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    status: String,
    #[serde(rename = "priceFilter", default)]
    price_filter: Option<PriceFilter>,
    #[serde(rename = "lotSizeFilter", default)]
    lot_size_filter: Option<LotSizeFilter>,
}

#[derive(Debug, Deserialize)]
struct PriceFilter {
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LotSizeFilter {
    #[serde(rename = "minOrderQty")]
    min_order_qty: Option<String>,
}

fn entries_from(result: InstrumentsResult) -> Vec<CatalogEntry> {
    result
        .list
        .into_iter()
        .filter(|i| i.status == "Trading")
        .map(|i| CatalogEntry {
            instrument: Instrument::new(&i.base_coin, &i.quote_coin),
            base: i.base_coin,
            quote: i.quote_coin,
            tradable: true,
            tick_size: i
                .price_filter
                .and_then(|f| f.tick_size)
                .and_then(|v| v.parse().ok()),
            min_size: i
                .lot_size_filter
                .and_then(|f| f.min_order_qty)
                .and_then(|v| v.parse().ok()),
        })
        .collect()
}

#[async_trait]
impl VenueWire for BybitWire {
    fn venue(&self) -> Venue {
        Venue::Bybit
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
        let (stream, _) = connect_async(BYBIT_WS_URL)
            .await
            .context("bybit ws connect")?;
        Ok(stream)
    }

    fn subscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.op_frame("subscribe", instruments)
    }

    fn unsubscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.op_frame("unsubscribe", instruments)
    }

    fn ping_interval(&self) -> Option<Duration> {
        Some(PING_INTERVAL)
    }

    fn ping_frame(&self) -> Message {
        Message::Text(serde_json::json!({ "op": "ping" }).to_string())
    }

    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("bybit frame is not json")?;

        // Op responses ({"op":"subscribe","success":true}, pongs) and other
        // topics are control traffic.
        let is_ticker = value
            .get("topic")
            .and_then(|t| t.as_str())
            .map(|t| t.starts_with("tickers."))
            .unwrap_or(false);
        if !is_ticker {
            return Ok(Vec::new());
        }

        let push: TickerPush = serde_json::from_value(value).context("malformed bybit ticker")?;
        let symbol = push.topic.trim_start_matches("tickers.");
        let Some(instrument) = self.canonical(symbol) else {
            bail!("unmapped bybit symbol: {symbol}");
        };
        let price: f64 = push
            .data
            .last_price
            .parse()
            .context("bybit ticker price is not a number")?;

        Ok(vec![WireTick {
            instrument,
            price,
            volume: push.data.volume_24h.and_then(|v| v.parse().ok()),
            high: push.data.high_24h.and_then(|v| v.parse().ok()),
            low: push.data.low_24h.and_then(|v| v.parse().ok()),
        }])
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{BYBIT_API_BASE}/v5/market/instruments-info?category=spot&limit=1000");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("bybit instruments-info request")?;
        if !response.status().is_success() {
            bail!("bybit instruments-info returned {}", response.status());
        }
        let body: InstrumentsResponse = response
            .json()
            .await
            .context("bybit instruments-info decode")?;
        if body.ret_code != 0 {
            bail!("bybit instruments-info error {}: {}", body.ret_code, body.ret_msg);
        }
        Ok(entries_from(body.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire() -> BybitWire {
        BybitWire::new(reqwest::Client::new())
    }

    #[test]
    fn symbol_bijection() {
        let w = wire();
        let i = Instrument::new("SOL", "USDT");
        assert_eq!(w.wire_symbol(&i), "SOLUSDT");
        assert_eq!(w.canonical("SOLUSDT"), Some(i));
    }

    #[test]
    fn parses_ticker_push() {
        let text = r#"{"topic":"tickers.BTCUSDT","ts":1700000000000,"type":"snapshot",
            "data":{"symbol":"BTCUSDT","lastPrice":"50250.1","highPrice24h":"50600",
                    "lowPrice24h":"49200","volume24h":"8000.5","turnover24h":"4.0e8"}}"#;
        let ticks = wire().parse_text(text).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument, Instrument::new("BTC", "USDT"));
        assert_eq!(ticks[0].price, 50250.1);
        assert_eq!(ticks[0].low, Some(49200.0));
    }

    #[test]
    fn op_responses_are_control_frames() {
        let w = wire();
        assert!(w
            .parse_text(r#"{"op":"subscribe","success":true,"conn_id":"abc"}"#)
            .unwrap()
            .is_empty());
        assert!(w
            .parse_text(r#"{"op":"pong","args":["1700000000000"]}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn catalog_filters_non_trading() {
        let raw = r#"{
            "list": [
                {"symbol":"BTCUSDT","baseCoin":"BTC","quoteCoin":"USDT","status":"Trading",
                 "priceFilter":{"tickSize":"0.01"},"lotSizeFilter":{"minOrderQty":"0.00004"}},
                {"symbol":"XYZUSDT","baseCoin":"XYZ","quoteCoin":"USDT","status":"Closed"}
            ]
        }"#;
        let result: InstrumentsResult = serde_json::from_str(raw).unwrap();
        let entries = entries_from(result);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tick_size, Some(0.01));
        assert_eq!(entries[0].min_size, Some(0.00004));
    }
}
