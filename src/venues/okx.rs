//! OKX v5 public wire protocol.
//!
//! `tickers` channel keyed by dash-separated instId (`BTC/USDT ↔ BTC-USDT`);
//! plain-text `ping`/`pong` keepalive (the server drops idle connections
//! after 30 s); catalog via `public/instruments`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_tungstenite::connect_async;

use crate::models::{CatalogEntry, Instrument, Venue};
use crate::venues::adapter::{Message, VenueWire, WireTick, WsStream};

const OKX_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const OKX_API_BASE: &str = "https://www.okx.com";
const PING_INTERVAL: Duration = Duration::from_secs(25);

pub struct OkxWire {
    client: reqwest::Client,
}

impl OkxWire {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn op_frame(&self, op: &str, instruments: &[Instrument]) -> Vec<Message> {
        if instruments.is_empty() {
            return Vec::new();
        }
        let args: Vec<serde_json::Value> = instruments
            .iter()
            .map(|i| serde_json::json!({ "channel": "tickers", "instId": self.wire_symbol(i) }))
            .collect();
        let frame = serde_json::json!({ "op": op, "args": args });
        vec![Message::Text(frame.to_string())]
    }
}

#[derive(Debug, Deserialize)]
struct TickerPush {
    #[serde(default)]
    data: Vec<TickerData>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(rename = "instId")]
    inst_id: String,
    last: String,
    #[serde(rename = "high24h")]
    high_24h: Option<String>,
    #[serde(rename = "low24h")]
    low_24h: Option<String>,
    #[serde(rename = "vol24h")]
    vol_24h: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(rename = "baseCcy")]
    base_ccy: String,
    #[serde(rename = "quoteCcy")]
    quote_ccy: String,
    state: String,
    #[serde(rename = "tickSz")]
    tick_sz: Option<String>,
    #[serde(rename = "minSz")]
    min_sz: Option<String>,
}

fn entries_from(data: Vec<InstrumentInfo>) -> Vec<CatalogEntry> {
    data.into_iter()
        .filter(|i| i.state == "live")
        .map(|i| CatalogEntry {
            instrument: Instrument::new(&i.base_ccy, &i.quote_ccy),
            base: i.base_ccy,
            quote: i.quote_ccy,
            tradable: true,
            tick_size: i.tick_sz.and_then(|v| v.parse().ok()),
            min_size: i.min_sz.and_then(|v| v.parse().ok()),
        })
        .collect()
}

#[async_trait]
impl VenueWire for OkxWire {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn wire_symbol(&self, instrument: &Instrument) -> String {
        format!("{}-{}", instrument.base(), instrument.quote())
    }

    fn canonical(&self, symbol: &str) -> Option<Instrument> {
        let (base, quote) = symbol.split_once('-')?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Instrument::new(base, quote))
    }

    async fn connect(&self) -> Result<WsStream> {
        let (stream, _) = connect_async(OKX_WS_URL).await.context("okx ws connect")?;
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
        Message::Text("ping".to_string())
    }

    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>> {
        if text == "pong" {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(text).context("okx frame is not json")?;

        // Event frames ({"event":"subscribe",...}) and non-ticker channels
        // are control traffic.
        let is_ticker = value
            .pointer("/arg/channel")
            .and_then(|c| c.as_str())
            .map(|c| c == "tickers")
            .unwrap_or(false);
        if !is_ticker || value.get("data").is_none() {
            return Ok(Vec::new());
        }

        let push: TickerPush = serde_json::from_value(value).context("malformed okx ticker")?;
        let mut ticks = Vec::with_capacity(push.data.len());
        for data in push.data {
            let Some(instrument) = self.canonical(&data.inst_id) else {
                bail!("unmapped okx instId: {}", data.inst_id);
            };
            let price: f64 = data
                .last
                .parse()
                .context("okx ticker price is not a number")?;
            ticks.push(WireTick {
                instrument,
                price,
                volume: data.vol_24h.and_then(|v| v.parse().ok()),
                high: data.high_24h.and_then(|v| v.parse().ok()),
                low: data.low_24h.and_then(|v| v.parse().ok()),
            });
        }
        Ok(ticks)
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{OKX_API_BASE}/api/v5/public/instruments?instType=SPOT");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("okx instruments request")?;
        if !response.status().is_success() {
            bail!("okx instruments returned {}", response.status());
        }
        let body: InstrumentsResponse = response.json().await.context("okx instruments decode")?;
        if body.code != "0" {
            bail!("okx instruments error {}: {}", body.code, body.msg);
        }
        Ok(entries_from(body.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire() -> OkxWire {
        OkxWire::new(reqwest::Client::new())
    }

    #[test]
    fn symbol_bijection() {
        let w = wire();
        let i = Instrument::new("BTC", "USDT");
        assert_eq!(w.wire_symbol(&i), "BTC-USDT");
        assert_eq!(w.canonical("BTC-USDT"), Some(i));
        assert_eq!(w.canonical("BTCUSDT"), None);
    }

    #[test]
    fn parses_ticker_push() {
        let text = r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},
            "data":[{"instId":"BTC-USDT","last":"50250.1","lastSz":"0.1",
                     "high24h":"50600","low24h":"49200","vol24h":"9000","volCcy24h":"4.5e8","ts":"1700000000000"}]}"#;
        let ticks = wire().parse_text(text).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument, Instrument::new("BTC", "USDT"));
        assert_eq!(ticks[0].price, 50250.1);
        assert_eq!(ticks[0].high, Some(50600.0));
    }

    #[test]
    fn pong_and_events_are_control_frames() {
        let w = wire();
        assert!(w.parse_text("pong").unwrap().is_empty());
        assert!(w
            .parse_text(r#"{"event":"subscribe","arg":{"channel":"tickers","instId":"BTC-USDT"}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn catalog_keeps_live_instruments() {
        let data: Vec<InstrumentInfo> = serde_json::from_str(
            r#"[
                {"instId":"BTC-USDT","baseCcy":"BTC","quoteCcy":"USDT","state":"live","tickSz":"0.1","minSz":"0.00001"},
                {"instId":"OLD-USDT","baseCcy":"OLD","quoteCcy":"USDT","state":"suspend","tickSz":"0.1","minSz":"1"}
            ]"#,
        )
        .unwrap();
        let entries = entries_from(data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].instrument, Instrument::new("BTC", "USDT"));
        assert_eq!(entries[0].tick_size, Some(0.1));
    }
}
