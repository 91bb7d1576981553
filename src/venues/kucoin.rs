//! KuCoin wire protocol.
//!
//! KuCoin gates its public websocket behind the bullet-public handshake: a
//! POST returns a token plus the instance endpoint, and the socket URL is
//! built from both. Tickers arrive on `/market/ticker:<SYMS>` (dash pairs,
//! `BTC/USDT ↔ BTC-USDT`); keepalive is a JSON ping; catalog via `symbols`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_tungstenite::connect_async;

use crate::models::{CatalogEntry, Instrument, Venue};
use crate::venues::adapter::{Message, VenueWire, WireTick, WsStream};

const KUCOIN_API_BASE: &str = "https://api.kucoin.com";
const TICKER_TOPIC: &str = "/market/ticker";
const PING_INTERVAL: Duration = Duration::from_secs(15);

pub struct KucoinWire {
    client: reqwest::Client,
}

impl KucoinWire {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn topic_frame(&self, kind: &str, instruments: &[Instrument]) -> Vec<Message> {
        if instruments.is_empty() {
            return Vec::new();
        }
        let symbols: Vec<String> = instruments.iter().map(|i| self.wire_symbol(i)).collect();
        let frame = serde_json::json!({
            "id": Utc::now().timestamp_millis().to_string(),
            "type": kind,
            "topic": format!("{TICKER_TOPIC}:{}", symbols.join(",")),
            "privateChannel": false,
            "response": true,
        });
        vec![Message::Text(frame.to_string())]
    }

    async fn bullet_public(&self) -> Result<(String, String)> {
        let url = format!("{KUCOIN_API_BASE}/api/v1/bullet-public");
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .context("kucoin bullet-public request")?;
        if !response.status().is_success() {
            bail!("kucoin bullet-public returned {}", response.status());
        }
        let body: BulletResponse = response.json().await.context("kucoin bullet-public decode")?;
        if body.code != "200000" {
            bail!("kucoin bullet-public error code {}", body.code);
        }
        let server = body
            .data
            .instance_servers
            .into_iter()
            .next()
            .context("kucoin bullet-public returned no instance servers")?;
        Ok((server.endpoint, body.data.token))
    }
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    code: String,
    data: BulletData,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
    #[serde(rename = "instanceServers")]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
struct InstanceServer {
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TickerMessage {
    topic: String,
    data: TickerData,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    price: String,
}

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    code: String,
    #[serde(default)]
    data: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    #[serde(rename = "baseCurrency")]
    base_currency: String,
    #[serde(rename = "quoteCurrency")]
    quote_currency: String,
    #[serde(rename = "enableTrading")]
    enable_trading: bool,
    #[serde(rename = "priceIncrement")]
    price_increment: Option<String>,
    #[serde(rename = "baseMinSize")]
    base_min_size: Option<String>,
}

fn entries_from(data: Vec<SymbolInfo>) -> Vec<CatalogEntry> {
    data.into_iter()
        .filter(|s| s.enable_trading)
        .map(|s| CatalogEntry {
            instrument: Instrument::new(&s.base_currency, &s.quote_currency),
            base: s.base_currency,
            quote: s.quote_currency,
            tradable: true,
            tick_size: s.price_increment.and_then(|v| v.parse().ok()),
            min_size: s.base_min_size.and_then(|v| v.parse().ok()),
        })
        .collect()
}

#[async_trait]
impl VenueWire for KucoinWire {
    fn venue(&self) -> Venue {
        Venue::Kucoin
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
        let (endpoint, token) = self.bullet_public().await?;
        let url = format!(
            "{}?token={}&connectId={}",
            endpoint.trim_end_matches('/'),
            token,
            Utc::now().timestamp_millis()
        );
        let (stream, _) = connect_async(&url).await.context("kucoin ws connect")?;
        Ok(stream)
    }

    fn subscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.topic_frame("subscribe", instruments)
    }

    fn unsubscribe_frames(&self, instruments: &[Instrument]) -> Vec<Message> {
        self.topic_frame("unsubscribe", instruments)
    }

    fn ping_interval(&self) -> Option<Duration> {
        Some(PING_INTERVAL)
    }

    fn ping_frame(&self) -> Message {
        let frame = serde_json::json!({
            "id": Utc::now().timestamp_millis().to_string(),
            "type": "ping",
        });
        Message::Text(frame.to_string())
    }

    fn parse_text(&self, text: &str) -> Result<Vec<WireTick>> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("kucoin frame is not json")?;

        // welcome / ack / pong frames carry their own "type".
        let is_ticker = value.get("type").and_then(|t| t.as_str()) == Some("message")
            && value
                .get("topic")
                .and_then(|t| t.as_str())
                .map(|t| t.starts_with(TICKER_TOPIC))
                .unwrap_or(false);
        if !is_ticker {
            return Ok(Vec::new());
        }

        let msg: TickerMessage = serde_json::from_value(value).context("malformed kucoin ticker")?;
        let symbol = msg
            .topic
            .rsplit_once(':')
            .map(|(_, s)| s)
            .unwrap_or_default();
        let Some(instrument) = self.canonical(symbol) else {
            bail!("unmapped kucoin symbol: {symbol}");
        };
        let price: f64 = msg
            .data
            .price
            .parse()
            .context("kucoin ticker price is not a number")?;

        // The ticker topic carries trade prices only; 24h stats live on a
        // different topic.
        Ok(vec![WireTick {
            instrument,
            price,
            volume: None,
            high: None,
            low: None,
        }])
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{KUCOIN_API_BASE}/api/v1/symbols");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("kucoin symbols request")?;
        if !response.status().is_success() {
            bail!("kucoin symbols returned {}", response.status());
        }
        let body: SymbolsResponse = response.json().await.context("kucoin symbols decode")?;
        if body.code != "200000" {
            bail!("kucoin symbols error code {}", body.code);
        }
        Ok(entries_from(body.data))
    }
}
