//! Opportunity lifecycle records.
//!
//! An opportunity is identified by `(instrument, {venue_a, venue_b})` with
//! the venue pair unordered: ids are constructed with the two venue labels
//! sorted lexicographically, so `A↔B` and `B↔A` collapse to one opportunity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{Instrument, Venue};

/// Which leg to buy. Relative to the sorted venue pair of the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    BuyASellB,
    BuyBSellA,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::BuyASellB => "BUY_A_SELL_B",
            Direction::BuyBSellA => "BUY_B_SELL_A",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    BelowThreshold,
    PriceConverged,
    Timeout,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::BelowThreshold => "BELOW_THRESHOLD",
            CloseReason::PriceConverged => "PRICE_CONVERGED",
            CloseReason::Timeout => "TIMEOUT",
            CloseReason::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an opportunity: instrument plus unordered venue pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OpportunityId {
    pub instrument: Instrument,
    pub venue_a: Venue,
    pub venue_b: Venue,
}

impl OpportunityId {
    /// Venue order in the arguments is irrelevant; the pair is stored sorted
    /// by venue label.
    pub fn new(instrument: Instrument, x: Venue, y: Venue) -> Self {
        let (venue_a, venue_b) = if x.as_str() <= y.as_str() { (x, y) } else { (y, x) };
        Self {
            instrument,
            venue_a,
            venue_b,
        }
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.instrument, self.venue_a, self.venue_b)
    }
}

/// Point-in-time spread observation for an opportunity's venue pair.
/// `price_a`/`price_b` follow the id's sorted venue order.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpreadSnapshot {
    pub price_a: f64,
    pub price_b: f64,
    pub spread_abs: f64,
    pub spread_pct: f64,
    pub implied_profit: f64,
    pub direction: Direction,
    pub at: DateTime<Utc>,
}

/// State carried between engine scans while an opportunity is open.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOpportunity {
    pub id: OpportunityId,
    pub open_time: DateTime<Utc>,
    pub last_seen_time: DateTime<Utc>,
    pub opened: SpreadSnapshot,
    pub current: SpreadSnapshot,
    pub peak_spread_pct: f64,
    pub peak_profit: f64,
    pub peak_time: DateTime<Utc>,
    pub alerts_sent: u32,
}

impl ActiveOpportunity {
    /// First qualifying scan: peak initialized to current, one alert counted.
    pub fn open(id: OpportunityId, snapshot: SpreadSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id,
            open_time: now,
            last_seen_time: now,
            opened: snapshot,
            current: snapshot,
            peak_spread_pct: snapshot.spread_pct,
            peak_profit: snapshot.implied_profit,
            peak_time: snapshot.at,
            alerts_sent: 1,
        }
    }

    /// Refresh current fields; peak only ever ratchets upward.
    pub fn update(&mut self, snapshot: SpreadSnapshot, now: DateTime<Utc>) {
        self.current = snapshot;
        self.last_seen_time = now;
        if snapshot.spread_pct > self.peak_spread_pct {
            self.peak_spread_pct = snapshot.spread_pct;
            self.peak_profit = snapshot.implied_profit;
            self.peak_time = snapshot.at;
        }
    }

    pub fn into_closed(self, close_time: DateTime<Utc>, reason: CloseReason) -> ClosedOpportunity {
        ClosedOpportunity {
            id: self.id,
            open_time: self.open_time,
            close_time,
            duration_secs: (close_time - self.open_time).num_seconds().max(0),
            opened: self.opened,
            closed: self.current,
            peak_spread_pct: self.peak_spread_pct,
            peak_profit: self.peak_profit,
            peak_time: self.peak_time,
            close_reason: reason,
            alerts_sent: self.alerts_sent,
        }
    }
}

/// Immutable history record produced on close.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedOpportunity {
    pub id: OpportunityId,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub duration_secs: i64,
    pub opened: SpreadSnapshot,
    pub closed: SpreadSnapshot,
    pub peak_spread_pct: f64,
    pub peak_profit: f64,
    pub peak_time: DateTime<Utc>,
    pub close_reason: CloseReason,
    pub alerts_sent: u32,
}

/// Detection result handed to the alert sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertEvent {
    OpenOrUpdate(ActiveOpportunity),
    Close(ClosedOpportunity),
}

impl AlertEvent {
    /// Higher is more urgent. OPEN_OR_UPDATE uses the current spread,
    /// CLOSE uses the peak.
    pub fn priority(&self) -> u32 {
        let pct = match self {
            AlertEvent::OpenOrUpdate(o) => o.current.spread_pct,
            AlertEvent::Close(c) => c.peak_spread_pct,
        };
        (pct * 10.0).max(0.0).floor() as u32
    }

    pub fn id(&self) -> &OpportunityId {
        match self {
            AlertEvent::OpenOrUpdate(o) => &o.id,
            AlertEvent::Close(c) => &c.id,
        }
    }
}
