//! Rate-limited adapter failure reporting.
//!
//! Adapters never raise across the subscribe callback boundary; everything
//! they cannot handle in-band lands here, deduplicated so a flapping venue
//! does not spam whatever sink sits behind the notifier.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::models::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    CatalogFetchFailed,
    StreamOpenFailed,
    StreamClosedUnexpectedly,
    ParseFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CatalogFetchFailed => "catalog_fetch_failed",
            FailureKind::StreamOpenFailed => "stream_open_failed",
            FailureKind::StreamClosedUnexpectedly => "stream_closed_unexpectedly",
            FailureKind::ParseFailed => "parse_failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait FailureNotifier: Send + Sync {
    fn notify(&self, venue: Venue, kind: FailureKind, message: &str);
}

/// Notifier that logs deduplicated failures through `tracing`.
///
/// Dedup key is `(venue, kind, message)`; a key that fired within the
/// cooldown window is suppressed.
pub struct LogFailureNotifier {
    cooldown: TimeDelta,
    seen: Mutex<HashMap<(Venue, FailureKind, String), DateTime<Utc>>>,
}

impl LogFailureNotifier {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::minutes(30)),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the key is outside its cooldown window and records
    /// the firing. Exposed for the impl and for tests; `notify` wraps it.
    fn should_fire(&self, venue: Venue, kind: FailureKind, message: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock();

        // Keep the map bounded: prune entries that are past cooldown anyway.
        if seen.len() > 512 {
            let cooldown = self.cooldown;
            seen.retain(|_, fired_at| now - *fired_at <= cooldown);
        }

        let key = (venue, kind, message.to_string());
        match seen.get(&key) {
            Some(fired_at) if now - *fired_at < self.cooldown => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }
}

impl FailureNotifier for LogFailureNotifier {
    fn notify(&self, venue: Venue, kind: FailureKind, message: &str) {
        let now = Utc::now();
        if self.should_fire(venue, kind, message, now) {
            warn!(venue = %venue, kind = %kind, message, "⚠️ venue failure");
        } else {
            debug!(venue = %venue, kind = %kind, "venue failure suppressed (cooldown)");
        }
    }
}
