//! Pairwise spread math.

use crate::engine::opportunity::{Direction, SpreadSnapshot};
use crate::models::Tick;

/// Compute the spread snapshot for a venue pair. `a` and `b` must already be
/// in the id's sorted venue order so the direction reads correctly.
///
/// Returns `None` when either price is invalid or any derived value fails to
/// be finite; such pairs never reach the state machine.
pub fn compute_spread(a: &Tick, b: &Tick, notional_units: f64) -> Option<SpreadSnapshot> {
    if !a.has_valid_price() || !b.has_valid_price() {
        return None;
    }

    let spread_abs = (a.price - b.price).abs();
    let mid_price = (a.price + b.price) / 2.0;
    let spread_pct = 100.0 * spread_abs / mid_price;
    let implied_profit = spread_abs * notional_units;

    if !spread_abs.is_finite() || !spread_pct.is_finite() || !implied_profit.is_finite() {
        return None;
    }

    let direction = if a.price < b.price {
        Direction::BuyASellB
    } else {
        Direction::BuyBSellA
    };

    Some(SpreadSnapshot {
        price_a: a.price,
        price_b: b.price,
        spread_abs,
        spread_pct,
        implied_profit,
        direction,
        at: a.ingest_time.max(b.ingest_time),
    })
}
