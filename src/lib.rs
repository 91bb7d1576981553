//! Spreadbot Backend Library
//!
//! Real-time cross-venue price-spread detection: venue adapters normalize
//! streaming tickers into a shared price store, and a periodic engine turns
//! cross-venue spreads into alert events with an open/update/close lifecycle.

pub mod alerts;
pub mod catalog;
pub mod engine;
pub mod health;
pub mod models;
pub mod store;
pub mod venues;

pub use models::{Config, Instrument, Tick, Venue};
