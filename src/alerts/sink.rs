//! Alert egress.
//!
//! The engine never formats user-visible messages; it enqueues `AlertEvent`s
//! into an [`AlertSink`] and moves on. The shipped [`QueueSink`] is a bounded
//! in-process queue whose drain task logs formatted events, standing in for
//! the out-of-process notification gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::info;

use crate::engine::opportunity::AlertEvent;

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Hand one event to the delivery queue. `retries` is the budget for
    /// transient backpressure; a terminal failure is the caller's problem
    /// to log and drop.
    async fn enqueue(&self, event: AlertEvent, priority: u32, retries: u32) -> Result<()>;
}

#[derive(Debug)]
pub struct QueuedAlert {
    pub event: AlertEvent,
    pub priority: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Bounded mpsc-backed sink. `try_send` keeps the engine's scan task from
/// parking on a slow consumer; under backpressure it retries after a short
/// pause until the budget runs out.
pub struct QueueSink {
    tx: mpsc::Sender<QueuedAlert>,
    retry_delay: Duration,
}

impl QueueSink {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<QueuedAlert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                tx,
                retry_delay: Duration::from_millis(100),
            }),
            rx,
        )
    }
}

#[async_trait]
impl AlertSink for QueueSink {
    async fn enqueue(&self, event: AlertEvent, priority: u32, retries: u32) -> Result<()> {
        let mut item = QueuedAlert {
            event,
            priority,
            enqueued_at: Utc::now(),
        };

        let mut attempts = 0u32;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if attempts >= retries {
                        bail!("alert queue full after {attempts} retries");
                    }
                    attempts += 1;
                    item = back;
                    sleep(self.retry_delay).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    bail!("alert queue closed");
                }
            }
        }
    }
}

/// Consume the queue and log every event. Stand-in for the chat gateway.
pub async fn drain_logged(mut rx: mpsc::Receiver<QueuedAlert>) {
    while let Some(alert) = rx.recv().await {
        match &alert.event {
            AlertEvent::OpenOrUpdate(o) => {
                info!(
                    id = %o.id,
                    spread_pct = format!("{:.3}", o.current.spread_pct),
                    direction = o.current.direction.as_str(),
                    implied_profit = format!("{:.2}", o.current.implied_profit),
                    alerts_sent = o.alerts_sent,
                    priority = alert.priority,
                    "📣 spread opportunity"
                );
            }
            AlertEvent::Close(c) => {
                info!(
                    id = %c.id,
                    reason = %c.close_reason,
                    duration_secs = c.duration_secs,
                    peak_spread_pct = format!("{:.3}", c.peak_spread_pct),
                    alerts_sent = c.alerts_sent,
                    priority = alert.priority,
                    "spread opportunity closed"
                );
            }
        }
    }
}
