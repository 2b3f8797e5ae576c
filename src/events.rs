// src/events.rs
//! Structured status events for an external observability layer.
//!
//! Emission goes through a broadcast channel: it never blocks and never fails
//! the caller. Slow subscribers lag and lose the oldest events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ErrorCategory, Severity};
use crate::ledger::SuppressionReason;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "schedule.fired")]
    ScheduleFired { at: DateTime<Utc>, fire_count: u64 },

    #[serde(rename = "schedule.woke")]
    ScheduleWoke {
        at: DateTime<Utc>,
        /// Seconds since the last fire (or start) when the gap was detected.
        gap_secs: u64,
    },

    #[serde(rename = "suppression.blocked")]
    SuppressionBlocked {
        platform: String,
        platform_id: String,
        reason: SuppressionReason,
    },

    #[serde(rename = "engagement.recorded")]
    EngagementRecorded {
        record_id: String,
        platform: String,
        platform_id: String,
    },

    #[serde(rename = "engagement.failed")]
    EngagementFailed {
        platform: String,
        platform_id: String,
        category: ErrorCategory,
        attempts: u32,
        elapsed_ms: u64,
    },

    #[serde(rename = "error.classified")]
    ErrorClassified {
        operation: String,
        category: ErrorCategory,
        severity: Severity,
        retryable: bool,
        attempt: u32,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ScheduleFired { .. } => "schedule.fired",
            EngineEvent::ScheduleWoke { .. } => "schedule.woke",
            EngineEvent::SuppressionBlocked { .. } => "suppression.blocked",
            EngineEvent::EngagementRecorded { .. } => "engagement.recorded",
            EngineEvent::EngagementFailed { .. } => "engagement.failed",
            EngineEvent::ErrorClassified { .. } => "error.classified",
        }
    }
}

/// Cloneable, non-blocking event emitter.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        debug!(target: "events", event = event.name(), "emit");
        // No subscribers is fine; the event is simply dropped.
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Drain whatever is currently buffered (test and status helper).
pub fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => out.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_fail() {
        let sink = EventSink::new(4);
        for i in 0..10 {
            sink.emit(EngineEvent::ScheduleFired {
                at: Utc::now(),
                fire_count: i,
            });
        }
    }

    #[test]
    fn lagging_subscriber_keeps_newest() {
        let sink = EventSink::new(2);
        let mut rx = sink.subscribe();
        for i in 0..5 {
            sink.emit(EngineEvent::ScheduleFired {
                at: Utc::now(),
                fire_count: i,
            });
        }
        let got = drain(&mut rx);
        let counts: Vec<u64> = got
            .iter()
            .map(|e| match e {
                EngineEvent::ScheduleFired { fire_count, .. } => *fire_count,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(counts, vec![3, 4]);
    }

    #[test]
    fn events_serialize_with_dotted_names() {
        let ev = EngineEvent::ErrorClassified {
            operation: "attempt_engagement".into(),
            category: ErrorCategory::Network,
            severity: Severity::Medium,
            retryable: true,
            attempt: 1,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "error.classified");
        assert_eq!(v["category"], "NETWORK");
        assert_eq!(v["severity"], "medium");
    }
}
