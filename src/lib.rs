// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod clock;
pub mod config;
pub mod content_hash;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod relevance;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod similarity;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::EngineConfig;
pub use crate::engine::{CycleReport, Engine, EnginePorts};
pub use crate::error::{ClassifiedError, EngineError, ErrorCategory, Severity};
pub use crate::events::{EngineEvent, EventSink};
pub use crate::ledger::{EngagementRecord, SuppressionLedger, SuppressionReason};
pub use crate::scheduler::{CadenceScheduler, FireHandler, FireOutcome, IntervalBounds};
pub use crate::service::{EngagementService, ServiceStatus};
