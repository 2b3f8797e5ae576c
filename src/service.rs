// src/service.rs
//! Host-facing façade. Builds every component once, in dependency order
//! (similarity → ledger → relevance → engine → scheduler), and exposes the
//! small lifecycle surface a host needs.

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::{ConfigHandle, EngineConfig};
use crate::engine::{build_scorer, CycleReport, Engine, EnginePorts};
use crate::events::{EngineEvent, EventSink};
use crate::ledger::SuppressionLedger;
use crate::relevance::RelevanceHandle;
use crate::scheduler::{CadenceScheduler, ScheduleState};
use crate::similarity::SimilarityEngine;
use crate::store::KvStore;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub schedule: ScheduleState,
    pub ledger_records: usize,
    pub last_cycle: Option<CycleReport>,
}

pub struct EngagementService {
    config: ConfigHandle,
    events: EventSink,
    ledger: Arc<SuppressionLedger>,
    engine: Arc<Engine>,
    scheduler: CadenceScheduler,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl EngagementService {
    pub fn new(
        cfg: EngineConfig,
        store: Arc<dyn KvStore>,
        ports: EnginePorts,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;
        let events = EventSink::default();

        let similarity = SimilarityEngine::new(cfg.similarity);
        let ledger = Arc::new(SuppressionLedger::new(
            Arc::clone(&store),
            cfg.suppression.clone(),
            similarity,
        ));
        let relevance = RelevanceHandle::new(build_scorer(&cfg.relevance)?);
        let engine = Arc::new(Engine::new(
            &cfg,
            relevance,
            Arc::clone(&ledger),
            ports,
            events.clone(),
            Arc::clone(&clock),
        )?);
        let scheduler = CadenceScheduler::new(
            &cfg.schedule,
            engine.clone(),
            clock,
            events.clone(),
            Some(store),
        )?;

        Ok(Self {
            config: ConfigHandle::new(cfg),
            events,
            ledger,
            engine,
            scheduler,
            watchdog: Mutex::new(None),
        })
    }

    /// Reload persisted schedule reporting fields. Call before `start`.
    pub async fn restore(&self) -> Result<bool> {
        Ok(self.scheduler.restore().await?)
    }

    /// Start the cadence loop with the configured bounds and, when
    /// `wake_check_secs > 0`, the wake-from-sleep watchdog.
    pub fn start(&self) -> Result<()> {
        let cfg = self.config.snapshot();
        self.scheduler.start(cfg.schedule.bounds()?);

        let mut watchdog = self.watchdog.lock();
        if let Some(old) = watchdog.take() {
            old.abort();
        }
        if cfg.schedule.wake_check_secs > 0 {
            *watchdog = Some(
                self.scheduler
                    .spawn_wake_watchdog(Duration::from_secs(cfg.schedule.wake_check_secs)),
            );
        }
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.scheduler.stop();
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }

    /// Apply a new config from the next decision on. Rejected configs change nothing.
    pub fn update_config(&self, cfg: EngineConfig) -> Result<()> {
        self.engine.update_config(&cfg)?;
        self.scheduler.update_config(&cfg.schedule)?;
        self.config.replace(cfg);
        info!(target: "config", "service config applied");
        Ok(())
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus {
            schedule: self.scheduler.status(),
            ledger_records: self.ledger.len().await?,
            last_cycle: self.engine.last_report(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.snapshot()
    }

    pub fn scheduler(&self) -> &CadenceScheduler {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for EngagementService {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.get_mut().take() {
            handle.abort();
        }
    }
}
