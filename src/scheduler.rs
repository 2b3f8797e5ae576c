// src/scheduler.rs
//! Cadence scheduler: a self-rescheduling, randomized timer loop.
//!
//! At most one fire is armed at any time. Each arming gets a fresh ticket and
//! each `start()` a fresh generation; a timer whose ticket is no longer the
//! armed one, or a fire that finishes under an older generation, does nothing.
//! Fires are serialized through a gate so a slow handler can never overlap
//! with the next fire, even across `stop()`/`start()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{elapsed_between, saturating_add, Clock};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventSink};
use crate::store::KvStore;

pub const SCHEDULE_STORE_KEY: &str = "schedule_state";

/// Identifier of a one-off task.
pub type TaskId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Relative jitter applied to each draw (0.1 = ±10%).
    pub jitter_ratio: f64,
    /// Delay before the catch-up fire after a detected sleep.
    pub wake_recovery_secs: u64,
    /// Poll period of the wake watchdog; 0 disables it. Must exceed
    /// `wake_recovery_secs` when enabled.
    pub wake_check_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 180,
            max_interval_secs: 480,
            jitter_ratio: 0.1,
            wake_recovery_secs: 2,
            wake_check_secs: 30,
        }
    }
}

impl ScheduleConfig {
    pub fn bounds(&self) -> Result<IntervalBounds, EngineError> {
        IntervalBounds::new(
            Duration::from_secs(self.min_interval_secs),
            Duration::from_secs(self.max_interval_secs),
        )
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.bounds()?;
        if !(0.0..=0.5).contains(&self.jitter_ratio) {
            return Err(EngineError::Config(
                "schedule.jitter_ratio must be within [0, 0.5]".into(),
            ));
        }
        if self.wake_check_secs > 0 && self.wake_check_secs <= self.wake_recovery_secs {
            return Err(EngineError::Config(format!(
                "schedule.wake_check_secs ({}) must exceed wake_recovery_secs ({})",
                self.wake_check_secs, self.wake_recovery_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalBounds {
    pub min: Duration,
    pub max: Duration,
}

impl IntervalBounds {
    pub fn new(min: Duration, max: Duration) -> Result<Self, EngineError> {
        if min.is_zero() {
            return Err(EngineError::Config("interval min must be > 0".into()));
        }
        if min > max {
            return Err(EngineError::Config(format!(
                "interval min {min:?} exceeds max {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn from_secs(min: u64, max: u64) -> Result<Self, EngineError> {
        Self::new(Duration::from_secs(min), Duration::from_secs(max))
    }
}

/// Draw uniformly from `[min, max]`, apply `±jitter_ratio` jitter, clamp back.
pub fn random_interval<R: Rng>(
    bounds: IntervalBounds,
    jitter_ratio: f64,
    rng: &mut R,
) -> Duration {
    let min = bounds.min.as_millis() as u64;
    let max = bounds.max.as_millis() as u64;
    if min >= max {
        return bounds.min;
    }
    let sample = rng.random_range(min..=max) as f64;
    let jitter = if jitter_ratio > 0.0 {
        sample * rng.random_range(-jitter_ratio..=jitter_ratio)
    } else {
        0.0
    };
    let jittered = (sample + jitter).round().clamp(min as f64, max as f64);
    Duration::from_millis(jittered as u64)
}

/// Status snapshot. Only the scheduler mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub is_running: bool,
    pub interval_bounds: IntervalBounds,
    pub pending_fire_at: Option<DateTime<Utc>>,
    /// EMA of drawn intervals; reporting only, never used for decisions.
    pub running_average_interval: Option<Duration>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub fire_count: u64,
}

/// What the handler wants to happen after a fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Continue,
    /// Hold the next fire back for at least this long.
    PauseFor(Duration),
    /// Stop the loop (operator action needed).
    Halt,
}

#[async_trait]
pub trait FireHandler: Send + Sync {
    async fn on_fire(&self, fired_at: DateTime<Utc>) -> FireOutcome;
}

struct Inner {
    state: ScheduleState,
    jitter_ratio: f64,
    wake_recovery: Duration,
    generation: u64,
    next_ticket: u64,
    armed_ticket: Option<u64>,
    pending: Option<JoinHandle<()>>,
    firing: bool,
    started_at: Option<DateTime<Utc>>,
    next_task_id: TaskId,
    tasks: HashMap<TaskId, JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    handler: Arc<dyn FireHandler>,
    clock: Arc<dyn Clock>,
    events: EventSink,
    store: Option<Arc<dyn KvStore>>,
    fire_gate: tokio::sync::Mutex<()>,
    /// Latest state snapshot for the single writer task. The writer exits once
    /// this sender is dropped.
    snapshot_tx: watch::Sender<Option<serde_json::Value>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones drive the same loop. Must be used inside a tokio runtime.
#[derive(Clone)]
pub struct CadenceScheduler {
    shared: Arc<Shared>,
}

impl CadenceScheduler {
    pub fn new(
        cfg: &ScheduleConfig,
        handler: Arc<dyn FireHandler>,
        clock: Arc<dyn Clock>,
        events: EventSink,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self, EngineError> {
        cfg.validate()?;
        let inner = Inner {
            state: ScheduleState {
                is_running: false,
                interval_bounds: cfg.bounds()?,
                pending_fire_at: None,
                running_average_interval: None,
                last_fire_at: None,
                fire_count: 0,
            },
            jitter_ratio: cfg.jitter_ratio,
            wake_recovery: Duration::from_secs(cfg.wake_recovery_secs),
            generation: 0,
            next_ticket: 0,
            armed_ticket: None,
            pending: None,
            firing: false,
            started_at: None,
            next_task_id: 0,
            tasks: HashMap::new(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                handler,
                clock,
                events,
                store,
                fire_gate: tokio::sync::Mutex::new(()),
                snapshot_tx: watch::channel(None).0,
                writer: Mutex::new(None),
            }),
        })
    }

    /// Reload reporting fields (last fire, average, count) from the store.
    /// An unreadable snapshot is logged and ignored.
    pub async fn restore(&self) -> Result<bool, EngineError> {
        let Some(store) = &self.shared.store else {
            return Ok(false);
        };
        let value = match store.get(SCHEDULE_STORE_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(false),
            Err(EngineError::Parse(e)) => {
                warn!(target: "scheduler", error = %e, "stored schedule state unreadable; ignored");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let saved: ScheduleState = match serde_json::from_value(value) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(target: "scheduler", error = %e, "stored schedule state unreadable; ignored");
                return Ok(false);
            }
        };
        let mut inner = self.shared.inner.lock();
        if inner.state.is_running {
            return Ok(false);
        }
        inner.state.last_fire_at = saved.last_fire_at;
        inner.state.running_average_interval = saved.running_average_interval;
        inner.state.fire_count = saved.fire_count;
        Ok(true)
    }

    pub fn status(&self) -> ScheduleState {
        self.shared.inner.lock().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().state.is_running
    }

    /// Start (or restart) the loop: one fire armed at `now + random_interval(bounds)`.
    pub fn start(&self, bounds: IntervalBounds) {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_running {
            debug!(target: "scheduler", "start while running; restarting loop");
        }
        cancel_pending(&mut inner);
        inner.generation += 1;
        inner.state.is_running = true;
        inner.state.interval_bounds = bounds;
        inner.started_at = Some(self.shared.clock.now());
        let delay = draw_interval(&mut inner);
        arm(&self.shared, &mut inner, delay);
        info!(
            target: "scheduler",
            min_secs = bounds.min.as_secs(),
            max_secs = bounds.max.as_secs(),
            first_in_ms = delay.as_millis() as u64,
            "scheduler started"
        );
        persist(&self.shared, &inner.state);
    }

    /// Cancel the pending fire and all one-off tasks. Idempotent. A fire that is
    /// already running completes but does not re-arm.
    pub fn stop(&self) {
        let mut inner = self.shared.inner.lock();
        let was_running = inner.state.is_running;
        stop_locked(&mut inner);
        if was_running {
            info!(target: "scheduler", "scheduler stopped");
            persist(&self.shared, &inner.state);
        }
    }

    /// New bounds apply from the next arming; the pending fire keeps its time.
    pub fn update_bounds(&self, bounds: IntervalBounds) {
        self.shared.inner.lock().state.interval_bounds = bounds;
    }

    pub fn update_config(&self, cfg: &ScheduleConfig) -> Result<(), EngineError> {
        cfg.validate()?;
        let mut inner = self.shared.inner.lock();
        inner.state.interval_bounds = cfg.bounds()?;
        inner.jitter_ratio = cfg.jitter_ratio;
        inner.wake_recovery = Duration::from_secs(cfg.wake_recovery_secs);
        Ok(())
    }

    /// Detect a suspended process: if more than `2 * max` passed since the last
    /// fire (or start) and the armed fire is already overdue on the wall clock,
    /// drop the stale timer and fire again after the short recovery delay.
    /// Returns whether a catch-up fire was armed.
    ///
    /// A fire armed further out (a pause) is not overdue until its time has
    /// passed, and an armed catch-up fire is never pushed back.
    pub fn handle_wake_from_sleep(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_running || inner.firing {
            return false;
        }
        match inner.state.pending_fire_at {
            Some(due) if now > due => {}
            _ => return false,
        }
        // A restored last_fire_at from a previous run must not count as a gap.
        let reference = match (inner.state.last_fire_at, inner.started_at) {
            (Some(fired), Some(started)) => fired.max(started),
            (fired, started) => match fired.or(started) {
                Some(t) => t,
                None => return false,
            },
        };
        let gap = elapsed_between(reference, now);
        let limit = inner.state.interval_bounds.max * 2;
        if gap <= limit {
            return false;
        }
        let delay = inner.wake_recovery;
        warn!(
            target: "scheduler",
            gap_secs = gap.as_secs(),
            limit_secs = limit.as_secs(),
            "wake from sleep detected; rescheduling"
        );
        arm(&self.shared, &mut inner, delay);
        persist(&self.shared, &inner.state);
        drop(inner);
        self.shared.events.emit(EngineEvent::ScheduleWoke {
            at: now,
            gap_secs: gap.as_secs(),
        });
        true
    }

    /// Poll the wall clock every `every` and run wake detection.
    pub fn spawn_wake_watchdog(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let every = every.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = this.shared.clock.now();
                this.handle_wake_from_sleep(now);
            }
        })
    }

    /// Run `task` once after `delay`, independently of the cadence loop.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.shared.inner.lock();
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let weak = Arc::downgrade(&self.shared);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            if let Some(shared) = weak.upgrade() {
                shared.inner.lock().tasks.remove(&id);
            }
        });
        inner.tasks.insert(id, handle);
        id
    }

    /// Cancel a one-off task. Returns false if it already ran or was unknown.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.shared.inner.lock().tasks.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.inner.lock().tasks.len()
    }
}

fn cancel_pending(inner: &mut Inner) {
    inner.armed_ticket = None;
    inner.state.pending_fire_at = None;
    if let Some(handle) = inner.pending.take() {
        handle.abort();
    }
}

fn stop_locked(inner: &mut Inner) {
    cancel_pending(inner);
    inner.generation += 1;
    inner.state.is_running = false;
    inner.started_at = None;
    for (_, handle) in inner.tasks.drain() {
        handle.abort();
    }
}

/// Draw the next interval and fold it into the running average.
fn draw_interval(inner: &mut Inner) -> Duration {
    let sample = random_interval(
        inner.state.interval_bounds,
        inner.jitter_ratio,
        &mut rand::rng(),
    );
    inner.state.running_average_interval = Some(match inner.state.running_average_interval {
        None => sample,
        Some(avg) => avg.mul_f64(0.8) + sample.mul_f64(0.2),
    });
    sample
}

/// Arm the single timer. Any previously armed timer is cancelled first.
fn arm(shared: &Arc<Shared>, inner: &mut Inner, delay: Duration) {
    cancel_pending(inner);
    inner.next_ticket += 1;
    let ticket = inner.next_ticket;
    inner.armed_ticket = Some(ticket);
    inner.state.pending_fire_at = Some(saturating_add(shared.clock.now(), delay));

    let task_shared = Arc::clone(shared);
    inner.pending = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire(task_shared, ticket).await;
    }));
}

async fn fire(shared: Arc<Shared>, ticket: u64) {
    let (generation, fired_at, fire_count) = {
        let mut inner = shared.inner.lock();
        if inner.armed_ticket != Some(ticket) || !inner.state.is_running {
            return;
        }
        // This task is the in-flight fire now; its own handle is no longer "pending".
        inner.armed_ticket = None;
        inner.pending = None;
        inner.firing = true;
        let now = shared.clock.now();
        inner.state.pending_fire_at = None;
        inner.state.last_fire_at = Some(now);
        inner.state.fire_count += 1;
        (inner.generation, now, inner.state.fire_count)
    };

    shared.events.emit(EngineEvent::ScheduleFired {
        at: fired_at,
        fire_count,
    });
    debug!(target: "scheduler", fire_count, "fire");

    let outcome = {
        let _gate = shared.fire_gate.lock().await;
        shared.handler.on_fire(fired_at).await
    };

    let mut inner = shared.inner.lock();
    inner.firing = false;
    if inner.generation != generation || !inner.state.is_running || inner.armed_ticket.is_some() {
        return;
    }
    match outcome {
        FireOutcome::Continue => {
            let delay = draw_interval(&mut inner);
            arm(&shared, &mut inner, delay);
        }
        FireOutcome::PauseFor(pause) => {
            let delay = draw_interval(&mut inner).max(pause);
            info!(target: "scheduler", pause_secs = delay.as_secs(), "scheduler paused");
            arm(&shared, &mut inner, delay);
        }
        FireOutcome::Halt => {
            warn!(target: "scheduler", "handler requested halt; scheduler stopped");
            stop_locked(&mut inner);
        }
    }
    persist(&shared, &inner.state);
}

/// Hand the state snapshot to the writer task without waiting for the write.
/// Writes happen one at a time and only the newest pending snapshot is kept.
fn persist(shared: &Arc<Shared>, state: &ScheduleState) {
    let Some(store) = shared.store.clone() else {
        return;
    };
    let value = match serde_json::to_value(state) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "scheduler", error = %e, "schedule state not serializable");
            return;
        }
    };
    shared.snapshot_tx.send_replace(Some(value));

    let mut writer = shared.writer.lock();
    if writer.as_ref().is_some_and(|w| !w.is_finished()) {
        return;
    }
    let mut rx = shared.snapshot_tx.subscribe();
    rx.mark_changed();
    *writer = Some(tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let latest = rx.borrow_and_update().clone();
            let Some(value) = latest else {
                continue;
            };
            if let Err(e) = store.set(SCHEDULE_STORE_KEY, value).await {
                warn!(target: "scheduler", error = %e, "persisting schedule state failed");
            }
        }
    }));
}
