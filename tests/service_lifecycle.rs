// tests/service_lifecycle.rs
// The host-facing service: construction order, start/stop, live config
// updates, status and the wake watchdog, all on a paused tokio clock.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use feed_engagement::clock::{Clock, ManualClock};
use feed_engagement::config::EngineConfig;
use feed_engagement::engine::EnginePorts;
use feed_engagement::events::{drain, EngineEvent};
use feed_engagement::feed::fixture::{CannedComposer, DryRunExecutor, FixtureSource};
use feed_engagement::feed::CandidatePost;
use feed_engagement::service::EngagementService;
use feed_engagement::store::{KvStore, MemoryStore};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
}

fn config(min: u64, max: u64, wake_check_secs: u64) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.schedule.min_interval_secs = min;
    cfg.schedule.max_interval_secs = max;
    cfg.schedule.wake_check_secs = wake_check_secs;
    cfg
}

fn service(cfg: EngineConfig, clock: Arc<ManualClock>) -> EngagementService {
    let posts = vec![
        CandidatePost::new(
            "p1",
            "linkedin",
            "Platform Engineer",
            "Rust and Kubernetes tips for every developer shipping to production",
        ),
        CandidatePost::new("p2", "linkedin", "Friend", "Lunch with friends, lovely weather today"),
    ];
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    EngagementService::new(
        cfg,
        store,
        EnginePorts {
            source: Arc::new(FixtureSource::new(posts, 10)),
            executor: Arc::new(DryRunExecutor),
            composer: Arc::new(CannedComposer::default()),
        },
        clock,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn fires_engage_and_show_up_in_status() {
    let clock = Arc::new(ManualClock::new(t0()));
    let svc = service(config(10, 10, 0), clock);
    let mut rx = svc.subscribe();

    svc.start().unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    let status = svc.status().await.unwrap();
    assert!(status.schedule.is_running);
    assert_eq!(status.schedule.fire_count, 1);
    assert_eq!(status.ledger_records, 1);
    let cycle = status.last_cycle.unwrap();
    assert_eq!(cycle.engaged, 1);
    assert_eq!(cycle.irrelevant, 1);

    let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["schedule.fired", "engagement.recorded"]);

    svc.stop();
    svc.stop();
    assert!(!svc.scheduler().is_running());
}

#[tokio::test(start_paused = true)]
async fn rejected_config_changes_nothing() {
    let clock = Arc::new(ManualClock::new(t0()));
    let svc = service(config(10, 10, 0), clock);

    let mut bad = svc.config();
    bad.schedule.min_interval_secs = 600;
    bad.schedule.max_interval_secs = 60;
    bad.relevance.threshold = 15;
    assert!(svc.update_config(bad).is_err());
    assert_eq!(svc.config().relevance.threshold, 3);
    assert_eq!(svc.engine().relevance().current().threshold(), 3);

    let mut good = svc.config();
    good.relevance.threshold = 15;
    good.schedule.min_interval_secs = 20;
    good.schedule.max_interval_secs = 20;
    svc.update_config(good).unwrap();
    assert_eq!(svc.config().relevance.threshold, 15);
    assert_eq!(
        svc.scheduler().status().interval_bounds.max,
        Duration::from_secs(20)
    );

    // Nothing clears the raised threshold any more.
    svc.start().unwrap();
    tokio::time::sleep(Duration::from_secs(21)).await;
    let status = svc.status().await.unwrap();
    assert_eq!(status.schedule.fire_count, 1);
    assert_eq!(status.ledger_records, 0);
    svc.stop();
}

#[tokio::test(start_paused = true)]
async fn watchdog_recovers_from_a_suspended_process() {
    let clock = Arc::new(ManualClock::new(t0()));
    let svc = service(config(100, 100, 5), clock.clone());
    let mut rx = svc.subscribe();

    svc.start().unwrap();
    // Laptop lid closed for an hour: the wall clock moves, tokio timers don't.
    clock.advance(Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_secs(8)).await;

    let state = svc.scheduler().status();
    assert_eq!(state.fire_count, 1);
    assert_eq!(state.last_fire_at, Some(clock.now()));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, EngineEvent::ScheduleWoke { gap_secs: 3600, .. })));
    svc.stop();
}
