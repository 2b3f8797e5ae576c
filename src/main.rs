//! Feed Engagement Engine: Binary Entrypoint
//! Loads configuration, wires a file-backed store with the local fixture
//! collaborators, and runs the cadence loop until Ctrl-C.
//!
//! Nothing is posted: the dry-run executor only logs what it would do.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_engagement::config::{self, EngineConfig, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
use feed_engagement::feed::fixture::{CannedComposer, DryRunExecutor, FixtureSource};
use feed_engagement::store::FileStore;
use feed_engagement::{EngagementService, EnginePorts, SystemClock};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_FIXTURE_PATH: &str = "fixtures/candidates.json";
const FIXTURE_PAGE_SIZE: usize = 5;

/// Compact logs by default; JSON lines with ENGAGE_LOG_JSON=1.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_engagement=info,warn"));
    let json = std::env::var("ENGAGE_LOG_JSON").ok().is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = EngineConfig::load_default()?;
    let store = FileStore::open(env_path("ENGAGE_DATA_DIR", DEFAULT_DATA_DIR))
        .context("opening data dir")?;
    let fixture_path = env_path("ENGAGE_FIXTURE_PATH", DEFAULT_FIXTURE_PATH);
    let source = FixtureSource::from_path(&fixture_path, FIXTURE_PAGE_SIZE)?;
    info!(posts = source.len(), path = %fixture_path.display(), "fixture source loaded");

    let service = Arc::new(EngagementService::new(
        cfg,
        Arc::new(store),
        EnginePorts {
            source: Arc::new(source),
            executor: Arc::new(DryRunExecutor),
            composer: Arc::new(CannedComposer::default()),
        },
        Arc::new(SystemClock),
    )?);

    // Surface engine events in the log stream.
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => match serde_json::to_string(&ev) {
                    Ok(line) => info!(target: "events", event = ev.name(), payload = %line),
                    Err(e) => warn!(target: "events", error = %e, "event not serializable"),
                },
                Err(RecvError::Lagged(n)) => warn!(target: "events", skipped = n, "event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Opt-in hot reload of the same file the config was loaded from.
    let reload_path = env_path(ENV_CONFIG_PATH, DEFAULT_CONFIG_PATH);
    let reload_target = Arc::clone(&service);
    config::start_hot_reload_thread(reload_path, Duration::from_secs(2), move |next| {
        if let Err(e) = reload_target.update_config(next) {
            warn!(target: "config", error = %e, "reloaded config not applied");
        }
    });

    match service.restore().await {
        Ok(true) => info!("schedule state restored"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "schedule state not restored; starting fresh"),
    }
    service.start()?;
    info!("engagement loop running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    service.stop();
    let status = service.status().await?;
    info!(
        fires = status.schedule.fire_count,
        ledger_records = status.ledger_records,
        "stopped"
    );
    Ok(())
}
