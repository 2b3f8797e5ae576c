// src/config.rs
//! Engine configuration: TOML file + env overrides, validated once, shared
//! through a `ConfigHandle`, optionally hot-reloaded from disk.
//!
//! Resolution order:
//! 1) $ENGAGE_CONFIG_PATH (must exist)
//! 2) config/engine.toml
//! 3) built-in defaults
//!
//! followed by the env overrides below.

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::ledger::SuppressionConfig;
use crate::relevance::DEFAULT_RELEVANCE_THRESHOLD;
use crate::retry::{RetryPolicy, RetryRuleOverride};
use crate::scheduler::ScheduleConfig;
use crate::similarity::SimilarityWeights;

pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";
pub const ENV_CONFIG_PATH: &str = "ENGAGE_CONFIG_PATH";
pub const ENV_MIN_INTERVAL: &str = "ENGAGE_MIN_INTERVAL_SECS";
pub const ENV_MAX_INTERVAL: &str = "ENGAGE_MAX_INTERVAL_SECS";
pub const ENV_RELEVANCE_THRESHOLD: &str = "ENGAGE_RELEVANCE_THRESHOLD";
pub const ENV_HOT_RELOAD: &str = "ENGAGE_HOT_RELOAD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub threshold: i32,
    /// Alternate term sets; the embedded `config/relevance.toml` when absent.
    pub terms_path: Option<PathBuf>,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_RELEVANCE_THRESHOLD,
            terms_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    /// Initial timeout of one executor attempt (grows after timeouts).
    pub attempt_timeout_secs: u64,
    pub max_engagements_per_fire: usize,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 30,
            max_engagements_per_fire: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub suppression: SuppressionConfig,
    pub relevance: RelevanceConfig,
    pub similarity: SimilarityWeights,
    pub engagement: EngagementConfig,
    /// Per-category overrides keyed by category name, e.g. `[retry.network]`.
    pub retry: BTreeMap<String, RetryRuleOverride>,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: EngineConfig = toml::from_str(s).context("parsing engine config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// File (env path → default path → defaults), then env overrides, then validation.
    pub fn load_default() -> Result<Self> {
        let mut cfg = match resolve_path()? {
            Some(p) => Self::load_from(&p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = parse_env::<u64>(ENV_MIN_INTERVAL)? {
            self.schedule.min_interval_secs = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_MAX_INTERVAL)? {
            self.schedule.max_interval_secs = v;
        }
        if let Some(v) = parse_env::<i32>(ENV_RELEVANCE_THRESHOLD)? {
            self.relevance.threshold = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        self.suppression.validate()?;
        if self.relevance.threshold < 0 {
            return Err(anyhow!("relevance.threshold must be >= 0"));
        }
        if self.engagement.attempt_timeout_secs == 0 {
            return Err(anyhow!("engagement.attempt_timeout_secs must be > 0"));
        }
        if self.engagement.max_engagements_per_fire == 0 {
            return Err(anyhow!("engagement.max_engagements_per_fire must be > 0"));
        }
        self.retry_policy()?;
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.engagement.attempt_timeout_secs)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::from_overrides(self.attempt_timeout(), &self.retry)?)
    }
}

fn resolve_path() -> Result<Option<PathBuf>> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(Some(pb));
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_PATH);
    Ok(default.exists().then_some(default))
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{name}={raw:?} is not a valid value")),
        Err(_) => Ok(None),
    }
}

/// Shared, swappable configuration. Readers get a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConfigHandle {
    inner: Arc<RwLock<EngineConfig>>,
}

impl ConfigHandle {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn snapshot(&self) -> EngineConfig {
        self.inner.read().clone()
    }

    pub fn replace(&self, cfg: EngineConfig) {
        *self.inner.write() = cfg;
    }
}

/// Hot reload is opt-in: ENGAGE_HOT_RELOAD=1.
pub fn hot_reload_enabled() -> bool {
    std::env::var(ENV_HOT_RELOAD).ok().as_deref() == Some("1")
}

/// Poll `path` by mtime and hand every successfully parsed config to `apply`.
/// Invalid files are logged and skipped; the running config stays in place.
pub fn start_hot_reload_thread<F>(path: PathBuf, poll: Duration, apply: F) -> Option<thread::JoinHandle<()>>
where
    F: Fn(EngineConfig) + Send + 'static,
{
    if !hot_reload_enabled() {
        return None;
    }

    info!(target: "config", path = %path.display(), "config hot reload enabled");
    Some(thread::spawn(move || {
        let mut last_mtime: Option<SystemTime> = None;
        loop {
            if let Ok(mtime) = fs::metadata(&path).and_then(|m| m.modified()) {
                let changed = match last_mtime {
                    None => {
                        last_mtime = Some(mtime);
                        false
                    }
                    Some(prev) => mtime > prev,
                };
                if changed {
                    last_mtime = Some(mtime);
                    match EngineConfig::load_from(&path).and_then(|mut c| {
                        c.apply_env_overrides()?;
                        c.validate()?;
                        Ok(c)
                    }) {
                        Ok(cfg) => {
                            info!(target: "config", "config reloaded");
                            apply(cfg);
                        }
                        Err(e) => warn!(target: "config", error = %e, "config reload rejected"),
                    }
                }
            }
            thread::sleep(poll);
        }
    }))
}
