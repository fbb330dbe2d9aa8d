use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use planner_core::{CredentialProvider, GoogleClient, StaticCredentials};
use tokio::time::MissedTickBehavior;

use crate::storage::{CursorStorage, TokenStorage, load_or_create_device_id};
use crate::sync::backoff::Backoff;
use crate::sync::clock;
use crate::sync::engine::{
    EngineError, PushReport, Remotes, ResyncReport, SyncEngine, SyncReport, SyncSettings,
    SyncStatus, SyncWarning,
};
use crate::sync::index::IndexStore;
use crate::token_provider::TokenProvider;

const DEFAULT_DATA_DIR_NAME: &str = "planner";
const DB_FILE_NAME: &str = "planner.db";
const CURSOR_FILE_NAME: &str = "sync_cursor.json";
const DEVICE_FILE_NAME: &str = "device_id";
const DEFAULT_PULL_SECS: u64 = 60;
const DEFAULT_PUSH_SECS: u64 = 15;
const DEFAULT_PAUSE_AFTER_FAILURES: u64 = 3;
const PAUSE_BASE_SECS: u64 = 30;
const PAUSE_MAX_SECS: u64 = 15 * 60;
const MAX_LOOKBACK_DAYS: i64 = 3650;
const MAX_DEFAULT_DURATION_MIN: i64 = 24 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub cursor_path: PathBuf,
    pub device_id: Option<String>,
    pub access_token: Option<String>,
    pub api_base: Option<String>,
    pub use_appdata: bool,
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub pause_after_failures: u32,
    pub settings: SyncSettings,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_data_dir = dirs::data_dir()
            .context("data directory is unavailable")?
            .join(DEFAULT_DATA_DIR_NAME);
        Ok(Self::from_lookup(
            |name| std::env::var(name).ok(),
            &home,
            default_data_dir,
        ))
    }

    /// Builds the configuration from `var`, the `PLANNER_*` variable source.
    pub fn from_lookup<F>(var: F, home: &Path, default_data_dir: PathBuf) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_var = |name: &str| {
            var(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(value.trim(), home))
        };
        let data_dir = path_var("PLANNER_DATA_DIR").unwrap_or(default_data_dir);
        let db_path = path_var("PLANNER_DB_PATH").unwrap_or_else(|| data_dir.join(DB_FILE_NAME));
        let cursor_path =
            path_var("PLANNER_CURSOR_PATH").unwrap_or_else(|| data_dir.join(CURSOR_FILE_NAME));

        let defaults = SyncSettings::default();
        let settings = SyncSettings {
            calendar_id: read_string(var("PLANNER_CALENDAR_ID"), &defaults.calendar_id),
            tasklist_title: read_string(var("PLANNER_TASKLIST_TITLE"), &defaults.tasklist_title),
            lookback_days: read_bounded(
                var("PLANNER_LOOKBACK_DAYS"),
                defaults.lookback_days,
                MAX_LOOKBACK_DAYS,
            ),
            default_duration_min: read_bounded(
                var("PLANNER_DEFAULT_DURATION_MIN"),
                defaults.default_duration_min,
                MAX_DEFAULT_DURATION_MIN,
            ),
            max_attempts: read_u32(var("PLANNER_MAX_ATTEMPTS"), defaults.max_attempts),
            notes_metadata: read_bool(var("PLANNER_NOTES_METADATA"), defaults.notes_metadata),
            push_batch: read_u64(var("PLANNER_PUSH_BATCH"), u64::from(defaults.push_batch))
                .min(u64::from(u32::MAX)) as u32,
        };

        Self {
            data_dir,
            db_path,
            cursor_path,
            device_id: var("PLANNER_DEVICE_ID").and_then(non_blank),
            access_token: var("PLANNER_ACCESS_TOKEN").and_then(non_blank),
            api_base: var("PLANNER_API_BASE").and_then(non_blank),
            use_appdata: read_bool(var("PLANNER_USE_APPDATA"), true),
            pull_interval: Duration::from_secs(read_u64(var("PLANNER_PULL_SECS"), DEFAULT_PULL_SECS)),
            push_interval: Duration::from_secs(read_u64(var("PLANNER_PUSH_SECS"), DEFAULT_PUSH_SECS)),
            pause_after_failures: read_u64(
                var("PLANNER_PAUSE_AFTER_FAILURES"),
                DEFAULT_PAUSE_AFTER_FAILURES,
            )
            .min(u64::from(u32::MAX)) as u32,
            settings,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;

        let index = IndexStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open task database at {:?}", config.db_path))?;
        let device_id = match &config.device_id {
            Some(id) => id.clone(),
            None => load_or_create_device_id(&config.data_dir.join(DEVICE_FILE_NAME))
                .await
                .context("failed to load device id")?,
        };
        let credentials = resolve_credentials(config.access_token.as_deref())?;
        let client = build_client(config.api_base.as_deref(), Arc::clone(&credentials))
            .context("invalid api base url")?;
        let remotes = Remotes::from_client(client, credentials, config.use_appdata);
        let cursors = CursorStorage::new(config.cursor_path.clone());
        let engine = SyncEngine::new(index, remotes, cursors, device_id, config.settings.clone());

        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    pub fn with_engine(config: DaemonConfig, engine: Arc<SyncEngine>) -> Self {
        Self { config, engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Queues edits made while no push was recorded, then runs one full pass.
    pub async fn run_once(&self) -> anyhow::Result<SyncReport> {
        self.engine
            .enqueue_changes_since_last_push()
            .await
            .context("failed to queue offline changes")?;
        let report = self.engine.sync_once().await.context("sync pass failed")?;
        log_warnings(&report.calendar.warnings);
        log_warnings(&report.tasks.warnings);
        log_warnings(&report.push.warnings);
        Ok(report)
    }

    pub async fn resync(&self) -> anyhow::Result<(ResyncReport, PushReport)> {
        let resync = self
            .engine
            .force_full_resync()
            .await
            .context("failed to queue full resync")?;
        log_warnings(&resync.warnings);
        let push = self
            .engine
            .push_pending()
            .await
            .context("push after resync failed")?;
        Ok((resync, push))
    }

    pub async fn status(&self) -> anyhow::Result<SyncStatus> {
        self.engine
            .status()
            .await
            .context("failed to read sync status")
    }

    pub async fn run(self) -> anyhow::Result<()> {
        log::info!(
            "daemon started: calendar={}, tasklist={:?}, pull every {}s, push every {}s, db={}",
            self.config.settings.calendar_id,
            self.config.settings.tasklist_title,
            self.config.pull_interval.as_secs(),
            self.config.push_interval.as_secs(),
            self.config.db_path.display()
        );
        match self.engine.enqueue_changes_since_last_push().await {
            Ok(0) => {}
            Ok(queued) => log::info!("daemon: queued {queued} offline changes"),
            Err(err) => log::warn!("daemon: catch-up failed: {err}"),
        }

        let mut pull_tick = tokio::time::interval(self.config.pull_interval);
        pull_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut push_tick = tokio::time::interval(self.config.push_interval);
        push_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = SyncHealth::new(self.config.pause_after_failures);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res.context("failed waiting for shutdown signal")?;
                    log::info!("daemon: shutting down");
                    break;
                }
                _ = pull_tick.tick() => {
                    if health.is_paused(Instant::now()) {
                        continue;
                    }
                    match self.engine.sync_once().await {
                        Ok(report) => {
                            health.record_success();
                            log_pass(&report);
                        }
                        Err(err) => {
                            health.record_failure(&err, Instant::now());
                        }
                    }
                }
                _ = push_tick.tick() => {
                    if health.is_paused(Instant::now()) {
                        continue;
                    }
                    match self.engine.push_pending().await {
                        Ok(report) => {
                            health.record_success();
                            log_warnings(&report.warnings);
                        }
                        Err(err) => {
                            health.record_failure(&err, Instant::now());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
