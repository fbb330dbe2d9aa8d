/// Consecutive-failure tracker of the daemon loop. After `threshold` failed passes, or
/// on the first credential failure, ticks are skipped until a jittered pause expires.
struct SyncHealth {
    threshold: u32,
    failures: u32,
    paused_until: Option<Instant>,
    backoff: Backoff,
}

impl SyncHealth {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: 0,
            paused_until: None,
            backoff: Backoff::new(
                Duration::from_secs(PAUSE_BASE_SECS),
                Duration::from_secs(PAUSE_MAX_SECS),
                true,
            ),
        }
    }

    fn is_paused(&self, now: Instant) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    fn record_success(&mut self) {
        if self.paused_until.is_some() || self.failures >= self.threshold {
            log::info!("daemon: remote available again");
        }
        self.failures = 0;
        self.paused_until = None;
    }

    /// Returns the pause that was started, if any.
    fn record_failure(&mut self, err: &EngineError, now: Instant) -> Option<Duration> {
        if matches!(err, EngineError::Busy) {
            log::debug!("daemon: previous pass still running, skipping tick");
            return None;
        }
        self.failures = self.failures.saturating_add(1);
        if !err.is_credential_failure() && self.failures < self.threshold {
            log::warn!("daemon: sync pass failed ({}): {err}", self.failures);
            return None;
        }
        let delay = self
            .backoff
            .delay(self.failures.saturating_sub(self.threshold));
        self.paused_until = Some(now + delay);
        if err.is_credential_failure() {
            log::error!(
                "daemon: remote unavailable, credentials need attention; pausing {}s: {err}",
                delay.as_secs()
            );
        } else {
            log::error!(
                "daemon: remote unavailable after {} failed passes; pausing {}s: {err}",
                self.failures,
                delay.as_secs()
            );
        }
        Some(delay)
    }
}

fn resolve_credentials(access_token: Option<&str>) -> anyhow::Result<Arc<dyn CredentialProvider>> {
    if let Some(token) = access_token {
        return Ok(Arc::new(StaticCredentials::new(token)));
    }
    let storage = TokenStorage::new().context("failed to initialize token storage")?;
    Ok(Arc::new(TokenProvider::new(storage)))
}

fn build_client(
    base_url: Option<&str>,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<GoogleClient, planner_core::GoogleError> {
    match base_url {
        Some(url) => GoogleClient::with_base_url(url, credentials),
        None => GoogleClient::new(credentials),
    }
}

fn log_pass(report: &SyncReport) {
    let pulled = report.calendar.mutations() + report.tasks.mutations();
    if pulled > 0 || report.push.processed > 0 {
        log::info!(
            "daemon: pass done: calendar {}/{}/{}, tasks {}/{}/{}, pushed {}/{}",
            report.calendar.created,
            report.calendar.updated,
            report.calendar.unlinked,
            report.tasks.created,
            report.tasks.updated,
            report.tasks.unlinked,
            report.push.succeeded,
            report.push.processed
        );
    }
    log_warnings(&report.calendar.warnings);
    log_warnings(&report.tasks.warnings);
    log_warnings(&report.push.warnings);
}

fn log_warnings(warnings: &[SyncWarning]) {
    for warning in warnings {
        log::warn!("daemon: {warning}");
    }
}

/// Human-readable summary printed by `plannerd --status`.
pub fn format_status(status: &SyncStatus) -> String {
    let stamp = |at: Option<time::OffsetDateTime>| {
        at.map(clock::format_rfc3339)
            .unwrap_or_else(|| "never".to_string())
    };
    let cursors = &status.cursors;
    let mut lines = vec![
        format!("calendar last pull: {}", stamp(cursors.calendar_last_pull_at)),
        format!("tasks last pull:    {}", stamp(cursors.tasks_last_pull_at)),
        format!("last push:          {}", stamp(cursors.last_push_at)),
        format!(
            "calendar cursor:    {}",
            if cursors.calendar_token.is_some() {
                "set"
            } else {
                "none (next pull is a bounded resync)"
            }
        ),
        format!("pending operations: {}", status.pending),
        format!("dead letters:       {}", status.dead),
    ];
    if status.running {
        lines.push("a sync pass is running".to_string());
    }
    lines.join("\n")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn read_string(value: Option<String>, default: &str) -> String {
    value.and_then(non_blank).unwrap_or_else(|| default.to_string())
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Positive value capped at `max`. Unparseable or non-positive input keeps `default`.
fn read_bounded(value: Option<String>, default: i64, max: i64) -> i64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(|value| i64::try_from(value).unwrap_or(i64::MAX).min(max))
        .unwrap_or(default)
}

/// Unlike [`read_u64`], zero is a meaningful value here.
fn read_u32(value: Option<String>, default: u32) -> u32 {
    value
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
