//! Two background sweepers that keep the registry and temp directory honest
//! over a long-running worker process: an orphan reaper (a client stopped
//! polling a job it submitted) and a temp cleaner (terminal jobs and stale,
//! unregistered directories left behind by crashes or restarts).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::job::JobStatus;
use crate::registry::JobRegistry;

const ORPHAN_SCAN_INTERVAL: Duration = Duration::from_secs(15);
const ORPHAN_TIMEOUT: Duration = Duration::from_secs(90);
const TEMP_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const TERMINAL_RETENTION: Duration = Duration::from_secs(60);

/// Owns the two sweeper tasks. Aborting them is tied to this struct's
/// lifetime, the same way the background scanner aborts its spawned tasks on
/// shutdown rather than leaving them to run past the owner that created them.
pub struct Janitor {
    orphan_reaper: JoinHandle<()>,
    temp_cleaner: JoinHandle<()>,
}

impl Janitor {
    pub fn spawn(registry: JobRegistry, config: Arc<Config>) -> Self {
        let orphan_reaper = tokio::spawn(run_orphan_reaper(registry.clone()));
        let temp_cleaner = tokio::spawn(run_temp_cleaner(registry, config));
        Janitor {
            orphan_reaper,
            temp_cleaner,
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.orphan_reaper.abort();
        self.temp_cleaner.abort();
    }
}

async fn run_orphan_reaper(registry: JobRegistry) {
    let mut interval = tokio::time::interval(ORPHAN_SCAN_INTERVAL);
    loop {
        interval.tick().await;
        reap_orphans(&registry).await;
    }
}

/// A job in `running` or `queued` whose owner has not polled `/status` in
/// over `ORPHAN_TIMEOUT` is assumed abandoned. A queued job that has never
/// started is cancelled outright (the scheduler's worker loop skips it on
/// dequeue); a running job is only asked to cancel, leaving the driver's own
/// supervision loop to terminate the subprocess and record the final status.
async fn reap_orphans(registry: &JobRegistry) {
    let now = Instant::now();
    for id in registry.ids() {
        let Some(handle) = registry.get(&id) else {
            continue;
        };
        let mut job = handle.write().await;
        if !matches!(job.status, JobStatus::Running | JobStatus::Queued) {
            continue;
        }
        let Some(last_polled_at) = job.last_polled_at else {
            continue;
        };
        if now.duration_since(last_polled_at) <= ORPHAN_TIMEOUT {
            continue;
        }

        warn!("job {id} orphaned: no status poll in over {ORPHAN_TIMEOUT:?}, cancelling");
        if job.status == JobStatus::Queued {
            job.mark_terminal(
                JobStatus::Cancelled,
                Some("orphaned: client stopped polling before the job started".to_string()),
            );
        }
        job.cancel.cancel();
    }
}

async fn run_temp_cleaner(registry: JobRegistry, config: Arc<Config>) {
    let mut interval = tokio::time::interval(TEMP_SCAN_INTERVAL);
    loop {
        interval.tick().await;
        reap_terminal_jobs(&registry).await;
        sweep_temp_root(&registry, &config).await;
    }
}

/// Terminal jobs are kept around briefly so a final `/status` poll still
/// finds them, then their output directory and registry entry are dropped
/// together.
async fn reap_terminal_jobs(registry: &JobRegistry) {
    let now = chrono::Utc::now();
    for id in registry.ids() {
        let Some(handle) = registry.get(&id) else {
            continue;
        };
        let (status, completed_at, output_dir) = {
            let job = handle.read().await;
            (job.status, job.completed_at, job.output_dir.clone())
        };
        if !status.is_terminal() {
            continue;
        }
        let Some(completed_at) = completed_at else {
            continue;
        };
        let age = now.signed_duration_since(completed_at);
        if age < chrono::Duration::from_std(TERMINAL_RETENTION).unwrap() {
            continue;
        }

        let _ = tokio::fs::remove_dir_all(&output_dir).await;
        registry.remove(&id);
        debug!("reaped terminal job {id} and its output directory");
    }
}

/// Crashes and restarts can leave behind a job's temp directory with no
/// matching registry entry at all. Anything unregistered and older than
/// `cleanup_temp_after_hours` is swept, regardless of job status.
async fn sweep_temp_root(registry: &JobRegistry, config: &Config) {
    let cutoff = match std::time::SystemTime::now()
        .checked_sub(Duration::from_secs(config.cleanup_temp_after_hours * 3600))
    {
        Some(cutoff) => cutoff,
        None => return,
    };

    let mut entries = match tokio::fs::read_dir(&config.temp_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("temp cleaner: failed to read {}: {err}", config.temp_dir.display());
            return;
        }
    };

    let known_ids: std::collections::HashSet<String> = registry.ids().into_iter().collect();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("temp cleaner: error walking {}: {err}", config.temp_dir.display());
                break;
            }
        };

        let file_name = entry.file_name();
        if known_ids.contains(file_name.to_string_lossy().as_ref()) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_dir() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => info!("temp cleaner: swept unregistered stale directory {}", path.display()),
            Err(err) => warn!("temp cleaner: failed to remove {}: {err}", path.display()),
        }
    }
}
