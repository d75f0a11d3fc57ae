use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, RwLock};

use crate::job::{Job, JobStatus};
use crate::progress::JobProgress;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// In-memory mapping from job id to job record, plus the push-subscriber
/// channels for each job. Subscribers hold only a job id and a receiver —
/// never a reference back into the job itself — so there is no cycle between
/// a job and its subscribers (see design notes on weak subscriber refs).
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, Arc<RwLock<Job>>>>,
    channels: Arc<DashMap<String, broadcast::Sender<JobProgress>>>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            jobs: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn insert(&self, job: Job) -> Arc<RwLock<Job>> {
        let id = job.id.clone();
        let handle = Arc::new(RwLock::new(job));
        self.jobs.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<Job>>> {
        self.jobs.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) {
        self.jobs.remove(id);
        self.channels.remove(id);
    }

    pub fn ids(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn list_summaries(&self) -> Vec<JobSummary> {
        let mut out = Vec::with_capacity(self.jobs.len());
        for entry in self.jobs.iter() {
            let job = entry.value().read().await;
            out.push(JobSummary::from(&*job));
        }
        out
    }

    /// Number of jobs currently in the `running` state.
    pub async fn running_count(&self) -> usize {
        let mut count = 0;
        for entry in self.jobs.iter() {
            if entry.value().read().await.status == JobStatus::Running {
                count += 1;
            }
        }
        count
    }

    /// Subscribe to progress updates for a job, creating its broadcast
    /// channel lazily on first subscription.
    pub fn subscribe(&self, id: &str) -> broadcast::Receiver<JobProgress> {
        self.channels
            .entry(id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Push a progress update to any subscribers. Delivery failure (no
    /// receivers) is not an error — the subscriber set simply shrinks to
    /// zero, never growing back after a job reaches terminal status.
    pub fn publish(&self, id: &str, progress: JobProgress) {
        if let Some(tx) = self.channels.get(id) {
            let _ = tx.send(progress);
        }
    }
}

/// JSON-serializable view of a job, returned from `/status/{id}` and `/jobs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        JobSummary {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress.clone(),
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Dialect, InputDescriptor, IoMode, JobSpec, OutputDescriptor, OutputKind};
    use tokio_util::sync::CancellationToken;

    fn sample_job(id: &str) -> Job {
        Job::new(
            id.to_string(),
            JobSpec {
                input: InputDescriptor::File("/tmp/in.mkv".into()),
                output: OutputDescriptor {
                    kind: OutputKind::Dash,
                    segment_duration: None,
                },
                raw_args: vec![],
                dialect: Dialect::UpstreamB,
                max_bitrate: None,
                io_mode: IoMode::SharedFilesystem,
            },
            "/tmp/out".into(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn insert_and_get_round_trips() {
        let registry = JobRegistry::new();
        registry.insert(sample_job("j1"));
        assert!(registry.get("j1").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn remove_drops_both_job_and_channel() {
        let registry = JobRegistry::new();
        registry.insert(sample_job("j1"));
        let _rx = registry.subscribe("j1");
        registry.remove("j1");
        assert!(registry.get("j1").is_none());
        // A fresh subscribe after removal creates a brand new, disconnected channel.
        let mut rx2 = registry.subscribe("j1");
        registry.publish("j1", JobProgress::default());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let registry = JobRegistry::new();
        registry.insert(sample_job("j1"));
        registry.publish("j1", JobProgress::default());
    }

    #[tokio::test]
    async fn running_count_reflects_status() {
        let registry = JobRegistry::new();
        let handle = registry.insert(sample_job("j1"));
        assert_eq!(registry.running_count().await, 0);
        handle.write().await.mark_running(Some(123));
        assert_eq!(registry.running_count().await, 1);
    }
}
