use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::progress::JobProgress;

/// Where the job pulls its input media from.
#[derive(Debug, Clone)]
pub enum InputDescriptor {
    File(PathBuf),
    Url(String),
    /// Media arrives over the HTTP request body as the worker runs ("beam-stream").
    Stdin,
}

/// Where the job's transcoded output goes.
#[derive(Debug, Clone)]
pub enum OutputKind {
    Hls,
    Dash,
    File,
    /// Direct-stream mode: no destination file at all, just a container
    /// format (e.g. `"mpegts"`) muxed straight to the subprocess's stdout.
    Stream(String),
}

#[derive(Debug, Clone)]
pub struct OutputDescriptor {
    pub kind: OutputKind,
    pub segment_duration: Option<u32>,
}

/// The upstream FFmpeg command-line flavor this job's `raw_args` were written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    UpstreamA,
    UpstreamB,
}

/// How the Transcoder Driver feeds input / returns output for this job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Shared filesystem: input and output are both local paths.
    SharedFilesystem,
    /// Output streamed directly to the HTTP response as FFmpeg produces it.
    DirectStream,
    /// Input streamed into FFmpeg's stdin from the HTTP request body.
    BeamStream,
    /// Input was already written to `<temp>/<job_id>/input` via a prior upload.
    BeamUpload,
}

/// What a submit request recorded about the job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub input: InputDescriptor,
    pub output: OutputDescriptor,
    pub raw_args: Vec<String>,
    pub dialect: Dialect,
    pub max_bitrate: Option<String>,
    pub io_mode: IoMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A single transcode job and its mutable runtime state.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic; only meaningful while status is running/queued.
    pub last_polled_at: Option<Instant>,
    pub progress: JobProgress,
    pub output_dir: PathBuf,
    pub pid: Option<u32>,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(id: String, spec: JobSpec, output_dir: PathBuf, cancel: CancellationToken) -> Self {
        Job {
            id,
            spec,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            last_polled_at: None,
            progress: JobProgress::default(),
            output_dir,
            pid: None,
            cancel,
        }
    }

    pub fn mark_polled(&mut self) {
        if !self.status.is_terminal() {
            self.last_polled_at = Some(Instant::now());
        }
    }

    pub fn mark_running(&mut self, pid: Option<u32>) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.pid = pid;
    }

    pub fn mark_terminal(&mut self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.pid = None;
        if let Some(err) = error {
            self.progress.error = Some(err);
        }
    }

    pub fn apply_progress(&mut self, progress: JobProgress) {
        self.progress = progress;
    }
}
