//! The Transcoder Driver: builds the real, rewritten `ffmpeg` command for a
//! job and supervises the resulting subprocess across the three I/O modes
//! (shared-filesystem/beam-upload, beam-stream, direct-stream).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::job::{InputDescriptor, IoMode, JobStatus, OutputKind};
use crate::progress::ProgressParser;
use crate::registry::JobRegistry;
use crate::rewriter::{self, RewriteContext};
use crate::scheduler::JobRunner;

const STDERR_TAIL_LINES: usize = 20;
const DIRECT_STREAM_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(120);
const DIRECT_STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);
const SIGTERM_GRACE: Duration = Duration::from_secs(5);
const BEAM_STREAM_CHUNK: usize = 512 * 1024;
const DIRECT_STREAM_CHUNK: usize = 64 * 1024;

/// Shared across the queued worker pool and the live beam-stream/direct-stream
/// handlers so the concurrency cap is global, not per I/O mode.
pub struct TranscoderDriver {
    config: Arc<Config>,
    registry: JobRegistry,
    permits: Arc<Semaphore>,
}

impl TranscoderDriver {
    pub fn new(config: Arc<Config>, registry: JobRegistry) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        TranscoderDriver {
            config,
            registry,
            permits,
        }
    }

}

#[async_trait::async_trait]
impl JobRunner for TranscoderDriver {
    async fn run(&self, job_id: &str, cancel: CancellationToken) {
        if let Err(err) = self.run_queued(job_id, cancel).await {
            error!("job {job_id} failed to run: {err:#}");
            if let Some(handle) = self.registry.get(job_id) {
                handle
                    .write()
                    .await
                    .mark_terminal(JobStatus::Failed, Some(err.to_string()));
            }
        }
    }
}

impl TranscoderDriver {
    /// Shared-filesystem and beam-upload jobs: both read from a local path
    /// (the uploaded file or the path-mapped original) and write into the
    /// job's temp output directory, with `ffmpeg` run entirely detached from
    /// any live HTTP connection.
    async fn run_queued(&self, job_id: &str, cancel: CancellationToken) -> Result<()> {
        let _permit = self.permits.acquire().await.context("driver shut down")?;

        let handle = self
            .registry
            .get(job_id)
            .context("job vanished before it could be run")?;
        let (spec, output_dir) = {
            let job = handle.read().await;
            (job.spec.clone(), job.output_dir.clone())
        };
        tokio::fs::create_dir_all(&output_dir).await.ok();

        let beam_upload_path = match (&spec.io_mode, &spec.input) {
            (IoMode::BeamUpload, InputDescriptor::File(p)) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        };
        let ctx = RewriteContext {
            config: &self.config,
            job_id,
            beam_stream: false,
            beam_upload_input: beam_upload_path.as_deref(),
            direct_stream_format: None,
        };
        let cmd_args = rewriter::rewrite(spec.dialect, &spec.raw_args, &ctx);

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(&cmd_args)
            .current_dir(&output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("failed to spawn ffmpeg")?;
        let pid = child.id();
        handle.write().await.mark_running(pid);
        self.registry.publish(job_id, Default::default());

        let duration_secs = match &spec.input {
            InputDescriptor::File(path) => self.probe_duration_secs(path).await,
            _ => None,
        };
        let outcome = self.supervise(job_id, &mut child, duration_secs, cancel).await;
        finalize(&self.registry, job_id, &output_dir, &spec.output.kind, outcome).await;
        Ok(())
    }

    /// Best-effort source duration via `ffprobe`, used only to turn the
    /// progress parser's `out_time`/`total_duration` into a percentage. A
    /// failed probe (missing file, URL input, unreadable container) just
    /// means progress stays duration-less; it never fails the job itself.
    async fn probe_duration_secs(&self, path: &std::path::Path) -> Option<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// Input streamed in over the HTTP request body, via `ffmpeg`'s stdin.
    /// Output still lands on the shared filesystem (HLS/DASH segments).
    pub async fn run_beam_stream(
        &self,
        job_id: &str,
        mut body: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let _permit = self.permits.acquire().await.context("driver shut down")?;

        let handle = self
            .registry
            .get(job_id)
            .context("job vanished before it could be run")?;
        let (spec, output_dir, cancel) = {
            let job = handle.read().await;
            (job.spec.clone(), job.output_dir.clone(), job.cancel.clone())
        };
        tokio::fs::create_dir_all(&output_dir).await.ok();

        let ctx = RewriteContext {
            config: &self.config,
            job_id,
            beam_stream: true,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd_args = rewriter::rewrite(spec.dialect, &spec.raw_args, &ctx);

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(&cmd_args)
            .current_dir(&output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("failed to spawn ffmpeg")?;
        let pid = child.id();
        handle.write().await.mark_running(pid);

        let mut stdin = child.stdin.take().context("ffmpeg stdin not piped")?;
        let forward = tokio::spawn(async move {
            while let Some(chunk) = body.recv().await {
                for piece in chunk.chunks(BEAM_STREAM_CHUNK) {
                    if let Err(err) = stdin.write_all(piece).await {
                        if err.kind() == std::io::ErrorKind::BrokenPipe {
                            return;
                        }
                        warn!("beam-stream write to ffmpeg stdin failed: {err}");
                        return;
                    }
                }
            }
            let _ = stdin.shutdown().await;
        });

        let outcome = self.supervise(job_id, &mut child, None, cancel).await;
        forward.abort();
        finalize(&self.registry, job_id, &output_dir, &spec.output.kind, outcome).await;
        Ok(())
    }

    /// Output container streamed directly back as the HTTP response body.
    /// Caller disconnect (the returned sender failing to send) is treated as
    /// caller death: the subprocess is terminated, not left to run to
    /// completion against no one.
    pub async fn run_direct_stream(
        &self,
        job_id: &str,
        out_tx: mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let _permit = self.permits.acquire().await.context("driver shut down")?;

        let handle = self
            .registry
            .get(job_id)
            .context("job vanished before it could be run")?;
        let (spec, output_dir, cancel) = {
            let job = handle.read().await;
            (job.spec.clone(), job.output_dir.clone(), job.cancel.clone())
        };

        let format = match &spec.output.kind {
            crate::job::OutputKind::Stream(format) => format.clone(),
            _ => "mpegts".to_string(),
        };
        let ctx = RewriteContext {
            config: &self.config,
            job_id,
            beam_stream: false,
            beam_upload_input: None,
            direct_stream_format: Some(&format),
        };
        let cmd_args = rewriter::rewrite(spec.dialect, &spec.raw_args, &ctx);

        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(&cmd_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().context("failed to spawn ffmpeg")?;
        let pid = child.id();
        handle.write().await.mark_running(pid);

        let stderr_tail = spawn_stderr_reader(&mut child, self.config.log_ffmpeg_output);
        let mut stdout = child.stdout.take().context("ffmpeg stdout not piped")?;
        let mut buf = vec![0u8; DIRECT_STREAM_CHUNK];
        let mut first = true;

        let outcome: Result<(), anyhow::Error> = loop {
            let timeout = if first {
                DIRECT_STREAM_FIRST_BYTE_TIMEOUT
            } else {
                DIRECT_STREAM_READ_TIMEOUT
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    break Err(anyhow::anyhow!("cancelled"));
                }
                read = tokio::time::timeout(timeout, stdout.read(&mut buf)) => {
                    match read {
                        Err(_) => break Err(anyhow::anyhow!("stream timed out waiting for ffmpeg output")),
                        Ok(Err(err)) => break Err(err.into()),
                        Ok(Ok(0)) => break Ok(()),
                        Ok(Ok(n)) => {
                            first = false;
                            if out_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                // Caller disconnected; no one left to stream to.
                                break Err(anyhow::anyhow!("caller disconnected"));
                            }
                        }
                    }
                }
            }
        };

        let killed_for_disconnect = outcome.is_err();
        if killed_for_disconnect {
            terminate(pid).await;
        }
        let status = child.wait().await;

        if outcome.is_ok() {
            match status {
                Ok(s) if s.success() => {
                    mark(&self.registry, job_id, JobStatus::Completed, None).await;
                }
                Ok(s) => {
                    let tail = stderr_tail.lock().await.iter().cloned().collect::<Vec<_>>();
                    mark(
                        &self.registry,
                        job_id,
                        JobStatus::Failed,
                        Some(build_error_message(s.code(), &tail)),
                    )
                    .await;
                }
                Err(err) => {
                    mark(&self.registry, job_id, JobStatus::Failed, Some(err.to_string())).await;
                }
            }
        } else {
            mark(
                &self.registry,
                job_id,
                JobStatus::Cancelled,
                outcome.err().map(|e| e.to_string()),
            )
            .await;
        }
        Ok(())
    }

    /// Common subprocess supervision used by the two pipe-based modes:
    /// reads `-progress pipe:1` lines from stdout, always runs a concurrent
    /// stderr reader, and honors cancellation with SIGTERM then SIGKILL.
    async fn supervise(
        &self,
        job_id: &str,
        child: &mut Child,
        duration_secs: Option<f64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let pid = child.id();
        let stderr_tail = spawn_stderr_reader(child, self.config.log_ffmpeg_output);
        let stdout = child.stdout.take().context("ffmpeg stdout not piped")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new(duration_secs);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(pid).await;
                    let _ = child.wait().await;
                    return Err(anyhow::anyhow!("cancelled"));
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(snapshot) = parser.feed_line(&line) {
                                let done = snapshot.done;
                                self.registry.publish(job_id, snapshot.clone());
                                if let Some(handle) = self.registry.get(job_id) {
                                    handle.write().await.apply_progress(snapshot);
                                }
                                if done {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!("job {job_id} progress read failed: {err}");
                            break;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.context("waiting for ffmpeg exit")?;
        if status.success() {
            Ok(())
        } else {
            let tail = stderr_tail.lock().await.iter().cloned().collect::<Vec<_>>();
            Err(anyhow::anyhow!(build_error_message(status.code(), &tail)))
        }
    }
}

fn spawn_stderr_reader(child: &mut Child, log_output: bool) -> Arc<Mutex<VecDeque<String>>> {
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    if let Some(stderr) = child.stderr.take() {
        let tail = tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if log_output {
                    debug!(target: "ffmpeg", "{line}");
                }
                let mut guard = tail.lock().await;
                if guard.len() == STDERR_TAIL_LINES {
                    guard.pop_front();
                }
                guard.push_back(line);
            }
        });
    }
    tail
}

fn build_error_message(exit_code: Option<i32>, tail: &[String]) -> String {
    let code = exit_code.unwrap_or(-1);
    if tail.is_empty() {
        format!("ffmpeg exited with status {code}")
    } else {
        format!("ffmpeg exited with status {code}\n{}", tail.join("\n"))
    }
}

/// Terminal-status bookkeeping only; the output directory itself is left in
/// place. Segment trees (HLS/DASH) are never removed here regardless of
/// outcome — partial segments are as valid as any other straggler file and
/// the janitor's terminal reaper (`TERMINAL_RETENTION`) is the single place
/// that deletes a job's directory, after the 60s grace period callers rely
/// on to fetch a final status or remaining segments. A failed single-file
/// output is the one case worth cleaning up early, since a half-written file
/// at the job's advertised path could otherwise be mistaken for a finished one.
async fn finalize(
    registry: &JobRegistry,
    job_id: &str,
    output_dir: &PathBuf,
    output_kind: &OutputKind,
    outcome: Result<()>,
) {
    match outcome {
        Ok(()) => mark(registry, job_id, JobStatus::Completed, None).await,
        Err(err) if err.to_string() == "cancelled" => {
            mark(registry, job_id, JobStatus::Cancelled, None).await;
        }
        Err(err) => {
            if matches!(output_kind, OutputKind::File) {
                remove_partial_output(output_dir).await;
            }
            mark(registry, job_id, JobStatus::Failed, Some(err.to_string())).await;
        }
    }
}

async fn remove_partial_output(output_dir: &PathBuf) {
    let _ = tokio::fs::remove_dir_all(output_dir).await;
}

async fn mark(registry: &JobRegistry, job_id: &str, status: JobStatus, error: Option<String>) {
    if let Some(handle) = registry.get(job_id) {
        handle.write().await.mark_terminal(status, error);
    }
    info!("job {job_id} reached terminal status {status:?}");
}

#[cfg(unix)]
async fn terminate(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let nix_pid = Pid::from_raw(pid as i32);
    if kill(nix_pid, Signal::SIGTERM).is_err() {
        return;
    }
    tokio::time::sleep(SIGTERM_GRACE).await;
    let _ = kill(nix_pid, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Dialect, JobSpec, OutputDescriptor};

    fn job_spec(kind: OutputKind) -> JobSpec {
        JobSpec {
            input: InputDescriptor::File("/tmp/in.mkv".into()),
            output: OutputDescriptor {
                kind,
                segment_duration: None,
            },
            raw_args: vec![],
            dialect: Dialect::UpstreamB,
            max_bitrate: None,
            io_mode: IoMode::SharedFilesystem,
        }
    }

    async fn registered_job(registry: &JobRegistry, id: &str, kind: OutputKind, dir: &std::path::Path) {
        let job = crate::job::Job::new(
            id.to_string(),
            job_spec(kind),
            dir.to_path_buf(),
            CancellationToken::new(),
        );
        registry.insert(job);
    }

    #[tokio::test]
    async fn failed_single_file_output_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&output_dir).await.unwrap();

        let registry = JobRegistry::new();
        registered_job(&registry, "j1", OutputKind::File, &output_dir).await;

        finalize(
            &registry,
            "j1",
            &output_dir,
            &OutputKind::File,
            Err(anyhow::anyhow!("boom")),
        )
        .await;

        assert!(!output_dir.exists());
        let handle = registry.get("j1").unwrap();
        assert_eq!(handle.read().await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn failed_segment_tree_output_is_left_for_the_janitor() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&output_dir).await.unwrap();

        let registry = JobRegistry::new();
        registered_job(&registry, "j1", OutputKind::Dash, &output_dir).await;

        finalize(
            &registry,
            "j1",
            &output_dir,
            &OutputKind::Dash,
            Err(anyhow::anyhow!("boom")),
        )
        .await;

        assert!(output_dir.exists());
        let handle = registry.get("j1").unwrap();
        assert_eq!(handle.read().await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_output_is_never_removed_here_regardless_of_kind() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        tokio::fs::create_dir_all(&output_dir).await.unwrap();

        let registry = JobRegistry::new();
        registered_job(&registry, "j1", OutputKind::File, &output_dir).await;

        finalize(
            &registry,
            "j1",
            &output_dir,
            &OutputKind::File,
            Err(anyhow::anyhow!("cancelled")),
        )
        .await;

        assert!(output_dir.exists());
        let handle = registry.get("j1").unwrap();
        assert_eq!(handle.read().await.status, JobStatus::Cancelled);
    }
}
