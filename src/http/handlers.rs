use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::http::state::AppState;
use crate::job::{Dialect, InputDescriptor, IoMode, Job, JobSpec, JobStatus, OutputDescriptor, OutputKind};
use crate::path_mapper::map_path;
use crate::registry::JobSummary;

#[derive(Debug, Deserialize)]
pub struct InputDto {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutputDto {
    #[serde(rename = "type")]
    pub kind: String,
    pub segment_duration: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ArgumentsDto {
    pub raw_args: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TranscodeRequest {
    pub job_id: String,
    pub input: InputDto,
    pub output: OutputDto,
    pub arguments: ArgumentsDto,
    pub source: String,
    pub beam_stream: Option<bool>,
    pub max_bitrate: Option<String>,
    #[allow(dead_code)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TranscodeResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

pub(crate) fn parse_dialect(source: &str) -> AppResult<Dialect> {
    match source {
        "upstream-A" => Ok(Dialect::UpstreamA),
        "upstream-B" => Ok(Dialect::UpstreamB),
        other => Err(AppError::BadRequest(format!(
            "unknown source dialect: {other}"
        ))),
    }
}

fn parse_output_kind(kind: &str) -> AppResult<OutputKind> {
    match kind {
        "hls" => Ok(OutputKind::Hls),
        "dash" => Ok(OutputKind::Dash),
        "file" => Ok(OutputKind::File),
        other => Err(AppError::BadRequest(format!(
            "unknown output type: {other}"
        ))),
    }
}

/// `beam_stream` always wins over `input.type`: the job is driven over
/// stdin with no local input path, registered but never enqueued (the
/// caller connects separately via `/beam/stream/{job_id}`).
fn resolve_input(
    state: &AppState,
    job_id: &str,
    dto: &InputDto,
    beam_stream: bool,
) -> AppResult<(InputDescriptor, IoMode)> {
    if beam_stream {
        return Ok((InputDescriptor::Stdin, IoMode::BeamStream));
    }
    match dto.kind.as_str() {
        "file" => {
            let path = dto.path.as_deref().ok_or_else(|| {
                AppError::BadRequest("input.path required for input.type=file".into())
            })?;
            let mapped = map_path(&state.config.path_mappings, path);
            Ok((
                InputDescriptor::File(PathBuf::from(mapped)),
                IoMode::SharedFilesystem,
            ))
        }
        "url" => {
            let url = dto.url.as_deref().ok_or_else(|| {
                AppError::BadRequest("input.url required for input.type=url".into())
            })?;
            Ok((
                InputDescriptor::Url(url.to_string()),
                IoMode::SharedFilesystem,
            ))
        }
        "beam_upload" => Ok((
            InputDescriptor::File(state.config.job_dir(job_id).join("input")),
            IoMode::BeamUpload,
        )),
        other => Err(AppError::BadRequest(format!("unknown input type: {other}"))),
    }
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ffmpeg_ok = Command::new(&state.config.ffmpeg_path)
        .arg("-version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    Json(json!({
        "status": "ok",
        "accelerator": state.config.accelerator.as_str(),
        "active_jobs": state.registry.running_count().await,
        "ffmpeg_ok": ffmpeg_ok,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ProbeQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    pub duration: f64,
}

pub async fn probe(
    State(state): State<AppState>,
    Query(query): Query<ProbeQuery>,
) -> AppResult<Json<ProbeResponse>> {
    let mapped = map_path(&state.config.path_mappings, &query.path);
    let output = Command::new(&state.config.ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            mapped.as_str(),
        ])
        .output()
        .await
        .map_err(|err| AppError::Internal(err.into()))?;

    if !output.status.success() {
        return Err(AppError::BadRequest(format!("ffprobe failed for {mapped}")));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = text.trim().parse().map_err(|_| {
        AppError::BadRequest(format!("ffprobe returned no duration for {mapped}"))
    })?;
    Ok(Json(ProbeResponse { duration }))
}

pub async fn transcode(
    State(state): State<AppState>,
    Json(req): Json<TranscodeRequest>,
) -> AppResult<Json<TranscodeResponse>> {
    let dialect = parse_dialect(&req.source)?;
    let beam_stream = req.beam_stream.unwrap_or(false);
    let (input, io_mode) = resolve_input(&state, &req.job_id, &req.input, beam_stream)?;
    let output = OutputDescriptor {
        kind: parse_output_kind(&req.output.kind)?,
        segment_duration: req.output.segment_duration,
    };

    let spec = JobSpec {
        input,
        output,
        raw_args: req.arguments.raw_args,
        dialect,
        max_bitrate: req.max_bitrate,
        io_mode,
    };

    let output_dir = state.config.job_dir(&req.job_id);
    let job = Job::new(req.job_id.clone(), spec, output_dir, CancellationToken::new());
    state.registry.insert(job);

    if beam_stream {
        info!(job_id = %req.job_id, "registered beam-stream job; awaiting /beam/stream connection");
    } else {
        state
            .scheduler
            .enqueue(&state.registry, req.job_id.clone())
            .await;
    }

    Ok(Json(TranscodeResponse {
        job_id: req.job_id,
        status: if beam_stream {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        },
        message: "accepted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RawTranscodeQuery {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RawTranscodeRequest {
    pub raw_args: Vec<String>,
    pub beam_stream: Option<bool>,
    pub max_bitrate: Option<String>,
}

/// `/transcode/raw`: a parsed-args shortcut used by upstream-A, which
/// already encodes its input path, output format, and output path inside
/// `raw_args` itself (see the dialect-A extraction rules) — so the job's
/// own input/output descriptors here only need to be good enough to pick
/// an I/O mode and an output directory.
pub async fn transcode_raw(
    State(state): State<AppState>,
    Query(query): Query<RawTranscodeQuery>,
    Json(req): Json<RawTranscodeRequest>,
) -> AppResult<Json<TranscodeResponse>> {
    let job_id = query.job_id;
    let beam_stream = req.beam_stream.unwrap_or(false);
    let (input, io_mode) = if beam_stream {
        (InputDescriptor::Stdin, IoMode::BeamStream)
    } else {
        (InputDescriptor::File(PathBuf::new()), IoMode::SharedFilesystem)
    };

    let spec = JobSpec {
        input,
        output: OutputDescriptor {
            kind: OutputKind::Dash,
            segment_duration: None,
        },
        raw_args: req.raw_args,
        dialect: Dialect::UpstreamA,
        max_bitrate: req.max_bitrate,
        io_mode,
    };

    let output_dir = state.config.job_dir(&job_id);
    let job = Job::new(job_id.clone(), spec, output_dir, CancellationToken::new());
    state.registry.insert(job);

    if !beam_stream {
        state.scheduler.enqueue(&state.registry, job_id.clone()).await;
    }

    Ok(Json(TranscodeResponse {
        job_id,
        status: if beam_stream {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        },
        message: "accepted".to_string(),
    }))
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobSummary>> {
    let handle = state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(job_id.clone()))?;
    let mut job = handle.write().await;
    job.mark_polled();
    Ok(Json(JobSummary::from(&*job)))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let handle = state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(job_id.clone()))?;
    let mut job = handle.write().await;
    if !job.status.is_terminal() {
        if job.status == JobStatus::Queued {
            // No subprocess and no driver task watching it: there is no one
            // else who will ever flip this job out of `queued`.
            job.mark_terminal(JobStatus::Cancelled, None);
        }
        job.cancel.cancel();
    }
    Ok(Json(json!({ "job_id": job_id, "status": job.status })))
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.registry.list_summaries().await)
}
