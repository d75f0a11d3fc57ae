use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::http::handlers::parse_dialect;
use crate::http::state::AppState;
use crate::job::{InputDescriptor, IoMode, Job, JobSpec, JobStatus, OutputDescriptor, OutputKind};
use crate::path_mapper::map_path;

const DIRECT_STREAM_CHANNEL_CAPACITY: usize = 4;
const BEAM_STREAM_CHANNEL_CAPACITY: usize = 8;

fn content_type_for_format(format: &str) -> &'static str {
    match format {
        "mpegts" => "video/mp2t",
        "matroska" | "webm" => "video/webm",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    if filename.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if filename.ends_with(".mpd") {
        "application/dash+xml"
    } else if filename.ends_with(".ts") {
        "video/mp2t"
    } else if filename.ends_with(".m4s") || filename.ends_with(".mp4") {
        "video/mp4"
    } else {
        "application/octet-stream"
    }
}

fn validate_filename(name: &str) -> AppResult<()> {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(AppError::BadRequest(format!("invalid filename: {name}")));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct StreamTranscodeRequest {
    pub job_id: Option<String>,
    pub input_path: String,
    pub format: String,
    pub raw_args: Vec<String>,
    pub source: String,
}

/// `/transcode/stream`: started inline rather than via the scheduler (per
/// the control-flow split between queued and live I/O modes), with the
/// response body fed directly from the subprocess as it produces output.
pub async fn transcode_stream(
    State(state): State<AppState>,
    Json(req): Json<StreamTranscodeRequest>,
) -> AppResult<Response> {
    let dialect = parse_dialect(&req.source)?;
    let job_id = req.job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mapped_input = map_path(&state.config.path_mappings, &req.input_path);

    let spec = JobSpec {
        input: InputDescriptor::File(PathBuf::from(mapped_input)),
        output: OutputDescriptor {
            kind: OutputKind::Stream(req.format.clone()),
            segment_duration: None,
        },
        raw_args: req.raw_args,
        dialect,
        max_bitrate: None,
        io_mode: IoMode::DirectStream,
    };

    let output_dir = state.config.job_dir(&job_id);
    let job = Job::new(job_id.clone(), spec, output_dir, CancellationToken::new());
    state.registry.insert(job);

    let (tx, rx) = mpsc::channel::<Bytes>(DIRECT_STREAM_CHANNEL_CAPACITY);
    let driver = state.driver.clone();
    let registry = state.registry.clone();
    let run_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(err) = driver.run_direct_stream(&run_job_id, tx).await {
            warn!("direct-stream job {run_job_id} failed: {err:#}");
            if let Some(handle) = registry.get(&run_job_id) {
                handle
                    .write()
                    .await
                    .mark_terminal(JobStatus::Failed, Some(err.to_string()));
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for_format(&req.format))
        .body(body)
        .map_err(|err| AppError::Internal(err.into()))
}

/// `/beam/stream/{job_id}`: the request body is forwarded into the
/// subprocess's stdin as it arrives; the handler does not return until the
/// subprocess exits.
pub async fn beam_stream(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    request: Request<Body>,
) -> AppResult<StatusCode> {
    state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(job_id.clone()))?;

    let (tx, rx) = mpsc::channel::<Bytes>(BEAM_STREAM_CHANNEL_CAPACITY);
    let mut body_stream = request.into_body().into_data_stream();
    let forward = tokio::spawn(async move {
        while let Some(chunk) = body_stream.next().await {
            match chunk {
                Ok(bytes) if tx.send(bytes).await.is_ok() => {}
                _ => break,
            }
        }
    });

    state
        .driver
        .run_beam_stream(&job_id, rx)
        .await
        .map_err(AppError::Internal)?;
    forward.abort();
    Ok(StatusCode::OK)
}

/// `/beam/upload/{job_id}`: writes the request body verbatim to
/// `<temp>/<job_id>/input`, the path a subsequent `/transcode` submission
/// with `input.type="beam_upload"` will read from.
pub async fn beam_upload(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    request: Request<Body>,
) -> AppResult<StatusCode> {
    let dir = state.config.job_dir(&job_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join("input");
    let mut file = tokio::fs::File::create(&path).await?;

    let mut body_stream = request.into_body().into_data_stream();
    while let Some(chunk) = body_stream.next().await {
        let chunk = chunk.map_err(|err| AppError::BadRequest(err.to_string()))?;
        file.write_all(&chunk).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_segments(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Vec<String>>> {
    let handle = state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(job_id.clone()))?;
    let output_dir = handle.read().await.output_dir.clone();

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(&output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "input" || name.ends_with(".tmp") {
            continue;
        }
        names.push(name);
    }
    Ok(Json(names))
}

pub async fn serve_segment(
    State(state): State<AppState>,
    Path((job_id, filename)): Path<(String, String)>,
) -> AppResult<Response> {
    validate_filename(&filename)?;
    let handle = state
        .registry
        .get(&job_id)
        .ok_or_else(|| AppError::NotFound(job_id.clone()))?;
    let output_dir = handle.read().await.output_dir.clone();

    let bytes = tokio::fs::read(output_dir.join(&filename))
        .await
        .map_err(|_| AppError::NotFound(filename.clone()))?;

    Ok((
        [(header::CONTENT_TYPE, content_type_for_filename(&filename))],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_filename_rejects_traversal_and_separators() {
        assert!(validate_filename("segment_000.ts").is_ok());
        assert!(validate_filename("../../etc/passwd").is_err());
        assert!(validate_filename("a/b.ts").is_err());
        assert!(validate_filename("a\\b.ts").is_err());
        assert!(validate_filename("init..mp4").is_err());
    }

    #[test]
    fn content_type_mapping_covers_known_segment_extensions() {
        assert_eq!(content_type_for_filename("index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for_filename("manifest.mpd"), "application/dash+xml");
        assert_eq!(content_type_for_filename("seg-1.ts"), "video/mp2t");
        assert_eq!(content_type_for_filename("seg-1.m4s"), "video/mp4");
        assert_eq!(content_type_for_filename("seg-1.bin"), "application/octet-stream");
    }

    #[test]
    fn content_type_for_direct_stream_formats() {
        assert_eq!(content_type_for_format("mpegts"), "video/mp2t");
        assert_eq!(content_type_for_format("matroska"), "video/webm");
        assert_eq!(content_type_for_format("mp4"), "video/mp4");
        assert_eq!(content_type_for_format("unknown"), "application/octet-stream");
    }
}
