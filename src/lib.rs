//! Remote GPU transcoding worker: an HTTP service that rewrites caller-supplied
//! FFmpeg argument vectors for a locally configured hardware accelerator,
//! supervises the resulting subprocess, and serves its progress and output
//! back to the caller.

pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod janitor;
pub mod job;
pub mod path_mapper;
pub mod progress;
pub mod registry;
pub mod rewriter;
pub mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::driver::TranscoderDriver;
use crate::http::AppState;
use crate::janitor::Janitor;
use crate::registry::JobRegistry;
use crate::scheduler::{JobRunner, Scheduler};

/// Grace period `main` waits for in-flight jobs to observe the shutdown
/// signal and finish draining before the process exits regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builds the router and `AppState` without binding a listener or installing
/// signal handlers, so integration tests can drive the HTTP surface
/// in-process instead of over a real socket. `shutdown` gates both the
/// scheduler's worker loops and (via the caller's own
/// `with_graceful_shutdown`) the HTTP server itself, so both stop on the
/// same signal.
pub async fn build_app(config: Arc<Config>, shutdown: CancellationToken) -> anyhow::Result<axum::Router> {
    let registry = JobRegistry::new();
    let driver = Arc::new(TranscoderDriver::new(config.clone(), registry.clone()));
    let scheduler = Arc::new(Scheduler::new(
        registry.clone(),
        driver.clone() as Arc<dyn JobRunner>,
        config.max_concurrent_jobs,
        shutdown,
    ));
    let janitor = Arc::new(Janitor::spawn(registry.clone(), config.clone()));

    let state = AppState {
        config,
        registry,
        scheduler,
        driver,
        janitor,
    };
    Ok(http::create_app(state))
}

/// Loads configuration, verifies `ffmpeg` is reachable, binds the listener,
/// and serves until a shutdown signal arrives and the grace period elapses.
pub async fn run() -> anyhow::Result<()> {
    let mut config = Config::load().context("failed to load configuration")?;
    config
        .ensure_directories()
        .context("failed to create temp/log/shared-output directories")?;

    let major_version = check_ffmpeg_reachable(&config).await?;
    config.set_ffmpeg_major_version(major_version);
    let config = Arc::new(config);

    info!(
        accelerator = config.accelerator.as_str(),
        port = config.port,
        ffmpeg_major_version = ?config.ffmpeg_major_version,
        "worker configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let app = build_app(config.clone(), shutdown.clone()).await?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port configuration")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    info!("shutdown signal received, draining in-flight jobs for up to {SHUTDOWN_GRACE:?}");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("worker shut down cleanly");
    Ok(())
}

/// A missing or unexecutable FFmpeg binary is a fatal startup condition:
/// every job this worker ever runs depends on it. Returns the parsed major
/// version from the `-version` banner, when it could be parsed, so rewrite
/// rules that changed across ffmpeg releases (e.g. the `ochl=`/`ocl=` filter
/// rename dropped in ffmpeg 5) can be applied correctly.
async fn check_ffmpeg_reachable(config: &Config) -> anyhow::Result<Option<u32>> {
    let output = Command::new(&config.ffmpeg_path)
        .arg("-version")
        .stdin(std::process::Stdio::null())
        .output()
        .await;

    let output = match output {
        Ok(output) if output.status.success() => output,
        _ => {
            error!(
                ffmpeg_path = %config.ffmpeg_path,
                "ffmpeg binary is not reachable; refusing to start"
            );
            anyhow::bail!("ffmpeg binary not reachable at {}", config.ffmpeg_path);
        }
    };

    let banner = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ffmpeg_major_version(&banner))
}

/// Parses the leading `ffmpeg version N....` line of an `ffmpeg -version`
/// banner. Returns `None` for anything that doesn't start with a bare
/// integer (custom/vendor version strings), rather than guessing.
fn parse_ffmpeg_major_version(banner: &str) -> Option<u32> {
    let first_line = banner.lines().next()?;
    let version_token = first_line.strip_prefix("ffmpeg version ")?.split(' ').next()?;
    let major = version_token.split(['.', '-']).next()?;
    major.parse().ok()
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            warn!("failed to install SIGTERM handler: {err}");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
}
