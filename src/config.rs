use std::path::PathBuf;

use clap::Parser;

/// Hardware accelerator family selected for this worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accelerator {
    Qsv,
    Nvenc,
    Vaapi,
    None,
}

impl Accelerator {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "qsv" => Accelerator::Qsv,
            "nvenc" => Accelerator::Nvenc,
            "vaapi" => Accelerator::Vaapi,
            _ => Accelerator::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::Qsv => "qsv",
            Accelerator::Nvenc => "nvenc",
            Accelerator::Vaapi => "vaapi",
            Accelerator::None => "none",
        }
    }
}

/// Command-line / environment arguments. Every field is overridable via
/// either a flag or the `PLEX_WORKER_` prefixed environment variable,
/// matching the original worker's settings surface.
#[derive(Parser, Debug)]
#[command(name = "plexbeam-worker")]
#[command(about = "Remote GPU transcoding worker")]
struct Args {
    #[arg(long, env = "PLEX_WORKER_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PLEX_WORKER_PORT", default_value_t = 8765)]
    port: u16,

    #[arg(long, env = "PLEX_WORKER_FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg_path: String,

    #[arg(long, env = "PLEX_WORKER_FFPROBE_PATH", default_value = "ffprobe")]
    ffprobe_path: String,

    #[arg(long, env = "PLEX_WORKER_HW_ACCEL", default_value = "qsv")]
    hw_accel: String,

    #[arg(long, env = "PLEX_WORKER_QSV_DEVICE")]
    qsv_device: Option<String>,

    #[arg(long, env = "PLEX_WORKER_QSV_PRESET", default_value = "veryfast")]
    qsv_preset: String,

    #[arg(long, env = "PLEX_WORKER_QSV_QUALITY", default_value_t = 25)]
    qsv_quality: u32,

    #[arg(long, env = "PLEX_WORKER_QSV_LOW_POWER", default_value_t = true)]
    qsv_low_power: bool,

    #[arg(long, env = "PLEX_WORKER_NVENC_PRESET", default_value = "p1")]
    nvenc_preset: String,

    #[arg(long, env = "PLEX_WORKER_NVENC_TUNE", default_value = "ull")]
    nvenc_tune: String,

    #[arg(long, env = "PLEX_WORKER_NVENC_GPU", default_value_t = 0)]
    nvenc_gpu: u32,

    #[arg(long, env = "PLEX_WORKER_TEMP_DIR", default_value = "./transcode_temp")]
    temp_dir: PathBuf,

    #[arg(long, env = "PLEX_WORKER_LOG_DIR", default_value = "./logs")]
    log_dir: PathBuf,

    #[arg(long, env = "PLEX_WORKER_SHARED_OUTPUT_DIR")]
    shared_output_dir: Option<PathBuf>,

    #[arg(long, env = "PLEX_WORKER_MEDIA_PATH_FROM")]
    media_path_from: Option<String>,

    #[arg(long, env = "PLEX_WORKER_MEDIA_PATH_TO")]
    media_path_to: Option<String>,

    #[arg(long, env = "PLEX_WORKER_PATH_MAPPINGS")]
    path_mappings: Option<String>,

    #[arg(long, env = "PLEX_WORKER_MAX_CONCURRENT_JOBS", default_value_t = 2)]
    max_concurrent_jobs: usize,

    #[arg(long, env = "PLEX_WORKER_JOB_TIMEOUT", default_value_t = 3600)]
    job_timeout: u64,

    #[arg(long, env = "PLEX_WORKER_SEGMENT_TIMEOUT", default_value_t = 30)]
    segment_timeout: u64,

    #[arg(long, env = "PLEX_WORKER_BEAM_MAX_BITRATE")]
    beam_max_bitrate: Option<String>,

    #[arg(long, env = "PLEX_WORKER_CLEANUP_TEMP_AFTER_HOURS", default_value_t = 24)]
    cleanup_temp_after_hours: u64,

    #[arg(long, env = "PLEX_WORKER_LOG_FFMPEG_OUTPUT", default_value_t = true)]
    log_ffmpeg_output: bool,

    #[arg(long, env = "PLEX_WORKER_API_KEY")]
    api_key: Option<String>,
}

/// Process-wide immutable settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub accelerator: Accelerator,
    pub device: Option<String>,
    pub qsv_preset: String,
    pub qsv_quality: u32,
    pub qsv_low_power: bool,
    pub nvenc_preset: String,
    pub nvenc_tune: String,
    pub nvenc_gpu: u32,
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    pub shared_output_dir: Option<PathBuf>,
    /// (from, to) prefix rules, sorted longest-`from`-first.
    pub path_mappings: Vec<(String, String)>,
    pub max_concurrent_jobs: usize,
    pub job_timeout: u64,
    pub segment_timeout: u64,
    pub beam_max_bitrate: Option<String>,
    pub cleanup_temp_after_hours: u64,
    pub log_ffmpeg_output: bool,
    pub api_key: Option<String>,
    /// Major version of the configured `ffmpeg` binary, detected once at
    /// startup. `None` until `set_ffmpeg_major_version` runs, or if the
    /// version banner couldn't be parsed.
    pub ffmpeg_major_version: Option<u32>,
}

impl Config {
    /// Load from CLI args, environment variables and an optional `.env` file.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let args = Args::parse();
        Ok(Self::from_args(args))
    }

    fn from_args(args: Args) -> Self {
        let mut path_mappings = Vec::new();
        if let (Some(from), Some(to)) = (args.media_path_from, args.media_path_to) {
            path_mappings.push((from, to));
        }
        if let Some(raw) = args.path_mappings {
            for pair in raw.split(';') {
                let pair = pair.trim();
                if let Some((from, to)) = pair.split_once('=') {
                    path_mappings.push((from.trim().to_string(), to.trim().to_string()));
                }
            }
        }
        // Longest prefix first so e.g. /config/cache matches before /config.
        path_mappings.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let temp_dir = args
            .temp_dir
            .canonicalize()
            .unwrap_or(args.temp_dir.clone());
        let log_dir = args.log_dir.canonicalize().unwrap_or(args.log_dir.clone());

        Config {
            host: args.host,
            port: args.port,
            ffmpeg_path: args.ffmpeg_path,
            ffprobe_path: args.ffprobe_path,
            accelerator: Accelerator::parse(&args.hw_accel),
            device: args.qsv_device,
            qsv_preset: args.qsv_preset,
            qsv_quality: args.qsv_quality,
            qsv_low_power: args.qsv_low_power,
            nvenc_preset: args.nvenc_preset,
            nvenc_tune: args.nvenc_tune,
            nvenc_gpu: args.nvenc_gpu,
            temp_dir,
            log_dir,
            shared_output_dir: args.shared_output_dir,
            path_mappings,
            max_concurrent_jobs: args.max_concurrent_jobs,
            job_timeout: args.job_timeout,
            segment_timeout: args.segment_timeout,
            beam_max_bitrate: args.beam_max_bitrate,
            cleanup_temp_after_hours: args.cleanup_temp_after_hours,
            log_ffmpeg_output: args.log_ffmpeg_output,
            api_key: args.api_key,
            ffmpeg_major_version: None,
        }
    }

    /// Records the detected major version of the configured `ffmpeg`
    /// binary, used to decide whether the `ochl=` to `ocl=` filter rename
    /// (dropped upstream in ffmpeg 5) is still needed.
    pub fn set_ffmpeg_major_version(&mut self, version: Option<u32>) {
        self.ffmpeg_major_version = version;
    }

    /// Create temp/log/shared-output directories if they do not yet exist.
    ///
    /// Resolving these to absolute paths up front means a changed subprocess
    /// cwd can never turn a relative segment path into a doubly-nested one.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.temp_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        if let Some(dir) = &self.shared_output_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(job_id)
    }
}
