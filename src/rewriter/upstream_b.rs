//! Rewriter for the "upstream-B" dialect: stock FFmpeg commands. Unlike
//! upstream-A, these are rewritten with targeted in-place replacements
//! rather than a full rebuild, since a stock command's structure is already
//! something a local FFmpeg understands.

use crate::config::{Accelerator, Config};
use crate::path_mapper::map_path;
use crate::rewriter::ffmpeg_args::{encoder_name, hwaccel_init_args, inject_before_input, CodecFamily};

const VIDEO_CODEC_FLAGS: &[&str] = &["-c:v", "-codec:v:0", "-codec:0", "-c:v:0", "-vcodec"];

fn strip_file_prefix(arg: &str) -> String {
    if let Some(inner) = arg.strip_prefix("file:\"").and_then(|s| s.strip_suffix('"')) {
        inner.to_string()
    } else if let Some(inner) = arg.strip_prefix("file:") {
        inner.to_string()
    } else {
        arg.to_string()
    }
}

fn detect_hw_replace(raw_args: &[String]) -> Option<CodecFamily> {
    for i in 0..raw_args.len() {
        if VIDEO_CODEC_FLAGS.contains(&raw_args[i].as_str()) {
            match raw_args.get(i + 1).map(|s| s.as_str()) {
                Some("libx264") => return Some(CodecFamily::H264),
                Some("libx265") => return Some(CodecFamily::Hevc),
                _ => {}
            }
        }
    }
    None
}

/// Convert a software `-vf` value to its accelerator-native equivalent.
/// Returns `None` if any stage beyond `scale=`/`format=`/`setparams` is
/// present, in which case the caller must keep the original filter and skip
/// hardware decode (conversion is abandoned, not best-effort).
fn convert_vf(value: &str, accel: Accelerator) -> Option<String> {
    let mut scale: Option<(String, String)> = None;
    for stage in value.split(',') {
        let stage = stage.trim();
        if let Some(rest) = stage.strip_prefix("scale=") {
            let (w, h) = rest.split_once(':')?;
            scale = Some((w.to_string(), h.to_string()));
        } else if stage.starts_with("format=") || stage.starts_with("setparams") {
            // dropped: metadata-only stage
        } else {
            return None;
        }
    }
    let (w, h) = scale?;
    Some(match accel {
        // scale_qsv only understands -1 for auto-height, unlike the software
        // scale filter's -2; any negative placeholder is normalized to that.
        Accelerator::Qsv => {
            let h = if h.starts_with('-') { "-1".to_string() } else { h };
            format!("scale_qsv=w={w}:h={h}:format=nv12")
        }
        Accelerator::Nvenc => format!("scale_cuda={w}:{h}:format=nv12"),
        Accelerator::Vaapi => format!("scale={w}:{h},format=nv12,hwupload"),
        Accelerator::None => return None,
    })
}

fn remap_x264_preset(value: &str) -> String {
    match value {
        "ultrafast" | "superfast" => "veryfast".to_string(),
        other => other.to_string(),
    }
}

pub fn rewrite(raw_args: &[String], config: &Config) -> Vec<String> {
    let accel = config.accelerator;
    let hw_family = detect_hw_replace(raw_args);
    let needs_hw_replace = hw_family.is_some() && accel != Accelerator::None;

    let mut out: Vec<String> = Vec::with_capacity(raw_args.len());
    let mut vf_existed = false;
    let mut vf_abandoned = false;
    let mut skip_next = false;

    for i in 0..raw_args.len() {
        if skip_next {
            skip_next = false;
            continue;
        }
        let arg = strip_file_prefix(&raw_args[i]);
        let arg = map_path(&config.path_mappings, &arg);
        let next = raw_args.get(i + 1).map(|s| s.as_str());

        if VIDEO_CODEC_FLAGS.contains(&arg.as_str()) && matches!(next, Some("libx264") | Some("libx265")) {
            if needs_hw_replace {
                out.push(arg);
                out.push(encoder_name(accel, hw_family.unwrap()).to_string());
                match accel {
                    Accelerator::Qsv => {
                        out.push("-low_power".into());
                        out.push("1".into());
                        out.push("-async_depth".into());
                        out.push("1".into());
                    }
                    Accelerator::Nvenc => {
                        out.push("-tune".into());
                        out.push("ull".into());
                    }
                    _ => {}
                }
                // Per-accelerator bitrate cap for beam jobs, mirroring the
                // NVENC-only handling upstream-A applies at the same point.
                if let Some(cap) = config.beam_max_bitrate.as_deref() {
                    out.push("-b:v".into());
                    out.push(cap.to_string());
                }
                skip_next = true;
                continue;
            } else if accel == Accelerator::None {
                out.push(arg);
                out.push(next.unwrap_or_default().to_string());
                if let Some(cap) = config.beam_max_bitrate.as_deref() {
                    out.push("-b:v".into());
                    out.push(cap.to_string());
                    out.push("-maxrate".into());
                    out.push(cap.to_string());
                }
                skip_next = true;
                continue;
            }
        }

        if needs_hw_replace && arg == "-vf" {
            vf_existed = true;
            let original = next.unwrap_or_default();
            match convert_vf(original, accel) {
                Some(converted) => {
                    out.push("-vf".into());
                    out.push(converted);
                }
                None => {
                    vf_abandoned = true;
                    out.push("-vf".into());
                    out.push(original.to_string());
                }
            }
            skip_next = true;
            continue;
        }

        if needs_hw_replace && (arg == "-maxrate" || arg == "-bufsize") {
            skip_next = true;
            continue;
        }

        if needs_hw_replace && arg.starts_with("-x264opts") {
            skip_next = true;
            continue;
        }

        if needs_hw_replace
            && accel == Accelerator::Qsv
            && (arg == "-crf" || arg == "-crf:0")
        {
            out.push("-global_quality".into());
            out.push(next.unwrap_or_default().to_string());
            skip_next = true;
            continue;
        }

        if needs_hw_replace
            && accel == Accelerator::Vaapi
            && (arg == "-preset" || arg == "-preset:0")
        {
            skip_next = true;
            continue;
        }

        if needs_hw_replace
            && matches!(accel, Accelerator::Qsv | Accelerator::Nvenc)
            && (arg == "-preset" || arg == "-preset:0")
        {
            out.push(arg);
            out.push(remap_x264_preset(next.unwrap_or_default()));
            skip_next = true;
            continue;
        }

        if arg == "libfdk_aac" {
            out.push("aac".into());
            continue;
        }

        if arg == "-hls_playlist_type" {
            out.push(arg);
            let value = next.unwrap_or_default();
            out.push(if value == "vod" { "event".to_string() } else { value.to_string() });
            skip_next = true;
            continue;
        }

        out.push(arg);
    }

    let _ = vf_existed;
    if needs_hw_replace && !vf_abandoned {
        let init = hwaccel_init_args(accel, config.device.as_deref());
        inject_before_input(&mut out, init);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Accelerator;

    fn test_config(accel: Accelerator) -> Config {
        Config {
            host: "0.0.0.0".into(),
            port: 8765,
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            accelerator: accel,
            device: None,
            qsv_preset: "veryfast".into(),
            qsv_quality: 25,
            qsv_low_power: true,
            nvenc_preset: "p1".into(),
            nvenc_tune: "ull".into(),
            nvenc_gpu: 0,
            temp_dir: "/tmp/plexbeam".into(),
            log_dir: "/tmp/plexbeam/logs".into(),
            shared_output_dir: None,
            path_mappings: vec![],
            max_concurrent_jobs: 2,
            job_timeout: 3600,
            segment_timeout: 30,
            beam_max_bitrate: None,
            cleanup_temp_after_hours: 24,
            log_ffmpeg_output: true,
            api_key: None,
            ffmpeg_major_version: None,
        }
    }

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn qsv_hw_replace_renames_crf_and_converts_scale() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-crf", "23", "-vf",
            "scale=1920:-2,format=yuv420p", "-c:a", "aac", "-f", "dash", "dash",
        ]);
        let config = test_config(Accelerator::Qsv);
        let cmd = rewrite(&raw, &config);
        assert!(cmd.iter().any(|a| a == "h264_qsv"));
        assert!(!cmd.iter().any(|a| a == "libx264"));
        let global_q_idx = cmd.iter().position(|a| a == "-global_quality").unwrap();
        assert_eq!(cmd[global_q_idx + 1], "23");
        assert!(cmd.iter().any(|a| a.starts_with("scale_qsv=w=1920:h=-1")));
        let hwaccel_idx = cmd.iter().position(|a| a == "-hwaccel").unwrap();
        let i_idx = cmd.iter().position(|a| a == "-i").unwrap();
        assert!(hwaccel_idx < i_idx);
    }

    #[test]
    fn no_accelerator_leaves_software_path_untouched() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-crf", "23", "-vf", "scale=1920:-2",
            "-c:a", "aac", "-f", "dash", "dash",
        ]);
        let config = test_config(Accelerator::None);
        let cmd = rewrite(&raw, &config);
        assert!(cmd.iter().any(|a| a == "libx264"));
        assert!(cmd.iter().any(|a| a == "-crf"));
        assert!(cmd.iter().any(|a| a == "scale=1920:-2"));
        assert!(!cmd.iter().any(|a| a == "-hwaccel"));
    }

    #[test]
    fn subtitle_burn_in_vf_abandons_conversion_and_skips_hwaccel() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-vf", "subtitles=/m/subs.srt",
            "-c:a", "aac", "-f", "dash", "dash",
        ]);
        let config = test_config(Accelerator::Vaapi);
        let cmd = rewrite(&raw, &config);
        assert!(cmd.iter().any(|a| a == "subtitles=/m/subs.srt"));
        assert!(!cmd.iter().any(|a| a == "-hwaccel"));
    }

    #[test]
    fn strips_maxrate_bufsize_and_x264opts() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-maxrate", "8M", "-bufsize", "16M",
            "-x264opts", "no-scenecut", "-c:a", "aac", "-f", "dash", "dash",
        ]);
        let config = test_config(Accelerator::Qsv);
        let cmd = rewrite(&raw, &config);
        assert!(!cmd.iter().any(|a| a == "-maxrate"));
        assert!(!cmd.iter().any(|a| a == "-bufsize"));
        assert!(!cmd.iter().any(|a| a == "-x264opts"));
        assert!(!cmd.iter().any(|a| a == "8M"));
    }

    #[test]
    fn libfdk_aac_always_replaced() {
        let raw = args(&["-i", "/m/x.mkv", "-c:a", "libfdk_aac", "-f", "dash", "dash"]);
        let config = test_config(Accelerator::None);
        let cmd = rewrite(&raw, &config);
        assert!(!cmd.iter().any(|a| a == "libfdk_aac"));
        assert!(cmd.iter().any(|a| a == "aac"));
    }

    #[test]
    fn hls_playlist_type_vod_becomes_event() {
        let raw = args(&["-i", "/m/x.mkv", "-hls_playlist_type", "vod", "out.m3u8"]);
        let config = test_config(Accelerator::None);
        let cmd = rewrite(&raw, &config);
        let idx = cmd.iter().position(|a| a == "-hls_playlist_type").unwrap();
        assert_eq!(cmd[idx + 1], "event");
    }

    #[test]
    fn beam_max_bitrate_caps_qsv_hw_replace_output() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-crf", "23", "-c:a", "aac",
            "-f", "dash", "dash",
        ]);
        let config = Config {
            beam_max_bitrate: Some("4M".to_string()),
            ..test_config(Accelerator::Qsv)
        };
        let cmd = rewrite(&raw, &config);
        let idx = cmd.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(cmd[idx + 1], "4M");
    }

    #[test]
    fn beam_max_bitrate_caps_software_output_with_maxrate() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-crf", "23", "-c:a", "aac",
            "-f", "dash", "dash",
        ]);
        let config = Config {
            beam_max_bitrate: Some("4M".to_string()),
            ..test_config(Accelerator::None)
        };
        let cmd = rewrite(&raw, &config);
        assert!(cmd.iter().any(|a| a == "libx264"));
        let bv_idx = cmd.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(cmd[bv_idx + 1], "4M");
        let maxrate_idx = cmd.iter().position(|a| a == "-maxrate").unwrap();
        assert_eq!(cmd[maxrate_idx + 1], "4M");
    }

    #[test]
    fn ultrafast_preset_remapped_for_qsv() {
        let raw = args(&[
            "-i", "/m/x.mkv", "-c:v", "libx264", "-preset", "ultrafast", "-c:a", "aac",
            "-f", "dash", "dash",
        ]);
        let config = test_config(Accelerator::Qsv);
        let cmd = rewrite(&raw, &config);
        let idx = cmd.iter().position(|a| a == "-preset").unwrap();
        assert_eq!(cmd[idx + 1], "veryfast");
    }
}
