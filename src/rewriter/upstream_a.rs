//! Rewriter for the "upstream-A" dialect: a heavily customized FFmpeg fork
//! that emits non-standard options and accelerator-specific filter graphs.
//! Salvages semantically meaningful fields from the caller's command and
//! rebuilds a clean, accelerator-correct command from first principles,
//! rather than patching the original in place (see module-level rationale
//! in the design notes: partial edits break under the multi-way constraints
//! these commands encode).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{Accelerator, Config};
use crate::path_mapper::map_path;
use crate::rewriter::ffmpeg_args::{encoder_name, hwaccel_init_args, CodecFamily};

static HEX_STREAM_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"#0x([0-9A-Fa-f]+)").unwrap());
static ABSOLUTE_STREAM_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[0:([1-9][0-9]*)\]").unwrap());

/// Rewrite hex stream selectors (`#0x81`) to their decimal form (`129`),
/// wherever they appear.
fn rewrite_hex_stream_refs(input: &str) -> String {
    HEX_STREAM_REF
        .replace_all(input, |caps: &regex::Captures| {
            let value = u32::from_str_radix(&caps[1], 16).unwrap_or(0);
            value.to_string()
        })
        .into_owned()
}

/// Collapse `[0:N]` (N>=1) absolute stream labels to `[0:a:0]`, used only in
/// beam-stream mode where the piped container is a single-video-single-audio
/// remux so any non-zero absolute index necessarily means "the audio track".
fn collapse_beam_stream_refs(input: &str) -> String {
    ABSOLUTE_STREAM_REF
        .replace_all(input, "[0:a:0]")
        .into_owned()
}

fn rewrite_ochl(input: &str, ffmpeg_major_version: Option<u32>) -> String {
    if ffmpeg_major_version.map(|v| v < 5).unwrap_or(false) {
        input.replace("ochl=", "ocl=")
    } else {
        input.to_string()
    }
}

#[derive(Debug, Clone)]
struct AudioStream {
    map_ref: String,
    codec: Option<String>,
    bitrate: Option<String>,
    copy_prior_ss: Option<String>,
}

#[derive(Debug, Default)]
struct Extracted {
    input_path: Option<String>,
    seek: Option<String>,
    duration: Option<String>,
    start_at_zero: bool,
    copyts: bool,
    framerate: Option<String>,
    forced_keyframes: Option<String>,
    filter_complex: Option<String>,
    audio_streams: Vec<AudioStream>,
    metadata: Vec<(String, String)>,
    output_format: Option<String>,
    output_path: Option<String>,
    video_present: bool,
}

fn extract(raw_args: &[String]) -> Extracted {
    let mut out = Extracted {
        video_present: true,
        ..Default::default()
    };
    let mut map_values: Vec<String> = Vec::new();
    let mut i = 0;
    while i < raw_args.len() {
        let arg = raw_args[i].as_str();
        let next = raw_args.get(i + 1).map(|s| s.as_str());
        match arg {
            "-i" => {
                if let Some(v) = next {
                    out.input_path = Some(v.to_string());
                    i += 2;
                    continue;
                }
            }
            "-ss" => {
                if let Some(v) = next {
                    out.seek = Some(v.to_string());
                    i += 2;
                    continue;
                }
            }
            "-t" => {
                if let Some(v) = next {
                    out.duration = Some(v.to_string());
                    i += 2;
                    continue;
                }
            }
            "-start_at_zero" => {
                out.start_at_zero = true;
                i += 1;
                continue;
            }
            "-copyts" => {
                out.copyts = true;
                i += 1;
                continue;
            }
            "-vn" => {
                out.video_present = false;
                i += 1;
                continue;
            }
            "-filter_complex" => {
                if let Some(v) = next {
                    if v.contains("aresample") {
                        out.filter_complex = Some(v.to_string());
                    }
                    i += 2;
                    continue;
                }
            }
            "-f" => {
                if let Some(v) = next {
                    out.output_format = Some(v.to_string());
                    i += 2;
                    continue;
                }
            }
            "-map" => {
                if let Some(v) = next {
                    map_values.push(v.to_string());
                    i += 2;
                    continue;
                }
            }
            _ => {
                if let Some(rest) = arg.strip_prefix("-r:") {
                    let _ = rest;
                    if let Some(v) = next {
                        out.framerate = Some(v.to_string());
                        i += 2;
                        continue;
                    }
                } else if arg.starts_with("-force_key_frames:") {
                    if let Some(v) = next {
                        out.forced_keyframes = Some(v.to_string());
                        i += 2;
                        continue;
                    }
                } else if arg.starts_with("-metadata:s:") {
                    if let Some(v) = next {
                        out.metadata.push((arg.to_string(), v.to_string()));
                        i += 2;
                        continue;
                    }
                }
            }
        }
        i += 1;
    }

    // Every -map beyond the first is an audio stream; codec/bitrate/copy-prior-ss
    // are paired positionally by 1-indexed audio stream number.
    for (pos, map_ref) in map_values.into_iter().skip(1).enumerate() {
        let n = pos + 1;
        let codec = find_value(raw_args, &format!("-codec:{n}"));
        let bitrate = find_value(raw_args, &format!("-b:{n}"));
        let copy_prior_ss = find_value(raw_args, &format!("-copypriorss:{n}"));
        out.audio_streams.push(AudioStream {
            map_ref,
            codec,
            bitrate,
            copy_prior_ss,
        });
    }

    // Output path: ffmpeg commands end with the destination; last-wins scan
    // for a trailing positional token that is not itself an option value we
    // already consumed above is impractical in general, so take the final
    // argument, which upstream-A always supplies as the sink.
    out.output_path = raw_args.last().cloned();

    out
}

fn find_value(raw_args: &[String], flag: &str) -> Option<String> {
    raw_args
        .iter()
        .position(|a| a == flag)
        .and_then(|idx| raw_args.get(idx + 1))
        .cloned()
}

/// Parameters that vary the emitted command beyond the raw args themselves.
pub struct RewriteContext<'a> {
    pub config: &'a Config,
    pub job_id: &'a str,
    pub beam_stream: bool,
    pub beam_upload_input: Option<&'a str>,
    /// Set only for `/transcode/stream` direct-stream jobs: the caller's
    /// requested container format, muxed to `pipe:1` instead of a file or
    /// segment tree. Applied uniformly across both dialects by the
    /// dispatcher in `rewriter::mod`, since it overrides the *output* side
    /// only and both dialects already converge on a trailing format+destination
    /// pair.
    pub direct_stream_format: Option<&'a str>,
}

pub fn rewrite(raw_args: &[String], ctx: &RewriteContext<'_>) -> Vec<String> {
    let extracted = extract(raw_args);
    let accel = ctx.config.accelerator;

    let mut filter_complex = extracted.filter_complex.clone();
    if let Some(graph) = filter_complex.as_mut() {
        *graph = rewrite_hex_stream_refs(graph);
        if ctx.beam_stream {
            *graph = collapse_beam_stream_refs(graph);
        }
        *graph = rewrite_ochl(graph, ctx.config.ffmpeg_major_version);
    }
    let audio_streams: Vec<AudioStream> = extracted
        .audio_streams
        .iter()
        .map(|s| AudioStream {
            map_ref: rewrite_hex_stream_refs(&s.map_ref),
            codec: s.codec.clone(),
            bitrate: s.bitrate.clone(),
            copy_prior_ss: s.copy_prior_ss.clone(),
        })
        .collect();

    let mut cmd: Vec<String> = Vec::new();
    let push = |cmd: &mut Vec<String>, items: &[&str]| {
        cmd.extend(items.iter().map(|s| s.to_string()));
    };

    push(&mut cmd, &["-y", "-nostdin", "-threads", "0"]);
    push(
        &mut cmd,
        &["-progress", "pipe:1", "-stats_period", "0.5", "-loglevel", "error"],
    );

    if extracted.video_present {
        let hwaccel = hwaccel_init_args(accel, ctx.config.device.as_deref());
        cmd.extend(hwaccel);
    }

    let is_beam_upload = ctx.beam_upload_input.is_some();
    let not_beam_stream_seek_before_input = !ctx.beam_stream;
    if let Some(seek) = &extracted.seek {
        if not_beam_stream_seek_before_input {
            push(&mut cmd, &["-ss", seek]);
        }
    }

    let input_value = if ctx.beam_stream {
        "pipe:0".to_string()
    } else if let Some(uploaded) = ctx.beam_upload_input {
        uploaded.to_string()
    } else if let Some(path) = &extracted.input_path {
        map_path(&ctx.config.path_mappings, path)
    } else {
        String::new()
    };
    push(&mut cmd, &["-i"]);
    cmd.push(input_value);

    if ctx.beam_stream {
        if let Some(seek) = &extracted.seek {
            push(&mut cmd, &["-ss", seek]);
        }
    }

    if extracted.start_at_zero {
        push(&mut cmd, &["-start_at_zero"]);
    }
    if extracted.copyts {
        push(&mut cmd, &["-copyts"]);
    }
    if let Some(duration) = &extracted.duration {
        push(&mut cmd, &["-t", duration]);
    }

    if extracted.video_present {
        push(&mut cmd, &["-map", "0:v:0"]);
        let beam_cap = ctx.config.beam_max_bitrate.as_deref();
        match accel {
            Accelerator::Qsv => {
                push(
                    &mut cmd,
                    &["-vf", "scale_qsv=w=1920:h=-1:format=nv12"],
                );
                cmd.push("-c:v".into());
                cmd.push(encoder_name(accel, CodecFamily::H264).into());
                push(
                    &mut cmd,
                    &[
                        "-preset",
                        "veryfast",
                        "-global_quality",
                        "25",
                        "-low_power",
                        "1",
                        "-async_depth",
                        "1",
                    ],
                );
                if let Some(cap) = beam_cap {
                    cmd.push("-b:v".into());
                    cmd.push(cap.to_string());
                }
            }
            Accelerator::Nvenc => {
                push(
                    &mut cmd,
                    &["-vf", "scale=1920:-2,format=nv12,hwupload_cuda"],
                );
                cmd.push("-c:v".into());
                cmd.push(encoder_name(accel, CodecFamily::H264).into());
                push(&mut cmd, &["-preset", "p1", "-tune", "ull"]);
                if let Some(cap) = beam_cap {
                    push(&mut cmd, &["-rc", "cbr"]);
                    cmd.push("-b:v".into());
                    cmd.push(cap.to_string());
                    cmd.push("-maxrate".into());
                    cmd.push(cap.to_string());
                    cmd.push("-bufsize".into());
                    cmd.push(cap.to_string());
                    push(&mut cmd, &["-g", "24", "-bf", "0", "-forced-idr", "1"]);
                } else {
                    push(&mut cmd, &["-cq", "25"]);
                }
            }
            Accelerator::Vaapi => {
                push(&mut cmd, &["-vf", "scale=1920:-2,format=nv12,hwupload"]);
                cmd.push("-c:v".into());
                cmd.push(encoder_name(accel, CodecFamily::H264).into());
                push(&mut cmd, &["-low_power", "1"]);
                if let Some(cap) = beam_cap {
                    cmd.push("-b:v".into());
                    cmd.push(cap.to_string());
                } else {
                    push(&mut cmd, &["-qp", "25"]);
                }
            }
            Accelerator::None => {
                push(&mut cmd, &["-vf", "scale=1920:-2"]);
                cmd.push("-c:v".into());
                cmd.push(encoder_name(accel, CodecFamily::H264).into());
                push(&mut cmd, &["-preset", "veryfast", "-crf", "25"]);
                if let Some(cap) = beam_cap {
                    cmd.push("-b:v".into());
                    cmd.push(cap.to_string());
                    cmd.push("-maxrate".into());
                    cmd.push(cap.to_string());
                }
            }
        }
        if let Some(fps) = &extracted.framerate {
            push(&mut cmd, &["-r:0", fps]);
        }
        if let Some(fk) = &extracted.forced_keyframes {
            push(&mut cmd, &["-force_key_frames:0", fk]);
        }
    }

    if let Some(graph) = &filter_complex {
        cmd.push("-filter_complex".into());
        cmd.push(graph.clone());
    }
    for (pos, stream) in audio_streams.iter().enumerate() {
        let k = if extracted.video_present { pos + 1 } else { pos };
        cmd.push("-map".into());
        cmd.push(stream.map_ref.clone());
        if let Some(codec) = &stream.codec {
            cmd.push(format!("-codec:{k}"));
            cmd.push(codec.clone());
        }
        if let Some(bitrate) = &stream.bitrate {
            cmd.push(format!("-b:{k}"));
            cmd.push(bitrate.clone());
        }
        if let Some(flag) = &stream.copy_prior_ss {
            cmd.push(format!("-copypriorss:{k}"));
            cmd.push(flag.clone());
        }
    }

    for (key, value) in &extracted.metadata {
        cmd.push(key.clone());
        cmd.push(value.clone());
    }

    let is_beam = ctx.beam_stream || is_beam_upload;
    let output_format = extracted.output_format.clone().unwrap_or_else(|| "dash".to_string());
    cmd.push("-f".into());
    cmd.push(output_format.clone());
    if output_format == "dash" {
        push(&mut cmd, &["-dash_segment_type", "mp4"]);
    }
    push(
        &mut cmd,
        &[
            "-avoid_negative_ts",
            "disabled",
            "-map_metadata",
            "-1",
            "-map_chapters",
            "-1",
        ],
    );
    if is_beam {
        push(&mut cmd, &["-seg_duration", "1"]);
    }

    let out_dir = ctx.config.job_dir(ctx.job_id);
    let output_path = resolve_output_path(
        extracted.output_path.as_deref(),
        &output_format,
        &out_dir,
        is_beam,
        ctx.config,
    );
    cmd.push(output_path);

    cmd
}

fn resolve_output_path(
    extracted: Option<&str>,
    output_format: &str,
    out_dir: &std::path::Path,
    force_into_temp_tree: bool,
    config: &Config,
) -> String {
    let is_dash_or_hls_token = matches!(extracted, Some("dash") | Some("hls"));
    if force_into_temp_tree || is_dash_or_hls_token || output_format == "dash" || output_format == "hls" {
        let filename = if output_format == "hls" {
            "output.m3u8"
        } else {
            "output.mpd"
        };
        return out_dir.join(filename).to_string_lossy().into_owned();
    }
    match extracted {
        Some(path) => map_path(&config.path_mappings, path),
        None => out_dir.join("output.mpd").to_string_lossy().into_owned(),
    }
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

    #[test]
    fn vn_yields_no_video_map_or_encoder() {
        let raw: Vec<String> = ["-i", "/m/x.mkv", "-vn", "-map", "0:1", "-codec:1", "aac"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = test_config(Accelerator::Qsv);
        let ctx = RewriteContext {
            config: &config,
            job_id: "j1",
            beam_stream: false,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd = rewrite(&raw, &ctx);
        assert!(!cmd.iter().any(|a| a == "0:v:0"));
        assert!(!cmd.iter().any(|a| a == "h264_qsv"));
    }

    #[test]
    fn hex_stream_selector_rewritten_to_decimal() {
        let raw: Vec<String> = [
            "-i",
            "/m/x.mkv",
            "-filter_complex",
            "[0:#0x81]aresample=48000[aout]",
            "-map",
            "#0x81",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let config = test_config(Accelerator::None);
        let ctx = RewriteContext {
            config: &config,
            job_id: "j1",
            beam_stream: false,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd = rewrite(&raw, &ctx);
        let joined = cmd.join(" ");
        assert!(joined.contains("129"));
        assert!(!joined.contains("#0x81"));
    }

    #[test]
    fn beam_stream_seek_comes_after_input() {
        let raw: Vec<String> = ["-i", "/m/x.mkv", "-ss", "600"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = test_config(Accelerator::None);
        let ctx = RewriteContext {
            config: &config,
            job_id: "j1",
            beam_stream: true,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd = rewrite(&raw, &ctx);
        let i_pos = cmd.iter().position(|a| a == "-i").unwrap();
        let ss_pos = cmd.iter().position(|a| a == "-ss").unwrap();
        assert!(ss_pos > i_pos);
        assert_eq!(cmd[i_pos + 1], "pipe:0");
    }

    #[test]
    fn no_accelerator_keeps_software_encoder() {
        let raw: Vec<String> = ["-i", "/m/x.mkv", "-f", "dash", "dash"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = test_config(Accelerator::None);
        let ctx = RewriteContext {
            config: &config,
            job_id: "j1",
            beam_stream: false,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd = rewrite(&raw, &ctx);
        assert!(cmd.iter().any(|a| a == "libx264"));
        assert!(!cmd.iter().any(|a| a == "-hwaccel"));
    }

    #[test]
    fn beam_max_bitrate_caps_qsv_and_vaapi_and_software_video() {
        let raw: Vec<String> = ["-i", "/m/x.mkv", "-f", "dash", "dash"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        for accel in [Accelerator::Qsv, Accelerator::Vaapi, Accelerator::None] {
            let mut config = test_config(accel);
            config.beam_max_bitrate = Some("4M".to_string());
            let ctx = RewriteContext {
                config: &config,
                job_id: "j1",
                beam_stream: false,
                beam_upload_input: None,
                direct_stream_format: None,
            };
            let cmd = rewrite(&raw, &ctx);
            let idx = cmd
                .iter()
                .position(|a| a == "-b:v")
                .unwrap_or_else(|| panic!("no -b:v for {accel:?}"));
            assert_eq!(cmd[idx + 1], "4M");
        }
    }

    #[test]
    fn nvenc_never_gets_hwaccel_directive() {
        let raw: Vec<String> = ["-i", "/m/x.mkv", "-f", "dash", "dash"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = test_config(Accelerator::Nvenc);
        let ctx = RewriteContext {
            config: &config,
            job_id: "j1",
            beam_stream: false,
            beam_upload_input: None,
            direct_stream_format: None,
        };
        let cmd = rewrite(&raw, &ctx);
        assert!(!cmd.iter().any(|a| a == "-hwaccel"));
        assert!(cmd.iter().any(|a| a == "hwupload_cuda" || a.contains("hwupload_cuda")));
    }
}
