use crate::config::Accelerator;

/// Which family of video codec an encoder name belongs to, as preserved
/// across a dialect-B HW-replace rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Hevc,
}

pub const VAAPI_DEFAULT_DEVICE: &str = "/dev/dri/renderD128";

pub fn vaapi_device(device: Option<&str>) -> String {
    device.unwrap_or(VAAPI_DEFAULT_DEVICE).to_string()
}

/// The hardware encoder name for an accelerator/codec-family pair. `none`
/// always yields the software encoder.
pub fn encoder_name(accel: Accelerator, family: CodecFamily) -> &'static str {
    match (accel, family) {
        (Accelerator::Qsv, CodecFamily::H264) => "h264_qsv",
        (Accelerator::Qsv, CodecFamily::Hevc) => "hevc_qsv",
        (Accelerator::Nvenc, CodecFamily::H264) => "h264_nvenc",
        (Accelerator::Nvenc, CodecFamily::Hevc) => "hevc_nvenc",
        (Accelerator::Vaapi, CodecFamily::H264) => "h264_vaapi",
        (Accelerator::Vaapi, CodecFamily::Hevc) => "hevc_vaapi",
        (Accelerator::None, CodecFamily::H264) => "libx264",
        (Accelerator::None, CodecFamily::Hevc) => "libx265",
    }
}

/// Hardware-acceleration setup flags, placed before `-i`. Empty for `none`
/// and for NVENC (NVENC decodes on the CPU and uploads via `hwupload_cuda`
/// in the filter chain instead — some devices cannot hardware-decode 10-bit
/// HEVC, so this path is never taken for NVENC regardless of codec).
pub fn hwaccel_init_args(accel: Accelerator, device: Option<&str>) -> Vec<String> {
    match accel {
        Accelerator::Qsv => {
            let mut args = vec!["-hwaccel".to_string(), "qsv".to_string()];
            if let Some(dev) = device {
                args.push("-qsv_device".to_string());
                args.push(dev.to_string());
            }
            args.push("-hwaccel_output_format".to_string());
            args.push("qsv".to_string());
            args.push("-extra_hw_frames".to_string());
            args.push("8".to_string());
            args
        }
        Accelerator::Vaapi => vec![
            "-hwaccel".to_string(),
            "vaapi".to_string(),
            "-vaapi_device".to_string(),
            vaapi_device(device),
        ],
        Accelerator::Nvenc | Accelerator::None => Vec::new(),
    }
}

/// Insert `args` immediately before the first `-i` token in `cmd`. No-op if
/// `-i` is absent or `args` is empty.
pub fn inject_before_input(cmd: &mut Vec<String>, args: Vec<String>) {
    if args.is_empty() {
        return;
    }
    if let Some(idx) = cmd.iter().position(|a| a == "-i") {
        cmd.splice(idx..idx, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvenc_never_emits_hwaccel_directive() {
        assert!(hwaccel_init_args(Accelerator::Nvenc, None).is_empty());
        assert!(hwaccel_init_args(Accelerator::Nvenc, Some("/dev/dri/renderD129")).is_empty());
    }

    #[test]
    fn vaapi_never_sets_hwaccel_output_format() {
        let args = hwaccel_init_args(Accelerator::Vaapi, None);
        assert!(!args.iter().any(|a| a == "-hwaccel_output_format"));
    }

    #[test]
    fn encoder_name_preserves_codec_family() {
        assert_eq!(
            encoder_name(Accelerator::Qsv, CodecFamily::Hevc),
            "hevc_qsv"
        );
        assert_eq!(
            encoder_name(Accelerator::None, CodecFamily::H264),
            "libx264"
        );
    }

    #[test]
    fn inject_before_input_lands_exactly_before_dash_i() {
        let mut cmd = vec!["-y".to_string(), "-i".to_string(), "in.mkv".to_string()];
        inject_before_input(&mut cmd, vec!["-hwaccel".to_string(), "vaapi".to_string()]);
        assert_eq!(cmd, vec!["-y", "-hwaccel", "vaapi", "-i", "in.mkv"]);
    }
}
