pub mod ffmpeg_args;
pub mod upstream_a;
pub mod upstream_b;

use crate::config::Config;
use crate::job::Dialect;

pub use upstream_a::RewriteContext;

/// Rewrite an upstream-supplied `ffmpeg` argument vector for the locally
/// configured accelerator, dispatching on which dialect produced it.
pub fn rewrite(dialect: Dialect, raw_args: &[String], ctx: &RewriteContext<'_>) -> Vec<String> {
    let mut cmd = match dialect {
        Dialect::UpstreamA => upstream_a::rewrite(raw_args, ctx),
        Dialect::UpstreamB => upstream_b::rewrite(raw_args, ctx.config),
    };
    if let Some(format) = ctx.direct_stream_format {
        force_stream_output(&mut cmd, format);
    }
    cmd
}

/// Both dialects converge on a trailing `-f <format> <destination>` pair
/// (§4.2 step 10-11, §4.3's unconditional rules); direct-stream mode
/// overrides only that tail, regardless of which dialect produced the rest
/// of the command, by forcing the destination to `pipe:1` and the format to
/// the caller's requested container.
fn force_stream_output(cmd: &mut Vec<String>, format: &str) {
    if let Some(last) = cmd.last_mut() {
        *last = "pipe:1".to_string();
    }
    if let Some(f_idx) = cmd.iter().rposition(|a| a == "-f") {
        if let Some(v) = cmd.get_mut(f_idx + 1) {
            *v = format.to_string();
        }
    } else {
        let insert_at = cmd.len().saturating_sub(1);
        cmd.splice(insert_at..insert_at, [String::from("-f"), format.to_string()]);
    }
}
