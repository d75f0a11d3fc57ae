use std::collections::HashMap;

/// A single snapshot of a transcode job's progress, as reported by FFmpeg's
/// `-progress pipe:1` key=value stream.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobProgress {
    pub frame: u64,
    pub fps: f64,
    pub bitrate: String,
    pub total_size: u64,
    /// Despite the name, this is microseconds of output emitted.
    pub out_time_ms: u64,
    pub speed: f64,
    pub percent: f64,
    pub done: bool,
    pub error: Option<String>,
}

/// Accumulates `key=value` lines from an FFmpeg progress pipe into
/// [`JobProgress`] snapshots. One block of lines, terminated by a
/// `progress=continue` or `progress=end` line, produces one snapshot.
#[derive(Debug, Default)]
pub struct ProgressParser {
    block: HashMap<String, String>,
    duration_us: Option<u64>,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            block: HashMap::new(),
            duration_us: duration_secs.map(|s| (s * 1_000_000.0).round() as u64),
        }
    }

    /// Feed one line of output. Returns a snapshot when the line completes a
    /// progress block (`progress=continue`/`progress=end`); parse failures on
    /// individual values are swallowed so one malformed line never aborts
    /// progress reporting.
    pub fn feed_line(&mut self, line: &str) -> Option<JobProgress> {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            return None;
        };
        let key = key.trim();
        let value = value.trim();
        self.block.insert(key.to_string(), value.to_string());

        if key != "progress" {
            return None;
        }

        let snapshot = self.build_snapshot(value == "end");
        self.block.clear();
        Some(snapshot)
    }

    fn build_snapshot(&self, done: bool) -> JobProgress {
        let frame = self
            .block
            .get("frame")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let fps = self
            .block
            .get("fps")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let bitrate = self.block.get("bitrate").cloned().unwrap_or_default();
        let total_size = self
            .block
            .get("total_size")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let out_time_ms = self
            .block
            .get("out_time_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let speed = self
            .block
            .get("speed")
            .map(|v| v.trim_end_matches('x'))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        let percent = if done {
            100.0
        } else if let Some(total) = self.duration_us.filter(|t| *t > 0) {
            ((out_time_ms as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        JobProgress {
            frame,
            fps,
            bitrate,
            total_size,
            out_time_ms,
            speed,
            percent,
            done,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_block() {
        let mut parser = ProgressParser::new(Some(100.0));
        let mut snapshot = None;
        for line in [
            "frame=120",
            "fps=29.97",
            "bitrate=1500.0kbits/s",
            "total_size=1048576",
            "out_time_ms=4004000",
            "speed=1.02x",
            "progress=continue",
        ] {
            snapshot = parser.feed_line(line);
        }
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.frame, 120);
        assert_eq!(snapshot.bitrate, "1500.0kbits/s");
        assert_eq!(snapshot.total_size, 1048576);
        assert_eq!(snapshot.out_time_ms, 4004000);
        assert!((snapshot.speed - 1.02).abs() < 1e-9);
        assert!(!snapshot.done);
    }

    #[test]
    fn progress_end_forces_100_percent_and_done() {
        let mut parser = ProgressParser::new(Some(100.0));
        parser.feed_line("out_time_ms=1000000");
        let snapshot = parser.feed_line("progress=end").unwrap();
        assert_eq!(snapshot.percent, 100.0);
        assert!(snapshot.done);
    }

    #[test]
    fn percent_clamps_to_one_hundred_past_known_duration() {
        let mut parser = ProgressParser::new(Some(10.0));
        parser.feed_line("out_time_ms=50_000_000".replace('_', "").as_str());
        let snapshot = parser.feed_line("progress=continue").unwrap();
        assert_eq!(snapshot.percent, 100.0);
    }

    #[test]
    fn zero_duration_never_divides_by_zero() {
        let mut parser = ProgressParser::new(Some(0.0));
        parser.feed_line("out_time_ms=5000000");
        let snapshot = parser.feed_line("progress=continue").unwrap();
        assert_eq!(snapshot.percent, 0.0);
    }

    #[test]
    fn malformed_line_is_silently_ignored() {
        let mut parser = ProgressParser::new(None);
        assert!(parser.feed_line("not a key value line").is_none());
        assert!(parser.feed_line("frame=not_a_number").is_none());
        let snapshot = parser.feed_line("progress=continue").unwrap();
        assert_eq!(snapshot.frame, 0);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut parser = ProgressParser::new(None);
        parser.feed_line("some_future_key=hello");
        let snapshot = parser.feed_line("progress=continue").unwrap();
        assert_eq!(snapshot.frame, 0);
    }
}
