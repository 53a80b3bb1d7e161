//! Progress stream parsing.
//!
//! Two textual conventions exist across the tools the engine spawns:
//! the external encoder family prints a `Duration: HH:MM:SS.ff` banner
//! followed by `time=HH:MM:SS.ff` status lines, while the host
//! renderer prints `percentage: N`. Each pipeline picks the parser
//! matching the tool it launched.

/// Incremental parser turning tool output lines into 0-100 percentages.
#[derive(Debug)]
pub enum ProgressParser {
    /// `Duration:` / `time=` convention. Until a duration is known the
    /// parser only consumes the banner and reports nothing.
    EncoderTime { duration_secs: f64 },
    /// `percentage: N` convention
    RendererPercent,
}

impl ProgressParser {
    /// Parser for encoder output with an already-known source duration
    pub fn encoder(duration_hint: Option<f64>) -> Self {
        ProgressParser::EncoderTime {
            duration_secs: duration_hint.unwrap_or(0.0),
        }
    }

    pub fn renderer() -> Self {
        ProgressParser::RendererPercent
    }

    /// Feeds one output line; returns a new percentage when the line
    /// carried one.
    pub fn feed(&mut self, line: &str) -> Option<i32> {
        match self {
            ProgressParser::EncoderTime { duration_secs } => {
                if *duration_secs <= 0.0 {
                    if let Some(rest) = line.split("Duration:").nth(1) {
                        let field = rest.split(',').next().unwrap_or("").trim();
                        if let Some(secs) = parse_timecode(field) {
                            *duration_secs = secs;
                        }
                    }
                    return None;
                }
                let rest = line.split("time=").nth(1)?;
                let field = rest.trim().split(' ').next().unwrap_or("");
                let position = parse_timecode(field)?;
                let percent = (100.0 * position / *duration_secs).round() as i32;
                Some(percent.clamp(0, 100))
            }
            ProgressParser::RendererPercent => {
                let rest = line.split("percentage:").nth(1)?;
                let field = rest.trim().split(' ').next().unwrap_or("");
                let percent: i32 = field.parse().ok()?;
                Some(percent.clamp(0, 100))
            }
        }
    }
}

/// Parses `HH:MM:SS(.ff)` into seconds; bare integers pass through.
fn parse_timecode(field: &str) -> Option<f64> {
    if field.is_empty() {
        return None;
    }
    let parts: Vec<&str> = field.split(':').collect();
    if parts.len() < 3 {
        // Some tools print a plain seconds count
        return field.parse::<f64>().ok().filter(|s| *s > 0.0);
    }
    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_duration_banner_then_time() {
        let mut parser = ProgressParser::encoder(None);
        assert_eq!(
            parser.feed("  Duration: 00:01:40.00, start: 0.000000, bitrate: 1000 kb/s"),
            None
        );
        let pct = parser.feed("frame= 100 fps= 25 time=00:00:50.00 bitrate=1000k");
        assert_eq!(pct, Some(50));
    }

    #[test]
    fn test_encoder_with_duration_hint() {
        let mut parser = ProgressParser::encoder(Some(200.0));
        assert_eq!(parser.feed("time=00:00:50.00 speed=2x"), Some(25));
        assert_eq!(parser.feed("time=00:03:20.00 speed=2x"), Some(100));
    }

    #[test]
    fn test_encoder_time_never_exceeds_100() {
        let mut parser = ProgressParser::encoder(Some(10.0));
        assert_eq!(parser.feed("time=00:00:30.00"), Some(100));
    }

    #[test]
    fn test_encoder_ignores_unrelated_lines() {
        let mut parser = ProgressParser::encoder(Some(100.0));
        assert_eq!(parser.feed("Press [q] to stop"), None);
        assert_eq!(parser.feed(""), None);
    }

    #[test]
    fn test_renderer_percentage() {
        let mut parser = ProgressParser::renderer();
        assert_eq!(parser.feed("Current Frame: 12, percentage: 4"), Some(4));
        assert_eq!(parser.feed("Current Frame: 240, percentage: 87"), Some(87));
        assert_eq!(parser.feed("done"), None);
    }

    #[test]
    fn test_renderer_clamps() {
        let mut parser = ProgressParser::renderer();
        assert_eq!(parser.feed("percentage: 150"), Some(100));
    }

    #[test]
    fn test_plain_seconds_timecode() {
        let mut parser = ProgressParser::encoder(Some(50.0));
        assert_eq!(parser.feed("time=25 bitrate=N/A"), Some(50));
    }
}
