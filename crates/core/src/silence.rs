//! Silence detection output parsing and post-processing.
//!
//! The analyzer (ffmpeg's `silencedetect` filter) writes lines such as
//!
//! ```text
//! [silencedetect @ 0x55d0c] silence_start: 12.5
//! [silencedetect @ 0x55d0c] silence_end: 48.1 | silence_duration: 35.6
//! ```
//!
//! to stderr. Intervals are reported to the coordinator in whole seconds.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_start:\s*(-?[0-9]+(?:\.[0-9]+)?)").unwrap());
static END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_end:\s*(-?[0-9]+(?:\.[0-9]+)?)").unwrap());

/// A silent interval in seconds from the start of the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Silence {
    pub start: u32,
    pub end: u32,
}

/// Errors from parsing analyzer output.
#[derive(Debug, Error, PartialEq)]
pub enum SilenceParseError {
    #[error("silence_end at line {line} without a preceding silence_start")]
    UnmatchedEnd { line: usize },

    #[error("two silence_start markers without silence_end (line {line})")]
    UnmatchedStart { line: usize },

    #[error("malformed timestamp at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("silence ends before it starts at line {line}")]
    NegativeInterval { line: usize },
}

/// Thresholds applied after parsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SilenceRules {
    /// A first interval starting earlier than this is extended back to 0.
    pub clip_start_secs: f64,
    /// Intervals separated by less than this are merged.
    pub merge_gap_secs: f64,
}

impl Default for SilenceRules {
    fn default() -> Self {
        Self {
            clip_start_secs: 30.0,
            merge_gap_secs: 30.0,
        }
    }
}

fn seconds(value: &str, line: usize) -> Result<u32, SilenceParseError> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| SilenceParseError::InvalidNumber {
            line,
            value: value.to_string(),
        })?;
    if !parsed.is_finite() {
        return Err(SilenceParseError::InvalidNumber {
            line,
            value: value.to_string(),
        });
    }
    // ffmpeg may report a slightly negative start for the first frame
    Ok(parsed.max(0.0).round() as u32)
}

/// Parse analyzer output into raw intervals, in order of appearance.
///
/// A trailing `silence_start` with no `silence_end` (silence running into
/// the end of the file on older ffmpeg builds) is dropped.
pub fn parse_silence_output(output: &str) -> Result<Vec<Silence>, SilenceParseError> {
    let mut silences = Vec::new();
    let mut open: Option<u32> = None;

    for (idx, line) in output.lines().enumerate() {
        let line_no = idx + 1;
        if let Some(caps) = START_RE.captures(line) {
            if open.is_some() {
                return Err(SilenceParseError::UnmatchedStart { line: line_no });
            }
            open = Some(seconds(&caps[1], line_no)?);
        }
        if let Some(caps) = END_RE.captures(line) {
            let start = open
                .take()
                .ok_or(SilenceParseError::UnmatchedEnd { line: line_no })?;
            let end = seconds(&caps[1], line_no)?;
            if end < start {
                return Err(SilenceParseError::NegativeInterval { line: line_no });
            }
            silences.push(Silence { start, end });
        }
    }

    Ok(silences)
}

/// Clip the first interval to 0 and merge intervals separated by short gaps.
pub fn postprocess(silences: Vec<Silence>, rules: SilenceRules) -> Vec<Silence> {
    let mut result: Vec<Silence> = Vec::with_capacity(silences.len());

    for (i, mut silence) in silences.into_iter().enumerate() {
        if i == 0 && f64::from(silence.start) < rules.clip_start_secs {
            silence.start = 0;
        }
        match result.last_mut() {
            Some(prev) if f64::from(silence.start) - f64::from(prev.end) < rules.merge_gap_secs => {
                prev.end = prev.end.max(silence.end);
            }
            _ => result.push(silence),
        }
    }

    result
}

/// Parse and post-process in one step.
pub fn analyze(output: &str, rules: SilenceRules) -> Result<Vec<Silence>, SilenceParseError> {
    Ok(postprocess(parse_silence_output(output)?, rules))
}

/// Split intervals into the parallel start/end arrays used on the wire.
pub fn split_bounds(silences: &[Silence]) -> (Vec<u32>, Vec<u32>) {
    silences.iter().map(|s| (s.start, s.end)).unzip()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(start: u32, end: u32) -> Silence {
        Silence { start, end }
    }

    #[test]
    fn test_parse_ffmpeg_output() {
        let output = r#"
Input #0, mpegts, from 'lecture.ts':
  Duration: 01:30:00.00, start: 1.400000, bitrate: 2500 kb/s
[silencedetect @ 0x5581] silence_start: 10.2
[silencedetect @ 0x5581] silence_end: 60.7 | silence_duration: 50.5
frame=  100 fps=0.0 q=-0.0 size=N/A time=00:01:40.00
[silencedetect @ 0x5581] silence_start: 1200
[silencedetect @ 0x5581] silence_end: 1300.4 | silence_duration: 100.4
"#;
        let silences = parse_silence_output(output).unwrap();
        assert_eq!(silences, vec![s(10, 61), s(1200, 1300)]);
    }

    #[test]
    fn test_negative_start_is_clamped() {
        let output = "silence_start: -0.0213\nsilence_end: 40 | silence_duration: 40\n";
        assert_eq!(parse_silence_output(output).unwrap(), vec![s(0, 40)]);
    }

    #[test]
    fn test_trailing_start_is_dropped() {
        let output = "silence_start: 10\nsilence_end: 50\nsilence_start: 5000\n";
        assert_eq!(parse_silence_output(output).unwrap(), vec![s(10, 50)]);
    }

    #[test]
    fn test_end_without_start_is_error() {
        let output = "silence_end: 50 | silence_duration: 50\n";
        assert_eq!(
            parse_silence_output(output),
            Err(SilenceParseError::UnmatchedEnd { line: 1 })
        );
    }

    #[test]
    fn test_double_start_is_error() {
        let output = "silence_start: 10\nsilence_start: 20\n";
        assert_eq!(
            parse_silence_output(output),
            Err(SilenceParseError::UnmatchedStart { line: 2 })
        );
    }

    #[test]
    fn test_end_before_start_is_error() {
        let output = "silence_start: 100\nsilence_end: 50\n";
        assert!(matches!(
            parse_silence_output(output),
            Err(SilenceParseError::NegativeInterval { .. })
        ));
    }

    #[test]
    fn test_first_interval_clipped_and_gaps_merged() {
        let raw = vec![s(10, 100), s(120, 200), s(500, 600)];
        assert_eq!(
            postprocess(raw, SilenceRules::default()),
            vec![s(0, 200), s(500, 600)]
        );
    }

    #[test]
    fn test_first_interval_after_threshold_not_clipped() {
        let raw = vec![s(45, 100)];
        assert_eq!(postprocess(raw, SilenceRules::default()), vec![s(45, 100)]);
    }

    #[test]
    fn test_gap_of_exactly_threshold_not_merged() {
        let raw = vec![s(40, 100), s(130, 200)];
        assert_eq!(
            postprocess(raw, SilenceRules::default()),
            vec![s(40, 100), s(130, 200)]
        );
    }

    #[test]
    fn test_merge_chains() {
        let raw = vec![s(100, 150), s(170, 200), s(220, 260), s(400, 410)];
        assert_eq!(
            postprocess(raw, SilenceRules::default()),
            vec![s(100, 260), s(400, 410)]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(analyze("no markers here\n", SilenceRules::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_split_bounds() {
        let (starts, ends) = split_bounds(&[s(0, 200), s(500, 600)]);
        assert_eq!(starts, vec![0, 500]);
        assert_eq!(ends, vec![200, 600]);
    }
}
