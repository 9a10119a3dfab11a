use crate::signal::Recording;
use anyhow::{bail, Context, Result};
use std::{fmt::Write as _, path::Path};

fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn fields(line: &str) -> Vec<&str> {
    line.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Parse newline-delimited samples, ignoring blank and `#` comment lines.
pub fn parse_samples(text: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for (line_no, line) in data_lines(text) {
        let val: f64 = line
            .parse()
            .with_context(|| format!("line {} is not f64: {}", line_no, line))?;
        out.push(val);
    }
    if out.is_empty() {
        bail!("no numeric samples found");
    }
    Ok(out)
}

/// Parse a recording. Two columns are read as `time value`; a single column
/// needs the sampling rate `fs`.
pub fn parse_recording(text: &str, fs: Option<f64>) -> Result<Recording> {
    let mut times = Vec::new();
    let mut values = Vec::new();
    let mut columns = None;
    for (line_no, line) in data_lines(text) {
        let parts = fields(line);
        let width = *columns.get_or_insert(parts.len());
        if parts.len() != width || !(1..=2).contains(&width) {
            bail!("line {} has {} column(s), expected {}", line_no, parts.len(), width);
        }
        let parse = |s: &str| -> Result<f64> {
            s.parse()
                .with_context(|| format!("line {} is not numeric: {}", line_no, line))
        };
        if width == 2 {
            times.push(parse(parts[0])?);
        }
        values.push(parse(parts[width - 1])?);
    }
    if values.is_empty() {
        bail!("no numeric samples found");
    }
    if times.is_empty() {
        let fs = fs.context("single-column input needs a sampling rate (--fs)")?;
        if !(fs > 0.0) {
            bail!("sampling rate must be positive, got {}", fs);
        }
        return Ok(Recording::new(fs, values));
    }
    Ok(Recording::from_times(&times, values)?)
}

pub fn read_recording(path: &Path, fs: Option<f64>) -> Result<Recording> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let channel = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parse_recording(&text, fs)
        .with_context(|| format!("parsing {}", path.display()))?
        .with_channel(channel))
}

/// Parse a beat-time list (s). Times must be strictly increasing.
pub fn parse_beats(text: &str) -> Result<Vec<f64>> {
    let beats = parse_samples(text)?;
    if let Some(pos) = beats.windows(2).position(|w| w[1] <= w[0]) {
        bail!("beat times must increase (entry {})", pos + 2);
    }
    Ok(beats)
}

pub fn format_beats(beats: &[f64]) -> String {
    let mut out = String::with_capacity(beats.len() * 12);
    for t in beats {
        let _ = writeln!(out, "{:.6}", t);
    }
    out
}

pub fn write_beats(path: &Path, beats: &[f64]) -> Result<()> {
    std::fs::write(path, format_beats(beats))
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_column_needs_rate() {
        let rec = parse_recording("# ecg\n1.0\n2.5\n\n-1\n", Some(250.0)).expect("parse");
        assert_eq!(rec.data, vec![1.0, 2.5, -1.0]);
        assert_eq!(rec.fs, 250.0);
        assert!(parse_recording("1.0\n2.0\n", None).is_err());
    }

    #[test]
    fn two_columns_give_times() {
        let rec = parse_recording("0.000,1\n0.002,2\n0.004,3\n", None).expect("parse");
        assert!((rec.fs - 500.0).abs() < 1e-9);
        assert_eq!(rec.data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn ragged_lines_are_rejected() {
        let err = parse_recording("0.0 1.0\n2.0\n", None).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn beats_round_trip_through_text() {
        let beats = vec![0.1, 0.35, 1.000001];
        assert_eq!(parse_beats(&format_beats(&beats)).expect("parse"), beats);
        assert!(parse_beats("0.2\n0.1\n").is_err());
    }
}
