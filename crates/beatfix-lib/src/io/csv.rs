use crate::{
    metrics::rate::{RatePoint, RateUnit},
    signal::Recording,
};
use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::{io::Write, path::Path};

/// Load a recording from a CSV with a header row, reading one time column
/// and one value column.
pub fn read_recording_csv(path: &Path, time_column: &str, value_column: &str) -> Result<Recording> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let locate = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .with_context(|| format!("missing column '{}'", name))
    };
    let time_idx = locate(time_column)?;
    let value_idx = locate(value_column)?;
    let mut times = Vec::new();
    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.context("reading record")?;
        let field = |idx: usize| -> Result<f64> {
            let raw = record.get(idx).unwrap_or_default();
            raw.parse()
                .with_context(|| format!("row {}: '{}' is not numeric", row + 1, raw))
        };
        times.push(field(time_idx)?);
        values.push(field(value_idx)?);
    }
    Ok(Recording::from_times(&times, values)?.with_channel(value_column))
}

/// Write `time,rate_<unit>` rows; masked entries leave the rate empty.
pub fn write_rate<W: Write>(out: W, rate: &[RatePoint], unit: RateUnit) -> Result<()> {
    let mut writer = WriterBuilder::new().from_writer(out);
    writer.write_record(["time", &format!("rate_{}", unit.label().to_lowercase())])?;
    for point in rate {
        let value = point
            .rate
            .map(|r| format!("{:.6}", unit.express(r)))
            .unwrap_or_default();
        writer.write_record([format!("{:.6}", point.time), value])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_rate_csv(path: &Path, rate: &[RatePoint], unit: RateUnit) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_rate(file, rate, unit)
}
