//! Saved curation sessions.

use crate::{
    config::ProcessingParameters,
    dsp::argmax_nearest,
    error::PipelineError,
    pipeline::Pipeline,
    signal::{BeatPeak, Recording, Span},
};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Where a session came from and who made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_path: String,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub channel: String,
    /// RFC 3339 creation time
    pub created: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub tool: String,
}

impl Provenance {
    pub fn new(source: &Path, channel: &str) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".into());
        Self {
            source_path: source.display().to_string(),
            source_type: source
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            channel: channel.to_string(),
            created: Utc::now().to_rfc3339(),
            user,
            tool: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Everything needed to resume curation of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default = "default_schema")]
    pub schema_version: u32,
    pub provenance: Provenance,
    pub raw_fs: f64,
    pub processing_fs: f64,
    pub heart_beats: Vec<f64>,
    #[serde(default)]
    pub beat_peaks: Vec<BeatPeak>,
    #[serde(default)]
    pub artefacts: Vec<Span>,
    #[serde(default)]
    pub removed_windows: Vec<Span>,
    /// Stored parameter object, restored field by field
    pub parameters: serde_json::Value,
}

impl SessionRecord {
    pub fn capture(pipeline: &Pipeline, source: &Path) -> Result<Self, PipelineError> {
        let signal = pipeline
            .signal()
            .ok_or(PipelineError::NotReady("preprocessing"))?;
        let recording = pipeline.recording();
        let beat_peaks = if signal.decimation > 1 {
            raw_beat_peaks(recording, pipeline.beats(), signal.fs)
        } else {
            pipeline.beat_peaks().unwrap_or_else(|_| {
                raw_beat_peaks(recording, pipeline.beats(), signal.fs)
            })
        };
        Ok(Self {
            schema_version: SESSION_SCHEMA_VERSION,
            provenance: Provenance::new(source, &recording.channel),
            raw_fs: recording.fs,
            processing_fs: signal.fs,
            heart_beats: pipeline.beats().to_vec(),
            beat_peaks,
            artefacts: pipeline.artefacts().to_vec(),
            removed_windows: pipeline.removed_windows().to_vec(),
            parameters: pipeline.params().to_stored(),
        })
    }

    /// Rebuild a pipeline over `recording` in the state this record describes.
    /// Returns notes about parameters that could not be restored and about
    /// artefacts that no longer match the stored ones.
    pub fn restore(&self, recording: Recording) -> Result<(Pipeline, Vec<String>), PipelineError> {
        let (params, mut notes) = ProcessingParameters::from_stored(&self.parameters)?;
        if (recording.fs - self.raw_fs).abs() > 1e-9 * self.raw_fs.abs().max(1.0) {
            notes.push(format!(
                "recording is sampled at {} Hz, session was made at {} Hz",
                recording.fs, self.raw_fs
            ));
        }
        if self.schema_version > SESSION_SCHEMA_VERSION {
            return Err(PipelineError::Session(format!(
                "session schema {} is newer than supported {}",
                self.schema_version, SESSION_SCHEMA_VERSION
            )));
        }
        if self.heart_beats.iter().any(|t| !t.is_finite()) {
            return Err(PipelineError::Session("session holds non-finite beat times".into()));
        }
        if self.heart_beats.windows(2).any(|w| w[1] <= w[0]) {
            notes.push("stored beats were not strictly increasing and have been sorted".into());
        }
        let mut pipeline = Pipeline::new(recording, params)?;
        pipeline.preprocess()?;
        if pipeline.artefacts() != self.artefacts.as_slice() {
            notes.push(format!(
                "recomputed {} artefact span(s), session holds {}",
                pipeline.artefacts().len(),
                self.artefacts.len()
            ));
        }
        pipeline.set_removed_windows(&self.removed_windows);
        pipeline.set_beats(self.heart_beats.clone());
        for note in &notes {
            warn!("{}", note);
        }
        Ok((pipeline, notes))
    }
}

fn default_schema() -> u32 {
    SESSION_SCHEMA_VERSION
}

pub fn save_session(path: &Path, record: &SessionRecord) -> Result<()> {
    let text = serde_json::to_string_pretty(record).context("serialising session")?;
    std::fs::write(path, text)
        .with_context(|| format!("failed to write session {}", path.display()))?;
    info!("saved {} beats to {}", record.heart_beats.len(), path.display());
    Ok(())
}

pub fn load_session(path: &Path) -> Result<SessionRecord> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing session {}", path.display()))
}

/// Apex of each beat located in the raw recording, within
/// `ceil(1 + raw_fs / processing_fs)` raw samples of the beat. Ties go to
/// the sample closest to the beat.
pub fn raw_beat_peaks(recording: &Recording, beats: &[f64], processing_fs: f64) -> Vec<BeatPeak> {
    let n = recording.len();
    if n == 0 {
        return Vec::new();
    }
    let radius = (1.0 + recording.fs / processing_fs).ceil() as isize;
    beats
        .iter()
        .filter_map(|&t| {
            let centre = ((t - recording.start_time) * recording.fs).round() as isize;
            let lo = (centre - radius).max(0);
            let hi = (centre + radius).min(n as isize - 1);
            if lo > hi {
                return None;
            }
            let values = (lo..=hi).map(|i| {
                let v = recording.data[i as usize];
                (i, v.is_finite().then_some(v))
            });
            argmax_nearest(values, centre).map(|(i, value)| BeatPeak {
                time: recording.time_at(i as usize),
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Species, detectors::peaks::AutoLower};
    use tempfile::tempdir;

    fn recording() -> Recording {
        let fs = 2000.0;
        let mut data = vec![0.0; 8000];
        for k in 0..40 {
            let c = 100.0 + 200.0 * k as f64;
            for (i, v) in data.iter_mut().enumerate() {
                let x = (i as f64 - c) / 4.0;
                *v += (-0.5 * x * x).exp();
            }
        }
        Recording::new(fs, data).with_channel("lead I")
    }

    fn params() -> ProcessingParameters {
        let mut params = ProcessingParameters::preset(Species::Mouse);
        params.de_drift_enable = false;
        params.bp_enable = false;
        params
    }

    #[test]
    fn saved_session_restores_curation() {
        let mut pipeline = Pipeline::new(recording(), params()).expect("pipeline");
        pipeline.detect(&AutoLower).expect("detect");
        pipeline.add_removed_window(1.0, 1.3);
        pipeline.toggle_beat(2.0).expect("toggle");

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        let record = SessionRecord::capture(&pipeline, Path::new("rec.txt")).expect("capture");
        assert_eq!(record.provenance.source_type, "txt");
        assert_eq!(record.provenance.channel, "lead I");
        assert_eq!(record.beat_peaks.len(), record.heart_beats.len());
        save_session(&path, &record).expect("save");

        let loaded = load_session(&path).expect("load");
        assert_eq!(loaded, record);
        let (restored, notes) = loaded.restore(recording()).expect("restore");
        assert!(notes.is_empty(), "{notes:?}");
        assert_eq!(restored.beats(), pipeline.beats());
        assert_eq!(restored.removed_windows(), pipeline.removed_windows());
        assert_eq!(restored.artefacts(), pipeline.artefacts());
        assert_eq!(restored.params(), pipeline.params());
    }

    #[test]
    fn unknown_parameters_are_reported_not_fatal() {
        let mut record = SessionRecord {
            schema_version: SESSION_SCHEMA_VERSION,
            provenance: Provenance::new(Path::new("x.csv"), ""),
            raw_fs: 2000.0,
            processing_fs: 2000.0,
            heart_beats: vec![0.05, 0.15],
            beat_peaks: Vec::new(),
            artefacts: Vec::new(),
            removed_windows: Vec::new(),
            parameters: params().to_stored(),
        };
        if let serde_json::Value::Object(map) = &mut record.parameters {
            map.insert("retired_knob".into(), serde_json::json!(3));
        }
        let (restored, notes) = record.restore(recording()).expect("restore");
        assert_eq!(notes.len(), 1);
        assert_eq!(restored.beats(), &[0.05, 0.15]);

        record.schema_version = SESSION_SCHEMA_VERSION + 1;
        assert!(matches!(
            record.restore(recording()),
            Err(PipelineError::Session(_))
        ));
    }

    #[test]
    fn raw_peaks_search_around_decimated_position() {
        let mut data = vec![0.0; 8000];
        data[4001] = 2.0;
        data[5999] = 1.0;
        data[6001] = 1.0;
        let rec = Recording::new(4000.0, data);
        let peaks = raw_beat_peaks(&rec, &[1.0, 1.5], 2000.0);
        assert_eq!(peaks.len(), 2);
        assert_eq!(peaks[0].time, rec.time_at(4001));
        assert_eq!(peaks[0].value, 2.0);
        assert_eq!(peaks[1].time, rec.time_at(5999));
    }
}
