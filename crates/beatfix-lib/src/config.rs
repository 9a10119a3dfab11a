use crate::error::ConfigError;
use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Current version of the on-disk parameter schema.
pub const SCHEMA_VERSION: u64 = 2;

/// Species whose defaults seed a parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    #[serde(alias = "Mouse")]
    Mouse,
    #[serde(alias = "Human")]
    Human,
}

impl Species {
    pub fn name(&self) -> &'static str {
        match self {
            Species::Mouse => "Mouse",
            Species::Human => "Human",
        }
    }
}

/// Every tunable threshold of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParameters {
    pub species: Species,
    /// Target processing rate (Hz); faster recordings are decimated.
    pub processing_sampling_rate: f64,
    pub de_drift_enable: bool,
    /// Width of the drift-estimating Gaussian window (s).
    pub de_drift_kernel: f64,
    pub bp_enable: bool,
    pub bp_low: f64,
    pub bp_high: f64,
    pub notch_filter: bool,
    /// Mains frequency removed by the notch filter (Hz).
    pub power_grid: f64,
    pub auto_artefacts_removal: bool,
    /// Exponent applied to the rectified signal before smoothing.
    pub power: f64,
    /// Envelope height a peak must exceed to become a candidate.
    pub threshold: f64,
    /// Percentile of envelope maxima used when the threshold is lowered.
    pub threshold_recovery_percentile: f64,
    /// Envelope smoothing (ms); the Gaussian window spans four times this.
    pub smooth_detection: f64,
    /// Waveform window bounds relative to the peak (ms).
    pub waveform_window_low: f64,
    pub waveform_window_high: f64,
    /// Half-width of the apex search (samples at the processing rate).
    pub peak_range: usize,
    /// Sliding rate window (s).
    pub sliding_window: f64,
    pub suspicious_frequency_low: f64,
    pub suspicious_frequency_high: f64,
    /// Largest accepted interval-to-interval change for stable beats (ms).
    pub stable_index: f64,
    /// Interval differences above this are outliers when estimating the next interval (ms).
    pub outlier: f64,
    pub pass_number: usize,
    /// Gaps longer than this split the beat list into independent ranges (s).
    pub discontinue: f64,
    pub backward_pass: bool,
}

impl Default for ProcessingParameters {
    fn default() -> Self {
        Self::preset(Species::Mouse)
    }
}

/// How [`ProcessingParameters::overlay`] treats values that do not fit a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayMode {
    /// Unknown keys and ill-typed values are errors.
    Strict,
    /// Unknown keys and ill-typed values are skipped and reported as warnings.
    Lenient,
}

/// Legacy (schema 1) PascalCase names and their current equivalents.
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("Species", "species"),
    ("Name", "species"),
    ("ProcessingSamplingRate", "processing_sampling_rate"),
    ("DeDriftEnable", "de_drift_enable"),
    ("DeDriftKernel", "de_drift_kernel"),
    ("BPEnable", "bp_enable"),
    ("BPLow", "bp_low"),
    ("BPHigh", "bp_high"),
    ("NotchFilter", "notch_filter"),
    ("PowerGrid", "power_grid"),
    ("AutoArtefactsRemoval", "auto_artefacts_removal"),
    ("Power", "power"),
    ("Threshold", "threshold"),
    ("SmoothDetection", "smooth_detection"),
    ("WaveformWindowLow", "waveform_window_low"),
    ("WaveformWindowHigh", "waveform_window_high"),
    ("PeakRange", "peak_range"),
    ("SlidingWindow", "sliding_window"),
    ("SuspiciousFrequencyLow", "suspicious_frequency_low"),
    ("SuspiciousFrequencyHigh", "suspicious_frequency_high"),
    ("StableIndex", "stable_index"),
    ("Outlier", "outlier"),
    ("PassNumber", "pass_number"),
    ("Discontinue", "discontinue"),
];

const BOOL_FIELDS: &[&str] = &[
    "de_drift_enable",
    "bp_enable",
    "notch_filter",
    "auto_artefacts_removal",
    "backward_pass",
];

impl ProcessingParameters {
    pub fn preset(species: Species) -> Self {
        match species {
            Species::Mouse => Self {
                species,
                processing_sampling_rate: 2000.0,
                de_drift_enable: true,
                de_drift_kernel: 0.2,
                bp_enable: true,
                bp_low: 10.0,
                bp_high: 400.0,
                notch_filter: false,
                power_grid: 50.0,
                auto_artefacts_removal: true,
                power: 2.0,
                threshold: 20.0,
                threshold_recovery_percentile: 90.0,
                smooth_detection: 1.0,
                waveform_window_low: -10.0,
                waveform_window_high: 15.0,
                peak_range: 4,
                sliding_window: 2.0,
                suspicious_frequency_low: 4.0,
                suspicious_frequency_high: 20.0,
                stable_index: 10.0,
                outlier: 15.0,
                pass_number: 2,
                discontinue: 2.0,
                backward_pass: true,
            },
            Species::Human => Self {
                species,
                processing_sampling_rate: 500.0,
                de_drift_enable: true,
                de_drift_kernel: 1.0,
                bp_enable: true,
                bp_low: 0.5,
                bp_high: 40.0,
                notch_filter: false,
                power_grid: 50.0,
                auto_artefacts_removal: true,
                power: 2.0,
                threshold: 20.0,
                threshold_recovery_percentile: 90.0,
                smooth_detection: 8.0,
                waveform_window_low: -100.0,
                waveform_window_high: 150.0,
                peak_range: 10,
                sliding_window: 10.0,
                suspicious_frequency_low: 0.5,
                suspicious_frequency_high: 3.0,
                stable_index: 80.0,
                outlier: 120.0,
                pass_number: 2,
                discontinue: 5.0,
                backward_pass: true,
            },
        }
    }

    /// Rate the pipeline will actually process a recording sampled at `raw_fs` at.
    pub fn effective_rate(&self, raw_fs: f64) -> f64 {
        raw_fs / self.decimation_factor(raw_fs) as f64
    }

    pub fn decimation_factor(&self, raw_fs: f64) -> usize {
        if raw_fs > self.processing_sampling_rate {
            (raw_fs / self.processing_sampling_rate).ceil() as usize
        } else {
            1
        }
    }

    /// Rate-independent consistency checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("processing_sampling_rate", self.processing_sampling_rate),
            ("de_drift_kernel", self.de_drift_kernel),
            ("bp_low", self.bp_low),
            ("bp_high", self.bp_high),
            ("power_grid", self.power_grid),
            ("power", self.power),
            ("threshold", self.threshold),
            ("smooth_detection", self.smooth_detection),
            ("sliding_window", self.sliding_window),
            ("suspicious_frequency_low", self.suspicious_frequency_low),
            ("suspicious_frequency_high", self.suspicious_frequency_high),
            ("stable_index", self.stable_index),
            ("outlier", self.outlier),
            ("discontinue", self.discontinue),
        ];
        for (name, value) in positive {
            if !(value > 0.0) || !value.is_finite() {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        if self.bp_low >= self.bp_high {
            return Err(ConfigError::BandOrder {
                low: self.bp_low,
                high: self.bp_high,
            });
        }
        if self.waveform_window_low >= self.waveform_window_high {
            return Err(ConfigError::WaveformWindow {
                low: self.waveform_window_low,
                high: self.waveform_window_high,
            });
        }
        if self.suspicious_frequency_low >= self.suspicious_frequency_high {
            return Err(ConfigError::SuspiciousBounds {
                low: self.suspicious_frequency_low,
                high: self.suspicious_frequency_high,
            });
        }
        let pct = self.threshold_recovery_percentile;
        if !(pct > 0.0 && pct < 100.0) {
            return Err(ConfigError::Percentile(pct));
        }
        if self.pass_number == 0 {
            return Err(ConfigError::NoPasses);
        }
        Ok(())
    }

    /// Full validation including the cut-offs that depend on the processing rate.
    pub fn validate_for_rate(&self, raw_fs: f64) -> Result<(), ConfigError> {
        self.validate()?;
        let nyquist = self.effective_rate(raw_fs) / 2.0;
        if self.bp_enable && self.bp_high >= nyquist {
            return Err(ConfigError::AboveNyquist {
                name: "bp_high",
                cutoff: self.bp_high,
                nyquist,
            });
        }
        if self.notch_filter && self.power_grid + 5.0 >= nyquist {
            return Err(ConfigError::AboveNyquist {
                name: "power_grid",
                cutoff: self.power_grid + 5.0,
                nyquist,
            });
        }
        Ok(())
    }

    /// Apply `edit` to a copy and commit it only if the result validates.
    pub fn update<F: FnOnce(&mut Self)>(&mut self, edit: F) -> Result<(), ConfigError> {
        let mut candidate = self.clone();
        edit(&mut candidate);
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Like [`update`](Self::update) but also checks the filter cut-offs against
    /// the processing rate derived from `raw_fs`.
    pub fn update_for_rate<F: FnOnce(&mut Self)>(
        &mut self,
        raw_fs: f64,
        edit: F,
    ) -> Result<(), ConfigError> {
        let mut candidate = self.clone();
        edit(&mut candidate);
        candidate.validate_for_rate(raw_fs)?;
        *self = candidate;
        Ok(())
    }

    /// Copy matching fields from `overrides` onto this parameter set, one
    /// field at a time. Returns the new set plus warnings for skipped keys.
    pub fn overlay(
        &self,
        overrides: &Map<String, Value>,
        mode: OverlayMode,
    ) -> Result<(Self, Vec<String>), ConfigError> {
        let mut current = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "parameters".into(),
                    reason: "not representable as an object".into(),
                })
            }
        };
        let mut warnings = Vec::new();
        for (key, value) in overrides {
            if key == "schema_version" {
                continue;
            }
            if !current.contains_key(key) {
                match mode {
                    OverlayMode::Strict => return Err(ConfigError::UnknownField(key.clone())),
                    OverlayMode::Lenient => {
                        warnings.push(format!("ignoring unknown parameter '{}'", key));
                        continue;
                    }
                }
            }
            let mut trial = current.clone();
            trial.insert(key.clone(), value.clone());
            match serde_json::from_value::<Self>(Value::Object(trial.clone())) {
                Ok(_) => current = trial,
                Err(err) => match mode {
                    OverlayMode::Strict => {
                        return Err(ConfigError::InvalidValue {
                            field: key.clone(),
                            reason: err.to_string(),
                        })
                    }
                    OverlayMode::Lenient => {
                        warnings.push(format!("keeping default for '{}': {}", key, err))
                    }
                },
            }
        }
        let params: Self =
            serde_json::from_value(Value::Object(current)).map_err(|err| {
                ConfigError::InvalidValue {
                    field: "parameters".into(),
                    reason: err.to_string(),
                }
            })?;
        params.validate()?;
        Ok((params, warnings))
    }

    /// Restore a parameter set from a stored JSON object of any schema
    /// version. Missing fields take the species preset, unknown ones are
    /// ignored.
    pub fn from_stored(value: &Value) -> Result<(Self, Vec<String>), ConfigError> {
        let migrated = migrate(value);
        let species = migrated
            .get("species")
            .and_then(|v| serde_json::from_value::<Species>(v.clone()).ok())
            .unwrap_or(Species::Mouse);
        Self::preset(species).overlay(&migrated, OverlayMode::Lenient)
    }

    /// JSON object tagged with the current schema version.
    pub fn to_stored(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
        }
        value
    }

    /// Apply `key=value` assignments (values parsed as JSON when possible,
    /// as plain strings otherwise).
    pub fn with_assignments(&self, assignments: &[String]) -> Result<Self, ConfigError> {
        let mut overrides = Map::new();
        for assignment in assignments {
            let (key, raw) =
                assignment
                    .split_once('=')
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: assignment.clone(),
                        reason: "expected key=value".into(),
                    })?;
            let raw = raw.trim();
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
            overrides.insert(key.trim().to_string(), value);
        }
        let base = match overrides.get("species") {
            Some(v) => match serde_json::from_value::<Species>(v.clone()) {
                Ok(species) if species != self.species => Self::preset(species),
                _ => self.clone(),
            },
            None => self.clone(),
        };
        base.overlay(&overrides, OverlayMode::Strict).map(|(p, _)| p)
    }

    pub fn to_toml(&self) -> Result<String> {
        let mut table = toml::Value::try_from(self).context("serialising parameters")?;
        if let toml::Value::Table(map) = &mut table {
            map.insert(
                "schema_version".into(),
                toml::Value::Integer(SCHEMA_VERSION as i64),
            );
        }
        toml::to_string_pretty(&table).context("formatting parameters as TOML")
    }
}

/// Bring a stored parameter object up to [`SCHEMA_VERSION`].
///
/// Schema 1 used PascalCase names and 0/1 for switches.
pub fn migrate(value: &Value) -> Map<String, Value> {
    let Some(map) = value.as_object() else {
        return Map::new();
    };
    let version = map
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    if version >= SCHEMA_VERSION {
        return map.clone();
    }
    let mut out = Map::new();
    for (key, value) in map {
        let name = LEGACY_NAMES
            .iter()
            .find(|(legacy, _)| legacy == key)
            .map(|(_, current)| current.to_string())
            .unwrap_or_else(|| key.clone());
        let value = if BOOL_FIELDS.contains(&name.as_str()) {
            match value.as_f64() {
                Some(n) => Value::Bool(n != 0.0),
                None => value.clone(),
            }
        } else {
            value.clone()
        };
        out.insert(name, value);
    }
    out.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    out
}

/// Read a TOML parameter file. A `species` key selects the preset the
/// remaining keys are laid over.
pub fn load_parameters(path: &Path) -> Result<ProcessingParameters> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read parameters {}", path.display()))?;
    parse_parameters(&text).with_context(|| format!("parsing parameters {}", path.display()))
}

pub fn parse_parameters(text: &str) -> Result<ProcessingParameters> {
    let table: toml::Value = toml::from_str(text)?;
    let value = serde_json::to_value(table)?;
    let migrated = migrate(&value);
    let species = migrated
        .get("species")
        .map(|v| serde_json::from_value::<Species>(v.clone()))
        .transpose()
        .context("unknown species")?
        .unwrap_or(Species::Mouse);
    let (params, warnings) =
        ProcessingParameters::preset(species).overlay(&migrated, OverlayMode::Lenient)?;
    for warning in warnings {
        warn!("{}", warning);
    }
    Ok(params)
}

/// Parameters the preprocessing stage depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessSnapshot {
    pub processing_sampling_rate: f64,
    pub de_drift_enable: bool,
    pub de_drift_kernel: f64,
    pub bp_enable: bool,
    pub bp_low: f64,
    pub bp_high: f64,
    pub notch_filter: bool,
    pub power_grid: f64,
    pub auto_artefacts_removal: bool,
    pub power: f64,
    pub smooth_detection: f64,
}

/// Parameters the detection stage depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectSnapshot {
    pub power: f64,
    pub threshold: f64,
    pub threshold_recovery_percentile: f64,
    pub smooth_detection: f64,
    pub waveform_window_low: f64,
    pub waveform_window_high: f64,
    pub peak_range: usize,
}

impl From<&ProcessingParameters> for PreprocessSnapshot {
    fn from(p: &ProcessingParameters) -> Self {
        Self {
            processing_sampling_rate: p.processing_sampling_rate,
            de_drift_enable: p.de_drift_enable,
            de_drift_kernel: p.de_drift_kernel,
            bp_enable: p.bp_enable,
            bp_low: p.bp_low,
            bp_high: p.bp_high,
            notch_filter: p.notch_filter,
            power_grid: p.power_grid,
            auto_artefacts_removal: p.auto_artefacts_removal,
            power: p.power,
            smooth_detection: p.smooth_detection,
        }
    }
}

impl From<&ProcessingParameters> for DetectSnapshot {
    fn from(p: &ProcessingParameters) -> Self {
        Self {
            power: p.power,
            threshold: p.threshold,
            threshold_recovery_percentile: p.threshold_recovery_percentile,
            smooth_detection: p.smooth_detection,
            waveform_window_low: p.waveform_window_low,
            waveform_window_high: p.waveform_window_high,
            peak_range: p.peak_range,
        }
    }
}

/// Whether a stage must run again: it never ran, or its inputs changed.
pub fn stage_changed<T: PartialEq>(previous: Option<&T>, current: &T) -> bool {
    previous.map_or(true, |prev| prev != current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn presets_validate() {
        ProcessingParameters::preset(Species::Mouse)
            .validate_for_rate(2000.0)
            .expect("mouse preset");
        ProcessingParameters::preset(Species::Human)
            .validate_for_rate(500.0)
            .expect("human preset");
    }

    #[test]
    fn update_reverts_on_invalid_band() {
        let mut params = ProcessingParameters::preset(Species::Human);
        let before = params.clone();
        let err = params.update(|p| p.bp_low = 50.0).unwrap_err();
        assert!(matches!(err, ConfigError::BandOrder { .. }));
        assert_eq!(params, before);
        params.update(|p| p.bp_low = 1.0).expect("valid edit");
        assert_eq!(params.bp_low, 1.0);
    }

    #[test]
    fn cutoff_above_nyquist_rejected_for_rate() {
        let mut params = ProcessingParameters::preset(Species::Mouse);
        let err = params
            .update_for_rate(2000.0, |p| p.bp_high = 1000.0)
            .unwrap_err();
        assert!(matches!(err, ConfigError::AboveNyquist { .. }));
        assert_eq!(params.bp_high, 400.0);
    }

    #[test]
    fn decimation_factor_rounds_up() {
        let params = ProcessingParameters::preset(Species::Human);
        assert_eq!(params.decimation_factor(1200.0), 3);
        assert_eq!(params.decimation_factor(250.0), 1);
        assert!((params.effective_rate(1200.0) - 400.0).abs() < 1e-9);
    }

    #[test]
    fn legacy_record_is_migrated_field_by_field() {
        let stored = json!({
            "Name": "Human",
            "BPLow": 1.5,
            "BPEnable": 0,
            "PassNumber": 3,
            "SomethingRetired": 12,
        });
        let (params, warnings) = ProcessingParameters::from_stored(&stored).expect("restore");
        assert_eq!(params.species, Species::Human);
        assert_eq!(params.bp_low, 1.5);
        assert!(!params.bp_enable);
        assert_eq!(params.pass_number, 3);
        assert_eq!(params.bp_high, 40.0);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn stored_round_trip_is_identity() {
        let mut params = ProcessingParameters::preset(Species::Mouse);
        params.threshold = 7.5;
        let (restored, warnings) =
            ProcessingParameters::from_stored(&params.to_stored()).expect("restore");
        assert!(warnings.is_empty());
        assert_eq!(restored, params);
    }

    #[test]
    fn lenient_overlay_keeps_default_for_bad_type() {
        let stored = json!({ "schema_version": 2, "threshold": "high" });
        let (params, warnings) = ProcessingParameters::from_stored(&stored).expect("restore");
        assert_eq!(params.threshold, 20.0);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn assignments_are_strict() {
        let params = ProcessingParameters::preset(Species::Mouse);
        let edited = params
            .with_assignments(&["threshold=5".into(), "bp_enable=false".into()])
            .expect("valid assignments");
        assert_eq!(edited.threshold, 5.0);
        assert!(!edited.bp_enable);
        assert!(params.with_assignments(&["nope=1".into()]).is_err());
        assert!(params.with_assignments(&["species=human".into()]).is_ok());
    }

    #[test]
    fn toml_file_overrides_preset() {
        let params = parse_parameters("species = \"human\"\nthreshold = 12.0\n").expect("parse");
        assert_eq!(params.species, Species::Human);
        assert_eq!(params.threshold, 12.0);
        assert_eq!(params.sliding_window, 10.0);
        let text = params.to_toml().expect("toml");
        let again = parse_parameters(&text).expect("reparse");
        assert_eq!(again, params);
    }

    #[test]
    fn snapshots_gate_reruns() {
        let mut params = ProcessingParameters::preset(Species::Mouse);
        let before = DetectSnapshot::from(&params);
        assert!(stage_changed(None, &before));
        params.sliding_window = 4.0;
        assert!(!stage_changed(Some(&before), &DetectSnapshot::from(&params)));
        params.threshold = 3.0;
        assert!(stage_changed(Some(&before), &DetectSnapshot::from(&params)));
    }
}
