use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordingError {
    #[error("{times} sample times given for {samples} samples")]
    LengthMismatch { times: usize, samples: usize },
    #[error("a recording needs at least two samples, got {0}")]
    TooShort(usize),
    #[error("sample times must be strictly increasing (violated at sample {0})")]
    NonIncreasingTimes(usize),
}

/// Rejected parameter edits. The previous parameter set stays in effect.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("BPLow ({low} Hz) must be below BPHigh ({high} Hz)")]
    BandOrder { low: f64, high: f64 },
    #[error("{name} ({cutoff} Hz) must be below the Nyquist frequency ({nyquist} Hz)")]
    AboveNyquist {
        name: &'static str,
        cutoff: f64,
        nyquist: f64,
    },
    #[error("waveform window low ({low} ms) must be below high ({high} ms)")]
    WaveformWindow { low: f64, high: f64 },
    #[error("suspicious frequency low ({low} Hz) must be below high ({high} Hz)")]
    SuspiciousBounds { low: f64, high: f64 },
    #[error("percentile must lie in (0, 100), got {0}")]
    Percentile(f64),
    #[error("pass number must be at least 1")]
    NoPasses,
    #[error("unknown parameter '{0}'")]
    UnknownField(String),
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreprocessError {
    #[error("recording is empty")]
    EmptyRecording,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("signal is empty or fully masked")]
    EmptySignal,
    #[error(
        "threshold {threshold} leaves {candidates} candidate(s); lowering it to {suggested} needs confirmation"
    )]
    DegenerateThreshold {
        threshold: f64,
        candidates: usize,
        suggested: f64,
    },
    #[error("no usable waveform windows to build a template from")]
    NoTemplate,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProjectionError {
    #[error("cannot establish a reliable starting point for projection")]
    NoSeed,
}

/// Structured failure reported by the orchestrator to its collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("{0} has not run yet")]
    NotReady(&'static str),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error("projection cancelled after {completed} of {requested} pass(es)")]
    Cancelled { completed: usize, requested: usize },
    #[error("session is inconsistent: {0}")]
    Session(String),
}
