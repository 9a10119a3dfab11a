use crate::error::RecordingError;
use serde::{Deserialize, Serialize};

/// Raw single-channel recording as handed over by an ingestion adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Raw sampling frequency in Hz
    pub fs: f64,
    /// Raw samples
    pub data: Vec<f64>,
    /// Time of the first sample (seconds)
    #[serde(default)]
    pub start_time: f64,
    /// Channel / fragment identifier
    #[serde(default)]
    pub channel: String,
}

impl Recording {
    pub fn new(fs: f64, data: Vec<f64>) -> Self {
        Self {
            fs,
            data,
            start_time: 0.0,
            channel: String::new(),
        }
    }

    /// Build a recording from explicit per-sample times. The sampling rate is
    /// the mean rate over the whole record.
    pub fn from_times(times: &[f64], data: Vec<f64>) -> Result<Self, RecordingError> {
        if times.len() != data.len() {
            return Err(RecordingError::LengthMismatch {
                times: times.len(),
                samples: data.len(),
            });
        }
        if times.len() < 2 {
            return Err(RecordingError::TooShort(times.len()));
        }
        if let Some(pos) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(RecordingError::NonIncreasingTimes(pos + 1));
        }
        let span = times[times.len() - 1] - times[0];
        Ok(Self {
            fs: (times.len() - 1) as f64 / span,
            data,
            start_time: times[0],
            channel: String::new(),
        })
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }

    pub fn time_at(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.fs
    }
}

/// Signal at the processing rate. Samples inside artefact spans are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedSignal {
    /// Processing sampling frequency in Hz
    pub fs: f64,
    pub start_time: f64,
    pub samples: Vec<Option<f64>>,
    pub artefacts: Vec<Span>,
    /// Integer decimation factor applied to the raw recording (1 = none)
    pub decimation: usize,
}

impl PreprocessedSignal {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn time_at(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.fs
    }

    pub fn times(&self) -> Vec<f64> {
        (0..self.samples.len()).map(|i| self.time_at(i)).collect()
    }

    /// Nearest sample index for `time`, clamped to the signal bounds.
    pub fn index_of(&self, time: f64) -> usize {
        if self.samples.is_empty() {
            return 0;
        }
        let pos = ((time - self.start_time) * self.fs).round();
        pos.clamp(0.0, (self.samples.len() - 1) as f64) as usize
    }
}

/// Closed time interval `[start, end]` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub start: f64,
    pub end: f64,
}

impl Span {
    pub fn new(start: f64, end: f64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time <= self.end
    }

    /// True when the spans share more than an endpoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Apex of a beat: time and signal value of the local waveform maximum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatPeak {
    pub time: f64,
    pub value: f64,
}

/// Round a time to the 1e-6 s grid used for curated beat lists.
pub fn round_time(time: f64) -> f64 {
    (time * 1e6).round() / 1e6
}
