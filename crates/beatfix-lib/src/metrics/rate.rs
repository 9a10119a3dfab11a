use crate::signal::Span;
use serde::{Deserialize, Serialize};

/// Rate at one beat; `None` where the estimate is masked or undefined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub time: f64,
    /// Beats per second
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateUnit {
    Hz,
    #[default]
    Bpm,
}

impl RateUnit {
    pub fn express(&self, rate_hz: f64) -> f64 {
        match self {
            RateUnit::Hz => rate_hz,
            RateUnit::Bpm => rate_hz * 60.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RateUnit::Hz => "Hz",
            RateUnit::Bpm => "bpm",
        }
    }
}

/// Trailing-window beat rate at every beat.
///
/// For a beat at `t`, the beats in `[t - window, t]` are counted and their
/// `count - 1` intervals divided by the span they cover, or by the nominal
/// window when they cover less than half of it. Beats inside an exclusion
/// span, or less than one window after its end, are masked.
pub fn sliding_rate(beats: &[f64], window: f64, exclusions: &[Span]) -> Vec<RatePoint> {
    let mut out = Vec::with_capacity(beats.len());
    let mut lo = 0;
    for (i, &t) in beats.iter().enumerate() {
        while beats[lo] < t - window {
            lo += 1;
        }
        let masked = exclusions
            .iter()
            .any(|s| t >= s.start && t <= s.end + window);
        let count = i - lo + 1;
        let rate = if masked || count < 2 {
            None
        } else {
            let span = t - beats[lo];
            let effective = if span > window / 2.0 { span } else { window };
            Some((count - 1) as f64 / effective)
        };
        out.push(RatePoint { time: t, rate });
    }
    out
}

/// Mean and range of the defined rate entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    pub beats: usize,
    pub defined: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

pub fn summarize(rate: &[RatePoint]) -> Option<RateSummary> {
    let defined: Vec<f64> = rate.iter().filter_map(|p| p.rate).collect();
    if defined.is_empty() {
        return None;
    }
    Some(RateSummary {
        beats: rate.len(),
        defined: defined.len(),
        mean: defined.iter().sum::<f64>() / defined.len() as f64,
        min: defined.iter().copied().fold(f64::INFINITY, f64::min),
        max: defined.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_train_gives_inverse_interval() {
        let beats: Vec<f64> = (0..40).map(|i| i as f64 * 0.25).collect();
        let rate = sliding_rate(&beats, 1.0, &[]);
        assert_eq!(rate[0].rate, None);
        for point in rate.iter().filter(|p| p.time >= 1.0) {
            assert_eq!(point.rate, Some(4.0), "at {}", point.time);
        }
    }

    #[test]
    fn window_of_two_intervals_is_exact() {
        let beats: Vec<f64> = (0..40).map(|i| i as f64 * 0.25).collect();
        let rate = sliding_rate(&beats, 0.5, &[]);
        for point in rate.iter().filter(|p| p.time >= 0.5) {
            assert_eq!(point.rate, Some(4.0), "at {}", point.time);
        }
        let rate = sliding_rate(&beats, 0.6, &[]);
        for point in rate.iter().filter(|p| p.time >= 0.6) {
            assert_eq!(point.rate, Some(4.0), "at {}", point.time);
        }
    }

    #[test]
    fn inexact_interval_stays_close() {
        let beats: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
        let rate = sliding_rate(&beats, 1.0, &[]);
        for point in rate.iter().filter(|p| p.time >= 1.0) {
            let r = point.rate.expect("defined");
            assert!((r - 10.0).abs() < 1e-9, "{} at {}", r, point.time);
        }
    }

    #[test]
    fn sparse_beats_use_nominal_window() {
        let rate = sliding_rate(&[0.0, 0.3], 2.0, &[]);
        assert_eq!(rate[1].rate, Some(0.5));
    }

    #[test]
    fn exclusions_mask_one_window_past_their_end() {
        let beats: Vec<f64> = (0..40).map(|i| i as f64 * 0.25).collect();
        let rate = sliding_rate(&beats, 1.0, &[Span::new(3.0, 4.0)]);
        for point in rate.iter().filter(|p| p.time >= 1.0) {
            let masked = point.time >= 3.0 && point.time <= 5.0;
            assert_eq!(point.rate.is_none(), masked, "at {}", point.time);
        }
    }

    #[test]
    fn units_and_summary() {
        assert_eq!(RateUnit::Bpm.express(2.0), 120.0);
        assert_eq!(RateUnit::Hz.label(), "Hz");
        let points = [
            RatePoint { time: 0.0, rate: None },
            RatePoint { time: 1.0, rate: Some(2.0) },
            RatePoint { time: 2.0, rate: Some(4.0) },
        ];
        let summary = summarize(&points).expect("summary");
        assert_eq!(summary.defined, 2);
        assert_eq!(summary.mean, 3.0);
        assert_eq!(summary.max, 4.0);
        assert!(summarize(&points[..1]).is_none());
    }
}
