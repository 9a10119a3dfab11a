use crate::{
    config::ProcessingParameters,
    detectors::{envelope, smoothing_window},
    dsp::{
        argmax_nearest, dominant_maxima, local_maxima, max_cross_correlation, median, percentile,
        std_dev, zscore,
    },
    error::DetectError,
    signal::{BeatPeak, PreprocessedSignal},
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Below this many candidates the threshold is considered degenerate.
const MIN_CANDIDATES: usize = 2;
/// Envelope-height band (percentiles of maxima heights) that feeds the template.
const TEMPLATE_BAND: (f64, f64) = (70.0, 90.0);

/// Waveform window around a peak, in samples relative to the peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformWindow {
    pub low: isize,
    pub high: isize,
}

impl WaveformWindow {
    pub fn new(low_ms: f64, high_ms: f64, fs: f64) -> Self {
        Self {
            low: (low_ms * fs / 1000.0).round() as isize,
            high: (high_ms * fs / 1000.0).round() as isize,
        }
    }

    pub fn from_params(params: &ProcessingParameters, fs: f64) -> Self {
        Self::new(params.waveform_window_low, params.waveform_window_high, fs)
    }

    pub fn len(&self) -> usize {
        (self.high - self.low + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inclusive sample bounds of the window around `center`, if it fits in `n` samples.
    pub fn bounds(&self, center: usize, n: usize) -> Option<(usize, usize)> {
        let first = center as isize + self.low;
        let last = center as isize + self.high;
        if first < 0 || last >= n as isize || last < first {
            None
        } else {
            Some((first as usize, last as usize))
        }
    }

    pub fn extract<'a>(&self, samples: &'a [Option<f64>], center: usize) -> Option<&'a [Option<f64>]> {
        self.bounds(center, samples.len())
            .map(|(first, last)| &samples[first..=last])
    }
}

/// Median z-scored waveform of typical beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub window: WaveformWindow,
    pub values: Vec<f64>,
}

impl Template {
    /// Position of the template maximum within the window; ties go to the
    /// position closest to the peak itself.
    pub fn apex_index(&self) -> usize {
        let centre = -self.window.low;
        argmax_nearest(
            self.values
                .iter()
                .enumerate()
                .map(|(i, v)| (i as isize, Some(*v))),
            centre,
        )
        .map_or(0, |(i, _)| i as usize)
    }
}

/// Asked before the detector lowers an unusable threshold.
pub trait ThresholdConfirm {
    fn confirm(&self, threshold: f64, suggested: f64, candidates: usize) -> bool;
}

impl<F> ThresholdConfirm for F
where
    F: Fn(f64, f64, usize) -> bool,
{
    fn confirm(&self, threshold: f64, suggested: f64, candidates: usize) -> bool {
        self(threshold, suggested, candidates)
    }
}

/// Always accepts the lowered threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoLower;

impl ThresholdConfirm for AutoLower {
    fn confirm(&self, threshold: f64, suggested: f64, candidates: usize) -> bool {
        warn!(
            "threshold {} leaves {} candidate(s); lowering to {:.3}",
            threshold, candidates, suggested
        );
        true
    }
}

/// Never lowers the threshold; detection fails instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepThreshold;

impl ThresholdConfirm for KeepThreshold {
    fn confirm(&self, _threshold: f64, _suggested: f64, _candidates: usize) -> bool {
        false
    }
}

/// One detected beat candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Sample index of the envelope maximum
    pub index: usize,
    pub time: f64,
    /// Envelope height
    pub height: f64,
    /// Template correlation, 1 for the best-matching candidate
    pub correlation: f64,
    pub apex: BeatPeak,
    /// Samples between the waveform apex and the template apex
    pub apex_distance: usize,
}

/// Everything one detection run produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub fs: f64,
    /// Threshold actually applied (differs from the parameter when lowered)
    pub threshold: f64,
    pub threshold_lowered: bool,
    pub template: Template,
    /// Waveforms that went into the template
    pub template_members: usize,
    /// Raw correlation of the best candidate, used to normalise the others
    pub max_correlation: f64,
    pub peaks: Vec<Peak>,
    /// Z-scored waveform per peak, row-aligned with `peaks`
    pub waveforms: Vec<Vec<f64>>,
}

impl Detection {
    pub fn times(&self) -> Vec<f64> {
        self.peaks.iter().map(|p| p.time).collect()
    }

    pub fn matcher(&self, peak_range: usize) -> Matcher {
        Matcher {
            template: self.template.clone(),
            max_correlation: self.max_correlation,
            peak_range,
        }
    }
}

/// Scores an arbitrary sample position against a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Matcher {
    pub template: Template,
    pub max_correlation: f64,
    pub peak_range: usize,
}

/// Score of a single position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformScore {
    pub correlation: f64,
    pub apex: BeatPeak,
    pub apex_distance: usize,
}

impl Matcher {
    /// Cross-correlation of the z-scored window around `index` with the
    /// template, not yet normalised. Flat windows score zero.
    pub fn raw_correlation(&self, samples: &[Option<f64>], index: usize) -> Option<f64> {
        let window = self.template.window.extract(samples, index)?;
        Some(
            zscore(window)
                .map_or(0.0, |z| max_cross_correlation(&z, &self.template.values)),
        )
    }

    /// Apex of the waveform around `index`, searched within `peak_range`
    /// samples of the template apex.
    pub fn apex(&self, signal: &PreprocessedSignal, index: usize) -> Option<(BeatPeak, usize)> {
        let (first, last) = self.template.window.bounds(index, signal.len())?;
        let reference = self.template.apex_index() as isize;
        let range = self.peak_range as isize;
        let span = (last - first) as isize;
        let lo = (reference - range).max(0);
        let hi = (reference + range).min(span);
        let (offset, value) = argmax_nearest(
            (lo..=hi).map(|off| (off, signal.samples[first + off as usize])),
            reference,
        )?;
        let sample = first + offset as usize;
        Some((
            BeatPeak {
                time: signal.time_at(sample),
                value,
            },
            (offset - reference).unsigned_abs(),
        ))
    }

    pub fn score(&self, signal: &PreprocessedSignal, index: usize) -> Option<WaveformScore> {
        let raw = self.raw_correlation(&signal.samples, index)?;
        let (apex, apex_distance) = self.apex(signal, index)?;
        Some(WaveformScore {
            correlation: raw / self.max_correlation,
            apex,
            apex_distance,
        })
    }
}

/// Find beat candidates in a preprocessed signal and score them against a
/// template. `prior` is reused when its window still matches the parameters.
pub fn detect(
    signal: &PreprocessedSignal,
    params: &ProcessingParameters,
    prior: Option<&Template>,
    confirm: &dyn ThresholdConfirm,
) -> Result<Detection, DetectError> {
    let valid: Vec<f64> = signal.samples.iter().flatten().copied().collect();
    let scale = std_dev(&valid)
        .filter(|s| *s > f64::EPSILON)
        .ok_or(DetectError::EmptySignal)?;
    let normalised: Vec<f64> = signal
        .samples
        .iter()
        .map(|s| s.map_or(0.0, |v| v / scale))
        .collect();
    let env = envelope(
        &normalised,
        params.power,
        smoothing_window(params.smooth_detection, signal.fs),
    );

    let window = WaveformWindow::from_params(params, signal.fs);
    let n = signal.len();
    let maxima: Vec<usize> = local_maxima(&env)
        .into_iter()
        .filter(|&i| window.bounds(i, n).is_some())
        .collect();

    let radius = (signal.fs / params.suspicious_frequency_high).round() as usize;
    let template_pool: Vec<usize> = dominant_maxima(&env, radius.max(1))
        .into_iter()
        .filter(|&i| window.bounds(i, n).is_some())
        .collect();

    let (candidates, threshold, threshold_lowered) = resolve_threshold(
        &env,
        &maxima,
        params.threshold,
        params.threshold_recovery_percentile,
        confirm,
    )?;

    let (template, template_members) = match prior {
        Some(t) if t.window == window && t.values.len() == window.len() => (t.clone(), 0),
        _ => build_template(&signal.samples, &env, &template_pool, window)?,
    };

    let mut matcher = Matcher {
        template,
        max_correlation: 1.0,
        peak_range: params.peak_range,
    };
    let raw: Vec<Option<f64>> = candidates
        .iter()
        .map(|&i| matcher.raw_correlation(&signal.samples, i))
        .collect();
    let best = raw.iter().flatten().copied().fold(f64::NEG_INFINITY, f64::max);
    matcher.max_correlation = if best > f64::EPSILON { best } else { 1.0 };

    let mut peaks = Vec::with_capacity(candidates.len());
    let mut waveforms = Vec::with_capacity(candidates.len());
    for (&index, raw) in candidates.iter().zip(raw) {
        let Some(raw) = raw else { continue };
        let Some((apex, apex_distance)) = matcher.apex(signal, index) else {
            continue;
        };
        let waveform = window
            .extract(&signal.samples, index)
            .and_then(zscore)
            .unwrap_or_else(|| vec![0.0; window.len()]);
        peaks.push(Peak {
            index,
            time: signal.time_at(index),
            height: env[index],
            correlation: raw / matcher.max_correlation,
            apex,
            apex_distance,
        });
        waveforms.push(waveform);
    }
    info!(
        "detected {} peak(s) above threshold {:.3}{}",
        peaks.len(),
        threshold,
        if threshold_lowered { " (lowered)" } else { "" }
    );

    Ok(Detection {
        fs: signal.fs,
        threshold,
        threshold_lowered,
        template: matcher.template,
        template_members,
        max_correlation: matcher.max_correlation,
        peaks,
        waveforms,
    })
}

/// Maxima above `threshold`. When fewer than two qualify, the percentile
/// of all maxima heights is offered as a replacement threshold.
pub fn resolve_threshold(
    env: &[f64],
    maxima: &[usize],
    threshold: f64,
    recovery_percentile: f64,
    confirm: &dyn ThresholdConfirm,
) -> Result<(Vec<usize>, f64, bool), DetectError> {
    let above = |limit: f64| -> Vec<usize> {
        maxima.iter().copied().filter(|&i| env[i] > limit).collect()
    };
    let candidates = above(threshold);
    if candidates.len() >= MIN_CANDIDATES {
        return Ok((candidates, threshold, false));
    }
    let heights: Vec<f64> = maxima.iter().map(|&i| env[i]).collect();
    let Some(suggested) = percentile(&heights, recovery_percentile) else {
        return Err(DetectError::EmptySignal);
    };
    if !confirm.confirm(threshold, suggested, candidates.len()) {
        return Err(DetectError::DegenerateThreshold {
            threshold,
            candidates: candidates.len(),
            suggested,
        });
    }
    let lowered = above(suggested);
    if lowered.is_empty() {
        return Err(DetectError::DegenerateThreshold {
            threshold: suggested,
            candidates: 0,
            suggested,
        });
    }
    Ok((lowered, suggested, true))
}

/// Median z-scored waveform of the maxima whose envelope height lies
/// strictly inside the template band. Falls back to the maxima at or above
/// the lower band edge when the band is empty. The threshold plays no part.
fn build_template(
    samples: &[Option<f64>],
    env: &[f64],
    maxima: &[usize],
    window: WaveformWindow,
) -> Result<(Template, usize), DetectError> {
    let complete = |i: usize| -> Option<Vec<f64>> {
        let w = window.extract(samples, i)?;
        if w.iter().any(Option::is_none) {
            return None;
        }
        zscore(w)
    };
    let heights: Vec<f64> = maxima.iter().map(|&i| env[i]).collect();
    let (lo, hi) = match (
        percentile(&heights, TEMPLATE_BAND.0),
        percentile(&heights, TEMPLATE_BAND.1),
    ) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => return Err(DetectError::NoTemplate),
    };
    let mut members: Vec<Vec<f64>> = maxima
        .iter()
        .filter(|&&i| env[i] > lo && env[i] < hi)
        .filter_map(|&i| complete(i))
        .collect();
    if members.is_empty() {
        debug!("template band empty, using every complete window at or above it");
        members = maxima
            .iter()
            .filter(|&&i| env[i] >= lo)
            .filter_map(|&i| complete(i))
            .collect();
    }
    if members.is_empty() {
        return Err(DetectError::NoTemplate);
    }
    let values = (0..window.len())
        .map(|k| {
            let column: Vec<f64> = members.iter().map(|m| m[k]).collect();
            median(&column).unwrap_or(0.0)
        })
        .collect();
    Ok((Template { window, values }, members.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Species;

    const PULSES: [usize; 10] = [100, 300, 500, 700, 900, 1100, 1300, 1500, 1700, 1900];

    fn pulse_train() -> PreprocessedSignal {
        let mut samples = vec![0.0; 2000];
        for (i, v) in samples.iter_mut().enumerate() {
            *v = 0.01 * (i as f64 * 0.37).sin();
        }
        for &c in &PULSES {
            for (i, v) in samples.iter_mut().enumerate() {
                let x = (i as f64 - c as f64) / 3.0;
                *v += (-0.5 * x * x).exp();
            }
        }
        PreprocessedSignal {
            fs: 1000.0,
            start_time: 0.0,
            samples: samples.into_iter().map(Some).collect(),
            artefacts: Vec::new(),
            decimation: 1,
        }
    }

    #[test]
    fn finds_every_pulse_with_apex_on_centre() {
        let signal = pulse_train();
        let params = ProcessingParameters::preset(Species::Mouse);
        let detection = detect(&signal, &params, None, &KeepThreshold).expect("detect");
        let indices: Vec<usize> = detection.peaks.iter().map(|p| p.index).collect();
        assert_eq!(indices, PULSES.to_vec());
        assert!(!detection.threshold_lowered);
        for peak in &detection.peaks {
            assert!(peak.correlation > 0.9 && peak.correlation <= 1.0 + 1e-12);
            assert!((peak.apex.time - peak.time).abs() < 1e-9);
            assert_eq!(peak.apex_distance, 0);
        }
        assert_eq!(detection.waveforms.len(), detection.peaks.len());
    }

    #[test]
    fn prior_template_is_reused() {
        let signal = pulse_train();
        let params = ProcessingParameters::preset(Species::Mouse);
        let first = detect(&signal, &params, None, &KeepThreshold).expect("detect");
        let again =
            detect(&signal, &params, Some(&first.template), &KeepThreshold).expect("detect");
        assert_eq!(again.template, first.template);
        assert_eq!(again.template_members, 0);
        assert_eq!(again.times(), first.times());
    }

    #[test]
    fn template_does_not_depend_on_threshold() {
        let signal = pulse_train();
        let params = ProcessingParameters::preset(Species::Mouse);
        let strict = detect(&signal, &params, None, &KeepThreshold).expect("detect");
        let mut loose = params.clone();
        loose.threshold = 1e-9;
        let lenient = detect(&signal, &loose, None, &KeepThreshold).expect("detect");
        assert!(lenient.peaks.len() >= strict.peaks.len());
        assert_eq!(lenient.template, strict.template);
        assert_eq!(lenient.template_members, strict.template_members);
        let values = &strict.template.values;
        let apex = (0..values.len())
            .max_by(|&a, &b| values[a].total_cmp(&values[b]))
            .expect("template");
        assert_eq!(apex as isize, -strict.template.window.low);
    }

    #[test]
    fn unreachable_threshold_needs_confirmation() {
        let signal = pulse_train();
        let mut params = ProcessingParameters::preset(Species::Mouse);
        params.threshold = 1e12;
        let err = detect(&signal, &params, None, &KeepThreshold).unwrap_err();
        assert!(matches!(err, DetectError::DegenerateThreshold { candidates: 0, .. }));
    }

    #[test]
    fn confirmed_recovery_lowers_threshold() {
        // maxima with heights 1..=10 at odd indices
        let mut env = vec![0.0; 21];
        let maxima: Vec<usize> = (0..10).map(|k| 2 * k + 1).collect();
        for (k, &i) in maxima.iter().enumerate() {
            env[i] = (k + 1) as f64;
        }
        let (candidates, threshold, lowered) =
            resolve_threshold(&env, &maxima, 1000.0, 90.0, &|_: f64, _: f64, _: usize| true)
                .expect("recovered");
        assert!(lowered);
        assert!((threshold - 9.1).abs() < 1e-9);
        assert_eq!(candidates, vec![19]);

        let declined =
            resolve_threshold(&env, &maxima, 1000.0, 90.0, &|_: f64, _: f64, _: usize| false);
        assert!(matches!(
            declined,
            Err(DetectError::DegenerateThreshold { candidates: 0, .. })
        ));
    }

    #[test]
    fn masked_signal_is_rejected() {
        let signal = PreprocessedSignal {
            fs: 1000.0,
            start_time: 0.0,
            samples: vec![None; 100],
            artefacts: Vec::new(),
            decimation: 1,
        };
        let params = ProcessingParameters::default();
        let err = detect(&signal, &params, None, &AutoLower).unwrap_err();
        assert_eq!(err, DetectError::EmptySignal);
    }

    #[test]
    fn window_bounds_respect_edges() {
        let window = WaveformWindow::new(-10.0, 15.0, 1000.0);
        assert_eq!(window.len(), 26);
        assert_eq!(window.bounds(9, 100), None);
        assert_eq!(window.bounds(10, 100), Some((0, 25)));
        assert_eq!(window.bounds(85, 100), None);
    }
}
