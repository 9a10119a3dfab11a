use crate::{
    config::ProcessingParameters,
    detectors::{envelope, smoothing_window},
    dsp::{decimate, dominant_maxima, percentile, smooth_gaussian, ZeroPhase},
    error::PreprocessError,
    ranges::{mask_runs, merge_close, pad_and_clamp},
    signal::{PreprocessedSignal, Recording, Span},
};
use log::{debug, info, warn};

/// Envelope level, relative to the 92nd percentile of envelope maxima, above
/// which a stretch is treated as an artefact.
const ARTEFACT_FACTOR: f64 = 100.0;
const ARTEFACT_PERCENTILE: f64 = 92.0;
/// Flagged stretches closer than this are merged (s).
const ARTEFACT_MERGE_S: f64 = 0.2;
/// Padding added on both sides of an artefact (s).
const ARTEFACT_PAD_S: f64 = 0.05;
/// Half-width of the notch stop band (Hz).
const NOTCH_HALF_WIDTH: f64 = 5.0;

/// Bring a raw recording to the processing rate, filter it and mask artefacts.
pub fn preprocess(
    recording: &Recording,
    params: &ProcessingParameters,
) -> Result<PreprocessedSignal, PreprocessError> {
    if recording.is_empty() {
        return Err(PreprocessError::EmptyRecording);
    }
    params.validate_for_rate(recording.fs)?;

    let mut invalid_raw = Vec::new();
    let raw: Vec<f64> = recording
        .data
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            if x.is_finite() {
                x
            } else {
                invalid_raw.push(i);
                0.0
            }
        })
        .collect();
    if !invalid_raw.is_empty() {
        warn!(
            "{} non-finite raw sample(s) will be treated as missing",
            invalid_raw.len()
        );
    }

    let factor = params.decimation_factor(recording.fs);
    let fs = recording.fs / factor as f64;
    let mut data = decimate(&raw, recording.fs, factor);
    if factor > 1 {
        debug!(
            "decimated {} Hz -> {} Hz (factor {})",
            recording.fs, fs, factor
        );
    }

    if params.de_drift_enable {
        data = remove_drift(&data, fs, params.de_drift_kernel);
    }
    if params.bp_enable {
        data = ZeroPhase::butterworth_bandpass(params.bp_low, params.bp_high, fs).apply(&data);
    }
    if params.notch_filter {
        data = ZeroPhase::notch(params.power_grid, 2.0 * NOTCH_HALF_WIDTH, fs).apply(&data);
    }

    let mut samples: Vec<Option<f64>> = data.iter().copied().map(Some).collect();
    for i in invalid_raw {
        if let Some(slot) = samples.get_mut(i / factor) {
            *slot = None;
        }
    }

    let mut artefacts = Vec::new();
    if params.auto_artefacts_removal {
        for (first, last) in artefact_runs(&data, fs, params) {
            samples[first..=last].iter_mut().for_each(|s| *s = None);
            artefacts.push(Span::new(
                recording.start_time + first as f64 / fs,
                recording.start_time + last as f64 / fs,
            ));
        }
    }
    info!(
        "preprocessed {} samples at {} Hz, {} artefact span(s)",
        samples.len(),
        fs,
        artefacts.len()
    );

    Ok(PreprocessedSignal {
        fs,
        start_time: recording.start_time,
        samples,
        artefacts,
        decimation: factor,
    })
}

/// Subtract a Gaussian moving average `kernel_s` seconds wide.
pub fn remove_drift(data: &[f64], fs: f64, kernel_s: f64) -> Vec<f64> {
    let window = ((kernel_s * fs).round() as usize).max(1);
    let baseline = smooth_gaussian(data, window);
    data.iter().zip(baseline).map(|(x, b)| x - b).collect()
}

/// Sample runs (inclusive) whose envelope is far above the typical beat level.
///
/// The reference level is taken over envelope maxima that dominate half the
/// shortest plausible beat interval, so noise ripples between beats do not
/// drag it down.
pub fn artefact_runs(
    data: &[f64],
    fs: f64,
    params: &ProcessingParameters,
) -> Vec<(usize, usize)> {
    let env = envelope(data, params.power, smoothing_window(params.smooth_detection, fs));
    let radius = (0.5 * fs / params.suspicious_frequency_high).round() as usize;
    let heights: Vec<f64> = dominant_maxima(&env, radius)
        .into_iter()
        .map(|i| env[i])
        .collect();
    let Some(reference) = percentile(&heights, ARTEFACT_PERCENTILE) else {
        return Vec::new();
    };
    let limit = ARTEFACT_FACTOR * reference;
    if !(limit > 0.0) {
        return Vec::new();
    }
    let flagged: Vec<bool> = env.iter().map(|&e| e > limit).collect();
    let runs = mask_runs(&flagged);
    if runs.is_empty() {
        return runs;
    }
    let merged = merge_close(&runs, (ARTEFACT_MERGE_S * fs).round() as usize);
    let padded = pad_and_clamp(&merged, (ARTEFACT_PAD_S * fs).round() as usize, data.len());
    debug!(
        "artefact limit {:.3e}: {} flagged run(s) -> {} span(s)",
        limit,
        runs.len(),
        padded.len()
    );
    padded
}
