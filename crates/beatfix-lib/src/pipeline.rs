//! Stage orchestration and ownership of the curated beat list.

use crate::{
    config::{stage_changed, DetectSnapshot, PreprocessSnapshot, ProcessingParameters},
    detectors::{
        peaks::{detect, Detection, Matcher, ThresholdConfirm},
        preprocess::preprocess,
        projection::{correct_range, split_ranges, Beat, ProjectionSettings},
    },
    error::{PipelineError, ProjectionError},
    metrics::rate::{sliding_rate, RatePoint},
    ranges::{insert_removed_window, merge_spans, remove_span_at},
    signal::{round_time, BeatPeak, PreprocessedSignal, Recording, Span},
};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

/// Outcome of a projection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionReport {
    pub passes: usize,
    pub ranges: usize,
    pub resolved_spans: usize,
    pub unresolved_spans: usize,
    /// Ranges left unchanged because no trusted beat was found
    pub unseeded_ranges: usize,
    pub beats_before: usize,
    pub beats_after: usize,
}

/// Owns the recording, the parameters and every derived artefact. Stages
/// rerun only when their inputs changed.
#[derive(Debug, Clone)]
pub struct Pipeline {
    recording: Recording,
    params: ProcessingParameters,
    signal: Option<PreprocessedSignal>,
    detection: Option<Detection>,
    preprocessed_with: Option<PreprocessSnapshot>,
    detected_with: Option<DetectSnapshot>,
    beats: Vec<f64>,
    /// Beats came from outside (a session) and survive the next detection.
    beats_loaded: bool,
    removed: Vec<Span>,
    rate: Vec<RatePoint>,
}

impl Pipeline {
    pub fn new(recording: Recording, params: ProcessingParameters) -> Result<Self, PipelineError> {
        params.validate_for_rate(recording.fs)?;
        Ok(Self {
            recording,
            params,
            signal: None,
            detection: None,
            preprocessed_with: None,
            detected_with: None,
            beats: Vec::new(),
            beats_loaded: false,
            removed: Vec::new(),
            rate: Vec::new(),
        })
    }

    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    pub fn params(&self) -> &ProcessingParameters {
        &self.params
    }

    pub fn signal(&self) -> Option<&PreprocessedSignal> {
        self.signal.as_ref()
    }

    pub fn detection(&self) -> Option<&Detection> {
        self.detection.as_ref()
    }

    /// Curated beat times (s), sorted and unique.
    pub fn beats(&self) -> &[f64] {
        &self.beats
    }

    pub fn removed_windows(&self) -> &[Span] {
        &self.removed
    }

    pub fn artefacts(&self) -> &[Span] {
        self.signal.as_ref().map_or(&[], |s| s.artefacts.as_slice())
    }

    pub fn rate(&self) -> &[RatePoint] {
        &self.rate
    }

    /// Artefact spans and removed windows, merged.
    pub fn exclusions(&self) -> Vec<Span> {
        let mut all = self.artefacts().to_vec();
        all.extend_from_slice(&self.removed);
        merge_spans(&all)
    }

    /// Replace the parameters. An invalid set is rejected and the current one kept.
    pub fn set_params(&mut self, params: ProcessingParameters) -> Result<(), PipelineError> {
        params.validate_for_rate(self.recording.fs)?;
        let window = self.params.sliding_window;
        self.params = params;
        if self.params.sliding_window != window {
            self.refresh_rate();
        }
        Ok(())
    }

    pub fn update_params<F: FnOnce(&mut ProcessingParameters)>(
        &mut self,
        edit: F,
    ) -> Result<(), PipelineError> {
        let fs = self.recording.fs;
        let window = self.params.sliding_window;
        self.params.update_for_rate(fs, edit)?;
        if self.params.sliding_window != window {
            self.refresh_rate();
        }
        Ok(())
    }

    /// Run preprocessing if it never ran or its parameters changed. Returns
    /// whether it ran.
    pub fn preprocess(&mut self) -> Result<bool, PipelineError> {
        let inputs = PreprocessSnapshot::from(&self.params);
        if self.signal.is_some() && !stage_changed(self.preprocessed_with.as_ref(), &inputs) {
            return Ok(false);
        }
        let signal = preprocess(&self.recording, &self.params)?;
        self.signal = Some(signal);
        self.preprocessed_with = Some(inputs);
        self.detection = None;
        self.detected_with = None;
        self.refresh_rate();
        Ok(true)
    }

    /// Run detection (and preprocessing first if needed). A fresh detection
    /// replaces the curated beat list with the detected peaks, unless the list
    /// was loaded with [`Pipeline::set_beats`] since the last detection.
    pub fn detect(&mut self, confirm: &dyn ThresholdConfirm) -> Result<bool, PipelineError> {
        self.preprocess()?;
        let inputs = DetectSnapshot::from(&self.params);
        if self.detection.is_some() && !stage_changed(self.detected_with.as_ref(), &inputs) {
            return Ok(false);
        }
        let signal = self.signal.as_ref().ok_or(PipelineError::NotReady("preprocessing"))?;
        let detection = detect(signal, &self.params, None, confirm)?;
        if detection.threshold_lowered {
            self.params.threshold = detection.threshold;
        }
        if self.beats_loaded {
            info!("keeping {} loaded beats over fresh detection", self.beats.len());
            self.beats_loaded = false;
        } else {
            self.beats = detection.times().into_iter().map(round_time).collect();
            self.beats.dedup();
        }
        self.detection = Some(detection);
        self.detected_with = Some(DetectSnapshot::from(&self.params));
        self.refresh_rate();
        Ok(true)
    }

    /// Run `pass_number` projection passes over the curated beats. Ranges are
    /// corrected in parallel within a pass. When `cancel` is raised the run
    /// stops between ranges and the beats of completed passes are kept.
    pub fn project(&mut self, cancel: &AtomicBool) -> Result<ProjectionReport, PipelineError> {
        self.project_until(&|| cancel.load(Ordering::Relaxed))
    }

    fn project_until(
        &mut self,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<ProjectionReport, PipelineError> {
        let signal = self.signal.as_ref().ok_or(PipelineError::NotReady("preprocessing"))?;
        let detection = self.detection.as_ref().ok_or(PipelineError::NotReady("detection"))?;
        let settings = ProjectionSettings::new(&self.params, signal.fs);
        let matcher = detection.matcher(self.params.peak_range);
        let by_index: HashMap<usize, (f64, f64)> = detection
            .peaks
            .iter()
            .map(|p| (p.index, (p.correlation, p.apex_distance as f64)))
            .collect();
        let exclusions = self.exclusions();
        let requested = self.params.pass_number;
        let mut report = ProjectionReport {
            beats_before: self.beats.len(),
            ..Default::default()
        };

        let mut beats = self.beats.clone();
        for pass in 0..requested {
            if cancelled() {
                self.commit_beats(beats);
                return Err(PipelineError::Cancelled {
                    completed: pass,
                    requested,
                });
            }
            let split = split_ranges(&beats, &exclusions, self.params.discontinue);
            let corrected: Vec<Result<(Vec<f64>, usize, usize), ProjectionError>> = split
                .ranges
                .par_iter()
                .map(|range| {
                    if cancelled() {
                        return Ok((range.clone(), 0, 0));
                    }
                    let input: Vec<Beat> = range
                        .iter()
                        .map(|&t| to_beat(signal, &matcher, &by_index, t))
                        .collect();
                    let out = correct_range(&input, &settings, self.params.backward_pass)?;
                    let times = out
                        .beats
                        .iter()
                        .map(|b| round_time(signal.time_at(b.pos as usize)))
                        .collect();
                    Ok((times, out.resolved, out.unresolved))
                })
                .collect();
            if cancelled() {
                self.commit_beats(beats);
                return Err(PipelineError::Cancelled {
                    completed: pass,
                    requested,
                });
            }

            let mut next = split.excluded.clone();
            let mut unseeded = 0;
            for (range, result) in split.ranges.iter().zip(corrected) {
                match result {
                    Ok((times, resolved, unresolved)) => {
                        next.extend(times);
                        report.resolved_spans += resolved;
                        report.unresolved_spans += unresolved;
                    }
                    Err(err) => {
                        warn!("range starting at {:.3}s left unchanged: {}", range[0], err);
                        next.extend_from_slice(range);
                        unseeded += 1;
                    }
                }
            }
            if pass == 0 && unseeded > 0 && unseeded == split.ranges.len() {
                return Err(ProjectionError::NoSeed.into());
            }
            report.unseeded_ranges += unseeded;
            report.ranges = split.ranges.len();
            next.sort_by(f64::total_cmp);
            next.dedup();
            debug!("pass {}: {} -> {} beats", pass + 1, beats.len(), next.len());
            beats = next;
            report.passes = pass + 1;
        }
        report.beats_after = beats.len();
        info!(
            "projection: {} pass(es), {} range(s), {} -> {} beats",
            report.passes, report.ranges, report.beats_before, report.beats_after
        );
        self.commit_beats(beats);
        Ok(report)
    }

    /// Preprocess, detect and project in one go.
    pub fn run(
        &mut self,
        confirm: &dyn ThresholdConfirm,
        cancel: &AtomicBool,
    ) -> Result<ProjectionReport, PipelineError> {
        self.detect(confirm)?;
        self.project(cancel)
    }

    /// Add the beat at `time` (snapped to the nearest processing sample) or
    /// remove it if present. Returns true when a beat was added.
    pub fn toggle_beat(&mut self, time: f64) -> Result<bool, PipelineError> {
        let signal = self.signal.as_ref().ok_or(PipelineError::NotReady("preprocessing"))?;
        let snapped = round_time(signal.time_at(signal.index_of(time)));
        let added = match self.beats.binary_search_by(|b| b.total_cmp(&snapped)) {
            Ok(pos) => {
                self.beats.remove(pos);
                false
            }
            Err(pos) => {
                self.beats.insert(pos, snapped);
                true
            }
        };
        self.refresh_rate();
        Ok(added)
    }

    /// Declare `[start, end]` as removed. Overlapping removed windows are
    /// merged and artefact-covered parts are trimmed off.
    pub fn add_removed_window(&mut self, start: f64, end: f64) {
        let artefacts = self.artefacts().to_vec();
        insert_removed_window(&mut self.removed, &artefacts, Span::new(start, end));
        self.refresh_rate();
    }

    /// Delete the removed window containing `time`.
    pub fn delete_removed_window(&mut self, time: f64) -> Option<Span> {
        let removed = remove_span_at(&mut self.removed, time);
        if removed.is_some() {
            self.refresh_rate();
        }
        removed
    }

    /// Replace the curated beats, e.g. when restoring a session. The next
    /// detection keeps them.
    pub fn set_beats(&mut self, beats: Vec<f64>) {
        self.commit_beats(beats);
        self.beats_loaded = true;
    }

    pub fn set_removed_windows(&mut self, windows: &[Span]) {
        self.removed.clear();
        let artefacts = self.artefacts().to_vec();
        for window in windows {
            insert_removed_window(&mut self.removed, &artefacts, *window);
        }
        self.refresh_rate();
    }

    /// Apex of every curated beat at the processing rate.
    pub fn beat_peaks(&self) -> Result<Vec<BeatPeak>, PipelineError> {
        let signal = self.signal.as_ref().ok_or(PipelineError::NotReady("preprocessing"))?;
        let detection = self.detection.as_ref().ok_or(PipelineError::NotReady("detection"))?;
        let by_index: HashMap<usize, BeatPeak> =
            detection.peaks.iter().map(|p| (p.index, p.apex)).collect();
        let matcher = detection.matcher(self.params.peak_range);
        Ok(self
            .beats
            .iter()
            .filter_map(|&t| {
                let index = signal.index_of(t);
                by_index
                    .get(&index)
                    .copied()
                    .or_else(|| matcher.apex(signal, index).map(|(apex, _)| apex))
            })
            .collect())
    }

    pub fn refresh_rate(&mut self) {
        let exclusions = self.exclusions();
        self.rate = sliding_rate(&self.beats, self.params.sliding_window, &exclusions);
    }

    fn commit_beats(&mut self, mut beats: Vec<f64>) {
        beats.retain(|t| t.is_finite());
        for t in &mut beats {
            *t = round_time(*t);
        }
        beats.sort_by(f64::total_cmp);
        beats.dedup();
        self.beats = beats;
        self.refresh_rate();
    }
}

fn to_beat(
    signal: &PreprocessedSignal,
    matcher: &Matcher,
    known: &HashMap<usize, (f64, f64)>,
    time: f64,
) -> Beat {
    let index = signal.index_of(time);
    let (correlation, apex_distance) = known.get(&index).copied().unwrap_or_else(|| {
        matcher.score(signal, index).map_or(
            (0.0, matcher.peak_range as f64 + 1.0),
            |s| (s.correlation, s.apex_distance as f64),
        )
    });
    Beat::new(index as f64, correlation, apex_distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Species, detectors::peaks::AutoLower, ranges::is_disjoint_sorted};

    fn synthetic(fs: f64, seconds: f64, period: f64) -> Recording {
        let n = (fs * seconds) as usize;
        let mut data = vec![0.0; n];
        let mut centre = period / 2.0;
        while centre < seconds {
            let c = centre * fs;
            let lo = ((c - 40.0).max(0.0)) as usize;
            let hi = ((c + 40.0) as usize).min(n);
            for (i, v) in data.iter_mut().enumerate().take(hi).skip(lo) {
                let x = (i as f64 - c) / 4.0;
                *v += (-0.5 * x * x).exp();
            }
            centre += period;
        }
        for (i, v) in data.iter_mut().enumerate() {
            *v += 0.01 * (i as f64 * 0.37).sin();
        }
        Recording::new(fs, data)
    }

    fn quiet_mouse() -> ProcessingParameters {
        let mut params = ProcessingParameters::preset(Species::Mouse);
        params.de_drift_enable = false;
        params.bp_enable = false;
        params
    }

    #[test]
    fn stages_run_once_until_inputs_change() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 3.0, 0.1), quiet_mouse()).expect("new");
        assert!(pipeline.preprocess().expect("preprocess"));
        assert!(!pipeline.preprocess().expect("preprocess"));
        assert!(pipeline.detect(&AutoLower).expect("detect"));
        assert!(!pipeline.detect(&AutoLower).expect("detect"));
        pipeline.update_params(|p| p.sliding_window = 1.0).expect("edit");
        assert!(!pipeline.detect(&AutoLower).expect("detect"));
        pipeline.update_params(|p| p.peak_range = 3).expect("edit");
        assert!(pipeline.detect(&AutoLower).expect("detect"));
    }

    #[test]
    fn invalid_parameter_edit_keeps_previous_set() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 1.0, 0.1), quiet_mouse()).expect("new");
        let before = pipeline.params().clone();
        let err = pipeline.update_params(|p| p.bp_low = 500.0).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(pipeline.params(), &before);
    }

    #[test]
    fn regular_recording_survives_projection() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 4.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        let detected = pipeline.beats().to_vec();
        assert_eq!(detected.len(), 40);
        let report = pipeline.project(&AtomicBool::new(false)).expect("project");
        assert_eq!(pipeline.beats(), detected.as_slice());
        assert_eq!(report.passes, 2);
        assert_eq!(report.beats_after, 40);
        let rate = pipeline.rate().last().and_then(|p| p.rate).expect("rate");
        assert!((rate - 10.0).abs() < 1e-6);
    }

    #[test]
    fn toggling_keeps_beats_sorted() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 2.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        let before = pipeline.beats().to_vec();
        assert!(pipeline.toggle_beat(0.52012).expect("toggle"));
        assert!(pipeline.beats().contains(&0.5200));
        assert!(pipeline.beats().windows(2).all(|w| w[0] < w[1]));
        assert!(!pipeline.toggle_beat(0.5201).expect("toggle"));
        assert_eq!(pipeline.beats(), before.as_slice());
    }

    #[test]
    fn removed_windows_stay_disjoint_and_mask_rate() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 4.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        pipeline.add_removed_window(1.0, 1.5);
        pipeline.add_removed_window(1.4, 2.0);
        pipeline.add_removed_window(3.0, 3.2);
        assert_eq!(
            pipeline.removed_windows(),
            &[Span::new(1.0, 2.0), Span::new(3.0, 3.2)]
        );
        assert!(is_disjoint_sorted(pipeline.removed_windows()));
        let masked = pipeline
            .rate()
            .iter()
            .filter(|p| p.time > 1.0 && p.time < 2.0)
            .all(|p| p.rate.is_none());
        assert!(masked);
        assert_eq!(pipeline.delete_removed_window(1.2), Some(Span::new(1.0, 2.0)));
        assert_eq!(pipeline.removed_windows().len(), 1);
    }

    #[test]
    fn cancelled_run_keeps_committed_beats() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 2.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        let before = pipeline.beats().to_vec();
        let err = pipeline.project(&AtomicBool::new(true)).unwrap_err();
        assert_eq!(
            err,
            PipelineError::Cancelled {
                completed: 0,
                requested: 2
            }
        );
        assert_eq!(pipeline.beats(), before.as_slice());
    }

    #[test]
    fn flag_raised_during_a_pass_discards_that_pass() {
        use std::sync::atomic::AtomicUsize;

        let mut pipeline = Pipeline::new(synthetic(2000.0, 2.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        let before = pipeline.beats().to_vec();
        // clear before the pass starts, raised once the first range has begun
        let checks = AtomicUsize::new(0);
        let err = pipeline
            .project_until(&|| checks.fetch_add(1, Ordering::SeqCst) >= 2)
            .unwrap_err();
        assert_eq!(
            err,
            PipelineError::Cancelled {
                completed: 0,
                requested: 2
            }
        );
        assert_eq!(pipeline.beats(), before.as_slice());
    }

    #[test]
    fn window_edit_refreshes_rate() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 3.0, 0.1), quiet_mouse()).expect("new");
        pipeline.detect(&AutoLower).expect("detect");
        pipeline.update_params(|q| q.sliding_window = 0.35).expect("edit");
        let expected = sliding_rate(pipeline.beats(), 0.35, &pipeline.exclusions());
        assert_eq!(pipeline.rate(), expected.as_slice());

        let mut params = pipeline.params().clone();
        params.sliding_window = 0.8;
        pipeline.set_params(params).expect("set");
        let expected = sliding_rate(pipeline.beats(), 0.8, &pipeline.exclusions());
        assert_eq!(pipeline.rate(), expected.as_slice());
    }

    #[test]
    fn detection_from_scratch_is_repeatable() {
        let run = || {
            let mut pipeline =
                Pipeline::new(synthetic(2000.0, 2.0, 0.1), quiet_mouse()).expect("new");
            pipeline.detect(&AutoLower).expect("detect");
            let detection = pipeline.detection().cloned().expect("detection");
            (detection, pipeline.beats().to_vec())
        };
        let (first, first_beats) = run();
        let (second, second_beats) = run();
        assert_eq!(first.template, second.template);
        assert_eq!(first.peaks, second.peaks);
        assert_eq!(first, second);
        assert_eq!(first_beats, second_beats);
        assert_eq!(first_beats.len(), 20);
    }

    #[test]
    fn loaded_beats_survive_detection_once() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 2.0, 0.1), quiet_mouse()).expect("new");
        pipeline.set_beats(vec![0.25, 0.05, 0.15, 0.15]);
        assert_eq!(pipeline.beats(), &[0.05, 0.15, 0.25]);
        pipeline.detect(&AutoLower).expect("detect");
        assert_eq!(pipeline.beats(), &[0.05, 0.15, 0.25]);
        pipeline.update_params(|p| p.peak_range = 3).expect("edit");
        pipeline.detect(&AutoLower).expect("detect");
        assert_eq!(pipeline.beats().len(), 20);
    }

    #[test]
    fn projection_needs_detection() {
        let mut pipeline = Pipeline::new(synthetic(2000.0, 1.0, 0.1), quiet_mouse()).expect("new");
        let err = pipeline.project(&AtomicBool::new(false)).unwrap_err();
        assert_eq!(err, PipelineError::NotReady("preprocessing"));
    }
}
