//! Interval-consistency correction of an accepted beat list.
//!
//! Suspicious inter-beat intervals are grouped into spans. Each span is
//! re-walked from the nearest trusted beat before it: at every step the next
//! beat is chosen among the candidates near the expected position, scored by
//! timing regularity times template correlation. Ambiguous steps are settled
//! by scoring short continuations recursively.
//!
//! Positions are sample indices at the processing rate.

use crate::{
    config::ProcessingParameters,
    dsp::mean,
    error::ProjectionError,
    ranges::{keep_long_runs, mask_runs},
    signal::Span,
};
use log::{debug, trace};
use std::ops::Range;

/// Deepest level of lookahead scoring.
pub const MAX_DEPTH: usize = 3;
/// Candidates scoring at least this are accepted without lookahead.
const ACCEPT_SCORE: f64 = 0.6;
/// A continuation scoring above this settles an ambiguous step.
const LOOKAHEAD_SCORE: f64 = 0.7;
/// Candidate search windows, in multiples of the expected interval.
const NARROW_WINDOW: f64 = 1.4;
const WIDE_WINDOW: f64 = 1.8;
/// Spans starting at or before this beat index are left to the backward pass.
const MIN_SPAN_START: usize = 4;
/// Intervals averaged for the expected next interval.
const HISTORY: usize = 3;

/// Trusted-beat criteria; relaxed once when nothing qualifies.
#[derive(Debug, Clone, Copy)]
struct SeedCriteria {
    min_correlation: f64,
    long_factor: f64,
    stable_factor: f64,
}

const STRICT: SeedCriteria = SeedCriteria {
    min_correlation: 0.7,
    long_factor: 1.0,
    stable_factor: 1.0,
};
const RELAXED: SeedCriteria = SeedCriteria {
    min_correlation: 0.5,
    long_factor: 1.2,
    stable_factor: 0.6,
};

/// A beat as seen by the projection walk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beat {
    /// Sample index at the processing rate
    pub pos: f64,
    pub correlation: f64,
    /// Distance (samples) between the waveform apex and the template apex
    pub apex_distance: f64,
}

impl Beat {
    pub fn new(pos: f64, correlation: f64, apex_distance: f64) -> Self {
        Self {
            pos,
            correlation,
            apex_distance,
        }
    }
}

/// Projection thresholds converted to samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionSettings {
    /// Intervals shorter than this are suspicious
    pub short_interval: f64,
    /// Intervals longer than this are suspicious
    pub long_interval: f64,
    pub stable_tolerance: f64,
    pub outlier_tolerance: f64,
    /// Lookahead length for continuation scoring
    pub horizon: f64,
    pub discontinue: f64,
}

impl ProjectionSettings {
    pub fn new(params: &ProcessingParameters, fs: f64) -> Self {
        Self {
            short_interval: fs / params.suspicious_frequency_high,
            long_interval: fs / params.suspicious_frequency_low,
            stable_tolerance: params.stable_index * fs / 1000.0,
            outlier_tolerance: params.outlier * fs / 1000.0,
            horizon: 5.0 * fs / params.suspicious_frequency_low,
            discontinue: params.discontinue * fs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub beats: Vec<Beat>,
    /// Furthest position already processed; seeds must lie after it
    pub watermark: Option<f64>,
    pub resolved: usize,
    pub unresolved: usize,
}

/// Flags for each interval between consecutive beats.
pub fn suspicious_intervals(beats: &[Beat], short: f64, long: f64) -> Vec<bool> {
    beats
        .windows(2)
        .map(|w| {
            let d = w[1].pos - w[0].pos;
            d < short || d > long
        })
        .collect()
}

/// Beats trusted as walk starting points.
fn seed_mask(beats: &[Beat], settings: &ProjectionSettings, criteria: SeedCriteria) -> Vec<bool> {
    let n = beats.len();
    let flagged = suspicious_intervals(
        beats,
        settings.short_interval,
        settings.long_interval * criteria.long_factor,
    );
    let high: Vec<bool> = beats
        .iter()
        .map(|b| b.correlation >= criteria.min_correlation)
        .collect();
    let high = keep_long_runs(&high, 4);

    let tolerance = settings.stable_tolerance * criteria.stable_factor;
    let stable: Vec<bool> = (0..n)
        .map(|i| {
            if i == 0 || i + 1 >= n {
                return false;
            }
            let before = beats[i].pos - beats[i - 1].pos;
            let after = beats[i + 1].pos - beats[i].pos;
            (after - before).abs() <= tolerance
        })
        .collect();
    let stable = keep_long_runs(&stable, 3);

    (0..n)
        .map(|i| {
            let calm = !(i > 0 && flagged[i - 1]) && !(i < flagged.len() && flagged[i]);
            high[i] && calm && stable[i]
        })
        .collect()
}

/// Positions of trusted beats, relaxing the criteria once if needed.
pub fn seed_positions(
    beats: &[Beat],
    settings: &ProjectionSettings,
) -> Result<Vec<f64>, ProjectionError> {
    for criteria in [STRICT, RELAXED] {
        let seeds: Vec<f64> = seed_mask(beats, settings, criteria)
            .into_iter()
            .zip(beats)
            .filter_map(|(ok, b)| ok.then_some(b.pos))
            .collect();
        if !seeds.is_empty() {
            return Ok(seeds);
        }
        debug!("no trusted beats at correlation {}", criteria.min_correlation);
    }
    Err(ProjectionError::NoSeed)
}

/// Mean of the intervals that agree with at least one other within `tolerance`.
fn consistent_mean(intervals: &[f64], tolerance: f64) -> Option<f64> {
    let mut keep = vec![false; intervals.len()];
    for i in 0..intervals.len() {
        for j in i + 1..intervals.len() {
            if (intervals[i] - intervals[j]).abs() <= tolerance {
                keep[i] = true;
                keep[j] = true;
            }
        }
    }
    let kept: Vec<f64> = intervals
        .iter()
        .zip(keep)
        .filter_map(|(d, k)| k.then_some(*d))
        .collect();
    mean(&kept)
}

/// Expected interval after beat `k`, from up to three preceding intervals.
fn expected_interval(beats: &[Beat], k: usize, tolerance: f64) -> Option<f64> {
    let first = k.saturating_sub(HISTORY);
    let intervals: Vec<f64> = beats[first..=k]
        .windows(2)
        .map(|w| w[1].pos - w[0].pos)
        .collect();
    let expected = match intervals.len() {
        0 => return None,
        1 => intervals[0],
        _ => consistent_mean(&intervals, tolerance)
            .or_else(|| consistent_mean(&intervals, 4.0 * tolerance))
            .or_else(|| mean(&intervals))?,
    };
    (expected > 0.0).then_some(expected)
}

fn position_score(pos: f64, centre: f64, sigma: f64) -> f64 {
    let z = (pos - centre) / sigma;
    (-0.5 * z * z).exp()
}

fn candidate_score(beat: &Beat, centre: f64, sigma: f64) -> f64 {
    position_score(beat.pos, centre, sigma) * beat.correlation
}

/// Indices after `k` whose position is at most `limit`.
fn candidates_within(beats: &[Beat], k: usize, limit: f64) -> Range<usize> {
    let start = k + 1;
    let end = start + beats[start..].partition_point(|b| b.pos <= limit);
    start..end
}

/// Highest-scoring candidate. Ties go to the candidate nearer the expected
/// position, then to the smaller apex distance, then to the earlier beat.
fn best_candidate(
    beats: &[Beat],
    window: Range<usize>,
    centre: f64,
    sigma: f64,
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for j in window {
        let score = candidate_score(&beats[j], centre, sigma);
        let better = match best {
            None => true,
            Some((b, b_score)) => {
                if score != b_score {
                    score > b_score
                } else {
                    let offset = (beats[j].pos - centre).abs();
                    let b_offset = (beats[b].pos - centre).abs();
                    if offset != b_offset {
                        offset < b_offset
                    } else {
                        beats[j].apex_distance < beats[b].apex_distance
                    }
                }
            }
        };
        if better {
            best = Some((j, score));
        }
    }
    best
}

struct Walk<'a> {
    settings: &'a ProjectionSettings,
    /// Trusted beat positions of the range
    anchors: &'a [f64],
    range_end: f64,
}

impl Walk<'_> {
    /// Walk forward from beat `start` until the current beat reaches
    /// `stop_at`, deleting beats judged spurious. Returns the position the
    /// walk stopped at.
    fn run(&self, beats: &mut Vec<Beat>, start: usize, stop_at: f64, depth: usize) -> f64 {
        let s = self.settings;
        let mut k = start;
        while k + 1 < beats.len() && beats[k].pos < stop_at {
            let current = beats[k].pos;
            let Some(expected) = expected_interval(beats, k, s.outlier_tolerance) else {
                k += 1;
                continue;
            };
            let centre = current + expected;
            let sigma = expected / 5.0;
            let mut window = candidates_within(beats, k, current + NARROW_WINDOW * expected);
            if window.is_empty() {
                window = candidates_within(beats, k, current + WIDE_WINDOW * expected);
            }

            match window.len() {
                0 => {
                    let anchored = self.anchors.iter().any(|&a| a > current);
                    if !anchored && self.range_end - current < s.discontinue {
                        trace!("no candidate after {}, dropping the tail", current);
                        beats.truncate(k + 1);
                        break;
                    }
                    k += 1;
                }
                1 => k = window.start,
                _ => {
                    let chosen = match best_candidate(beats, window.clone(), centre, sigma) {
                        Some((j, score)) if score >= ACCEPT_SCORE => j,
                        local => {
                            let wide =
                                candidates_within(beats, k, current + WIDE_WINDOW * expected);
                            self.lookahead(beats, k, wide.clone(), depth)
                                .or_else(|| best_candidate(beats, wide, centre, sigma).map(|b| b.0))
                                .or(local.map(|b| b.0))
                                .unwrap_or(k + 1)
                        }
                    };
                    if chosen > k + 1 {
                        trace!("dropping {} spurious beat(s) after {}", chosen - k - 1, current);
                    }
                    beats.drain(k + 1..chosen);
                    k += 1;
                }
            }
        }
        beats.get(k).map_or(stop_at, |b| b.pos)
    }

    /// First candidate whose continuation scores above the lookahead bar.
    fn lookahead(&self, beats: &[Beat], k: usize, window: Range<usize>, depth: usize) -> Option<usize> {
        window.into_iter().find(|&j| {
            let (seq, context) = continuation(beats, k, j, self.settings.horizon);
            score_continuation(&seq, context, self.settings, depth + 1)
                .map_or(false, |score| score > LOOKAHEAD_SCORE)
        })
    }
}

/// Up to three beats before `k`, beat `k`, then candidate `j` and the beats
/// following it within `horizon`. Returns the sequence and the index of `j`
/// in it.
fn continuation(beats: &[Beat], k: usize, j: usize, horizon: f64) -> (Vec<Beat>, usize) {
    let mut seq: Vec<Beat> = beats[k.saturating_sub(HISTORY)..=k].to_vec();
    let context = seq.len();
    let limit = beats[j].pos + horizon;
    seq.extend(beats[j..].iter().take_while(|b| b.pos <= limit));
    (seq, context)
}

/// Confidence in a continuation: walk it from `first` onwards, then average
/// position score times correlation over the beats from `first` on. `None`
/// once `depth` exceeds [`MAX_DEPTH`] or nothing could be scored.
pub fn score_continuation(
    seq: &[Beat],
    first: usize,
    settings: &ProjectionSettings,
    depth: usize,
) -> Option<f64> {
    if depth > MAX_DEPTH || first == 0 || first >= seq.len() {
        return None;
    }
    let mut resolved = seq.to_vec();
    let walk = Walk {
        settings,
        anchors: &[],
        range_end: f64::INFINITY,
    };
    walk.run(&mut resolved, first, f64::INFINITY, depth);
    sequence_score(&resolved, first, settings.outlier_tolerance)
}

fn sequence_score(seq: &[Beat], first: usize, tolerance: f64) -> Option<f64> {
    let scores: Vec<f64> = (first.max(1)..seq.len())
        .filter_map(|i| {
            let expected = expected_interval(seq, i - 1, tolerance)?;
            Some(candidate_score(&seq[i], seq[i - 1].pos + expected, expected / 5.0))
        })
        .collect();
    mean(&scores)
}

/// Re-walk every suspicious span of one range. `range_end` is the last
/// position the range can hold a beat at.
pub fn project(
    beats: &[Beat],
    settings: &ProjectionSettings,
    watermark: Option<f64>,
    range_end: f64,
) -> Result<Projection, ProjectionError> {
    let mut out = beats.to_vec();
    let spans = mask_runs(&suspicious_intervals(
        beats,
        settings.short_interval,
        settings.long_interval,
    ));
    if spans.is_empty() {
        return Ok(Projection {
            beats: out,
            watermark,
            resolved: 0,
            unresolved: 0,
        });
    }
    let anchors = seed_positions(beats, settings)?;
    let walk = Walk {
        settings,
        anchors: &anchors,
        range_end,
    };

    let mut watermark = watermark;
    let mut resolved = 0;
    let mut unresolved = 0;
    for (first, last) in spans {
        if first <= MIN_SPAN_START {
            continue;
        }
        let start = beats[first].pos;
        let end = beats[last + 1].pos;
        if watermark.map_or(false, |w| end <= w) {
            continue;
        }
        let seed = anchors.iter().rev().copied().find_map(|a| {
            if a >= start || watermark.map_or(false, |w| a <= w) {
                return None;
            }
            out.binary_search_by(|b| b.pos.total_cmp(&a)).ok()
        });
        let Some(seed) = seed else {
            debug!("no trusted beat before span at {}, leaving it unresolved", start);
            watermark = Some(start);
            unresolved += 1;
            continue;
        };
        let reached = walk.run(&mut out, seed, end, 0);
        watermark = Some(reached);
        resolved += 1;
    }
    Ok(Projection {
        beats: out,
        watermark,
        resolved,
        unresolved,
    })
}

/// Mirror positions around `axis / 2`, reversing the order.
pub fn reflect(beats: &[Beat], axis: f64) -> Vec<Beat> {
    beats
        .iter()
        .rev()
        .map(|b| Beat {
            pos: axis - b.pos,
            ..*b
        })
        .collect()
}

/// Forward projection over a range, optionally followed by the same
/// algorithm over the time-reflected result.
pub fn correct_range(
    beats: &[Beat],
    settings: &ProjectionSettings,
    backward: bool,
) -> Result<Projection, ProjectionError> {
    let (Some(first), Some(last)) = (beats.first(), beats.last()) else {
        return Ok(Projection {
            beats: Vec::new(),
            watermark: None,
            resolved: 0,
            unresolved: 0,
        });
    };
    let (start, end) = (first.pos, last.pos);
    let forward = project(beats, settings, None, end)?;
    if !backward {
        return Ok(forward);
    }
    let axis = start + end;
    match project(&reflect(&forward.beats, axis), settings, None, axis - start) {
        Ok(back) => Ok(Projection {
            beats: reflect(&back.beats, axis),
            watermark: forward.watermark,
            resolved: forward.resolved + back.resolved,
            unresolved: forward.unresolved + back.unresolved,
        }),
        Err(err) => {
            debug!("backward pass skipped: {}", err);
            Ok(forward)
        }
    }
}

/// Beat times split into independently processed ranges.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeSplit {
    pub ranges: Vec<Vec<f64>>,
    /// Beats inside exclusion spans, passed through untouched
    pub excluded: Vec<f64>,
}

/// Split sorted beat times at gaps longer than `discontinue` seconds.
/// Beats inside exclusion spans are set aside, so an exclusion longer than
/// `discontinue` always splits while a shorter one is walked across.
pub fn split_ranges(beats: &[f64], exclusions: &[Span], discontinue: f64) -> RangeSplit {
    let mut split = RangeSplit::default();
    let mut current: Vec<f64> = Vec::new();
    for &t in beats {
        if exclusions.iter().any(|s| s.contains(t)) {
            split.excluded.push(t);
            continue;
        }
        if let Some(&prev) = current.last() {
            if t - prev > discontinue {
                split.ranges.push(std::mem::take(&mut current));
            }
        }
        current.push(t);
    }
    if !current.is_empty() {
        split.ranges.push(current);
    }
    split
}
