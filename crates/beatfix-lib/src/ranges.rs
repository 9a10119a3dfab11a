//! Run grouping over index sets and bookkeeping for exclusion span lists.

use crate::signal::Span;

/// Maximal run of consecutive values, as positions within the input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Position of the first element of the run
    pub start: usize,
    /// Position of the last element of the run (inclusive)
    pub end: usize,
    pub len: usize,
}

/// Group sorted, unique indices into maximal runs whose consecutive
/// difference is exactly one.
///
/// Empty input yields a single degenerate run of length zero.
pub fn find_runs(indices: &[usize]) -> Vec<Run> {
    if indices.is_empty() {
        return vec![Run {
            start: 0,
            end: 0,
            len: 0,
        }];
    }
    let mut runs = Vec::new();
    let mut start = 0;
    for pos in 1..indices.len() {
        if indices[pos] != indices[pos - 1] + 1 {
            runs.push(Run {
                start,
                end: pos - 1,
                len: pos - start,
            });
            start = pos;
        }
    }
    runs.push(Run {
        start,
        end: indices.len() - 1,
        len: indices.len() - start,
    });
    runs
}

/// Runs of `true` in `mask` as inclusive `(first, last)` index pairs.
pub fn mask_runs(mask: &[bool]) -> Vec<(usize, usize)> {
    let indices: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &set)| set.then_some(i))
        .collect();
    find_runs(&indices)
        .into_iter()
        .filter(|run| run.len > 0)
        .map(|run| (indices[run.start], indices[run.end]))
        .collect()
}

/// Clear every `true` that is not part of a run at least `min_len` long.
pub fn keep_long_runs(mask: &[bool], min_len: usize) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for (first, last) in mask_runs(mask) {
        if last - first + 1 >= min_len {
            out[first..=last].iter_mut().for_each(|v| *v = true);
        }
    }
    out
}

/// Merge index runs separated by fewer than `max_gap` samples.
pub fn merge_close(runs: &[(usize, usize)], max_gap: usize) -> Vec<(usize, usize)> {
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(runs.len());
    for &(first, last) in runs {
        match merged.last_mut() {
            Some(prev) if first.saturating_sub(prev.1) < max_gap => prev.1 = prev.1.max(last),
            _ => merged.push((first, last)),
        }
    }
    merged
}

/// Widen runs by `pad` on both sides, clamp to `[0, len)` and merge overlaps.
pub fn pad_and_clamp(runs: &[(usize, usize)], pad: usize, len: usize) -> Vec<(usize, usize)> {
    if len == 0 {
        return Vec::new();
    }
    let padded: Vec<(usize, usize)> = runs
        .iter()
        .map(|&(first, last)| (first.saturating_sub(pad), (last + pad).min(len - 1)))
        .collect();
    merge_close(&padded, 1)
}

/// Union of possibly overlapping spans, sorted by start.
pub fn merge_spans(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));
    let mut merged: Vec<Span> = Vec::with_capacity(sorted.len());
    for span in sorted {
        match merged.last_mut() {
            Some(prev) if span.start <= prev.end => prev.end = prev.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Parts of `window` not covered by any of `cuts`. Zero-length leftovers are dropped.
pub fn subtract_spans(window: Span, cuts: &[Span]) -> Vec<Span> {
    let mut pieces = vec![window];
    for cut in merge_spans(cuts) {
        let mut next = Vec::with_capacity(pieces.len() + 1);
        for piece in pieces {
            if !piece.overlaps(&cut) {
                next.push(piece);
                continue;
            }
            if cut.start > piece.start {
                next.push(Span::new(piece.start, cut.start));
            }
            if cut.end < piece.end {
                next.push(Span::new(cut.end, piece.end));
            }
        }
        pieces = next;
    }
    pieces.retain(|p| p.duration() > 0.0);
    pieces
}

/// Insert a user-declared window: it is merged with overlapping removed
/// windows and whatever an artefact span already covers is cut out of it.
pub fn insert_removed_window(removed: &mut Vec<Span>, artefacts: &[Span], window: Span) {
    let mut all = removed.clone();
    all.push(window);
    let merged = merge_spans(&all);
    let mut out = Vec::with_capacity(merged.len());
    for span in merged {
        out.extend(subtract_spans(span, artefacts));
    }
    *removed = out;
}

/// Remove and return the span containing `time`, if any.
pub fn remove_span_at(spans: &mut Vec<Span>, time: f64) -> Option<Span> {
    let pos = spans.iter().position(|s| s.contains(time))?;
    Some(spans.remove(pos))
}

/// Sorted by start with no two spans overlapping.
pub fn is_disjoint_sorted(spans: &[Span]) -> bool {
    spans
        .windows(2)
        .all(|w| w[0].start <= w[1].start && !w[0].overlaps(&w[1]))
}
