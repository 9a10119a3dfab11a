pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        None
    } else {
        Some(data.iter().sum::<f64>() / data.len() as f64)
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn std_dev(data: &[f64]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    let m = mean(data)?;
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() as f64 - 1.0);
    Some(var.sqrt())
}

/// Percentile with linear interpolation between closest ranks (`p` in 0..=100).
pub fn percentile(data: &[f64], p: f64) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(data: &[f64]) -> Option<f64> {
    percentile(data, 50.0)
}

/// Z-score the valid samples of a window; missing samples become 0 (the
/// window mean). `None` when fewer than two samples are valid or the window
/// is flat.
pub fn zscore(window: &[Option<f64>]) -> Option<Vec<f64>> {
    let valid: Vec<f64> = window.iter().flatten().copied().collect();
    let m = mean(&valid)?;
    let sd = std_dev(&valid)?;
    if sd <= f64::EPSILON {
        return None;
    }
    Some(
        window
            .iter()
            .map(|s| s.map_or(0.0, |v| (v - m) / sd))
            .collect(),
    )
}

/// Indices of local maxima. A plateau counts once, at its first sample.
pub fn local_maxima(data: &[f64]) -> Vec<usize> {
    let n = data.len();
    let mut out = Vec::new();
    if n < 3 {
        return out;
    }
    let mut i = 1;
    while i < n - 1 {
        if data[i] > data[i - 1] {
            let mut j = i;
            while j + 1 < n && data[j + 1] == data[i] {
                j += 1;
            }
            if j + 1 < n && data[j + 1] < data[i] {
                out.push(i);
            }
            i = j + 1;
        } else {
            i += 1;
        }
    }
    out
}

/// Local maxima that are also the largest value within `radius` samples on
/// either side.
pub fn dominant_maxima(data: &[f64], radius: usize) -> Vec<usize> {
    local_maxima(data)
        .into_iter()
        .filter(|&i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius).min(data.len() - 1);
            data[lo..=hi].iter().all(|&v| v <= data[i])
        })
        .collect()
}

/// Largest value of the full cross-correlation `sum a[i] * b[i + lag]`.
pub fn max_cross_correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let na = a.len() as isize;
    let nb = b.len() as isize;
    let mut best = f64::NEG_INFINITY;
    for lag in -(na - 1)..nb {
        let lo = 0.max(-lag);
        let hi = na.min(nb - lag);
        let sum: f64 = (lo..hi)
            .map(|i| a[i as usize] * b[(i + lag) as usize])
            .sum();
        if sum > best {
            best = sum;
        }
    }
    best
}

/// Offset of the largest valid value; ties go to the offset closest to
/// `reference`, then to the earlier offset.
pub fn argmax_nearest<I>(values: I, reference: isize) -> Option<(isize, f64)>
where
    I: IntoIterator<Item = (isize, Option<f64>)>,
{
    let mut best: Option<(isize, f64)> = None;
    for (offset, value) in values {
        let Some(value) = value else { continue };
        best = match best {
            None => Some((offset, value)),
            Some((b_off, b_val)) => {
                if value > b_val
                    || (value == b_val && (offset - reference).abs() < (b_off - reference).abs())
                {
                    Some((offset, value))
                } else {
                    Some((b_off, b_val))
                }
            }
        };
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let data = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&data, 0.0), Some(1.0));
        assert_eq!(percentile(&data, 100.0), Some(5.0));
        assert_eq!(percentile(&data, 50.0), Some(3.0));
        assert!((percentile(&data, 90.0).unwrap() - 4.6).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn zscore_handles_missing_and_flat() {
        let z = zscore(&[Some(1.0), None, Some(3.0)]).expect("two valid");
        assert!((z[0] + std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
        assert_eq!(z[1], 0.0);
        assert!(zscore(&[Some(2.0), Some(2.0)]).is_none());
        assert!(zscore(&[None, Some(1.0)]).is_none());
    }

    #[test]
    fn maxima_skip_edges_and_collapse_plateaus() {
        let data = [5.0, 1.0, 3.0, 3.0, 2.0, 4.0, 4.0, 6.0, 1.0, 2.0];
        assert_eq!(local_maxima(&data), vec![2, 7]);
    }

    #[test]
    fn dominant_maxima_drop_nearby_smaller_peaks() {
        let data = [0.0, 2.0, 0.0, 5.0, 0.0, 1.0, 0.0, 0.0, 0.0, 3.0, 0.0];
        assert_eq!(dominant_maxima(&data, 2), vec![3, 9]);
        assert_eq!(dominant_maxima(&data, 0), vec![1, 3, 5, 9]);
    }

    #[test]
    fn cross_correlation_finds_shift() {
        let a = [0.0, 1.0, 2.0, 1.0, 0.0];
        let b = [0.0, 0.0, 0.0, 1.0, 2.0, 1.0, 0.0];
        assert!((max_cross_correlation(&a, &b) - 6.0).abs() < 1e-12);
    }

    #[test]
    fn argmax_ties_prefer_reference() {
        let values = vec![(-2, Some(5.0)), (-1, None), (1, Some(5.0)), (3, Some(4.0))];
        assert_eq!(argmax_nearest(values, 0), Some((1, 5.0)));
        let missing = vec![(0, None), (1, None)];
        assert_eq!(argmax_nearest(missing, 0), None);
    }
}
