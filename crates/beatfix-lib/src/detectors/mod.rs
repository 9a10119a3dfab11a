pub mod peaks;
pub mod preprocess;
pub mod projection;

/// Length in samples of the envelope smoothing window: four times
/// `smooth_detection_ms`, at least one sample.
pub fn smoothing_window(smooth_detection_ms: f64, fs: f64) -> usize {
    ((4.0 * smooth_detection_ms * fs / 1000.0).round() as usize).max(1)
}

/// Detection envelope: `|x|^power`, Gaussian-smoothed, squared.
pub fn envelope(data: &[f64], power: f64, window: usize) -> Vec<f64> {
    let powered: Vec<f64> = data.iter().map(|x| x.abs().powf(power)).collect();
    crate::dsp::smooth_gaussian(&powered, window)
        .into_iter()
        .map(|v| v * v)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_non_negative_and_peaks_at_pulse() {
        let mut data = vec![0.0; 101];
        data[50] = -2.0;
        let env = envelope(&data, 2.0, 5);
        assert!(env.iter().all(|v| *v >= 0.0));
        let argmax = env
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(argmax, Some(50));
    }

    #[test]
    fn window_scales_with_rate() {
        assert_eq!(smoothing_window(1.0, 2000.0), 8);
        assert_eq!(smoothing_window(0.01, 100.0), 1);
    }
}
