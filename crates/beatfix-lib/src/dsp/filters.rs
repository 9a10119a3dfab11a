//! Zero-phase IIR filtering built from cascaded biquad sections.
//!
//! Coefficients follow the audio-EQ cookbook bilinear designs; running every
//! cascade forwards and then backwards cancels the phase response and squares
//! the magnitude response.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Second-order section in Direct Form II Transposed.
#[derive(Debug, Clone)]
pub struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
    state: [f64; 2],
}

impl Biquad {
    fn normalised(b: [f64; 3], a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b: [b[0] / a0, b[1] / a0, b[2] / a0],
            a: [a1 / a0, a2 / a0],
            state: [0.0; 2],
        }
    }

    pub fn lowpass(cutoff_hz: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalised(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    pub fn highpass(cutoff_hz: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalised(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    /// Band-stop centred on `centre_hz` with the given -3 dB bandwidth.
    pub fn notch(centre_hz: f64, bandwidth_hz: f64, fs: f64) -> Self {
        let w0 = 2.0 * PI * centre_hz / fs;
        let (sin, cos) = w0.sin_cos();
        let q = centre_hz / bandwidth_hz;
        let alpha = sin / (2.0 * q);
        Self::normalised([1.0, -2.0 * cos, 1.0], 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let output = self.b[0] * input + self.state[0];
        self.state[0] = self.b[1] * input - self.a[0] * output + self.state[1];
        self.state[1] = self.b[2] * input - self.a[1] * output;
        output
    }

    pub fn reset(&mut self) {
        self.state = [0.0; 2];
    }
}

/// Cascade of biquads applied forward and backward.
#[derive(Debug, Clone)]
pub struct ZeroPhase {
    sections: Vec<Biquad>,
    /// Samples of odd-symmetric extension added at each edge
    pad: usize,
}

impl ZeroPhase {
    pub fn new(sections: Vec<Biquad>, pad: usize) -> Self {
        Self { sections, pad }
    }

    /// 4th-order Butterworth low-pass.
    pub fn butterworth_lowpass(cutoff_hz: f64, fs: f64) -> Self {
        Self::new(
            vec![
                Biquad::lowpass(cutoff_hz, fs, 0.541_196_100_146_197),
                Biquad::lowpass(cutoff_hz, fs, 1.306_562_964_876_376_7),
            ],
            edge_pad(cutoff_hz, fs),
        )
    }

    /// 2nd-order Butterworth band-pass made of a high-pass and a low-pass edge.
    pub fn butterworth_bandpass(low_hz: f64, high_hz: f64, fs: f64) -> Self {
        Self::new(
            vec![
                Biquad::highpass(low_hz, fs, FRAC_1_SQRT_2),
                Biquad::lowpass(high_hz, fs, FRAC_1_SQRT_2),
            ],
            edge_pad(low_hz, fs),
        )
    }

    pub fn notch(centre_hz: f64, bandwidth_hz: f64, fs: f64) -> Self {
        Self::new(
            vec![Biquad::notch(centre_hz, bandwidth_hz, fs)],
            edge_pad(bandwidth_hz, fs),
        )
    }

    pub fn apply(&mut self, data: &[f64]) -> Vec<f64> {
        if data.len() < 2 {
            return data.to_vec();
        }
        let pad = self.pad.min(data.len() - 1);
        let mut work = odd_extend(data, pad);
        self.run(&mut work);
        work.reverse();
        self.run(&mut work);
        work.reverse();
        work[pad..pad + data.len()].to_vec()
    }

    fn run(&mut self, work: &mut [f64]) {
        for section in &mut self.sections {
            section.reset();
            for x in work.iter_mut() {
                *x = section.process(*x);
            }
        }
    }
}

/// Edge extension long enough for the slowest pole to settle.
fn edge_pad(lowest_hz: f64, fs: f64) -> usize {
    ((3.0 * fs / lowest_hz).ceil() as usize).max(9)
}

/// Point-symmetric extension around both end samples.
fn odd_extend(data: &[f64], pad: usize) -> Vec<f64> {
    let n = data.len();
    let first = data[0];
    let last = data[n - 1];
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - data[i]));
    out.extend_from_slice(data);
    out.extend((1..=pad).map(|i| 2.0 * last - data[n - 1 - i]));
    out
}

/// Anti-aliased integer decimation: zero-phase low-pass at 80% of the new
/// Nyquist frequency, then every `factor`-th sample starting at the first.
pub fn decimate(data: &[f64], fs: f64, factor: usize) -> Vec<f64> {
    if factor <= 1 {
        return data.to_vec();
    }
    let cutoff = 0.8 * (fs / factor as f64) / 2.0;
    let filtered = ZeroPhase::butterworth_lowpass(cutoff, fs).apply(data);
    filtered.into_iter().step_by(factor).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn rms(data: &[f64]) -> f64 {
        (data.iter().map(|x| x * x).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn bandpass_keeps_passband_and_rejects_drift() {
        let fs = 500.0;
        let pass = sine(10.0, fs, 5000);
        let slow = sine(0.05, fs, 5000);
        let mut filter = ZeroPhase::butterworth_bandpass(0.5, 40.0, fs);
        let out_pass = filter.apply(&pass);
        let out_slow = filter.apply(&slow);
        let mid = 1000..4000;
        assert!((rms(&out_pass[mid.clone()]) / rms(&pass[mid.clone()]) - 1.0).abs() < 0.05);
        assert!(rms(&out_slow[mid.clone()]) < 0.05 * rms(&slow[mid]));
    }

    #[test]
    fn zero_phase_keeps_peak_position() {
        let fs = 1000.0;
        let mut pulse = vec![0.0; 1001];
        for (i, v) in pulse.iter_mut().enumerate() {
            let t = (i as f64 - 500.0) / 5.0;
            *v = (-0.5 * t * t).exp();
        }
        let out = ZeroPhase::butterworth_lowpass(100.0, fs).apply(&pulse);
        let argmax = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(argmax, Some(500));
    }

    #[test]
    fn notch_removes_mains() {
        let fs = 1000.0;
        let hum = sine(50.0, fs, 4000);
        let out = ZeroPhase::notch(50.0, 10.0, fs).apply(&hum);
        assert!(rms(&out[1000..3000]) < 0.05);
    }

    #[test]
    fn decimate_length_and_alias_rejection() {
        let fs = 2000.0;
        let high = sine(700.0, fs, 8000);
        let out = decimate(&high, fs, 4);
        assert_eq!(out.len(), 2000);
        assert!(rms(&out[200..1800]) < 0.02);
    }
}
