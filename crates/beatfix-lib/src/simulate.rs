//! Synthetic ECG-like recordings with known beat times.

use crate::signal::{Recording, Span};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub fs: f64,
    /// Seconds
    pub duration: f64,
    /// Mean beat rate (Hz)
    pub rate: f64,
    /// Uniform jitter on each interval, as a fraction of the mean interval
    pub jitter: f64,
    /// Gaussian pulse width (s)
    pub qrs_sigma: f64,
    pub amplitude: f64,
    pub noise_std: f64,
    pub wander_amplitude: f64,
    pub wander_hz: f64,
    /// Extra half-height pulses placed between true beats
    pub spurious_beats: usize,
    /// Square artefact added on top of the trace
    pub artefact: Option<Span>,
    pub artefact_level: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fs: 2000.0,
            duration: 10.0,
            rate: 10.0,
            jitter: 0.02,
            qrs_sigma: 0.002,
            amplitude: 1.0,
            noise_std: 0.01,
            wander_amplitude: 0.0,
            wander_hz: 0.3,
            spurious_beats: 0,
            artefact: None,
            artefact_level: 100.0,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticEcg {
    pub recording: Recording,
    /// True beat times (s)
    pub beats: Vec<f64>,
    pub spurious: Vec<f64>,
}

pub fn synthetic_ecg(config: &SimulationConfig) -> SyntheticEcg {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let n = (config.fs * config.duration).round().max(0.0) as usize;
    let period = 1.0 / config.rate;

    let mut beats = Vec::new();
    let mut t = period / 2.0;
    while t < config.duration {
        beats.push(t);
        let jitter = if config.jitter > 0.0 {
            rng.gen_range(-config.jitter..=config.jitter)
        } else {
            0.0
        };
        t += period * (1.0 + jitter);
    }

    let mut spurious = Vec::new();
    if beats.len() > 1 {
        for _ in 0..config.spurious_beats {
            let k = rng.gen_range(0..beats.len() - 1);
            let mid = 0.5 * (beats[k] + beats[k + 1]);
            if !spurious.contains(&mid) {
                spurious.push(mid);
            }
        }
        spurious.sort_by(f64::total_cmp);
    }

    let mut data: Vec<f64> = (0..n)
        .map(|i| {
            let t = i as f64 / config.fs;
            config.wander_amplitude * (2.0 * PI * config.wander_hz * t).sin()
                + config.noise_std * gaussian(&mut rng)
        })
        .collect();
    for &b in &beats {
        add_pulse(&mut data, config.fs, b, config.qrs_sigma, config.amplitude);
    }
    for &s in &spurious {
        add_pulse(&mut data, config.fs, s, config.qrs_sigma, 0.5 * config.amplitude);
    }
    if let Some(span) = config.artefact {
        for (i, v) in data.iter_mut().enumerate() {
            if span.contains(i as f64 / config.fs) {
                *v += config.artefact_level;
            }
        }
    }

    SyntheticEcg {
        recording: Recording::new(config.fs, data).with_channel("synthetic"),
        beats,
        spurious,
    }
}

fn add_pulse(data: &mut [f64], fs: f64, centre: f64, sigma: f64, amplitude: f64) {
    let c = centre * fs;
    let half = (5.0 * sigma * fs).ceil();
    let lo = (c - half).max(0.0) as usize;
    let hi = ((c + half).max(0.0) as usize).min(data.len());
    for (i, v) in data.iter_mut().enumerate().take(hi).skip(lo) {
        let x = (i as f64 - c) / (sigma * fs);
        *v += amplitude * (-0.5 * x * x).exp();
    }
}

/// Box-Muller standard normal draw.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
