use log::warn;
use realfft::RealFftPlanner;

/// Kernels longer than this are applied through the FFT.
const DIRECT_KERNEL_LIMIT: usize = 64;

/// Gaussian weights for a moving window of `window` samples; the standard
/// deviation is a fifth of the window. The kernel always has odd length.
pub fn gaussian_kernel(window: usize) -> Vec<f64> {
    let half = window / 2;
    let sigma = (window.max(1) as f64 / 5.0).max(f64::EPSILON);
    (0..=2 * half)
        .map(|i| {
            let x = i as f64 - half as f64;
            (-0.5 * (x / sigma).powi(2)).exp()
        })
        .collect()
}

/// Gaussian-weighted moving average of `window` samples. Near the edges the
/// truncated kernel is renormalised so the output is not pulled towards zero.
pub fn smooth_gaussian(data: &[f64], window: usize) -> Vec<f64> {
    if data.is_empty() || window <= 1 {
        return data.to_vec();
    }
    let kernel = gaussian_kernel(window);
    let weighted = if kernel.len() > DIRECT_KERNEL_LIMIT {
        fft_convolve_same(data, &kernel).unwrap_or_else(|| direct_convolve_same(data, &kernel))
    } else {
        direct_convolve_same(data, &kernel)
    };
    let norms = edge_norms(&kernel, data.len());
    weighted
        .into_iter()
        .zip(norms)
        .map(|(v, norm)| v / norm)
        .collect()
}

/// Sum of the kernel weights that fall inside the signal at each position.
fn edge_norms(kernel: &[f64], n: usize) -> Vec<f64> {
    let half = kernel.len() / 2;
    let mut prefix = Vec::with_capacity(kernel.len() + 1);
    prefix.push(0.0);
    for &w in kernel {
        prefix.push(prefix[prefix.len() - 1] + w);
    }
    (0..n)
        .map(|i| {
            // kernel tap k covers sample i + k - half
            let lo = half.saturating_sub(i);
            let hi = (n - 1 + half - i).min(kernel.len() - 1);
            prefix[hi + 1] - prefix[lo]
        })
        .collect()
}

fn direct_convolve_same(data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = data.len();
    let half = kernel.len() / 2;
    (0..n)
        .map(|i| {
            let lo = half.saturating_sub(i);
            let hi = (n - 1 + half - i).min(kernel.len() - 1);
            (lo..=hi)
                .map(|k| data[i + k - half] * kernel[k])
                .sum::<f64>()
        })
        .collect()
}

fn fft_convolve_same(data: &[f64], kernel: &[f64]) -> Option<Vec<f64>> {
    let n = data.len();
    let size = (n + kernel.len() - 1).next_power_of_two();
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(size);
    let c2r = planner.plan_fft_inverse(size);

    let mut a = data.to_vec();
    a.resize(size, 0.0);
    let mut b = kernel.to_vec();
    b.resize(size, 0.0);
    let mut fa = r2c.make_output_vec();
    let mut fb = r2c.make_output_vec();
    let forward = r2c
        .process(&mut a, &mut fa)
        .and_then(|_| r2c.process(&mut b, &mut fb));
    if let Err(err) = forward {
        warn!("forward FFT failed ({}), falling back to direct convolution", err);
        return None;
    }
    for (x, y) in fa.iter_mut().zip(fb.iter()) {
        *x *= *y;
    }
    if let Some(first) = fa.first_mut() {
        first.im = 0.0;
    }
    if let Some(last) = fa.last_mut() {
        last.im = 0.0;
    }
    let mut out = c2r.make_output_vec();
    if let Err(err) = c2r.process(&mut fa, &mut out) {
        warn!("inverse FFT failed ({}), falling back to direct convolution", err);
        return None;
    }
    let half = kernel.len() / 2;
    let scale = 1.0 / size as f64;
    Some(out[half..half + n].iter().map(|v| v * scale).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_symmetric_and_peaked() {
        let k = gaussian_kernel(10);
        assert_eq!(k.len(), 11);
        assert_eq!(k[5], 1.0);
        for i in 0..5 {
            assert!((k[i] - k[10 - i]).abs() < 1e-12);
            assert!(k[i] < k[i + 1]);
        }
    }

    #[test]
    fn constant_signal_is_preserved_up_to_edges() {
        let data = vec![3.0; 500];
        for window in [8, 200] {
            let out = smooth_gaussian(&data, window);
            assert!(out.iter().all(|v| (v - 3.0).abs() < 1e-9), "window {window}");
        }
    }

    #[test]
    fn fft_path_matches_direct_path() {
        let data: Vec<f64> = (0..400).map(|i| ((i * 37) % 11) as f64 - 5.0).collect();
        let kernel = gaussian_kernel(150);
        let direct = direct_convolve_same(&data, &kernel);
        let fast = fft_convolve_same(&data, &kernel).expect("fft");
        for (a, b) in direct.iter().zip(fast.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
