//! FFT cross-correlation.
//!
//! Uses the convolution theorem: corr(a, b) = IFFT(FFT(a) * conj(FFT(b))),
//! zero-padded so the circular result holds every linear lag.

use rustfft::{num_complex::Complex, FftPlanner};

/// Peak of a cross-correlation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    /// `reference[n + lag]` lines up with `target[n]`
    pub lag: i64,
    /// Correlation value at the peak
    pub peak: f64,
    /// |peak| normalised by the geometric mean of both energies, in [0, 1]
    pub confidence: f64,
}

fn energy(samples: &[f32]) -> f64 {
    samples.iter().map(|&x| x as f64 * x as f64).sum()
}

/// Correlate `target` against `reference` over every lag where they overlap.
///
/// Returns None when either input is empty or silent.
pub fn cross_correlate(reference: &[f32], target: &[f32]) -> Option<Correlation> {
    if reference.is_empty() || target.is_empty() {
        return None;
    }

    let norm = (energy(reference) * energy(target)).sqrt();
    if norm <= 1e-12 {
        return None;
    }

    let correlation_len = reference.len() + target.len() - 1;
    let fft_len = correlation_len.next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_len);
    let ifft = planner.plan_fft_inverse(fft_len);

    let mut ref_complex: Vec<Complex<f64>> = reference
        .iter()
        .map(|&x| Complex::new(x as f64, 0.0))
        .collect();
    ref_complex.resize(fft_len, Complex::new(0.0, 0.0));

    let mut tgt_complex: Vec<Complex<f64>> = target
        .iter()
        .map(|&x| Complex::new(x as f64, 0.0))
        .collect();
    tgt_complex.resize(fft_len, Complex::new(0.0, 0.0));

    fft.process(&mut ref_complex);
    fft.process(&mut tgt_complex);

    let mut product: Vec<Complex<f64>> = ref_complex
        .iter()
        .zip(tgt_complex.iter())
        .map(|(a, b)| a * b.conj())
        .collect();

    ifft.process(&mut product);

    let scale = 1.0 / fft_len as f64;
    let max_positive = reference.len() as i64 - 1;
    let max_negative = target.len() as i64 - 1;

    // Index k >= 0 holds lag k, index fft_len - k holds lag -k
    let mut best = Correlation {
        lag: 0,
        peak: 0.0,
        confidence: 0.0,
    };
    for lag in -max_negative..=max_positive {
        let idx = if lag >= 0 {
            lag as usize
        } else {
            fft_len - lag.unsigned_abs() as usize
        };
        let value = product[idx].re * scale;
        if value.abs() > best.peak.abs() {
            best.lag = lag;
            best.peak = value;
        }
    }

    best.confidence = (best.peak.abs() / norm).clamp(0.0, 1.0);
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_train(len: usize, at: &[usize]) -> Vec<f32> {
        let mut v = vec![0.0; len];
        for &i in at {
            v[i] = 1.0;
            if i + 1 < len {
                v[i + 1] = -0.5;
            }
        }
        v
    }

    #[test]
    fn test_identical_signals_peak_at_zero() {
        let a = pulse_train(256, &[10, 40, 90]);
        let c = cross_correlate(&a, &a).unwrap();
        assert_eq!(c.lag, 0);
        assert!((c.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_positive_lag_when_target_starts_later() {
        // Event at 50 in the reference, at 20 in the target
        let reference = pulse_train(256, &[50, 120]);
        let target = pulse_train(256, &[20, 90]);
        let c = cross_correlate(&reference, &target).unwrap();
        assert_eq!(c.lag, 30);
    }

    #[test]
    fn test_negative_lag() {
        let reference = pulse_train(256, &[20, 90]);
        let target = pulse_train(256, &[50, 120]);
        let c = cross_correlate(&reference, &target).unwrap();
        assert_eq!(c.lag, -30);
    }

    #[test]
    fn test_silence_is_rejected() {
        assert!(cross_correlate(&[0.0; 64], &[0.0; 64]).is_none());
        assert!(cross_correlate(&[], &[1.0]).is_none());
    }
}
