//! Speech-band filtering for the correlation retry.
//!
//! Cascaded Butterworth sections (high-pass then low-pass) keep roughly the
//! telephone band, where voices from different microphones agree best and
//! rumble, hum and hiss do not.

use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Type, Q_BUTTERWORTH_F32};

pub const SPEECH_LOW_HZ: f32 = 300.0;
pub const SPEECH_HIGH_HZ: f32 = 3_000.0;

/// Second-order sections per edge
const SECTIONS: usize = 2;

/// Band-limit `samples` to `[low_hz, high_hz]`.
///
/// The upper edge is pulled below Nyquist. Returns None when the band does
/// not fit the sample rate at all.
pub fn bandpass(samples: &[f32], sample_rate: u32, low_hz: f32, high_hz: f32) -> Option<Vec<f32>> {
    let fs = sample_rate as f32;
    let high = high_hz.min(fs * 0.45);
    if low_hz <= 0.0 || low_hz >= high {
        return None;
    }

    let mut out = samples.to_vec();
    cascade(&mut out, Type::HighPass, fs, low_hz)?;
    cascade(&mut out, Type::LowPass, fs, high)?;
    Some(out)
}

fn cascade(samples: &mut [f32], kind: Type<f32>, fs: f32, cutoff: f32) -> Option<()> {
    let coeffs = Coefficients::<f32>::from_params(kind, fs.hz(), cutoff.hz(), Q_BUTTERWORTH_F32).ok()?;
    for _ in 0..SECTIONS {
        let mut section = DirectForm2Transposed::<f32>::new(coeffs);
        for s in samples.iter_mut() {
            *s = section.run(*s);
        }
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn tone(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len).map(|i| (2.0 * PI * freq * i as f32 / rate as f32).sin()).collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn test_rumble_is_removed_and_voice_band_kept() {
        let rate = 16_000;
        let rumble = bandpass(&tone(50.0, rate, rate as usize), rate, SPEECH_LOW_HZ, SPEECH_HIGH_HZ).unwrap();
        let voice = bandpass(&tone(1_000.0, rate, rate as usize), rate, SPEECH_LOW_HZ, SPEECH_HIGH_HZ).unwrap();

        // Skip the settling transient
        assert!(rms(&rumble[4_000..]) < 0.01, "rumble rms {}", rms(&rumble[4_000..]));
        assert!(rms(&voice[4_000..]) > 0.6, "voice rms {}", rms(&voice[4_000..]));
    }

    #[test]
    fn test_band_above_nyquist_is_rejected() {
        assert!(bandpass(&[0.0; 16], 400, SPEECH_LOW_HZ, SPEECH_HIGH_HZ).is_none());
        assert!(bandpass(&[0.0; 16], 8_000, SPEECH_LOW_HZ, SPEECH_HIGH_HZ).is_some());
    }
}
