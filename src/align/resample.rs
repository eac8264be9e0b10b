//! Sample-rate conversion for analysis and extraction.

/// Reduce `samples` from `from` Hz to `to` Hz.
///
/// Integer ratios average each block of `from / to` samples (a box filter,
/// enough to keep correlation peaks honest). Other ratios smooth with the
/// nearest integer box and then interpolate linearly.
pub fn decimate(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if to == 0 || from <= to {
        return samples.to_vec();
    }

    if from % to == 0 {
        let factor = (from / to) as usize;
        return samples
            .chunks(factor)
            .map(|block| block.iter().sum::<f32>() / block.len() as f32)
            .collect();
    }

    let factor = (from / to).max(1) as usize;
    let smoothed = box_smooth(samples, factor);
    linear_resample(&smoothed, from, to)
}

fn box_smooth(samples: &[f32], width: usize) -> Vec<f32> {
    if width <= 1 {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len());
    let mut acc = 0.0f64;
    for (i, &s) in samples.iter().enumerate() {
        acc += s as f64;
        if i >= width {
            acc -= samples[i - width] as f64;
        }
        let n = (i + 1).min(width);
        out.push((acc / n as f64) as f32);
    }
    out
}

/// Linear interpolation between rates (no anti-aliasing)
pub fn linear_resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    let step = from as f64 / to as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
