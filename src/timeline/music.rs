//! Intro and outro music beds around the rendered mix.
//!
//! The intro plays under the opening speech and fades out at its tail; the
//! outro starts after the last rendered tick and fades in. Neither moves
//! any region already placed on the output clock.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BedPosition {
    Intro,
    Outro,
}

impl BedPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BedPosition::Intro => "intro",
            BedPosition::Outro => "outro",
        }
    }
}

/// Where a bed landed on the output clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicBed {
    pub position: BedPosition,
    pub file: String,
    pub start_ticks: u64,
    pub duration_ticks: u64,
}

/// Sum `bed` under the head of `mix`, fading out over its last `fade` ticks.
///
/// A bed longer than the mix is cut where the mix ends. Returns the number
/// of ticks laid.
pub fn lay_intro(mix: &mut [f32], bed: &[f32], gain: f32, fade: usize) -> u64 {
    let len = bed.len().min(mix.len());
    let fade = fade.min(len);
    for (i, (slot, &s)) in mix.iter_mut().zip(bed).take(len).enumerate() {
        let remaining = len - i;
        let ramp = if remaining <= fade {
            remaining as f32 / fade as f32
        } else {
            1.0
        };
        *slot += s * gain * ramp;
    }
    len as u64
}

/// Append `bed` after the mix, fading in over its first `fade` ticks.
/// Returns the tick the bed starts at.
pub fn append_outro(mix: &mut Vec<f32>, bed: &[f32], gain: f32, fade: usize) -> u64 {
    let start = mix.len();
    let fade = fade.min(bed.len());
    mix.extend(bed.iter().enumerate().map(|(i, &s)| {
        let ramp = if i < fade { i as f32 / fade as f32 } else { 1.0 };
        s * gain * ramp
    }));
    start as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intro_sits_under_speech_and_fades() {
        let mut mix = vec![0.5f32; 100];
        let laid = lay_intro(&mut mix, &[1.0; 40], 0.25, 10);

        assert_eq!(laid, 40);
        assert_eq!(mix[0], 0.75);
        assert_eq!(mix[29], 0.75);
        // Last bed tick is one step above silence
        assert!((mix[39] - (0.5 + 0.025)).abs() < 1e-6);
        assert_eq!(mix[40], 0.5);
        assert_eq!(mix.len(), 100);
    }

    #[test]
    fn test_intro_longer_than_mix_is_cut() {
        let mut mix = vec![0.0f32; 20];
        let laid = lay_intro(&mut mix, &[1.0; 50], 1.0, 0);

        assert_eq!(laid, 20);
        assert!(mix.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_outro_appends_after_last_tick() {
        let mut mix = vec![0.5f32; 30];
        let start = append_outro(&mut mix, &[1.0; 20], 0.5, 4);

        assert_eq!(start, 30);
        assert_eq!(mix.len(), 50);
        assert!(mix[..30].iter().all(|&s| s == 0.5));
        assert_eq!(mix[30], 0.0);
        assert_eq!(mix[32], 0.25);
        assert_eq!(mix[34], 0.5);
        assert_eq!(mix[49], 0.5);
    }
}
