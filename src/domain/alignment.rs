//! Alignment map: per-track offsets onto the reference clock.

use serde::{Deserialize, Serialize};

use super::span::ticks_to_seconds;

/// How an offset was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentMethod {
    /// The reference track itself (offset 0 by definition)
    Reference,
    /// Cross-correlation over the opening window
    CrossCorrelation,
    /// Cross-correlation over a window taken later in the recording
    LateWindow,
    /// Cross-correlation of the speech band only
    BandpassCorrelation,
    /// Median offset across matched transcript words
    TranscriptMatch,
    /// Nothing cleared the threshold
    Unresolved,
}

/// One try made by the aligner, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentAttempt {
    pub method: AlignmentMethod,
    /// Window start in the reference track (correlation methods only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start_seconds: Option<f64>,
    pub offset_ticks: i64,
    pub confidence: f64,
}

/// Offset of one track relative to the reference track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    /// Participant name owning the track
    pub track: String,

    /// Signed offset in ticks; positive means the track started later
    pub offset_ticks: i64,

    /// Tick rate of `offset_ticks`
    pub sample_rate: u32,

    /// Always within [0, 1]
    pub confidence: f64,

    pub method: AlignmentMethod,

    #[serde(default)]
    pub drift_warning: bool,

    /// Offset difference between early and late windows, when measured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_ticks: Option<i64>,

    /// Set whenever the offset must be confirmed by a human
    #[serde(default)]
    pub requires_review: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AlignmentAttempt>,
}

impl AlignmentResult {
    /// The reference track: zero offset, full confidence
    pub fn reference(track: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            track: track.into(),
            offset_ticks: 0,
            sample_rate,
            confidence: 1.0,
            method: AlignmentMethod::Reference,
            drift_warning: false,
            drift_ticks: None,
            requires_review: false,
            attempts: Vec::new(),
        }
    }

    /// No method cleared the threshold. Never carries a fabricated offset.
    pub fn unresolved(
        track: impl Into<String>,
        sample_rate: u32,
        attempts: Vec<AlignmentAttempt>,
    ) -> Self {
        Self {
            track: track.into(),
            offset_ticks: 0,
            sample_rate,
            confidence: 0.0,
            method: AlignmentMethod::Unresolved,
            drift_warning: false,
            drift_ticks: None,
            requires_review: true,
            attempts,
        }
    }

    pub fn offset_seconds(&self) -> f64 {
        let magnitude = ticks_to_seconds(self.offset_ticks.unsigned_abs(), self.sample_rate);
        if self.offset_ticks < 0 {
            -magnitude
        } else {
            magnitude
        }
    }
}

/// Clamp a raw score into [0, 1], mapping NaN to 0
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// The ingestion stage's alignment artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentMap {
    pub reference_track: String,
    pub sample_rate: u32,
    /// Acceptance threshold the results were judged against
    pub threshold: f64,
    pub tracks: Vec<AlignmentResult>,
}

impl AlignmentMap {
    pub fn get(&self, track: &str) -> Option<&AlignmentResult> {
        self.tracks.iter().find(|r| r.track == track)
    }

    /// Offset for a track; tracks missing from the map are not shifted
    pub fn offset_for(&self, track: &str) -> i64 {
        self.get(track).map(|r| r.offset_ticks).unwrap_or(0)
    }

    pub fn requires_review(&self) -> bool {
        self.tracks.iter().any(|r| r.requires_review)
    }

    /// Reject values no aligner could have produced
    pub fn validate(&self) -> Result<(), String> {
        if self.get(&self.reference_track).is_none() {
            return Err(format!(
                "reference track '{}' missing from alignment map",
                self.reference_track
            ));
        }
        for r in &self.tracks {
            if !(0.0..=1.0).contains(&r.confidence) {
                return Err(format!(
                    "track '{}' has confidence {} outside [0, 1]",
                    r.track, r.confidence
                ));
            }
            if r.sample_rate != self.sample_rate {
                return Err(format!(
                    "track '{}' uses {} Hz ticks, map uses {} Hz",
                    r.track, r.sample_rate, self.sample_rate
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_requires_review() {
        let r = AlignmentResult::unresolved("guest", 48_000, Vec::new());
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.offset_ticks, 0);
        assert!(r.requires_review);
    }

    #[test]
    fn test_offset_seconds_is_signed() {
        let mut r = AlignmentResult::reference("host", 48_000);
        r.offset_ticks = -24_000;
        assert_eq!(r.offset_seconds(), -0.5);
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(1.2), 1.0);
        assert_eq!(clamp_confidence(-0.1), 0.0);
    }

    #[test]
    fn test_map_validation() {
        let mut map = AlignmentMap {
            reference_track: "host".into(),
            sample_rate: 48_000,
            threshold: 0.3,
            tracks: vec![AlignmentResult::reference("host", 48_000)],
        };
        assert!(map.validate().is_ok());
        assert_eq!(map.offset_for("nobody"), 0);

        map.tracks[0].confidence = 1.5;
        assert!(map.validate().is_err());
    }
}
