//! Signal Aligner.
//!
//! Finds each track's offset onto the reference track's clock:
//! 1. Decimate both signals to the analysis rate
//! 2. Cross-correlate the opening window
//! 3. Below threshold: retry with windows taken later in the recording,
//!    then correlate the best window again restricted to the speech band,
//!    then fall back to matching transcript word timestamps
//! 4. Still below threshold: report `unresolved` with confidence 0 and
//!    mandatory review, never a guessed offset
//! 5. For long recordings, measure a second, distant window and flag drift

pub mod correlate;
pub mod filter;
pub mod resample;
pub mod transcript_match;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::AudioBuffer;
use crate::domain::alignment::{
    clamp_confidence, AlignmentAttempt, AlignmentMethod, AlignmentResult,
};
use crate::domain::settings::IngestionSettings;
use crate::domain::span::{ms_to_ticks, seconds_to_signed_ticks};
use crate::domain::Transcript;

use correlate::cross_correlate;
use transcript_match::match_words;

/// Half-width of the word-offset inlier cluster
const WORD_MATCH_TOLERANCE_SECONDS: f64 = 0.25;

/// Recordings at least this many windows long get a drift measurement
const DRIFT_MIN_WINDOWS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct AlignerSettings {
    pub analysis_rate: u32,
    pub window_seconds: u32,
    pub threshold: f64,
    pub late_window_attempts: u32,
    pub drift_tolerance_ms: u64,
}

impl From<&IngestionSettings> for AlignerSettings {
    fn from(s: &IngestionSettings) -> Self {
        Self {
            analysis_rate: s.analysis_rate,
            window_seconds: s.alignment_window_seconds,
            threshold: s.confidence_threshold,
            late_window_attempts: s.late_window_attempts,
            drift_tolerance_ms: s.drift_tolerance_ms,
        }
    }
}

impl Default for AlignerSettings {
    fn default() -> Self {
        Self::from(&IngestionSettings::default())
    }
}

/// Offset search across independently recorded tracks
#[derive(Debug, Clone)]
pub struct SignalAligner {
    settings: AlignerSettings,
    /// Rate of the ticks reported in results
    session_rate: u32,
}

/// Accepted correlation and where its window started
struct WindowHit {
    position: usize,
    lag: i64,
}

impl SignalAligner {
    pub fn new(settings: AlignerSettings, session_rate: u32) -> Self {
        Self {
            settings,
            session_rate,
        }
    }

    pub fn settings(&self) -> &AlignerSettings {
        &self.settings
    }

    /// Bring both signals to a shared analysis rate
    fn prepare(&self, reference: &AudioBuffer, target: &AudioBuffer) -> (Vec<f32>, Vec<f32>, u32) {
        let rate = self
            .settings
            .analysis_rate
            .min(reference.sample_rate)
            .min(target.sample_rate);
        (
            resample::decimate(&reference.samples, reference.sample_rate, rate),
            resample::decimate(&target.samples, target.sample_rate, rate),
            rate,
        )
    }

    fn lag_to_ticks(&self, lag: i64, analysis_rate: u32) -> i64 {
        seconds_to_signed_ticks(lag as f64 / analysis_rate as f64, self.session_rate)
    }

    fn window<'a>(samples: &'a [f32], position: usize, len: usize) -> &'a [f32] {
        let start = position.min(samples.len());
        let end = (position + len).min(samples.len());
        &samples[start..end]
    }

    /// Offset of `target` onto the clock of `reference`.
    ///
    /// `transcripts` (reference, target) enables the word-matching fallback.
    pub fn align(
        &self,
        track: &str,
        reference: &AudioBuffer,
        target: &AudioBuffer,
        transcripts: Option<(&Transcript, &Transcript)>,
    ) -> AlignmentResult {
        let (r, t, rate) = self.prepare(reference, target);
        let window_len = (self.settings.window_seconds as usize * rate as usize).max(1);
        let span = r.len().min(t.len());
        let threshold = self.settings.threshold;

        let mut attempts = Vec::new();
        let mut hit: Option<(WindowHit, AlignmentMethod, f64)> = None;

        // Opening window, then later windows for late joiners
        let mut positions = vec![(0usize, AlignmentMethod::CrossCorrelation)];
        if span > window_len && self.settings.late_window_attempts > 0 {
            let n = self.settings.late_window_attempts as usize;
            for i in 1..=n {
                positions.push(((span - window_len) * i / n, AlignmentMethod::LateWindow));
            }
        }

        let mut best: Option<(usize, f64)> = None;
        for (position, method) in positions {
            let c = cross_correlate(
                Self::window(&r, position, window_len),
                Self::window(&t, position, window_len),
            );
            let (lag, confidence) = c
                .map(|c| (c.lag, clamp_confidence(c.confidence)))
                .unwrap_or((0, 0.0));

            attempts.push(AlignmentAttempt {
                method,
                window_start_seconds: Some(position as f64 / rate as f64),
                offset_ticks: self.lag_to_ticks(lag, rate),
                confidence,
            });
            debug!(track, ?method, position, lag, confidence, "Correlation attempt");

            if confidence >= threshold {
                hit = Some((WindowHit { position, lag }, method, confidence));
                break;
            }
            if best.map_or(true, |(_, c)| confidence > c) {
                best = Some((position, confidence));
            }
        }

        // Broadband energy outside the voice band (rumble, hum, hiss) can
        // bury a shared signal; try the most promising window band-limited
        if let (None, Some((position, _))) = (&hit, best) {
            let band = |samples: &[f32]| {
                filter::bandpass(
                    Self::window(samples, position, window_len),
                    rate,
                    filter::SPEECH_LOW_HZ,
                    filter::SPEECH_HIGH_HZ,
                )
            };
            if let (Some(rb), Some(tb)) = (band(&r), band(&t)) {
                let (lag, confidence) = cross_correlate(&rb, &tb)
                    .map(|c| (c.lag, clamp_confidence(c.confidence)))
                    .unwrap_or((0, 0.0));
                let method = AlignmentMethod::BandpassCorrelation;
                attempts.push(AlignmentAttempt {
                    method,
                    window_start_seconds: Some(position as f64 / rate as f64),
                    offset_ticks: self.lag_to_ticks(lag, rate),
                    confidence,
                });
                debug!(track, position, lag, confidence, "Speech-band correlation attempt");
                if confidence >= threshold {
                    hit = Some((WindowHit { position, lag }, method, confidence));
                }
            }
        }

        if let Some((window, method, confidence)) = hit {
            let offset_ticks = self.lag_to_ticks(window.lag, rate);
            let mut result = AlignmentResult {
                track: track.to_string(),
                offset_ticks,
                sample_rate: self.session_rate,
                confidence,
                method,
                drift_warning: false,
                drift_ticks: None,
                requires_review: false,
                attempts,
            };
            self.check_drift(&mut result, &r, &t, rate, window, window_len);
            info!(
                track,
                offset_ms = result.offset_seconds() * 1000.0,
                confidence,
                ?method,
                "Track aligned"
            );
            return result;
        }

        if let Some((reference_words, target_words)) = transcripts {
            match match_words(reference_words, target_words, WORD_MATCH_TOLERANCE_SECONDS) {
                Some(m) => {
                    let confidence = clamp_confidence(m.confidence);
                    let offset_ticks = seconds_to_signed_ticks(m.offset_seconds, self.session_rate);
                    attempts.push(AlignmentAttempt {
                        method: AlignmentMethod::TranscriptMatch,
                        window_start_seconds: None,
                        offset_ticks,
                        confidence,
                    });
                    if confidence >= threshold {
                        info!(
                            track,
                            offset_ms = m.offset_seconds * 1000.0,
                            confidence,
                            inliers = m.inliers,
                            "Track aligned from transcript words"
                        );
                        return AlignmentResult {
                            track: track.to_string(),
                            offset_ticks,
                            sample_rate: self.session_rate,
                            confidence,
                            method: AlignmentMethod::TranscriptMatch,
                            drift_warning: false,
                            drift_ticks: None,
                            requires_review: false,
                            attempts,
                        };
                    }
                }
                None => attempts.push(AlignmentAttempt {
                    method: AlignmentMethod::TranscriptMatch,
                    window_start_seconds: None,
                    offset_ticks: 0,
                    confidence: 0.0,
                }),
            }
        }

        warn!(
            track,
            attempts = attempts.len(),
            "No alignment method cleared the threshold; review required"
        );
        AlignmentResult::unresolved(track, self.session_rate, attempts)
    }

    /// Compare against a second window far from the accepted one
    fn check_drift(
        &self,
        result: &mut AlignmentResult,
        r: &[f32],
        t: &[f32],
        rate: u32,
        accepted: WindowHit,
        window_len: usize,
    ) {
        let span = r.len().min(t.len());
        if span < window_len * DRIFT_MIN_WINDOWS {
            return;
        }

        let last = span - window_len;
        let other = if accepted.position >= last / 2 { 0 } else { last };

        let Some(c) = cross_correlate(
            Self::window(r, other, window_len),
            Self::window(t, other, window_len),
        ) else {
            return;
        };
        if c.confidence < self.settings.threshold {
            debug!(track = %result.track, "Drift window below threshold, skipping drift check");
            return;
        }

        let drift = self.lag_to_ticks(c.lag - accepted.lag, rate);
        let tolerance = ms_to_ticks(self.settings.drift_tolerance_ms, self.session_rate) as i64;
        result.drift_ticks = Some(drift);
        if drift.abs() > tolerance {
            warn!(
                track = %result.track,
                drift_ms = drift as f64 * 1000.0 / self.session_rate as f64,
                "Clock drift detected between distant windows"
            );
            result.drift_warning = true;
            result.requires_review = true;
        }
    }
}

/// One track to align against the reference
pub struct AlignJob {
    pub track: String,
    pub audio: Arc<AudioBuffer>,
    pub transcript: Option<Arc<Transcript>>,
}

/// Align every job against the reference on a bounded pool of blocking
/// workers. Results come back in job order.
pub async fn align_all(
    aligner: Arc<SignalAligner>,
    reference: Arc<AudioBuffer>,
    reference_transcript: Option<Arc<Transcript>>,
    jobs: Vec<AlignJob>,
    max_concurrent: usize,
) -> Result<Vec<AlignmentResult>, tokio::task::JoinError> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut set = JoinSet::new();

    for (index, job) in jobs.into_iter().enumerate() {
        let aligner = aligner.clone();
        let reference = reference.clone();
        let reference_transcript = reference_transcript.clone();
        let semaphore = semaphore.clone();

        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = tokio::task::spawn_blocking(move || {
                let transcripts = match (&reference_transcript, &job.transcript) {
                    (Some(r), Some(t)) => Some((r.as_ref(), t.as_ref())),
                    _ => None,
                };
                aligner.align(&job.track, &reference, &job.audio, transcripts)
            })
            .await;
            (index, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, result) = joined?;
        results.push((index, result?));
    }
    results.sort_by_key(|(index, _)| *index);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}
