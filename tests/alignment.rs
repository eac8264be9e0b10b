//! Signal Aligner Integration Tests
//!
//! Offset recovery on long recordings and the fall-through to transcript
//! matching when the tracks share no acoustic content.

use podflow::adapters::AudioBuffer;
use podflow::align::{AlignerSettings, SignalAligner};
use podflow::domain::{AlignmentMethod, Segment, Transcript, Word};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SOURCE_RATE: u32 = 16_000;
const SESSION_RATE: u32 = 48_000;

fn noise(rng: &mut StdRng, len: usize, amplitude: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
}

/// Transcript with one segment holding `words` at the given start times
fn transcript(words: &[(&str, f64)]) -> Transcript {
    let words: Vec<Word> = words
        .iter()
        .map(|(text, start)| Word {
            text: text.to_string(),
            start: *start,
            end: start + 0.4,
            confidence: 0.95,
        })
        .collect();
    let end = words.last().map(|w| w.end).unwrap_or(0.0);
    Transcript {
        language: Some("en".to_string()),
        duration_seconds: end,
        segments: vec![Segment {
            speaker: "speaker".to_string(),
            start: 0.0,
            end,
            text: words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "),
            words,
        }],
    }
}

#[test]
fn test_shared_clap_recovers_half_second_offset() {
    let mut rng = StdRng::seed_from_u64(2024);
    let len = SOURCE_RATE as usize * 600;
    let clap = noise(&mut rng, SOURCE_RATE as usize * 2, 0.8);

    // Clap at t=1s on the reference; the guest pressed record 500ms later
    let mut reference = noise(&mut rng, len, 0.01);
    let mut target = noise(&mut rng, len, 0.01);
    let at_reference = SOURCE_RATE as usize;
    let at_target = SOURCE_RATE as usize / 2;
    reference[at_reference..at_reference + clap.len()].copy_from_slice(&clap);
    target[at_target..at_target + clap.len()].copy_from_slice(&clap);

    let aligner = SignalAligner::new(AlignerSettings::default(), SESSION_RATE);
    let result = aligner.align(
        "guest",
        &AudioBuffer::new(reference, SOURCE_RATE),
        &AudioBuffer::new(target, SOURCE_RATE),
        None,
    );

    assert_eq!(result.method, AlignmentMethod::CrossCorrelation);
    assert_eq!(result.offset_ticks, 24_000);
    assert!((result.offset_seconds() - 0.5).abs() < 1e-3);
    assert!(result.confidence > 0.8, "confidence {}", result.confidence);
    assert!(!result.requires_review);
    assert!(!result.drift_warning);
}

#[test]
fn test_no_shared_content_falls_through_to_transcripts() {
    let mut rng = StdRng::seed_from_u64(99);
    let len = 8_000 * 20;
    let reference = AudioBuffer::new(noise(&mut rng, len, 0.5), 8_000);
    let target = AudioBuffer::new(noise(&mut rng, len, 0.5), 8_000);

    let settings = AlignerSettings {
        window_seconds: 5,
        ..Default::default()
    };
    let aligner = SignalAligner::new(settings, 8_000);

    // Both speakers heard the same words; the target started recording 2s later
    let spoken = [
        ("welcome", 1.0),
        ("everybody", 2.0),
        ("today", 3.5),
        ("lifetimes", 5.0),
        ("borrowing", 7.2),
        ("ownership", 9.0),
    ];
    let shifted: Vec<(&str, f64)> = spoken.iter().map(|(w, t)| (*w, t + 2.0)).collect();
    let reference_words = transcript(&shifted);
    let target_words = transcript(&spoken);

    let result = aligner.align("guest", &reference, &target, Some((&reference_words, &target_words)));

    let correlation_attempts: Vec<_> = result
        .attempts
        .iter()
        .filter(|a| a.method != AlignmentMethod::TranscriptMatch)
        .collect();
    assert!(!correlation_attempts.is_empty());
    assert!(correlation_attempts.iter().all(|a| a.confidence < 0.3));

    assert_eq!(result.method, AlignmentMethod::TranscriptMatch);
    assert_eq!(result.offset_ticks, 16_000);
    assert!(!result.requires_review);
}

#[test]
fn test_no_shared_content_without_transcripts_is_unresolved() {
    let mut rng = StdRng::seed_from_u64(100);
    let len = 8_000 * 20;
    let reference = AudioBuffer::new(noise(&mut rng, len, 0.5), 8_000);
    let target = AudioBuffer::new(noise(&mut rng, len, 0.5), 8_000);

    let settings = AlignerSettings {
        window_seconds: 5,
        ..Default::default()
    };
    let result = SignalAligner::new(settings, 8_000).align("guest", &reference, &target, None);

    assert_eq!(result.method, AlignmentMethod::Unresolved);
    assert_eq!(result.confidence, 0.0);
    assert_eq!(result.offset_ticks, 0);
    assert!(result.requires_review);
}

#[test]
fn test_hum_buried_voice_resolves_in_speech_band() {
    let mut rng = StdRng::seed_from_u64(4000);
    let rate = 16_000u32;
    let len = rate as usize * 8;
    let lag = 4_000usize;
    let shared = noise(&mut rng, len + lag, 0.05);

    // Each room has its own loud mains hum well below the voice band
    let hum = |freq: f64, n: usize| 0.5 * (2.0 * std::f64::consts::PI * freq * n as f64 / rate as f64).sin() as f32;
    let reference: Vec<f32> = (0..len).map(|n| shared[n] + hum(43.0, n)).collect();
    let target: Vec<f32> = (0..len).map(|n| shared[n + lag] + hum(61.0, n)).collect();

    let settings = AlignerSettings {
        analysis_rate: rate,
        window_seconds: 5,
        late_window_attempts: 0,
        ..Default::default()
    };
    let result = SignalAligner::new(settings, rate).align(
        "guest",
        &AudioBuffer::new(reference, rate),
        &AudioBuffer::new(target, rate),
        None,
    );

    assert_eq!(result.attempts[0].method, AlignmentMethod::CrossCorrelation);
    assert!(result.attempts[0].confidence < 0.3, "broadband {}", result.attempts[0].confidence);

    assert_eq!(result.method, AlignmentMethod::BandpassCorrelation);
    assert_eq!(result.offset_ticks, lag as i64);
    assert!(result.confidence >= 0.3, "speech band {}", result.confidence);
    assert!(!result.requires_review);
}
