//! Word-level transcripts.
//!
//! Times are seconds on whichever clock produced them: a track's own clock
//! straight out of the transcriber, the reference clock after merging.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Participant name (or diarizer label before mapping)
    pub speaker: String,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub duration_seconds: f64,
    pub segments: Vec<Segment>,
}

impl Transcript {
    pub fn words(&self) -> impl Iterator<Item = &Word> {
        self.segments.iter().flat_map(|s| s.words.iter())
    }

    pub fn word_count(&self) -> usize {
        self.segments.iter().map(|s| s.words.len()).sum()
    }

    /// Move every timestamp by `seconds`, dropping anything pushed before zero
    pub fn shifted(&self, seconds: f64) -> Transcript {
        let segments = self
            .segments
            .iter()
            .filter(|s| s.end + seconds > 0.0)
            .map(|s| Segment {
                speaker: s.speaker.clone(),
                start: (s.start + seconds).max(0.0),
                end: s.end + seconds,
                text: s.text.clone(),
                words: s
                    .words
                    .iter()
                    .filter(|w| w.end + seconds > 0.0)
                    .map(|w| Word {
                        text: w.text.clone(),
                        start: (w.start + seconds).max(0.0),
                        end: w.end + seconds,
                        confidence: w.confidence,
                    })
                    .collect(),
            })
            .collect();

        Transcript {
            language: self.language.clone(),
            duration_seconds: (self.duration_seconds + seconds).max(0.0),
            segments,
        }
    }

    /// Interleave several transcripts on a shared clock, ordered by start time
    pub fn merge(parts: Vec<Transcript>) -> Transcript {
        let language = parts.iter().find_map(|t| t.language.clone());
        let duration_seconds = parts
            .iter()
            .map(|t| t.duration_seconds)
            .fold(0.0, f64::max);
        let mut segments: Vec<Segment> = parts.into_iter().flat_map(|t| t.segments).collect();
        segments.sort_by(|a, b| {
            a.start
                .total_cmp(&b.start)
                .then_with(|| a.speaker.cmp(&b.speaker))
        });

        Transcript {
            language,
            duration_seconds,
            segments,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (i, s) in self.segments.iter().enumerate() {
            if !(s.start >= 0.0 && s.end >= s.start) {
                return Err(format!(
                    "segment {} has invalid interval [{}, {}]",
                    i, s.start, s.end
                ));
            }
            for w in &s.words {
                if !(w.start >= 0.0 && w.end >= w.start) {
                    return Err(format!(
                        "word '{}' in segment {} has invalid interval [{}, {}]",
                        w.text, i, w.start, w.end
                    ));
                }
                if !(0.0..=1.0).contains(&w.confidence) {
                    return Err(format!(
                        "word '{}' in segment {} has confidence {} outside [0, 1]",
                        w.text, i, w.confidence
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Lowercase alphanumeric form used for word matching and filler lookup
pub fn normalize_word(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || *c == '\'')
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(speaker: &str, start: f64, end: f64) -> Segment {
        Segment {
            speaker: speaker.into(),
            start,
            end,
            text: "hello".into(),
            words: vec![Word {
                text: "hello".into(),
                start,
                end,
                confidence: 0.9,
            }],
        }
    }

    #[test]
    fn test_shift_and_merge() {
        let host = Transcript {
            language: Some("en".into()),
            duration_seconds: 10.0,
            segments: vec![seg("host", 1.0, 2.0), seg("host", 5.0, 6.0)],
        };
        let guest = Transcript {
            language: None,
            duration_seconds: 9.0,
            segments: vec![seg("guest", 2.0, 3.0)],
        }
        .shifted(1.5);

        let merged = Transcript::merge(vec![host, guest]);
        let starts: Vec<f64> = merged.segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![1.0, 3.5, 5.0]);
        assert_eq!(merged.language.as_deref(), Some("en"));
        assert_eq!(merged.duration_seconds, 10.5);
    }

    #[test]
    fn test_negative_shift_drops_early_words() {
        let t = Transcript {
            language: None,
            duration_seconds: 4.0,
            segments: vec![seg("a", 0.0, 0.4), seg("a", 1.0, 2.0)],
        };
        let shifted = t.shifted(-0.5);
        assert_eq!(shifted.segments.len(), 1);
        assert_eq!(shifted.segments[0].start, 0.5);
    }

    #[test]
    fn test_validate_rejects_inverted_word() {
        let mut t = Transcript {
            language: None,
            duration_seconds: 2.0,
            segments: vec![seg("a", 0.0, 1.0)],
        };
        t.segments[0].words[0].end = -1.0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_normalize_word() {
        assert_eq!(normalize_word("Um,"), "um");
        assert_eq!(normalize_word("Don't!"), "don't");
    }
}
