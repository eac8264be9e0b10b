//! Semantic context document produced by the analysis service.
//!
//! Optional: later stages degrade gracefully when it is absent.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub title: String,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Intro,
    Main,
    Tangent,
    Advertisement,
    Outro,
}

/// A structural section of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralSegment {
    pub kind: SegmentKind,
    pub start: f64,
    pub end: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyQuote {
    pub speaker: String,
    pub text: String,
    pub start: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    #[serde(default)]
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub segments: Vec<StructuralSegment>,
    #[serde(default)]
    pub key_quotes: Vec<KeyQuote>,
}

impl ContextDocument {
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.segments.is_empty() && self.key_quotes.is_empty()
    }

    /// Combine chunk results, ordering every list by timestamp
    pub fn merge(chunks: Vec<ContextDocument>) -> ContextDocument {
        let mut merged = ContextDocument::default();
        for chunk in chunks {
            merged.topics.extend(chunk.topics);
            merged.segments.extend(chunk.segments);
            merged.key_quotes.extend(chunk.key_quotes);
        }
        merged.topics.sort_by(|a, b| a.start.total_cmp(&b.start));
        merged.segments.sort_by(|a, b| a.start.total_cmp(&b.start));
        merged.key_quotes.sort_by(|a, b| a.start.total_cmp(&b.start));
        merged
    }

    pub fn tangents(&self) -> impl Iterator<Item = &StructuralSegment> {
        self.segments.iter().filter(|s| s.kind == SegmentKind::Tangent)
    }

    pub fn validate(&self) -> Result<(), String> {
        for t in &self.topics {
            if !(t.start >= 0.0 && t.end >= t.start) {
                return Err(format!("topic '{}' has invalid interval", t.title));
            }
        }
        for s in &self.segments {
            if !(s.start >= 0.0 && s.end > s.start) {
                return Err(format!("{:?} segment has invalid interval", s.kind));
            }
            if !(0.0..=1.0).contains(&s.confidence) {
                return Err(format!(
                    "{:?} segment has confidence {} outside [0, 1]",
                    s.kind, s.confidence
                ));
            }
        }
        Ok(())
    }
}
