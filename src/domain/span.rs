//! Half-open sample intervals.
//!
//! All positions inside the timeline engine are expressed in ticks: samples
//! at the session's native sample rate. Seconds only appear at the edges
//! (transcripts, reports).

use serde::{Deserialize, Serialize};

/// A half-open interval `[start, end)` measured in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TickSpan {
    pub start: u64,
    pub end: u64,
}

impl TickSpan {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length in ticks (zero for inverted spans)
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when the two spans share at least one tick
    pub fn overlaps(&self, other: &TickSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &TickSpan) -> Option<TickSpan> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TickSpan { start, end })
    }

    /// Remove every `holes` span from this one, returning the remaining pieces in order
    pub fn subtract(&self, holes: &[TickSpan]) -> Vec<TickSpan> {
        let mut sorted: Vec<TickSpan> = holes
            .iter()
            .filter_map(|h| h.intersect(self))
            .collect();
        sorted.sort();

        let mut pieces = Vec::new();
        let mut cursor = self.start;
        for hole in sorted {
            if hole.start > cursor {
                pieces.push(TickSpan::new(cursor, hole.start));
            }
            cursor = cursor.max(hole.end);
        }
        if cursor < self.end {
            pieces.push(TickSpan::new(cursor, self.end));
        }
        pieces
    }

    pub fn seconds(&self, sample_rate: u32) -> (f64, f64) {
        (
            ticks_to_seconds(self.start, sample_rate),
            ticks_to_seconds(self.end, sample_rate),
        )
    }
}

/// Convert seconds to ticks, clamping negatives to zero
pub fn seconds_to_ticks(seconds: f64, sample_rate: u32) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    (seconds * sample_rate as f64).round() as u64
}

/// Convert a signed duration in seconds to signed ticks
pub fn seconds_to_signed_ticks(seconds: f64, sample_rate: u32) -> i64 {
    (seconds * sample_rate as f64).round() as i64
}

pub fn ticks_to_seconds(ticks: u64, sample_rate: u32) -> f64 {
    ticks as f64 / sample_rate as f64
}

pub fn ms_to_ticks(ms: u64, sample_rate: u32) -> u64 {
    ms * sample_rate as u64 / 1000
}
