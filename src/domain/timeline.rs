//! Resolved timeline regions.

use serde::{Deserialize, Serialize};

use super::span::TickSpan;

/// How a region joins its neighbour on the same track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transition {
    HardCut,
    Crossfade { ticks: u64 },
}

impl Transition {
    pub fn ticks(&self) -> u64 {
        match self {
            Transition::HardCut => 0,
            Transition::Crossfade { ticks } => *ticks,
        }
    }
}

/// A concrete slice of one source track placed on the output clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRegion {
    /// `region-NNNN`, assigned in output order
    pub id: String,

    pub track: String,

    /// Interval on the track's own clock
    pub source: TickSpan,

    /// Interval on the output clock; same length as `source`
    pub output: TickSpan,

    pub transition_in: Transition,

    pub transition_out: Transition,

    /// Ids of regions from other tracks sharing output positions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlaps: Vec<String>,
}

impl TimelineRegion {
    pub fn duration(&self) -> u64 {
        self.output.len()
    }
}

/// End of the last region on the output clock
pub fn output_duration(regions: &[TimelineRegion]) -> u64 {
    regions.iter().map(|r| r.output.end).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_serialization() {
        let json = serde_json::to_string(&Transition::Crossfade { ticks: 2400 }).unwrap();
        assert_eq!(json, r#"{"type":"crossfade","ticks":2400}"#);

        let hard: Transition = serde_json::from_str(r#"{"type":"hard-cut"}"#).unwrap();
        assert_eq!(hard, Transition::HardCut);
    }
}
