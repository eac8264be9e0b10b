//! Timeline Builder.
//!
//! Resolves applied edit operations plus alignment offsets into ordered,
//! concrete regions on the output clock:
//! - keeps minus same-track cuts give the audible pieces of each track
//! - pieces are shifted onto the shared clock by the track's offset
//! - stretches of the shared clock no track covers are removed, which is
//!   how cuts made on every track shorten the episode
//! - regions from different tracks may overlap (simultaneous speech);
//!   regions from the same track never do

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::domain::alignment::AlignmentMap;
use crate::domain::edl::{EditOperation, OperationKind};
use crate::domain::span::TickSpan;
use crate::domain::timeline::{TimelineRegion, Transition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("operation {operation} has invalid interval [{start}, {end})")]
    InvalidInterval {
        operation: String,
        start: u64,
        end: u64,
    },

    #[error("operation {operation} references unknown track '{track}'")]
    UnknownTrack { operation: String, track: String },

    #[error("keep operations {first} and {second} overlap on track '{track}'")]
    OverlappingKeeps {
        track: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    crossfade_ticks: u64,
}

/// A kept piece of a track, before output placement
struct Piece<'a> {
    track: &'a str,
    source: TickSpan,
    /// Position on the shared clock
    aligned: TickSpan,
}

impl TimelineBuilder {
    pub fn new(crossfade_ticks: u64) -> Self {
        Self { crossfade_ticks }
    }

    /// Resolve `operations` into regions ordered by output start.
    ///
    /// Proposals (`applied == false`) are ignored.
    pub fn build(
        &self,
        operations: &[EditOperation],
        alignment: &AlignmentMap,
    ) -> Result<Vec<TimelineRegion>, TimelineError> {
        let known: BTreeSet<&str> = alignment.tracks.iter().map(|r| r.track.as_str()).collect();

        let mut keeps: BTreeMap<&str, Vec<&EditOperation>> = BTreeMap::new();
        let mut cuts: BTreeMap<&str, Vec<TickSpan>> = BTreeMap::new();

        for op in operations.iter().filter(|op| op.applied) {
            if op.span.end <= op.span.start {
                return Err(TimelineError::InvalidInterval {
                    operation: op.id.clone(),
                    start: op.span.start,
                    end: op.span.end,
                });
            }
            if !known.contains(op.track.as_str()) {
                return Err(TimelineError::UnknownTrack {
                    operation: op.id.clone(),
                    track: op.track.clone(),
                });
            }
            match op.kind {
                OperationKind::Keep => keeps.entry(op.track.as_str()).or_default().push(op),
                OperationKind::Cut => cuts.entry(op.track.as_str()).or_default().push(op.span),
            }
        }

        // Shift so the earliest-starting track begins at zero
        let shift = alignment
            .tracks
            .iter()
            .map(|r| r.offset_ticks)
            .min()
            .unwrap_or(0)
            .min(0)
            .unsigned_abs();

        let mut pieces = Vec::new();
        for (&track, track_keeps) in keeps.iter_mut() {
            track_keeps.sort_by_key(|op| op.span);
            for pair in track_keeps.windows(2) {
                if pair[0].span.overlaps(&pair[1].span) {
                    return Err(TimelineError::OverlappingKeeps {
                        track: track.to_string(),
                        first: pair[0].id.clone(),
                        second: pair[1].id.clone(),
                    });
                }
            }

            let offset = alignment.offset_for(track);
            let holes = cuts.get(&track).map(Vec::as_slice).unwrap_or(&[]);
            for keep in track_keeps.iter() {
                for source in keep.span.subtract(holes) {
                    let start = (source.start as i64 + offset) as u64 + shift;
                    pieces.push(Piece {
                        track,
                        source,
                        aligned: TickSpan::new(start, start + source.len()),
                    });
                }
            }
        }

        let mut regions = place_on_output(pieces);
        self.assign_transitions(&mut regions);
        tag_overlaps(&mut regions);
        check_same_track_overlap(&regions)?;
        Ok(regions)
    }

    /// Crossfade consecutive regions of a track that meet on the output
    /// clock, unless either is too short. Regions separated by a gap (the
    /// track was cut while another kept talking) always hard-cut.
    fn assign_transitions(&self, regions: &mut [TimelineRegion]) {
        let mut by_track: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, r) in regions.iter().enumerate() {
            by_track.entry(r.track.clone()).or_default().push(i);
        }

        for indices in by_track.values() {
            for pair in indices.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let min_len = 2 * self.crossfade_ticks;
                let adjacent = regions[a].output.end == regions[b].output.start;
                let transition = if self.crossfade_ticks > 0
                    && adjacent
                    && regions[a].duration() >= min_len
                    && regions[b].duration() >= min_len
                {
                    Transition::Crossfade {
                        ticks: self.crossfade_ticks,
                    }
                } else {
                    Transition::HardCut
                };
                regions[a].transition_out = transition;
                regions[b].transition_in = transition;
            }
        }
    }
}

/// Compact the shared clock: drop every stretch no piece covers
fn place_on_output(mut pieces: Vec<Piece<'_>>) -> Vec<TimelineRegion> {
    pieces.sort_by(|a, b| {
        a.aligned
            .start
            .cmp(&b.aligned.start)
            .then_with(|| a.track.cmp(b.track))
    });

    // Merged coverage with each block's start on the output clock
    let mut blocks: Vec<(TickSpan, u64)> = Vec::new();
    let mut output_cursor = 0u64;
    for piece in &pieces {
        match blocks.last_mut() {
            Some((block, _)) if piece.aligned.start <= block.end => {
                if piece.aligned.end > block.end {
                    output_cursor += piece.aligned.end - block.end;
                    block.end = piece.aligned.end;
                }
            }
            _ => {
                blocks.push((piece.aligned, output_cursor));
                output_cursor += piece.aligned.len();
            }
        }
    }

    let mut block_idx = 0;
    pieces
        .iter()
        .enumerate()
        .map(|(i, piece)| {
            while blocks[block_idx].0.end < piece.aligned.end {
                block_idx += 1;
            }
            let (block, block_out) = blocks[block_idx];
            let start = block_out + (piece.aligned.start - block.start);
            TimelineRegion {
                id: format!("region-{:04}", i + 1),
                track: piece.track.to_string(),
                source: piece.source,
                output: TickSpan::new(start, start + piece.source.len()),
                transition_in: Transition::HardCut,
                transition_out: Transition::HardCut,
                overlaps: Vec::new(),
            }
        })
        .collect()
}

/// Record other-track regions sharing output positions (sweep over sorted starts)
fn tag_overlaps(regions: &mut [TimelineRegion]) {
    let mut pairs = Vec::new();
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            if regions[j].output.start >= regions[i].output.end {
                break;
            }
            if regions[i].track != regions[j].track {
                pairs.push((i, j));
            }
        }
    }
    for (i, j) in pairs {
        let (id_i, id_j) = (regions[i].id.clone(), regions[j].id.clone());
        regions[i].overlaps.push(id_j);
        regions[j].overlaps.push(id_i);
    }
}

fn check_same_track_overlap(regions: &[TimelineRegion]) -> Result<(), TimelineError> {
    let mut last: BTreeMap<&str, &TimelineRegion> = BTreeMap::new();
    for r in regions {
        if let Some(prev) = last.get(r.track.as_str()) {
            if prev.output.overlaps(&r.output) {
                return Err(TimelineError::OverlappingKeeps {
                    track: r.track.clone(),
                    first: prev.id.clone(),
                    second: r.id.clone(),
                });
            }
        }
        last.insert(&r.track, r);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alignment::AlignmentResult;

    fn alignment(offsets: &[(&str, i64)]) -> AlignmentMap {
        AlignmentMap {
            reference_track: offsets[0].0.to_string(),
            sample_rate: 1_000,
            threshold: 0.3,
            tracks: offsets
                .iter()
                .map(|(name, off)| {
                    let mut r = AlignmentResult::reference(*name, 1_000);
                    r.offset_ticks = *off;
                    r
                })
                .collect(),
        }
    }

    #[test]
    fn test_cut_on_every_track_shortens_output() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 10_000)),
            EditOperation::keep("k2", "guest", TickSpan::new(0, 10_000)),
            EditOperation::cut("c1", "host", TickSpan::new(4_000, 5_000)),
            EditOperation::cut("c2", "guest", TickSpan::new(4_000, 5_000)),
        ];
        let regions = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0), ("guest", 0)]))
            .unwrap();

        assert_eq!(regions.len(), 4);
        let host: Vec<_> = regions.iter().filter(|r| r.track == "host").collect();
        assert_eq!(host[0].output, TickSpan::new(0, 4_000));
        assert_eq!(host[1].source, TickSpan::new(5_000, 10_000));
        assert_eq!(host[1].output, TickSpan::new(4_000, 9_000));
        assert_eq!(host[0].transition_out, Transition::Crossfade { ticks: 50 });
        assert_eq!(host[1].transition_in, Transition::Crossfade { ticks: 50 });
        assert_eq!(host[0].transition_in, Transition::HardCut);
        assert!(!host[0].overlaps.is_empty());
    }

    #[test]
    fn test_gap_in_one_track_hard_cuts() {
        // Host cut alone: the guest keeps the clock running through the gap
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 10_000)),
            EditOperation::keep("k2", "guest", TickSpan::new(0, 10_000)),
            EditOperation::cut("c1", "host", TickSpan::new(4_000, 5_000)),
        ];
        let regions = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0), ("guest", 0)]))
            .unwrap();

        let host: Vec<_> = regions.iter().filter(|r| r.track == "host").collect();
        assert_eq!(host.len(), 2);
        assert_eq!(host[0].output, TickSpan::new(0, 4_000));
        assert_eq!(host[1].output, TickSpan::new(5_000, 10_000));
        assert_eq!(host[0].transition_out, Transition::HardCut);
        assert_eq!(host[1].transition_in, Transition::HardCut);
    }

    #[test]
    fn test_regions_meeting_across_tracks_stay_hard_cut() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)),
            EditOperation::keep("k2", "guest", TickSpan::new(1_000, 2_000)),
        ];
        let regions = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0), ("guest", 0)]))
            .unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].output.end, regions[1].output.start);
        for r in &regions {
            assert_eq!(r.transition_in, Transition::HardCut);
            assert_eq!(r.transition_out, Transition::HardCut);
        }
    }

    #[test]
    fn test_offset_moves_track_on_output() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)),
            EditOperation::keep("k2", "guest", TickSpan::new(0, 1_000)),
        ];
        let regions = TimelineBuilder::new(0)
            .build(&ops, &alignment(&[("host", 0), ("guest", 500)]))
            .unwrap();

        let guest = regions.iter().find(|r| r.track == "guest").unwrap();
        assert_eq!(guest.output, TickSpan::new(500, 1_500));
    }

    #[test]
    fn test_negative_offset_shifts_clock() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)),
            EditOperation::keep("k2", "guest", TickSpan::new(0, 1_000)),
        ];
        let regions = TimelineBuilder::new(0)
            .build(&ops, &alignment(&[("host", 0), ("guest", -200)]))
            .unwrap();

        assert_eq!(regions[0].track, "guest");
        assert_eq!(regions[0].output.start, 0);
        assert_eq!(regions[1].output.start, 200);
    }

    #[test]
    fn test_short_regions_hard_cut() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)),
            EditOperation::cut("c1", "host", TickSpan::new(60, 500)),
        ];
        let regions = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0)]))
            .unwrap();

        // First piece is 60 ticks, shorter than two crossfades
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].transition_out, Transition::HardCut);
        assert_eq!(regions[1].transition_in, Transition::HardCut);
    }

    #[test]
    fn test_overlapping_keeps_rejected() {
        let ops = vec![
            EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)),
            EditOperation::keep("k2", "host", TickSpan::new(900, 2_000)),
        ];
        let err = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0)]))
            .unwrap_err();
        assert!(matches!(err, TimelineError::OverlappingKeeps { .. }));
    }

    #[test]
    fn test_unknown_track_rejected() {
        let ops = vec![EditOperation::keep("k1", "ghost", TickSpan::new(0, 10))];
        let err = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0)]))
            .unwrap_err();
        assert!(matches!(err, TimelineError::UnknownTrack { .. }));
    }

    #[test]
    fn test_proposals_are_ignored() {
        let mut proposal = EditOperation::cut("c1", "host", TickSpan::new(0, 500));
        proposal.applied = false;
        let ops = vec![EditOperation::keep("k1", "host", TickSpan::new(0, 1_000)), proposal];

        let regions = TimelineBuilder::new(50)
            .build(&ops, &alignment(&[("host", 0)]))
            .unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].source, TickSpan::new(0, 1_000));
    }
}
