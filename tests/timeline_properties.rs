//! Timeline Builder Property Tests
//!
//! Randomly generated, track-partitioned keep/cut sets (seeded, so every
//! failure reproduces) checked against the builder's invariants.

use std::collections::BTreeMap;

use podflow::domain::{
    AlignmentMap, AlignmentResult, EditOperation, OperationKind, TickSpan, TimelineRegion, Transition,
};
use podflow::timeline::{TimelineBuilder, TimelineError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TRACKS: [&str; 3] = ["host", "guest", "cohost"];
const TRACK_LEN: u64 = 6_000;
const CROSSFADE: u64 = 40;

fn alignment(offsets: &[(&str, i64)]) -> AlignmentMap {
    AlignmentMap {
        reference_track: offsets[0].0.to_string(),
        sample_rate: 1_000,
        threshold: 0.3,
        tracks: offsets
            .iter()
            .map(|(name, offset)| {
                let mut r = AlignmentResult::reference(*name, 1_000);
                r.offset_ticks = *offset;
                r
            })
            .collect(),
    }
}

/// Non-overlapping keeps per track, plus cuts anywhere on the track
fn random_operations(rng: &mut StdRng) -> Vec<EditOperation> {
    let mut ops = Vec::new();
    for track in TRACKS {
        let mut cursor = rng.gen_range(0..200);
        let mut n = 0;
        while cursor < TRACK_LEN {
            let len = rng.gen_range(1..800);
            let end = (cursor + len).min(TRACK_LEN);
            ops.push(EditOperation::keep(format!("keep-{}/{}", n, track), track, TickSpan::new(cursor, end)));
            n += 1;
            cursor = end + rng.gen_range(0..300);
        }

        for c in 0..rng.gen_range(0..6) {
            let start = rng.gen_range(0..TRACK_LEN - 1);
            let end = (start + rng.gen_range(1..500)).min(TRACK_LEN);
            ops.push(EditOperation::cut(format!("cut-{:04}/{}", c, track), track, TickSpan::new(start, end)));
        }
    }
    ops
}

/// Source ticks of `track` that are kept and not cut
fn audible(ops: &[EditOperation], track: &str) -> Vec<bool> {
    let mut kept = vec![false; TRACK_LEN as usize];
    let track_ops: Vec<&EditOperation> = ops.iter().filter(|op| op.track == track && op.applied).collect();
    for kind in [OperationKind::Keep, OperationKind::Cut] {
        for op in track_ops.iter().filter(|op| op.kind == kind) {
            let span = op.span.start as usize..op.span.end as usize;
            kept[span].iter_mut().for_each(|k| *k = kind == OperationKind::Keep);
        }
    }
    kept
}

fn check_invariants(ops: &[EditOperation], regions: &[TimelineRegion]) {
    // Ordered by output start
    for pair in regions.windows(2) {
        assert!(pair[0].output.start <= pair[1].output.start);
    }

    let mut by_track: BTreeMap<&str, Vec<&TimelineRegion>> = BTreeMap::new();
    for r in regions {
        assert_eq!(r.output.len(), r.source.len(), "{} changes length", r.id);
        assert!(!r.source.is_empty());
        by_track.entry(r.track.as_str()).or_default().push(r);
    }

    for track in TRACKS {
        let audible = audible(ops, track);
        let track_regions = by_track.remove(track).unwrap_or_default();

        // Never two overlapping regions from one track, on either clock
        for pair in track_regions.windows(2) {
            assert!(!pair[0].output.overlaps(&pair[1].output), "{} and {} overlap", pair[0].id, pair[1].id);
            assert!(pair[0].source.end <= pair[1].source.start);
        }

        // Regions cover exactly the audible source ticks
        let covered: u64 = track_regions.iter().map(|r| r.source.len()).sum();
        let expected = audible.iter().filter(|k| **k).count() as u64;
        assert_eq!(covered, expected, "track {}", track);
        for r in &track_regions {
            assert!(audible[r.source.start as usize..r.source.end as usize].iter().all(|k| *k));
        }

        // Crossfade only between neighbours that meet on the output clock and
        // are long enough to carry it
        for pair in track_regions.windows(2) {
            let long_enough = pair[0].duration() >= 2 * CROSSFADE && pair[1].duration() >= 2 * CROSSFADE;
            let adjacent = pair[0].output.end == pair[1].output.start;
            assert_eq!(pair[0].transition_out, pair[1].transition_in);
            match pair[0].transition_out {
                Transition::Crossfade { ticks } => {
                    assert!(long_enough && adjacent, "{} crossfades into a gap", pair[0].id);
                    assert_eq!(ticks, CROSSFADE);
                }
                Transition::HardCut => assert!(!(long_enough && adjacent)),
            }
        }

        // The first and last region of a track have nothing to fade against
        if let (Some(first), Some(last)) = (track_regions.first(), track_regions.last()) {
            assert_eq!(first.transition_in, Transition::HardCut);
            assert_eq!(last.transition_out, Transition::HardCut);
        }
    }
    assert!(by_track.is_empty(), "regions for unknown tracks");
}

#[test]
fn test_random_edit_lists_keep_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let builder = TimelineBuilder::new(CROSSFADE);

    for _ in 0..200 {
        let ops = random_operations(&mut rng);
        let offsets: Vec<(&str, i64)> = TRACKS.iter().map(|t| (*t, rng.gen_range(-1_500..1_500))).collect();
        let regions = builder.build(&ops, &alignment(&offsets)).unwrap();
        check_invariants(&ops, &regions);
    }
}

#[test]
fn test_crossfades_only_at_touching_joins() {
    // Cuts on a single track leave gaps the other tracks fill; cuts on every
    // track close up. Only the latter may crossfade.
    let mut rng = StdRng::seed_from_u64(0xfade);
    let builder = TimelineBuilder::new(CROSSFADE);
    let map = alignment(&[("host", 0), ("guest", 0), ("cohost", 0)]);
    let mut gaps = 0;
    let mut joins = 0;

    for _ in 0..100 {
        let mut ops: Vec<EditOperation> = TRACKS
            .iter()
            .map(|t| EditOperation::keep(format!("keep/{}", t), *t, TickSpan::new(0, TRACK_LEN)))
            .collect();
        for c in 0..rng.gen_range(1..5) {
            let start = rng.gen_range(200..TRACK_LEN - 800);
            let span = TickSpan::new(start, start + rng.gen_range(100..600));
            if rng.gen_bool(0.5) {
                let track = TRACKS[rng.gen_range(0..TRACKS.len())];
                ops.push(EditOperation::cut(format!("cut-{:04}/{}", c, track), track, span));
            } else {
                for track in TRACKS {
                    ops.push(EditOperation::cut(format!("cut-{:04}/{}", c, track), track, span));
                }
            }
        }

        let regions = builder.build(&ops, &map).unwrap();
        for track in TRACKS {
            let track_regions: Vec<&TimelineRegion> = regions.iter().filter(|r| r.track == track).collect();
            for pair in track_regions.windows(2) {
                if let Transition::Crossfade { .. } = pair[0].transition_out {
                    assert_eq!(pair[0].output.end, pair[1].output.start);
                    joins += 1;
                }
                if pair[0].output.end < pair[1].output.start {
                    assert_eq!(pair[0].transition_out, Transition::HardCut);
                    gaps += 1;
                }
            }
        }
    }

    // Both shapes were exercised
    assert!(gaps > 0);
    assert!(joins > 0);
}

#[test]
fn test_overlapping_same_track_keeps_always_rejected() {
    let mut rng = StdRng::seed_from_u64(17);
    let builder = TimelineBuilder::new(CROSSFADE);
    let map = alignment(&[("host", 0), ("guest", 250)]);

    for _ in 0..50 {
        let start = rng.gen_range(0..3_000);
        let len = rng.gen_range(10..1_000);
        let overlap_start = rng.gen_range(start..start + len);
        let ops = vec![
            EditOperation::keep("a", "host", TickSpan::new(start, start + len)),
            EditOperation::keep("b", "host", TickSpan::new(overlap_start, overlap_start + 100)),
            EditOperation::keep("c", "guest", TickSpan::new(0, 5_000)),
        ];
        let err = builder.build(&ops, &map).unwrap_err();
        assert!(matches!(err, TimelineError::OverlappingKeeps { ref track, .. } if track == "host"));
    }
}

#[test]
fn test_fully_cut_track_has_no_regions() {
    let ops = vec![
        EditOperation::keep("keep/host", "host", TickSpan::new(0, TRACK_LEN)),
        EditOperation::keep("keep/guest", "guest", TickSpan::new(0, TRACK_LEN)),
        EditOperation::cut("cut-0001/guest", "guest", TickSpan::new(0, TRACK_LEN)),
    ];
    let regions = TimelineBuilder::new(CROSSFADE)
        .build(&ops, &alignment(&[("host", 0), ("guest", 0)]))
        .unwrap();

    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].track, "host");
    assert!(regions[0].overlaps.is_empty());
}

#[test]
fn test_different_tracks_may_overlap() {
    let ops = vec![
        EditOperation::keep("keep/host", "host", TickSpan::new(0, 2_000)),
        EditOperation::keep("keep/guest", "guest", TickSpan::new(0, 2_000)),
    ];
    let regions = TimelineBuilder::new(CROSSFADE)
        .build(&ops, &alignment(&[("host", 0), ("guest", 500)]))
        .unwrap();

    assert_eq!(regions.len(), 2);
    let host = regions.iter().find(|r| r.track == "host").unwrap();
    let guest = regions.iter().find(|r| r.track == "guest").unwrap();
    assert_eq!(guest.output, TickSpan::new(500, 2_500));
    assert_eq!(host.overlaps, vec![guest.id.clone()]);
    assert_eq!(guest.overlaps, vec![host.id.clone()]);
}
