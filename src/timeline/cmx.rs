//! CMX 3600 export, the portable form of the edit decision list.
//!
//! Non-drop-frame timecode. One event per timeline region; crossfaded
//! joins are written as dissolves.

use std::fmt::Write;

use crate::domain::timeline::{TimelineRegion, Transition};

/// `HH:MM:SS:FF` for a tick position
pub fn timecode(ticks: u64, sample_rate: u32, fps: u32) -> String {
    let fps = fps.max(1) as u64;
    let total_frames = ticks * fps / sample_rate.max(1) as u64;
    let frames = total_frames % fps;
    let total_seconds = total_frames / fps;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total_seconds / 3600,
        (total_seconds / 60) % 60,
        total_seconds % 60,
        frames
    )
}

/// Reel names are at most 8 uppercase alphanumerics
fn reel_name(track: &str) -> String {
    let reel: String = track
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(8)
        .collect();
    if reel.is_empty() {
        "AX".to_string()
    } else {
        reel
    }
}

/// Render regions as a CMX 3600 list
pub fn write_cmx3600(
    title: &str,
    regions: &[TimelineRegion],
    sample_rate: u32,
    fps: u32,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TITLE: {}", title);
    let _ = writeln!(out, "FCM: NON-DROP FRAME");
    let _ = writeln!(out);

    for (i, region) in regions.iter().enumerate() {
        let tc = |t: u64| timecode(t, sample_rate, fps);
        let (transition, duration) = match region.transition_in {
            Transition::HardCut => ("C   ".to_string(), String::from("   ")),
            Transition::Crossfade { ticks } => (
                "D   ".to_string(),
                format!("{:03}", ticks * fps as u64 / sample_rate.max(1) as u64),
            ),
        };

        let _ = writeln!(
            out,
            "{:03}  {:<8} A     {} {} {} {} {} {}",
            i + 1,
            reel_name(&region.track),
            transition,
            duration,
            tc(region.source.start),
            tc(region.source.end),
            tc(region.output.start),
            tc(region.output.end),
        );
        let _ = writeln!(out, "* FROM CLIP NAME: {}", region.track);
        let _ = writeln!(out, "* REGION: {}", region.id);
        let _ = writeln!(out);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::span::TickSpan;

    #[test]
    fn test_timecode() {
        assert_eq!(timecode(0, 48_000, 30), "00:00:00:00");
        assert_eq!(timecode(48_000 * 3_661 + 24_000, 48_000, 30), "01:01:01:15");
    }

    #[test]
    fn test_event_lines() {
        let regions = vec![
            TimelineRegion {
                id: "region-0001".into(),
                track: "host-mic".into(),
                source: TickSpan::new(0, 48_000),
                output: TickSpan::new(0, 48_000),
                transition_in: Transition::HardCut,
                transition_out: Transition::Crossfade { ticks: 2_400 },
                overlaps: Vec::new(),
            },
            TimelineRegion {
                id: "region-0002".into(),
                track: "host-mic".into(),
                source: TickSpan::new(96_000, 144_000),
                output: TickSpan::new(48_000, 96_000),
                transition_in: Transition::Crossfade { ticks: 2_400 },
                transition_out: Transition::HardCut,
                overlaps: Vec::new(),
            },
        ];

        let edl = write_cmx3600("Episode 1", &regions, 48_000, 30);
        let lines: Vec<&str> = edl.lines().collect();

        assert_eq!(lines[0], "TITLE: Episode 1");
        assert_eq!(lines[1], "FCM: NON-DROP FRAME");
        assert!(lines[3].starts_with("001  HOSTMIC  A     C"));
        assert!(lines[3].ends_with("00:00:00:00 00:00:01:00 00:00:00:00 00:00:01:00"));
        assert!(lines[7].starts_with("002  HOSTMIC  A     D    001"));
        assert!(lines[7].contains("00:00:02:00 00:00:03:00 00:00:01:00 00:00:02:00"));
    }
}
