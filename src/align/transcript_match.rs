//! Offset estimation from independently transcribed tracks.
//!
//! Words that occur exactly once in both transcripts are paired up; each
//! pair votes for `reference.start - target.start`. The densest cluster of
//! votes wins, and its median is the offset.

use std::collections::HashMap;

use crate::domain::transcript::{normalize_word, Transcript};

/// Minimum matched pairs inside the winning cluster
pub const MIN_INLIERS: usize = 3;

/// Shortest word considered an anchor
const MIN_WORD_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct WordMatch {
    pub offset_seconds: f64,
    /// Inlier share of all candidate pairs, in [0, 1]
    pub confidence: f64,
    pub pairs: usize,
    pub inliers: usize,
}

fn unique_words(transcript: &Transcript) -> HashMap<String, f64> {
    let mut seen: HashMap<String, Option<f64>> = HashMap::new();
    for word in transcript.words() {
        let key = normalize_word(&word.text);
        if key.chars().count() < MIN_WORD_LEN {
            continue;
        }
        seen.entry(key)
            .and_modify(|slot| *slot = None)
            .or_insert(Some(word.start));
    }
    seen.into_iter()
        .filter_map(|(k, v)| v.map(|start| (k, start)))
        .collect()
}

/// Estimate the target's offset onto the reference clock.
///
/// `tolerance_seconds` is the half-width of the inlier cluster.
pub fn match_words(
    reference: &Transcript,
    target: &Transcript,
    tolerance_seconds: f64,
) -> Option<WordMatch> {
    let reference_words = unique_words(reference);
    let target_words = unique_words(target);

    let mut diffs: Vec<f64> = target_words
        .iter()
        .filter_map(|(word, t_start)| reference_words.get(word).map(|r_start| r_start - t_start))
        .collect();

    if diffs.len() < MIN_INLIERS {
        return None;
    }
    diffs.sort_by(f64::total_cmp);

    // Widest window of width 2 * tolerance (two-pointer sweep)
    let width = 2.0 * tolerance_seconds;
    let (mut best_lo, mut best_hi) = (0usize, 0usize);
    let mut lo = 0;
    for hi in 0..diffs.len() {
        while diffs[hi] - diffs[lo] > width {
            lo += 1;
        }
        if hi + 1 - lo > best_hi - best_lo {
            best_lo = lo;
            best_hi = hi + 1;
        }
    }

    let cluster = &diffs[best_lo..best_hi];
    if cluster.len() < MIN_INLIERS {
        return None;
    }

    let mid = cluster.len() / 2;
    let median = if cluster.len() % 2 == 0 {
        (cluster[mid - 1] + cluster[mid]) / 2.0
    } else {
        cluster[mid]
    };

    Some(WordMatch {
        offset_seconds: median,
        confidence: cluster.len() as f64 / diffs.len() as f64,
        pairs: diffs.len(),
        inliers: cluster.len(),
    })
}
