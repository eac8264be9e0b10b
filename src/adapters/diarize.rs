//! Speaker attribution for isolated tracks.
//!
//! Every participant records on their own track, so the track owner is the
//! speaker of everything on it. Bleed from other microphones is left alone.

use std::path::Path;

use async_trait::async_trait;

use super::{Diarizer, ProviderError};
use crate::domain::transcript::Transcript;

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackDiarizer;

#[async_trait]
impl Diarizer for TrackDiarizer {
    fn name(&self) -> &str {
        "per-track"
    }

    async fn diarize(
        &self,
        _audio: &Path,
        mut transcript: Transcript,
        speaker: &str,
    ) -> Result<Transcript, ProviderError> {
        for segment in &mut transcript.segments {
            segment.speaker = speaker.to_string();
        }
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transcript::Segment;

    #[tokio::test]
    async fn test_labels_every_segment() {
        let transcript = Transcript {
            language: None,
            duration_seconds: 2.0,
            segments: vec![Segment {
                speaker: "SPEAKER_00".to_string(),
                start: 0.0,
                end: 2.0,
                text: "hello".to_string(),
                words: vec![],
            }],
        };

        let labelled = TrackDiarizer
            .diarize(Path::new("bob.wav"), transcript, "bob")
            .await
            .unwrap();
        assert_eq!(labelled.segments[0].speaker, "bob");
    }
}
