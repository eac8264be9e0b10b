//! Session scaffolding for `podflow init`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tokio::fs;
use tracing::{debug, info};

use crate::core::SessionStore;
use crate::domain::manifest::{Episode, Manifest, Participant, Role, ARTIFACTS_DIR, TRACKS_DIR};

/// Default session sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Everything `init` needs to create a session
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub show: String,
    pub title: String,
    pub episode_number: u32,
    pub recording_date: Option<NaiveDate>,
    /// Track paths or glob patterns
    pub tracks: Vec<String>,
    pub names: Vec<String>,
    pub roles: Vec<Role>,
    pub sample_rate: u32,
}

/// Expand glob patterns; each pattern's matches are sorted. A pattern
/// without glob characters is taken literally so a missing file is reported.
pub fn expand_tracks(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut tracks = Vec::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            tracks.push(PathBuf::from(pattern));
            continue;
        }

        let mut matched: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("Invalid track pattern: {}", pattern))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        matched.sort();
        if matched.is_empty() {
            anyhow::bail!("Track pattern matched nothing: {}", pattern);
        }
        tracks.extend(matched);
    }
    Ok(tracks)
}

/// Participants for the given tracks. Names default to `Speaker_<n>`, the
/// first participant to host and the rest to guest.
pub fn participants(tracks: &[PathBuf], names: &[String], roles: &[Role]) -> Result<Vec<Participant>> {
    if names.len() > tracks.len() {
        anyhow::bail!("{} names given for {} tracks", names.len(), tracks.len());
    }
    if roles.len() > tracks.len() {
        anyhow::bail!("{} roles given for {} tracks", roles.len(), tracks.len());
    }

    let mut file_names = BTreeSet::new();
    let mut result = Vec::with_capacity(tracks.len());
    for (i, track) in tracks.iter().enumerate() {
        let file_name = track
            .file_name()
            .with_context(|| format!("Track has no file name: {}", track.display()))?;
        if !file_names.insert(file_name.to_os_string()) {
            anyhow::bail!("Two tracks share the file name {:?}", file_name);
        }

        let name = names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Speaker_{}", i + 1));
        let role = roles
            .get(i)
            .copied()
            .unwrap_or(if i == 0 { Role::Host } else { Role::Guest });

        result.push(Participant {
            name,
            role,
            track: Path::new(TRACKS_DIR).join(file_name),
        });
    }
    Ok(result)
}

/// Create the session directory, copy the tracks in and write the manifest
pub async fn scaffold(dir: &Path, spec: &SessionSpec) -> Result<Manifest> {
    let store = SessionStore::in_dir(dir);
    if fs::try_exists(store.manifest_path()).await.unwrap_or(false) {
        anyhow::bail!("A session already exists at {}", store.manifest_path().display());
    }
    if spec.sample_rate == 0 {
        anyhow::bail!("Sample rate must be positive");
    }

    let sources = expand_tracks(&spec.tracks)?;
    if sources.is_empty() {
        anyhow::bail!("At least one track is required");
    }
    let participants = participants(&sources, &spec.names, &spec.roles)?;

    let episode = Episode {
        id: Episode::derive_id(&spec.show, spec.episode_number),
        show: spec.show.clone(),
        title: spec.title.clone(),
        episode_number: spec.episode_number,
        recording_date: spec.recording_date,
        participants,
    };
    let manifest = Manifest::new(episode, spec.sample_rate);
    manifest.validate().context("Scaffolded manifest is invalid")?;

    fs::create_dir_all(dir.join(TRACKS_DIR))
        .await
        .with_context(|| format!("Failed to create {}", dir.join(TRACKS_DIR).display()))?;
    fs::create_dir_all(dir.join(ARTIFACTS_DIR))
        .await
        .with_context(|| format!("Failed to create {}", dir.join(ARTIFACTS_DIR).display()))?;

    for (source, participant) in sources.iter().zip(&manifest.episode.participants) {
        let target = dir.join(&participant.track);
        fs::copy(source, &target).await.with_context(|| {
            format!("Failed to copy {} to {}", source.display(), target.display())
        })?;
        debug!(participant = %participant.name, track = %target.display(), "Track copied");
    }

    store.save(&manifest)?;
    info!(episode = %manifest.episode.id, participants = manifest.episode.participants.len(), "Session created");
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::manifest::{CurrentStage, StageStatus};
    use tempfile::TempDir;

    fn spec(tracks: Vec<String>) -> SessionSpec {
        SessionSpec {
            show: "The Rust Hour".to_string(),
            title: "Lifetimes".to_string(),
            episode_number: 7,
            recording_date: None,
            tracks,
            names: vec!["alice".to_string()],
            roles: Vec::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }

    #[tokio::test]
    async fn test_scaffold_copies_tracks_and_writes_manifest() {
        let temp = TempDir::new().unwrap();
        let raw = temp.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        std::fs::write(raw.join("b.wav"), b"b").unwrap();
        std::fs::write(raw.join("a.wav"), b"a").unwrap();

        let session = temp.path().join("session");
        let pattern = format!("{}/*.wav", raw.display());
        let manifest = scaffold(&session, &spec(vec![pattern])).await.unwrap();

        assert_eq!(manifest.episode.id, "the-rust-hour-ep7");
        assert_eq!(manifest.current_stage, CurrentStage::Ingestion);
        assert!(manifest.stages.iter().all(|r| r.status == StageStatus::Pending));

        let people = &manifest.episode.participants;
        assert_eq!(people[0].name, "alice");
        assert_eq!(people[0].role, Role::Host);
        assert_eq!(people[0].track, PathBuf::from("tracks/a.wav"));
        assert_eq!(people[1].name, "Speaker_2");
        assert_eq!(people[1].role, Role::Guest);

        assert!(session.join("tracks/b.wav").exists());
        assert!(session.join("artifacts").is_dir());

        let loaded = SessionStore::in_dir(&session).load().await.unwrap();
        assert_eq!(loaded, manifest);
    }

    #[tokio::test]
    async fn test_scaffold_refuses_existing_session() {
        let temp = TempDir::new().unwrap();
        let track = temp.path().join("host.wav");
        std::fs::write(&track, b"x").unwrap();
        let spec = spec(vec![track.display().to_string()]);

        let session = temp.path().join("session");
        scaffold(&session, &spec).await.unwrap();
        assert!(scaffold(&session, &spec).await.is_err());
    }

    #[test]
    fn test_too_many_names_rejected() {
        let tracks = vec![PathBuf::from("one.wav")];
        let names = vec!["a".to_string(), "b".to_string()];
        assert!(participants(&tracks, &names, &[]).is_err());
    }

    #[test]
    fn test_duplicate_file_names_rejected() {
        let tracks = vec![PathBuf::from("x/host.wav"), PathBuf::from("y/host.wav")];
        assert!(participants(&tracks, &[], &[]).is_err());
    }
}
