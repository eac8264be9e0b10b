//! Metadata and chapter embedding.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{EpisodeTags, ProviderError, TagWriter};

/// Writes `<file>.tags.json` next to the media instead of touching it
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarTagWriter;

pub(crate) fn sidecar_path(media: &Path) -> PathBuf {
    let mut name = media
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tags.json");
    media.with_file_name(name)
}

#[async_trait]
impl TagWriter for SidecarTagWriter {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn write_tags(
        &self,
        media: &Path,
        tags: &EpisodeTags,
    ) -> Result<Vec<PathBuf>, ProviderError> {
        let path = sidecar_path(media);
        let json = serde_json::to_string_pretty(tags)
            .map_err(|e| ProviderError::permanent("sidecar", e.to_string()))?;
        tokio::fs::write(&path, json).await?;
        Ok(vec![path])
    }
}

const FFMPEG: &str = "ffmpeg-tags";
const TAG_TIMEOUT: Duration = Duration::from_secs(300);

/// Remuxes the media with ffmpeg, embedding tags and chapters in place
pub struct FfmpegTagWriter {
    binary_path: String,
}

impl FfmpegTagWriter {
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

fn escape_metadata(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Render tags in ffmpeg's FFMETADATA1 format
pub(crate) fn ffmetadata(tags: &EpisodeTags) -> String {
    let mut out = String::from(";FFMETADATA1\n");
    let _ = writeln!(out, "title={}", escape_metadata(&tags.title));
    let _ = writeln!(out, "artist={}", escape_metadata(&tags.artist));
    let _ = writeln!(out, "album={}", escape_metadata(&tags.album));
    let _ = writeln!(out, "genre={}", escape_metadata(&tags.genre));
    let _ = writeln!(out, "track={}", tags.track_number);
    if let Some(date) = &tags.date {
        let _ = writeln!(out, "date={}", escape_metadata(date));
    }

    let total_ms = (tags.duration_seconds * 1000.0).round() as u64;
    for (i, chapter) in tags.chapters.iter().enumerate() {
        let start = (chapter.start_seconds * 1000.0).round() as u64;
        let end = tags
            .chapters
            .get(i + 1)
            .map(|next| (next.start_seconds * 1000.0).round() as u64)
            .unwrap_or(total_ms)
            .max(start + 1);
        let _ = writeln!(out, "\n[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}", start, end);
        let _ = writeln!(out, "title={}", escape_metadata(&chapter.title));
    }
    out
}

/// ffmpeg arguments copying `media` with tags, chapters and, for MP3, an
/// attached cover picture
pub(crate) fn remux_args(media: &Path, metadata: &Path, cover: Option<&Path>, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-v", "error", "-y", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(media.into());
    args.push("-i".into());
    args.push(metadata.into());

    // WAV has no picture stream; the cover stays a sidecar file there
    let is_mp3 = media
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("mp3"));
    match cover.filter(|_| is_mp3) {
        Some(cover) => {
            args.push("-i".into());
            args.push(cover.into());
            for a in [
                "-map", "0:a", "-map", "2:v", "-map_metadata", "1", "-map_chapters", "1", "-codec", "copy",
                "-id3v2_version", "3", "-disposition:v:0", "attached_pic", "-metadata:s:v", "title=Cover",
            ] {
                args.push(a.into());
            }
        }
        None => {
            for a in ["-map", "0", "-map_metadata", "1", "-map_chapters", "1", "-codec", "copy"] {
                args.push(a.into());
            }
        }
    }
    args.push(out.into());
    args
}

#[async_trait]
impl TagWriter for FfmpegTagWriter {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn write_tags(
        &self,
        media: &Path,
        tags: &EpisodeTags,
    ) -> Result<Vec<PathBuf>, ProviderError> {
        let dir = media
            .parent()
            .ok_or_else(|| ProviderError::invalid_input(FFMPEG, "media has no parent directory"))?;
        let extension = media.extension().and_then(|e| e.to_str()).unwrap_or("wav");

        let metadata = tempfile::Builder::new()
            .prefix(".ffmetadata-")
            .suffix(".txt")
            .tempfile_in(dir)?;
        tokio::fs::write(metadata.path(), ffmetadata(tags)).await?;

        // Same directory so the final rename stays on one filesystem
        let remuxed = tempfile::Builder::new()
            .prefix(".tagging-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(dir)?;

        let cover = tags.cover_art.as_ref().map(|c| dir.join(c));
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(remux_args(media, metadata.path(), cover.as_deref(), remuxed.path()));

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::permanent(FFMPEG, format!("failed to spawn {}: {}", self.binary_path, e))
            })?;
        let output = timeout(TAG_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::transient(FFMPEG, "tagging timed out"))??;

        if !output.status.success() {
            return Err(ProviderError::permanent(
                FFMPEG,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        remuxed.persist(media).map_err(|e| ProviderError::Io(e.error))?;
        Ok(Vec::new())
    }
}
