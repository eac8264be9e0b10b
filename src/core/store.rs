//! Session directory persistence.
//!
//! Layout of a session:
//!
//! ```text
//! <session>/
//!   manifest.yaml
//!   tracks/<participant tracks>
//!   artifacts/<stage>/<files>        promoted stage outputs
//!   artifacts/.staging-<stage>-<id>  outputs of a stage still running
//! ```
//!
//! Every write that must survive a crash goes through write-temp-then-rename:
//! the manifest via [`write_atomic`], stage outputs via
//! [`SessionStore::promote`], which swaps a fully written staging directory
//! into place.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::manifest::{ArtifactKey, Manifest, StageId, ARTIFACTS_DIR, MANIFEST_FILE};

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// File-based store for one session
#[derive(Debug, Clone)]
pub struct SessionStore {
    session_dir: PathBuf,
    manifest_path: PathBuf,
}

impl SessionStore {
    /// Open the session that owns `manifest_path`
    pub fn open(manifest_path: impl Into<PathBuf>) -> Self {
        let manifest_path = manifest_path.into();
        let session_dir = manifest_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            session_dir,
            manifest_path,
        }
    }

    /// Store for a session directory using the default manifest name
    pub fn in_dir(session_dir: impl Into<PathBuf>) -> Self {
        let session_dir = session_dir.into();
        Self {
            manifest_path: session_dir.join(MANIFEST_FILE),
            session_dir,
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.session_dir.join(ARTIFACTS_DIR)
    }

    /// Final (promoted) output directory of a stage
    pub fn stage_dir(&self, stage: StageId) -> PathBuf {
        self.artifacts_dir().join(stage.as_str())
    }

    /// Resolve a session-relative path
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.session_dir.join(relative)
    }

    /// Read and validate the manifest
    pub async fn load(&self) -> Result<Manifest> {
        let content = fs::read_to_string(&self.manifest_path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", self.manifest_path.display()))?;
        Manifest::from_yaml(&content)
            .with_context(|| format!("Invalid manifest: {}", self.manifest_path.display()))
    }

    /// Persist the manifest with write-temp-then-rename
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let yaml = manifest.to_yaml().context("Failed to serialize manifest")?;
        write_atomic(&self.manifest_path, yaml.as_bytes())
            .with_context(|| format!("Failed to write manifest: {}", self.manifest_path.display()))?;
        debug!(path = %self.manifest_path.display(), "Manifest saved");
        Ok(())
    }

    /// Fresh, empty staging directory for one execution of `stage`
    pub async fn create_staging(&self, stage: StageId) -> Result<PathBuf> {
        let dir = self
            .artifacts_dir()
            .join(format!("{}{}-{}", STAGING_PREFIX, stage, Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create staging directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Swap a fully written staging directory into the stage's final place.
    ///
    /// Returns the checksum of every registered artifact found in it. The
    /// previous output (if any) is moved aside first and only deleted once
    /// the new directory carries the final name.
    pub async fn promote(&self, staging: &Path, stage: StageId) -> Result<BTreeMap<ArtifactKey, String>> {
        let mut checksums = BTreeMap::new();
        for key in ArtifactKey::for_stage(stage) {
            let path = staging.join(key.file_name());
            if fs::try_exists(&path).await.unwrap_or(false) {
                let digest = checksum_file_async(&path).await?;
                checksums.insert(key, digest);
            }
        }

        let target = self.stage_dir(stage);
        let trash = if fs::try_exists(&target).await.unwrap_or(false) {
            let trash = self
                .artifacts_dir()
                .join(format!("{}{}-{}", TRASH_PREFIX, stage, Uuid::new_v4()));
            fs::rename(&target, &trash)
                .await
                .with_context(|| format!("Failed to move aside {}", target.display()))?;
            Some(trash)
        } else {
            None
        };

        fs::rename(staging, &target).await.with_context(|| {
            format!(
                "Failed to promote {} to {}",
                staging.display(),
                target.display()
            )
        })?;

        if let Some(trash) = trash {
            if let Err(e) = fs::remove_dir_all(&trash).await {
                warn!(path = %trash.display(), error = %e, "Failed to remove replaced artifacts");
            }
        }
        Ok(checksums)
    }

    /// Remove a stage's promoted outputs
    pub async fn discard(&self, stage: StageId) -> Result<()> {
        let dir = self.stage_dir(stage);
        if fs::try_exists(&dir).await.unwrap_or(false) {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to discard artifacts: {}", dir.display()))?;
            debug!(%stage, "Artifacts discarded");
        }
        Ok(())
    }

    pub async fn discard_staging(&self, staging: &Path) -> Result<()> {
        if fs::try_exists(staging).await.unwrap_or(false) {
            fs::remove_dir_all(staging)
                .await
                .with_context(|| format!("Failed to remove staging directory: {}", staging.display()))?;
        }
        Ok(())
    }

    /// Delete staging and trash directories left by an interrupted process
    pub async fn sweep_stale(&self) -> Result<usize> {
        let dir = self.artifacts_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                fs::remove_dir_all(entry.path())
                    .await
                    .with_context(|| format!("Failed to remove stale {}", name))?;
                warn!(dir = name, "Removed leftovers of an interrupted stage");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Write `bytes` to a temp file beside `path`, sync, then rename over it
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Hex SHA-256 of a file's contents
pub fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn checksum_file_async(path: &Path) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum_file(&owned))
        .await
        .context("Checksum worker panicked")?
        .with_context(|| format!("Failed to checksum {}", path.display()))
}
