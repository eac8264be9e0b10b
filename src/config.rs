//! Tool configuration for podflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PODFLOW_HOME, PODFLOW_WHISPER, PODFLOW_FFMPEG,
//!    PODFLOW_FFPROBE, PODFLOW_ANALYSIS_URL)
//! 2. Config file (podflow.yaml or .podflow/config.yaml)
//! 3. Defaults (~/.podflow, binaries on PATH, in-process WAV engine)
//!
//! Config file discovery:
//! - Searches current directory and parents for podflow.yaml, then
//!   .podflow/config.yaml
//! - Paths in the config file are relative to the file's directory
//!
//! Per-session tuning lives in the manifest, not here.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub providers: ProviderSelection,
    #[serde(default)]
    pub binaries: BinariesConfig,
    #[serde(default)]
    pub analysis_url: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BinariesConfig {
    pub whisper: Option<String>,
    pub ffmpeg: Option<String>,
    pub ffprobe: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsConfig {
    pub workers: Option<usize>,
    pub call_timeout_seconds: Option<u64>,
    pub stage_budget_seconds: Option<u64>,
    pub min_free_disk_mb: Option<u64>,
}

/// Which implementation backs each swappable capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSelection {
    #[serde(default)]
    pub engine: EngineKind,
    #[serde(default)]
    pub analyzer: AnalyzerKind,
    #[serde(default)]
    pub tags: TagWriterKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// In-process WAV engine
    #[default]
    Wav,
    Ffmpeg,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    /// HTTP analysis service (requires analysis_url)
    Http,
    /// No semantic analysis; editing runs without a context document
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagWriterKind {
    /// tags.json next to the deliverables
    #[default]
    Sidecar,
    Ffmpeg,
}

/// Resolved binary names or paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binaries {
    pub whisper: String,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            whisper: "whisper".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

/// Limits applied to every stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Limits {
    /// Bounded worker pool size for per-track work
    pub workers: usize,
    /// Wall-clock limit for a single external call attempt
    pub call_timeout_seconds: u64,
    /// Wall-clock budget for one external call including retries
    pub stage_budget_seconds: u64,
    /// Free space required on the session volume before a stage starts
    pub min_free_disk_mb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            workers: 4,
            call_timeout_seconds: 1800,
            stage_budget_seconds: 3600,
            min_free_disk_mb: 512,
        }
    }
}

impl Limits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.stage_budget_seconds)
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_mb * 1024 * 1024
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConfig {
    /// Tool state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub providers: ProviderSelection,
    pub binaries: Binaries,
    pub analysis_url: Option<String>,
    pub retry: RetryPolicy,
    pub limits: Limits,
}

impl ResolvedConfig {
    /// Defaults with no config file and no environment
    pub fn defaults(home: PathBuf) -> Self {
        Self {
            home,
            config_file: None,
            providers: ProviderSelection::default(),
            binaries: Binaries::default(),
            analysis_url: None,
            retry: RetryPolicy::default(),
            limits: Limits::default(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        for candidate in [
            current.join("podflow.yaml"),
            current.join(".podflow").join("config.yaml"),
        ] {
            if candidate.exists() {
                return Some(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Binary setting: bare names stay as-is (looked up on PATH), paths resolve
fn resolve_binary(base: &Path, value: &str) -> String {
    if value.contains('/') {
        resolve_path(base, value).display().to_string()
    } else {
        value.to_string()
    }
}

/// Merge a parsed file over the defaults
fn apply_file(mut resolved: ResolvedConfig, file: ConfigFile, config_path: &Path) -> ResolvedConfig {
    let base = config_path.parent().unwrap_or(Path::new("."));

    if let Some(ref home) = file.home {
        resolved.home = resolve_path(base, home);
    }
    resolved.providers = file.providers;
    if let Some(ref whisper) = file.binaries.whisper {
        resolved.binaries.whisper = resolve_binary(base, whisper);
    }
    if let Some(ref ffmpeg) = file.binaries.ffmpeg {
        resolved.binaries.ffmpeg = resolve_binary(base, ffmpeg);
    }
    if let Some(ref ffprobe) = file.binaries.ffprobe {
        resolved.binaries.ffprobe = resolve_binary(base, ffprobe);
    }
    if file.analysis_url.is_some() {
        resolved.analysis_url = file.analysis_url;
    }
    if let Some(retry) = file.retry {
        resolved.retry = retry;
    }

    let limits = &mut resolved.limits;
    limits.workers = file.limits.workers.unwrap_or(limits.workers).max(1);
    limits.call_timeout_seconds = file
        .limits
        .call_timeout_seconds
        .unwrap_or(limits.call_timeout_seconds);
    limits.stage_budget_seconds = file
        .limits
        .stage_budget_seconds
        .unwrap_or(limits.stage_budget_seconds);
    limits.min_free_disk_mb = file.limits.min_free_disk_mb.unwrap_or(limits.min_free_disk_mb);

    resolved.config_file = Some(config_path.to_path_buf());
    resolved
}

/// Environment variables win over everything else
fn apply_env(mut resolved: ResolvedConfig, env: impl Fn(&str) -> Option<String>) -> ResolvedConfig {
    if let Some(home) = env("PODFLOW_HOME") {
        resolved.home = PathBuf::from(home);
    }
    if let Some(whisper) = env("PODFLOW_WHISPER") {
        resolved.binaries.whisper = whisper;
    }
    if let Some(ffmpeg) = env("PODFLOW_FFMPEG") {
        resolved.binaries.ffmpeg = ffmpeg;
    }
    if let Some(ffprobe) = env("PODFLOW_FFPROBE") {
        resolved.binaries.ffprobe = ffprobe;
    }
    if let Some(url) = env("PODFLOW_ANALYSIS_URL") {
        resolved.analysis_url = Some(url);
        resolved.providers.analyzer = AnalyzerKind::Http;
    }
    resolved
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".podflow");

    let mut resolved = ResolvedConfig::defaults(default_home);

    if let Some(config_path) = find_config_file() {
        let file = load_config_file(&config_path)?;
        resolved = apply_file(resolved, file, &config_path);
    }

    Ok(apply_env(resolved, |key| std::env::var(key).ok()))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
