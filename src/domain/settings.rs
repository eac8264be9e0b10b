//! Per-session tuning carried inside the manifest.
//!
//! Every field has a serde default so a manifest written by an older build
//! still loads, and `init` can scaffold a session with nothing but defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tuning for all four stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfigs {
    #[serde(default)]
    pub ingestion: IngestionSettings,

    #[serde(default)]
    pub editing: EditingSettings,

    #[serde(default)]
    pub mixing: MixingSettings,

    #[serde(default)]
    pub mastering: MasteringSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionSettings {
    /// Transcription model name passed to the transcription service
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    /// Spoken language hint (None = auto-detect)
    #[serde(default)]
    pub language: Option<String>,

    /// Alignment correlation window in seconds
    #[serde(default = "default_alignment_window")]
    pub alignment_window_seconds: u32,

    /// Rate both signals are decimated to before correlation
    #[serde(default = "default_analysis_rate")]
    pub analysis_rate: u32,

    /// Minimum acceptable alignment confidence
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Additional windows tried later in the recording
    #[serde(default = "default_late_window_attempts")]
    pub late_window_attempts: u32,

    /// Offset disagreement between early and late windows that raises a drift warning
    #[serde(default = "default_drift_tolerance_ms")]
    pub drift_tolerance_ms: u64,

    /// Transcript length handed to the semantic analysis service per call
    #[serde(default = "default_analysis_chunk_minutes")]
    pub analysis_chunk_minutes: u32,
}

fn default_transcription_model() -> String {
    "large-v3-turbo".to_string()
}
fn default_alignment_window() -> u32 {
    60
}
fn default_analysis_rate() -> u32 {
    16_000
}
fn default_confidence_threshold() -> f64 {
    0.3
}
fn default_late_window_attempts() -> u32 {
    2
}
fn default_drift_tolerance_ms() -> u64 {
    20
}
fn default_analysis_chunk_minutes() -> u32 {
    15
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            transcription_model: default_transcription_model(),
            language: None,
            alignment_window_seconds: default_alignment_window(),
            analysis_rate: default_analysis_rate(),
            confidence_threshold: default_confidence_threshold(),
            late_window_attempts: default_late_window_attempts(),
            drift_tolerance_ms: default_drift_tolerance_ms(),
            analysis_chunk_minutes: default_analysis_chunk_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditingSettings {
    /// Filler candidates at or above this confidence are cut without review
    #[serde(default = "default_filler_sensitivity")]
    pub filler_sensitivity: f64,

    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,

    /// Silence left in place when a long pause is shortened
    #[serde(default = "default_silence_keep_ms")]
    pub silence_keep_ms: u64,

    /// Tangents at or above this confidence are cut without review
    #[serde(default = "default_tangent_auto_cut")]
    pub tangent_auto_cut_threshold: f64,

    /// Largest share of the episode that may be removed automatically
    #[serde(default = "default_auto_cut_budget")]
    pub auto_cut_budget: f64,

    #[serde(default = "default_edl_frame_rate")]
    pub edl_frame_rate: u32,

    #[serde(default = "default_true")]
    pub generate_chapters: bool,
}

fn default_filler_sensitivity() -> f64 {
    0.7
}
fn default_min_silence_ms() -> u64 {
    800
}
fn default_silence_keep_ms() -> u64 {
    300
}
fn default_tangent_auto_cut() -> f64 {
    0.85
}
fn default_auto_cut_budget() -> f64 {
    0.5
}
fn default_edl_frame_rate() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for EditingSettings {
    fn default() -> Self {
        Self {
            filler_sensitivity: default_filler_sensitivity(),
            min_silence_ms: default_min_silence_ms(),
            silence_keep_ms: default_silence_keep_ms(),
            tangent_auto_cut_threshold: default_tangent_auto_cut(),
            auto_cut_budget: default_auto_cut_budget(),
            edl_frame_rate: default_edl_frame_rate(),
            generate_chapters: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixingSettings {
    #[serde(default = "default_crossfade_ms")]
    pub crossfade_ms: u64,

    #[serde(default = "default_true")]
    pub noise_reduction: bool,

    #[serde(default = "default_noise_floor_db")]
    pub noise_floor_db: i32,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default)]
    pub de_essing: bool,

    #[serde(default = "default_true")]
    pub ducking: bool,

    #[serde(default = "default_ducking_db")]
    pub ducking_db: f64,

    #[serde(default = "default_duck_fade_in_ms")]
    pub ducking_fade_in_ms: u64,

    #[serde(default = "default_duck_fade_out_ms")]
    pub ducking_fade_out_ms: u64,

    /// Participant whose speech ducks everyone else (None = the host)
    #[serde(default)]
    pub primary_speaker: Option<String>,

    #[serde(default = "default_bit_depth")]
    pub output_bit_depth: u16,

    #[serde(default)]
    pub music: MusicSettings,
}

/// Intro/outro music beds, paths relative to the session root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicSettings {
    /// Laid under the opening of the episode
    #[serde(default)]
    pub intro: Option<PathBuf>,

    /// Appended after the last word
    #[serde(default)]
    pub outro: Option<PathBuf>,

    #[serde(default = "default_music_volume_db")]
    pub volume_db: f64,

    /// Fade at the edge where a bed meets speech
    #[serde(default = "default_music_fade_ms")]
    pub fade_ms: u64,
}

fn default_music_volume_db() -> f64 {
    -12.0
}
fn default_music_fade_ms() -> u64 {
    2_000
}

impl Default for MusicSettings {
    fn default() -> Self {
        Self {
            intro: None,
            outro: None,
            volume_db: default_music_volume_db(),
            fade_ms: default_music_fade_ms(),
        }
    }
}

fn default_crossfade_ms() -> u64 {
    50
}
fn default_noise_floor_db() -> i32 {
    -25
}
fn default_ducking_db() -> f64 {
    -6.0
}
fn default_duck_fade_in_ms() -> u64 {
    50
}
fn default_duck_fade_out_ms() -> u64 {
    150
}
fn default_bit_depth() -> u16 {
    24
}

impl Default for MixingSettings {
    fn default() -> Self {
        Self {
            crossfade_ms: default_crossfade_ms(),
            noise_reduction: true,
            noise_floor_db: default_noise_floor_db(),
            compression: true,
            de_essing: false,
            ducking: true,
            ducking_db: default_ducking_db(),
            ducking_fade_in_ms: default_duck_fade_in_ms(),
            ducking_fade_out_ms: default_duck_fade_out_ms(),
            primary_speaker: None,
            output_bit_depth: default_bit_depth(),
            music: MusicSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteringSettings {
    #[serde(default = "default_target_lufs")]
    pub target_lufs: f64,

    #[serde(default = "default_true_peak")]
    pub true_peak_dbtp: f64,

    #[serde(default = "default_mp3_bitrate")]
    pub mp3_bitrate_kbps: u32,

    #[serde(default = "default_true")]
    pub mp3: bool,

    #[serde(default = "default_genre")]
    pub genre: String,

    #[serde(default = "default_true")]
    pub embed_chapters: bool,

    /// Measured output may miss the loudness target by this much
    #[serde(default = "default_loudness_tolerance")]
    pub loudness_tolerance_lu: f64,

    /// Square JPEG or PNG, relative to the session root
    #[serde(default)]
    pub cover_art: Option<PathBuf>,
}

fn default_target_lufs() -> f64 {
    -16.0
}
fn default_true_peak() -> f64 {
    -1.0
}
fn default_mp3_bitrate() -> u32 {
    192
}
fn default_genre() -> String {
    "Podcast".to_string()
}
fn default_loudness_tolerance() -> f64 {
    0.5
}

impl Default for MasteringSettings {
    fn default() -> Self {
        Self {
            target_lufs: default_target_lufs(),
            true_peak_dbtp: default_true_peak(),
            mp3_bitrate_kbps: default_mp3_bitrate(),
            mp3: true,
            genre: default_genre(),
            embed_chapters: true,
            loudness_tolerance_lu: default_loudness_tolerance(),
            cover_art: None,
        }
    }
}
