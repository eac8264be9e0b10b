//! Edit Executor.
//!
//! Materializes timeline regions into one mixed stream:
//! - one worker per track on a bounded pool; regions of a track run in order
//! - each region is extracted through the audio engine, then passed through
//!   the configured hooks; a failing hook is skipped and logged as a
//!   degradation, never fatal
//! - a crossfaded join ramps the outgoing region's tail down and the
//!   incoming region's head up, each inside its own region; audio outside a
//!   region's source span is never read, so cut material stays out of the mix
//! - non-primary regions are ducked wherever the primary speaker talks
//! - everything is summed in region order, so reruns are bit-identical

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapters::{AudioBuffer, AudioEngine, Filter, ProviderError};
use crate::domain::settings::MixingSettings;
use crate::domain::span::{ms_to_ticks, TickSpan};
use crate::domain::timeline::{output_duration, TimelineRegion, Transition};
use super::music::MusicBed;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no source file for track '{0}'")]
    MissingTrack(String),

    #[error("failed to extract {region}: {source}")]
    Extract {
        region: String,
        #[source]
        source: ProviderError,
    },

    #[error("mix worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuckingSettings {
    /// Linear gain while ducked
    pub gain: f32,
    pub fade_in_ticks: u64,
    pub fade_out_ticks: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub sample_rate: u32,
    pub hooks: Vec<Filter>,
    pub ducking: Option<DuckingSettings>,
    /// Track whose speech ducks all others
    pub primary_track: Option<String>,
    pub workers: usize,
}

impl ExecutorSettings {
    pub fn from_mixing(
        settings: &MixingSettings,
        sample_rate: u32,
        primary_track: Option<String>,
        workers: usize,
    ) -> Self {
        let mut hooks = Vec::new();
        if settings.noise_reduction {
            hooks.push(Filter::NoiseReduction {
                floor_db: settings.noise_floor_db,
            });
        }
        if settings.compression {
            hooks.push(Filter::Compression {
                threshold_db: -18.0,
                ratio: 3.0,
            });
        }
        if settings.de_essing {
            hooks.push(Filter::DeEssing);
        }

        let ducking = settings.ducking.then(|| DuckingSettings {
            gain: 10f32.powf(settings.ducking_db as f32 / 20.0),
            fade_in_ticks: ms_to_ticks(settings.ducking_fade_in_ms, sample_rate),
            fade_out_ticks: ms_to_ticks(settings.ducking_fade_out_ms, sample_rate),
        });

        Self {
            sample_rate,
            hooks,
            ducking,
            primary_track,
            workers: workers.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuckingSpan {
    pub region: String,
    /// Output ticks
    pub start: u64,
    pub end: u64,
}

/// A hook that failed for one region and was skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub region: String,
    pub step: String,
    pub error: String,
}

/// Deterministic summary of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixLog {
    pub sample_rate: u32,
    pub region_count: usize,
    pub region_ids: Vec<String>,
    pub output_duration_ticks: u64,
    pub output_duration_seconds: f64,
    pub crossfades: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_track: Option<String>,
    pub ducking: Vec<DuckingSpan>,
    pub degradations: Vec<Degradation>,
    pub processing_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub music_beds: Vec<MusicBed>,
}

pub struct MixOutput {
    pub audio: AudioBuffer,
    pub log: MixLog,
}

/// Rendered samples of one region
struct RenderedRegion {
    index: usize,
    start: u64,
    samples: Vec<f32>,
    degradations: Vec<Degradation>,
}

pub struct EditExecutor {
    engine: Arc<dyn AudioEngine>,
    settings: ExecutorSettings,
}

impl EditExecutor {
    pub fn new(engine: Arc<dyn AudioEngine>, settings: ExecutorSettings) -> Self {
        Self { engine, settings }
    }

    /// Render `regions` (as built by the timeline builder) into one stream.
    ///
    /// `tracks` maps track names to their source files.
    pub async fn execute(
        &self,
        regions: &[TimelineRegion],
        tracks: &BTreeMap<String, PathBuf>,
    ) -> Result<MixOutput, ExecutorError> {
        let duck_spans = self.ducking_spans(regions);

        let mut by_track: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, r) in regions.iter().enumerate() {
            by_track.entry(r.track.as_str()).or_default().push(i);
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut set = JoinSet::new();

        for (track, indices) in by_track {
            let path = tracks
                .get(track)
                .cloned()
                .ok_or_else(|| ExecutorError::MissingTrack(track.to_string()))?;
            let jobs: Vec<(usize, TimelineRegion, Vec<TickSpan>)> = indices
                .into_iter()
                .map(|i| {
                    let spans = duck_spans.get(&i).cloned().unwrap_or_default();
                    (i, regions[i].clone(), spans)
                })
                .collect();

            let engine = self.engine.clone();
            let settings = self.settings.clone();
            let semaphore = semaphore.clone();

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let mut rendered = Vec::with_capacity(jobs.len());
                for (index, region, spans) in jobs {
                    rendered.push(render_region(&*engine, &settings, &path, index, &region, &spans).await?);
                }
                Ok::<_, ExecutorError>(rendered)
            });
        }

        let mut rendered = Vec::with_capacity(regions.len());
        while let Some(joined) = set.join_next().await {
            let track_regions = joined.map_err(|e| ExecutorError::Worker(e.to_string()))??;
            rendered.extend(track_regions);
        }
        rendered.sort_by_key(|r| r.index);

        let total = output_duration(regions) as usize;
        let mut mix = vec![0.0f32; total];
        let mut degradations = Vec::new();
        for r in rendered {
            let start = r.start as usize;
            for (offset, sample) in r.samples.iter().enumerate() {
                if let Some(slot) = mix.get_mut(start + offset) {
                    *slot += sample;
                }
            }
            degradations.extend(r.degradations);
        }

        let log = MixLog {
            sample_rate: self.settings.sample_rate,
            region_count: regions.len(),
            region_ids: regions.iter().map(|r| r.id.clone()).collect(),
            output_duration_ticks: total as u64,
            output_duration_seconds: total as f64 / self.settings.sample_rate as f64,
            crossfades: regions
                .iter()
                .filter(|r| matches!(r.transition_in, Transition::Crossfade { .. }))
                .count(),
            primary_track: self.settings.primary_track.clone(),
            ducking: duck_spans
                .iter()
                .flat_map(|(&i, spans)| {
                    spans.iter().map(move |s| DuckingSpan {
                        region: regions[i].id.clone(),
                        start: s.start,
                        end: s.end,
                    })
                })
                .collect(),
            degradations,
            processing_chain: self.settings.hooks.iter().map(|f| f.name().to_string()).collect(),
            music_beds: Vec::new(),
        };

        info!(
            regions = log.region_count,
            duration_s = log.output_duration_seconds,
            crossfades = log.crossfades,
            degraded = log.degradations.len(),
            "Mix rendered"
        );

        Ok(MixOutput {
            audio: AudioBuffer::new(mix, self.settings.sample_rate),
            log,
        })
    }

    /// Output spans where each non-primary region overlaps the primary track,
    /// keyed by region index (ordered, so logs are deterministic)
    fn ducking_spans(&self, regions: &[TimelineRegion]) -> BTreeMap<usize, Vec<TickSpan>> {
        let mut result = BTreeMap::new();
        let (Some(_), Some(primary)) = (&self.settings.ducking, &self.settings.primary_track) else {
            return result;
        };

        let by_id: HashMap<&str, &TimelineRegion> =
            regions.iter().map(|r| (r.id.as_str(), r)).collect();

        for (i, region) in regions.iter().enumerate() {
            if &region.track == primary {
                continue;
            }
            let mut spans: Vec<TickSpan> = region
                .overlaps
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .filter(|other| &other.track == primary)
                .filter_map(|other| other.output.intersect(&region.output))
                .collect();
            if spans.is_empty() {
                continue;
            }
            spans.sort();
            let mut merged: Vec<TickSpan> = Vec::new();
            for span in spans {
                match merged.last_mut() {
                    Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
                    _ => merged.push(span),
                }
            }
            result.insert(i, merged);
        }
        result
    }
}

async fn render_region(
    engine: &dyn AudioEngine,
    settings: &ExecutorSettings,
    path: &std::path::Path,
    index: usize,
    region: &TimelineRegion,
    duck_spans: &[TickSpan],
) -> Result<RenderedRegion, ExecutorError> {
    let expected = region.source.len() as usize;

    let mut buffer = engine
        .extract(path, region.source, settings.sample_rate)
        .await
        .map_err(|e| ExecutorError::Extract {
            region: region.id.clone(),
            source: e,
        })?;
    buffer.samples.resize(expected, 0.0);

    let mut degradations = Vec::new();
    for hook in &settings.hooks {
        match engine.apply_filter(buffer.clone(), hook).await {
            Ok(mut processed) => {
                processed.samples.resize(expected, 0.0);
                buffer = processed;
            }
            Err(e) => {
                warn!(region = %region.id, hook = hook.name(), error = %e, "Hook failed, skipping");
                degradations.push(Degradation {
                    region: region.id.clone(),
                    step: hook.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    let samples = &mut buffer.samples;
    if let Transition::Crossfade { ticks } = region.transition_in {
        let d = (ticks as usize).min(samples.len());
        for (i, s) in samples.iter_mut().take(d).enumerate() {
            *s *= i as f32 / d as f32;
        }
    }
    if let Transition::Crossfade { ticks } = region.transition_out {
        let d = (ticks as usize).min(samples.len());
        let from = samples.len() - d;
        for (i, s) in samples[from..].iter_mut().enumerate() {
            *s *= (d - i) as f32 / d as f32;
        }
    }

    if let Some(ducking) = &settings.ducking {
        if !duck_spans.is_empty() {
            for (i, s) in samples.iter_mut().enumerate() {
                *s *= duck_gain(region.output.start + i as u64, duck_spans, ducking);
            }
        }
    }

    debug!(region = %region.id, samples = expected, "Region rendered");

    Ok(RenderedRegion {
        index,
        start: region.output.start,
        samples: buffer.samples,
        degradations,
    })
}

/// Gain at output position `p`: ramp down over `fade_in` from each span's
/// start, hold, ramp back up over `fade_out` after its end
fn duck_gain(p: u64, spans: &[TickSpan], ducking: &DuckingSettings) -> f32 {
    let floor = ducking.gain;
    spans
        .iter()
        .map(|span| {
            if p < span.start {
                1.0
            } else if p < span.end {
                let into = p - span.start;
                if into < ducking.fade_in_ticks {
                    1.0 + (floor - 1.0) * into as f32 / ducking.fade_in_ticks as f32
                } else {
                    floor
                }
            } else {
                let after = p - span.end;
                if after < ducking.fade_out_ticks {
                    floor + (1.0 - floor) * after as f32 / ducking.fade_out_ticks as f32
                } else {
                    1.0
                }
            }
        })
        .fold(1.0f32, f32::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duck_gain_envelope() {
        let ducking = DuckingSettings {
            gain: 0.5,
            fade_in_ticks: 10,
            fade_out_ticks: 20,
        };
        let spans = [TickSpan::new(100, 200)];

        assert_eq!(duck_gain(50, &spans, &ducking), 1.0);
        assert_eq!(duck_gain(100, &spans, &ducking), 1.0);
        assert_eq!(duck_gain(105, &spans, &ducking), 0.75);
        assert_eq!(duck_gain(150, &spans, &ducking), 0.5);
        assert_eq!(duck_gain(210, &spans, &ducking), 0.75);
        assert_eq!(duck_gain(220, &spans, &ducking), 1.0);
    }

    #[test]
    fn test_settings_from_mixing() {
        let settings = ExecutorSettings::from_mixing(&MixingSettings::default(), 48_000, None, 0);

        assert_eq!(settings.workers, 1);
        let names: Vec<&str> = settings.hooks.iter().map(Filter::name).collect();
        assert_eq!(names, vec!["noise_reduction", "compression"]);
        let ducking = settings.ducking.unwrap();
        assert!((ducking.gain - 0.501).abs() < 0.001);
        assert_eq!(ducking.fade_in_ticks, 2_400);
        assert_eq!(ducking.fade_out_ticks, 7_200);
    }
}
