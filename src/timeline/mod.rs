//! Non-destructive edit timeline.
//!
//! - `builder`: edit operations + alignment -> ordered regions
//! - `executor`: regions -> mixed audio
//! - `cmx`: regions -> CMX 3600 interchange list
//! - `music`: intro/outro beds around the mix

pub mod builder;
pub mod cmx;
pub mod executor;
pub mod music;

pub use builder::{TimelineBuilder, TimelineError};
pub use cmx::write_cmx3600;
pub use executor::{
    Degradation, DuckingSettings, EditExecutor, ExecutorError, ExecutorSettings, MixLog, MixOutput,
};
pub use music::{BedPosition, MusicBed};
