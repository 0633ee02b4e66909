//! Data models shared by the cache tiers, providers and orchestrator.
//!
//! - `cue`: caption units, warnings, usage and the cached document payload
//! - `track`: the capture adapter's normalized track

// Author: kelexine (https://github.com/kelexine)

pub mod cue;
pub mod track;

pub use cue::{
    validate_cues, Cue, TokenUsage, TranslatedDocument, TranslationWarning, WarningKind,
};
pub use track::CaptureTrack;
