// Capture adapter input format
// Author: kelexine (https://github.com/kelexine)

use super::cue::Cue;
use serde::{Deserialize, Serialize};

/// A normalized caption track as delivered by a capture adapter.
///
/// Format parsing (WebVTT, TTML, JSON events) happens before this point; the
/// `format` field only records where the cues came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTrack {
    pub video_id: String,
    #[serde(default)]
    pub platform: String,
    pub source_language: String,
    pub cues: Vec<Cue>,
    #[serde(default)]
    pub format: String,
}
