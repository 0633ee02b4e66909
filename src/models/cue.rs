// Caption cue and translated document types
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One timed caption unit. `index` is the stable ordering key within a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cue {
    pub index: u32,

    #[serde(default)]
    pub start_ms: u64,

    #[serde(default)]
    pub end_ms: u64,

    #[serde(alias = "text")]
    pub source_text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl Cue {
    pub fn new(index: u32, source_text: impl Into<String>) -> Self {
        Self {
            index,
            start_ms: 0,
            end_ms: 0,
            source_text: source_text.into(),
            translated_text: None,
            speaker: None,
        }
    }

    pub fn with_timing(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn is_translated(&self) -> bool {
        self.translated_text.is_some()
    }
}

/// Reject cue lists whose indices collide.
pub fn validate_cues(cues: &[Cue]) -> Result<()> {
    let mut seen = HashSet::with_capacity(cues.len());
    for cue in cues {
        if !seen.insert(cue.index) {
            return Err(BridgeError::InvalidRequest(format!(
                "duplicate cue index {}",
                cue.index
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Backend omitted the cue; source text was used instead.
    MissingTranslation,
    /// Backend stopped early (length limit or incomplete status).
    Truncated,
    /// Result was produced but could not be written to the durable tier.
    CacheWriteFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationWarning {
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub message: String,
}

impl TranslationWarning {
    pub fn missing(index: u32) -> Self {
        Self {
            kind: WarningKind::MissingTranslation,
            index: Some(index),
            message: format!("no translation returned for cue {}; kept source text", index),
        }
    }

    pub fn truncated(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Truncated,
            index: None,
            message: message.into(),
        }
    }

    pub fn cache_write_failed(message: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::CacheWriteFailed,
            index: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// The cached payload: a fully translated caption track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatedDocument {
    pub cues: Vec<Cue>,
    #[serde(default)]
    pub warnings: Vec<TranslationWarning>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub translated_at: DateTime<Utc>,
}

impl TranslatedDocument {
    pub fn new(cues: Vec<Cue>, provider: impl Into<String>, model: Option<String>) -> Self {
        Self {
            cues,
            warnings: Vec::new(),
            provider: provider.into(),
            model,
            translated_at: Utc::now(),
        }
    }

    /// True when every requested index has a translation in this document.
    pub fn covers(&self, requested: &[Cue]) -> bool {
        let translated: HashSet<u32> = self
            .cues
            .iter()
            .filter(|c| c.translated_text.is_some())
            .map(|c| c.index)
            .collect();
        requested.iter().all(|c| translated.contains(&c.index))
    }

    /// Overlay this document's translations onto `requested`, preserving the request's order.
    pub fn apply_to(&self, requested: &[Cue]) -> Vec<Cue> {
        let by_index: BTreeMap<u32, &Cue> = self.cues.iter().map(|c| (c.index, c)).collect();
        requested
            .iter()
            .map(|cue| {
                let mut out = cue.clone();
                if let Some(cached) = by_index.get(&cue.index) {
                    out.translated_text = cached.translated_text.clone();
                }
                out
            })
            .collect()
    }
}
