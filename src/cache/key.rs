// Cache key codec - canonical identity for a translated track
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Format version written as the first segment of every serialized key.
/// Changing the layout requires a new version and a migration of stored rows.
pub const KEY_FORMAT_VERSION: &str = "v1";

const FIELD_VIDEO: &str = "vid";
const FIELD_SOURCE: &str = "src";
const FIELD_TARGET: &str = "tgt";
const FIELD_PROVIDER: &str = "prv";
const FIELD_MODEL: &str = "mdl";

/// Identity of one translation unit: a video's track in one language pair,
/// optionally pinned to a provider and model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey {
    pub video_id: String,
    pub source_language: String,
    pub target_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CacheKey {
    pub fn new(
        video_id: impl Into<String>,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            source_language: source_language.into(),
            target_language: target_language.into(),
            provider: None,
            model: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Required fields must be non-empty.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            (FIELD_VIDEO, &self.video_id),
            (FIELD_SOURCE, &self.source_language),
            (FIELD_TARGET, &self.target_language),
        ] {
            if value.is_empty() {
                return Err(BridgeError::MalformedKey(format!(
                    "required field '{}' is empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Serialize into the canonical `v1|vid=..|src=..|tgt=..[|prv=..][|mdl=..]` form.
    ///
    /// Field values are percent-encoded, so the `|` and `=` delimiters can never
    /// appear inside a value and distinct keys never serialize to the same string.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(KEY_FORMAT_VERSION);

        let mut push = |name: &str, value: &str| {
            out.push('|');
            out.push_str(name);
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        };

        push(FIELD_VIDEO, &self.video_id);
        push(FIELD_SOURCE, &self.source_language);
        push(FIELD_TARGET, &self.target_language);
        if let Some(provider) = &self.provider {
            push(FIELD_PROVIDER, provider);
        }
        if let Some(model) = &self.model {
            push(FIELD_MODEL, model);
        }

        out
    }

    /// Parse a serialized key. Fields may appear in any order after the version.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = raw.split('|');

        match segments.next() {
            Some(KEY_FORMAT_VERSION) => {}
            Some(other) => {
                return Err(BridgeError::MalformedKey(format!(
                    "unsupported key version '{}'",
                    other
                )))
            }
            None => return Err(BridgeError::MalformedKey("empty key".to_string())),
        }

        let mut video_id = None;
        let mut source_language = None;
        let mut target_language = None;
        let mut provider = None;
        let mut model = None;

        for segment in segments {
            let (name, encoded) = segment.split_once('=').ok_or_else(|| {
                BridgeError::MalformedKey(format!("segment '{}' has no '='", segment))
            })?;

            let value = urlencoding::decode(encoded)
                .map_err(|e| BridgeError::MalformedKey(format!("bad encoding in '{}': {}", name, e)))?
                .into_owned();

            let slot = match name {
                FIELD_VIDEO => &mut video_id,
                FIELD_SOURCE => &mut source_language,
                FIELD_TARGET => &mut target_language,
                FIELD_PROVIDER => &mut provider,
                FIELD_MODEL => &mut model,
                other => {
                    return Err(BridgeError::MalformedKey(format!(
                        "unknown field '{}'",
                        other
                    )))
                }
            };

            if slot.replace(value).is_some() {
                return Err(BridgeError::MalformedKey(format!(
                    "duplicate field '{}'",
                    name
                )));
            }
        }

        let missing = |name: &str| BridgeError::MalformedKey(format!("missing field '{}'", name));

        let key = CacheKey {
            video_id: video_id.ok_or_else(|| missing(FIELD_VIDEO))?,
            source_language: source_language.ok_or_else(|| missing(FIELD_SOURCE))?,
            target_language: target_language.ok_or_else(|| missing(FIELD_TARGET))?,
            provider,
            model,
        };
        key.validate()?;
        Ok(key)
    }

    pub fn matches_partial(&self, filter: &KeyFilter) -> bool {
        filter.matches(self)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FromStr for CacheKey {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        CacheKey::parse(s)
    }
}

/// Partial key used for listing and invalidation; absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFilter {
    pub video_id: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

impl KeyFilter {
    pub fn video(video_id: impl Into<String>) -> Self {
        Self {
            video_id: Some(video_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        fn optional(want: &Option<String>, have: &Option<String>) -> bool {
            want.as_ref().map_or(true, |w| have.as_ref() == Some(w))
        }

        field(&self.video_id, &key.video_id)
            && field(&self.source_language, &key.source_language)
            && field(&self.target_language, &key.target_language)
            && optional(&self.provider, &key.provider)
            && optional(&self.model, &key.model)
    }
}
