// Context carried between chunks of one batch
// Author: kelexine (https://github.com/kelexine)

use crate::models::Cue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// One previously translated cue shown to the backend as reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUnit {
    pub index: u32,
    pub source_text: String,
    pub translated_text: String,
}

/// Trailing window of translated cues plus a grow-only name glossary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationContext {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub recent: VecDeque<ContextUnit>,
    /// original → translated. Entries are never removed or overwritten.
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
}

fn default_window() -> usize {
    5
}

impl Default for TranslationContext {
    fn default() -> Self {
        Self::new(default_window())
    }
}

impl TranslationContext {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            recent: VecDeque::with_capacity(window),
            glossary: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.glossary.is_empty()
    }

    /// Replace the window with the trailing translated cues of a finished chunk.
    pub fn capture(&mut self, chunk: &[Cue]) {
        self.recent.clear();
        if self.window == 0 {
            return;
        }

        let translated: Vec<&Cue> = chunk
            .iter()
            .filter(|cue| cue.translated_text.is_some())
            .collect();
        let skip = translated.len().saturating_sub(self.window);

        self.recent.extend(translated.into_iter().skip(skip).map(|cue| ContextUnit {
            index: cue.index,
            source_text: cue.source_text.clone(),
            translated_text: cue.translated_text.clone().unwrap_or_default(),
        }));
    }

    /// Add unseen glossary mappings. Returns how many were new.
    pub fn merge_glossary<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut added = 0;
        for (original, translated) in entries {
            let original = original.trim();
            let translated = translated.trim();
            if original.is_empty() || translated.is_empty() {
                continue;
            }
            if !self.glossary.contains_key(original) {
                self.glossary
                    .insert(original.to_string(), translated.to_string());
                added += 1;
            }
        }
        added
    }
}
