// Index-based reconciliation of backend output with requested cues
// Author: kelexine (https://github.com/kelexine)

use super::prompt::parse_numbered_lines;
use super::ProviderResponse;
use crate::error::{BridgeError, Result};
use crate::models::{Cue, TokenUsage, TranslationWarning};
use std::collections::BTreeMap;
use tracing::warn;

/// Match translations to cues by index, in request order.
///
/// Every requested cue appears exactly once in the output. A cue the backend
/// skipped keeps its source text as translation and gets one
/// `MissingTranslation` warning. Indices that were never requested are dropped.
pub fn reconcile(
    requested: &[Cue],
    mut translations: BTreeMap<u32, String>,
) -> (Vec<Cue>, Vec<TranslationWarning>) {
    let mut warnings = Vec::new();

    let cues = requested
        .iter()
        .map(|cue| {
            let mut out = cue.clone();
            match translations.remove(&cue.index) {
                Some(text) => out.translated_text = Some(text),
                None => {
                    warnings.push(TranslationWarning::missing(cue.index));
                    out.translated_text = Some(cue.source_text.clone());
                }
            }
            out
        })
        .collect();

    if !translations.is_empty() {
        let extra: Vec<u32> = translations.keys().copied().collect();
        warn!("Backend returned unrequested cue indices {:?}; ignoring", extra);
    }

    (cues, warnings)
}

/// Turn the full text of an LLM completion into a reconciled response.
///
/// Empty output is `ServiceUnavailable`; output without a single numbered
/// line is `InvalidResponse`. `truncation` is the backend's reason for
/// stopping early, if any.
pub fn finish_completion(
    requested: &[Cue],
    text: &str,
    usage: TokenUsage,
    truncation: Option<&str>,
) -> Result<ProviderResponse> {
    if text.trim().is_empty() {
        return Err(BridgeError::ServiceUnavailable(
            "backend returned no content".to_string(),
        ));
    }

    let parsed = parse_numbered_lines(text);
    if parsed.lines.is_empty() && !requested.is_empty() {
        return Err(BridgeError::InvalidResponse(format!(
            "no numbered lines in response: {}",
            crate::utils::logging::excerpt(text, 200)
        )));
    }

    let (cues, mut warnings) = reconcile(requested, parsed.lines);
    if let Some(reason) = truncation {
        warnings.push(TranslationWarning::truncated(format!(
            "backend stopped early ({}); remaining cues kept their source text",
            reason
        )));
    }

    Ok(ProviderResponse {
        cues,
        warnings,
        glossary: parsed.glossary,
        usage,
    })
}
