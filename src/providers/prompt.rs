// Prompt construction and numbered-line response parsing
// Author: kelexine (https://github.com/kelexine)

use super::TranslationRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Stand-in for line breaks inside a single cue.
pub const LINE_BREAK_MARKER: &str = " <br> ";

/// `12. text`, `12: text` or `12) text`.
static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[.:\)]\s*(.+)$").unwrap());

static GLOSSARY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*glossary\s*:\s*(.+?)\s*=>\s*(.+?)\s*$").unwrap());

static BREAK_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*<br\s*/?>\s*").unwrap());

/// Instructions shared by every LLM backend.
pub fn system_prompt(source_language: &str, target_language: &str) -> String {
    let source = if source_language.is_empty() || source_language == "auto" {
        "the source language".to_string()
    } else {
        source_language.to_string()
    };

    format!(
        "You are a professional subtitle translator. Translate video captions from {} into {}.\n\
         Keep each line short enough to read on screen, match the speaker's tone, and keep names consistent.\n\
         Translate every numbered line. Never merge, split, skip or reorder lines.\n\
         Keep the `<br>` marker where it appears; it is a line break inside one caption.",
        source, target_language
    )
}

/// User prompt: previous context, glossary, numbered cues, look-ahead, output format.
pub fn build_user_prompt(request: &TranslationRequest) -> String {
    let mut prompt = String::new();
    let context = &request.context;

    if !context.recent.is_empty() {
        prompt.push_str("[Previous lines, already translated; do not translate again]\n");
        for unit in &context.recent {
            let _ = writeln!(
                prompt,
                "- {} => {}",
                flatten(&unit.source_text),
                flatten(&unit.translated_text)
            );
        }
        prompt.push('\n');
    }

    if !context.glossary.is_empty() {
        prompt.push_str("[Glossary; always use these renderings]\n");
        for (original, translated) in &context.glossary {
            let _ = writeln!(prompt, "- {} => {}", original, translated);
        }
        prompt.push('\n');
    }

    let _ = writeln!(prompt, "[Translate into {}]", request.target_language);
    for cue in &request.cues {
        match &cue.speaker {
            Some(speaker) => {
                let _ = writeln!(prompt, "{}. ({}) {}", cue.index, speaker, flatten(&cue.source_text));
            }
            None => {
                let _ = writeln!(prompt, "{}. {}", cue.index, flatten(&cue.source_text));
            }
        }
    }
    prompt.push('\n');

    // Unnumbered so the response parser can never mistake them for output
    if !request.following.is_empty() {
        prompt.push_str("[Following lines, context only; do not translate]\n");
        for cue in &request.following {
            let _ = writeln!(prompt, "- {}", flatten(&cue.source_text));
        }
        prompt.push('\n');
    }

    prompt.push_str("[Output format]\n");
    prompt.push_str("Output only the translations, one per line, keeping each line's number:\n");
    if let (Some(first), Some(last)) = (request.cues.first(), request.cues.last()) {
        let _ = writeln!(prompt, "{}. <translation>", first.index);
        if last.index != first.index {
            prompt.push_str("...\n");
            let _ = writeln!(prompt, "{}. <translation>", last.index);
        }
    }
    prompt.push_str(
        "After the translations, for any person or place name you translated, add one line \
         `GLOSSARY: original => translation`.",
    );

    prompt
}

fn flatten(text: &str) -> String {
    text.trim().lines().map(str::trim).collect::<Vec<_>>().join(LINE_BREAK_MARKER)
}

fn restore_breaks(text: &str) -> String {
    BREAK_TAG.replace_all(text, "\n").trim().to_string()
}

fn strip_quotes(text: &str) -> &str {
    let text = text.trim();
    for (open, close) in [('"', '"'), ('\'', '\''), ('「', '」'), ('“', '”')] {
        if text.len() > open.len_utf8() + close.len_utf8()
            && text.starts_with(open)
            && text.ends_with(close)
        {
            return &text[open.len_utf8()..text.len() - close.len_utf8()];
        }
    }
    text
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Cue index → translated text. First occurrence of an index wins.
    pub lines: BTreeMap<u32, String>,
    pub glossary: BTreeMap<String, String>,
}

/// Parse a numbered response. Unnumbered lines are ignored.
pub fn parse_numbered_lines(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();

    for line in text.lines() {
        if let Some(caps) = GLOSSARY_LINE.captures(line) {
            let original = strip_quotes(&caps[1]).to_string();
            let translated = strip_quotes(&caps[2]).to_string();
            if !original.is_empty() && !translated.is_empty() {
                parsed.glossary.entry(original).or_insert(translated);
            }
            continue;
        }

        let Some(caps) = NUMBERED_LINE.captures(line) else {
            continue;
        };
        let Ok(index) = caps[1].parse::<u32>() else {
            continue;
        };
        let translated = restore_breaks(strip_quotes(&caps[2]));
        if translated.is_empty() {
            continue;
        }
        parsed.lines.entry(index).or_insert(translated);
    }

    parsed
}

/// Counts completed numbered lines while text streams in.
#[derive(Debug, Default)]
pub struct LineCounter {
    pending: String,
    completed: usize,
}

impl LineCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns the total number of complete numbered lines so far.
    pub fn push(&mut self, delta: &str) -> usize {
        self.pending.push_str(delta);
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..end + 1).collect();
            if NUMBERED_LINE.is_match(line.trim_end()) {
                self.completed += 1;
            }
        }
        self.completed
    }
}
