//! Classifies a decoded segment as useful, a silent marker, a hallucination, or a hanging
//! (model-wedged) segment. The phrase tables are data keyed by `model_hash`, not switch arms,
//! so a new model version is a table addition rather than a code change.

use crate::model::Segment;

pub type ModelHash = [u8; 20];

/// SHA-1 of the "medium" whisper model weights this phrase table was tuned against.
pub const MODEL_HASH_MEDIUM: ModelHash = hex20("fd9727b6e1217c2f614f9b698455c4ffd82463b4");
/// SHA-1 of the "large-v3" whisper model weights this phrase table was tuned against.
pub const MODEL_HASH_LARGE_V3: ModelHash = hex20("ad82bf6a9043ceed055076d0fd39f5f186ff8062");

const ENTROPY_MIN: f64 = 3.63;
const ENTROPY_DETECTOR_LEN_MIN: usize = 80;
const ENTROPY_EXCLUDE_PREFIX: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Useful,
    SilentMarker,
    Hallucination,
    Hanging,
}

/// Strips the punctuation the original heuristic considers noise: `!`, `.`, `-`.
fn strip_punctuation(s: &str) -> String {
    s.chars()
        .filter(|&c| c != '!' && c != '.' && c != '-')
        .collect::<String>()
        .trim()
        .to_string()
}

fn is_hanging(segment: &Segment) -> bool {
    !segment.tokens.is_empty() && segment.tokens.iter().all(|t| t.text == "!")
}

fn is_silent_marker(segment: &Segment) -> bool {
    let trimmed = segment.text.trim().to_lowercase();
    let wrapped = |open: char, close: char| {
        trimmed.starts_with(open) && trimmed.ends_with(close) && trimmed.chars().count() >= 2
    };
    wrapped('[', ']') || wrapped('(', ')') || wrapped('*', '*') || wrapped('♪', '♪')
}

const MEDIUM_PUNCT_STRIPPED: &[&str] = &[
    "Thank you for watching",
    "Thanks for watching",
    "Thank you for watching Please subscribe to my channel",
    "Thank you",
    "Bye",
];

const LARGE_V3_EXACT: &[&str] = &[
    "0.",
    "0.5.",
    "0.001.",
    "you",
    "Oh!",
    "Hello everyone, welcome to my channel.",
    "The next day",
    "I'll be right back.",
    "I'll be back in a minute.",
    "So, let's do this.",
    "So, let's do that.",
    "Well, I'm going to do it.",
    "So, let's go ahead and do that.",
    "So, we have the following.",
    "I don't know what to do.",
    "We don't know about the fill of our 20 pairs, but it's a big one.",
    "We have 15 minutes left.",
    "I'm going to bed.",
    "I'm going to sleep.",
    "I'm going to go and get some water.",
    "I'll be waiting for you at the station.",
    "All right.",
    "I'll go and get the money.",
    "I love you.",
    "You're welcome.",
    "Amen.",
    "I'm not a doctor.",
    "let's go to the bathroom",
    "I'm sorry. I'll go to the bathroom.",
    "I'm going to the hospital.",
    "I'm going to the hospital. I'll be there in a minute.",
    "I'm going to make a new one.",
    "I'm going to write a new one.",
    "I'm sorry, I didn't mean to hurt you.",
    "I'm sorry. I'm sorry.",
    "I'm sorry, I'm sorry.",
    "I'm sorry, I'm sorry. I'm sorry.",
    "I'm sorry. I'm sorry. I'm sorry.",
];

const LARGE_V3_PUNCT_STRIPPED: &[&str] = &[
    "Thank you for watching",
    "Thanks for watching",
    "Thank you for watching Please subscribe to my channel",
    "Thank you",
    "I'm sorry",
    "Bye",
    "Subtitles by the Amaraorg community",
    "Okay",
    "The end",
    "The End",
    "THE END",
    "I'll go to the bathroom",
    "I'm going to the bathroom",
    "",
];

const LARGE_V3_CONTAINS: &[&str] = &["So, this is the first step", "So, we have a function of 0.001"];

fn is_hallucination(model_hash: &ModelHash, segment: &Segment) -> bool {
    let trimmed = segment.text.trim();
    let stripped = strip_punctuation(trimmed);

    if *model_hash == MODEL_HASH_MEDIUM {
        return MEDIUM_PUNCT_STRIPPED.contains(&stripped.as_str());
    }

    if *model_hash == MODEL_HASH_LARGE_V3 {
        if LARGE_V3_EXACT.contains(&trimmed) || LARGE_V3_PUNCT_STRIPPED.contains(&stripped.as_str()) {
            return true;
        }
        if LARGE_V3_CONTAINS.iter().any(|needle| trimmed.contains(needle)) {
            return true;
        }
        if trimmed.starts_with('"') && trimmed.ends_with('"') {
            return true;
        }
        if trimmed.starts_with("End of") {
            return true;
        }
        if trimmed.chars().count() > ENTROPY_DETECTOR_LEN_MIN {
            if let Some(entropy) = shannon_entropy_excluding_prefix(trimmed, ENTROPY_EXCLUDE_PREFIX) {
                if entropy < ENTROPY_MIN {
                    return true;
                }
            }
        }
    }

    false
}

fn contains_alphanumeric(s: &str) -> bool {
    s.chars().any(|c| c != '-' && c.is_alphanumeric())
}

/// Shannon entropy in bits, computed over characters after skipping the first `skip` of them.
/// Returns `None` if nothing is left to measure.
fn shannon_entropy_excluding_prefix(s: &str, skip: usize) -> Option<f64> {
    let chars: Vec<char> = s.chars().skip(skip).collect();
    if chars.is_empty() {
        return None;
    }
    let mut counts = std::collections::HashMap::new();
    for &c in &chars {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    let len = chars.len() as f64;
    let entropy = counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum();
    Some(entropy)
}

const fn hex20(s: &str) -> [u8; 20] {
    let bytes = s.as_bytes();
    let mut out = [0u8; 20];
    let mut i = 0;
    while i < 20 {
        out[i] = (hex_val(bytes[i * 2]) << 4) | hex_val(bytes[i * 2 + 1]);
        i += 1;
    }
    out
}

const fn hex_val(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex digit"),
    }
}

/// Classifies a decoded segment. `Hanging` takes priority over `Hallucination`; both take
/// priority over `SilentMarker`, matching the original ordering of checks.
pub fn classify(model_hash: &ModelHash, segment: &Segment) -> Classification {
    if is_hanging(segment) {
        return Classification::Hanging;
    }
    if is_silent_marker(segment) {
        return Classification::SilentMarker;
    }
    if is_hallucination(model_hash, segment) {
        return Classification::Hallucination;
    }
    if !segment.tokens.iter().any(|t| contains_alphanumeric(&t.text)) {
        return Classification::SilentMarker;
    }
    Classification::Useful
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Token;

    fn seg(text: &str, token_texts: &[&str]) -> Segment {
        Segment {
            text: text.to_string(),
            tokens: token_texts
                .iter()
                .map(|t| Token { text: t.to_string(), start_ms: 0, end_ms: 0, probability: 1.0 })
                .collect(),
            no_speech_probability: 0.0,
            speaker_turn: false,
        }
    }

    #[test]
    fn hanging_segment_detected() {
        let s = seg("!!!", &["!", "!", "!"]);
        assert_eq!(classify(&MODEL_HASH_LARGE_V3, &s), Classification::Hanging);
    }

    #[test]
    fn bracketed_text_is_silent_marker() {
        let s = seg("[music]", &["[music]"]);
        assert_eq!(classify(&MODEL_HASH_MEDIUM, &s), Classification::SilentMarker);
    }

    #[test]
    fn music_note_marker() {
        let s = seg("♪ ♪", &["♪", "♪"]);
        assert_eq!(classify(&MODEL_HASH_MEDIUM, &s), Classification::SilentMarker);
    }

    #[test]
    fn known_medium_phrase_is_hallucination() {
        let s = seg("Thank you for watching!", &["Thank", "you", "for", "watching", "!"]);
        assert_eq!(classify(&MODEL_HASH_MEDIUM, &s), Classification::Hallucination);
    }

    #[test]
    fn known_large_v3_prefix_phrase() {
        let s = seg("End of transmission today", &["End", "of", "transmission", "today"]);
        assert_eq!(classify(&MODEL_HASH_LARGE_V3, &s), Classification::Hallucination);
    }

    #[test]
    fn low_entropy_repetition_is_hallucination_on_large_v3() {
        let text = "value of the ".repeat(16);
        let s = seg(&text, &["value", "of", "the"]);
        assert_eq!(classify(&MODEL_HASH_LARGE_V3, &s), Classification::Hallucination);
    }

    #[test]
    fn useful_segment_passes_through() {
        let s = seg("hello there", &["hello", "there"]);
        assert_eq!(classify(&MODEL_HASH_LARGE_V3, &s), Classification::Useful);
    }

    #[test]
    fn no_alphanumeric_tokens_counts_as_silent() {
        let s = seg("---", &["-", "-", "-"]);
        assert_eq!(classify(&MODEL_HASH_LARGE_V3, &s), Classification::SilentMarker);
    }
}
