//! Response tag parsing.
//!
//! Assistant responses carry lightweight inline markup: `mem_XXXXXXXX`
//! short-ID references to surfaced memories, and `<mira:…>` control tags.
//! The emotion tag is extracted into metadata but preserved in the visible
//! text (the frontend renders it); every other `<mira:…>` tag is stripped.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Output of parsing one assistant response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub clean_text: String,
    pub emotion: Option<String>,
    /// 8-char short IDs referenced in the text, in order of first mention.
    pub referenced_memories: Vec<String>,
}

fn mem_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"mem_([0-9a-fA-F]{8})").unwrap())
}

fn emotion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<mira:my_emotion>(.*?)</mira:my_emotion>").unwrap())
}

fn other_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Any <mira:name>…</mira:name> pair except my_emotion, plus self-closing forms.
    RE.get_or_init(|| {
        Regex::new(r"(?s)<mira:([a-z_]+)>(.*?)</mira:[a-z_]+>|<mira:[a-z_]+\s*/>").unwrap()
    })
}

/// Parse an assistant response: extract the emotion tag (preserved in the
/// clean text), collect memory short-ID references, strip other tags.
pub fn parse_response(text: &str) -> ParsedResponse {
    let emotion = emotion_re()
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|e| !e.is_empty());

    let mut referenced = Vec::new();
    for cap in mem_id_re().captures_iter(text) {
        let short = cap[1].to_lowercase();
        if !referenced.contains(&short) {
            referenced.push(short);
        }
    }

    // Strip every <mira:…> tag except my_emotion, keeping inner text for
    // none of them (control tags carry no user-visible content).
    let clean_text = other_tag_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match caps.get(1) {
                Some(name) if name.as_str() == "my_emotion" => caps[0].to_string(),
                _ => String::new(),
            }
        })
        .trim()
        .to_string();

    ParsedResponse { clean_text, emotion, referenced_memories: referenced }
}

/// Format a full memory UUID as the short ID the model sees.
pub fn format_memory_id(id: &Uuid) -> String {
    format!("mem_{}", &id.simple().to_string()[..8])
}

/// Match an 8-char short ID against a full UUID (first 8 hex chars,
/// case-insensitive). A non-match simply drops the reference.
pub fn match_memory_id(short_id: &str, full_id: &Uuid) -> bool {
    let short = short_id.trim_start_matches("mem_");
    if short.len() != 8 {
        return false;
    }
    full_id.simple().to_string()[..8].eq_ignore_ascii_case(short)
}
