//! Chat-text helpers shared by the classifier, the extractor and the prompts.

use regex::{Captures, Regex};
use std::sync::LazyLock;

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+>").expect("Invalid regex: user mention"));
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#[A-Z0-9]+\|?[^>]*>").expect("Invalid regex: channel mention"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(https?://[^>]+)>").expect("Invalid regex: link"));
static EMOJI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([a-z0-9_+-]+):").expect("Invalid regex: emoji"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid regex: whitespace"));

/// Strips chat markup: mentions vanish, links keep their label, emoji keep their name.
pub fn clean_chat_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let text = USER_MENTION.replace_all(text, "");
    let text = CHANNEL_MENTION.replace_all(&text, "");
    let text = LINK.replace_all(&text, |caps: &Captures| {
        match caps[1].split_once('|') {
            Some((_, label)) => label.to_string(),
            None => "[link]".to_string(),
        }
    });
    let text = EMOJI.replace_all(&text, "$1");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// First `max_chars` characters, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Like [`truncate_chars`] but marks the cut with `...`.
pub fn ellipsize(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    format!("{}...", truncate_chars(text, keep))
}
