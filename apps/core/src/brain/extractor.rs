//! Deterministic solution extraction.
//!
//! Turns a fetched thread plus its [`ConversationAnalysis`] into an
//! [`ExtractedSolution`]. Everything here is pure; the same thread always yields
//! the same record.

use crate::brain::analysis::ConversationAnalysis;
use crate::models::ThreadMessage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Candidate categories with their trigger keywords.
///
/// Declaration order is the tie-break: when two categories score the same, the
/// one listed first wins.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("konveyör", &["konveyör", "conveyor", "bant", "taşıma", "besleme"]),
    ("sensör", &["sensör", "sensor", "algılayıcı", "fotosel"]),
    ("motor", &["motor", "servo", "sürücü", "drive", "inverter"]),
    ("hidrolik", &["hidrolik", "piston", "silindir", "pompa", "basınç"]),
    ("pnömatik", &["pnömatik", "hava", "kompresör", "valf", "valve"]),
    ("elektrik", &["elektrik", "kablo", "sigorta", "faz", "toprak"]),
    ("yazılım", &["yazılım", "plc", "hmi", "program", "kod", "software"]),
    ("mekanik", &["mekanik", "rulman", "kayış", "dişli", "mil"]),
    ("sıkışma", &["sıkışma", "tıkanma", "jam", "blokaj"]),
    ("kalibrasyon", &["kalibrasyon", "ayar", "calibration", "setup"]),
];

const MAX_KEYWORDS: usize = 20;
const MAX_CAPITALIZED: usize = 5;
const MAX_PATTERN_WORDS: usize = 10;
const MIN_STEPS: usize = 2;

/// Machine code forms, tried in order. The first one matching anywhere wins.
static MACHINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // A1100, BC2200
        r"(?i)\b([A-Z]{1,3}\d{3,4})\b",
        // "makine no: 7", "makine numarası 12"
        r"(?i)makine\s+(?:no|numarası)?\s*[:\s]?\s*(\d+)",
        // "line 3", "hat: 2"
        r"(?i)(?:line|hat)\s*[:\s]?\s*(\d+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid regex: machine pattern"))
    .collect()
});

static CAPITALIZED_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\p{Lu}\p{L}{2,}\b").expect("Invalid regex: capitalized word"));
static LONG_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w{4,}\b").expect("Invalid regex: long word"));
static NUMBERED_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+[.)]").expect("Invalid regex: numbered marker"));
static BULLET_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-•*]").expect("Invalid regex: bullet marker"));

/// Structured solution payload, ready to be persisted and indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSolution {
    pub error_pattern: String,
    /// One-line description of the fault.
    pub summary: String,
    /// The remedy as written by the analysis.
    pub solution_text: String,
    pub root_cause: Option<String>,
    pub category: Option<String>,
    pub machine_type: Option<String>,
    pub keywords: Vec<String>,
    pub steps: Option<Vec<String>>,
    pub resolver_id: Option<String>,
    pub successful: bool,
}

/// Builds the payload. Returns `None` when the analysis lacks a summary or a remedy.
pub fn extract_solution(
    messages: &[ThreadMessage],
    analysis: &ConversationAnalysis,
) -> Option<ExtractedSolution> {
    let summary = analysis.error_summary.as_deref()?.trim();
    let solution_text = analysis.solution.as_deref()?.trim();
    if summary.is_empty() || solution_text.is_empty() {
        return None;
    }

    let full_text = join_thread(messages);
    let detected_machine = detect_machine_type(&full_text);
    let error_pattern = build_error_pattern(summary, detected_machine.as_deref());

    let category = analysis
        .category
        .clone()
        .or_else(|| detect_category(&full_text));
    let machine_type = analysis
        .machine_type
        .as_deref()
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .or_else(|| detected_machine.clone());

    Some(ExtractedSolution {
        keywords: extract_keywords(&full_text, &error_pattern, detected_machine.as_deref()),
        error_pattern,
        summary: summary.to_string(),
        solution_text: solution_text.to_string(),
        root_cause: analysis.root_cause.clone(),
        category,
        machine_type,
        steps: extract_steps(solution_text),
        resolver_id: identify_resolver(messages),
        successful: analysis.successful.unwrap_or(true),
    })
}

pub fn join_thread(messages: &[ThreadMessage]) -> String {
    messages
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Highest keyword score wins; ties go to the earlier category; no hit gives `None`.
pub fn detect_category(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let mut best: Option<(&str, usize)> = None;

    for (category, keywords) in CATEGORY_KEYWORDS {
        let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if score == 0 {
            continue;
        }
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((*category, score)),
        }
    }

    best.map(|(category, _)| category.to_string())
}

/// Upper-cased machine code from the first pattern that matches.
pub fn detect_machine_type(text: &str) -> Option<String> {
    MACHINE_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_uppercase())
    })
}

/// Search key for the solution: the summary, prefixed with the machine when absent.
pub fn build_error_pattern(summary: &str, machine_type: Option<&str>) -> String {
    match machine_type {
        Some(machine) if !summary.contains(machine) => format!("{} - {}", machine, summary),
        _ => summary.to_string(),
    }
}

/// Insertion-ordered set capped at [`MAX_KEYWORDS`].
#[derive(Default)]
struct KeywordSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl KeywordSet {
    fn insert(&mut self, word: String) {
        if self.ordered.len() < MAX_KEYWORDS && self.seen.insert(word.clone()) {
            self.ordered.push(word);
        }
    }
}

pub fn extract_keywords(
    full_text: &str,
    error_pattern: &str,
    machine_type: Option<&str>,
) -> Vec<String> {
    let lower = full_text.to_lowercase();
    let mut keywords = KeywordSet::default();

    for (_, category_keywords) in CATEGORY_KEYWORDS {
        for keyword in category_keywords.iter().filter(|kw| lower.contains(*kw)) {
            keywords.insert(keyword.to_string());
        }
    }

    if let Some(machine) = machine_type {
        keywords.insert(machine.to_lowercase());
    }

    for word in CAPITALIZED_WORD
        .find_iter(full_text)
        .take(MAX_CAPITALIZED)
    {
        keywords.insert(word.as_str().to_lowercase());
    }

    let pattern_lower = error_pattern.to_lowercase();
    for word in LONG_WORD.find_iter(&pattern_lower).take(MAX_PATTERN_WORDS) {
        keywords.insert(word.as_str().to_string());
    }

    keywords.ordered
}

/// Most frequent author in the second half of the thread; ties go to whoever spoke first.
pub fn identify_resolver(messages: &[ThreadMessage]) -> Option<String> {
    let later = &messages[messages.len() / 2..];
    let mut counts: Vec<(&str, usize)> = Vec::new();

    for message in later {
        if message.author_id.is_empty() {
            continue;
        }
        match counts.iter_mut().find(|(author, _)| *author == message.author_id) {
            Some((_, count)) => *count += 1,
            None => counts.push((message.author_id.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (author, count) in counts {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((author, count)),
        }
    }
    best.map(|(author, _)| author.to_string())
}

/// Numbered items first, then bullets. Fewer than two items yields `None`.
pub fn extract_steps(solution_text: &str) -> Option<Vec<String>> {
    if solution_text.trim().is_empty() {
        return None;
    }

    let numbered = split_on_markers(solution_text, &NUMBERED_MARKER);
    if numbered.len() >= MIN_STEPS {
        return Some(numbered);
    }

    let bullets = split_on_markers(solution_text, &BULLET_MARKER);
    if bullets.len() >= MIN_STEPS {
        return Some(bullets);
    }

    None
}

/// Text between consecutive markers (and after the last one), trimmed.
fn split_on_markers(text: &str, marker: &Regex) -> Vec<String> {
    let markers: Vec<_> = marker.find_iter(text).collect();
    markers
        .iter()
        .enumerate()
        .filter_map(|(i, m)| {
            let end = markers.get(i + 1).map_or(text.len(), |next| next.start());
            let item = text[m.end()..end].trim();
            (!item.is_empty()).then(|| item.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(author: &str, text: &str) -> ThreadMessage {
        ThreadMessage {
            author_id: author.to_string(),
            text: text.to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn motor_keywords_pick_motor() {
        assert_eq!(
            detect_category("motor sürücü inverter arızası").as_deref(),
            Some("motor")
        );
    }

    #[test]
    fn tie_goes_to_first_declared_category() {
        // one konveyör keyword, one sıkışma keyword
        assert_eq!(
            detect_category("bant üzerinde jam").as_deref(),
            Some("konveyör")
        );
    }

    #[test]
    fn no_keywords_no_category() {
        assert_eq!(detect_category("merhaba, nasılsınız"), None);
    }

    #[test]
    fn split_handles_parenthesis_markers() {
        assert_eq!(
            extract_steps("1) Gücü kes 2) Rulmanı değiştir"),
            Some(vec!["Gücü kes".to_string(), "Rulmanı değiştir".to_string()])
        );
    }

    #[test]
    fn numbered_list_keeps_order() {
        assert_eq!(
            extract_steps("1. A\n2. B\n3. C"),
            Some(vec!["A".to_string(), "B".to_string(), "C".to_string()])
        );
    }

    #[test]
    fn bullets_when_nothing_is_numbered() {
        assert_eq!(
            extract_steps("- Sensörü temizle\n- Kabloyu kontrol et"),
            Some(vec!["Sensörü temizle".to_string(), "Kabloyu kontrol et".to_string()])
        );
    }

    #[test]
    fn single_item_is_not_a_list() {
        assert_eq!(extract_steps("1. Only one"), None);
        assert_eq!(extract_steps("• tek adım"), None);
        assert_eq!(extract_steps("Sigortayı değiştir"), None);
    }

    #[test]
    fn resolver_prefers_later_half() {
        let messages = vec![
            msg("U1", "a"),
            msg("U1", "b"),
            msg("U1", "c"),
            msg("U2", "d"),
            msg("U2", "e"),
            msg("U1", "f"),
        ];
        // later half: U2, U2, U1
        assert_eq!(identify_resolver(&messages).as_deref(), Some("U2"));
        assert_eq!(identify_resolver(&[]), None);
    }
}
