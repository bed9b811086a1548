//! Error-report detection for inbound chat messages.
//!
//! Matchers come from the `error_patterns` table. A message is an error report
//! when any active matcher hits; the hit with the highest priority names the
//! pattern and category.

use crate::database::PatternSeed;
use crate::models::{ErrorPattern, Severity};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CRITICAL_MARKERS: [&str; 4] = ["acil", "kritik", "durdu", "üretim"];
const HIGH_MARKERS: [&str; 2] = ["önemli", "hata"];

/// Matchers written to an empty `error_patterns` table at startup.
pub const DEFAULT_PATTERNS: &[PatternSeed] = &[
    PatternSeed {
        name: "tagged-report",
        pattern_regex: Some(r"\[(?:DESTEK|HATA|ERROR|ARIZA)\]"),
        pattern_keywords: &[],
        category: None,
        severity: Severity::High,
        priority: 100,
        description: "Message carries an explicit support tag",
    },
    PatternSeed {
        name: "line-stopped",
        pattern_regex: None,
        pattern_keywords: &["durdu", "stopped"],
        category: None,
        severity: Severity::Critical,
        priority: 90,
        description: "A machine or line has stopped",
    },
    PatternSeed {
        name: "jam",
        pattern_regex: None,
        pattern_keywords: &["sıkışma", "tıkanma", "jam"],
        category: Some("sıkışma"),
        severity: Severity::High,
        priority: 70,
        description: "Material jam or blockage",
    },
    PatternSeed {
        name: "malfunction",
        pattern_regex: None,
        pattern_keywords: &["arıza"],
        category: None,
        severity: Severity::Medium,
        priority: 60,
        description: "Generic malfunction report",
    },
    PatternSeed {
        name: "not-working",
        pattern_regex: Some(r"hata\s+alıyoruz|çalışmıyor"),
        pattern_keywords: &[],
        category: None,
        severity: Severity::Medium,
        priority: 50,
        description: "Something is not working or keeps failing",
    },
    PatternSeed {
        name: "problem",
        pattern_regex: None,
        pattern_keywords: &["problem"],
        category: None,
        severity: Severity::Medium,
        priority: 10,
        description: "Loosely worded problem report",
    },
];

/// Outcome of classifying one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub is_error: bool,
    pub pattern: Option<String>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    /// Whether the winning matcher allows a proactive suggestion.
    pub auto_suggest: bool,
}

struct CompiledPattern {
    name: String,
    regex: Option<Regex>,
    keywords: Vec<String>,
    category: Option<String>,
    severity: Severity,
    auto_suggest: bool,
}

impl CompiledPattern {
    fn matches(&self, text: &str, lower: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(text))
            || self.keywords.iter().any(|kw| lower.contains(kw.as_str()))
    }
}

pub struct ErrorClassifier {
    patterns: Vec<CompiledPattern>,
}

impl ErrorClassifier {
    /// Compiles active matchers, highest priority first. A matcher whose regex
    /// does not compile keeps only its keywords.
    pub fn new(patterns: &[ErrorPattern]) -> Self {
        let mut active: Vec<&ErrorPattern> = patterns.iter().filter(|p| p.is_active).collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority));

        let patterns = active
            .into_iter()
            .map(|p| CompiledPattern {
                name: p.name.clone(),
                regex: p.pattern_regex.as_deref().and_then(|raw| {
                    RegexBuilder::new(raw)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| warn!(pattern = %p.name, error = %e, "Skipping invalid regex"))
                        .ok()
                }),
                keywords: p.pattern_keywords.0.iter().map(|k| k.to_lowercase()).collect(),
                category: p.category.clone(),
                severity: p.severity,
                auto_suggest: p.auto_suggest,
            })
            .collect();

        Self { patterns }
    }

    pub fn classify(&self, text: &str) -> Classification {
        let lower = text.to_lowercase();
        match self.patterns.iter().find(|p| p.matches(text, &lower)) {
            Some(hit) => Classification {
                is_error: true,
                pattern: Some(hit.name.clone()),
                category: hit.category.clone(),
                severity: Some(severity_for(&lower, hit.severity)),
                auto_suggest: hit.auto_suggest,
            },
            None => Classification::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Urgency words override the matcher's default severity.
pub fn severity_for(lower_text: &str, fallback: Severity) -> Severity {
    if CRITICAL_MARKERS.iter().any(|m| lower_text.contains(m)) {
        Severity::Critical
    } else if HIGH_MARKERS.iter().any(|m| lower_text.contains(m)) {
        Severity::High
    } else {
        fallback
    }
}
