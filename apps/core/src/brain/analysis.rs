//! Thread analysis: the prompt sent to the generation oracle and the parser for its reply.
//!
//! The oracle answers with one `KEY: value` line per field. Values may continue on
//! the following lines until the next key, which keeps numbered solution steps intact.

use crate::models::ThreadMessage;
use serde::{Deserialize, Serialize};

pub const ANALYSIS_SYSTEM_PROMPT: &str = "You analyse technical support conversations from a \
production floor chat. Identify the main fault, its root cause, the remedy that was applied and \
whether it worked. Answer in the language of the conversation and keep the requested format exactly.";

const FIELD_KEYS: [&str; 6] = [
    "ERROR_SUMMARY",
    "ROOT_CAUSE",
    "SOLUTION",
    "MACHINE_TYPE",
    "CATEGORY",
    "SUCCESSFUL",
];

const ABSENT_VALUES: [&str; 6] = ["", "-", "n/a", "none", "yok", "null"];

/// Structured reading of a support thread produced by the generation oracle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub error_summary: Option<String>,
    pub root_cause: Option<String>,
    pub solution: Option<String>,
    pub machine_type: Option<String>,
    pub category: Option<String>,
    /// `None` when the oracle did not say.
    pub successful: Option<bool>,
}

impl ConversationAnalysis {
    /// Parses a `KEY: value` reply. Unknown lines before the first key are ignored.
    pub fn parse(response: &str) -> Self {
        let mut analysis = ConversationAnalysis::default();
        let mut current: Option<(&'static str, String)> = None;

        for raw_line in response.lines() {
            let line = raw_line.trim();
            match split_key(line) {
                Some((key, value)) => {
                    if let Some((prev_key, prev_value)) = current.take() {
                        analysis.assign(prev_key, prev_value);
                    }
                    current = Some((key, value.to_string()));
                }
                None => {
                    if let Some((_, value)) = current.as_mut() {
                        if !line.is_empty() {
                            value.push('\n');
                            value.push_str(line);
                        }
                    }
                }
            }
        }
        if let Some((key, value)) = current {
            analysis.assign(key, value);
        }

        analysis
    }

    /// An extraction needs both a fault description and a remedy.
    pub fn is_sufficient(&self) -> bool {
        self.error_summary.is_some() && self.solution.is_some()
    }

    fn assign(&mut self, key: &str, value: String) {
        let value = value.trim();
        match key {
            "SUCCESSFUL" => self.successful = parse_flag(value),
            _ => {
                let value = present(value);
                match key {
                    "ERROR_SUMMARY" => self.error_summary = value,
                    "ROOT_CAUSE" => self.root_cause = value,
                    "SOLUTION" => self.solution = value,
                    "MACHINE_TYPE" => self.machine_type = value,
                    "CATEGORY" => self.category = value.map(|c| c.to_lowercase()),
                    _ => {}
                }
            }
        }
    }
}

fn split_key(line: &str) -> Option<(&'static str, &str)> {
    let line = line.trim_start_matches(['-', '*', ' ']);
    let (head, rest) = line.split_once(':')?;
    let head = head.trim().to_uppercase().replace(' ', "_");
    FIELD_KEYS
        .iter()
        .find(|key| **key == head)
        .map(|key| (*key, rest.trim()))
}

fn present(value: &str) -> Option<String> {
    if ABSENT_VALUES.contains(&value.to_lowercase().as_str()) {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "evet" | "true" | "1" => Some(true),
        "no" | "hayır" | "hayir" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Renders the thread as `[author]: text` blocks followed by the answer template.
pub fn build_analysis_prompt(messages: &[ThreadMessage]) -> String {
    let mut conversation = String::new();
    for message in messages {
        conversation.push_str(&format!("[{}]: {}\n\n", message.author_id, message.text));
    }

    format!(
        "Analyse the following support conversation and extract the problem and its solution:\n\n\
         {conversation}\
         Reply in exactly this format:\n\
         ERROR_SUMMARY: <one sentence>\n\
         ROOT_CAUSE: <cause, or none>\n\
         SOLUTION: <what fixed it; numbered steps if there were several>\n\
         MACHINE_TYPE: <machine code if mentioned, or none>\n\
         CATEGORY: <category name, or none>\n\
         SUCCESSFUL: <yes/no>"
    )
}
