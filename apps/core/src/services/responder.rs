use crate::brain::text::{ellipsize, truncate_chars};
use crate::error::AppError;
use crate::oracles::traits::{Generator, MetadataFilter};
use crate::services::retrieval::{RetrievalEngine, RetrievedSolution, CONTEXT_CHARS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const ANSWER_SYSTEM_PROMPT: &str = "You are a technical support assistant for a production \
floor. Help technicians by summarising past solutions to machine faults. Be clear and concrete, \
give step-by-step guidance, keep important technical details and highlight safety warnings. If \
the past solutions do not cover the question, say so and suggest what to check next. Answer in \
the language of the question.";

pub const PROACTIVE_SYSTEM_PROMPT: &str = "You are a proactive technical support assistant. When \
a new fault is reported you help straight away by pointing to past solutions. Be friendly, refer \
to the earlier case, suggest the likely fix and say when you are unsure. Answer in the language \
of the report.";

/// How many retrieved solutions a proactive message may cite.
const PROACTIVE_SOURCES: usize = 2;
const PROACTIVE_RESULTS: usize = 3;

/// A retrieved solution as shown to the asker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub similarity: f32,
    pub error_pattern: String,
    pub solution_preview: String,
    pub category: Option<String>,
    pub machine_type: Option<String>,
}

impl From<&RetrievedSolution> for SourceRef {
    fn from(result: &RetrievedSolution) -> Self {
        Self {
            id: result.id.clone(),
            similarity: result.similarity,
            error_pattern: result.metadata.error_pattern.clone(),
            solution_preview: result.metadata.solution_preview.clone(),
            category: result.metadata.category.clone(),
            machine_type: result.metadata.machine_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    /// Mean similarity of the sources; 0 without sources.
    pub confidence: f32,
    pub has_solutions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub message: String,
    pub sources: Vec<SourceRef>,
    pub confidence: f32,
}

pub fn confidence(results: &[RetrievedSolution]) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.similarity).sum::<f32>() / results.len() as f32
}

pub fn build_answer_prompt(
    query: &str,
    results: &[RetrievedSolution],
    context: Option<&str>,
) -> String {
    let mut solutions = String::new();
    for (i, result) in results.iter().enumerate() {
        solutions.push_str(&format!(
            "\n--- Solution {} (similarity {:.0}%) ---\nError: {}\nSolution: {}\n",
            i + 1,
            result.similarity * 100.0,
            result.metadata.error_pattern,
            if result.metadata.solution_preview.is_empty() {
                result.document.as_str()
            } else {
                result.metadata.solution_preview.as_str()
            }
        ));
    }
    if solutions.is_empty() {
        solutions.push_str("No stored solution matched.");
    }

    let context = context
        .filter(|c| !c.trim().is_empty())
        .map(|c| format!("\nConversation context: {}\n", truncate_chars(c, CONTEXT_CHARS)))
        .unwrap_or_default();

    format!(
        "Question: {query}\n\nPast solutions found:\n{solutions}\n{context}\n\
         Using this information, help the user. Summarise the matching solution if there is one; \
         otherwise suggest alternatives."
    )
}

pub fn build_proactive_prompt(error_text: &str, results: &[RetrievedSolution]) -> String {
    let mut solutions = String::new();
    for (i, result) in results.iter().take(PROACTIVE_SOURCES).enumerate() {
        solutions.push_str(&format!(
            "\n{}. (similarity {:.0}%)\n   Error: {}\n   Solution: {}\n",
            i + 1,
            result.similarity * 100.0,
            truncate_chars(&result.metadata.error_pattern, 150),
            truncate_chars(&result.metadata.solution_preview, 200)
        ));
    }

    format!(
        "A new fault was reported:\n\"{error_text}\"\n\nSimilar past solutions:\n{solutions}\n\
         Write a short, helpful message that refers to the earlier case and proposes the likely \
         fix. Use 2-3 sentences at most."
    )
}

/// Answer text assembled without the generation oracle.
pub fn fallback_answer(results: &[RetrievedSolution]) -> String {
    if results.is_empty() {
        return "No similar solution was found in the knowledge base.".to_string();
    }

    let mut text = String::from("Similar past solutions:\n");
    for (i, result) in results.iter().enumerate() {
        text.push_str(&format!(
            "\n{}. {} ({:.0}% match)\n   {}\n",
            i + 1,
            result.metadata.error_pattern,
            result.similarity * 100.0,
            ellipsize(&result.metadata.solution_preview, 300)
        ));
    }
    text
}

/// Composes retrieval and generation into answers and proactive suggestions.
pub struct ResponseOrchestrator {
    retrieval: Arc<RetrievalEngine>,
    generator: Arc<dyn Generator>,
    max_results: usize,
    answer_threshold: f32,
}

impl ResponseOrchestrator {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        generator: Arc<dyn Generator>,
        max_results: usize,
        answer_threshold: f32,
    ) -> Self {
        Self {
            retrieval,
            generator,
            max_results,
            answer_threshold,
        }
    }

    pub fn retrieval(&self) -> &Arc<RetrievalEngine> {
        &self.retrieval
    }

    /// Never fails: a retrieval outage answers from nothing, a generation outage
    /// lists the sources verbatim.
    #[instrument(skip(self, query, context), fields(query_chars = query.len()))]
    pub async fn answer(&self, query: &str, context: Option<&str>) -> Answer {
        let retrieved = match context.filter(|c| !c.trim().is_empty()) {
            // Context dilutes the query vector, so this relaxes the base threshold
            // (not `answer_threshold`) by the context ratio. It can end up stricter
            // than a plain answer.
            Some(context) => {
                self.retrieval
                    .retrieve_with_context(query, context, self.max_results, None)
                    .await
            }
            None => {
                self.retrieval
                    .retrieve(query, self.max_results, self.answer_threshold, None)
                    .await
            }
        };
        let results = retrieved.unwrap_or_else(|e| {
            warn!(error = %e, "Retrieval failed, answering without sources");
            Vec::new()
        });

        let confidence = confidence(&results);
        let prompt = build_answer_prompt(query, &results, context);
        let answer_text = match self.generator.generate(ANSWER_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Generation failed, falling back to source list");
                fallback_answer(&results)
            }
        };

        info!(
            sources = results.len(),
            confidence,
            "Answer composed"
        );
        Answer {
            answer_text,
            sources: results.iter().map(SourceRef::from).collect(),
            confidence,
            has_solutions: !results.is_empty(),
        }
    }

    /// A short unsolicited message for a fresh error report.
    ///
    /// `Ok(None)` means nothing cleared the similarity floor; callers route to
    /// experts instead.
    #[instrument(skip(self, error_text))]
    pub async fn suggest(
        &self,
        error_text: &str,
        machine_type: Option<&str>,
    ) -> Result<Option<Suggestion>, AppError> {
        let filter = MetadataFilter {
            category: None,
            machine_type: machine_type.map(String::from),
        };
        let results = self
            .retrieval
            .retrieve(
                error_text,
                PROACTIVE_RESULTS,
                self.retrieval.similarity_threshold(),
                Some(&filter),
            )
            .await?;

        if results.is_empty() {
            return Ok(None);
        }

        let prompt = build_proactive_prompt(error_text, &results);
        let message = match self.generator.generate(PROACTIVE_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Generation failed, suggesting the top source as is");
                fallback_answer(&results[..1])
            }
        };

        Ok(Some(Suggestion {
            message,
            confidence: confidence(&results),
            sources: results.iter().map(SourceRef::from).collect(),
        }))
    }
}
