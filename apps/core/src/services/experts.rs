use crate::brain::extractor::{detect_category, detect_machine_type};
use crate::database;
use crate::error::AppError;
use crate::models::Expert;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

const LISTED_AREAS: usize = 2;

/// Appends experts not already present.
fn extend_unique(selected: &mut Vec<Expert>, candidates: Vec<Expert>) {
    for candidate in candidates {
        if !selected.iter().any(|e| e.user_id == candidate.user_id) {
            selected.push(candidate);
        }
    }
}

/// Picks people to ask when the knowledge base has nothing.
pub struct ExpertRouter {
    pool: SqlitePool,
}

impl ExpertRouter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Machine matches first, then category matches, then the overall top
    /// solvers; each tier by solution count, duplicates dropped, cut to `limit`.
    ///
    /// Machine and category are detected from `query` when not given.
    #[instrument(skip(self, query))]
    pub async fn find_experts(
        &self,
        query: &str,
        machine_type: Option<&str>,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Expert>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let machine_type = machine_type
            .map(String::from)
            .or_else(|| detect_machine_type(query));
        let category = category.map(String::from).or_else(|| detect_category(query));
        let mut selected: Vec<Expert> = Vec::new();

        if let Some(machine_type) = &machine_type {
            let matches =
                database::available_experts_for_machine(&self.pool, machine_type, limit as i64)
                    .await?;
            extend_unique(&mut selected, matches);
        }

        if selected.len() < limit {
            if let Some(category) = &category {
                let fetch = (limit + selected.len()) as i64;
                let matches =
                    database::available_experts_for_category(&self.pool, category, fetch).await?;
                extend_unique(&mut selected, matches);
            }
        }

        if selected.len() < limit {
            let fetch = (limit + selected.len()) as i64;
            extend_unique(&mut selected, database::top_experts(&self.pool, fetch).await?);
        }

        selected.truncate(limit);
        debug!(
            count = selected.len(),
            machine_type = ?machine_type,
            category = ?category,
            "Experts resolved"
        );
        Ok(selected)
    }
}

/// Chat message listing experts, or `None` when there is nobody to list.
pub fn format_expert_suggestion(experts: &[Expert]) -> Option<String> {
    if experts.is_empty() {
        return None;
    }

    let mut message = String::from("Team members with experience on this:\n\n");
    for expert in experts {
        message.push_str(&format!("• <@{}>", expert.user_id));

        let mut details = Vec::new();
        if !expert.expertise_areas.0.is_empty() {
            let areas: Vec<&str> = expert
                .expertise_areas
                .0
                .iter()
                .take(LISTED_AREAS)
                .map(String::as_str)
                .collect();
            details.push(format!("expertise: {}", areas.join(", ")));
        }
        if expert.solution_count > 0 {
            details.push(format!("{} solutions", expert.solution_count));
        }
        if !details.is_empty() {
            message.push_str(&format!(" ({})", details.join(", ")));
        }
        message.push('\n');
    }
    message.push_str("\nThey may be able to help.");
    Some(message)
}
