//! Retrieval, Response and Expert Routing Tests
//!
//! Real database, in-memory index, bag-of-words embeddings.

use super::fakes::{test_db, FakeEmbedder, ScriptedGenerator, TestDb};
use crate::database;
use crate::models::{Expert, NewSolution, Solution};
use crate::oracles::memory::MemoryIndex;
use crate::oracles::traits::{Generator, MetadataFilter};
use crate::services::experts::ExpertRouter;
use crate::services::responder::ResponseOrchestrator;
use crate::services::retrieval::RetrievalEngine;
use std::sync::Arc;

fn engine(threshold: f32) -> Arc<RetrievalEngine> {
    Arc::new(RetrievalEngine::new(
        Arc::new(FakeEmbedder::default()),
        Arc::new(MemoryIndex::new()),
        threshold,
        0.8,
    ))
}

async fn store(
    db: &TestDb,
    retrieval: &RetrievalEngine,
    pattern: &str,
    remedy: &str,
    machine_type: Option<&str>,
) -> Solution {
    let new = NewSolution {
        error_pattern: pattern.to_string(),
        category: None,
        keywords: Vec::new(),
        summary: pattern.to_string(),
        full_text: remedy.to_string(),
        steps: None,
        root_cause: None,
        source_channel_id: None,
        source_thread_id: None,
        source_link: None,
        created_by: None,
        machine_type: machine_type.map(String::from),
    };
    let solution = database::insert_solution(&db.pool, &new, 1).await.unwrap();
    retrieval.reindex_solution(&solution).await.unwrap();
    solution
}

#[cfg(test)]
mod retrieval_engine_tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let retrieval = engine(0.0);
        let results = retrieval.retrieve("A1100 jam", 3, 0.0, None).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_nearest_first_above_threshold() {
        let db = test_db().await;
        let retrieval = engine(0.5);
        let jam = store(&db, &retrieval, "A1100 - Paper jam", "Lower the conveyor speed", Some("A1100")).await;
        store(&db, &retrieval, "HMI password reset", "Use the service menu", None).await;

        let results = retrieval
            .retrieve("A1100 paper jam", 5, 0.5, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, jam.id);
        assert!(results[0].similarity >= 0.5 && results[0].similarity <= 1.0 + 1e-6);
        assert_eq!(results[0].metadata.machine_type.as_deref(), Some("A1100"));

        let loose = retrieval.retrieve("A1100 paper jam", 5, 0.0, None).await.unwrap();
        assert_eq!(loose.len(), 2);
        assert!(loose[0].similarity >= loose[1].similarity);
    }

    #[tokio::test]
    async fn test_machine_filter_is_exact() {
        let db = test_db().await;
        let retrieval = engine(0.0);
        store(&db, &retrieval, "A1100 - Paper jam", "Lower the conveyor speed", Some("A1100")).await;
        let b200 = store(&db, &retrieval, "B200 - Paper jam", "Clean the rollers", Some("B200")).await;

        let filter = MetadataFilter {
            category: None,
            machine_type: Some("B200".to_string()),
        };
        let results = retrieval
            .retrieve("paper jam", 5, 0.0, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, b200.id);

        let by_pattern = retrieval
            .retrieve_by_error_pattern("Paper jam", Some("B200"))
            .await
            .unwrap();
        assert!(by_pattern.iter().all(|r| r.id == b200.id));
    }

    #[tokio::test]
    async fn test_reindex_replaces_and_remove_deletes() {
        let db = test_db().await;
        let retrieval = engine(0.0);
        let solution = store(&db, &retrieval, "A1100 - Paper jam", "Lower the conveyor speed", None).await;

        retrieval.reindex_solution(&solution).await.unwrap();
        assert_eq!(retrieval.indexed_count().await.unwrap(), 1);

        retrieval.remove_solution(&solution.id).await.unwrap();
        retrieval.remove_solution(&solution.id).await.unwrap();
        assert_eq!(retrieval.indexed_count().await.unwrap(), 0);
    }
}

#[cfg(test)]
mod responder_tests {
    use super::*;

    #[tokio::test]
    async fn test_answer_cites_matching_solution() {
        let db = test_db().await;
        let retrieval = engine(0.75);
        let jam = store(&db, &retrieval, "A1100 - Paper jam at the infeed", "Lower the conveyor speed", Some("A1100")).await;
        let generator = Arc::new(ScriptedGenerator::new(|_, user| {
            assert!(user.contains("--- Solution 1"));
            Ok("Lower the conveyor speed.".to_string())
        }));
        let responder = ResponseOrchestrator::new(retrieval, generator, 3, 0.4);

        let answer = responder.answer("A1100 paper jam at the infeed", None).await;
        assert!(answer.has_solutions);
        assert_eq!(answer.answer_text, "Lower the conveyor speed.");
        assert_eq!(answer.sources[0].id, jam.id);
        assert!(answer.confidence > 0.4);
    }

    #[tokio::test]
    async fn test_answer_without_matches_still_answers() {
        let responder = ResponseOrchestrator::new(
            engine(0.75),
            Arc::new(ScriptedGenerator::new(|_, user| {
                assert!(user.contains("No stored solution matched."));
                Ok("Check the power supply first.".to_string())
            })),
            3,
            0.4,
        );

        let answer = responder.answer("Line 4 will not start", None).await;
        assert!(!answer.has_solutions);
        assert!(answer.sources.is_empty());
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(answer.answer_text, "Check the power supply first.");
    }

    #[tokio::test]
    async fn test_context_scales_the_base_threshold() {
        let db = test_db().await;
        // base 0.75, so 0.6 once scaled by the 0.8 context ratio
        let retrieval = engine(0.75);
        store(&db, &retrieval, "A1100 - Paper jam at the infeed", "Lower the conveyor speed", Some("A1100")).await;
        let responder = ResponseOrchestrator::new(
            retrieval,
            Arc::new(ScriptedGenerator::new(|_, _| Ok("Check the infeed.".to_string()))),
            3,
            0.4,
        );

        let plain = responder.answer("A1100 paper jam", None).await;
        assert!(plain.has_solutions);

        let with_context = responder.answer("A1100 paper jam", Some("Conveyor")).await;
        assert!(!with_context.has_solutions);
        assert!(with_context.sources.is_empty());
    }

    #[tokio::test]
    async fn test_generation_outage_falls_back_to_sources() {
        let db = test_db().await;
        let retrieval = engine(0.5);
        store(&db, &retrieval, "A1100 - Paper jam at the infeed", "Lower the conveyor speed", Some("A1100")).await;
        let generator: Arc<dyn Generator> = Arc::new(ScriptedGenerator::failing());
        let responder = ResponseOrchestrator::new(retrieval, generator, 3, 0.4);

        let answer = responder.answer("A1100 paper jam at the infeed", None).await;
        assert!(answer.has_solutions);
        assert!(answer.answer_text.contains("A1100 - Paper jam at the infeed"));

        let suggestion = responder
            .suggest("A1100 paper jam at the infeed", Some("A1100"))
            .await
            .unwrap()
            .expect("Expected a suggestion");
        assert!(suggestion.message.contains("Lower the conveyor speed"));
    }

    #[tokio::test]
    async fn test_suggest_respects_machine_and_threshold() {
        let db = test_db().await;
        let retrieval = engine(0.5);
        store(&db, &retrieval, "A1100 - Paper jam at the infeed", "Lower the conveyor speed", Some("A1100")).await;
        let responder = ResponseOrchestrator::new(
            retrieval,
            Arc::new(ScriptedGenerator::new(|_, _| Ok("Try lowering the speed.".to_string()))),
            3,
            0.4,
        );

        let hit = responder
            .suggest("A1100 paper jam at the infeed", Some("A1100"))
            .await
            .unwrap();
        assert_eq!(hit.map(|s| s.message), Some("Try lowering the speed.".to_string()));

        let other_machine = responder
            .suggest("B200 paper jam at the infeed", Some("B200"))
            .await
            .unwrap();
        assert!(other_machine.is_none());

        let unrelated = responder
            .suggest("HMI password expired", None)
            .await
            .unwrap();
        assert!(unrelated.is_none());
    }
}

#[cfg(test)]
mod expert_router_tests {
    use super::*;

    async fn seed(db: &TestDb, user: &str, machine: &str, category: &str, solved: i64) {
        let mut expert = Expert::new(user, 1);
        for _ in 0..solved {
            expert.absorb_solution(Some(category), Some(machine), 1);
        }
        database::save_expert(&db.pool, &expert).await.unwrap();
    }

    async fn seeded() -> TestDb {
        let db = test_db().await;
        seed(&db, "M1", "A1100", "motor", 5).await;
        seed(&db, "M2", "A1100", "sıkışma", 4).await;
        seed(&db, "C1", "B200", "motor", 9).await;
        seed(&db, "C2", "B200", "motor", 2).await;
        db
    }

    fn ids(experts: &[Expert]) -> Vec<&str> {
        experts.iter().map(|e| e.user_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_machine_tier_comes_first() {
        let db = seeded().await;
        let router = ExpertRouter::new(db.pool.clone());

        let experts = router
            .find_experts("anything", Some("A1100"), Some("motor"), 3)
            .await
            .unwrap();
        // two machine matches leave room for exactly one category match
        assert_eq!(ids(&experts), vec!["M1", "M2", "C1"]);
    }

    #[tokio::test]
    async fn test_machine_is_detected_from_the_query() {
        let db = seeded().await;
        let router = ExpertRouter::new(db.pool.clone());

        let experts = router
            .find_experts("B200 keeps stopping", None, None, 2)
            .await
            .unwrap();
        assert_eq!(ids(&experts), vec!["C1", "C2"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_top_solvers() {
        let db = seeded().await;
        let router = ExpertRouter::new(db.pool.clone());

        let experts = router.find_experts("hello", None, None, 2).await.unwrap();
        assert_eq!(ids(&experts), vec!["C1", "M1"]);

        database::set_expert_availability(&db.pool, "C1", false, 2)
            .await
            .unwrap();
        let experts = router.find_experts("hello", None, None, 10).await.unwrap();
        assert_eq!(ids(&experts), vec!["M1", "M2", "C2"]);
        assert!(router.find_experts("hello", None, None, 0).await.unwrap().is_empty());
    }
}
