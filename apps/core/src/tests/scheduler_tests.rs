//! Learning Scheduler Tests
//!
//! Batch selection, per-conversation isolation, all-or-nothing extraction and
//! the single-flight guarantee of the scheduler actor.

use super::fakes::{
    jam_thread, message, now, test_db, FakeEmbedder, FlakyIndex, ScriptedGenerator,
    StaticThreadSource, TestDb, JAM_ANALYSIS,
};
use crate::actors::scheduler::{run_batch, SchedulerConfig, SchedulerHandle};
use crate::database;
use crate::models::{Conversation, MessageObservation, Severity};
use crate::oracles::memory::MemoryIndex;
use crate::oracles::traits::{Generator, VectorIndex};
use crate::services::learning::{LearningPipeline, ProcessOutcome};
use crate::services::retrieval::RetrievalEngine;
use crate::services::tracker::ConversationTracker;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const DELAY: i64 = 12 * 3600;

struct Harness {
    db: TestDb,
    tracker: ConversationTracker,
    pipeline: Arc<LearningPipeline>,
    retrieval: Arc<RetrievalEngine>,
}

fn harness_with(
    db: TestDb,
    source: Arc<StaticThreadSource>,
    generator: Arc<dyn Generator>,
    index: Arc<dyn VectorIndex>,
) -> Harness {
    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::new(FakeEmbedder::default()),
        index,
        0.5,
        0.8,
    ));
    let pipeline = Arc::new(LearningPipeline::new(
        db.pool.clone(),
        source,
        generator,
        Arc::clone(&retrieval),
        Some("https://acme.slack.com".to_string()),
    ));
    Harness {
        tracker: ConversationTracker::new(db.pool.clone(), DELAY),
        db,
        pipeline,
        retrieval,
    }
}

async fn harness(source: Arc<StaticThreadSource>, generator: Arc<dyn Generator>) -> Harness {
    harness_with(test_db().await, source, generator, Arc::new(MemoryIndex::new()))
}

/// Records an error report old enough to be due now.
async fn due_report(h: &Harness, channel_id: &str, thread_id: &str, age_secs: i64) -> Conversation {
    h.tracker
        .record_message(
            channel_id,
            thread_id,
            MessageObservation {
                message_time: now() - age_secs,
                is_candidate_error: true,
                detected_pattern: Some("jam".to_string()),
                severity: Some(Severity::High),
            },
        )
        .await
        .expect("Failed to record")
}

fn jam_generator() -> Arc<ScriptedGenerator> {
    Arc::new(ScriptedGenerator::analysing(JAM_ANALYSIS, "unused"))
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_secs(3600),
        cleanup_interval: Duration::from_secs(86_400),
        batch_size: 50,
        concurrency: 2,
        stale_after_secs: 30 * 86_400,
    }
}

#[tokio::test]
async fn test_due_thread_is_extracted_and_closed() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "1700000000.000100", jam_thread(now() - 3 * DELAY));
    let h = harness(Arc::clone(&source), jam_generator()).await;
    let conversation = due_report(&h, "C1", "1700000000.000100", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.selected, 1);
    assert_eq!(report.extracted, 1);

    let closed = h.tracker.get("C1", "1700000000.000100").await.unwrap().unwrap();
    assert!(closed.is_processed);
    assert_eq!(closed.is_resolved, Some(true));
    let solution_id = closed.extracted_solution_id.expect("Solution id not recorded");
    assert_eq!(closed.id, conversation.id);

    let solution = database::get_solution(&h.db.pool, &solution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(solution.error_pattern, "A1100 - Paper jam at the infeed");
    assert_eq!(solution.created_by.as_deref(), Some("U2"));
    assert_eq!(
        solution.source_link.as_deref(),
        Some("https://acme.slack.com/archives/C1/p1700000000000100")
    );

    let expert = database::get_expert(&h.db.pool, "U2").await.unwrap().unwrap();
    assert_eq!(expert.solution_count, 1);
    assert!(expert.handles_machine("A1100"));
    assert_eq!(h.retrieval.indexed_count().await.unwrap(), 1);

    // nothing left to do
    let again = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(again.selected, 0);
}

#[tokio::test]
async fn test_short_thread_closes_unresolved_without_generation() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", vec![message("U1", "A1100 jam", now() - 3 * DELAY)]);
    let generator = jam_generator();
    let h = harness(Arc::clone(&source), generator.clone()).await;
    due_report(&h, "C1", "t1", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.unresolved, 1);
    assert_eq!(generator.call_count(), 0);

    let closed = h.tracker.get("C1", "t1").await.unwrap().unwrap();
    assert!(closed.is_processed);
    assert_eq!(closed.is_resolved, Some(false));
    assert!(closed.extracted_solution_id.is_none());
    assert_eq!(database::count_solutions(&h.db.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unusable_analysis_closes_unresolved() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok("Sorry, I cannot tell what happened here.".to_string())
    }));
    let h = harness(source, generator).await;
    due_report(&h, "C1", "t1", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.unresolved, 1);
    assert_eq!(database::count_solutions(&h.db.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_one_failing_thread_does_not_abort_the_batch() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "good", jam_thread(now() - 3 * DELAY));
    source.insert("C1", "bad", jam_thread(now() - 3 * DELAY));
    source.fail("C1", "bad");
    let h = harness(Arc::clone(&source), jam_generator()).await;
    due_report(&h, "C1", "bad", 3 * DELAY).await;
    due_report(&h, "C1", "good", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.selected, 2);
    assert_eq!(report.extracted, 1);
    assert_eq!(report.failed, 1);

    let bad = h.tracker.get("C1", "bad").await.unwrap().unwrap();
    assert!(!bad.is_processed);
    let still_due = database::list_due_conversations(&h.db.pool, now(), 50)
        .await
        .unwrap();
    assert_eq!(still_due.len(), 1);
    assert_eq!(still_due[0].thread_id, "bad");
}

#[tokio::test]
async fn test_generation_outage_leaves_thread_eligible() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let h = harness(source, Arc::new(ScriptedGenerator::failing())).await;
    due_report(&h, "C1", "t1", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.failed, 1);
    assert!(!h.tracker.get("C1", "t1").await.unwrap().unwrap().is_processed);
}

#[tokio::test]
async fn test_index_failure_rolls_back_the_whole_extraction() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let index = Arc::new(FlakyIndex::failing());
    let h = harness_with(
        test_db().await,
        source,
        jam_generator(),
        Arc::clone(&index) as Arc<dyn VectorIndex>,
    );
    due_report(&h, "C1", "t1", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(report.failed, 1);
    assert!(!h.tracker.get("C1", "t1").await.unwrap().unwrap().is_processed);
    assert_eq!(database::count_solutions(&h.db.pool).await.unwrap(), 0);
    assert!(database::get_expert(&h.db.pool, "U2").await.unwrap().is_none());

    index.heal();
    let retry = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(false)).await;
    assert_eq!(retry.extracted, 1);
    assert_eq!(database::count_solutions(&h.db.pool).await.unwrap(), 1);
    assert_eq!(h.retrieval.indexed_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_stopping_batch_starts_nothing() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let h = harness(Arc::clone(&source), jam_generator()).await;
    due_report(&h, "C1", "t1", 2 * DELAY).await;

    let report = run_batch(&h.pipeline, 50, 2, &AtomicBool::new(true)).await;
    assert_eq!(report.selected, 1);
    assert_eq!(report.cancelled, 1);
    assert_eq!(source.fetch_count(), 0);
}

#[tokio::test]
async fn test_processing_twice_is_a_no_op() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let h = harness(source, jam_generator()).await;
    let stale_copy = due_report(&h, "C1", "t1", 2 * DELAY).await;

    let first = h.pipeline.process(&stale_copy).await.unwrap();
    assert!(matches!(first, ProcessOutcome::Extracted(_)));

    // the caller still holds the unprocessed snapshot
    let second = h.pipeline.process(&stale_copy).await.unwrap();
    assert_eq!(second, ProcessOutcome::AlreadyProcessed);
    assert_eq!(database::count_solutions(&h.db.pool).await.unwrap(), 1);
    assert_eq!(h.retrieval.indexed_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_poll_never_overlaps_itself() {
    let source = Arc::new(StaticThreadSource::gated());
    source.insert("C1", "t1", jam_thread(now() - 3 * DELAY));
    let h = harness(Arc::clone(&source), jam_generator()).await;
    due_report(&h, "C1", "t1", 2 * DELAY).await;
    let scheduler = SchedulerHandle::spawn(Arc::clone(&h.pipeline), test_config());

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.poll_now().await })
    };
    timeout(Duration::from_secs(5), async {
        while source.fetch_count() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("First poll never reached the source");

    let second = scheduler.poll_now().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.selected, 0);

    source.release(10);
    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.extracted, 1);
    assert_eq!(source.fetch_count(), 1);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_force_process_ignores_the_deadline() {
    let source = Arc::new(StaticThreadSource::new());
    source.insert("C1", "t1", jam_thread(now() - 60));
    let h = harness(source, jam_generator()).await;
    // recent, so not due for another twelve hours
    due_report(&h, "C1", "t1", 60).await;
    assert!(database::list_due_conversations(&h.db.pool, now(), 50)
        .await
        .unwrap()
        .is_empty());
    let scheduler = SchedulerHandle::spawn(Arc::clone(&h.pipeline), test_config());

    let solution = scheduler
        .force_process("C1", "t1")
        .await
        .unwrap()
        .expect("Expected a solution");
    let again = scheduler.force_process("C1", "t1").await.unwrap();
    assert_eq!(again.map(|s| s.id), Some(solution.id));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_force_process_learns_an_untracked_thread() {
    let source = Arc::new(StaticThreadSource::new());
    // older than the deployment, never seen by the tracker
    source.insert("C1", "t9", jam_thread(now() - 400 * 86_400));
    let h = harness(source.clone(), jam_generator()).await;
    let scheduler = SchedulerHandle::spawn(Arc::clone(&h.pipeline), test_config());

    let solution = scheduler
        .force_process("C1", "t9")
        .await
        .unwrap()
        .expect("Expected a solution");
    assert_eq!(solution.machine_type.as_deref(), Some("A1100"));
    assert_eq!(source.fetch_count(), 1);

    let conversation = database::get_conversation(&h.db.pool, "C1", "t9")
        .await
        .unwrap()
        .expect("Thread not recorded");
    assert!(conversation.is_error_thread);
    assert!(conversation.is_processed);
    assert_eq!(conversation.message_count, 5);
    assert_eq!(conversation.extracted_solution_id, Some(solution.id.clone()));

    let again = scheduler.force_process("C1", "t9").await.unwrap();
    assert_eq!(again.map(|s| s.id), Some(solution.id));

    // nothing to fetch, nothing recorded
    assert!(scheduler.force_process("C1", "empty").await.unwrap().is_none());
    assert!(database::get_conversation(&h.db.pool, "C1", "empty")
        .await
        .unwrap()
        .is_none());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_errors_after_shutdown() {
    let h = harness(Arc::new(StaticThreadSource::new()), jam_generator()).await;
    let scheduler = SchedulerHandle::spawn(Arc::clone(&h.pipeline), test_config());

    let empty = scheduler.poll_now().await.unwrap();
    assert_eq!(empty.selected, 0);

    scheduler.shutdown().await.unwrap();
    assert!(scheduler.poll_now().await.is_err());
}
