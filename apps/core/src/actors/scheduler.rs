use crate::actors::messages::{PollReport, SchedulerMessage};
use crate::config::Settings;
use crate::database;
use crate::error::AppError;
use crate::models::Solution;
use crate::services::learning::{LearningPipeline, ProcessOutcome};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// "Run in progress" flag for a job that must never overlap itself.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    /// Claims the flag, or returns `None` when a run is already in progress.
    pub fn try_start(self: &Arc<Self>) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: Arc::clone(self),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the flag when dropped, including on panic.
pub struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    pub stale_after_secs: i64,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            batch_size: settings.learning_batch_size,
            concurrency: settings.learning_concurrency.max(1),
            stale_after_secs: settings.stale_conversation_days * 86_400,
        }
    }
}

/// A handle to the `SchedulerActor`.
///
/// The actor owns the learning timers. Cloning the handle is cheap; the actor
/// stops once `shutdown` has been answered or every handle is dropped.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub fn spawn(pipeline: Arc<LearningPipeline>, config: SchedulerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(32);
        let runner = SchedulerRunner::new(receiver, pipeline, config);
        tokio::spawn(async move { runner.run().await });
        Self { sender }
    }

    async fn send(&self, msg: SchedulerMessage) -> Result<(), AppError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| AppError::Internal("Scheduler actor closed".to_string()))
    }

    pub async fn poll_now(&self) -> Result<PollReport, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(SchedulerMessage::PollNow { responder: send }).await?;
        recv.await
            .map_err(|_| AppError::Internal("Scheduler actor failed to respond".to_string()))
    }

    /// Extracts one thread now through the same path as the timed poll.
    pub async fn force_process(
        &self,
        channel_id: &str,
        thread_id: &str,
    ) -> Result<Option<Solution>, AppError> {
        let (send, recv) = oneshot::channel();
        self.send(SchedulerMessage::ForceProcess {
            channel_id: channel_id.to_string(),
            thread_id: thread_id.to_string(),
            responder: send,
        })
        .await?;
        recv.await
            .map_err(|_| AppError::Internal("Scheduler actor failed to respond".to_string()))?
    }

    pub async fn shutdown(&self) -> Result<(), AppError> {
        let (send, recv) = oneshot::channel();
        self.send(SchedulerMessage::Shutdown { responder: send }).await?;
        recv.await
            .map_err(|_| AppError::Internal("Scheduler actor failed to respond".to_string()))
    }
}

// --- Actor Runner ---
struct SchedulerRunner {
    receiver: mpsc::Receiver<SchedulerMessage>,
    pipeline: Arc<LearningPipeline>,
    config: SchedulerConfig,
    poll_flight: Arc<SingleFlight>,
    cleanup_flight: Arc<SingleFlight>,
    stopping: Arc<AtomicBool>,
    tasks: JoinSet<()>,
}

impl SchedulerRunner {
    fn new(
        receiver: mpsc::Receiver<SchedulerMessage>,
        pipeline: Arc<LearningPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            receiver,
            pipeline,
            config,
            poll_flight: Arc::new(SingleFlight::default()),
            cleanup_flight: Arc::new(SingleFlight::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            tasks: JoinSet::new(),
        }
    }

    async fn run(mut self) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Scheduler started"
        );

        let mut poll = interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = interval_at(
            Instant::now() + self.config.cleanup_interval,
            self.config.cleanup_interval,
        );
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => self.start_poll(None),
                _ = cleanup.tick() => self.start_cleanup(),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Scheduler task panicked");
                    }
                }
                msg = self.receiver.recv() => match msg {
                    Some(SchedulerMessage::PollNow { responder }) => self.start_poll(Some(responder)),
                    Some(SchedulerMessage::ForceProcess { channel_id, thread_id, responder }) => {
                        let pipeline = Arc::clone(&self.pipeline);
                        self.tasks.spawn(async move {
                            let result = pipeline.force_process(&channel_id, &thread_id).await;
                            let _ = responder.send(result);
                        });
                    }
                    Some(SchedulerMessage::Shutdown { responder }) => {
                        self.drain().await;
                        let _ = responder.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
            }
        }

        info!("Scheduler stopped");
    }

    fn start_poll(&mut self, responder: Option<oneshot::Sender<PollReport>>) {
        let Some(guard) = self.poll_flight.try_start() else {
            debug!("Poll still running, tick coalesced");
            if let Some(responder) = responder {
                let _ = responder.send(PollReport::skipped());
            }
            return;
        };

        let pipeline = Arc::clone(&self.pipeline);
        let stopping = Arc::clone(&self.stopping);
        let batch_size = self.config.batch_size;
        let concurrency = self.config.concurrency;
        self.tasks.spawn(async move {
            let _guard = guard;
            let report = run_batch(&pipeline, batch_size, concurrency, &stopping).await;
            if let Some(responder) = responder {
                let _ = responder.send(report);
            }
        });
    }

    fn start_cleanup(&mut self) {
        let Some(guard) = self.cleanup_flight.try_start() else {
            debug!("Cleanup still running, tick coalesced");
            return;
        };

        let pool = self.pipeline.pool().clone();
        let stale_after_secs = self.config.stale_after_secs;
        self.tasks.spawn(async move {
            let _guard = guard;
            let cutoff = chrono::Utc::now().timestamp() - stale_after_secs;
            match database::delete_stale_conversations(&pool, cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Stale conversations removed"),
                Err(e) => warn!(error = %e, "Stale conversation cleanup failed"),
            }
        });
    }

    async fn drain(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.receiver.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Scheduler task panicked during shutdown");
            }
        }
    }
}

/// Processes every due conversation, each in isolation.
#[instrument(skip_all)]
pub async fn run_batch(
    pipeline: &LearningPipeline,
    batch_size: i64,
    concurrency: usize,
    stopping: &AtomicBool,
) -> PollReport {
    let now = chrono::Utc::now().timestamp();
    let due = match database::list_due_conversations(pipeline.pool(), now, batch_size).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Could not list due conversations");
            return PollReport::default();
        }
    };

    let mut report = PollReport {
        selected: due.len(),
        ..PollReport::default()
    };
    if due.is_empty() {
        return report;
    }
    info!(count = due.len(), "Processing due conversations");

    let outcomes: Vec<Option<Result<ProcessOutcome, AppError>>> = stream::iter(due.iter())
        .map(|conversation| async move {
            if stopping.load(Ordering::Acquire) {
                return None;
            }
            let result = pipeline.process(conversation).await;
            if let Err(e) = &result {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    transient = e.is_transient(),
                    "Conversation skipped, will retry"
                );
            }
            Some(result)
        })
        .boxed()
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        match outcome {
            None => report.cancelled += 1,
            Some(Ok(ProcessOutcome::Extracted(_))) => report.extracted += 1,
            Some(Ok(ProcessOutcome::Unresolved)) => report.unresolved += 1,
            Some(Ok(ProcessOutcome::AlreadyProcessed)) => report.already_processed += 1,
            Some(Err(_)) => report.failed += 1,
        }
    }

    info!(
        extracted = report.extracted,
        unresolved = report.unresolved,
        failed = report.failed,
        "Poll finished"
    );
    report
}
