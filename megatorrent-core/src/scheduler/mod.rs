//! Update scheduling and the resolution worker pool.
//!
//! A fixed number of workers drain the shared due-queue. Each attempt runs
//! resolve, commit, reschedule and materialize for one subscription. The
//! pool size is independent of how many feeds are subscribed.

mod backoff;
mod queue;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use backoff::BackoffPolicy;
pub use queue::{DueQueue, QueuePoll};

use crate::config::MAX_SCHEDULE_DELAY;
use crate::feed::FeedKey;
use crate::materializer::Materializer;
use crate::registry::{ApplyResult, ResolutionTicket, SubscriptionRegistry};
use crate::resolver::{ResolutionOutcome, Resolver};

/// Notification that a resolution changed persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionEvent {
    pub public_key: FeedKey,
}

/// Everything a worker needs to run attempts.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<SubscriptionRegistry>,
    pub queue: Arc<DueQueue>,
    pub resolver: Resolver,
    pub materializer: Arc<Materializer>,
    pub policy: BackoffPolicy,
    pub events: mpsc::UnboundedSender<ResolutionEvent>,
}

/// Pool of resolution workers.
pub struct UpdateScheduler {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl UpdateScheduler {
    /// Spawns `worker_count` workers draining `context.queue`.
    pub fn spawn(context: WorkerContext, worker_count: usize) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker_count = worker_count.max(1);

        let workers = (0..worker_count)
            .map(|worker_id| {
                let context = context.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, context, shutdown_rx).await;
                })
            })
            .collect();

        tracing::debug!("Started {} resolution workers", worker_count);
        Self { workers, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals workers to stop and waits for them.
    ///
    /// Workers finish the attempt they are running before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::warn!("Resolution worker ended abnormally: {}", e);
            }
        }
        tracing::debug!("Resolution workers stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    context: WorkerContext,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::trace!("Resolution worker {} started", worker_id);
    while let Some(ticket) = context.queue.next_due(&mut shutdown).await {
        run_attempt(&context, ticket).await;
    }
    tracing::trace!("Resolution worker {} stopped", worker_id);
}

/// Runs one resolution attempt for `ticket`.
///
/// The next attempt is scheduled before the payload is handed to the
/// transfer subsystem, so a slow transfer call never delays a refresh.
pub async fn run_attempt(context: &WorkerContext, ticket: ResolutionTicket) -> ApplyResult {
    let Some(snapshot) = context.registry.snapshot_for(&ticket) else {
        return ApplyResult::Discarded;
    };

    let outcome = context
        .resolver
        .resolve(&ticket.public_key, snapshot.last_sequence)
        .await;
    let applied = context.registry.apply_resolution(&ticket, &outcome);

    if applied == ApplyResult::Discarded {
        return applied;
    }

    let delay = match (&outcome, &applied) {
        (
            ResolutionOutcome::Failed(kind),
            ApplyResult::Failed {
                consecutive_failures,
                ..
            },
        ) => context.policy.failure_delay(*consecutive_failures, *kind),
        _ => context.policy.refresh_delay(),
    };

    let now = Instant::now();
    let due = now
        .checked_add(delay)
        .unwrap_or_else(|| now + MAX_SCHEDULE_DELAY);
    if context.registry.reschedule(&ticket, due) {
        tracing::debug!(
            "Feed {} next attempt in {:?}",
            ticket.public_key.short(),
            delay
        );
    }

    if applied.needs_persist() {
        let _ = context.events.send(ResolutionEvent {
            public_key: ticket.public_key,
        });
    }

    if let ApplyResult::Advanced {
        label,
        locator,
        sequence,
    } = &applied
    {
        // Failures are tracked by the materializer and never undo the commit.
        let _ = context
            .materializer
            .materialize(ticket.public_key, *sequence, locator, label)
            .await;
        if context.registry.snapshot_for(&ticket).is_none() {
            context.materializer.forget(&ticket.public_key);
        }
    }
    applied
}
