use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use tokio::{io::AsyncBufRead, sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    backend::Database,
    budget::ConnectionBudget,
    classify::ErrorClassifier,
    config::ReplayConfig,
    event::{Epoch, ReplayEvent, SessionId},
    feed::{EventFeed, FeedRecord},
    timing::{ReplayClock, TimingReference},
    worker::{ReplayError, ReplayStats, SessionWorker, WorkerContext},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub elapsed: Duration,
    pub capture_origin: Option<Epoch>,
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
    pub sessions: usize,
    pub statements: u64,
    pub ignored_errors: u64,
    pub reconnects: u64,
}

impl fmt::Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replayed {} events from {} records across {} sessions in {:.3}s \
             (statements={}, ignored_errors={}, reconnects={}, skipped={})",
            self.events,
            self.lines,
            self.sessions,
            self.elapsed.as_secs_f64(),
            self.statements,
            self.ignored_errors,
            self.reconnects,
            self.skipped
        )
    }
}

/// Routes a statement log to one worker per captured session.
pub struct Replayer<D> {
    database: Arc<D>,
    budget: Arc<ConnectionBudget>,
    classifier: Arc<ErrorClassifier>,
    queue_capacity: usize,
}

impl<D: Database> Replayer<D> {
    pub fn new(database: D, config: &ReplayConfig) -> Self {
        Self {
            database: Arc::new(database),
            budget: Arc::new(ConnectionBudget::new()),
            classifier: Arc::new(ErrorClassifier::new(
                config.ignorable_error_codes.iter().copied(),
            )),
            queue_capacity: config.queue_capacity.max(1),
        }
    }

    pub fn budget(&self) -> &ConnectionBudget {
        &self.budget
    }

    /// Replays `feed` to completion. Fails on the first fatal session error
    /// or on a read error from the feed.
    pub async fn run<R>(&self, mut feed: EventFeed<R>) -> anyhow::Result<ReplaySummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let clock = ReplayClock::new(Instant::now());
        let cancel = CancellationToken::new();
        let stats = Arc::new(ReplayStats::default());
        let mut sessions: HashMap<SessionId, mpsc::Sender<ReplayEvent>> = HashMap::new();
        let mut workers: JoinSet<Result<(), ReplayError>> = JoinSet::new();
        let mut lines = 0_u64;
        let mut events = 0_u64;
        let mut skipped = 0_u64;
        let mut feed_error = None;

        tracing::info!(queue_capacity = self.queue_capacity, "replay started");
        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = feed.next_record() => record,
            };
            let event = match record {
                Ok(Some(FeedRecord::Event { event, .. })) => event,
                Ok(Some(FeedRecord::Malformed {
                    line_number,
                    raw,
                    error,
                })) => {
                    lines += 1;
                    skipped += 1;
                    tracing::warn!(
                        line = line_number,
                        raw = %raw,
                        error = %error,
                        "skipping malformed record"
                    );
                    continue;
                }
                Ok(None) => break,
                Err(err) => {
                    feed_error = Some(err);
                    cancel.cancel();
                    break;
                }
            };
            lines += 1;

            let timing = clock.establish(event.epoch);
            if !sessions.contains_key(&event.session) {
                let (queue, inbox) = mpsc::channel(self.queue_capacity);
                sessions.insert(event.session, queue);
                let limit = self.budget.ensure_capacity(sessions.len());
                tracing::info!(
                    session = event.session,
                    sessions = sessions.len(),
                    connection_limit = limit,
                    "new session"
                );
                self.spawn_worker(&mut workers, event.session, timing, &stats, inbox, &cancel);
            }
            let Some(queue) = sessions.get(&event.session) else {
                continue;
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = queue.send(event) => sent,
            };
            if sent.is_err() {
                // The worker only drops its inbox after the run was cancelled.
                break;
            }
            events += 1;
        }

        let session_count = sessions.len();
        // Closing every queue lets each worker finish once it has drained.
        drop(sessions);
        tracing::info!(
            lines_read = feed.line_number(),
            sessions = session_count,
            "log exhausted; waiting for sessions to drain"
        );

        let mut fatal: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => anyhow::Error::new(err),
                Err(join_err) => anyhow::anyhow!("session worker panicked: {join_err}"),
            };
            cancel.cancel();
            fatal.get_or_insert(failure);
        }

        if let Some(err) = feed_error {
            return Err(err);
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let summary = ReplaySummary {
            elapsed: clock.started().elapsed(),
            capture_origin: clock.get().map(|reference| reference.capture_origin()),
            lines,
            events,
            skipped,
            sessions: session_count,
            statements: stats.statements(),
            ignored_errors: stats.ignored_errors(),
            reconnects: stats.reconnects(),
        };
        tracing::info!(
            elapsed_ms = summary.elapsed.as_secs_f64() * 1e3,
            events = summary.events,
            sessions = summary.sessions,
            statements = summary.statements,
            ignored_errors = summary.ignored_errors,
            reconnects = summary.reconnects,
            skipped = summary.skipped,
            "replay finished"
        );
        Ok(summary)
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<(), ReplayError>>,
        session: SessionId,
        timing: TimingReference,
        stats: &Arc<ReplayStats>,
        inbox: mpsc::Receiver<ReplayEvent>,
        cancel: &CancellationToken,
    ) {
        let context = WorkerContext {
            database: Arc::clone(&self.database),
            budget: Arc::clone(&self.budget),
            classifier: Arc::clone(&self.classifier),
            stats: Arc::clone(stats),
            timing,
        };
        let worker = SessionWorker::new(session, context);
        workers.spawn(
            worker
                .run(inbox, cancel.clone())
                .instrument(tracing::info_span!("session", id = session)),
        );
    }
}
