use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{OwnedSemaphorePermit, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Connection, Database, ExecError},
    budget::ConnectionBudget,
    classify::{ErrorClass, ErrorClassifier},
    event::{Command, Epoch, ReplayEvent, SessionId},
    timing::TimingReference,
};

/// Fatal replay failure raised by a session worker.
#[derive(Debug)]
pub enum ReplayError {
    Connect {
        session: SessionId,
        source: ExecError,
    },
    Execution {
        session: SessionId,
        statement: String,
        source: ExecError,
    },
}

impl ReplayError {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Connect { session, .. } | Self::Execution { session, .. } => *session,
        }
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { session, source } => {
                write!(f, "session {session} could not connect: {source}")
            }
            Self::Execution {
                session,
                statement,
                source,
            } => write!(f, "session {session} failed on `{statement}`: {source}"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } | Self::Execution { source, .. } => Some(source),
        }
    }
}

/// Counters shared by every worker of one replay run.
#[derive(Debug, Default)]
pub struct ReplayStats {
    statements: AtomicU64,
    ignored_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl ReplayStats {
    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    pub fn ignored_errors(&self) -> u64 {
        self.ignored_errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connected,
    Executing,
}

struct LiveConnection<C> {
    connection: C,
    _slot: OwnedSemaphorePermit,
}

enum Link<C> {
    Disconnected,
    Connected(LiveConnection<C>),
    /// The connection is checked out by the statement in flight.
    Executing,
}

/// Everything a worker shares with the rest of the run.
pub struct WorkerContext<D> {
    pub database: Arc<D>,
    pub budget: Arc<ConnectionBudget>,
    pub classifier: Arc<ErrorClassifier>,
    pub stats: Arc<ReplayStats>,
    pub timing: TimingReference,
}

/// Replays one captured session over its own connection.
pub struct SessionWorker<D: Database> {
    session: SessionId,
    context: WorkerContext<D>,
    link: Link<D::Connection>,
    last_epoch: Epoch,
    connects: u64,
}

impl<D: Database> SessionWorker<D> {
    pub fn new(session: SessionId, context: WorkerContext<D>) -> Self {
        let last_epoch = context.timing.capture_origin();
        Self {
            session,
            context,
            link: Link::Disconnected,
            last_epoch,
            connects: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match self.link {
            Link::Disconnected => SessionPhase::Disconnected,
            Link::Connected(_) => SessionPhase::Connected,
            Link::Executing => SessionPhase::Executing,
        }
    }

    /// Drains `queue` until it is closed and empty, or until `cancel` fires.
    /// A fatal failure cancels the whole run before it is returned.
    pub async fn run(
        mut self,
        mut queue: mpsc::Receiver<ReplayEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ReplayError> {
        tracing::info!("session started");
        let outcome = self.drain(&mut queue, &cancel).await;
        if let Err(err) = &outcome {
            tracing::error!(error = %err, "session failed; aborting replay");
            cancel.cancel();
        }
        self.disconnect().await;
        tracing::info!(connects = self.connects, "session finished");
        outcome
    }

    async fn drain(
        &mut self,
        queue: &mut mpsc::Receiver<ReplayEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = queue.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            if !self.pace(event.epoch, cancel).await {
                return Ok(());
            }
            match event.command {
                Command::Query => self.query(&event.statement, cancel).await?,
                Command::Quit => self.disconnect().await,
                Command::Ping => tracing::trace!("ping"),
                Command::Other(code) => tracing::debug!(code, "skipping unsupported command"),
            }
        }
    }

    /// Sleeps until `epoch` is due. Returns `false` if cancelled meanwhile.
    async fn pace(&mut self, epoch: Epoch, cancel: &CancellationToken) -> bool {
        if epoch != self.last_epoch {
            if let Some(delay) = self.context.timing.delay_until(epoch, Instant::now()) {
                tracing::debug!(sleep_ms = delay.as_secs_f64() * 1e3, "sleeping");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        self.last_epoch = epoch;
        true
    }

    async fn query(
        &mut self,
        statement: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        let mut live = match mem::replace(&mut self.link, Link::Executing) {
            Link::Connected(live) => live,
            Link::Disconnected | Link::Executing => match self.connect().await {
                Ok(live) => live,
                Err(err) => {
                    self.link = Link::Disconnected;
                    return Err(err);
                }
            },
        };

        tracing::info!(statement, "replay");
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = live.connection.execute(statement) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            // Dropping the connection abandons the statement in flight.
            self.link = Link::Disconnected;
            return Ok(());
        };
        let elapsed = started.elapsed();
        self.link = Link::Connected(live);

        match outcome {
            Ok(()) => {
                self.context.stats.statements.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    statement,
                    elapsed_ms = elapsed.as_secs_f64() * 1e3,
                    "statement finished"
                );
                Ok(())
            }
            Err(err) => match self.context.classifier.classify(&err) {
                ErrorClass::Ignorable => {
                    self.context
                        .stats
                        .ignored_errors
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(statement, error = %err, "ignored execution error");
                    Ok(())
                }
                ErrorClass::Fatal => Err(ReplayError::Execution {
                    session: self.session,
                    statement: statement.to_owned(),
                    source: err,
                }),
            },
        }
    }

    async fn connect(&mut self) -> Result<LiveConnection<D::Connection>, ReplayError> {
        let slot = self
            .context
            .budget
            .acquire()
            .await
            .map_err(|_| ReplayError::Connect {
                session: self.session,
                source: ExecError::Connection("connection budget closed".to_owned()),
            })?;
        let connection =
            self.context
                .database
                .connect()
                .await
                .map_err(|source| ReplayError::Connect {
                    session: self.session,
                    source,
                })?;

        if self.connects > 0 {
            self.context.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tracing::info!("reconnected");
        } else {
            tracing::info!("connected");
        }
        self.connects += 1;

        Ok(LiveConnection {
            connection,
            _slot: slot,
        })
    }

    async fn disconnect(&mut self) {
        if let Link::Connected(live) = mem::replace(&mut self.link, Link::Disconnected) {
            if let Err(err) = live.connection.close().await {
                tracing::debug!(error = %err, "close failed");
            }
            tracing::info!("disconnected");
        }
    }
}
