use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mysql_replay::{
    backend::{Connection, Database, ExecError},
    config::ReplayConfig,
    feed::EventFeed,
    router::{ReplaySummary, Replayer},
    worker::ReplayError,
};
use tokio::time::Instant;

const TOLERANCE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Connect,
    Execute(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Trace {
    connection: usize,
    action: Action,
    at: Duration,
}

/// In-memory server that records every call with its virtual timestamp.
#[derive(Default)]
struct Recorder {
    origin: Mutex<Option<Instant>>,
    next_connection: AtomicUsize,
    traces: Mutex<Vec<Trace>>,
    slow: HashMap<String, Duration>,
    errors: HashMap<String, ExecError>,
    refuse_connections: bool,
}

impl Recorder {
    fn record(&self, connection: usize, action: Action) {
        let origin = *self.origin.lock().unwrap().get_or_insert_with(Instant::now);
        self.traces.lock().unwrap().push(Trace {
            connection,
            action,
            at: origin.elapsed(),
        });
    }

    fn traces(&self) -> Vec<Trace> {
        self.traces.lock().unwrap().clone()
    }

    fn executed_at(&self, statement: &str) -> Duration {
        self.traces()
            .into_iter()
            .find(|trace| trace.action == Action::Execute(statement.to_owned()))
            .unwrap_or_else(|| panic!("`{statement}` was never executed"))
            .at
    }

    fn statements(&self) -> Vec<String> {
        self.traces()
            .into_iter()
            .filter_map(|trace| match trace.action {
                Action::Execute(statement) => Some(statement),
                _ => None,
            })
            .collect()
    }

    fn connects(&self) -> usize {
        self.traces()
            .iter()
            .filter(|trace| trace.action == Action::Connect)
            .count()
    }
}

#[derive(Clone)]
struct RecordingDatabase {
    recorder: Arc<Recorder>,
}

struct RecordingConnection {
    id: usize,
    recorder: Arc<Recorder>,
}

impl Database for RecordingDatabase {
    type Connection = RecordingConnection;

    async fn connect(&self) -> Result<RecordingConnection, ExecError> {
        if self.recorder.refuse_connections {
            return Err(ExecError::Connection("connection refused".to_owned()));
        }
        let id = self.recorder.next_connection.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(id, Action::Connect);
        Ok(RecordingConnection {
            id,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

impl Connection for RecordingConnection {
    async fn execute(&mut self, statement: &str) -> Result<(), ExecError> {
        self.recorder
            .record(self.id, Action::Execute(statement.to_owned()));
        if let Some(delay) = self.recorder.slow.get(statement) {
            tokio::time::sleep(*delay).await;
        }
        match self.recorder.errors.get(statement) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn close(self) -> Result<(), ExecError> {
        self.recorder.record(self.id, Action::Close);
        Ok(())
    }
}

fn log(lines: &[&str]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}

async fn replay_with(
    recorder: Recorder,
    config: ReplayConfig,
    input: &str,
) -> (Arc<Recorder>, anyhow::Result<ReplaySummary>) {
    let recorder = Arc::new(recorder);
    *recorder.origin.lock().unwrap() = Some(Instant::now());
    let database = RecordingDatabase {
        recorder: Arc::clone(&recorder),
    };
    let outcome = Replayer::new(database, &config)
        .run(EventFeed::new(input.as_bytes()))
        .await;
    (recorder, outcome)
}

async fn replay(recorder: Recorder, input: &str) -> (Arc<Recorder>, ReplaySummary) {
    let (recorder, outcome) = replay_with(recorder, ReplayConfig::default(), input).await;
    (recorder, outcome.expect("replay should succeed"))
}

fn assert_near(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + TOLERANCE,
        "expected ~{expected:?}, observed {actual:?}"
    );
}

fn assert_close(a: Duration, b: Duration) {
    let gap = if a > b { a - b } else { b - a };
    assert!(gap <= TOLERANCE, "{a:?} and {b:?} differ by {gap:?}");
}

fn session_statements(recorder: &Recorder, connections: &[usize]) -> Vec<String> {
    recorder
        .traces()
        .into_iter()
        .filter(|trace| connections.contains(&trace.connection))
        .filter_map(|trace| match trace.action {
            Action::Execute(statement) => Some(statement),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn two_session_scenario_keeps_timing_and_reconnects() {
    let input = log(&[
        "1\t100.0\t3\tSELECT 1",
        "2\t100.0\t3\tSELECT 2",
        "1\t100.5\t3\tSELECT 3",
        "1\t101.0\t1\t",
        "1\t101.2\t3\tSELECT 4",
    ]);

    let (recorder, summary) = replay(Recorder::default(), &input).await;

    assert_near(recorder.executed_at("SELECT 1"), Duration::ZERO);
    assert_near(recorder.executed_at("SELECT 2"), Duration::ZERO);
    assert_near(recorder.executed_at("SELECT 3"), Duration::from_millis(500));
    assert_near(recorder.executed_at("SELECT 4"), Duration::from_millis(1200));

    let traces = recorder.traces();
    let session_one = traces
        .iter()
        .find(|trace| trace.action == Action::Execute("SELECT 1".to_owned()))
        .expect("SELECT 1 should run")
        .connection;
    let close = traces
        .iter()
        .find(|trace| trace.connection == session_one && trace.action == Action::Close)
        .expect("session 1 should disconnect on quit");
    assert_near(close.at, Duration::from_secs(1));

    let reconnect = traces
        .iter()
        .find(|trace| trace.action == Action::Execute("SELECT 4".to_owned()))
        .expect("SELECT 4 should run");
    assert_ne!(reconnect.connection, session_one, "SELECT 4 needs a fresh connection");

    assert_eq!(summary.sessions, 2);
    assert_eq!(summary.events, 5);
    assert_eq!(summary.statements, 4);
    assert_eq!(summary.reconnects, 1);
    assert_eq!(summary.skipped, 0);
    assert_eq!(recorder.connects(), 3);
}

#[tokio::test(start_paused = true)]
async fn statements_keep_log_order_within_each_session() {
    let mut lines = Vec::new();
    for i in 0..20 {
        let session = i % 3;
        lines.push(format!("{session}\t100.{i:02}\t3\ts{session}-{i}"));
    }
    let lines: Vec<&str> = lines.iter().map(String::as_str).collect();

    let (recorder, summary) = replay(Recorder::default(), &log(&lines)).await;
    assert_eq!(summary.sessions, 3);
    assert_eq!(summary.statements, 20);

    let executed = recorder.statements();
    for session in 0..3 {
        let prefix = format!("s{session}-");
        let expected: Vec<&str> = lines
            .iter()
            .filter_map(|line| line.rsplit('\t').next())
            .filter(|statement| statement.starts_with(&prefix))
            .collect();
        let observed: Vec<&str> = executed
            .iter()
            .map(String::as_str)
            .filter(|statement| statement.starts_with(&prefix))
            .collect();
        assert_eq!(observed, expected, "session {session} order");
    }
}

#[tokio::test(start_paused = true)]
async fn consecutive_events_keep_their_capture_gap() {
    let input = log(&[
        "5\t1700000000.100000000\t3\tA",
        "5\t1700000000.350000000\t3\tB",
        "5\t1700000000.350000000\t14\t",
        "5\t1700000001.350000000\t3\tC",
    ]);

    let (recorder, _) = replay(Recorder::default(), &input).await;

    let a = recorder.executed_at("A");
    let b = recorder.executed_at("B");
    let c = recorder.executed_at("C");
    assert_near(a, Duration::ZERO);
    assert_near(b - a, Duration::from_millis(250));
    assert_near(c - a, Duration::from_millis(1250));
}

#[tokio::test(start_paused = true)]
async fn slow_session_does_not_block_other_sessions() {
    let recorder = Recorder {
        slow: HashMap::from([("SELECT SLEEP(60)".to_owned(), Duration::from_secs(60))]),
        ..Recorder::default()
    };
    let input = log(&[
        "1\t100.0\t3\tSELECT SLEEP(60)",
        "2\t100.1\t3\tfast 1",
        "1\t100.2\t3\tafter slow",
        "2\t100.3\t3\tfast 2",
    ]);

    let (recorder, summary) = replay(recorder, &input).await;

    assert_near(recorder.executed_at("fast 1"), Duration::from_millis(100));
    assert_near(recorder.executed_at("fast 2"), Duration::from_millis(300));
    // A late statement runs as soon as its session is free again.
    assert_near(recorder.executed_at("after slow"), Duration::from_secs(60));
    assert_eq!(summary.statements, 4);
}

#[tokio::test(start_paused = true)]
async fn quit_then_query_reconnects_exactly_once() {
    let input = log(&[
        "9\t10.0\t3\tBEGIN",
        "9\t10.1\t1\t",
        "9\t10.2\t14\t",
        "9\t10.3\t3\tSELECT 1",
        "9\t10.4\t3\tSELECT 2",
    ]);

    let (recorder, summary) = replay(Recorder::default(), &input).await;

    let actions: Vec<(usize, Action)> = recorder
        .traces()
        .into_iter()
        .map(|trace| (trace.connection, trace.action))
        .collect();
    assert_eq!(
        actions,
        vec![
            (0, Action::Connect),
            (0, Action::Execute("BEGIN".to_owned())),
            (0, Action::Close),
            (1, Action::Connect),
            (1, Action::Execute("SELECT 1".to_owned())),
            (1, Action::Execute("SELECT 2".to_owned())),
            (1, Action::Close),
        ]
    );
    assert_eq!(summary.reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_lines_leave_replay_untouched() {
    let valid = [
        "1\t100.0\t3\tSELECT 1",
        "2\t100.2\t3\tSELECT 2",
        "1\t100.4\t3\tSELECT 3",
    ];
    let with_bad_lines = [
        "abc\t1.0\t3\tSELECT 1",
        "1\t1e30\t3\tSELECT 1",
        "2\t99.0\t3\tSELECT 2\textra",
        valid[0],
        "2\t100.1",
        valid[1],
        "1\tsoon\t3\tSELECT 0",
        valid[2],
    ];

    let (clean, clean_summary) = replay(Recorder::default(), &log(&valid)).await;
    let (noisy, noisy_summary) = replay(Recorder::default(), &log(&with_bad_lines)).await;

    let timeline = |recorder: &Recorder| -> Vec<(Action, Duration)> {
        recorder
            .traces()
            .into_iter()
            .filter(|trace| matches!(trace.action, Action::Execute(_)))
            .map(|trace| (trace.action, trace.at))
            .collect()
    };
    let (clean, noisy) = (timeline(&clean), timeline(&noisy));
    assert_eq!(clean.len(), noisy.len());
    for ((clean_action, clean_at), (noisy_action, noisy_at)) in clean.into_iter().zip(noisy) {
        assert_eq!(clean_action, noisy_action);
        assert_close(noisy_at, clean_at);
    }
    assert_eq!(clean_summary.capture_origin, noisy_summary.capture_origin);
    assert_eq!(
        noisy_summary.capture_origin.map(|epoch| epoch.to_string()),
        Some("100.000000000".to_owned())
    );
    assert_eq!(noisy_summary.skipped, 5);
    assert_eq!(noisy_summary.events, clean_summary.events);
    assert_eq!(noisy_summary.sessions, clean_summary.sessions);
}

#[tokio::test(start_paused = true)]
async fn ignorable_errors_are_logged_and_replay_continues() {
    let recorder = Recorder {
        errors: HashMap::from([(
            "UPDATE t SET a = 1".to_owned(),
            ExecError::Server {
                code: Some(1205),
                message: "Lock wait timeout exceeded; try restarting transaction".to_owned(),
            },
        )]),
        ..Recorder::default()
    };
    let input = log(&[
        "1\t1.0\t3\tUPDATE t SET a = 1",
        "1\t1.1\t3\tSELECT 1",
    ]);

    let (recorder, summary) = replay(recorder, &input).await;

    assert_eq!(recorder.statements(), vec!["UPDATE t SET a = 1", "SELECT 1"]);
    assert_eq!(summary.ignored_errors, 1);
    assert_eq!(summary.statements, 1);
}

#[tokio::test(start_paused = true)]
async fn unclassified_error_aborts_every_session() {
    let recorder = Recorder {
        errors: HashMap::from([(
            "SELEC 1".to_owned(),
            ExecError::Server {
                code: Some(1064),
                message: "You have an error in your SQL syntax".to_owned(),
            },
        )]),
        ..Recorder::default()
    };
    let input = log(&[
        "1\t1.0\t3\tSELEC 1",
        "2\t1.0\t3\tSELECT 2",
        "2\t500.0\t3\tSELECT 3",
        "1\t600.0\t3\tSELECT 4",
    ]);

    let (recorder, outcome) = replay_with(recorder, ReplayConfig::default(), &input).await;

    let err = outcome.expect_err("syntax error should abort the replay");
    let replay_err = err
        .downcast_ref::<ReplayError>()
        .expect("error should be a replay failure");
    assert_eq!(replay_err.session(), 1);
    assert!(
        matches!(replay_err, ReplayError::Execution { statement, .. } if statement == "SELEC 1"),
        "error: {replay_err}"
    );

    let statements = recorder.statements();
    assert!(!statements.contains(&"SELECT 3".to_owned()), "{statements:?}");
    assert!(!statements.contains(&"SELECT 4".to_owned()), "{statements:?}");
    assert!(
        Instant::now().duration_since(recorder.origin.lock().unwrap().unwrap())
            < Duration::from_secs(1),
        "abort should not wait for pending sleeps"
    );
}

#[tokio::test(start_paused = true)]
async fn connection_failure_is_fatal() {
    let recorder = Recorder {
        refuse_connections: true,
        ..Recorder::default()
    };
    let (_, outcome) = replay_with(
        recorder,
        ReplayConfig::default(),
        &log(&["1\t1.0\t3\tSELECT 1"]),
    )
    .await;

    let err = outcome.expect_err("refused connection should abort the replay");
    assert!(
        matches!(
            err.downcast_ref::<ReplayError>(),
            Some(ReplayError::Connect { session: 1, .. })
        ),
        "error: {err:#}"
    );
}

#[tokio::test(start_paused = true)]
async fn ping_only_sessions_never_connect() {
    let input = log(&["3\t1.0\t14\t", "3\t1.5\t14\t", "3\t2.0\t1\t", "3\t2.0\t7\tx"]);

    let (recorder, summary) = replay(Recorder::default(), &input).await;

    assert!(recorder.traces().is_empty());
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.events, 4);
    assert!(summary.elapsed >= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn full_queue_throttles_the_router() {
    let recorder = Recorder {
        slow: (1..=5)
            .map(|i| (format!("slow {i}"), Duration::from_secs(1)))
            .collect(),
        ..Recorder::default()
    };
    let input = log(&[
        "1\t100.0\t3\tslow 1",
        "1\t100.0\t3\tslow 2",
        "1\t100.0\t3\tslow 3",
        "1\t100.0\t3\tslow 4",
        "1\t100.0\t3\tslow 5",
        "2\t100.0\t3\tother session",
    ]);
    let config = ReplayConfig {
        queue_capacity: 1,
        ..ReplayConfig::default()
    };

    let (recorder, outcome) = replay_with(recorder, config, &input).await;
    let summary = outcome.expect("replay should succeed");

    assert_eq!(
        session_statements(&recorder, &[0]),
        vec!["slow 1", "slow 2", "slow 3", "slow 4", "slow 5"]
    );
    assert!(
        recorder.executed_at("other session") >= Duration::from_secs(2),
        "router should have been held back by the full queue"
    );
    assert_eq!(summary.statements, 6);
}

#[tokio::test(start_paused = true)]
async fn connection_limit_tracks_session_count() {
    let recorder = Arc::new(Recorder::default());
    *recorder.origin.lock().unwrap() = Some(Instant::now());
    let replayer = Replayer::new(
        RecordingDatabase {
            recorder: Arc::clone(&recorder),
        },
        &ReplayConfig::default(),
    );
    let input = log(&[
        "1\t1.0\t3\tA",
        "2\t1.0\t3\tB",
        "1\t1.1\t3\tC",
        "3\t1.2\t3\tD",
    ]);

    replayer
        .run(EventFeed::new(input.as_bytes()))
        .await
        .expect("replay should succeed");

    assert_eq!(replayer.budget().limit(), 3);
    assert_eq!(replayer.budget().available(), 3);
}
