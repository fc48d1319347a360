//! In-memory collaborators
//!
//! `MemoryTables` answers snapshot queries from rows held in memory and
//! `MemoryChangeLog` plays the role of a replication log. Both record resource
//! acquisition and release in a shared `ResourceLog`, and both can be loaded
//! from JSON Lines files.

use crate::catalog::StreamIdentifier;
use crate::cdc::{ChangeEvent, ChangeFeed, ChangeOp, ChangeTransport, FeedPoll};
use crate::error::{Error, Phase, Result};
use crate::snapshot::{Row, RowCursor, SnapshotQuery, SnapshotRequest};
use crate::state::{CursorValue, ReplicationPosition};
use crate::types::{JsonObject, JsonValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

// ============================================================================
// Resource Log
// ============================================================================

/// Acquisition or release of a source resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Snapshot cursor opened for a stream
    SnapshotOpened(StreamIdentifier),
    /// Snapshot cursor closed for a stream
    SnapshotClosed(StreamIdentifier),
    /// Change feed opened at a position
    FeedOpened(ReplicationPosition),
    /// Change feed closed
    FeedClosed,
}

/// Shared, ordered record of resource events
#[derive(Debug, Clone, Default)]
pub struct ResourceLog(Arc<Mutex<Vec<ResourceEvent>>>);

impl ResourceLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn record(&self, event: ResourceEvent) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event);
        }
    }

    /// All events so far
    pub fn events(&self) -> Vec<ResourceEvent> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Snapshot cursors opened but not closed
    pub fn open_snapshots(&self) -> usize {
        self.events().iter().fold(0usize, |open, e| match e {
            ResourceEvent::SnapshotOpened(_) => open + 1,
            ResourceEvent::SnapshotClosed(_) => open.saturating_sub(1),
            _ => open,
        })
    }

    /// Change feeds opened but not closed
    pub fn open_feeds(&self) -> usize {
        self.events().iter().fold(0usize, |open, e| match e {
            ResourceEvent::FeedOpened(_) => open + 1,
            ResourceEvent::FeedClosed => open.saturating_sub(1),
            _ => open,
        })
    }

    /// Whether every snapshot release precedes every feed acquisition
    pub fn phases_disjoint(&self) -> bool {
        let events = self.events();
        let first_feed = events
            .iter()
            .position(|e| matches!(e, ResourceEvent::FeedOpened(_)));
        let last_snapshot = events.iter().rposition(|e| {
            matches!(
                e,
                ResourceEvent::SnapshotOpened(_) | ResourceEvent::SnapshotClosed(_)
            )
        });

        match (first_feed, last_snapshot) {
            (Some(feed), Some(snapshot)) => {
                snapshot < feed && self.snapshots_balanced_before(feed)
            }
            _ => true,
        }
    }

    fn snapshots_balanced_before(&self, index: usize) -> bool {
        let events = self.events();
        let opened = events[..index]
            .iter()
            .filter(|e| matches!(e, ResourceEvent::SnapshotOpened(_)))
            .count();
        let closed = events[..index]
            .iter()
            .filter(|e| matches!(e, ResourceEvent::SnapshotClosed(_)))
            .count();
        opened == closed
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Other("in-memory source lock poisoned".to_string()))
}

// ============================================================================
// Memory Tables
// ============================================================================

/// Failure injected into a snapshot read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection-level error that may succeed on retry
    Transient,
    /// Error that retrying cannot fix
    Fatal,
}

#[derive(Debug, Clone, Copy)]
struct InjectedFailure {
    after_rows: usize,
    kind: FailureKind,
    remaining: u32,
}

/// Snapshot query over in-memory tables
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    tables: Arc<Mutex<BTreeMap<StreamIdentifier, Vec<Row>>>>,
    failures: Arc<Mutex<HashMap<StreamIdentifier, InjectedFailure>>>,
    log: ResourceLog,
}

impl MemoryTables {
    /// Create an empty set of tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resource events in `log`
    #[must_use]
    pub fn with_log(mut self, log: ResourceLog) -> Self {
        self.log = log;
        self
    }

    /// Add a table
    #[must_use]
    pub fn with_table(self, stream: StreamIdentifier, rows: Vec<Row>) -> Self {
        self.insert(stream, rows);
        self
    }

    /// Append rows to a table
    pub fn insert(&self, stream: StreamIdentifier, rows: Vec<Row>) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(stream).or_default().extend(rows);
        }
    }

    /// Fail the next `times` reads of `stream` after `after_rows` rows
    pub fn inject_failure(
        &self,
        stream: StreamIdentifier,
        after_rows: usize,
        kind: FailureKind,
        times: u32,
    ) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(
                stream,
                InjectedFailure {
                    after_rows,
                    kind,
                    remaining: times,
                },
            );
        }
    }

    /// Resource log of this source
    pub fn log(&self) -> &ResourceLog {
        &self.log
    }

    /// Load every `<namespace>.<name>.jsonl` file in a directory
    pub async fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let tables = Self::new();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| Error::FileNotFound {
            path: format!("{}: {e}", dir.display()),
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let contents = tokio::fs::read_to_string(&path).await?;
            let rows = parse_rows(&contents)?;
            debug!(stream = stem, rows = rows.len(), "loaded table");
            tables.insert(StreamIdentifier::parse(stem), rows);
        }

        Ok(tables)
    }

    fn take_failure(&self, stream: &StreamIdentifier) -> Result<Option<(usize, FailureKind)>> {
        let mut failures = lock(&self.failures)?;
        let Some(failure) = failures.get_mut(stream) else {
            return Ok(None);
        };
        if failure.remaining == 0 {
            return Ok(None);
        }
        failure.remaining -= 1;
        Ok(Some((failure.after_rows, failure.kind)))
    }
}

fn parse_rows(contents: &str) -> Result<Vec<Row>> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<JsonValue>(line)? {
            JsonValue::Object(row) => Ok(row),
            other => Err(Error::Other(format!("expected a JSON object row, got {other}"))),
        })
        .collect()
}

#[async_trait]
impl SnapshotQuery for MemoryTables {
    async fn execute(&self, request: &SnapshotRequest) -> Result<Box<dyn RowCursor>> {
        let mut rows = lock(&self.tables)?
            .get(&request.stream)
            .cloned()
            .ok_or_else(|| Error::StreamNotFound {
                stream: request.stream.to_string(),
            })?;

        if let Some(field) = &request.cursor_field {
            let cursor = |row: &Row| CursorValue::from_record(row, field);
            if let Some(after) = &request.after {
                rows.retain(|row| {
                    cursor(row).is_some_and(|c| c.compare(after) == Ordering::Greater)
                });
            }
            rows.sort_by(|a, b| match (cursor(a), cursor(b)) {
                (Some(a), Some(b)) => a.compare(&b),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }

        let failure = self.take_failure(&request.stream)?;
        self.log
            .record(ResourceEvent::SnapshotOpened(request.stream.clone()));

        Ok(Box::new(MemoryRowCursor {
            stream: request.stream.clone(),
            rows: rows.into(),
            emitted: 0,
            failure,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

struct MemoryRowCursor {
    stream: StreamIdentifier,
    rows: VecDeque<Row>,
    emitted: usize,
    failure: Option<(usize, FailureKind)>,
    log: ResourceLog,
    closed: bool,
}

#[async_trait]
impl RowCursor for MemoryRowCursor {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(Error::database(format!(
                "cursor for '{}' used after close",
                self.stream
            )));
        }

        if let Some((after_rows, kind)) = self.failure {
            if self.emitted >= after_rows {
                self.failure = None;
                let message = format!("connection lost reading '{}'", self.stream);
                return Err(match kind {
                    FailureKind::Transient => Error::transient(Phase::Snapshot, message),
                    FailureKind::Fatal => Error::database(message),
                });
            }
        }

        let row = self.rows.pop_front();
        if row.is_some() {
            self.emitted += 1;
        }
        Ok(row)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.log
                .record(ResourceEvent::SnapshotClosed(self.stream.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// Memory Change Log
// ============================================================================

#[derive(Debug, Default)]
struct LogInner {
    /// Events purged from the front of `events`
    base: usize,
    events: Vec<(ReplicationPosition, ChangeEvent)>,
    head: ReplicationPosition,
    retained_from: ReplicationPosition,
    follow: bool,
    fail_polls: u32,
    fail_opens: u32,
}

/// Replication log held in memory
///
/// Cloning yields a handle to the same log, so events can be appended while
/// a feed is open.
#[derive(Debug, Clone, Default)]
pub struct MemoryChangeLog {
    inner: Arc<Mutex<LogInner>>,
    log: ResourceLog,
}

/// One line of a change log file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogLine {
    Header {
        retained_from: ReplicationPosition,
    },
    Change {
        position: ReplicationPosition,
        #[serde(flatten)]
        event: ChangeEvent,
    },
}

impl MemoryChangeLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resource events in `log`
    #[must_use]
    pub fn with_log(mut self, log: ResourceLog) -> Self {
        self.log = log;
        self
    }

    /// Report `Idle` instead of `Exhausted` at the end of the log
    #[must_use]
    pub fn following(self, follow: bool) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.follow = follow;
        }
        self
    }

    /// Append an event; the head moves to `position` if it is later
    pub fn push(&self, position: ReplicationPosition, event: ChangeEvent) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.head = inner.head.max(position);
            inner.events.push((position, event));
        }
    }

    /// Append a change built from its parts
    pub fn push_change(
        &self,
        position: u64,
        stream: StreamIdentifier,
        op: ChangeOp,
        data: JsonValue,
        committed_at: Option<DateTime<Utc>>,
    ) {
        let data = match data {
            JsonValue::Object(map) => map,
            _ => JsonObject::new(),
        };
        self.push(
            ReplicationPosition::new(position),
            ChangeEvent {
                stream,
                op,
                data,
                committed_at,
            },
        );
    }

    /// Move the head without adding an event (changes to untracked tables)
    pub fn advance_head(&self, position: ReplicationPosition) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.head = inner.head.max(position);
        }
    }

    /// Drop events at or before `position`; resuming before it fails afterwards
    pub fn purge_through(&self, position: ReplicationPosition) {
        if let Ok(mut inner) = self.inner.lock() {
            let keep_from = inner
                .events
                .iter()
                .position(|(p, _)| *p > position)
                .unwrap_or(inner.events.len());
            inner.events.drain(..keep_from);
            inner.base += keep_from;
            inner.retained_from = inner.retained_from.max(position);
        }
    }

    /// Fail the next `count` polls with a transient error
    pub fn fail_next_polls(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_polls = count;
        }
    }

    /// Fail the next `count` opens with a transient error
    pub fn fail_next_opens(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_opens = count;
        }
    }

    /// Resource log of this transport
    pub fn log(&self) -> &ResourceLog {
        &self.log
    }

    /// Load a JSON Lines change log
    ///
    /// Each line is `{"position": N, "stream": {..}, "op": "insert", "data": {..}}`;
    /// an optional `{"retained_from": N}` line marks purged history.
    pub async fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::FileNotFound {
                path: format!("{}: {e}", path.display()),
            })?;

        let log = Self::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogLine>(line)? {
                LogLine::Header { retained_from } => log.purge_through(retained_from),
                LogLine::Change { position, event } => log.push(position, event),
            }
        }
        Ok(log)
    }
}

#[async_trait]
impl ChangeTransport for MemoryChangeLog {
    async fn current_position(&self) -> Result<ReplicationPosition> {
        Ok(lock(&self.inner)?.head)
    }

    async fn open(&self, resume_from: ReplicationPosition) -> Result<Box<dyn ChangeFeed>> {
        let next = {
            let mut inner = lock(&self.inner)?;
            if inner.fail_opens > 0 {
                inner.fail_opens -= 1;
                return Err(Error::transient(
                    Phase::Streaming,
                    "replication connection refused",
                ));
            }
            if resume_from < inner.retained_from {
                return Err(Error::PositionExpired {
                    position: resume_from,
                });
            }
            let offset = inner
                .events
                .iter()
                .position(|(p, _)| *p > resume_from)
                .unwrap_or(inner.events.len());
            inner.base + offset
        };

        self.log.record(ResourceEvent::FeedOpened(resume_from));
        Ok(Box::new(MemoryFeed {
            inner: Arc::clone(&self.inner),
            next,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

struct MemoryFeed {
    inner: Arc<Mutex<LogInner>>,
    /// Absolute index of the next event
    next: usize,
    log: ResourceLog,
    closed: bool,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn poll(&mut self) -> Result<FeedPoll> {
        if self.closed {
            return Ok(FeedPoll::Exhausted);
        }

        let mut inner = lock(&self.inner)?;
        if inner.fail_polls > 0 {
            inner.fail_polls -= 1;
            return Err(Error::transient(Phase::Streaming, "replication stream reset"));
        }

        let index = self.next.saturating_sub(inner.base);
        match inner.events.get(index) {
            Some((position, event)) => {
                self.next = inner.base + index + 1;
                Ok(FeedPoll::Event(event.clone(), *position))
            }
            None if inner.follow => Ok(FeedPoll::Idle),
            None => Ok(FeedPoll::Exhausted),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.log.record(ResourceEvent::FeedClosed);
        }
        Ok(())
    }
}
