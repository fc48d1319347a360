//! Engine types
//!
//! Message types and configuration for the sync orchestrator.

use crate::catalog::StreamIdentifier;
use crate::classify::InitialSnapshotPolicy;
use crate::error::Result;
use crate::state::{ReplicationPosition, SyncState};
use crate::types::{JsonObject, RetryPolicy};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Duration;

/// A message emitted during sync
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A data record
    Record {
        /// Stream the record belongs to
        stream: StreamIdentifier,
        /// Record payload
        data: JsonObject,
        /// Replication position of a change record
        position: Option<ReplicationPosition>,
        /// Emission time
        emitted_at: DateTime<Utc>,
    },
    /// Progress that is safe to resume from
    Checkpoint(SyncState),
}

impl Message {
    /// Create a record message
    pub fn record(
        stream: StreamIdentifier,
        data: JsonObject,
        position: Option<ReplicationPosition>,
    ) -> Self {
        Self::Record {
            stream,
            data,
            position,
            emitted_at: Utc::now(),
        }
    }

    /// Check if this is a record message
    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record { .. })
    }

    /// Check if this is a checkpoint message
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }

    /// Checkpointed state, if this is a checkpoint
    pub fn as_checkpoint(&self) -> Option<&SyncState> {
        match self {
            Self::Checkpoint(state) => Some(state),
            Self::Record { .. } => None,
        }
    }

    /// Protocol JSON representation (one line per message)
    pub fn to_json(&self) -> Value {
        match self {
            Self::Record {
                stream,
                data,
                emitted_at,
                ..
            } => json!({
                "type": "RECORD",
                "record": {
                    "namespace": stream.namespace,
                    "stream": stream.name,
                    "data": data,
                    "emitted_at": emitted_at.timestamp_millis(),
                }
            }),
            Self::Checkpoint(state) => json!({
                "type": "STATE",
                "state": state,
                "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        }
    }
}

/// Boxed stream of sync messages
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

// ============================================================================
// Configuration
// ============================================================================

/// How long the streaming phase runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingBound {
    /// Stop after the log tip observed when streaming starts
    #[default]
    UntilTargetAtStart,
    /// Stream until cancelled
    Unbounded,
}

/// Configuration for sync operation
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Checkpoint after this many records (0 = only at phase boundaries)
    pub checkpoint_every_records: usize,
    /// Checkpoint after this much time since the last checkpoint
    pub checkpoint_interval: Duration,
    /// Whole-invocation timeout
    pub timeout: Option<Duration>,
    /// Restart policy for transient failures
    pub retry: RetryPolicy,
    /// Parallel snapshot workers
    pub snapshot_concurrency: usize,
    /// First-run behaviour in global mode
    pub initial_snapshot: InitialSnapshotPolicy,
    /// Streaming phase bound
    pub streaming_bound: StreamingBound,
    /// Pause between polls of an idle transport
    pub idle_poll_interval: Duration,
    /// End streaming after this much continuous idleness
    pub idle_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_records: 10_000,
            checkpoint_interval: Duration::from_secs(60),
            timeout: None,
            retry: RetryPolicy::default(),
            snapshot_concurrency: 1,
            initial_snapshot: InitialSnapshotPolicy::default(),
            streaming_bound: StreamingBound::default(),
            idle_poll_interval: Duration::from_millis(100),
            idle_timeout: None,
        }
    }
}

impl SyncConfig {
    /// Create a new sync config
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoint every `records` records
    #[must_use]
    pub fn with_checkpoint_every(mut self, records: usize) -> Self {
        self.checkpoint_every_records = records;
        self
    }

    /// Checkpoint at least every `interval`
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the whole-invocation timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set parallel snapshot workers
    #[must_use]
    pub fn with_snapshot_concurrency(mut self, workers: usize) -> Self {
        self.snapshot_concurrency = workers.max(1);
        self
    }

    /// Set the first-run snapshot policy
    #[must_use]
    pub fn with_initial_snapshot(mut self, policy: InitialSnapshotPolicy) -> Self {
        self.initial_snapshot = policy;
        self
    }

    /// Set the streaming bound
    #[must_use]
    pub fn with_streaming_bound(mut self, bound: StreamingBound) -> Self {
        self.streaming_bound = bound;
        self
    }

    /// Set the idle poll interval
    #[must_use]
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// End streaming after continuous idleness
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Run Status
// ============================================================================

/// Phase of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Not started
    Idle,
    /// Reading full stream contents
    Snapshotting,
    /// Replaying changes
    Streaming,
    /// Finished cleanly
    Done,
    /// Stopped on an error
    Failed,
}

/// Statistics from a sync operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Records emitted
    pub records_emitted: usize,
    /// Records emitted while snapshotting
    pub snapshot_records: usize,
    /// Records emitted while streaming
    pub change_records: usize,
    /// Streams whose snapshot completed
    pub streams_snapshotted: usize,
    /// Checkpoints emitted
    pub checkpoints: usize,
    /// Restarts after transient failures
    pub retries: u32,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl SyncStats {
    /// Create new stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a snapshot record
    pub fn add_snapshot_record(&mut self) {
        self.records_emitted += 1;
        self.snapshot_records += 1;
    }

    /// Count a change record
    pub fn add_change_record(&mut self) {
        self.records_emitted += 1;
        self.change_records += 1;
    }

    /// Count a completed stream snapshot
    pub fn add_stream(&mut self) {
        self.streams_snapshotted += 1;
    }

    /// Count a checkpoint
    pub fn add_checkpoint(&mut self) {
        self.checkpoints += 1;
    }

    /// Set duration
    pub fn set_duration(&mut self, ms: u64) {
        self.duration_ms = ms;
    }
}
