//! Execution engine module
//!
//! Sync orchestration: snapshot, then change streaming, with checkpoints.
//!
//! # Overview
//!
//! The engine module provides:
//! - `SyncOrchestrator` - validates a catalog and starts runs
//! - `SyncRun` - pull-based state machine producing `Message`s
//! - `SyncConfig` - checkpoint policy, retries, timeout, streaming bound
//!
//! Progress is committed to the state manager only after the consumer pulls
//! the message following a record, so a checkpoint never covers output that
//! was not delivered. Positions are committed per group: a record's position
//! becomes durable once a later position is seen, the transport goes idle, or
//! the stream ends.

mod types;

pub use types::{Message, MessageStream, StreamingBound, SyncConfig, SyncPhase, SyncStats};

use crate::catalog::{ConfiguredCatalog, SourceCapabilities, StreamIdentifier};
use crate::cdc::metadata::{inject_change_metadata, inject_snapshot_metadata};
use crate::cdc::{
    transport_error, ChangeEvent, ChangeStreamReader, ChangeTransport, ReaderOptions, ReaderPoll,
};
use crate::classify::classify;
use crate::error::{Error, Phase, Result};
use crate::snapshot::{Row, SnapshotItem, SnapshotProducer, SnapshotQuery, SnapshotRequest};
use crate::state::{CursorValue, ReplicationPosition, StateManager, StateMode, SyncState};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Entry point for running syncs against one source
pub struct SyncOrchestrator {
    /// Snapshot query collaborator
    query: Arc<dyn SnapshotQuery>,
    /// Change transport collaborator (global mode)
    transport: Option<Arc<dyn ChangeTransport>>,
    /// Source capability descriptor
    capabilities: SourceCapabilities,
}

impl SyncOrchestrator {
    /// Create an orchestrator for a source
    pub fn new(query: Arc<dyn SnapshotQuery>, capabilities: SourceCapabilities) -> Self {
        Self {
            query,
            transport: None,
            capabilities,
        }
    }

    /// Set the change transport
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn ChangeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Get the capability descriptor
    pub fn capabilities(&self) -> &SourceCapabilities {
        &self.capabilities
    }

    /// Start a sync of `catalog` from `prior` state
    ///
    /// Catalog and state problems are reported here, before any phase starts.
    pub fn run(
        &self,
        catalog: ConfiguredCatalog,
        prior: Option<SyncState>,
        config: SyncConfig,
    ) -> Result<SyncRun> {
        self.capabilities.validate(&catalog, prior.as_ref())?;

        let mode = self.capabilities.state_mode;
        if mode == StateMode::Global && self.transport.is_none() {
            return Err(Error::config("global state mode needs a change transport"));
        }

        let state = StateManager::from_prior(prior, mode)?;
        let now = Instant::now();

        Ok(SyncRun {
            query: Arc::clone(&self.query),
            transport: self.transport.clone(),
            wanted: catalog.incremental_ids(),
            catalog,
            inject_metadata: self.capabilities.inject_cdc_metadata,
            deadline: config.timeout.map(|t| now + t),
            config,
            state,
            stage: Stage::Start,
            phase: SyncPhase::Idle,
            cancel: CancellationToken::new(),
            cancel_handled: false,
            started: now,
            stats: SyncStats::new(),
            since_checkpoint: 0,
            last_checkpoint_at: now,
            checkpointed_revision: None,
            snapshot_origin: None,
            pending_position: None,
            pending_cursors: BTreeMap::new(),
        })
    }
}

// ============================================================================
// Sync Run
// ============================================================================

enum Stage {
    Start,
    Snapshotting(SnapshotStage),
    Streaming(StreamStage),
    Finishing,
    Failing(Error),
    Finished,
}

struct SnapshotStage {
    producer: SnapshotProducer,
    /// Row postponed behind a checkpoint
    held: Option<SnapshotItem>,
}

struct StreamStage {
    /// Open reader; `None` until (re)opened
    reader: Option<ChangeStreamReader>,
    /// Change postponed behind a checkpoint
    held: Option<(ChangeEvent, ReplicationPosition)>,
    /// Position of the last checkpoint (or the initial resume point)
    restart_from: ReplicationPosition,
    /// Changes at or before this position were already delivered
    skip_through: Option<ReplicationPosition>,
    target: Option<ReplicationPosition>,
    attempts: u32,
}

enum Step {
    Emit(Message),
    Continue,
    End,
}

enum Outcome {
    Step(Result<Step>),
    Cancelled,
    TimedOut,
}

/// One sync invocation
///
/// Call [`SyncRun::next_message`] until it returns `None`, or turn the run into
/// a stream with [`SyncRun::into_stream`].
pub struct SyncRun {
    query: Arc<dyn SnapshotQuery>,
    transport: Option<Arc<dyn ChangeTransport>>,
    catalog: ConfiguredCatalog,
    /// Incremental streams of the catalog
    wanted: BTreeSet<StreamIdentifier>,
    inject_metadata: bool,
    config: SyncConfig,
    state: StateManager,
    stage: Stage,
    phase: SyncPhase,
    cancel: CancellationToken,
    cancel_handled: bool,
    started: Instant,
    deadline: Option<Instant>,
    stats: SyncStats,
    since_checkpoint: usize,
    last_checkpoint_at: Instant,
    /// State revision covered by the last checkpoint
    checkpointed_revision: Option<u64>,
    /// Log tip captured before a first snapshot in global mode
    snapshot_origin: Option<ReplicationPosition>,
    /// Position of delivered changes not yet committed
    pending_position: Option<ReplicationPosition>,
    /// Cursor of delivered rows not yet committed, per stream
    pending_cursors: BTreeMap<StreamIdentifier, CursorValue>,
}

impl std::fmt::Debug for SyncRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRun")
            .field("phase", &self.phase)
            .field("mode", &self.state.mode())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SyncRun {
    /// Current phase
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Token that cancels the run cooperatively
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Statistics so far
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Copy of the committed state
    pub fn state(&self) -> SyncState {
        self.state.snapshot()
    }

    /// Next message, `None` once the run is over
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        loop {
            let step = match self.guarded_step().await {
                Outcome::Step(result) => result,
                Outcome::Cancelled => {
                    self.on_cancel().await;
                    Ok(Step::Continue)
                }
                Outcome::TimedOut => Ok(self.on_timeout().await),
            };

            match step {
                Ok(Step::Emit(message)) => return Some(Ok(message)),
                Ok(Step::Continue) => {}
                Ok(Step::End) => return None,
                Err(e) => {
                    self.abort(&e).await;
                    return Some(Err(e));
                }
            }
        }
    }

    /// Turn the run into a stream of messages
    pub fn into_stream(self) -> MessageStream {
        Box::pin(futures::stream::unfold(self, |mut run| async move {
            run.next_message().await.map(|message| (message, run))
        }))
    }

    async fn guarded_step(&mut self) -> Outcome {
        if matches!(
            self.stage,
            Stage::Finishing | Stage::Failing(_) | Stage::Finished
        ) {
            return Outcome::Step(self.step().await);
        }

        let cancel = self.cancel.clone();
        let watch_cancel = !self.cancel_handled;
        let deadline = self.deadline;

        tokio::select! {
            biased;
            () = cancel.cancelled(), if watch_cancel => Outcome::Cancelled,
            () = sleep_until(deadline) => Outcome::TimedOut,
            result = self.step() => Outcome::Step(result),
        }
    }

    async fn step(&mut self) -> Result<Step> {
        match &mut self.stage {
            Stage::Start => self.start().await,
            Stage::Snapshotting(_) => self.snapshot_step().await,
            Stage::Streaming(_) => self.stream_step().await,
            Stage::Finishing => Ok(self.finish()),
            Stage::Failing(_) => match std::mem::replace(&mut self.stage, Stage::Finished) {
                Stage::Failing(e) => Err(e),
                _ => Ok(Step::End),
            },
            Stage::Finished => Ok(Step::End),
        }
    }

    fn transport(&self) -> Result<Arc<dyn ChangeTransport>> {
        self.transport
            .clone()
            .ok_or_else(|| Error::config("global state mode needs a change transport"))
    }

    // ========================================================================
    // Start
    // ========================================================================

    async fn start(&mut self) -> Result<Step> {
        let mode = self.state.mode();
        info!(%mode, streams = self.catalog.streams.len(), "starting sync");

        let requests = match mode {
            StateMode::Global => {
                let forgotten = self.state.retain_synced(&self.wanted);
                if !forgotten.is_empty() {
                    let names: Vec<String> = forgotten.iter().map(ToString::to_string).collect();
                    warn!(
                        streams = ?names,
                        "untracked streams will be snapshotted again when re-added"
                    );
                }

                let prior = self.state.snapshot();
                let to_snapshot =
                    classify(&self.wanted, Some(&prior), self.config.initial_snapshot);
                let requests: Vec<SnapshotRequest> = self
                    .catalog
                    .streams
                    .iter()
                    .filter(|s| !s.is_incremental() || to_snapshot.contains(&s.stream))
                    .map(|s| SnapshotRequest::full(s.stream.clone()))
                    .collect();

                if !requests.is_empty() && self.state.position().is_none() {
                    let transport = self.transport()?;
                    let origin = transport.current_position().await?;
                    debug!(%origin, "captured snapshot origin");
                    self.snapshot_origin = Some(origin);
                }
                requests
            }
            StateMode::PerStream => self
                .catalog
                .streams
                .iter()
                .map(|s| match s.cursor_field() {
                    Some(field) => SnapshotRequest::ordered(
                        s.stream.clone(),
                        field.to_vec(),
                        self.state.stream_cursor(&s.stream).cloned(),
                    ),
                    None => SnapshotRequest::full(s.stream.clone()),
                })
                .collect(),
        };

        if requests.is_empty() {
            return match mode {
                StateMode::Global => self.enter_streaming().await,
                StateMode::PerStream => {
                    self.stage = Stage::Finishing;
                    Ok(Step::Continue)
                }
            };
        }

        self.phase = SyncPhase::Snapshotting;
        let producer = SnapshotProducer::new(
            Arc::clone(&self.query),
            requests,
            self.config.snapshot_concurrency,
            self.config.retry,
        );
        self.stage = Stage::Snapshotting(SnapshotStage {
            producer,
            held: None,
        });
        Ok(Step::Continue)
    }

    // ========================================================================
    // Snapshotting
    // ========================================================================

    async fn snapshot_step(&mut self) -> Result<Step> {
        let item = match &mut self.stage {
            Stage::Snapshotting(snap) => match snap.held.take() {
                Some(item) => Some(item),
                None => snap.producer.next().await?,
            },
            _ => return Ok(Step::Continue),
        };

        match item {
            Some(SnapshotItem::Row { stream, row }) => Ok(self.snapshot_row(stream, row)),
            Some(SnapshotItem::StreamComplete(stream)) => self.snapshot_stream_complete(stream),
            None => self.snapshot_finished().await,
        }
    }

    fn snapshot_row(&mut self, stream: StreamIdentifier, row: Row) -> Step {
        if self.state.mode() == StateMode::Global {
            let data = if self.inject_metadata {
                inject_snapshot_metadata(row, self.snapshot_origin.or(self.state.position()))
            } else {
                row
            };
            self.stats.add_snapshot_record();
            return Step::Emit(Message::record(stream, data, None));
        }

        let cursor = self
            .catalog
            .get(&stream)
            .and_then(|s| s.cursor_field())
            .and_then(|field| CursorValue::from_record(&row, field));

        if let Some(cursor) = &cursor {
            self.commit_cursor_group(&stream, cursor);
        }

        if self.checkpoint_due() {
            if let Stage::Snapshotting(snap) = &mut self.stage {
                snap.held = Some(SnapshotItem::Row { stream, row });
            }
            return Step::Emit(self.checkpoint());
        }

        if let Some(cursor) = cursor {
            let newer = self
                .pending_cursors
                .get(&stream)
                .map_or(true, |pending| cursor.compare(pending) == Ordering::Greater);
            if newer {
                self.pending_cursors.insert(stream.clone(), cursor);
            }
        }

        self.since_checkpoint += 1;
        self.stats.add_snapshot_record();
        Step::Emit(Message::record(stream, row, None))
    }

    /// Commit the pending cursor of `stream` once a greater cursor shows up
    fn commit_cursor_group(&mut self, stream: &StreamIdentifier, next: &CursorValue) {
        let Some(pending) = self.pending_cursors.get(stream) else {
            return;
        };
        if next.compare(pending) == Ordering::Greater {
            if let Some(pending) = self.pending_cursors.remove(stream) {
                self.state.advance_stream_cursor(stream, pending);
            }
        }
    }

    fn snapshot_stream_complete(&mut self, stream: StreamIdentifier) -> Result<Step> {
        self.stats.add_stream();

        match self.state.mode() {
            StateMode::Global => {
                if self.wanted.contains(&stream) {
                    self.state.mark_stream_snapshot_complete(&stream)?;
                    if let (None, Some(origin)) = (self.state.position(), self.snapshot_origin) {
                        self.state.advance_position(origin);
                    }
                }
            }
            StateMode::PerStream => {
                if let Some(cursor) = self.pending_cursors.remove(&stream) {
                    self.state.advance_stream_cursor(&stream, cursor);
                }
            }
        }

        info!(%stream, "stream snapshot complete");
        Ok(Step::Emit(self.checkpoint()))
    }

    async fn snapshot_finished(&mut self) -> Result<Step> {
        self.release().await;
        info!(streams = self.stats.streams_snapshotted, "snapshot phase complete");

        match self.state.mode() {
            StateMode::Global => self.enter_streaming().await,
            StateMode::PerStream => {
                self.stage = Stage::Finishing;
                Ok(Step::Continue)
            }
        }
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    async fn enter_streaming(&mut self) -> Result<Step> {
        let transport = self.transport()?;

        let resume = match self.state.position() {
            Some(position) => position,
            None => {
                let tip = match self.snapshot_origin {
                    Some(origin) => origin,
                    None => transport.current_position().await?,
                };
                self.state.advance_position(tip);
                tip
            }
        };

        let target = match self.config.streaming_bound {
            StreamingBound::UntilTargetAtStart => Some(transport.current_position().await?),
            StreamingBound::Unbounded => None,
        };

        info!(
            resume = %resume,
            target = ?target.map(ReplicationPosition::as_u64),
            "entering change streaming"
        );
        self.phase = SyncPhase::Streaming;
        self.stage = Stage::Streaming(StreamStage {
            reader: None,
            held: None,
            restart_from: resume,
            skip_through: None,
            target,
            attempts: 0,
        });
        Ok(Step::Continue)
    }

    async fn stream_step(&mut self) -> Result<Step> {
        let (restart_from, target) = match &self.stage {
            Stage::Streaming(s) if s.reader.is_none() => (s.restart_from, s.target),
            Stage::Streaming(_) => return self.poll_change().await,
            _ => return Ok(Step::Continue),
        };

        let transport = self.transport()?;
        let options = ReaderOptions {
            target,
            idle_poll_interval: self.config.idle_poll_interval,
            idle_timeout: self.config.idle_timeout,
        };

        match ChangeStreamReader::open(transport.as_ref(), restart_from, options).await {
            Ok(reader) => {
                if let Stage::Streaming(s) = &mut self.stage {
                    s.reader = Some(reader);
                }
                Ok(Step::Continue)
            }
            Err(e) => self.retry_streaming(transport_error(restart_from, e)).await,
        }
    }

    async fn poll_change(&mut self) -> Result<Step> {
        let polled = match &mut self.stage {
            Stage::Streaming(s) => match (s.held.take(), s.reader.as_mut()) {
                (Some((event, position)), _) => Ok(ReaderPoll::Change(event, position)),
                (None, Some(reader)) => reader.poll().await,
                (None, None) => Ok(ReaderPoll::Idle),
            },
            _ => return Ok(Step::Continue),
        };

        match polled {
            Ok(ReaderPoll::Change(event, position)) => Ok(self.on_change(event, position)),
            Ok(ReaderPoll::Idle) => Ok(self.on_idle()),
            Ok(ReaderPoll::Exhausted) => Ok(self.on_exhausted().await),
            Err(e) => self.retry_streaming(e).await,
        }
    }

    fn on_change(&mut self, event: ChangeEvent, position: ReplicationPosition) -> Step {
        if let Stage::Streaming(s) = &self.stage {
            if s.skip_through.is_some_and(|skip| position <= skip) {
                debug!(%position, "skipping change delivered before restart");
                return Step::Continue;
            }
        }

        if self.pending_position.is_some_and(|pending| position > pending) {
            self.commit_position();
        }

        if !self.wanted.contains(&event.stream) {
            debug!(stream = %event.stream, %position, "change for stream outside the catalog");
            self.note_position(position);
            return Step::Continue;
        }

        if self.checkpoint_due() {
            if let Stage::Streaming(s) = &mut self.stage {
                s.held = Some((event, position));
            }
            return Step::Emit(self.checkpoint());
        }

        let data = if self.inject_metadata {
            inject_change_metadata(&event, position)
        } else {
            event.data
        };

        self.note_position(position);
        self.since_checkpoint += 1;
        self.stats.add_change_record();
        Step::Emit(Message::record(event.stream, data, Some(position)))
    }

    fn on_idle(&mut self) -> Step {
        self.commit_position();
        if self.checkpoint_due() {
            return Step::Emit(self.checkpoint());
        }
        Step::Continue
    }

    async fn on_exhausted(&mut self) -> Step {
        self.commit_position();
        self.release().await;
        info!(
            position = ?self.state.position().map(ReplicationPosition::as_u64),
            "change stream exhausted"
        );
        self.stage = Stage::Finishing;
        Step::Continue
    }

    /// Close the reader and schedule a reopen after a transient failure
    async fn retry_streaming(&mut self, err: Error) -> Result<Step> {
        if !err.is_transient() {
            return Err(err);
        }

        let confirmed = self.state.position();
        let Stage::Streaming(s) = &mut self.stage else {
            return Err(err);
        };

        if s.attempts >= self.config.retry.max_retries {
            return Err(Error::RetriesExhausted {
                phase: Phase::Streaming,
                attempts: s.attempts + 1,
                last_error: err.to_string(),
            });
        }

        let delay = self.config.retry.backoff(s.attempts);
        s.attempts += 1;
        s.held = None;
        s.skip_through = confirmed;
        if let Some(mut reader) = s.reader.take() {
            if let Err(e) = reader.close().await {
                warn!(error = %e, "failed to close change stream");
            }
        }

        self.stats.retries += 1;
        warn!(
            attempt = s.attempts,
            restart_from = %s.restart_from,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "reopening change stream after transient error"
        );
        tokio::time::sleep(delay).await;
        Ok(Step::Continue)
    }

    fn note_position(&mut self, position: ReplicationPosition) {
        self.pending_position = Some(
            self.pending_position
                .map_or(position, |pending| pending.max(position)),
        );
    }

    fn commit_position(&mut self) {
        if let Some(position) = self.pending_position.take() {
            self.state.advance_position(position);
        }
    }

    // ========================================================================
    // Checkpoints and Termination
    // ========================================================================

    fn checkpoint_due(&self) -> bool {
        if self.since_checkpoint == 0 {
            return false;
        }
        let every = self.config.checkpoint_every_records;
        let by_count = every > 0 && self.since_checkpoint >= every;
        let by_time = self.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval;

        (by_count || by_time) && self.checkpointed_revision != Some(self.state.revision())
    }

    fn checkpoint(&mut self) -> Message {
        let state = self.state.snapshot();
        self.since_checkpoint = 0;
        self.last_checkpoint_at = Instant::now();
        self.stats.add_checkpoint();

        if let (Stage::Streaming(s), Some(position)) = (&mut self.stage, state.shared_position()) {
            s.restart_from = position;
            s.attempts = 0;
        }

        debug!(
            position = ?state.shared_position().map(ReplicationPosition::as_u64),
            "checkpoint"
        );
        self.checkpointed_revision = Some(self.state.revision());
        Message::Checkpoint(state)
    }

    fn finish(&mut self) -> Step {
        self.stage = Stage::Finished;
        self.phase = SyncPhase::Done;
        self.stats.set_duration(self.started.elapsed().as_millis() as u64);
        info!(
            records = self.stats.records_emitted,
            checkpoints = self.stats.checkpoints + 1,
            duration_ms = self.stats.duration_ms,
            "sync complete"
        );
        Step::Emit(self.checkpoint())
    }

    /// Release the snapshot producer or change reader of the current stage
    async fn release(&mut self) {
        match &mut self.stage {
            Stage::Snapshotting(snap) => {
                snap.producer.close().await;
                self.stats.retries += snap.producer.retries();
                snap.held = None;
            }
            Stage::Streaming(s) => {
                if let Some(mut reader) = s.reader.take() {
                    if let Err(e) = reader.close().await {
                        warn!(error = %e, "failed to close change stream");
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_cancel(&mut self) {
        self.cancel_handled = true;
        info!(phase = ?self.phase, "sync cancelled");

        let streaming = matches!(self.stage, Stage::Streaming(_));
        self.release().await;
        if streaming {
            self.commit_position();
        }
        if !matches!(self.stage, Stage::Finished) {
            self.stage = Stage::Finishing;
        }
    }

    async fn on_timeout(&mut self) -> Step {
        let timeout_ms = self
            .config
            .timeout
            .map_or(0, |t| t.as_millis() as u64);
        warn!(timeout_ms, phase = ?self.phase, "sync timed out");

        let streaming = matches!(self.stage, Stage::Streaming(_));
        self.release().await;
        if streaming {
            self.commit_position();
        }

        self.stage = Stage::Failing(Error::Timeout { timeout_ms });
        Step::Emit(self.checkpoint())
    }

    async fn abort(&mut self, err: &Error) {
        self.release().await;
        self.stage = Stage::Finished;
        self.phase = SyncPhase::Failed;
        self.stats.set_duration(self.started.elapsed().as_millis() as u64);
        error!(error = %err, "sync failed");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
