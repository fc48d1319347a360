//! Snapshot production
//!
//! Reads the full current contents of a set of streams through the snapshot
//! query collaborator, one stream at a time or on parallel workers.
//!
//! # Overview
//!
//! The snapshot module provides:
//! - `SnapshotQuery` / `RowCursor` - collaborator traits for query execution
//! - `SnapshotProducer` - ordered, retrying, eagerly closed row sequence
//! - `SnapshotItem` - a row or the end of one stream

use crate::catalog::StreamIdentifier;
use crate::error::{Error, Phase, Result};
use crate::state::CursorValue;
use crate::types::{JsonObject, RetryPolicy};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A row read from the source
pub type Row = JsonObject;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// What to read for one stream
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    /// Stream to read
    pub stream: StreamIdentifier,

    /// Order rows by this field (ascending)
    pub cursor_field: Option<Vec<String>>,

    /// Only rows whose cursor is greater than this value
    pub after: Option<CursorValue>,
}

impl SnapshotRequest {
    /// Full read of a stream
    pub fn full(stream: StreamIdentifier) -> Self {
        Self {
            stream,
            cursor_field: None,
            after: None,
        }
    }

    /// Ordered read of a stream after an optional cursor value
    pub fn ordered(
        stream: StreamIdentifier,
        cursor_field: Vec<String>,
        after: Option<CursorValue>,
    ) -> Self {
        Self {
            stream,
            cursor_field: Some(cursor_field),
            after,
        }
    }
}

/// Open result set of one stream
#[async_trait]
pub trait RowCursor: Send {
    /// Next row, `None` at the end of the stream
    async fn next_row(&mut self) -> Result<Option<Row>>;

    /// Release the underlying connection or cursor
    async fn close(&mut self) -> Result<()>;
}

/// Executes snapshot queries
#[async_trait]
pub trait SnapshotQuery: Send + Sync {
    /// Open a cursor over a stream's rows
    async fn execute(&self, request: &SnapshotRequest) -> Result<Box<dyn RowCursor>>;
}

// ============================================================================
// Producer
// ============================================================================

/// Item produced by a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotItem {
    /// A row of a stream
    Row {
        /// Stream the row belongs to
        stream: StreamIdentifier,
        /// Row data
        row: Row,
    },
    /// Every row of the stream was produced
    StreamComplete(StreamIdentifier),
}

/// Finite, non-restartable sequence of snapshot rows
///
/// Rows of a stream are always produced in order. With more than one worker
/// rows of different streams may interleave.
pub struct SnapshotProducer {
    inner: Inner,
    retries: Arc<AtomicU32>,
    finished: bool,
}

enum Inner {
    Sequential(Sequential),
    Parallel(Parallel),
}

impl std::fmt::Debug for SnapshotProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.inner {
            Inner::Sequential(_) => "sequential",
            Inner::Parallel(_) => "parallel",
        };
        f.debug_struct("SnapshotProducer")
            .field("mode", &mode)
            .field("finished", &self.finished)
            .finish()
    }
}

impl SnapshotProducer {
    /// Create a producer over `requests`, read in the given order
    pub fn new(
        query: Arc<dyn SnapshotQuery>,
        requests: Vec<SnapshotRequest>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        let retries = Arc::new(AtomicU32::new(0));
        let names: Vec<String> = requests.iter().map(|r| r.stream.to_string()).collect();
        info!(streams = ?names, concurrency, "starting snapshot");

        let inner = if concurrency > 1 && requests.len() > 1 {
            Inner::Parallel(Parallel::spawn(
                query,
                requests,
                concurrency,
                retry,
                Arc::clone(&retries),
            ))
        } else {
            Inner::Sequential(Sequential {
                query,
                pending: requests.into(),
                current: None,
                attempts: 0,
                retry,
                retries: Arc::clone(&retries),
            })
        };

        Self {
            inner,
            retries,
            finished: false,
        }
    }

    /// Next item, `None` when every stream completed
    pub async fn next(&mut self) -> Result<Option<SnapshotItem>> {
        if self.finished {
            return Ok(None);
        }

        let item = match &mut self.inner {
            Inner::Sequential(seq) => seq.next().await,
            Inner::Parallel(par) => par.next().await,
        };

        match item {
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
            other => other,
        }
    }

    /// Release every open cursor (idempotent)
    ///
    /// Returns once all workers have exited and their cursors are closed.
    pub async fn close(&mut self) {
        self.finished = true;
        match &mut self.inner {
            Inner::Sequential(seq) => seq.close().await,
            Inner::Parallel(par) => par.close().await,
        }
    }

    /// Number of transient-failure restarts so far
    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Convert a read failure into the error reported for the snapshot phase
fn snapshot_error(stream: &StreamIdentifier, err: Error) -> Error {
    match err {
        e @ (Error::SnapshotFailure { .. } | Error::PositionExpired { .. }) => e,
        other => Error::snapshot(stream.to_string(), other.to_string()),
    }
}

fn exhausted(stream: &StreamIdentifier, attempts: u32, err: &Error) -> Error {
    Error::RetriesExhausted {
        phase: Phase::Snapshot,
        attempts,
        last_error: format!("stream '{stream}': {err}"),
    }
}

async fn close_cursor(stream: &StreamIdentifier, cursor: &mut Box<dyn RowCursor>) {
    if let Err(e) = cursor.close().await {
        warn!(%stream, error = %e, "failed to close snapshot cursor");
    }
}

/// Close the cursor of a fully read stream; a failed close fails the stream
async fn close_completed(stream: &StreamIdentifier, cursor: &mut Box<dyn RowCursor>) -> Result<()> {
    cursor.close().await.map_err(|e| {
        Error::snapshot(
            stream.to_string(),
            format!("cursor failed to close after the last row: {e}"),
        )
    })
}

// ============================================================================
// Sequential Reader
// ============================================================================

struct Sequential {
    query: Arc<dyn SnapshotQuery>,
    pending: VecDeque<SnapshotRequest>,
    current: Option<(SnapshotRequest, Box<dyn RowCursor>)>,
    attempts: u32,
    retry: RetryPolicy,
    retries: Arc<AtomicU32>,
}

impl Sequential {
    async fn next(&mut self) -> Result<Option<SnapshotItem>> {
        loop {
            let Some((request, cursor)) = self.current.as_mut() else {
                let Some(request) = self.pending.pop_front() else {
                    return Ok(None);
                };
                match self.query.execute(&request).await {
                    Ok(cursor) => {
                        debug!(stream = %request.stream, "snapshot cursor opened");
                        self.current = Some((request, cursor));
                    }
                    Err(e) => self.retry_or_fail(request, e).await?,
                }
                continue;
            };

            match cursor.next_row().await {
                Ok(Some(row)) => {
                    return Ok(Some(SnapshotItem::Row {
                        stream: request.stream.clone(),
                        row,
                    }))
                }
                Ok(None) => {
                    let (request, mut cursor) = self.take_current()?;
                    close_completed(&request.stream, &mut cursor).await?;
                    self.attempts = 0;
                    debug!(stream = %request.stream, "snapshot stream complete");
                    return Ok(Some(SnapshotItem::StreamComplete(request.stream)));
                }
                Err(e) => {
                    let (request, mut cursor) = self.take_current()?;
                    close_cursor(&request.stream, &mut cursor).await;
                    self.retry_or_fail(request, e).await?;
                }
            }
        }
    }

    fn take_current(&mut self) -> Result<(SnapshotRequest, Box<dyn RowCursor>)> {
        self.current
            .take()
            .ok_or_else(|| Error::Other("snapshot cursor vanished".to_string()))
    }

    /// Requeue a stream after a transient failure, or surface the error
    async fn retry_or_fail(&mut self, request: SnapshotRequest, err: Error) -> Result<()> {
        if !err.is_transient() {
            return Err(snapshot_error(&request.stream, err));
        }
        if self.attempts >= self.retry.max_retries {
            return Err(exhausted(&request.stream, self.attempts + 1, &err));
        }

        let delay = self.retry.backoff(self.attempts);
        self.attempts += 1;
        self.retries.fetch_add(1, Ordering::Relaxed);
        warn!(
            stream = %request.stream,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "restarting stream snapshot after transient error"
        );
        tokio::time::sleep(delay).await;
        self.pending.push_front(request);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some((request, mut cursor)) = self.current.take() {
            debug!(stream = %request.stream, "aborting snapshot stream");
            close_cursor(&request.stream, &mut cursor).await;
        }
        self.pending.clear();
    }
}

// ============================================================================
// Parallel Workers
// ============================================================================

enum WorkerMsg {
    Row(StreamIdentifier, Row),
    Complete(StreamIdentifier),
    Failed(Error),
}

struct Parallel {
    rx: mpsc::Receiver<WorkerMsg>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
}

impl Parallel {
    fn spawn(
        query: Arc<dyn SnapshotQuery>,
        requests: Vec<SnapshotRequest>,
        concurrency: usize,
        retry: RetryPolicy,
        retries: Arc<AtomicU32>,
    ) -> Self {
        let worker_count = concurrency.min(requests.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(requests)));
        let (tx, rx) = mpsc::channel(worker_count * 64);
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for worker in 0..worker_count {
            let ctx = WorkerContext {
                query: Arc::clone(&query),
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                cancel: cancel.clone(),
                retry,
                retries: Arc::clone(&retries),
            };
            workers.spawn(async move {
                debug!(worker, "snapshot worker started");
                ctx.run().await;
                debug!(worker, "snapshot worker stopped");
            });
        }

        Self {
            rx,
            workers,
            cancel,
        }
    }

    async fn next(&mut self) -> Result<Option<SnapshotItem>> {
        match self.rx.recv().await {
            Some(WorkerMsg::Row(stream, row)) => Ok(Some(SnapshotItem::Row { stream, row })),
            Some(WorkerMsg::Complete(stream)) => Ok(Some(SnapshotItem::StreamComplete(stream))),
            Some(WorkerMsg::Failed(e)) => {
                self.close().await;
                Err(e)
            }
            None => {
                self.close().await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "snapshot worker panicked");
            }
        }
    }
}

struct WorkerContext {
    query: Arc<dyn SnapshotQuery>,
    queue: Arc<Mutex<VecDeque<SnapshotRequest>>>,
    tx: mpsc::Sender<WorkerMsg>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    retries: Arc<AtomicU32>,
}

impl WorkerContext {
    fn next_request(&self) -> Option<SnapshotRequest> {
        self.queue.lock().ok()?.pop_front()
    }

    async fn run(self) {
        while let Some(request) = self.next_request() {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.read_stream(&request).await {
                Ok(true) => {
                    if !self.send(WorkerMsg::Complete(request.stream)).await {
                        return;
                    }
                }
                Ok(false) => return,
                Err(e) => {
                    let _ = self.send(WorkerMsg::Failed(e)).await;
                    return;
                }
            }
        }
    }

    /// Read one stream to the end; `Ok(false)` when cancelled
    async fn read_stream(&self, request: &SnapshotRequest) -> Result<bool> {
        let mut attempts = 0;
        loop {
            match self.read_attempt(request).await {
                Ok(done) => return Ok(done),
                Err(e) if e.is_transient() && attempts < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempts);
                    attempts += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        stream = %request.stream,
                        attempt = attempts,
                        error = %e,
                        "restarting stream snapshot after transient error"
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(false),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(exhausted(&request.stream, attempts + 1, &e));
                }
                Err(e) => return Err(snapshot_error(&request.stream, e)),
            }
        }
    }

    async fn read_attempt(&self, request: &SnapshotRequest) -> Result<bool> {
        let mut cursor = self.query.execute(request).await?;
        match self.drain(request, &mut cursor).await {
            Ok(true) => {
                close_completed(&request.stream, &mut cursor).await?;
                Ok(true)
            }
            other => {
                close_cursor(&request.stream, &mut cursor).await;
                other
            }
        }
    }

    async fn drain(
        &self,
        request: &SnapshotRequest,
        cursor: &mut Box<dyn RowCursor>,
    ) -> Result<bool> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let Some(row) = cursor.next_row().await? else {
                return Ok(true);
            };
            if !self.send(WorkerMsg::Row(request.stream.clone(), row)).await {
                return Ok(false);
            }
        }
    }

    /// Deliver a message unless the producer was closed
    async fn send(&self, msg: WorkerMsg) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(msg) => sent.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests;
