//! Change-stream reading
//!
//! Wraps an opaque, ordered change transport and replays committed changes
//! after a resume position.
//!
//! # Overview
//!
//! The cdc module provides:
//! - `ChangeTransport` / `ChangeFeed` - collaborator traits for the replication log
//! - `ChangeStreamReader` - position filtering, bounded runs and idle handling
//! - `metadata` - `_ab_cdc_*` column injection

pub mod metadata;

use crate::catalog::StreamIdentifier;
use crate::error::{Error, Result};
use crate::state::ReplicationPosition;
use crate::types::JsonObject;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// Change Events
// ============================================================================

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A committed row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Stream the row belongs to
    pub stream: StreamIdentifier,

    /// Operation
    pub op: ChangeOp,

    /// Row image (after image, or before image for deletes)
    #[serde(default)]
    pub data: JsonObject,

    /// Commit timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// One poll of a change feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPoll {
    /// Next change and its position
    Event(ChangeEvent, ReplicationPosition),
    /// Nothing available right now
    Idle,
    /// The feed has no more events and never will
    Exhausted,
}

/// Open change feed on the replication transport
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event, `Idle` when nothing is available yet
    async fn poll(&mut self) -> Result<FeedPoll>;

    /// Release transport resources
    async fn close(&mut self) -> Result<()>;
}

/// Log-based replication transport
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Current tip of the change log
    async fn current_position(&self) -> Result<ReplicationPosition>;

    /// Open a feed of events after `resume_from`
    ///
    /// Fails with [`Error::PositionExpired`] when the log no longer retains
    /// `resume_from`.
    async fn open(&self, resume_from: ReplicationPosition) -> Result<Box<dyn ChangeFeed>>;
}

// ============================================================================
// Reader
// ============================================================================

/// Reader tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Stop after the last event at this position (an idle transport or a later event)
    pub target: Option<ReplicationPosition>,

    /// Pause before reporting an idle transport
    pub idle_poll_interval: Duration,

    /// Treat the stream as exhausted after this much continuous idleness
    pub idle_timeout: Option<Duration>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            target: None,
            idle_poll_interval: Duration::from_millis(100),
            idle_timeout: None,
        }
    }
}

/// Result of polling the reader
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderPoll {
    /// Change at a position no earlier than any previously returned
    Change(ChangeEvent, ReplicationPosition),
    /// Transport is quiet; not an end of stream
    Idle,
    /// Planned end of the stream
    Exhausted,
}

/// Replays changes after a resume position in position order
pub struct ChangeStreamReader {
    feed: Option<Box<dyn ChangeFeed>>,
    resume_from: ReplicationPosition,
    last: ReplicationPosition,
    options: ReaderOptions,
    idle_since: Option<Instant>,
}

impl std::fmt::Debug for ChangeStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStreamReader")
            .field("open", &self.feed.is_some())
            .field("resume_from", &self.resume_from)
            .field("last", &self.last)
            .field("options", &self.options)
            .finish()
    }
}

impl ChangeStreamReader {
    /// Open the transport at `resume_from`
    pub async fn open(
        transport: &dyn ChangeTransport,
        resume_from: ReplicationPosition,
        options: ReaderOptions,
    ) -> Result<Self> {
        let feed = transport.open(resume_from).await?;
        info!(
            resume_from = %resume_from,
            target = ?options.target.map(ReplicationPosition::as_u64),
            "change stream opened"
        );

        Ok(Self {
            feed: Some(feed),
            resume_from,
            last: resume_from,
            options,
            idle_since: None,
        })
    }

    /// Position the reader was opened at
    pub fn resume_from(&self) -> ReplicationPosition {
        self.resume_from
    }

    /// Position of the last delivered change (or the resume position)
    pub fn last_position(&self) -> ReplicationPosition {
        self.last
    }

    /// Whether the transport is still open
    pub fn is_open(&self) -> bool {
        self.feed.is_some()
    }

    /// Next change
    ///
    /// Replayed events at or before the resume position and out-of-order
    /// events are skipped. Once the reader is closed or exhausted every poll
    /// returns [`ReaderPoll::Exhausted`].
    pub async fn poll(&mut self) -> Result<ReaderPoll> {
        loop {
            let Some(feed) = self.feed.as_mut() else {
                return Ok(ReaderPoll::Exhausted);
            };

            match feed.poll().await? {
                FeedPoll::Event(event, position) => {
                    self.idle_since = None;

                    if position <= self.resume_from {
                        debug!(%position, "skipping replayed change");
                        continue;
                    }
                    if position < self.last {
                        warn!(%position, last = %self.last, "skipping out-of-order change");
                        continue;
                    }
                    if self.options.target.is_some_and(|t| position > t) {
                        debug!(%position, "change beyond target position");
                        self.close().await?;
                        return Ok(ReaderPoll::Exhausted);
                    }

                    self.last = position;
                    return Ok(ReaderPoll::Change(event, position));
                }
                FeedPoll::Idle => {
                    if self.target_reached() {
                        debug!(last = %self.last, "change stream reached target position");
                        self.close().await?;
                        return Ok(ReaderPoll::Exhausted);
                    }

                    let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
                    if self
                        .options
                        .idle_timeout
                        .is_some_and(|timeout| idle_since.elapsed() >= timeout)
                    {
                        debug!("change stream idle timeout");
                        self.close().await?;
                        return Ok(ReaderPoll::Exhausted);
                    }

                    tokio::time::sleep(self.options.idle_poll_interval).await;
                    return Ok(ReaderPoll::Idle);
                }
                FeedPoll::Exhausted => {
                    self.close().await?;
                    return Ok(ReaderPoll::Exhausted);
                }
            }
        }
    }

    /// Release the transport (idempotent)
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut feed) = self.feed.take() {
            debug!(last = %self.last, "closing change stream");
            feed.close().await?;
        }
        Ok(())
    }

    /// Caught up with the target; later events at the same position stay deliverable
    fn target_reached(&self) -> bool {
        self.options.target.is_some_and(|t| self.last >= t)
    }
}

/// Map an open failure at `position` to a transport error unless it is already typed
pub fn transport_error(position: ReplicationPosition, err: Error) -> Error {
    match err {
        e @ (Error::PositionExpired { .. }
        | Error::TransientIo { .. }
        | Error::Transport { .. }) => e,
        other => Error::Transport {
            position,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests;
