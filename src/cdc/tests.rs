//! Tests for the change-stream reader

use super::*;
use crate::source::{MemoryChangeLog, ResourceEvent, ResourceLog};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

fn users() -> StreamIdentifier {
    StreamIdentifier::new("public", "users")
}

fn pos(value: u64) -> ReplicationPosition {
    ReplicationPosition::new(value)
}

fn insert(id: u64) -> ChangeEvent {
    ChangeEvent {
        stream: users(),
        op: ChangeOp::Insert,
        data: json!({"id": id}).as_object().cloned().unwrap(),
        committed_at: None,
    }
}

/// Transport replaying a fixed script of polls, regardless of resume position
struct ScriptedTransport {
    script: Vec<FeedPoll>,
    tip: ReplicationPosition,
    closed: Arc<Mutex<bool>>,
}

struct ScriptedFeed {
    polls: VecDeque<FeedPoll>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn poll(&mut self) -> Result<FeedPoll> {
        Ok(self.polls.pop_front().unwrap_or(FeedPoll::Exhausted))
    }

    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

#[async_trait]
impl ChangeTransport for ScriptedTransport {
    async fn current_position(&self) -> Result<ReplicationPosition> {
        Ok(self.tip)
    }

    async fn open(&self, _resume_from: ReplicationPosition) -> Result<Box<dyn ChangeFeed>> {
        Ok(Box::new(ScriptedFeed {
            polls: self.script.clone().into(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

fn scripted(script: Vec<FeedPoll>) -> ScriptedTransport {
    ScriptedTransport {
        script,
        tip: pos(100),
        closed: Arc::new(Mutex::new(false)),
    }
}

async fn positions(reader: &mut ChangeStreamReader) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        match reader.poll().await.unwrap() {
            ReaderPoll::Change(_, position) => seen.push(position.as_u64()),
            ReaderPoll::Idle => {}
            ReaderPoll::Exhausted => return seen,
        }
    }
}

fn quiet() -> ReaderOptions {
    ReaderOptions {
        idle_poll_interval: Duration::from_millis(1),
        ..ReaderOptions::default()
    }
}

// ============================================================================
// Ordering Tests
// ============================================================================

#[tokio::test]
async fn test_skips_replayed_and_out_of_order_events() {
    let transport = scripted(vec![
        FeedPoll::Event(insert(1), pos(3)),
        FeedPoll::Event(insert(2), pos(5)),
        FeedPoll::Event(insert(3), pos(7)),
        FeedPoll::Event(insert(4), pos(6)),
        FeedPoll::Event(insert(5), pos(7)),
        FeedPoll::Event(insert(6), pos(9)),
    ]);

    let mut reader = ChangeStreamReader::open(&transport, pos(5), quiet())
        .await
        .unwrap();

    // 3 and 5 replay history, 6 goes backwards; 7 twice is one transaction
    assert_eq!(positions(&mut reader).await, vec![7, 7, 9]);
    assert_eq!(reader.last_position(), pos(9));
    assert!(*transport.closed.lock().unwrap());
}

#[tokio::test]
async fn test_idle_is_not_end_of_stream() {
    let transport = scripted(vec![
        FeedPoll::Idle,
        FeedPoll::Idle,
        FeedPoll::Event(insert(1), pos(2)),
        FeedPoll::Idle,
        FeedPoll::Event(insert(2), pos(3)),
    ]);

    let mut reader = ChangeStreamReader::open(&transport, pos(0), quiet())
        .await
        .unwrap();

    assert_eq!(reader.poll().await.unwrap(), ReaderPoll::Idle);
    assert_eq!(reader.poll().await.unwrap(), ReaderPoll::Idle);
    assert_eq!(positions(&mut reader).await, vec![2, 3]);
}

// ============================================================================
// Bounded Run Tests
// ============================================================================

#[tokio::test]
async fn test_stops_at_target_position() {
    let transport = scripted(vec![
        FeedPoll::Event(insert(1), pos(11)),
        FeedPoll::Event(insert(2), pos(12)),
        FeedPoll::Event(insert(3), pos(13)),
    ]);
    let options = ReaderOptions {
        target: Some(pos(12)),
        ..quiet()
    };

    let mut reader = ChangeStreamReader::open(&transport, pos(10), options)
        .await
        .unwrap();

    assert_eq!(positions(&mut reader).await, vec![11, 12]);
    assert!(!reader.is_open());
}

#[tokio::test]
async fn test_target_keeps_whole_transaction() {
    let transport = scripted(vec![
        FeedPoll::Event(insert(1), pos(12)),
        FeedPoll::Event(insert(2), pos(12)),
        FeedPoll::Idle,
        FeedPoll::Event(insert(3), pos(12)),
    ]);
    let options = ReaderOptions {
        target: Some(pos(12)),
        ..quiet()
    };

    let mut reader = ChangeStreamReader::open(&transport, pos(10), options)
        .await
        .unwrap();

    // idle after reaching the target ends the run
    assert_eq!(positions(&mut reader).await, vec![12, 12]);
    assert!(*transport.closed.lock().unwrap());
}

#[tokio::test]
async fn test_target_at_resume_is_immediately_exhausted() {
    let transport = scripted(vec![FeedPoll::Event(insert(1), pos(11))]);
    let options = ReaderOptions {
        target: Some(pos(10)),
        ..quiet()
    };

    let mut reader = ChangeStreamReader::open(&transport, pos(10), options)
        .await
        .unwrap();

    assert_eq!(reader.poll().await.unwrap(), ReaderPoll::Exhausted);
    assert!(*transport.closed.lock().unwrap());
}

#[tokio::test]
async fn test_target_beyond_gap_stops_on_later_event() {
    let transport = scripted(vec![
        FeedPoll::Event(insert(1), pos(11)),
        FeedPoll::Event(insert(2), pos(20)),
    ]);
    let options = ReaderOptions {
        target: Some(pos(15)),
        ..quiet()
    };

    let mut reader = ChangeStreamReader::open(&transport, pos(10), options)
        .await
        .unwrap();

    assert_eq!(positions(&mut reader).await, vec![11]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_exhausts() {
    let log = MemoryChangeLog::new().following(true);
    let options = ReaderOptions {
        target: None,
        idle_poll_interval: Duration::from_millis(100),
        idle_timeout: Some(Duration::from_millis(250)),
    };

    let mut reader = ChangeStreamReader::open(&log, pos(0), options)
        .await
        .unwrap();

    assert_eq!(positions(&mut reader).await, Vec::<u64>::new());
    assert!(!reader.is_open());
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_close_is_idempotent_and_stops_delivery() {
    let resources = ResourceLog::new();
    let log = MemoryChangeLog::new().with_log(resources.clone());
    log.push_change(1, users(), ChangeOp::Insert, json!({"id": 1}), None);
    log.push_change(2, users(), ChangeOp::Insert, json!({"id": 2}), None);

    let mut reader = ChangeStreamReader::open(&log, pos(0), quiet()).await.unwrap();
    assert!(matches!(
        reader.poll().await.unwrap(),
        ReaderPoll::Change(_, _)
    ));

    reader.close().await.unwrap();
    reader.close().await.unwrap();

    assert_eq!(reader.poll().await.unwrap(), ReaderPoll::Exhausted);
    assert_eq!(
        resources.events(),
        vec![ResourceEvent::FeedOpened(pos(0)), ResourceEvent::FeedClosed]
    );
}

#[tokio::test]
async fn test_expired_position_fails_open() {
    let log = MemoryChangeLog::new();
    log.push_change(50, users(), ChangeOp::Insert, json!({"id": 1}), None);
    log.purge_through(pos(40));

    let err = ChangeStreamReader::open(&log, pos(30), quiet())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PositionExpired { position } if position == pos(30)));
}

#[tokio::test]
async fn test_transient_poll_error_surfaces() {
    let log = MemoryChangeLog::new().following(true);
    log.fail_next_polls(1);

    let mut reader = ChangeStreamReader::open(&log, pos(0), quiet()).await.unwrap();
    assert!(reader.poll().await.unwrap_err().is_transient());
    assert_eq!(reader.poll().await.unwrap(), ReaderPoll::Idle);
}

#[test]
fn test_transport_error_keeps_typed_errors() {
    let expired = transport_error(
        pos(1),
        Error::PositionExpired {
            position: pos(1),
        },
    );
    assert!(expired.requires_resnapshot());

    let wrapped = transport_error(pos(8), Error::database("socket closed"));
    assert!(matches!(wrapped, Error::Transport { position, .. } if position == pos(8)));
}
