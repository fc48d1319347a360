//! Tests for the snapshot producer

use super::*;
use crate::source::{FailureKind, MemoryTables, ResourceEvent, ResourceLog};
use crate::types::JsonValue;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn stream(name: &str) -> StreamIdentifier {
    StreamIdentifier::new("public", name)
}

fn rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| json!({"id": i}).as_object().cloned().unwrap())
        .collect()
}

fn tables(log: &ResourceLog) -> MemoryTables {
    MemoryTables::new()
        .with_log(log.clone())
        .with_table(stream("a"), rows(3))
        .with_table(stream("b"), rows(2))
        .with_table(stream("c"), rows(4))
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..RetryPolicy::default()
    }
}

async fn collect(producer: &mut SnapshotProducer) -> Result<Vec<SnapshotItem>> {
    let mut items = Vec::new();
    while let Some(item) = producer.next().await? {
        items.push(item);
    }
    Ok(items)
}

fn completions(items: &[SnapshotItem]) -> Vec<StreamIdentifier> {
    items
        .iter()
        .filter_map(|item| match item {
            SnapshotItem::StreamComplete(id) => Some(id.clone()),
            SnapshotItem::Row { .. } => None,
        })
        .collect()
}

fn ids_of(items: &[SnapshotItem], id: &StreamIdentifier) -> Vec<JsonValue> {
    items
        .iter()
        .filter_map(|item| match item {
            SnapshotItem::Row { stream, row } if stream == id => Some(row["id"].clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Sequential Tests
// ============================================================================

#[tokio::test]
async fn test_sequential_reads_in_catalog_order() {
    let log = ResourceLog::new();
    let requests = vec![
        SnapshotRequest::full(stream("b")),
        SnapshotRequest::full(stream("a")),
    ];
    let mut producer =
        SnapshotProducer::new(Arc::new(tables(&log)), requests, 1, RetryPolicy::none());

    let items = collect(&mut producer).await.unwrap();

    assert_eq!(items.len(), 2 + 1 + 3 + 1);
    assert_eq!(items[2], SnapshotItem::StreamComplete(stream("b")));
    assert_eq!(completions(&items), vec![stream("b"), stream("a")]);
    assert_eq!(
        log.events(),
        vec![
            ResourceEvent::SnapshotOpened(stream("b")),
            ResourceEvent::SnapshotClosed(stream("b")),
            ResourceEvent::SnapshotOpened(stream("a")),
            ResourceEvent::SnapshotClosed(stream("a")),
        ]
    );
    assert!(producer.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_request_set_finishes_immediately() {
    let log = ResourceLog::new();
    let mut producer =
        SnapshotProducer::new(Arc::new(tables(&log)), Vec::new(), 1, RetryPolicy::none());
    assert!(producer.next().await.unwrap().is_none());
    assert!(log.events().is_empty());
}

#[tokio::test]
async fn test_transient_failure_restarts_stream_from_scratch() {
    let log = ResourceLog::new();
    let source = tables(&log);
    source.inject_failure(stream("a"), 2, FailureKind::Transient, 1);

    let mut producer = SnapshotProducer::new(
        Arc::new(source),
        vec![SnapshotRequest::full(stream("a"))],
        1,
        fast_retry(2),
    );
    let items = collect(&mut producer).await.unwrap();

    // two rows before the failure, then the whole stream again
    assert_eq!(
        ids_of(&items, &stream("a")),
        vec![json!(0), json!(1), json!(0), json!(1), json!(2)]
    );
    assert_eq!(completions(&items), vec![stream("a")]);
    assert_eq!(producer.retries(), 1);
    assert_eq!(log.open_snapshots(), 0);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let log = ResourceLog::new();
    let source = tables(&log);
    source.inject_failure(stream("a"), 0, FailureKind::Transient, 5);

    let mut producer = SnapshotProducer::new(
        Arc::new(source),
        vec![SnapshotRequest::full(stream("a"))],
        1,
        fast_retry(2),
    );
    let err = collect(&mut producer).await.unwrap_err();

    assert!(matches!(
        err,
        Error::RetriesExhausted {
            phase: Phase::Snapshot,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(log.open_snapshots(), 0);
}

#[tokio::test]
async fn test_fatal_failure_names_stream() {
    let log = ResourceLog::new();
    let source = tables(&log);
    source.inject_failure(stream("b"), 1, FailureKind::Fatal, 1);

    let mut producer = SnapshotProducer::new(
        Arc::new(source),
        vec![
            SnapshotRequest::full(stream("a")),
            SnapshotRequest::full(stream("b")),
        ],
        1,
        fast_retry(3),
    );
    let err = collect(&mut producer).await.unwrap_err();

    match err {
        Error::SnapshotFailure { stream, .. } => assert_eq!(stream, "public.b"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(log.open_snapshots(), 0);
    assert!(producer.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_close_mid_stream_releases_cursor() {
    let log = ResourceLog::new();
    let mut producer = SnapshotProducer::new(
        Arc::new(tables(&log)),
        vec![SnapshotRequest::full(stream("c"))],
        1,
        RetryPolicy::none(),
    );

    assert!(matches!(
        producer.next().await.unwrap(),
        Some(SnapshotItem::Row { .. })
    ));
    assert_eq!(log.open_snapshots(), 1);

    producer.close().await;
    producer.close().await;

    assert_eq!(log.open_snapshots(), 0);
    assert!(producer.next().await.unwrap().is_none());
}

// ============================================================================
// Parallel Tests
// ============================================================================

#[tokio::test]
async fn test_parallel_preserves_intra_stream_order() {
    let log = ResourceLog::new();
    let requests = vec![
        SnapshotRequest::full(stream("a")),
        SnapshotRequest::full(stream("b")),
        SnapshotRequest::full(stream("c")),
    ];
    let mut producer =
        SnapshotProducer::new(Arc::new(tables(&log)), requests, 3, RetryPolicy::none());

    let items = collect(&mut producer).await.unwrap();

    assert_eq!(ids_of(&items, &stream("a")), vec![json!(0), json!(1), json!(2)]);
    assert_eq!(ids_of(&items, &stream("b")), vec![json!(0), json!(1)]);
    assert_eq!(
        ids_of(&items, &stream("c")),
        vec![json!(0), json!(1), json!(2), json!(3)]
    );

    for id in [stream("a"), stream("b"), stream("c")] {
        let complete_at = items
            .iter()
            .position(|i| *i == SnapshotItem::StreamComplete(id.clone()))
            .unwrap();
        let last_row = items
            .iter()
            .rposition(|i| matches!(i, SnapshotItem::Row { stream, .. } if *stream == id))
            .unwrap();
        assert!(last_row < complete_at);
    }
    assert_eq!(log.open_snapshots(), 0);
}

#[tokio::test]
async fn test_parallel_failure_stops_all_workers() {
    let log = ResourceLog::new();
    let source = tables(&log);
    source.inject_failure(stream("a"), 1, FailureKind::Fatal, 1);

    let requests = vec![
        SnapshotRequest::full(stream("a")),
        SnapshotRequest::full(stream("b")),
        SnapshotRequest::full(stream("c")),
    ];
    let mut producer = SnapshotProducer::new(Arc::new(source), requests, 2, RetryPolicy::none());

    let err = collect(&mut producer).await.unwrap_err();
    assert!(matches!(err, Error::SnapshotFailure { .. }));
    assert_eq!(log.open_snapshots(), 0);
}

#[tokio::test]
async fn test_parallel_close_releases_everything() {
    let log = ResourceLog::new();
    let requests = vec![
        SnapshotRequest::full(stream("a")),
        SnapshotRequest::full(stream("c")),
    ];
    let mut producer =
        SnapshotProducer::new(Arc::new(tables(&log)), requests, 2, RetryPolicy::none());

    producer.next().await.unwrap();
    producer.close().await;

    assert_eq!(log.open_snapshots(), 0);
    assert!(producer.next().await.unwrap().is_none());
}

// ============================================================================
// Cursor Close Failures
// ============================================================================

/// Source whose cursors yield their rows and then fail to close
struct BrokenCloseTables;

struct BrokenCloseCursor {
    rows: VecDeque<Row>,
}

#[async_trait]
impl RowCursor for BrokenCloseCursor {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        Err(Error::database("reader thread panicked"))
    }
}

#[async_trait]
impl SnapshotQuery for BrokenCloseTables {
    async fn execute(&self, _request: &SnapshotRequest) -> Result<Box<dyn RowCursor>> {
        Ok(Box::new(BrokenCloseCursor {
            rows: rows(2).into(),
        }))
    }
}

/// Items produced before the first error, and that error
async fn collect_until_error(
    producer: &mut SnapshotProducer,
) -> (Vec<SnapshotItem>, Option<Error>) {
    let mut items = Vec::new();
    loop {
        match producer.next().await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => return (items, None),
            Err(e) => return (items, Some(e)),
        }
    }
}

#[tokio::test]
async fn test_failed_close_after_last_row_fails_stream() {
    for concurrency in [1, 2] {
        let mut producer = SnapshotProducer::new(
            Arc::new(BrokenCloseTables),
            vec![
                SnapshotRequest::full(stream("a")),
                SnapshotRequest::full(stream("b")),
            ],
            concurrency,
            RetryPolicy::none(),
        );

        let (items, err) = collect_until_error(&mut producer).await;

        assert!(completions(&items).is_empty(), "concurrency {concurrency}");
        assert!(
            matches!(err, Some(Error::SnapshotFailure { .. })),
            "concurrency {concurrency}: {err:?}"
        );
        producer.close().await;
    }
}
