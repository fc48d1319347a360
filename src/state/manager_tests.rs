//! Tests for StateManager and StateStore

use super::*;
use crate::catalog::StreamIdentifier;
use pretty_assertions::assert_eq;
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};

fn stream(name: &str) -> StreamIdentifier {
    StreamIdentifier::new("public", name)
}

fn pos(value: u64) -> ReplicationPosition {
    ReplicationPosition::new(value)
}

// ============================================================================
// Construction Tests
// ============================================================================

#[test]
fn test_new_global_manager_is_empty() {
    let manager = StateManager::new(StateMode::Global);
    assert_eq!(manager.mode(), StateMode::Global);
    assert!(manager.position().is_none());
    assert!(manager.snapshot().is_empty());
}

#[test]
fn test_from_prior_none_uses_empty_state() {
    let manager = StateManager::from_prior(None, StateMode::PerStream).unwrap();
    assert_eq!(manager.snapshot(), SyncState::empty(StateMode::PerStream));
}

#[test]
fn test_from_prior_rejects_mode_mismatch() {
    let prior = SyncState::empty(StateMode::PerStream);
    let err = StateManager::from_prior(Some(prior), StateMode::Global).unwrap_err();
    assert!(err.to_string().contains("per_stream"));
}

#[test]
fn test_empty_initial_state() {
    assert_eq!(
        StateManager::empty_initial_state(StateMode::Global),
        SyncState::Global(CdcState::default())
    );
}

// ============================================================================
// Global Mode Tests
// ============================================================================

#[test]
fn test_mark_stream_snapshot_complete_is_idempotent() {
    let mut manager = StateManager::new(StateMode::Global);

    manager.mark_stream_snapshot_complete(&stream("users")).unwrap();
    manager.mark_stream_snapshot_complete(&stream("users")).unwrap();

    let state = manager.snapshot();
    assert_eq!(state.streams_initial_sync().unwrap().len(), 1);
    assert!(manager.is_stream_synced(&stream("users")));
    assert!(!manager.is_stream_synced(&stream("orders")));
}

#[test]
fn test_mark_complete_in_per_stream_mode_fails() {
    let mut manager = StateManager::new(StateMode::PerStream);
    assert!(manager
        .mark_stream_snapshot_complete(&stream("users"))
        .is_err());
}

#[test]
fn test_advance_position_moves_forward() {
    let mut manager = StateManager::new(StateMode::Global);

    assert!(manager.advance_position(pos(10)));
    assert!(manager.advance_position(pos(11)));
    assert_eq!(manager.position(), Some(pos(11)));
}

#[test]
fn test_advance_position_ignores_regression() {
    let mut manager = StateManager::new(StateMode::Global);
    manager.advance_position(pos(10));

    assert!(!manager.advance_position(pos(10)));
    assert!(!manager.advance_position(pos(3)));
    assert_eq!(manager.position(), Some(pos(10)));
}

#[test]
fn test_snapshot_is_a_copy() {
    let mut manager = StateManager::new(StateMode::Global);
    manager.advance_position(pos(1));

    let checkpoint = manager.snapshot();
    manager.advance_position(pos(2));

    assert_eq!(checkpoint.shared_position(), Some(pos(1)));
    assert_eq!(manager.position(), Some(pos(2)));
}

#[test]
fn test_retain_synced_forgets_untracked_streams() {
    let mut manager = StateManager::new(StateMode::Global);
    manager.advance_position(pos(4));
    assert_ok!(manager.mark_stream_snapshot_complete(&stream("a")));
    assert_ok!(manager.mark_stream_snapshot_complete(&stream("b")));

    let tracked = std::collections::BTreeSet::from([stream("a"), stream("c")]);
    assert_eq!(manager.retain_synced(&tracked), vec![stream("b")]);
    assert!(manager.is_stream_synced(&stream("a")));
    assert!(!manager.is_stream_synced(&stream("b")));
    assert_eq!(manager.position(), Some(pos(4)));

    let revision = manager.revision();
    assert!(manager.retain_synced(&tracked).is_empty());
    assert_eq!(manager.revision(), revision);
}

#[test]
fn test_revision_tracks_effective_changes() {
    let mut manager = StateManager::new(StateMode::Global);
    let start = manager.revision();

    manager.advance_position(pos(5));
    let advanced = manager.revision();
    assert!(advanced > start);

    manager.advance_position(pos(5));
    assert_ok!(manager.mark_stream_snapshot_complete(&stream("a")));
    let marked = manager.revision();
    assert!(marked > advanced);

    assert_ok!(manager.mark_stream_snapshot_complete(&stream("a")));
    assert_eq!(manager.revision(), marked);
}

// ============================================================================
// Per-Stream Mode Tests
// ============================================================================

#[test]
fn test_advance_stream_cursor() {
    let mut manager = StateManager::new(StateMode::PerStream);

    assert!(manager.advance_stream_cursor(&stream("users"), CursorValue::new(5)));
    assert!(!manager.advance_stream_cursor(&stream("users"), CursorValue::new(4)));
    assert!(manager.advance_stream_cursor(&stream("orders"), CursorValue::new("2024-01-01")));

    assert_eq!(
        manager.stream_cursor(&stream("users")),
        Some(&CursorValue::new(5))
    );
    assert_eq!(
        manager.stream_cursor(&stream("orders")),
        Some(&CursorValue::new("2024-01-01"))
    );
}

#[test]
fn test_position_ignored_in_per_stream_mode() {
    let mut manager = StateManager::new(StateMode::PerStream);
    assert!(!manager.advance_position(pos(3)));
    assert!(manager.position().is_none());
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_store_load_missing_file() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    assert!(store.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_store_save_and_load() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    let mut manager = StateManager::new(StateMode::Global);
    manager.advance_position(pos(77));
    manager.mark_stream_snapshot_complete(&stream("users")).unwrap();
    store.save(&manager.snapshot()).await.unwrap();

    let loaded = store.load().await.unwrap().unwrap();
    assert_eq!(loaded, manager.snapshot());
    assert!(!dir.path().join("state.tmp").exists());
}

#[tokio::test]
async fn test_store_clear() {
    let dir = tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store
        .save(&SyncState::empty(StateMode::Global))
        .await
        .unwrap();
    assert_ok!(store.clear().await);
    assert_ok!(store.clear().await);

    assert!(store.load().await.unwrap().is_none());
}

#[test]
fn test_store_from_json() {
    let state = StateStore::from_json(
        r#"{"type": "global", "shared_position": 5, "streams_initial_sync": []}"#,
    )
    .unwrap();
    assert_eq!(state.shared_position(), Some(pos(5)));

    assert_err!(StateStore::from_json("{not json"));
}
