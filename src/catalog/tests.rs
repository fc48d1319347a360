//! Tests for the catalog module

use super::*;
use crate::state::{StateMode, SyncState};
use pretty_assertions::assert_eq;
use serde_json::json;

fn users() -> StreamIdentifier {
    StreamIdentifier::new("public", "users")
}

fn discovered(name: &str, primary_key: bool) -> CatalogStream {
    CatalogStream {
        namespace: Some("public".to_string()),
        name: name.to_string(),
        json_schema: json!({"type": "object", "properties": {"id": {"type": "integer"}}}),
        supported_sync_modes: vec![SyncMode::FullRefresh],
        source_defined_cursor: false,
        default_cursor_field: None,
        source_defined_primary_key: if primary_key {
            vec![vec!["id".to_string()]]
        } else {
            Vec::new()
        },
    }
}

// ============================================================================
// Stream Identifier Tests
// ============================================================================

#[test]
fn test_stream_identifier_display_and_parse() {
    assert_eq!(users().to_string(), "public.users");
    assert_eq!(StreamIdentifier::parse("public.users"), users());
    assert_eq!(
        StreamIdentifier::parse("users"),
        StreamIdentifier::unqualified("users")
    );
}

// ============================================================================
// Configured Stream Tests
// ============================================================================

#[test]
fn test_configured_stream_from_json() {
    let stream: ConfiguredStream = serde_json::from_value(json!({
        "stream": {"namespace": "public", "name": "users"},
        "sync_mode": "incremental",
        "cursor_field": ["updated_at"]
    }))
    .unwrap();

    assert!(stream.is_incremental());
    assert_eq!(stream.cursor_field(), Some(&["updated_at".to_string()][..]));
}

#[test]
fn test_source_defined_cursor_cannot_be_overridden() {
    let result: Result<ConfiguredStream, _> = serde_json::from_value(json!({
        "stream": {"namespace": "public", "name": "users"},
        "sync_mode": "incremental",
        "source_defined_cursor": true,
        "cursor_field": ["updated_at"]
    }));

    let err = result.unwrap_err().to_string();
    assert!(err.contains("cannot override"));
}

#[test]
fn test_configured_stream_serializes_source_defined() {
    let value = serde_json::to_value(ConfiguredStream::incremental(users())).unwrap();
    assert_eq!(
        value,
        json!({
            "stream": {"namespace": "public", "name": "users"},
            "sync_mode": "incremental",
            "source_defined_cursor": true
        })
    );
}

#[test]
fn test_configured_catalog_select_keeps_order() {
    let catalog = ConfiguredCatalog::new(vec![
        ConfiguredStream::incremental(StreamIdentifier::new("public", "a")),
        ConfiguredStream::full_refresh(StreamIdentifier::new("public", "b")),
        ConfiguredStream::incremental(StreamIdentifier::new("public", "c")),
    ]);

    let selected = catalog.clone().select(&[
        StreamIdentifier::new("public", "c"),
        StreamIdentifier::new("public", "a"),
    ]);
    let names: Vec<_> = selected.streams.iter().map(|s| s.stream.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(catalog.incremental_ids().len(), 2);
}

// ============================================================================
// Capability Tests
// ============================================================================

#[test]
fn test_is_cdc_detection() {
    let cdc = json!({"replication_method": {"replication_slot": "slot", "publication": "pub"}});
    let missing_publication = json!({"replication_method": {"replication_slot": "slot"}});
    let standard = json!({"host": "localhost"});

    assert!(is_cdc(&cdc));
    assert!(!is_cdc(&missing_publication));
    assert!(!is_cdc(&standard));
    assert_eq!(
        SourceCapabilities::from_config(&cdc).state_mode,
        StateMode::Global
    );
}

#[test]
fn test_prepare_catalog_for_cdc() {
    let caps = SourceCapabilities::postgres(true);
    let mut internal = discovered("tables", true);
    internal.namespace = Some("information_schema".to_string());

    let catalog = Catalog {
        streams: vec![discovered("users", true), discovered("logs", false), internal],
    };
    let prepared = caps.prepare_catalog(catalog);

    assert_eq!(prepared.streams.len(), 2);

    let users = &prepared.streams[0];
    assert_eq!(
        users.supported_sync_modes,
        vec![SyncMode::FullRefresh, SyncMode::Incremental]
    );
    assert!(users.source_defined_cursor);
    assert_eq!(
        users.json_schema["properties"]["_ab_cdc_lsn"],
        json!({"type": "number"})
    );

    let logs = &prepared.streams[1];
    assert_eq!(logs.supported_sync_modes, vec![SyncMode::FullRefresh]);
    assert!(!logs.source_defined_cursor);
}

#[test]
fn test_prepare_catalog_standard_mode_keeps_streams() {
    let caps = SourceCapabilities::postgres(false);
    let prepared = caps.prepare_catalog(Catalog {
        streams: vec![discovered("users", true)],
    });
    assert_eq!(prepared.streams[0], discovered("users", true));
}

#[test]
fn test_cursor_fields_by_type() {
    let caps = SourceCapabilities::postgres(false);
    let columns = vec![
        ColumnInfo::new("id", "bigint"),
        ColumnInfo::new("payload", "JSONB"),
        ColumnInfo::new("updated_at", "TIMESTAMP"),
    ];
    assert_eq!(caps.cursor_fields(&columns), vec!["id", "updated_at"]);
}

#[test]
fn test_validate_rejects_duplicates() {
    let caps = SourceCapabilities::postgres(true);
    let catalog = ConfiguredCatalog::new(vec![
        ConfiguredStream::incremental(users()),
        ConfiguredStream::full_refresh(users()),
    ]);
    assert!(caps.validate(&catalog, None).is_err());
}

#[test]
fn test_validate_rejects_user_cursor_in_global_mode() {
    let caps = SourceCapabilities::postgres(true);
    let catalog = ConfiguredCatalog::new(vec![ConfiguredStream::incremental_by(
        users(),
        &["updated_at"],
    )]);
    let err = caps.validate(&catalog, None).unwrap_err();
    assert!(err.to_string().contains("updated_at"));
}

#[test]
fn test_validate_requires_cursor_in_per_stream_mode() {
    let caps = SourceCapabilities::postgres(false);
    let catalog = ConfiguredCatalog::new(vec![ConfiguredStream::incremental(users())]);
    assert!(caps.validate(&catalog, None).is_err());
}

#[test]
fn test_validate_rejects_internal_namespace() {
    let caps = SourceCapabilities::postgres(true);
    let catalog = ConfiguredCatalog::new(vec![ConfiguredStream::full_refresh(
        StreamIdentifier::new("pg_catalog", "pg_class"),
    )]);
    assert!(caps.validate(&catalog, None).is_err());
}

#[test]
fn test_validate_rejects_state_mode_mismatch() {
    let caps = SourceCapabilities::postgres(true);
    let catalog = ConfiguredCatalog::new(vec![ConfiguredStream::incremental(users())]);
    let prior = SyncState::empty(StateMode::PerStream);

    assert!(caps.validate(&catalog, Some(&prior)).is_err());
    assert!(caps
        .validate(&catalog, Some(&SyncState::empty(StateMode::Global)))
        .is_ok());
}
