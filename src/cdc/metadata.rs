//! CDC metadata columns
//!
//! Records emitted in global mode carry the replication position and commit
//! timestamps so downstream consumers can order and deduplicate them.

use super::{ChangeEvent, ChangeOp};
use crate::state::ReplicationPosition;
use crate::types::{JsonObject, JsonValue};
use chrono::SecondsFormat;
use serde_json::json;

/// Replication position of the change
pub const CDC_LSN: &str = "_ab_cdc_lsn";

/// Commit time of the change
pub const CDC_UPDATED_AT: &str = "_ab_cdc_updated_at";

/// Commit time of the delete, null for inserts and updates
pub const CDC_DELETED_AT: &str = "_ab_cdc_deleted_at";

/// Add the metadata columns to a stream's JSON schema
pub fn add_metadata_columns(schema: JsonValue) -> JsonValue {
    let mut schema = match schema {
        JsonValue::Object(map) => map,
        _ => JsonObject::new(),
    };

    let properties = schema
        .entry("properties")
        .or_insert_with(|| JsonValue::Object(JsonObject::new()));
    if !properties.is_object() {
        *properties = JsonValue::Object(JsonObject::new());
    }

    if let JsonValue::Object(properties) = properties {
        properties.insert(CDC_LSN.to_string(), json!({"type": "number"}));
        properties.insert(CDC_UPDATED_AT.to_string(), json!({"type": "string"}));
        properties.insert(CDC_DELETED_AT.to_string(), json!({"type": "string"}));
    }

    JsonValue::Object(schema)
}

/// Record payload for a change event, with metadata columns
pub fn inject_change_metadata(event: &ChangeEvent, position: ReplicationPosition) -> JsonObject {
    let mut data = event.data.clone();
    let committed_at = event
        .committed_at
        .map(|ts| JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or(JsonValue::Null);

    let deleted_at = if event.op == ChangeOp::Delete {
        committed_at.clone()
    } else {
        JsonValue::Null
    };

    data.insert(CDC_LSN.to_string(), json!(position.as_u64()));
    data.insert(CDC_UPDATED_AT.to_string(), committed_at);
    data.insert(CDC_DELETED_AT.to_string(), deleted_at);
    data
}

/// Snapshot row with metadata columns; `origin` is the log position the snapshot is consistent with
pub fn inject_snapshot_metadata(
    mut row: JsonObject,
    origin: Option<ReplicationPosition>,
) -> JsonObject {
    let lsn = origin.map_or(JsonValue::Null, |p| json!(p.as_u64()));
    row.insert(CDC_LSN.to_string(), lsn);
    row.insert(CDC_UPDATED_AT.to_string(), JsonValue::Null);
    row.insert(CDC_DELETED_AT.to_string(), JsonValue::Null);
    row
}
