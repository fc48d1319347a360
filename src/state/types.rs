//! State types for tracking sync progress
//!
//! These types are serialized to JSON and persisted between runs. Every
//! mutating operation takes `self` by value and returns the new value, so a
//! state handed out in a checkpoint can never change underneath its holder.

use crate::catalog::StreamIdentifier;
use crate::types::{JsonObject, JsonValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Replication Position
// ============================================================================

/// Opaque, totally ordered point in the change log (a log sequence number)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReplicationPosition(u64);

impl ReplicationPosition {
    /// Create a position from its raw value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReplicationPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Cursor Value
// ============================================================================

/// Value of a user cursor field (per-stream mode)
///
/// Numbers compare numerically. Strings holding a plain decimal (DECIMAL or
/// HUGEINT columns arrive as text) compare by value, other strings
/// lexicographically (ISO-8601 timestamps sort correctly). `null` sorts
/// before everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CursorValue(JsonValue);

impl CursorValue {
    /// Wrap a JSON value
    pub fn new(value: impl Into<JsonValue>) -> Self {
        Self(value.into())
    }

    /// Extract the cursor from a record by (possibly nested) field path
    pub fn from_record(record: &JsonObject, path: &[String]) -> Option<Self> {
        let (first, rest) = path.split_first()?;
        let mut value = record.get(first)?;
        for key in rest {
            value = value.get(key)?;
        }
        Some(Self(value.clone()))
    }

    /// Underlying JSON value
    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    /// Total order over cursor values
    pub fn compare(&self, other: &Self) -> Ordering {
        let rank = |v: &JsonValue| match v {
            JsonValue::Null => 0,
            JsonValue::Bool(_) => 1,
            JsonValue::Number(_) => 2,
            JsonValue::String(_) => 3,
            JsonValue::Array(_) | JsonValue::Object(_) => 4,
        };

        match (&self.0, &other.0) {
            (JsonValue::Bool(a), JsonValue::Bool(b)) => a.cmp(b),
            (JsonValue::Number(a), JsonValue::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => {
                    let a = a.as_f64().unwrap_or(f64::NAN);
                    let b = b.as_f64().unwrap_or(f64::NAN);
                    a.total_cmp(&b)
                }
            },
            (JsonValue::String(a), JsonValue::String(b)) => {
                compare_decimal(a, b).unwrap_or_else(|| a.cmp(b))
            }
            (a, b) if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

/// Sign, integer digits and significant fraction digits of a plain decimal
///
/// Accepts `-?(0|[1-9][0-9]*)(\.[0-9]+)?` only, so codes with leading zeros
/// keep text ordering.
fn parse_decimal(s: &str) -> Option<(bool, &str, &str)> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int, frac) = match digits.split_once('.') {
        Some((_, "")) => return None,
        Some((int, frac)) => (int, frac),
        None => (digits, ""),
    };

    let is_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    let canonical = int == "0" || (!int.is_empty() && !int.starts_with('0'));
    if !canonical || !is_digits(int) || !is_digits(frac) {
        return None;
    }
    Some((negative, int, frac.trim_end_matches('0')))
}

/// Exact ordering of two plain decimals, `None` unless both parse
fn compare_decimal(a: &str, b: &str) -> Option<Ordering> {
    let (a_negative, a_int, a_frac) = parse_decimal(a)?;
    let (b_negative, b_int, b_frac) = parse_decimal(b)?;

    let is_zero = |int: &str, frac: &str| int == "0" && frac.is_empty();
    let magnitude = a_int
        .len()
        .cmp(&b_int.len())
        .then_with(|| a_int.cmp(b_int))
        .then_with(|| a_frac.cmp(b_frac));

    Some(
        match (
            a_negative && !is_zero(a_int, a_frac),
            b_negative && !is_zero(b_int, b_frac),
        ) {
            (false, false) => magnitude,
            (true, true) => magnitude.reverse(),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
        },
    )
}

impl fmt::Display for CursorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            JsonValue::String(s) => write!(f, "{s}"),
            other => write!(f, "{other}"),
        }
    }
}

// ============================================================================
// State Mode
// ============================================================================

/// Whether progress is one shared position or one cursor per stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMode {
    /// One replication position shared by all streams (CDC)
    Global,
    /// Independent cursor per stream
    #[default]
    PerStream,
}

impl fmt::Display for StateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateMode::Global => write!(f, "global"),
            StateMode::PerStream => write!(f, "per_stream"),
        }
    }
}

// ============================================================================
// Global (CDC) State
// ============================================================================

/// Shared change-log progress plus the streams whose initial snapshot finished
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcState {
    /// Last replication position covered by emitted output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_position: Option<ReplicationPosition>,

    /// Streams whose full historical contents were emitted at least once
    #[serde(default)]
    pub streams_initial_sync: BTreeSet<StreamIdentifier>,
}

impl CdcState {
    /// Whether `position` would move the shared position forward
    pub fn accepts(&self, position: ReplicationPosition) -> bool {
        self.shared_position.map_or(true, |current| position > current)
    }

    /// Add a stream to the initial-sync set
    #[must_use]
    pub fn with_stream_synced(mut self, stream: StreamIdentifier) -> Self {
        self.streams_initial_sync.insert(stream);
        self
    }

    /// Move the shared position forward; regressions leave it unchanged
    #[must_use]
    pub fn with_position(mut self, position: ReplicationPosition) -> Self {
        if self.accepts(position) {
            self.shared_position = Some(position);
        }
        self
    }

    /// Keep only the synced streams contained in `tracked`
    #[must_use]
    pub fn with_synced_within(mut self, tracked: &BTreeSet<StreamIdentifier>) -> Self {
        self.streams_initial_sync.retain(|stream| tracked.contains(stream));
        self
    }

    /// No position and no synced streams
    pub fn is_empty(&self) -> bool {
        self.shared_position.is_none() && self.streams_initial_sync.is_empty()
    }
}

// ============================================================================
// Per-Stream State
// ============================================================================

/// Cursor state of a single stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    /// Highest cursor value emitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorValue>,
}

impl StreamState {
    /// Whether `cursor` would move this stream forward
    pub fn accepts(&self, cursor: &CursorValue) -> bool {
        self.cursor
            .as_ref()
            .map_or(true, |current| cursor.compare(current) == Ordering::Greater)
    }

    /// Move the cursor forward; lower or equal values are ignored
    #[must_use]
    pub fn with_cursor(mut self, cursor: CursorValue) -> Self {
        if self.accepts(&cursor) {
            self.cursor = Some(cursor);
        }
        self
    }
}

/// Cursor state of all streams in per-stream mode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerStreamState {
    /// Stream cursors keyed by stream
    #[serde(with = "stream_list")]
    pub streams: BTreeMap<StreamIdentifier, StreamState>,
}

/// Persist the map as a list of `{stream, state}` entries
mod stream_list {
    use super::{StreamIdentifier, StreamState};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct EntryRef<'a> {
        stream: &'a StreamIdentifier,
        state: &'a StreamState,
    }

    #[derive(Deserialize)]
    struct Entry {
        stream: StreamIdentifier,
        #[serde(default)]
        state: StreamState,
    }

    pub fn serialize<S: Serializer>(
        streams: &BTreeMap<StreamIdentifier, StreamState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            streams
                .iter()
                .map(|(stream, state)| EntryRef { stream, state }),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<StreamIdentifier, StreamState>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| (e.stream, e.state)).collect())
    }
}

// ============================================================================
// Sync State
// ============================================================================

/// Top-level persisted progress of a sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncState {
    /// One shared replication position
    Global(CdcState),
    /// One cursor per stream
    PerStream(PerStreamState),
}

impl SyncState {
    /// Zero-value state for a mode
    pub fn empty(mode: StateMode) -> Self {
        match mode {
            StateMode::Global => SyncState::Global(CdcState::default()),
            StateMode::PerStream => SyncState::PerStream(PerStreamState::default()),
        }
    }

    /// Mode this state belongs to
    pub fn mode(&self) -> StateMode {
        match self {
            SyncState::Global(_) => StateMode::Global,
            SyncState::PerStream(_) => StateMode::PerStream,
        }
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        match self {
            SyncState::Global(cdc) => cdc.is_empty(),
            SyncState::PerStream(per_stream) => per_stream.streams.is_empty(),
        }
    }

    /// Shared position (global mode only)
    pub fn shared_position(&self) -> Option<ReplicationPosition> {
        match self {
            SyncState::Global(cdc) => cdc.shared_position,
            SyncState::PerStream(_) => None,
        }
    }

    /// Streams whose initial snapshot completed (global mode only)
    pub fn streams_initial_sync(&self) -> Option<&BTreeSet<StreamIdentifier>> {
        match self {
            SyncState::Global(cdc) => Some(&cdc.streams_initial_sync),
            SyncState::PerStream(_) => None,
        }
    }

    /// Stored cursor of a stream (per-stream mode only)
    pub fn stream_cursor(&self, stream: &StreamIdentifier) -> Option<&CursorValue> {
        match self {
            SyncState::Global(_) => None,
            SyncState::PerStream(per_stream) => per_stream.streams.get(stream)?.cursor.as_ref(),
        }
    }
}
