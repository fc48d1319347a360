//! Sync definition files
//!
//! A sync definition is a YAML document naming the source collaborators, the
//! capabilities of the source, the configured catalog and the run settings.
//! Every tunable has a serde default so a minimal file only lists streams.

use crate::catalog::{ConfiguredCatalog, SourceCapabilities};
use crate::classify::InitialSnapshotPolicy;
use crate::engine::{StreamingBound, SyncConfig};
use crate::error::{Error, Result};
use crate::source::DatabaseKind;
use crate::types::{BackoffType, JsonValue, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Top-Level Definition
// ============================================================================

/// Complete sync definition loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncDefinition {
    /// Kind of document (always "sync")
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Definition version
    #[serde(default = "default_version")]
    pub version: String,

    /// Source description and capabilities
    #[serde(default)]
    pub source: SourceDefinition,

    /// Where snapshot rows come from
    pub snapshot: SnapshotSource,

    /// Where change events come from (required in global mode)
    #[serde(default)]
    pub changes: Option<ChangeSource>,

    /// Streams to sync, in sync order
    #[serde(default)]
    pub catalog: ConfiguredCatalog,

    /// Run settings
    #[serde(default)]
    pub settings: SyncSettings,
}

fn default_kind() -> String {
    "sync".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

impl SyncDefinition {
    /// Parse a definition from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(yaml)?;
        if definition.kind != "sync" {
            return Err(Error::invalid_value(
                "kind",
                format!("expected 'sync', got '{}'", definition.kind),
            ));
        }
        Ok(definition)
    }

    /// Load a definition file; relative paths resolve against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::FileNotFound {
            path: format!("{}: {e}", path.display()),
        })?;

        let definition = Self::from_yaml(&contents)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(definition.resolve_paths(base))
    }

    /// Make file paths relative to `base`
    #[must_use]
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let SnapshotSource::JsonlDir { path } = &mut self.snapshot {
            resolve(path);
        }
        if let Some(changes) = &mut self.changes {
            resolve(&mut changes.path);
        }
        self
    }

    /// Capabilities of the source
    pub fn capabilities(&self) -> SourceCapabilities {
        self.source.capabilities()
    }

    /// Runtime configuration for the orchestrator
    pub fn sync_config(&self) -> SyncConfig {
        self.settings.to_sync_config()
    }
}

// ============================================================================
// Source
// ============================================================================

/// Known source presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePreset {
    /// PostgreSQL; CDC is detected from `config.replication_method`
    Postgres,
}

/// Source description
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDefinition {
    /// Preset to derive capabilities from
    #[serde(default)]
    pub preset: Option<SourcePreset>,

    /// Source connector configuration (used by presets)
    #[serde(default)]
    pub config: JsonValue,

    /// Explicit capabilities; override the preset
    #[serde(default)]
    pub capabilities: Option<SourceCapabilities>,
}

impl SourceDefinition {
    /// Resolve capabilities: explicit, then preset, then defaults
    pub fn capabilities(&self) -> SourceCapabilities {
        if let Some(caps) = &self.capabilities {
            return caps.clone();
        }
        match self.preset {
            Some(SourcePreset::Postgres) => SourceCapabilities::from_config(&self.config),
            None => SourceCapabilities::default(),
        }
    }
}

/// Snapshot collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Directory of `<namespace>.<name>.jsonl` files
    JsonlDir {
        /// Directory path
        path: PathBuf,
    },
    /// Database attached through DuckDB
    Duckdb {
        /// Database kind
        kind: DatabaseKind,
        /// Connection string or file path
        connection_string: String,
    },
}

/// Change transport collaborator (a JSON Lines change log)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSource {
    /// Change log file
    pub path: PathBuf,

    /// Report idle instead of exhausted at the end of the log
    #[serde(default)]
    pub follow: bool,
}

// ============================================================================
// Settings
// ============================================================================

/// Run settings; every field has a default
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Checkpoint after this many records (0 = phase boundaries only)
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Checkpoint after this many seconds
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Whole-run timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Parallel snapshot workers
    #[serde(default = "default_snapshot_concurrency")]
    pub snapshot_concurrency: usize,

    /// First-run behaviour in global mode
    #[serde(default)]
    pub initial_snapshot: InitialSnapshotPolicy,

    /// How long streaming runs
    #[serde(default)]
    pub streaming_bound: StreamingBound,

    /// Pause between polls of an idle transport (ms)
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// End streaming after this many idle seconds
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Restart policy for transient failures
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            checkpoint_every: default_checkpoint_every(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            timeout_secs: None,
            snapshot_concurrency: default_snapshot_concurrency(),
            initial_snapshot: InitialSnapshotPolicy::default(),
            streaming_bound: StreamingBound::default(),
            idle_poll_ms: default_idle_poll_ms(),
            idle_timeout_secs: None,
            retry: RetrySettings::default(),
        }
    }
}

fn default_checkpoint_every() -> usize {
    10_000
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_snapshot_concurrency() -> usize {
    1
}

fn default_idle_poll_ms() -> u64 {
    100
}

impl SyncSettings {
    /// Convert to the orchestrator's runtime config
    pub fn to_sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new()
            .with_checkpoint_every(self.checkpoint_every)
            .with_checkpoint_interval(Duration::from_secs(self.checkpoint_interval_secs))
            .with_retry(self.retry.to_policy())
            .with_snapshot_concurrency(self.snapshot_concurrency)
            .with_initial_snapshot(self.initial_snapshot)
            .with_streaming_bound(self.streaming_bound)
            .with_idle_poll_interval(Duration::from_millis(self.idle_poll_ms));

        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout_secs {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Restarts allowed after a transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff type
    #[serde(default)]
    pub backoff: BackoffType,

    /// First delay (ms)
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Delay cap (ms)
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffType::default(),
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

impl RetrySettings {
    /// Build the retry policy
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_type: self.backoff,
            initial_backoff: Duration::from_millis(self.initial_ms),
            max_backoff: Duration::from_millis(self.max_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StreamIdentifier;
    use crate::state::StateMode;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r"
snapshot:
  type: jsonl_dir
  path: tables
catalog:
  streams:
    - stream: { namespace: public, name: users }
      sync_mode: full_refresh
";

    #[test]
    fn test_parse_minimal_definition() {
        let def = SyncDefinition::from_yaml(MINIMAL).unwrap();

        assert_eq!(def.kind, "sync");
        assert_eq!(def.version, "1.0");
        assert_eq!(def.catalog.streams.len(), 1);
        assert_eq!(
            def.catalog.streams[0].stream,
            StreamIdentifier::new("public", "users")
        );
        assert!(def.changes.is_none());
        assert_eq!(def.settings, SyncSettings::default());
        assert_eq!(def.capabilities().state_mode, StateMode::PerStream);
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let yaml = format!("kind: connector\n{MINIMAL}");
        let err = SyncDefinition::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, Error::InvalidConfigValue { field, .. } if field == "kind"));
    }

    #[test]
    fn test_postgres_preset_detects_cdc() {
        let yaml = r"
source:
  preset: postgres
  config:
    replication_method:
      replication_slot: airbyte_slot
      publication: airbyte_pub
snapshot:
  type: duckdb
  kind: postgres
  connection_string: host=localhost dbname=app
changes:
  path: changes.jsonl
";
        let def = SyncDefinition::from_yaml(yaml).unwrap();
        let caps = def.capabilities();

        assert_eq!(caps.state_mode, StateMode::Global);
        assert!(caps.excluded_namespaces.contains("pg_catalog"));
        assert_eq!(
            def.snapshot,
            SnapshotSource::Duckdb {
                kind: DatabaseKind::Postgres,
                connection_string: "host=localhost dbname=app".to_string(),
            }
        );
    }

    #[test]
    fn test_explicit_capabilities_override_preset() {
        let yaml = r"
source:
  preset: postgres
  capabilities:
    state_mode: global
    inject_cdc_metadata: false
snapshot:
  type: jsonl_dir
  path: tables
";
        let caps = SyncDefinition::from_yaml(yaml).unwrap().capabilities();
        assert_eq!(caps.state_mode, StateMode::Global);
        assert!(!caps.inject_cdc_metadata);
        assert!(caps.excluded_namespaces.is_empty());
    }

    #[test]
    fn test_settings_to_sync_config() {
        let yaml = r"
snapshot:
  type: jsonl_dir
  path: tables
settings:
  checkpoint_every: 50
  timeout_secs: 30
  initial_snapshot: snapshot_all
  streaming_bound: unbounded
  idle_timeout_secs: 5
  retry:
    max_retries: 1
    backoff: constant
    initial_ms: 10
";
        let config = SyncDefinition::from_yaml(yaml).unwrap().sync_config();

        assert_eq!(config.checkpoint_every_records, 50);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(60));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.initial_snapshot, InitialSnapshotPolicy::SnapshotAll);
        assert_eq!(config.streaming_bound, StreamingBound::Unbounded);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.backoff(4), Duration::from_millis(10));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let yaml = format!("{MINIMAL}changes:\n  path: /var/log/changes.jsonl\n");
        let def = SyncDefinition::from_yaml(&yaml)
            .unwrap()
            .resolve_paths(Path::new("/etc/sync"));

        assert_eq!(
            def.snapshot,
            SnapshotSource::JsonlDir {
                path: PathBuf::from("/etc/sync/tables")
            }
        );
        assert_eq!(
            def.changes.map(|c| c.path),
            Some(PathBuf::from("/var/log/changes.jsonl"))
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncDefinition::load("/nonexistent/sync.yaml").unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
