//! CLI runner - executes commands

use crate::catalog::{SourceCapabilities, StreamIdentifier};
use crate::cdc::ChangeTransport;
use crate::classify::classify;
use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::{SnapshotSource, SyncDefinition};
use crate::engine::{Message, SyncOrchestrator, SyncPhase, SyncStats};
use crate::error::{Error, Result, ResultExt};
use crate::snapshot::SnapshotQuery;
use crate::source::{DuckDbSource, MemoryChangeLog, MemoryTables};
use crate::state::{StateManager, StateMode, StateStore, SyncState};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Validate => self.validate().await,
            Commands::Discover => self.discover(),
            Commands::Classify => self.classify().await,
            Commands::Read { streams } => self.read(streams.as_deref()).await,
            Commands::State { reset } => self.state(*reset).await,
        }
    }

    /// Load the sync definition
    fn load_definition(&self) -> Result<SyncDefinition> {
        let path = self
            .cli
            .definition
            .as_ref()
            .ok_or_else(|| Error::config("Sync definition not specified (use -d flag)"))?;
        SyncDefinition::load(path)
    }

    /// Load the prior state
    async fn load_state(&self) -> Result<Option<SyncState>> {
        // Inline state takes precedence
        if let Some(state_json) = &self.cli.state_json {
            StateStore::from_json(state_json).map(Some)
        } else if let Some(path) = &self.cli.state {
            StateStore::new(path).load().await
        } else {
            Ok(None)
        }
    }

    /// Build the snapshot query collaborator
    async fn snapshot_query(&self, definition: &SyncDefinition) -> Result<Arc<dyn SnapshotQuery>> {
        match &definition.snapshot {
            SnapshotSource::JsonlDir { path } => Ok(Arc::new(MemoryTables::from_dir(path).await?)),
            SnapshotSource::Duckdb {
                kind,
                connection_string,
            } => Ok(Arc::new(DuckDbSource::open(*kind, connection_string)?)),
        }
    }

    /// Build the change transport collaborator, if configured
    async fn change_transport(
        &self,
        definition: &SyncDefinition,
    ) -> Result<Option<Arc<dyn ChangeTransport>>> {
        let Some(changes) = &definition.changes else {
            return Ok(None);
        };
        let log = MemoryChangeLog::from_jsonl(&changes.path)
            .await?
            .following(changes.follow);
        Ok(Some(Arc::new(log)))
    }

    /// Validate the definition and saved state
    async fn validate(&self) -> Result<()> {
        let definition = self.load_definition()?;
        let capabilities = definition.capabilities();
        let prior = self.load_state().await?;

        capabilities.validate(&definition.catalog, prior.as_ref())?;
        if capabilities.supports_global() && definition.changes.is_none() {
            return Err(Error::config(
                "global state mode needs a `changes` section",
            ));
        }

        self.output_message(&json!({
            "type": "LOG",
            "log": {
                "level": "INFO",
                "message": format!(
                    "Sync definition v{} is valid with {} streams ({} mode)",
                    definition.version,
                    definition.catalog.streams.len(),
                    capabilities.state_mode
                )
            }
        }));

        Ok(())
    }

    /// Discover streams of a database source
    fn discover(&self) -> Result<()> {
        let definition = self.load_definition()?;
        let SnapshotSource::Duckdb {
            kind,
            connection_string,
        } = &definition.snapshot
        else {
            return Err(Error::config("discover needs a `duckdb` snapshot source"));
        };

        let source = DuckDbSource::open(*kind, connection_string)?;
        source.check_connection()?;
        let catalog = source.discover(&definition.capabilities())?;

        self.output_message(&json!({
            "type": "CATALOG",
            "catalog": catalog
        }));

        Ok(())
    }

    /// Show the streams the next run will snapshot
    async fn classify(&self) -> Result<()> {
        let definition = self.load_definition()?;
        let capabilities = definition.capabilities();
        let prior = self.load_state().await?;
        capabilities.validate(&definition.catalog, prior.as_ref())?;

        let settings = definition.sync_config();
        let snapshot = match capabilities.state_mode {
            StateMode::Global => classify(
                &definition.catalog.incremental_ids(),
                prior.as_ref(),
                settings.initial_snapshot,
            ),
            StateMode::PerStream => {
                classify(&definition.catalog.ids(), prior.as_ref(), settings.initial_snapshot)
            }
        };
        let full_refresh: Vec<&StreamIdentifier> = definition
            .catalog
            .streams
            .iter()
            .filter(|s| !s.is_incremental())
            .map(|s| &s.stream)
            .collect();

        self.output_message(&json!({
            "type": "CLASSIFICATION",
            "classification": {
                "state_mode": capabilities.state_mode,
                "snapshot": snapshot,
                "full_refresh": full_refresh,
                "position": prior.as_ref().and_then(SyncState::shared_position),
            }
        }));

        Ok(())
    }

    /// Run a sync, printing every message and persisting checkpoints
    async fn read(&self, streams: Option<&str>) -> Result<()> {
        let definition = self.load_definition()?;
        let capabilities = definition.capabilities();
        let prior = self.load_state().await?;
        let store = self.cli.state.as_ref().map(StateStore::new);

        let mut catalog = definition.catalog.clone();
        if let Some(names) = streams.filter(|s| !s.trim().is_empty()) {
            let selected: Vec<StreamIdentifier> = names
                .split(',')
                .map(|n| StreamIdentifier::parse(n.trim()))
                .collect();
            catalog = catalog.select(&selected);
        }

        let query = self.snapshot_query(&definition).await?;
        let mut orchestrator = SyncOrchestrator::new(query, capabilities);
        if let Some(transport) = self.change_transport(&definition).await? {
            orchestrator = orchestrator.with_transport(transport);
        }

        let selected = catalog.streams.len();
        let mut run = orchestrator.run(catalog, prior, definition.sync_config())?;
        info!(streams = selected, "sync started");

        let token = run.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing with a final checkpoint");
                token.cancel();
            }
        });

        let mut failure = None;
        while let Some(item) = run.next_message().await {
            match item {
                Ok(message) => {
                    if let (Message::Checkpoint(state), Some(store)) = (&message, &store) {
                        store.save(state).await.with_context(|| {
                            format!("Failed to persist checkpoint to {}", store.path().display())
                        })?;
                    }
                    self.output_message(&message.to_json());
                }
                Err(e) => {
                    self.output_message(&json!({
                        "type": "LOG",
                        "log": {
                            "level": "ERROR",
                            "message": e.to_string()
                        }
                    }));
                    failure = Some(e);
                }
            }
        }
        interrupt.abort();

        self.output_summary(run.phase(), run.stats(), store.as_ref());

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Show or reset the saved state
    async fn state(&self, reset: bool) -> Result<()> {
        if reset {
            let path = self
                .cli
                .state
                .as_ref()
                .ok_or_else(|| Error::config("State file not specified (use -s flag)"))?;
            StateStore::new(path).clear().await?;
            info!(path = %path.display(), "state reset");
            return Ok(());
        }

        let state = match self.load_state().await? {
            Some(state) => state,
            None => {
                let mode = match &self.cli.definition {
                    Some(_) => self.load_definition()?.capabilities().state_mode,
                    None => SourceCapabilities::default().state_mode,
                };
                StateManager::empty_initial_state(mode)
            }
        };

        self.output_message(&json!({
            "type": "STATE",
            "state": state
        }));

        Ok(())
    }

    /// Emit the end-of-run summary
    fn output_summary(&self, phase: SyncPhase, stats: &SyncStats, store: Option<&StateStore>) {
        self.output_message(&json!({
            "type": "SYNC_SUMMARY",
            "summary": {
                "status": if phase == SyncPhase::Done { "SUCCEEDED" } else { "FAILED" },
                "phase": phase,
                "stats": stats,
                "state_file": store.map(|s| s.path().display().to_string()),
            }
        }));
    }

    /// Output a message
    fn output_message(&self, msg: &Value) {
        match self.cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(msg).unwrap_or_default());
            }
            OutputFormat::Pretty => {
                println!("{}", serde_json::to_string_pretty(msg).unwrap_or_default());
            }
        }
    }
}
