//! DuckDB-backed snapshot source
//!
//! Provides snapshot reads and schema discovery for PostgreSQL, MySQL, SQLite
//! and DuckDB databases through DuckDB's scanner extensions. The source
//! database is attached read-only as `source_db`.

use crate::catalog::{
    Catalog, CatalogStream, ColumnInfo, SourceCapabilities, StreamIdentifier, SyncMode,
};
use crate::error::{Error, Result};
use crate::snapshot::{Row, RowCursor, SnapshotQuery, SnapshotRequest};
use crate::state::CursorValue;
use crate::types::{JsonObject, JsonValue};
use async_trait::async_trait;
use base64::Engine as _;
use duckdb::types::Value as DuckValue;
use duckdb::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Rows buffered between the query thread and the cursor
const ROW_BUFFER: usize = 1024;

/// Database type behind the DuckDB attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// PostgreSQL through the `postgres` scanner
    Postgres,
    /// MySQL through the `mysql` scanner
    Mysql,
    /// SQLite file through the `sqlite` scanner
    Sqlite,
    /// DuckDB database file
    Duckdb,
}

impl DatabaseKind {
    /// Scanner extension to load, if any
    fn extension(self) -> Option<&'static str> {
        match self {
            DatabaseKind::Postgres => Some("postgres"),
            DatabaseKind::Mysql => Some("mysql"),
            DatabaseKind::Sqlite => Some("sqlite"),
            DatabaseKind::Duckdb => None,
        }
    }

    /// `ATTACH` options
    fn attach_options(self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "TYPE POSTGRES, READ_ONLY",
            DatabaseKind::Mysql => "TYPE MYSQL, READ_ONLY",
            DatabaseKind::Sqlite => "TYPE SQLITE, READ_ONLY",
            DatabaseKind::Duckdb => "READ_ONLY",
        }
    }
}

/// Snapshot query and discovery over an attached database
pub struct DuckDbSource {
    /// Root connection; each query runs on its own clone
    conn: Arc<Mutex<Connection>>,
    /// Database type
    kind: DatabaseKind,
    /// Catalog name tables live under
    catalog: String,
}

impl std::fmt::Debug for DuckDbSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbSource")
            .field("kind", &self.kind)
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl DuckDbSource {
    /// Attach the database at `connection_string`
    ///
    /// `:memory:` with [`DatabaseKind::Duckdb`] uses the in-memory database
    /// directly (useful for tests).
    pub fn open(kind: DatabaseKind, connection_string: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::config(format!("Failed to create DuckDB connection: {e}")))?;

        if let Some(extension) = kind.extension() {
            conn.execute_batch(&format!("INSTALL {extension}; LOAD {extension};"))
                .map_err(|e| {
                    Error::config(format!("Failed to load {extension} extension: {e}"))
                })?;
        }

        let catalog = if kind == DatabaseKind::Duckdb && connection_string == ":memory:" {
            "memory".to_string()
        } else {
            let attach_sql = format!(
                "ATTACH '{}' AS source_db ({});",
                connection_string.replace('\'', "''"),
                kind.attach_options()
            );
            conn.execute_batch(&attach_sql)
                .map_err(|e| Error::config(format!("Failed to attach {kind:?} database: {e}")))?;
            "source_db".to_string()
        };

        debug!(?kind, %catalog, "database attached");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            kind,
            catalog,
        })
    }

    /// Run SQL on the root connection (setup and test fixtures)
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.connection()?.execute_batch(sql).map_err(db_err)
    }

    /// Database type
    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// Test the connection
    pub fn check_connection(&self) -> Result<()> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_catalog = ?",
                [&self.catalog],
                |row| row.get(0),
            )
            .map_err(|e| Error::config(format!("Connection check failed: {e}")))?;
        debug!(tables = count, "connection check passed");
        Ok(())
    }

    /// Discover streams and adjust them to `capabilities`
    pub fn discover(&self, capabilities: &SourceCapabilities) -> Result<Catalog> {
        let conn = self.connection()?;

        let mut stmt = conn
            .prepare(
                "SELECT table_schema, table_name, column_name, data_type
                 FROM information_schema.columns
                 WHERE table_catalog = ?
                 ORDER BY table_schema, table_name, ordinal_position",
            )
            .map_err(db_err)?;
        let columns = stmt
            .query_map([&self.catalog], |row| {
                Ok((
                    StreamIdentifier::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    ColumnInfo::new(row.get::<_, String>(2)?, row.get::<_, String>(3)?),
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut tables: Vec<(StreamIdentifier, Vec<ColumnInfo>)> = Vec::new();
        for (id, column) in columns {
            match tables.last_mut() {
                Some((last, cols)) if *last == id => cols.push(column),
                _ => tables.push((id, vec![column])),
            }
        }

        let primary_keys = self.primary_keys(&conn);
        let streams = tables
            .into_iter()
            .map(|(id, columns)| {
                let mut modes = vec![SyncMode::FullRefresh];
                if !capabilities.cursor_fields(&columns).is_empty() {
                    modes.push(SyncMode::Incremental);
                }
                CatalogStream {
                    json_schema: json_schema(&columns),
                    supported_sync_modes: modes,
                    source_defined_cursor: false,
                    default_cursor_field: None,
                    source_defined_primary_key: primary_keys.get(&id).cloned().unwrap_or_default(),
                    namespace: id.namespace,
                    name: id.name,
                }
            })
            .collect();

        Ok(capabilities.prepare_catalog(Catalog { streams }))
    }

    /// Primary keys by table; empty when the catalog does not expose constraints
    fn primary_keys(&self, conn: &Connection) -> BTreeMap<StreamIdentifier, Vec<Vec<String>>> {
        let query = "SELECT schema_name, table_name, list_aggr(constraint_column_names, 'string_agg', ',')
                     FROM duckdb_constraints()
                     WHERE database_name = ? AND constraint_type = 'PRIMARY KEY'";

        let result = conn.prepare(query).and_then(|mut stmt| {
            let keys = stmt
                .query_map([&self.catalog], |row| {
                    Ok((
                        StreamIdentifier::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>();
            keys
        });

        match result {
            Ok(keys) => keys
                .into_iter()
                .map(|(id, columns)| {
                    let key = columns.split(',').map(|c| vec![c.to_string()]).collect();
                    (id, key)
                })
                .collect(),
            Err(e) => {
                debug!(error = %e, "primary key discovery unavailable");
                BTreeMap::new()
            }
        }
    }

    /// SQL and parameters for a snapshot request
    fn select_sql(&self, request: &SnapshotRequest) -> Result<(String, Vec<DuckValue>)> {
        let table = self.qualified(&request.stream);

        let Some(field) = &request.cursor_field else {
            return Ok((format!("SELECT * FROM {table}"), Vec::new()));
        };
        let [column] = field.as_slice() else {
            return Err(Error::config(format!(
                "nested cursor field '{}' is not supported for database sources",
                field.join(".")
            )));
        };

        let column = quote_ident(column);
        Ok(match &request.after {
            Some(after) => (
                format!("SELECT * FROM {table} WHERE {column} > ? ORDER BY {column} ASC"),
                vec![cursor_param(after)],
            ),
            None => (
                format!("SELECT * FROM {table} ORDER BY {column} ASC"),
                Vec::new(),
            ),
        })
    }

    fn qualified(&self, stream: &StreamIdentifier) -> String {
        let name = quote_ident(&stream.name);
        match &stream.namespace {
            Some(namespace) => format!(
                "{}.{}.{name}",
                quote_ident(&self.catalog),
                quote_ident(namespace)
            ),
            None => format!("{}.{name}", quote_ident(&self.catalog)),
        }
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::database("DuckDB connection lock poisoned"))
    }
}

#[async_trait]
impl SnapshotQuery for DuckDbSource {
    async fn execute(&self, request: &SnapshotRequest) -> Result<Box<dyn RowCursor>> {
        let (sql, params) = self.select_sql(request)?;
        let conn = self.connection()?.try_clone().map_err(db_err)?;
        debug!(stream = %request.stream, %sql, "snapshot query");

        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let reader = tokio::task::spawn_blocking(move || stream_rows(&conn, &sql, params, &tx));

        Ok(Box::new(DuckDbRowCursor {
            stream: request.stream.clone(),
            rx,
            reader: Some(reader),
            closed: false,
        }))
    }
}

/// Run a query and push each row into `tx` until done or the cursor closes
fn stream_rows(
    conn: &Connection,
    sql: &str,
    params: Vec<DuckValue>,
    tx: &mpsc::Sender<Result<Row>>,
) {
    let result = (|| -> Result<()> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let mut rows = stmt.query(params_from_iter(params)).map_err(db_err)?;
        let mut names: Option<Vec<String>> = None;

        while let Some(row) = rows.next().map_err(db_err)? {
            let names = names.get_or_insert_with(|| row.as_ref().column_names());
            let mut record = JsonObject::new();
            for (index, name) in names.iter().enumerate() {
                let value: DuckValue = row.get(index).map_err(db_err)?;
                record.insert(name.clone(), value_to_json(value));
            }
            if tx.blocking_send(Ok(record)).is_err() {
                break;
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = tx.blocking_send(Err(e));
    }
}

struct DuckDbRowCursor {
    stream: StreamIdentifier,
    rx: mpsc::Receiver<Result<Row>>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl DuckDbRowCursor {
    /// Wait for the query thread; a panic there means rows were lost
    async fn join_reader(&mut self) -> Result<()> {
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        reader.await.map_err(|e| {
            Error::database(format!("snapshot reader for '{}' failed: {e}", self.stream))
        })
    }
}

#[async_trait]
impl RowCursor for DuckDbRowCursor {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Err(Error::database(format!(
                "cursor for '{}' used after close",
                self.stream
            )));
        }

        match self.rx.recv().await {
            Some(row) => row.map(Some),
            // the channel also closes when the query thread dies
            None => self.join_reader().await.map(|()| None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rx.close();
        self.join_reader().await
    }
}

// ============================================================================
// Value Conversion
// ============================================================================

fn db_err(e: duckdb::Error) -> Error {
    Error::database(e.to_string())
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Bind parameter for a cursor comparison
fn cursor_param(cursor: &CursorValue) -> DuckValue {
    match cursor.as_json() {
        JsonValue::Bool(b) => DuckValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => DuckValue::BigInt(i),
            None => DuckValue::Double(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => DuckValue::Text(s.clone()),
        other => DuckValue::Text(other.to_string()),
    }
}

/// JSON schema for discovered columns
fn json_schema(columns: &[ColumnInfo]) -> JsonValue {
    let properties: JsonObject = columns
        .iter()
        .map(|c| (c.name.clone(), json!({"type": ["null", json_type(&c.data_type)]})))
        .collect();
    json!({"type": "object", "properties": properties})
}

fn json_type(data_type: &str) -> &'static str {
    let upper = data_type.to_uppercase();
    match upper.as_str() {
        "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "HUGEINT" | "UTINYINT" | "USMALLINT"
        | "UINTEGER" | "UBIGINT" => "integer",
        "FLOAT" | "DOUBLE" | "REAL" => "number",
        "BOOLEAN" => "boolean",
        _ if upper.starts_with("DECIMAL") || upper.starts_with("NUMERIC") => "number",
        _ => "string",
    }
}

/// Convert a DuckDB value to JSON
fn value_to_json(value: DuckValue) -> JsonValue {
    match value {
        DuckValue::Null => JsonValue::Null,
        DuckValue::Boolean(b) => JsonValue::Bool(b),
        DuckValue::TinyInt(i) => JsonValue::Number(i.into()),
        DuckValue::SmallInt(i) => JsonValue::Number(i.into()),
        DuckValue::Int(i) => JsonValue::Number(i.into()),
        DuckValue::BigInt(i) => JsonValue::Number(i.into()),
        DuckValue::HugeInt(i) => JsonValue::String(i.to_string()),
        DuckValue::UTinyInt(i) => JsonValue::Number(i.into()),
        DuckValue::USmallInt(i) => JsonValue::Number(i.into()),
        DuckValue::UInt(i) => JsonValue::Number(i.into()),
        DuckValue::UBigInt(i) => JsonValue::Number(i.into()),
        DuckValue::Float(f) => {
            serde_json::Number::from_f64(f64::from(f)).map_or(JsonValue::Null, JsonValue::Number)
        }
        DuckValue::Double(f) => {
            serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
        }
        DuckValue::Decimal(d) => JsonValue::String(d.to_string()),
        DuckValue::Text(s) => JsonValue::String(s),
        DuckValue::Blob(b) => {
            JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        DuckValue::Timestamp(_, micros) => {
            let secs = micros.div_euclid(1_000_000);
            let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
            chrono::DateTime::from_timestamp(secs, nanos)
                .map(|dt| JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()))
                .unwrap_or(JsonValue::Number(micros.into()))
        }
        DuckValue::Date32(days) => {
            // 719163 days from 0001-01-01 to 1970-01-01
            chrono::NaiveDate::from_num_days_from_ce_opt(days + 719_163)
                .map(|date| JsonValue::String(date.format("%Y-%m-%d").to_string()))
                .unwrap_or(JsonValue::Number(days.into()))
        }
        DuckValue::Time64(_, micros) => {
            let secs = micros / 1_000_000;
            JsonValue::String(format!(
                "{:02}:{:02}:{:02}.{:06}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                micros % 1_000_000
            ))
        }
        other => JsonValue::String(format!("{other:?}")),
    }
}
