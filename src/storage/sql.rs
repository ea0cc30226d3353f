//! Relational backend: one row per request in a single table, one column per known field.
//!
//! The table is created lazily. When a query fails for any reason other than a constraint
//! violation, the current table is renamed to a timestamped backup, the schema is
//! recreated and the query is retried once.

use std::{fs, path::PathBuf};

use anyhow::Context as _;
use rusqlite::{Connection, ErrorCode, OpenFlags, Row, params_from_iter, types::Value as SqlValue};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CleanupPolicy, Storage, StorageError, sql_search::SqlSearch};
use crate::{
    fields::{FIELDS, Field, FieldKind, decode_text, encode_text},
    request::Request,
    search::Search,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Sqlite,
    Mysql,
    Postgres,
}

impl SqlDialect {
    pub fn quote(self, identifier: &str) -> String {
        match self {
            Self::Mysql => format!("`{}`", identifier.replace('`', "``")),
            Self::Sqlite | Self::Postgres => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    pub fn column_type(self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (_, FieldKind::Id) => "VARCHAR(100) PRIMARY KEY",
            (_, FieldKind::Text) => "TEXT NULL",
            (Self::Mysql, FieldKind::Json) => "MEDIUMTEXT NULL",
            (_, FieldKind::Json) => "TEXT NULL",
            (_, FieldKind::Integer) => "INTEGER NULL",
            (_, FieldKind::Float) => "DOUBLE PRECISION NULL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlStorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
    pub table: String,
    /// Selects identifier quoting and column types in the generated DDL.
    pub dialect: SqlDialect,
    pub cleanup: CleanupPolicy,
}

#[derive(Debug, Clone)]
pub struct SqlStorage {
    path: PathBuf,
    table: String,
    dialect: SqlDialect,
    cleanup: CleanupPolicy,
}

impl SqlStorage {
    pub fn new(config: SqlStorageConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.path.parent().filter(|parent| !parent.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        Ok(Self {
            path: config.path,
            table: config.table,
            dialect: config.dialect,
            cleanup: config.cleanup,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn quote(&self, identifier: &str) -> String {
        self.dialect.quote(identifier)
    }

    fn quoted_table(&self) -> String {
        self.quote(&self.table)
    }

    fn column_list(&self) -> String {
        FIELDS
            .iter()
            .map(|field| self.quote(field.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn create_table_sql(&self) -> String {
        let columns = FIELDS
            .iter()
            .map(|field| {
                format!(
                    "{} {}",
                    self.quote(field.name),
                    self.dialect.column_type(field.kind)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({columns})",
            self.quoted_table()
        )
    }

    fn time_index_name(&self) -> String {
        format!("{}_time_index", self.table)
    }

    fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote(&self.time_index_name()),
            self.quoted_table(),
            self.quote("time")
        )
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        open_connection(&self.path).map_err(|err| StorageError::Io(format!("{err:#}")))
    }

    /// Runs `query`, reinitializing the schema and retrying once if it fails.
    fn run<T>(
        &self,
        operation: &'static str,
        query: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        let conn = self.connect()?;
        match query(&conn) {
            Ok(value) => return Ok(value),
            Err(err) if is_constraint_violation(&err) => {
                return Err(StorageError::Write(format!("{operation}: {err}")));
            }
            Err(err) => {
                tracing::debug!(operation, error = %err, "query failed; reinitializing schema");
            }
        }

        self.reinitialize(&conn)
            .map_err(|err| StorageError::Schema(format!("{operation}: {err:#}")))?;
        query(&conn).map_err(|err| StorageError::Schema(format!("{operation}: {err}")))
    }

    /// Moves an existing table aside and creates a fresh one.
    fn reinitialize(&self, conn: &Connection) -> anyhow::Result<()> {
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                [&self.table],
                |row| row.get(0),
            )
            .context("look up request table")?;

        if exists {
            let backup = format!(
                "{}_backup_{}",
                self.table,
                chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f")
            );
            let _ = conn.execute_batch(&format!(
                "DROP INDEX IF EXISTS {}",
                self.quote(&self.time_index_name())
            ));
            match conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quoted_table(),
                self.quote(&backup)
            )) {
                Ok(()) => {
                    tracing::warn!(table = %self.table, backup = %backup, "moved request table aside");
                }
                Err(err) => {
                    tracing::warn!(table = %self.table, error = %err, "backup rename failed");
                }
            }
        }

        conn.execute_batch(&self.create_table_sql())
            .context("create request table")?;
        conn.execute_batch(&self.create_index_sql())
            .context("create request time index")?;
        tracing::debug!(table = %self.table, "initialized request table");
        Ok(())
    }

    fn select(
        &self,
        operation: &'static str,
        search: &SqlSearch,
        descending: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Request>, StorageError> {
        let mut sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} {}",
            self.column_list(),
            self.quoted_table(),
            search.where_clause(),
            self.quote("id"),
            if descending { "DESC" } else { "ASC" }
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let rows = self.run(operation, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params = search.params();
            let rows = stmt.query_map(params.as_slice(), decode_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|map| match Request::from_map(map) {
                Ok(request) => Some(request),
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "skipping undecodable row");
                    None
                }
            })
            .collect())
    }

    fn read(
        &self,
        operation: &'static str,
        search: &SqlSearch,
        descending: bool,
        limit: Option<usize>,
    ) -> Vec<Request> {
        if limit == Some(0) {
            return Vec::new();
        }
        match self.select(operation, search, descending, limit) {
            Ok(requests) => requests,
            Err(err) => {
                tracing::warn!(operation, error = %err, "request query failed");
                Vec::new()
            }
        }
    }

    /// Criteria plus an id boundary that only holds when `id` itself is stored.
    fn anchored(&self, search: &Search, id: &str, operator: &str) -> SqlSearch {
        let mut translated = SqlSearch::new(search, self.dialect);
        let id_column = self.quote("id");
        translated.add_condition(
            format!(
                "{id_column} {operator} :anchor_id AND EXISTS (SELECT 1 FROM {} WHERE {id_column} = :anchor_id)",
                self.quoted_table()
            ),
            [(":anchor_id".to_owned(), SqlValue::Text(id.to_owned()))],
        );
        translated
    }
}

impl Storage for SqlStorage {
    fn all(&self, search: &Search) -> Vec<Request> {
        self.read("all", &SqlSearch::new(search, self.dialect), false, None)
    }

    fn find(&self, id: &str) -> Option<Request> {
        let mut translated = SqlSearch::new(&Search::default(), self.dialect);
        translated.add_condition(
            format!("{} = :id", self.quote("id")),
            [(":id".to_owned(), SqlValue::Text(id.to_owned()))],
        );
        self.read("find", &translated, false, Some(1)).pop()
    }

    fn latest(&self, search: &Search) -> Option<Request> {
        self.read("latest", &SqlSearch::new(search, self.dialect), true, Some(1))
            .pop()
    }

    fn previous(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        let mut requests = self.read("previous", &self.anchored(search, id, "<"), true, count);
        requests.reverse();
        requests
    }

    fn next(&self, id: &str, count: Option<usize>, search: &Search) -> Vec<Request> {
        self.read("next", &self.anchored(search, id, ">"), false, count)
    }

    fn store(&self, request: &Request) -> Result<(), StorageError> {
        let values = row_values(request);
        let placeholders = (1..=FIELDS.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.quoted_table(),
            self.column_list()
        );

        self.run("store", |conn| conn.execute(&sql, params_from_iter(values.iter())))?;

        if let Err(err) = self.cleanup(false) {
            tracing::warn!(error = %err, "cleanup after store failed");
        }
        Ok(())
    }

    fn update(&self, request: &Request) -> Result<(), StorageError> {
        let values = row_values(request);
        let assignments = FIELDS
            .iter()
            .enumerate()
            .filter(|(_, field)| field.kind != FieldKind::Id)
            .map(|(index, field)| format!("{} = ?{}", self.quote(field.name), index + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let id_index = FIELDS
            .iter()
            .position(|field| field.kind == FieldKind::Id)
            .map_or(1, |index| index + 1);
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?{id_index}",
            self.quoted_table(),
            self.quote("id")
        );

        let updated = self.run("update", |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))
        })?;
        if updated == 0 {
            tracing::debug!(id = %request.id, "update matched no stored request");
        }
        Ok(())
    }

    fn cleanup(&self, force: bool) -> Result<usize, StorageError> {
        let Some(cutoff) = self.cleanup.due(force) else {
            return Ok(0);
        };
        let sql = format!(
            "DELETE FROM {} WHERE {} < ?1",
            self.quoted_table(),
            self.quote("time")
        );
        let removed = self.run("cleanup", |conn| conn.execute(&sql, [cutoff]))?;
        tracing::info!(removed, cutoff, table = %self.table, "cleaned up expired requests");
        Ok(removed)
    }
}

fn open_connection(path: &std::path::Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Column values in [`FIELDS`] order; fields outside the table are dropped.
fn row_values(request: &Request) -> Vec<SqlValue> {
    let map = request.to_map();
    FIELDS
        .iter()
        .map(|field| match map.get(field.name) {
            Some(value) => to_sql_value(field, value),
            None => SqlValue::Null,
        })
        .collect()
}

fn to_sql_value(field: &Field, value: &Value) -> SqlValue {
    match (field.kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (FieldKind::Integer, Value::Number(number)) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        (FieldKind::Float, Value::Number(number)) => {
            number.as_f64().map_or(SqlValue::Null, SqlValue::Real)
        }
        (kind, value) => encode_text(Some(kind), value).map_or(SqlValue::Null, SqlValue::Text),
    }
}

fn decode_row(row: &Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let mut map = Map::new();
    for (index, field) in FIELDS.iter().enumerate() {
        let value = match row.get::<_, SqlValue>(index)? {
            SqlValue::Null | SqlValue::Blob(_) => continue,
            SqlValue::Integer(number) => Value::from(number),
            SqlValue::Real(number) => Value::from(number),
            SqlValue::Text(text) => match decode_text(Some(field.kind), &text) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(field = field.name, error = %err, "keeping column as text");
                    Value::String(text)
                }
            },
        };
        map.insert(field.name.to_owned(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;
    use serde_json::json;

    use super::{SqlDialect, SqlStorage, SqlStorageConfig};
    use crate::{
        fields::FieldKind,
        request::{Request, RequestType},
        search::Search,
        storage::{CleanupPolicy, Expiration, Storage, StorageError},
    };

    fn storage(path: &std::path::Path, dialect: SqlDialect) -> SqlStorage {
        SqlStorage::new(SqlStorageConfig {
            path: path.join("requests.db"),
            table: "profiles".to_owned(),
            dialect,
            cleanup: CleanupPolicy::new(Expiration::Minutes(60), 0.0),
        })
        .unwrap()
    }

    fn request(id: &str, time: f64) -> Request {
        let mut request = Request::with_id(id, RequestType::Request, time);
        request.method = Some("POST".to_owned());
        request.uri = Some("/orders".to_owned());
        request.response_status = Some(201);
        request.response_duration = Some(42.5);
        request
            .data
            .insert("headers".to_owned(), json!({ "accept": ["application/json"] }));
        request
    }

    fn table_names(path: &std::path::Path) -> Vec<String> {
        let conn = Connection::open(path.join("requests.db")).unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn dialects_select_quoting_and_column_types() {
        assert_eq!(SqlDialect::Mysql.quote("type"), "`type`");
        assert_eq!(SqlDialect::Postgres.quote("type"), "\"type\"");
        assert_eq!(SqlDialect::Mysql.column_type(FieldKind::Json), "MEDIUMTEXT NULL");
        assert_eq!(SqlDialect::Sqlite.column_type(FieldKind::Json), "TEXT NULL");
        assert_eq!(
            SqlDialect::Postgres.column_type(FieldKind::Float),
            "DOUBLE PRECISION NULL"
        );
    }

    #[test]
    fn table_is_created_lazily_on_first_use() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        assert!(storage.find("missing").is_none());

        assert_eq!(table_names(temp_dir.path()), vec!["profiles"]);
    }

    #[test]
    fn store_and_find_round_trip_known_fields() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        let original = request("12345", 100.0);

        storage.store(&original).unwrap();

        let found = storage.find("12345").unwrap();
        assert_eq!(found.to_value(), original.to_value());
    }

    #[test]
    fn unknown_payload_fields_are_not_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        let mut original = request("x", 1.0);
        original.data.insert("customField".to_owned(), json!("dropped"));

        storage.store(&original).unwrap();
        assert!(!storage.find("x").unwrap().data.contains_key("customField"));
    }

    #[test]
    fn duplicate_ids_are_rejected_without_touching_the_schema() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        storage.store(&request("dup", 1.0)).unwrap();

        let err = storage.store(&request("dup", 2.0)).unwrap_err();
        assert!(matches!(err, StorageError::Write(_)), "error: {err}");
        assert_eq!(table_names(temp_dir.path()), vec!["profiles"]);
    }

    #[test]
    fn broken_table_is_backed_up_and_recreated() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let conn = Connection::open(temp_dir.path().join("requests.db")).unwrap();
            conn.execute_batch("CREATE TABLE profiles (id TEXT PRIMARY KEY, legacy TEXT)")
                .unwrap();
        }
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);

        storage.store(&request("after", 1.0)).unwrap();

        let tables = table_names(temp_dir.path());
        assert_eq!(tables.len(), 2, "tables: {tables:?}");
        assert!(tables.contains(&"profiles".to_owned()));
        assert!(tables.iter().any(|name| name.starts_with("profiles_backup_")));
        assert!(storage.find("after").is_some());
    }

    #[test]
    fn mysql_flavoured_ddl_still_runs_on_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Mysql);
        assert!(storage.create_table_sql().contains("`headers` MEDIUMTEXT NULL"));

        storage.store(&request("m1", 1.0)).unwrap();
        assert_eq!(storage.all(&Search::default()).len(), 1);
    }

    #[test]
    fn previous_and_next_require_a_stored_anchor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        for (index, id) in ["a", "b", "c"].into_iter().enumerate() {
            storage.store(&request(id, index as f64)).unwrap();
        }

        assert!(storage.previous("bb", None, &Search::default()).is_empty());
        assert!(storage.next("bb", None, &Search::default()).is_empty());
        let before: Vec<_> = storage
            .previous("c", None, &Search::default())
            .into_iter()
            .map(|request| request.id)
            .collect();
        assert_eq!(before, vec!["a", "b"]);
    }

    #[test]
    fn update_rewrites_the_row() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = storage(temp_dir.path(), SqlDialect::Sqlite);
        let mut original = request("u", 1.0);
        storage.store(&original).unwrap();

        original.response_status = Some(503);
        original.controller = Some("OrderController@store".to_owned());
        storage.update(&original).unwrap();

        let found = storage.find("u").unwrap();
        assert_eq!(found.response_status, Some(503));
        assert_eq!(found.controller.as_deref(), Some("OrderController@store"));
    }
}
