//! SQLite persistence for scans and their findings.
//!
//! Findings are keyed by a content hash ([`identity::finding_pk`]), so writing
//! the same scan twice adds a `scan_metadata` row but never a second finding.

pub mod extract;
pub mod identity;
pub mod schema;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Transaction};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{Finding, ScanMetadata};
use schema::{ColumnKind, TableSpec};

/// SQLite's historical host-parameter limit; staying under it keeps bulk
/// inserts portable across library builds.
const MAX_PARAMS: usize = 999;

/// How finding rows are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertMode {
    /// Multi-row `INSERT .. ON CONFLICT(pk) DO NOTHING`.
    #[default]
    Bulk,
    /// One plain `INSERT` per row, constraint violations skipped.
    PerRow,
}

pub struct Store {
    conn: Connection,
    mode: InsertMode,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            // A missing parent surfaces as a sqlite open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(Self {
            conn,
            mode: InsertMode::default(),
        })
    }

    pub fn with_mode(mut self, mode: InsertMode) -> Self {
        self.mode = mode;
        self
    }

    /// Create every table and index that does not exist yet.
    pub fn seed(&self) -> Result<(), StoreError> {
        let mut sql = String::from(schema::SCAN_METADATA_SQL);
        for table in schema::TABLES {
            sql.push('\n');
            sql.push_str(&table.create_sql());
        }
        self.conn.execute_batch(&sql)?;
        debug!(tables = schema::TABLES.len(), "schema ready");
        Ok(())
    }

    /// Write one scan and its findings, returning the new scan id and the
    /// number of finding rows that were actually new.
    pub fn persist(&mut self, scan: &ScanMetadata, findings: Vec<Finding>) -> Result<(i64, usize), StoreError> {
        let mode = self.mode;
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO scan_metadata (scan_timestamp, tool, target) VALUES (?1, ?2, ?3)",
            params![scan.scan_timestamp, scan.tool, scan.target],
        )?;
        let scan_id = tx.last_insert_rowid();

        let mut seen: HashSet<(&'static str, String)> = HashSet::new();
        let mut by_table: BTreeMap<&'static str, Vec<Finding>> = BTreeMap::new();
        for mut finding in findings {
            finding.scan_id = Some(scan_id);
            let pk = identity::ensure_pk(&mut finding).to_string();
            if !seen.insert((finding.table, pk)) {
                continue;
            }
            by_table.entry(finding.table).or_default().push(finding);
        }

        let mut inserted = 0;
        for (name, rows) in &by_table {
            let spec = schema::table(name).ok_or_else(|| StoreError::UnknownTable(name.to_string()))?;
            inserted += match mode {
                InsertMode::Bulk => insert_bulk(&tx, spec, rows)?,
                InsertMode::PerRow => insert_per_row(&tx, spec, rows)?,
            };
        }

        tx.commit()?;
        info!(scan_id, inserted, "scan persisted");
        Ok((scan_id, inserted))
    }

    /// Delete one scan; its findings go with it.
    pub fn delete_scan(&self, scan_id: i64) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM scan_metadata WHERE id = ?1", params![scan_id])?)
    }

    /// Delete every scan stamped before `timestamp` (RFC 3339, compared as text).
    pub fn prune_before(&self, timestamp: &str) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM scan_metadata WHERE scan_timestamp < ?1",
            params![timestamp],
        )?)
    }

    pub fn count_scans(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM scan_metadata", [], |row| row.get(0))?)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let spec = schema::table(table).ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let sql = format!("SELECT COUNT(*) FROM {}", spec.name);
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// Primary keys stored in `table`, sorted.
    pub fn pks(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let spec = schema::table(table).ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT pk FROM {} ORDER BY pk", spec.name))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn column_list(spec: &TableSpec) -> String {
    spec.all_columns()
        .map(|(name, _)| schema::quoted(name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    format!("({})", vec!["?"; count].join(", "))
}

fn insert_bulk(tx: &Transaction<'_>, spec: &TableSpec, rows: &[Finding]) -> Result<usize, StoreError> {
    let width = spec.all_columns().count();
    let per_chunk = (MAX_PARAMS / width).max(1);
    let columns = column_list(spec);
    let mut inserted = 0;

    for chunk in rows.chunks(per_chunk) {
        let groups = vec![placeholders(width); chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT(pk) DO NOTHING",
            spec.name, columns, groups
        );
        let values: Vec<SqlValue> = chunk.iter().flat_map(|f| row_values(spec, f)).collect();
        let mut stmt = tx.prepare_cached(&sql)?;
        inserted += stmt.execute(params_from_iter(values.iter()))?;
    }
    debug!(table = spec.name, attempted = rows.len(), inserted, "bulk insert");
    Ok(inserted)
}

fn insert_per_row(tx: &Transaction<'_>, spec: &TableSpec, rows: &[Finding]) -> Result<usize, StoreError> {
    let width = spec.all_columns().count();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        spec.name,
        column_list(spec),
        placeholders(width)
    );
    let mut stmt = tx.prepare_cached(&sql)?;
    let mut inserted = 0;

    for finding in rows {
        let values = row_values(spec, finding);
        match stmt.execute(params_from_iter(values.iter())) {
            Ok(n) => inserted += n,
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                debug!(table = spec.name, pk = ?finding.pk, "duplicate finding skipped");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(inserted)
}

fn row_values(spec: &TableSpec, finding: &Finding) -> Vec<SqlValue> {
    spec.all_columns()
        .map(|(name, kind)| match *name {
            "pk" => finding.pk.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
            "scan_id" => finding.scan_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null),
            other => to_sql(*kind, finding.column(other)),
        })
        .collect()
}

fn to_sql(kind: ColumnKind, value: Option<Value>) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };
    match (kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnKind::Json, v) => SqlValue::Text(v.to_string()),
        (ColumnKind::Text, Value::String(s)) => SqlValue::Text(s),
        (ColumnKind::Text, v) => SqlValue::Text(v.to_string()),
        (ColumnKind::Integer | ColumnKind::Bool, Value::Bool(b)) => SqlValue::Integer(b as i64),
        (ColumnKind::Integer | ColumnKind::Bool, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(SqlValue::Integer)
            .unwrap_or(SqlValue::Null),
        (ColumnKind::Integer, Value::String(s)) => {
            s.trim().parse::<i64>().map(SqlValue::Integer).unwrap_or(SqlValue::Null)
        }
        (ColumnKind::Real, Value::Number(n)) => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        (ColumnKind::Real, Value::String(s)) => {
            s.trim().parse::<f64>().map(SqlValue::Real).unwrap_or(SqlValue::Null)
        }
        _ => SqlValue::Null,
    }
}
