//! Read side: findings across every message-bearing table, by root or scan.

use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde::Serialize;

use super::{schema, Store};
use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExportedFinding {
    pub tool: String,
    pub message: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub start_col: Option<i64>,
    pub end_col: Option<i64>,
    pub file_path: String,
}

/// The document written per root by `export`.
#[derive(Debug, Clone, Serialize)]
pub struct FindingsDocument {
    pub name: String,
    pub findings: Vec<ExportedFinding>,
    pub root: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractFilter {
    pub root: Option<String>,
    pub scan_id: Option<i64>,
}

impl Store {
    /// Every distinct root recorded in any findings table, sorted.
    pub fn roots(&self) -> Result<Vec<String>, StoreError> {
        let mut roots = BTreeSet::new();
        for table in schema::TABLES {
            let sql = format!("SELECT DISTINCT \"root\" FROM {} WHERE \"root\" IS NOT NULL", table.name);
            let mut stmt = self.connection().prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for root in rows {
                roots.insert(root?);
            }
        }
        Ok(roots.into_iter().collect())
    }

    /// Findings from every table that carries a message, optionally narrowed
    /// to one root and/or one scan.
    pub fn extract(&self, filter: &ExtractFilter) -> Result<FindingsDocument, StoreError> {
        let mut findings = Vec::new();

        for table in schema::message_tables() {
            let mut sql = format!(
                "SELECT \"message\", \"line_number\", \"end_line_number\", \"col_offset\", \"end_col_offset\", \"file_path\" \
                 FROM {} WHERE 1 = 1",
                table.name
            );
            let mut args: Vec<SqlValue> = Vec::new();
            if let Some(root) = &filter.root {
                sql.push_str(" AND \"root\" = ?");
                args.push(SqlValue::Text(root.clone()));
            }
            if let Some(scan_id) = filter.scan_id {
                sql.push_str(" AND \"scan_id\" = ?");
                args.push(SqlValue::Integer(scan_id));
            }
            sql.push_str(" ORDER BY \"file_path\", \"line_number\"");

            let mut stmt = self.connection().prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                Ok(ExportedFinding {
                    tool: table.tool.to_string(),
                    message: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    start_line: row.get(1)?,
                    end_line: row.get(2)?,
                    start_col: row.get(3)?,
                    end_col: row.get(4)?,
                    file_path: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                })
            })?;
            for row in rows {
                findings.push(row?);
            }
        }

        Ok(FindingsDocument {
            name: "auditor".to_string(),
            findings,
            root: filter.root.clone(),
        })
    }
}

/// Pick the stored root that best matches a folder name: an exact match
/// first, then any root whose path segments end with the folder's segments.
pub fn match_root_by_folder(roots: &[String], folder: &str) -> Option<String> {
    let wanted = folder.trim_end_matches(['/', '\\']);
    if let Some(exact) = roots.iter().find(|r| r.as_str() == wanted) {
        return Some(exact.clone());
    }

    let wanted_parts: Vec<&str> = segments(wanted);
    if wanted_parts.is_empty() {
        return None;
    }
    roots
        .iter()
        .find(|root| {
            let parts = segments(root);
            parts.len() >= wanted_parts.len() && parts[parts.len() - wanted_parts.len()..] == wanted_parts[..]
        })
        .cloned()
}

fn segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}

/// Final folder name of a root, used as its export directory.
pub fn root_folder(root: &str) -> String {
    Path::new(root.trim_end_matches(['/', '\\']))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}
