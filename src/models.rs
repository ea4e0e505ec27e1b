use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Uniform result of running one analyzer process once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub tool: String,
    pub cmd: Vec<String>,
    pub cwd: String,
    pub exit_code: i32,
    pub duration_s: f64,
    pub stdout: String,
    pub stderr: String,
    /// Structured output detected on stdout (or assembled by the analyzer).
    pub payload: Option<Value>,
}

impl RunRecord {
    /// Exit code reserved for runs killed by the wall-clock timeout.
    pub const TIMEOUT_EXIT: i32 = 124;

    pub fn timed_out(&self) -> bool {
        self.exit_code == Self::TIMEOUT_EXIT
    }

    /// The structured payload, or stdout parsed as JSON when no payload was
    /// detected up front.
    pub fn json(&self) -> Option<Value> {
        if let Some(payload) = &self.payload {
            return Some(payload.clone());
        }
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// A short failure message: the tail of stderr, else of stdout.
    pub fn failure_message(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        tail(source.trim(), 2000)
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// One orchestration run of one tool against one target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanMetadata {
    pub id: Option<i64>,
    pub scan_timestamp: String,
    pub tool: Option<String>,
    pub target: Option<String>,
}

impl ScanMetadata {
    /// A new, not yet persisted scan stamped with the current UTC time.
    pub fn now() -> Self {
        Self {
            id: None,
            scan_timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            tool: None,
            target: None,
        }
    }

    pub fn for_tool(tool: &str) -> Self {
        Self {
            tool: Some(tool.to_string()),
            ..Self::now()
        }
    }
}

/// One normalized report row destined for a tool-specific table.
///
/// The location columns are shared by every table; everything else lives in
/// `fields`, keyed by the column name of the owning table.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Finding {
    pub table: &'static str,
    pub pk: Option<String>,
    pub scan_id: Option<i64>,
    pub file_path: String,
    pub root: String,
    pub line_number: Option<i64>,
    pub end_line_number: Option<i64>,
    pub col_offset: Option<i64>,
    pub end_col_offset: Option<i64>,
    pub fields: Map<String, Value>,
}

impl Finding {
    pub fn new(table: &'static str, file_path: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            table,
            pk: None,
            scan_id: None,
            file_path: file_path.into(),
            root: root.into(),
            line_number: None,
            end_line_number: None,
            col_offset: None,
            end_col_offset: None,
            fields: Map::new(),
        }
    }

    pub fn lines(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.line_number = start;
        self.end_line_number = end;
        self
    }

    pub fn columns(mut self, start: Option<i64>, end: Option<i64>) -> Self {
        self.col_offset = start;
        self.end_col_offset = end;
        self
    }

    /// Set a tool-specific column. `null` values are dropped.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.fields.insert(key.to_string(), value);
        }
        self
    }

    pub fn with_opt<T: Into<Value>>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    /// Look up a column by name, including the shared location columns.
    pub fn column(&self, key: &str) -> Option<Value> {
        match key {
            "file_path" => Some(Value::from(self.file_path.clone())),
            "root" => Some(Value::from(self.root.clone())),
            "line_number" => self.line_number.map(Value::from),
            "end_line_number" => self.end_line_number.map(Value::from),
            "col_offset" => self.col_offset.map(Value::from),
            "end_col_offset" => self.end_col_offset.map(Value::from),
            other => self.fields.get(other).cloned(),
        }
    }
}

/// What an analyzer hands back after normalizing one run.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub scan: ScanMetadata,
    pub findings: Vec<Finding>,
}

impl Normalized {
    pub fn empty(tool: &str) -> Self {
        Self {
            scan: ScanMetadata::for_tool(tool),
            findings: Vec::new(),
        }
    }
}

/// Why a single tool did not produce findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Crashed,
    ParsingFailed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Failed => write!(f, "failed"),
            FailureKind::Crashed => write!(f, "crashed"),
            FailureKind::ParsingFailed => write!(f, "parsing_failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub exit: i32,
    pub message: String,
}

/// Outcome of auditing one target with a set of tools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub target: String,
    pub tools_requested: Vec<String>,
    pub tools_ok: Vec<String>,
    pub tools_failed: BTreeMap<String, ToolFailure>,
    pub durations_sec: BTreeMap<String, f64>,
    /// Rows produced by normalize per tool.
    pub rows: BTreeMap<String, usize>,
    /// Rows actually written (new identities) per tool.
    pub inserted: BTreeMap<String, usize>,
    pub elapsed_total_sec: f64,
}

impl AuditSummary {
    pub fn has_failures(&self) -> bool {
        !self.tools_failed.is_empty()
    }
}
