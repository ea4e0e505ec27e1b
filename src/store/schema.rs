//! Relational layout of the findings database.
//!
//! Every tool owns one `<tool>_results` table. The base columns are shared;
//! the tool columns are a stable contract for whatever reads the database, so
//! renaming one is a breaking change.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Bool,
    /// Nested data stored as JSON text.
    Json,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text | ColumnKind::Json => "TEXT",
            ColumnKind::Integer | ColumnKind::Bool => "INTEGER",
            ColumnKind::Real => "REAL",
        }
    }
}

#[derive(Debug)]
pub struct TableSpec {
    pub name: &'static str,
    pub tool: &'static str,
    pub columns: &'static [(&'static str, ColumnKind)],
}

impl TableSpec {
    pub fn has_column(&self, name: &str) -> bool {
        BASE_COLUMNS.iter().any(|(c, _)| *c == name) || self.columns.iter().any(|(c, _)| *c == name)
    }

    /// Base columns followed by tool columns, in insert order.
    pub fn all_columns(&self) -> impl Iterator<Item = &(&'static str, ColumnKind)> {
        BASE_COLUMNS.iter().chain(self.columns.iter())
    }

    pub fn create_sql(&self) -> String {
        let mut cols = vec![
            format!("{} TEXT PRIMARY KEY", quoted("pk")),
            format!(
                "{} INTEGER NOT NULL REFERENCES scan_metadata(id) ON DELETE CASCADE",
                quoted("scan_id")
            ),
        ];
        cols.extend(
            BASE_COLUMNS
                .iter()
                .skip(2)
                .chain(self.columns.iter())
                .map(|(name, kind)| format!("{} {}", quoted(name), kind.sql_type())),
        );
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n\
             CREATE INDEX IF NOT EXISTS idx_{}_scan ON {}(scan_id);\n\
             CREATE INDEX IF NOT EXISTS idx_{}_root ON {}(root);",
            self.name,
            cols.join(",\n    "),
            self.name,
            self.name,
            self.name,
            self.name,
        )
    }
}

/// Column names come from tool output vocabularies (`references`, ...), so
/// they are always quoted in generated SQL.
pub fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

use ColumnKind::{Bool, Integer, Json, Real, Text};

pub const BASE_COLUMNS: &[(&str, ColumnKind)] = &[
    ("pk", Text),
    ("scan_id", Integer),
    ("file_path", Text),
    ("root", Text),
    ("line_number", Integer),
    ("end_line_number", Integer),
    ("col_offset", Integer),
    ("end_col_offset", Integer),
];

pub const SCAN_METADATA_SQL: &str = "CREATE TABLE IF NOT EXISTS scan_metadata (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_timestamp TEXT NOT NULL,
    tool TEXT,
    target TEXT
);
CREATE INDEX IF NOT EXISTS idx_scan_metadata_ts ON scan_metadata(scan_timestamp);";

pub const BANDIT: TableSpec = TableSpec {
    name: "bandit_results",
    tool: "bandit",
    columns: &[
        ("rule", Text),
        ("code", Text),
        ("message", Text),
        ("issue_severity", Text),
        ("issue_confidence", Text),
        ("more_info", Text),
        ("cwe", Json),
    ],
};

pub const MYPY: TableSpec = TableSpec {
    name: "mypy_results",
    tool: "mypy",
    columns: &[
        ("message", Text),
        ("hint", Text),
        ("code", Text),
        ("severity", Text),
    ],
};

pub const RADON: TableSpec = TableSpec {
    name: "radon_results",
    tool: "radon",
    columns: &[
        ("metric_type", Text),
        ("cc_blocks", Integer),
        ("cc_total", Real),
        ("cc_max", Real),
        ("cc_avg", Real),
        ("cc_worst_rank", Text),
        ("cc_rank_counts", Json),
        ("mi", Real),
        ("mi_rank", Text),
        ("raw_loc", Integer),
        ("raw_sloc", Integer),
        ("raw_lloc", Integer),
        ("raw_comments", Integer),
        ("raw_multi", Integer),
        ("raw_blank", Integer),
        ("raw_single_comments", Integer),
        ("hal_volume", Real),
        ("hal_difficulty", Real),
        ("hal_effort", Real),
        ("hal_time", Real),
        ("hal_bugs", Real),
        ("extra", Json),
    ],
};

pub const VULTURE: TableSpec = TableSpec {
    name: "vulture_results",
    tool: "vulture",
    columns: &[("message", Text), ("confidence", Integer), ("kind", Text)],
};

pub const ESLINT: TableSpec = TableSpec {
    name: "eslint_results",
    tool: "eslint",
    columns: &[
        ("row_type", Text),
        ("rule_id", Text),
        ("severity", Integer),
        ("message", Text),
        ("fatal", Bool),
        ("fix", Bool),
        ("node_type", Text),
        ("message_id", Text),
        ("suggestion_count", Integer),
        ("suggestions", Json),
        ("fix_text", Text),
        ("fix_range", Json),
        ("error_count", Integer),
        ("warning_count", Integer),
        ("fixable_error_count", Integer),
        ("fixable_warning_count", Integer),
        ("mi", Real),
        ("mi_rank", Text),
        ("metrics", Json),
    ],
};

pub const SEMGREP: TableSpec = TableSpec {
    name: "semgrep_results",
    tool: "semgrep",
    columns: &[
        ("check_id", Text),
        ("severity", Text),
        ("message", Text),
        ("fix", Text),
        ("fingerprint", Text),
        ("category", Text),
        ("confidence", Text),
        ("likelihood", Text),
        ("impact", Text),
        ("cwe", Json),
        ("owasp", Json),
        ("references", Json),
        ("technology", Json),
        ("source_url", Text),
        ("metadata", Json),
    ],
};

pub const GITLEAKS: TableSpec = TableSpec {
    name: "gitleaks_results",
    tool: "gitleaks",
    columns: &[
        ("rule_id", Text),
        ("description", Text),
        ("message", Text),
        ("fingerprint", Text),
        ("secret", Text),
        ("match_text", Text),
        ("entropy", Real),
        ("commit_sha", Text),
        ("author", Text),
        ("email", Text),
        ("commit_date", Text),
        ("tags", Json),
    ],
};

pub const BIOME: TableSpec = TableSpec {
    name: "biome_results",
    tool: "biome",
    columns: &[
        ("category", Text),
        ("severity", Text),
        ("message", Text),
        ("span_start", Integer),
        ("span_end", Integer),
        ("tags", Json),
        ("advices", Json),
    ],
};

pub const SNYK: TableSpec = TableSpec {
    name: "snyk_results",
    tool: "snyk",
    columns: &[
        ("rule_id", Text),
        ("rule_name", Text),
        ("level", Text),
        ("message", Text),
        ("fingerprint", Text),
        ("help_text", Text),
        ("tags", Json),
        ("properties", Json),
    ],
};

pub const BEARER: TableSpec = TableSpec {
    name: "bearer_results",
    tool: "bearer",
    columns: &[
        ("rule_id", Text),
        ("title", Text),
        ("severity", Text),
        ("message", Text),
        ("fingerprint", Text),
        ("cwe_ids", Json),
        ("category_groups", Json),
        ("code_extract", Text),
        ("documentation_url", Text),
    ],
};

pub const QLTY: TableSpec = TableSpec {
    name: "qlty_results",
    tool: "qlty",
    columns: &[
        ("rule_id", Text),
        ("rule_name", Text),
        ("level", Text),
        ("message", Text),
        ("fingerprint", Text),
        ("tool_name", Text),
        ("tags", Json),
        ("properties", Json),
    ],
};

pub const JSCPD: TableSpec = TableSpec {
    name: "jscpd_results",
    tool: "jscpd",
    columns: &[
        ("row_type", Text),
        ("rule_id", Text),
        ("fingerprint", Text),
        ("message", Text),
        ("format", Text),
        ("lines", Integer),
        ("tokens", Integer),
        ("counterpart", Json),
        ("clones", Integer),
        ("duplicated_lines", Integer),
        ("percentage", Real),
    ],
};

pub const TABLES: &[&TableSpec] = &[
    &BANDIT, &MYPY, &RADON, &VULTURE, &ESLINT, &SEMGREP, &GITLEAKS, &BIOME, &SNYK, &BEARER, &QLTY, &JSCPD,
];

pub fn table(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().copied().find(|t| t.name == name)
}

/// Tables whose rows carry a human-readable `message`. Radon rows are pure
/// metrics and stay out of exports.
pub fn message_tables() -> impl Iterator<Item = &'static TableSpec> {
    TABLES
        .iter()
        .copied()
        .filter(|t| t.columns.iter().any(|(c, _)| *c == "message"))
}
