//! Content-derived primary keys. The same finding in the same place hashes
//! to the same `pk` whichever scan produced it.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::Finding;
use crate::paths::identity_relative;

/// Fields that discriminate two findings in the same file, in hash order.
const IDENTITY_FIELDS: &[&str] = &[
    "fingerprint",
    "row_type",
    "metric_type",
    "rule_id",
    "check_id",
    "message",
    "line_number",
    "end_line_number",
    "col_offset",
    "end_col_offset",
];

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Content hash identifying `finding` within its table.
///
/// Two findings agreeing on table, root, relative path and every present
/// identity field hash the same no matter which scan produced them.
pub fn finding_pk(finding: &Finding) -> String {
    let root = finding.root.replace('\\', "/");
    let rel = identity_relative(&finding.file_path, &root);

    let mut parts = vec![finding.table.to_string(), root, rel];
    parts.extend(
        IDENTITY_FIELDS
            .iter()
            .filter_map(|field| finding.column(field))
            .filter(truthy)
            .map(|v| render(&v)),
    );

    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fill in `pk` when it is missing and return it.
pub fn ensure_pk(finding: &mut Finding) -> &str {
    if finding.pk.is_none() {
        finding.pk = Some(finding_pk(finding));
    }
    finding.pk.as_deref().unwrap_or_default()
}
