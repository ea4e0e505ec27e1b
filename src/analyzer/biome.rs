use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{array, dig, int, nested, text, Analyzer, PathContext};
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, BIOME};

/// JS/TS linter. Locations come as byte spans into the embedded source,
/// so lines are recovered by counting newlines.
pub struct BiomeAnalyzer;

impl BiomeAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for BiomeAnalyzer {
    fn name(&self) -> &'static str {
        "biome"
    }

    fn table(&self) -> &'static TableSpec {
        &BIOME
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "biome".into(),
            "check".into(),
            target.to_string_lossy().into_owned(),
            "--reporter".into(),
            "json".into(),
            "--colors".into(),
            "off".into(),
            "--log-level".into(),
            "none".into(),
            "--formatter-enabled=false".into(),
            "--no-errors-on-unmatched".into(),
        ]
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let diagnostics = array(payload.get("diagnostics"));
        let root = ctx.root(diagnostics.iter().filter_map(file_of).filter(|f| !f.is_empty()));

        let findings = diagnostics
            .iter()
            .filter_map(|diag| {
                let file = file_of(diag).filter(|f| !f.is_empty())?;
                let location = diag.get("location").unwrap_or(&Value::Null);
                let span = array(location.get("span"));
                let start = int(span.first());
                let end = int(span.get(1));
                let (line, end_line) = match location.get("sourceCode").and_then(Value::as_str) {
                    Some(source) => (line_at(source, start), line_at(source, end)),
                    None => (None, None),
                };
                let message = message_text(diag.get("message"))
                    .or_else(|| text(diag.get("description")));
                Some(
                    Finding::new(BIOME.name, ctx.file_path(file), root.as_str())
                        .lines(line, end_line.or(line))
                        .with_opt("category", text(diag.get("category")))
                        .with_opt("severity", text(diag.get("severity")))
                        .with_opt("message", message)
                        .with_opt("span_start", start)
                        .with_opt("span_end", end)
                        .with_opt("tags", nested(diag.get("tags")))
                        .with_opt("advices", nested(diag.get("advices")).filter(Value::is_object)),
                )
            })
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

fn file_of(diag: &Value) -> Option<&str> {
    dig(diag, &["location", "path", "file"]).and_then(Value::as_str)
}

/// 1-based line containing byte `offset` of `source`.
fn line_at(source: &str, offset: Option<i64>) -> Option<i64> {
    let offset = usize::try_from(offset?).ok()?.min(source.len());
    let newlines = source.as_bytes()[..offset].iter().filter(|b| **b == b'\n').count();
    Some(newlines as i64 + 1)
}

/// Biome messages are either plain strings or lists of markup parts.
fn message_text(message: Option<&Value>) -> Option<String> {
    let joined = match message? {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("content").and_then(Value::as_str))
            .collect(),
        _ => return None,
    };
    Some(joined).filter(|m| !m.is_empty())
}
