use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{array, dig, int, nested, text, Analyzer, PathContext};
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, BEARER};

/// Buckets bearer groups its findings under, most severe first.
const SEVERITIES: [&str; 5] = ["critical", "high", "medium", "low", "warning"];

/// Data-flow security scanner.
pub struct BearerAnalyzer;

impl BearerAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for BearerAnalyzer {
    fn name(&self) -> &'static str {
        "bearer"
    }

    fn table(&self) -> &'static TableSpec {
        &BEARER
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "bearer".into(),
            "scan".into(),
            target.to_string_lossy().into_owned(),
            "-f".into(),
            "json".into(),
            "--quiet".into(),
        ]
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let bucketed: Vec<(&str, &Value)> = SEVERITIES
            .iter()
            .flat_map(|sev| array(payload.get(*sev)).iter().map(move |f| (*sev, f)))
            .collect();
        let root = ctx.root(bucketed.iter().filter_map(|(_, f)| file_of(f)));

        let findings = bucketed
            .iter()
            .filter_map(|(severity, item)| {
                let file = file_of(item)?;
                let source = item.get("source").unwrap_or(&Value::Null);
                let line = int(item.get("line_number")).or_else(|| int(source.get("start")));
                let title = text(item.get("title"));
                Some(
                    Finding::new(BEARER.name, ctx.file_path(file), root.as_str())
                        .lines(line, int(source.get("end")).or(line))
                        .columns(int(dig(source, &["column", "start"])), int(dig(source, &["column", "end"])))
                        .with_opt("rule_id", text(item.get("id")))
                        .with_opt("title", title.clone())
                        .with("severity", *severity)
                        .with_opt("message", title.or_else(|| text(item.get("description"))))
                        .with_opt("fingerprint", text(item.get("fingerprint")))
                        .with_opt("cwe_ids", nested(item.get("cwe_ids")))
                        .with_opt("category_groups", nested(item.get("category_groups")))
                        .with_opt("code_extract", text(item.get("code_extract")))
                        .with_opt("documentation_url", text(item.get("documentation_url"))),
                )
            })
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

/// The absolute filename when bearer reports one, else the relative one.
fn file_of(item: &Value) -> Option<&str> {
    ["full_filename", "filename"]
        .iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .find(|f| !f.is_empty())
}
