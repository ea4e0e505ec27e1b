use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{array, int, nested, text, Analyzer, PathContext};
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, BANDIT};

/// Python security linter. Exits 1 when issues were found.
pub struct BanditAnalyzer;

impl BanditAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for BanditAnalyzer {
    fn name(&self) -> &'static str {
        "bandit"
    }

    fn table(&self) -> &'static TableSpec {
        &BANDIT
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "bandit".into(),
            "-r".into(),
            target.to_string_lossy().into_owned(),
            "--format".into(),
            "json".into(),
            "-q".into(),
        ]
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let results = array(payload.get("results"));

        let raw_paths: Vec<&str> = results
            .iter()
            .filter_map(|r| r.get("filename").and_then(Value::as_str))
            .collect();
        let root = ctx.root(raw_paths.iter().copied());

        let findings = results
            .iter()
            .filter_map(|r| issue_row(r, ctx, &root))
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

fn issue_row(issue: &Value, ctx: &PathContext<'_>, root: &str) -> Option<Finding> {
    let filename = issue.get("filename")?.as_str()?;
    let line = int(issue.get("line_number"));
    let end_line = array(issue.get("line_range"))
        .iter()
        .filter_map(|v| v.as_i64())
        .max()
        .or(line);

    let rule = [text(issue.get("test_id")), text(issue.get("test_name"))]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(":");

    Some(
        Finding::new(BANDIT.name, ctx.file_path(filename), root)
            .lines(line, end_line)
            .columns(int(issue.get("col_offset")), int(issue.get("end_col_offset")))
            .with_opt("rule", Some(rule).filter(|r| !r.is_empty()))
            .with_opt("code", text(issue.get("code")))
            .with_opt("message", text(issue.get("issue_text")))
            .with_opt("issue_severity", text(issue.get("issue_severity")))
            .with_opt("issue_confidence", text(issue.get("issue_confidence")))
            .with_opt("more_info", text(issue.get("more_info")))
            .with_opt("cwe", nested(issue.get("issue_cwe"))),
    )
}
