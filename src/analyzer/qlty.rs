use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{sarif, Analyzer, PathContext};
use crate::models::{Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, QLTY};

/// qlty runs a bundle of linters and reports them as one SARIF document,
/// one run per wrapped linter.
pub struct QltyAnalyzer;

impl QltyAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for QltyAnalyzer {
    fn name(&self) -> &'static str {
        "qlty"
    }

    fn table(&self) -> &'static TableSpec {
        &QLTY
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "qlty".into(),
            "check".into(),
            target.to_string_lossy().into_owned(),
            "--no-fix".into(),
            "--no-formatters".into(),
            "--sarif".into(),
        ]
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings: sarif::findings(&QLTY, &payload, ctx, true),
        })
    }
}
