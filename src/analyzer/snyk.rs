use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{sarif, Analyzer, PathContext};
use crate::models::{Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, SNYK};

/// Snyk Code static analysis, read back as SARIF.
pub struct SnykAnalyzer;

impl SnykAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for SnykAnalyzer {
    fn name(&self) -> &'static str {
        "snyk"
    }

    fn table(&self) -> &'static TableSpec {
        &SNYK
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "snyk".into(),
            "code".into(),
            "test".into(),
            target.to_string_lossy().into_owned(),
            "--sarif".into(),
        ]
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings: sarif::findings(&SNYK, &payload, ctx, false),
        })
    }
}
