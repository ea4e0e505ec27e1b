use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::{array, int, nested, radon, text, Analyzer, PathContext};
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, ESLINT};

const SOURCE_EXTENSIONS: [&str; 6] = ["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// JS/TS linter. Besides one row per message it writes a `file` row per
/// linted file and a single `scan` row with totals for the whole run.
pub struct EslintAnalyzer;

impl EslintAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

/// Occurrences of a threshold rule and the largest number it reported.
#[derive(Debug, Default, Serialize)]
struct RuleTally {
    count: usize,
    max: f64,
}

impl RuleTally {
    fn record(&mut self, reported: Option<f64>) {
        self.count += 1;
        if let Some(n) = reported {
            self.max = self.max.max(n);
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct ScanMetrics {
    files: usize,
    by_rule: BTreeMap<String, usize>,
    by_severity: BTreeMap<String, usize>,
    complexity: RuleTally,
    max_depth: RuleTally,
    max_params: RuleTally,
    max_lines_per_function: RuleTally,
    import_cycles: usize,
}

#[derive(Debug, Default)]
struct Totals {
    errors: i64,
    warnings: i64,
    fixable_errors: i64,
    fixable_warnings: i64,
}

impl Analyzer for EslintAnalyzer {
    fn name(&self) -> &'static str {
        "eslint"
    }

    fn table(&self) -> &'static TableSpec {
        &ESLINT
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "eslint".into(),
            "-f".into(),
            "json".into(),
            "--no-error-on-unmatched-pattern".into(),
            "--no-warn-ignored".into(),
            target.to_string_lossy().into_owned(),
        ]
    }

    fn uses_complexity(&self) -> bool {
        true
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let number = Regex::new(r"(\d+(?:\.\d+)?)")?;
        let entries: Vec<(&str, &Value)> = array(Some(&payload))
            .iter()
            .filter_map(|entry| {
                let file = entry.get("filePath")?.as_str()?;
                is_source(file).then_some((file, entry))
            })
            .collect();
        let root = ctx.root(entries.iter().map(|(file, _)| *file));

        let mut findings = Vec::new();
        let mut metrics = ScanMetrics::default();
        let mut totals = Totals::default();

        for (file, entry) in &entries {
            let file_path = ctx.file_path(file);
            let counts = [
                int(entry.get("errorCount")).unwrap_or(0),
                int(entry.get("warningCount")).unwrap_or(0),
                int(entry.get("fixableErrorCount")).unwrap_or(0),
                int(entry.get("fixableWarningCount")).unwrap_or(0),
            ];
            totals.errors += counts[0];
            totals.warnings += counts[1];
            totals.fixable_errors += counts[2];
            totals.fixable_warnings += counts[3];
            metrics.files += 1;

            for message in array(entry.get("messages")) {
                let rule = text(message.get("ruleId"));
                let severity = int(message.get("severity"));
                let body = text(message.get("message")).map(|m| m.trim().to_string());
                tally(&mut metrics, rule.as_deref(), severity, body.as_deref(), &number);

                let fix = message.get("fix").filter(|f| f.is_object());
                let suggestions = message.get("suggestions").and_then(Value::as_array);
                findings.push(
                    Finding::new(ESLINT.name, file_path.clone(), root.as_str())
                        .lines(int(message.get("line")), int(message.get("endLine")))
                        .columns(int(message.get("column")), int(message.get("endColumn")))
                        .with("row_type", "issue")
                        .with_opt("rule_id", rule)
                        .with_opt("severity", severity)
                        .with_opt("message", body)
                        .with_opt("fatal", message.get("fatal").and_then(Value::as_bool))
                        .with("fix", fix.is_some())
                        .with_opt("node_type", text(message.get("nodeType")))
                        .with_opt("message_id", text(message.get("messageId")))
                        .with_opt("suggestion_count", suggestions.map(|s| s.len() as i64))
                        .with_opt("suggestions", suggestions.map(|s| Value::Array(s.clone())))
                        .with_opt("fix_text", fix.and_then(|f| text(f.get("text"))))
                        .with_opt("fix_range", fix.and_then(|f| nested(f.get("range")))),
                );
            }

            let maintainability = ctx
                .complexity
                .and_then(|bundle| radon::maintainability_for(bundle, file, ctx.cwd));
            findings.push(
                Finding::new(ESLINT.name, file_path, root.as_str())
                    .with("row_type", "file")
                    .with("error_count", counts[0])
                    .with("warning_count", counts[1])
                    .with("fixable_error_count", counts[2])
                    .with("fixable_warning_count", counts[3])
                    .with_opt("mi", maintainability.as_ref().map(|(mi, _)| *mi))
                    .with_opt("mi_rank", maintainability.and_then(|(_, rank)| rank)),
            );
        }

        let scan_path = ctx.file_path(ctx.anchor.or(ctx.cwd).unwrap_or("."));
        findings.push(
            Finding::new(ESLINT.name, scan_path, root.as_str())
                .with("row_type", "scan")
                .with("error_count", totals.errors)
                .with("warning_count", totals.warnings)
                .with("fixable_error_count", totals.fixable_errors)
                .with("fixable_warning_count", totals.fixable_warnings)
                .with("metrics", serde_json::to_value(&metrics)?),
        );

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

/// Files without an extension pass; anything else must be JS/TS.
fn is_source(file: &str) -> bool {
    match Path::new(file).extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            SOURCE_EXTENSIONS.contains(&ext.as_str())
        }
        None => true,
    }
}

fn tally(metrics: &mut ScanMetrics, rule: Option<&str>, severity: Option<i64>, body: Option<&str>, number: &Regex) {
    if let Some(rule) = rule {
        *metrics.by_rule.entry(rule.to_string()).or_insert(0) += 1;
    }
    if let Some(sev @ (1 | 2)) = severity {
        *metrics.by_severity.entry(sev.to_string()).or_insert(0) += 1;
    }
    let reported = body
        .and_then(|b| number.captures(b))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());
    match rule {
        Some("complexity") => metrics.complexity.record(reported),
        Some("max-depth") => metrics.max_depth.record(reported),
        Some("max-params") => metrics.max_params.record(reported),
        Some("max-lines-per-function") => metrics.max_lines_per_function.record(reported),
        Some("import/no-cycle") => metrics.import_cycles += 1,
        _ => {}
    }
}
