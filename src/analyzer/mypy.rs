use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{int, text, Analyzer, PathContext};
use crate::config::MypyConfig;
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, MYPY};

/// Python type checker, run with `--output json` (one JSON object per line).
pub struct MypyAnalyzer {
    strict: bool,
}

impl MypyAnalyzer {
    pub fn new(config: &MypyConfig) -> Self {
        Self { strict: config.strict }
    }
}

impl Analyzer for MypyAnalyzer {
    fn name(&self) -> &'static str {
        "mypy"
    }

    fn table(&self) -> &'static TableSpec {
        &MYPY
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        let mut cmd: Vec<String> = vec![
            "mypy".into(),
            target.to_string_lossy().into_owned(),
            "--output".into(),
            "json".into(),
            "--no-site-packages".into(),
            "--explicit-package-bases".into(),
            "--show-column-numbers".into(),
            "--ignore-missing-imports".into(),
            "--no-incremental".into(),
        ];
        if self.strict {
            cmd.push("--strict".into());
        }
        cmd
    }

    fn accepts_exit(&self, code: i32) -> bool {
        // 1: type errors reported, 2: mypy itself failed
        matches!(code, 0 | 1)
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let entries = parse_ndjson(run);

        let root = ctx.root(
            entries
                .iter()
                .filter_map(|e| e.get("file").and_then(Value::as_str)),
        );

        let findings = entries
            .iter()
            .filter_map(|entry| {
                let file = entry.get("file")?.as_str()?;
                let line = int(entry.get("line"));
                Some(
                    Finding::new(MYPY.name, ctx.file_path(file), root.as_str())
                        .lines(line, int(entry.get("end_line")).or(line))
                        .columns(int(entry.get("column")), int(entry.get("end_column")))
                        .with_opt("message", text(entry.get("message")))
                        .with_opt("hint", text(entry.get("hint")))
                        .with_opt("code", text(entry.get("code")))
                        .with_opt("severity", text(entry.get("severity"))),
                )
            })
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

/// Objects from a JSON array payload or from newline-delimited stdout.
fn parse_ndjson(run: &RunRecord) -> Vec<Value> {
    if let Some(Value::Array(items)) = &run.payload {
        return items.iter().filter(|v| v.is_object()).cloned().collect();
    }
    run.stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::run;
    use serde_json::json;

    #[test]
    fn test_normalize_ndjson_lines() {
        let stdout = concat!(
            r#"{"file": "pkg/a.py", "line": 3, "column": 8, "message": "Incompatible return value", "hint": null, "code": "return-value", "severity": "error"}"#,
            "\n",
            "not json at all\n",
            r#"{"file": "pkg/b.py", "line": 9, "column": 0, "message": "Name \"x\" is not defined", "hint": "did you mean y?", "code": "name-defined", "severity": "error"}"#,
            "\n"
        );
        let record = run("mypy", "/repo/svc", None, stdout);
        let ctx = PathContext::for_run(&record, None);
        let out = MypyAnalyzer::new(&MypyConfig::default()).normalize(&record, &ctx).unwrap();

        assert_eq!(out.findings.len(), 2);
        let first = &out.findings[0];
        assert_eq!(first.file_path, "/repo/svc/pkg/a.py");
        assert_eq!(first.root, "svc");
        assert_eq!(first.line_number, Some(3));
        assert_eq!(first.col_offset, Some(8));
        assert_eq!(first.column("code"), Some(json!("return-value")));
        assert_eq!(first.column("hint"), None);
        assert_eq!(out.findings[1].column("hint"), Some(json!("did you mean y?")));
    }

    #[test]
    fn test_strict_flag() {
        let analyzer = MypyAnalyzer::new(&MypyConfig { strict: true });
        assert!(analyzer.build_command(Path::new("/p")).contains(&"--strict".to_string()));
    }
}
