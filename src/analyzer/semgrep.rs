use std::path::Path;

use anyhow::Result;
use serde_json::Value;

use super::{array, dig, int, nested, text, Analyzer, PathContext};
use crate::config::SemgrepConfig;
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, SEMGREP};

/// Multi-language pattern scanner.
pub struct SemgrepAnalyzer {
    configs: Vec<String>,
    rule_timeout: u64,
}

impl SemgrepAnalyzer {
    pub fn new(config: &SemgrepConfig) -> Self {
        Self {
            configs: config.configs.clone(),
            rule_timeout: config.timeout,
        }
    }
}

impl Analyzer for SemgrepAnalyzer {
    fn name(&self) -> &'static str {
        "semgrep"
    }

    fn table(&self) -> &'static TableSpec {
        &SEMGREP
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        let mut cmd: Vec<String> = vec![
            "semgrep".into(),
            "scan".into(),
            "--json".into(),
            "--metrics".into(),
            "off".into(),
            "--timeout".into(),
            self.rule_timeout.to_string(),
            "--error".into(),
        ];
        for config in &self.configs {
            cmd.push("--config".into());
            cmd.push(config.clone());
        }
        cmd.push(target.to_string_lossy().into_owned());
        cmd
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let results = array(payload.get("results"));
        let root = ctx.root(results.iter().filter_map(|r| r.get("path").and_then(Value::as_str)));

        let findings = results
            .iter()
            .filter_map(|result| {
                let path = result.get("path")?.as_str()?;
                let extra = result.get("extra").unwrap_or(&Value::Null);
                let meta = extra.get("metadata").unwrap_or(&Value::Null);
                Some(
                    Finding::new(SEMGREP.name, ctx.file_path(path), root.as_str())
                        .lines(int(dig(result, &["start", "line"])), int(dig(result, &["end", "line"])))
                        .columns(int(dig(result, &["start", "col"])), int(dig(result, &["end", "col"])))
                        .with_opt("check_id", text(result.get("check_id")))
                        .with_opt("severity", text(extra.get("severity")))
                        .with_opt("message", text(extra.get("message")))
                        .with_opt("fix", text(extra.get("fix")))
                        .with_opt("fingerprint", text(extra.get("fingerprint")).filter(|f| f != "requires login"))
                        .with_opt("category", text(meta.get("category")))
                        .with_opt("confidence", text(meta.get("confidence")))
                        .with_opt("likelihood", text(meta.get("likelihood")))
                        .with_opt("impact", text(meta.get("impact")))
                        .with_opt("cwe", nested(meta.get("cwe")))
                        .with_opt("owasp", nested(meta.get("owasp")))
                        .with_opt("references", nested(meta.get("references")))
                        .with_opt("technology", nested(meta.get("technology")))
                        .with_opt("source_url", text(meta.get("source")))
                        .with_opt("metadata", nested(Some(meta))),
                )
            })
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::run;
    use serde_json::json;

    #[test]
    fn test_normalize_semgrep_results() {
        let payload = json!({
            "errors": [],
            "results": [{
                "check_id": "python.lang.security.audit.eval-detected",
                "path": "/repo/web/views.py",
                "start": {"line": 14, "col": 5, "offset": 300},
                "end": {"line": 14, "col": 22, "offset": 317},
                "extra": {
                    "message": "Detected the use of eval()",
                    "severity": "WARNING",
                    "fingerprint": "requires login",
                    "metadata": {"cwe": ["CWE-95"], "category": "security", "confidence": "LOW"}
                }
            }]
        });
        let record = run("semgrep", "/repo/web", Some(payload), "");
        let ctx = PathContext::for_run(&record, Some("/repo/web"));
        let out = SemgrepAnalyzer::new(&SemgrepConfig::default())
            .normalize(&record, &ctx)
            .unwrap();

        let f = &out.findings[0];
        assert_eq!(f.file_path, "web/views.py");
        assert_eq!((f.line_number, f.col_offset, f.end_col_offset), (Some(14), Some(5), Some(22)));
        assert_eq!(f.column("severity"), Some(json!("WARNING")));
        assert_eq!(f.column("fingerprint"), None);
        assert_eq!(f.column("cwe"), Some(json!(["CWE-95"])));
    }

    #[test]
    fn test_config_flags() {
        let analyzer = SemgrepAnalyzer::new(&SemgrepConfig {
            configs: vec!["p/python".into()],
            timeout: 10,
        });
        let cmd = analyzer.build_command(Path::new("/t"));
        assert_eq!(cmd[..3], ["semgrep", "scan", "--json"]);
        assert!(cmd.windows(2).any(|w| w == ["--config", "p/python"]));
        assert_eq!(cmd.last().map(String::as_str), Some("/t"));
    }
}
