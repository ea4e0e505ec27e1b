use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{array, float, int, text, Analyzer, PathContext};
use crate::config::JscpdConfig;
use crate::error::SandboxError;
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::sandbox::Sandbox;
use crate::store::schema::{TableSpec, JSCPD};

const REPORT_FILE: &str = "jscpd-report.json";

/// Copy/paste detector. Every clone is reported once per pair of
/// locations, however many times jscpd lists it.
pub struct JscpdAnalyzer {
    config: JscpdConfig,
}

/// One side of a clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Side {
    file: String,
    start: i64,
    end: i64,
    raw_file: String,
    start_col: Option<i64>,
    end_col: Option<i64>,
}

impl Side {
    fn from_instance(instance: &Value, ctx: &PathContext<'_>) -> Option<Self> {
        let raw = text(instance.get("name")).or_else(|| text(instance.get("file")))?;
        let start = int(instance.get("startLoc").and_then(|l| l.get("line"))).or_else(|| int(instance.get("start")));
        let end = int(instance.get("endLoc").and_then(|l| l.get("line"))).or_else(|| int(instance.get("end")));
        Some(Self {
            file: ctx.relative(&raw),
            start: start.unwrap_or(0),
            end: end.unwrap_or(0),
            start_col: int(instance.get("startLoc").and_then(|l| l.get("column"))),
            end_col: int(instance.get("endLoc").and_then(|l| l.get("column"))),
            raw_file: raw,
        })
    }

    fn label(&self) -> String {
        format!("{}:{}-{}", self.file, self.start, self.end)
    }
}

impl JscpdAnalyzer {
    pub fn new(config: &JscpdConfig) -> Self {
        Self { config: config.clone() }
    }

    fn command(&self, target: &Path, out_dir: Option<&Path>) -> Vec<String> {
        let cfg = &self.config;
        let mut cmd: Vec<String> = vec!["jscpd".into(), "--reporters".into(), "json".into(), "--silent".into()];
        if let Some(dir) = out_dir {
            cmd.push("--output".into());
            cmd.push(dir.to_string_lossy().into_owned());
        }
        if !cfg.formats.is_empty() {
            cmd.push("--format".into());
            cmd.push(cfg.formats.join(","));
        }
        for pattern in &cfg.patterns {
            cmd.push("--pattern".into());
            cmd.push(pattern.clone());
        }
        if cfg.gitignore {
            cmd.push("--gitignore".into());
        }
        for glob in &cfg.ignore {
            cmd.push("--ignore".into());
            cmd.push(glob.clone());
        }
        if let Some(n) = cfg.min_tokens {
            cmd.push("--min-tokens".into());
            cmd.push(n.to_string());
        }
        if let Some(n) = cfg.min_lines {
            cmd.push("--min-lines".into());
            cmd.push(n.to_string());
        }
        cmd.push(target.to_string_lossy().into_owned());
        cmd
    }

    /// Unordered identity of a clone pair. With `fragment_in_key` the
    /// duplicated text is part of it, so equal spans with different
    /// contents stay apart.
    fn pair_key(&self, a: &Side, b: &Side, fragment: Option<&str>) -> String {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut key = format!("{}|{}", first.label(), second.label());
        if self.config.fragment_in_key {
            if let Some(fragment) = fragment {
                key.push('|');
                key.push_str(&sha256_hex(fragment));
            }
        }
        key
    }

    fn clone_rows(&self, payload: &Value, ctx: &PathContext<'_>, root: &str) -> Vec<Finding> {
        let clones = ["duplicates", "clones"]
            .iter()
            .map(|k| array(payload.get(*k)))
            .find(|a| !a.is_empty())
            .unwrap_or(&[]);

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for clone in clones {
            let instances = pair_instances(clone);
            let (Some(a), Some(b)) = (
                instances.first().and_then(|i| Side::from_instance(i, ctx)),
                instances.get(1).and_then(|i| Side::from_instance(i, ctx)),
            ) else {
                continue;
            };
            if !self.config.allow_intra_file && a.file == b.file {
                continue;
            }
            let fragment = clone.get("fragment").and_then(Value::as_str);
            let key = self.pair_key(&a, &b, fragment);
            if !seen.insert(key.clone()) && !self.config.emit_both_sides {
                continue;
            }

            let lines = int(clone.get("lines"));
            let tokens = int(clone.get("tokens"));
            let format = text(clone.get("format")).or_else(|| text(clone.get("language")));
            let size = format!(
                "{} lines, {} tokens",
                lines.map_or_else(|| "n/a".to_string(), |n| n.to_string()),
                tokens.map_or_else(|| "n/a".to_string(), |n| n.to_string()),
            );
            let fingerprint = sha256_hex(&key);

            let (primary, other) = if a <= b { (&a, &b) } else { (&b, &a) };
            let mut sides = vec![(primary, other)];
            if self.config.emit_both_sides {
                sides.push((other, primary));
            }
            for (side, counterpart) in sides {
                // Worded from the row's own side so report order never leaks
                // into the identity.
                let message = format!(
                    "Duplicate block ({size}) between {} and {}",
                    side.label(),
                    counterpart.label()
                );
                rows.push(
                    Finding::new(JSCPD.name, ctx.file_path(&side.raw_file), root)
                        .lines(Some(side.start), Some(side.end))
                        .columns(side.start_col, side.end_col)
                        .with("row_type", "issue")
                        .with("rule_id", "duplicate")
                        .with("fingerprint", fingerprint.clone())
                        .with("message", message)
                        .with_opt("format", format.clone())
                        .with_opt("lines", lines)
                        .with_opt("tokens", tokens)
                        .with(
                            "counterpart",
                            json!({
                                "file": ctx.file_path(&counterpart.raw_file),
                                "start_line": counterpart.start,
                                "end_line": counterpart.end,
                                "start_col": counterpart.start_col,
                                "end_col": counterpart.end_col,
                            }),
                        ),
                );
            }
        }
        rows
    }

    /// Per-file duplication statistics, keyed by format in the report.
    fn file_rows(&self, payload: &Value, ctx: &PathContext<'_>, root: &str) -> Vec<Finding> {
        let formats = payload
            .get("statistics")
            .and_then(|s| s.get("formats"))
            .and_then(Value::as_object);
        let mut rows = Vec::new();
        for (format, stats) in formats.into_iter().flatten() {
            let Some(sources) = stats.get("sources").and_then(Value::as_object) else {
                continue;
            };
            for (file, entry) in sources {
                rows.push(
                    Finding::new(JSCPD.name, ctx.file_path(file), root)
                        .with("row_type", "file")
                        .with("format", format.as_str())
                        .with_opt("lines", int(entry.get("lines")))
                        .with_opt("tokens", int(entry.get("tokens")))
                        .with_opt("clones", int(entry.get("clones")))
                        .with_opt("duplicated_lines", int(entry.get("duplicatedLines")))
                        .with_opt("percentage", float(entry.get("percentage"))),
                );
            }
        }
        rows
    }
}

#[async_trait]
impl Analyzer for JscpdAnalyzer {
    fn name(&self) -> &'static str {
        "jscpd"
    }

    fn table(&self) -> &'static TableSpec {
        &JSCPD
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        self.command(target, None)
    }

    /// Runs with a scratch report directory and reads the JSON report from
    /// there when nothing usable came out on stdout.
    async fn execute(&self, target: &Path, sandbox: &Sandbox) -> Result<RunRecord, SandboxError> {
        let out_dir = tempfile::Builder::new()
            .prefix("jscpd-")
            .tempdir()
            .map_err(|e| SandboxError::Other(format!("jscpd report dir: {e}")))?;
        let argv = self.command(target, Some(out_dir.path()));
        let mut run = sandbox.run(self.name(), &argv, &self.working_dir(target)).await?;

        if run.payload.is_none() {
            let report = out_dir.path().join(REPORT_FILE);
            match tokio::fs::read_to_string(&report).await {
                Ok(body) => run.payload = serde_json::from_str(&body).ok(),
                Err(e) => debug!("No jscpd report at {}: {e}", report.display()),
            }
        }
        Ok(run)
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let payload = run.json().unwrap_or(Value::Null);
        let root = ctx.root(std::iter::empty());
        let mut findings = self.clone_rows(&payload, ctx, &root);
        findings.extend(self.file_rows(&payload, ctx, &root));
        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

/// The two locations of a clone, across jscpd report versions.
fn pair_instances(clone: &Value) -> Vec<&Value> {
    for (a, b) in [("firstFile", "secondFile"), ("duplicationA", "duplicationB")] {
        if let (Some(first), Some(second)) = (clone.get(a), clone.get(b)) {
            return vec![first, second];
        }
    }
    array(clone.get("instances")).iter().take(2).collect()
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::run;
    use crate::store::identity::finding_pk;

    fn clone_entry(a: (&str, i64, i64), b: (&str, i64, i64), fragment: &str) -> Value {
        json!({
            "format": "typescript",
            "lines": 12,
            "tokens": 80,
            "fragment": fragment,
            "firstFile": {"name": a.0, "start": a.1, "end": a.2, "startLoc": {"line": a.1, "column": 1}, "endLoc": {"line": a.2, "column": 2}},
            "secondFile": {"name": b.0, "start": b.1, "end": b.2, "startLoc": {"line": b.1, "column": 1}, "endLoc": {"line": b.2, "column": 2}}
        })
    }

    fn normalize_with(config: JscpdConfig, payload: Value) -> Normalized {
        let record = run("jscpd", "/repo/site", Some(payload), "");
        let ctx = PathContext::for_run(&record, Some("/repo/site"));
        JscpdAnalyzer::new(&config).normalize(&record, &ctx).unwrap()
    }

    #[test]
    fn test_mirrored_pair_yields_one_finding() {
        let payload = json!({"duplicates": [
            clone_entry(("src/b.ts", 10, 21), ("src/a.ts", 3, 14), "x"),
            clone_entry(("src/a.ts", 3, 14), ("src/b.ts", 10, 21), "x"),
        ]});
        let out = normalize_with(JscpdConfig::default(), payload);

        assert_eq!(out.findings.len(), 1);
        let f = &out.findings[0];
        assert_eq!(f.file_path, "site/src/a.ts");
        assert_eq!((f.line_number, f.end_line_number), (Some(3), Some(14)));
        let counterpart = f.column("counterpart").unwrap();
        assert_eq!(counterpart["file"], json!("site/src/b.ts"));
        assert_eq!(counterpart["start_line"], json!(10));
        assert_eq!(
            f.column("message"),
            Some(json!("Duplicate block (12 lines, 80 tokens) between src/a.ts:3-14 and src/b.ts:10-21"))
        );
    }

    #[test]
    fn test_identity_ignores_report_order() {
        let forward = json!({"duplicates": [clone_entry(("src/a.ts", 3, 14), ("src/b.ts", 10, 21), "x")]});
        let reversed = json!({"duplicates": [clone_entry(("src/b.ts", 10, 21), ("src/a.ts", 3, 14), "x")]});

        let first = normalize_with(JscpdConfig::default(), forward).findings;
        let second = normalize_with(JscpdConfig::default(), reversed).findings;

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(finding_pk(&first[0]), finding_pk(&second[0]));
    }

    #[test]
    fn test_intra_file_suppression() {
        let payload = json!({"duplicates": [clone_entry(("src/a.ts", 1, 9), ("src/a.ts", 40, 48), "x")]});
        assert_eq!(normalize_with(JscpdConfig::default(), payload.clone()).findings.len(), 1);

        let strict = JscpdConfig {
            allow_intra_file: false,
            ..JscpdConfig::default()
        };
        assert!(normalize_with(strict, payload).findings.is_empty());
    }

    #[test]
    fn test_emit_both_sides() {
        let payload = json!({"duplicates": [clone_entry(("src/a.ts", 1, 9), ("src/b.ts", 5, 13), "x")]});
        let config = JscpdConfig {
            emit_both_sides: true,
            ..JscpdConfig::default()
        };
        let out = normalize_with(config, payload);
        assert_eq!(out.findings.len(), 2);
        assert_eq!(out.findings[0].fields.get("fingerprint"), out.findings[1].fields.get("fingerprint"));
        assert_eq!(out.findings[1].file_path, "site/src/b.ts");
    }

    #[test]
    fn test_fragment_in_key_separates_equal_spans() {
        let payload = json!({"duplicates": [
            clone_entry(("src/a.ts", 1, 9), ("src/b.ts", 5, 13), "let x = 1;"),
            clone_entry(("src/b.ts", 5, 13), ("src/a.ts", 1, 9), "let y = 2;"),
        ]});
        assert_eq!(normalize_with(JscpdConfig::default(), payload.clone()).findings.len(), 1);

        let config = JscpdConfig {
            fragment_in_key: true,
            ..JscpdConfig::default()
        };
        assert_eq!(normalize_with(config, payload).findings.len(), 2);
    }

    #[test]
    fn test_file_statistics_rows() {
        let payload = json!({
            "duplicates": [],
            "statistics": {"formats": {"typescript": {"sources": {
                "src/a.ts": {"lines": 120, "tokens": 900, "clones": 2, "duplicatedLines": 24, "percentage": 20.0}
            }}}}
        });
        let out = normalize_with(JscpdConfig::default(), payload);
        assert_eq!(out.findings.len(), 1);
        let f = &out.findings[0];
        assert_eq!(f.column("row_type"), Some(json!("file")));
        assert_eq!(f.column("duplicated_lines"), Some(json!(24)));
        assert_eq!(f.column("percentage"), Some(json!(20.0)));
    }

    #[test]
    fn test_instances_layout() {
        let clone = json!({"instances": [{"file": "a.py"}, {"file": "b.py"}, {"file": "c.py"}]});
        assert_eq!(pair_instances(&clone).len(), 2);
        assert!(pair_instances(&json!({})).is_empty());
    }
}
