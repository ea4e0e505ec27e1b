use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{float, int, text, Analyzer, PathContext};
use crate::error::SandboxError;
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::paths;
use crate::sandbox::{detect_payload, Sandbox};
use crate::store::schema::{TableSpec, RADON};

/// Ranks from best to worst.
const RANK_ORDER: [&str; 6] = ["A", "B", "C", "D", "E", "F"];

/// Sub-commands merged into one payload, with their extra flags.
const METRICS: [(&str, &[&str]); 4] = [("cc", &["-s"]), ("mi", &["-s"]), ("raw", &[]), ("hal", &[])];

/// Python complexity metrics. One run invokes `radon` once per metric and
/// merges the four JSON documents into `{cc, mi, raw, hal}`.
pub struct RadonAnalyzer;

impl RadonAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn metric_command(metric: &str, flags: &[&str], target: &Path) -> Vec<String> {
        let mut cmd = vec!["radon".to_string(), metric.to_string()];
        cmd.extend(flags.iter().map(|f| f.to_string()));
        cmd.push("-j".into());
        cmd.push(target.to_string_lossy().into_owned());
        cmd
    }
}

#[async_trait]
impl Analyzer for RadonAnalyzer {
    fn name(&self) -> &'static str {
        "radon"
    }

    fn table(&self) -> &'static TableSpec {
        &RADON
    }

    fn provides_complexity(&self) -> bool {
        true
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        Self::metric_command("cc", &["-s"], target)
    }

    fn accepts_exit(&self, code: i32) -> bool {
        code == 0
    }

    async fn execute(&self, target: &Path, sandbox: &Sandbox) -> Result<RunRecord, SandboxError> {
        let cwd = self.working_dir(target);
        let mut merged = Map::new();
        let mut exit_code = 0;
        let mut duration_s = 0.0;
        let mut stderr = Vec::new();
        let mut cmds = Vec::new();

        for (metric, flags) in METRICS {
            let argv = Self::metric_command(metric, flags, target);
            let run = sandbox.run(self.name(), &argv, &cwd).await?;
            exit_code = exit_code.max(run.exit_code);
            duration_s += run.duration_s;
            if !run.stderr.trim().is_empty() {
                stderr.push(format!("[{metric}] {}", run.stderr.trim()));
            }
            merged.insert(metric.to_string(), run.payload.unwrap_or_else(|| json!({})));
            cmds.push(argv.join(" "));
        }

        let payload = Value::Object(merged);
        Ok(RunRecord {
            tool: self.name().to_string(),
            cmd: cmds,
            cwd: cwd.to_string_lossy().into_owned(),
            exit_code,
            duration_s,
            stdout: payload.to_string(),
            stderr: stderr.join("\n"),
            payload: Some(payload),
        })
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let bundle = run
            .payload
            .clone()
            .or_else(|| detect_payload(&run.stdout))
            .unwrap_or(Value::Null);
        let raw_paths: Vec<&str> = ["cc", "mi", "raw", "hal"]
            .iter()
            .filter_map(|k| section(&bundle, k))
            .flat_map(|m| m.keys().map(String::as_str))
            .collect();
        let root = ctx.root(raw_paths.iter().copied());
        let row = |file: &String, metric: &str| {
            Finding::new(RADON.name, ctx.file_path(file), root.as_str()).with("metric_type", metric)
        };

        let mut findings = Vec::new();

        for (file, entry) in section(&bundle, "cc").into_iter().flatten() {
            if let Some(blocks) = entry.as_array() {
                let agg = aggregate_cc(blocks);
                findings.push(
                    row(file, "cc")
                        .with("cc_blocks", agg.blocks as i64)
                        .with("cc_total", agg.total)
                        .with("cc_max", agg.max)
                        .with("cc_avg", agg.avg)
                        .with("cc_worst_rank", agg.worst_rank)
                        .with("cc_rank_counts", json!(agg.rank_counts)),
                );
            }
        }

        for (file, entry) in section(&bundle, "mi").into_iter().flatten() {
            if let Some(mi) = float(entry.get("mi")) {
                let rank = text(entry.get("rank")).or_else(|| text(entry.get("mi_rank")));
                findings.push(row(file, "mi").with("mi", mi).with_opt("mi_rank", rank));
            }
        }

        for (file, entry) in section(&bundle, "raw").into_iter().flatten() {
            if entry.get("loc").is_none() {
                continue;
            }
            let mut finding = row(file, "raw");
            for key in ["loc", "sloc", "lloc", "comments", "multi", "blank", "single_comments"] {
                finding = finding.with_opt(&format!("raw_{key}"), int(entry.get(key)));
            }
            findings.push(finding);
        }

        for (file, entry) in section(&bundle, "hal").into_iter().flatten() {
            if let Some(totals) = halstead_totals(entry) {
                let mut finding = row(file, "hal");
                for key in ["volume", "difficulty", "effort", "time", "bugs"] {
                    let value = float(totals.get(key)).or_else(|| float(totals.get(&format!("halstead_{key}"))));
                    finding = finding.with_opt(&format!("hal_{key}"), value);
                }
                findings.push(finding);
            }
        }

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

/// Per-file cyclomatic complexity summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CcAggregate {
    pub blocks: usize,
    pub total: f64,
    pub max: f64,
    pub avg: f64,
    pub worst_rank: String,
    pub rank_counts: BTreeMap<String, usize>,
}

/// Count, sum, max, mean and rank histogram over radon `cc` blocks.
///
/// The worst rank is the one furthest along `A..F` that occurs at all; how
/// often it occurs does not matter.
pub fn aggregate_cc(blocks: &[Value]) -> CcAggregate {
    let mut total = 0.0;
    let mut max: f64 = 0.0;
    let mut rank_counts: BTreeMap<String, usize> = BTreeMap::new();

    for block in blocks {
        let complexity = float(block.get("complexity")).unwrap_or(0.0);
        let rank = text(block.get("rank")).unwrap_or_else(|| "A".to_string());
        total += complexity;
        max = max.max(complexity);
        *rank_counts.entry(rank).or_insert(0) += 1;
    }

    let worst_rank = RANK_ORDER
        .iter()
        .rev()
        .find(|r| rank_counts.get(**r).copied().unwrap_or(0) > 0)
        .unwrap_or(&"A")
        .to_string();

    CcAggregate {
        blocks: blocks.len(),
        total,
        max,
        avg: total / blocks.len().max(1) as f64,
        worst_rank,
        rank_counts,
    }
}

fn section<'b>(bundle: &'b Value, key: &str) -> Option<&'b Map<String, Value>> {
    bundle.get(key).and_then(Value::as_object)
}

fn halstead_totals(entry: &Value) -> Option<&Map<String, Value>> {
    let obj = entry.as_object()?;
    if obj.keys().any(|k| k.starts_with("halstead_")) {
        return Some(obj);
    }
    obj.get("total").and_then(Value::as_object)
}

/// Maintainability index and rank radon reported for `file` (as the linter
/// saw it), matched on absolute paths.
pub fn maintainability_for(bundle: &Value, file: &str, cwd: Option<&str>) -> Option<(f64, Option<String>)> {
    let wanted = paths::ensure_absolute(file, cwd);
    bundle
        .get("mi")?
        .as_object()?
        .iter()
        .find(|(key, _)| paths::ensure_absolute(key, cwd) == wanted)
        .and_then(|(_, entry)| {
            let mi = float(entry.get("mi"))?;
            let rank = text(entry.get("rank")).or_else(|| text(entry.get("mi_rank")));
            Some((mi, rank))
        })
}
