//! Lifecycle events and the on-disk debug run log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use serde_json::json;

use crate::models::{AuditSummary, RunRecord};
use crate::telemetry::best_effort;

/// Tool name used for events about the whole target.
pub const ALL_TOOLS: &str = "__all__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submitted,
    Finished,
    Failed,
    Crashed,
    Cancelled,
    ParsingFailed,
    ProcessingStarted,
    ProcessingFinished,
    Completed,
    CompletedWithErrors,
}

impl EventKind {
    /// Whether this event settles one tool's execution.
    pub fn settles_unit(self) -> bool {
        matches!(
            self,
            EventKind::Finished | EventKind::Failed | EventKind::Crashed | EventKind::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub ts: String,
    pub project: String,
    pub tool: String,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted: Option<usize>,
    /// Tool executions this event stands for when they were not reported
    /// one by one (a project audited in a child process).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<usize>,
}

impl LifecycleEvent {
    pub fn new(project: &str, tool: &str, event: EventKind) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            project: project.to_string(),
            tool: tool.to_string(),
            event,
            exit: None,
            duration_s: None,
            message: None,
            rows: None,
            inserted: None,
            units: None,
        }
    }

    pub fn from_run(project: &str, event: EventKind, run: &RunRecord) -> Self {
        Self {
            exit: Some(run.exit_code),
            duration_s: Some(run.duration_s),
            ..Self::new(project, &run.tool, event)
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Observer of lifecycle events, e.g. a progress bar.
pub type Progress = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// A fresh run id: UTC time plus process id, sortable by start time.
pub fn new_run_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// File-system friendly name for a project path.
pub fn project_slug(project: &str) -> String {
    let name = crate::paths::anchor_name(project);
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let slug = slug.trim_matches(['-', '.']).to_string();
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug
    }
}

/// Debug artifacts for one project of one run:
/// `<log dir>/<run id>/<project slug>/{events.jsonl, summary.json, artifacts/}`.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
}

impl RunLog {
    pub fn create(log_root: &Path, run_id: &str, project: &str) -> anyhow::Result<Self> {
        let dir = log_root.join(run_id).join(project_slug(project));
        fs::create_dir_all(dir.join("artifacts"))
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn event(&self, event: &LifecycleEvent) {
        best_effort("event log", || {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join("events.jsonl"))?;
            writeln!(file, "{}", serde_json::to_string(event)?)?;
            Ok(())
        });
    }

    /// Raw run record plus its output streams.
    pub fn artifact(&self, run: &RunRecord) {
        best_effort("tool artifact", || {
            let base = self.artifacts_dir();
            fs::write(base.join(format!("{}.json", run.tool)), serde_json::to_vec_pretty(run)?)?;
            fs::write(base.join(format!("{}.stdout.log", run.tool)), &run.stdout)?;
            fs::write(base.join(format!("{}.stderr.log", run.tool)), &run.stderr)?;
            Ok(())
        });
    }

    pub fn summary(&self, summary: &AuditSummary) {
        best_effort("run summary", || {
            let failed: serde_json::Map<String, serde_json::Value> = summary
                .tools_failed
                .iter()
                .map(|(tool, f)| (tool.clone(), json!({"kind": f.kind, "exit": f.exit, "message": f.message})))
                .collect();
            let doc = json!({
                "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                "project": summary.target,
                "tools_requested": summary.tools_requested,
                "tools_ok": summary.tools_ok,
                "tools_failed": failed,
                "durations_sec": summary.durations_sec,
                "inserted": summary.inserted,
                "elapsed_total_sec": summary.elapsed_total_sec,
                "artifacts_dir": self.artifacts_dir(),
            });
            fs::write(self.dir.join("summary.json"), serde_json::to_vec_pretty(&doc)?)?;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, ToolFailure};

    #[test]
    fn test_project_slug() {
        assert_eq!(project_slug("/home/me/my proj/"), "my-proj");
        assert_eq!(project_slug("/"), "root");
    }

    #[test]
    fn test_run_log_layout() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::create(dir.path(), "run-1", "/work/api").unwrap();
        assert_eq!(log.dir(), dir.path().join("run-1/api"));

        log.event(&LifecycleEvent::new("/work/api", "bandit", EventKind::Submitted));
        log.event(&LifecycleEvent::new("/work/api", "bandit", EventKind::Finished).message("ok"));
        let events = fs::read_to_string(log.dir().join("events.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = events.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "submitted");
        assert_eq!(lines[1]["message"], "ok");
        assert!(lines[0].get("exit").is_none());

        let mut summary = AuditSummary {
            target: "/work/api".into(),
            tools_requested: vec!["bandit".into(), "mypy".into()],
            tools_ok: vec!["bandit".into()],
            ..Default::default()
        };
        summary.tools_failed.insert(
            "mypy".into(),
            ToolFailure {
                kind: FailureKind::Failed,
                exit: 2,
                message: "boom".into(),
            },
        );
        log.summary(&summary);
        let doc: serde_json::Value =
            serde_json::from_slice(&fs::read(log.dir().join("summary.json")).unwrap()).unwrap();
        assert_eq!(doc["tools_failed"]["mypy"]["exit"], 2);
        assert_eq!(doc["tools_ok"], serde_json::json!(["bandit"]));
    }
}
