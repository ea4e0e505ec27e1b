//! Runs a set of analyzers against one target and stores what they found.
//!
//! Units run as separate child processes, at most `jobs` at a time, and are
//! handled in completion order. With stop-on-error the first failure stops
//! anything not yet started; units already running are allowed to finish and
//! their results are discarded. A unit is normalized and persisted as soon as
//! it completes, so a parse failure can stop the run too. Tools reading the
//! complexity payload wait until the complexity tool has settled.

pub mod events;

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, PathContext, Registry};
use crate::error::{AuditError, SandboxError};
use crate::models::{AuditSummary, FailureKind, RunRecord, ToolFailure};
use crate::sandbox::Sandbox;
use crate::store::Store;
use crate::telemetry::best_effort;
use events::{EventKind, LifecycleEvent, Progress, RunLog, ALL_TOOLS};

/// Everything a run needs, handed down explicitly.
pub struct ExecutionContext {
    pub registry: Arc<Registry>,
    pub sandbox: Sandbox,
    /// Where findings go; `None` runs the tools without persisting.
    pub store: Option<Arc<Mutex<Store>>>,
    /// Root of the debug artifact tree; `None` disables it.
    pub log_dir: Option<PathBuf>,
    pub run_id: String,
}

impl ExecutionContext {
    pub fn new(registry: Registry, sandbox: Sandbox) -> Self {
        Self {
            registry: Arc::new(registry),
            sandbox,
            store: None,
            log_dir: None,
            run_id: events::new_run_id(),
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(Arc::new(Mutex::new(store)));
        self
    }

    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub jobs: usize,
    pub stop_on_error: bool,
    /// Project path file paths are clipped to; defaults to the target.
    pub anchor: Option<String>,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            stop_on_error: false,
            anchor: None,
        }
    }
}

/// Result of one unit's execution phase.
enum Outcome {
    Ok(RunRecord),
    Failed(ToolFailure),
}

/// Sends events to the run log and the progress observer.
struct Emitter<'a> {
    project: String,
    log: Option<RunLog>,
    progress: Option<&'a Progress>,
}

impl Emitter<'_> {
    fn emit(&self, event: LifecycleEvent) {
        if let Some(log) = &self.log {
            log.event(&event);
        }
        if let Some(progress) = self.progress {
            progress(&event);
        }
    }

    fn tool(&self, tool: &str, kind: EventKind) {
        self.emit(LifecycleEvent::new(&self.project, tool, kind));
    }
}

/// Audit `target` with `tools`.
///
/// Unknown tool names fail before anything runs. Per-tool failures land in
/// the summary; only a stop-on-error abort or a storage failure is an `Err`.
pub async fn audit_target(
    ctx: &ExecutionContext,
    target: &Path,
    tools: &[String],
    opts: &AuditOptions,
    progress: Option<&Progress>,
) -> Result<AuditSummary, AuditError> {
    let analyzers = ctx.registry.resolve(tools)?;
    let started = Instant::now();
    let target_str = target.to_string_lossy().into_owned();
    let anchor = opts.anchor.clone().unwrap_or_else(|| target_str.clone());

    let log = ctx.log_dir.as_ref().and_then(|dir| {
        let mut created = None;
        best_effort("debug run directory", || {
            created = Some(RunLog::create(dir, &ctx.run_id, &anchor)?);
            Ok(())
        });
        created
    });
    let emitter = Emitter {
        project: target_str.clone(),
        log,
        progress,
    };

    let mut summary = AuditSummary {
        target: target_str.clone(),
        tools_requested: analyzers.iter().map(|a| a.name().to_string()).collect(),
        ..Default::default()
    };
    info!(target = %target_str, tools = analyzers.len(), "audit started");

    let mut pending: VecDeque<usize> = (0..analyzers.len()).collect();
    let mut running: JoinSet<(usize, Result<Result<RunRecord, SandboxError>, String>)> = JoinSet::new();
    let workers = opts.jobs.min(analyzers.len()).max(1);
    let mut abort: Option<(String, ToolFailure)> = None;
    let mut complexity_pending = analyzers.iter().any(|a| a.provides_complexity());
    let mut complexity: Option<Value> = None;
    let mut deferred: Vec<(usize, RunRecord)> = Vec::new();

    loop {
        while abort.is_none() && running.len() < workers {
            let Some(index) = pending.pop_front() else { break };
            let analyzer = Arc::clone(&analyzers[index]);
            let sandbox = ctx.sandbox.clone();
            let target = target.to_path_buf();
            emitter.tool(analyzer.name(), EventKind::Submitted);
            debug!(tool = analyzer.name(), "submitted");
            running.spawn(async move {
                // Inner task so a panicking analyzer still reports its index.
                let handle = tokio::spawn(async move { analyzer.execute(&target, &sandbox).await });
                (index, handle.await.map_err(|e| e.to_string()))
            });
        }

        let Some(joined) = running.join_next().await else { break };
        let (index, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!("unit supervisor lost: {e}");
                continue;
            }
        };
        if abort.is_some() {
            // Already stopping: let in-flight units finish, keep nothing.
            debug!(tool = analyzers[index].name(), "discarding result after stop-on-error");
            continue;
        }

        let analyzer = &analyzers[index];
        let tool = analyzer.name().to_string();
        let outcome = match result {
            Ok(Ok(run)) => {
                if let Some(log) = &emitter.log {
                    log.artifact(&run);
                }
                summary.durations_sec.insert(tool.clone(), run.duration_s);
                if analyzer.accepts_exit(run.exit_code) && !run.timed_out() {
                    emitter.emit(LifecycleEvent::from_run(&target_str, EventKind::Finished, &run));
                    Outcome::Ok(run)
                } else {
                    let failure = ToolFailure {
                        kind: FailureKind::Failed,
                        exit: run.exit_code,
                        message: run.failure_message(),
                    };
                    emitter.emit(
                        LifecycleEvent::from_run(&target_str, EventKind::Failed, &run).message(failure.message.clone()),
                    );
                    Outcome::Failed(failure)
                }
            }
            Ok(Err(e)) => crashed(&emitter, &tool, e.to_string()),
            Err(panic) => crashed(&emitter, &tool, format!("analyzer panicked: {panic}")),
        };

        if analyzer.provides_complexity() {
            complexity_pending = false;
            if let Outcome::Ok(run) = &outcome {
                complexity = run.payload.clone();
            }
        }

        let failure = match outcome {
            Outcome::Failed(failure) => {
                summary.tools_failed.insert(tool.clone(), failure.clone());
                Some(failure)
            }
            Outcome::Ok(run) if analyzer.uses_complexity() && complexity_pending => {
                debug!(tool = %tool, "waiting for complexity metrics");
                deferred.push((index, run));
                None
            }
            Outcome::Ok(run) => process(ctx, &emitter, &mut summary, analyzer.as_ref(), &run, &anchor, complexity.as_ref())?,
        };

        if let Some(failure) = failure {
            warn!(tool = %tool, kind = %failure.kind, exit = failure.exit, "tool failed");
            if opts.stop_on_error {
                abort = Some((tool, failure));
                for skipped in pending.drain(..) {
                    emitter.tool(analyzers[skipped].name(), EventKind::Cancelled);
                }
            }
        }
    }

    if abort.is_none() {
        for (index, run) in deferred {
            let analyzer = &analyzers[index];
            let failure = process(ctx, &emitter, &mut summary, analyzer.as_ref(), &run, &anchor, complexity.as_ref())?;
            if let Some(failure) = failure {
                warn!(tool = analyzer.name(), kind = %failure.kind, "tool failed");
                if opts.stop_on_error {
                    abort = Some((analyzer.name().to_string(), failure));
                    break;
                }
            }
        }
    }

    summary.tools_ok.sort_by_key(|tool| summary.tools_requested.iter().position(|t| t == tool));
    summary.elapsed_total_sec = started.elapsed().as_secs_f64();

    if let Some((tool, failure)) = abort {
        emitter.emit(LifecycleEvent::new(&target_str, ALL_TOOLS, EventKind::CompletedWithErrors).message(format!(
            "stopped after {tool} {}",
            failure.kind
        )));
        if let Some(log) = &emitter.log {
            log.summary(&summary);
        }
        return Err(AuditError::StopOnError {
            tool,
            kind: failure.kind,
            message: failure.message,
        });
    }

    let kind = if summary.has_failures() {
        EventKind::CompletedWithErrors
    } else {
        EventKind::Completed
    };
    emitter.tool(ALL_TOOLS, kind);
    if let Some(log) = &emitter.log {
        log.summary(&summary);
    }
    info!(
        target = %target_str,
        ok = summary.tools_ok.len(),
        failed = summary.tools_failed.len(),
        elapsed = summary.elapsed_total_sec,
        "audit finished"
    );
    Ok(summary)
}

/// Normalize and persist one successful run. A normalize error or panic is
/// recorded as `parsing_failed` and returned; storage errors propagate.
fn process(
    ctx: &ExecutionContext,
    emitter: &Emitter<'_>,
    summary: &mut AuditSummary,
    analyzer: &dyn Analyzer,
    run: &RunRecord,
    anchor: &str,
    complexity: Option<&Value>,
) -> Result<Option<ToolFailure>, AuditError> {
    let tool = analyzer.name().to_string();
    emitter.tool(&tool, EventKind::ProcessingStarted);

    let paths = PathContext::for_run(run, Some(anchor)).with_complexity(complexity);
    let normalized = match panic::catch_unwind(AssertUnwindSafe(|| analyzer.normalize(run, &paths))) {
        Ok(Ok(normalized)) => normalized,
        Ok(Err(e)) => return Ok(Some(parsing_failed(emitter, summary, &tool, run, format!("{e:#}")))),
        Err(_) => return Ok(Some(parsing_failed(emitter, summary, &tool, run, "normalize panicked".to_string()))),
    };

    let rows = normalized.findings.len();
    let mut scan = normalized.scan;
    scan.target = Some(emitter.project.clone());
    let inserted = match &ctx.store {
        Some(store) => {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            store.persist(&scan, normalized.findings)?.1
        }
        None => 0,
    };

    summary.tools_ok.push(tool.clone());
    summary.rows.insert(tool.clone(), rows);
    summary.inserted.insert(tool.clone(), inserted);
    let mut event = LifecycleEvent::new(&emitter.project, &tool, EventKind::ProcessingFinished);
    event.rows = Some(rows);
    event.inserted = Some(inserted);
    emitter.emit(event);
    info!(tool = %tool, rows, inserted, "tool processed");
    Ok(None)
}

fn crashed(emitter: &Emitter<'_>, tool: &str, message: String) -> Outcome {
    emitter.emit(LifecycleEvent::new(&emitter.project, tool, EventKind::Crashed).message(message.clone()));
    Outcome::Failed(ToolFailure {
        kind: FailureKind::Crashed,
        exit: -1,
        message,
    })
}

fn parsing_failed(
    emitter: &Emitter<'_>,
    summary: &mut AuditSummary,
    tool: &str,
    run: &RunRecord,
    message: String,
) -> ToolFailure {
    warn!(tool, "could not parse output: {message}");
    emitter.emit(LifecycleEvent::from_run(&emitter.project, EventKind::ParsingFailed, run).message(message.clone()));
    let failure = ToolFailure {
        kind: FailureKind::ParsingFailed,
        exit: run.exit_code,
        message,
    };
    summary.tools_failed.insert(tool.to_string(), failure.clone());
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Finding, Normalized, ScanMetadata};
    use crate::store::schema::{TableSpec, BANDIT};
    use std::time::Duration;

    /// Stand-in analyzer running a shell snippet; every non-empty stdout
    /// line becomes one bandit-table finding.
    struct Script {
        name: &'static str,
        script: String,
    }

    impl Script {
        fn new(name: &'static str, script: &str) -> Arc<dyn Analyzer> {
            Arc::new(Self {
                name,
                script: script.to_string(),
            })
        }
    }

    impl Analyzer for Script {
        fn name(&self) -> &'static str {
            self.name
        }

        fn table(&self) -> &'static TableSpec {
            &BANDIT
        }

        fn build_command(&self, _target: &Path) -> Vec<String> {
            vec!["sh".into(), "-c".into(), self.script.clone()]
        }

        fn accepts_exit(&self, code: i32) -> bool {
            code == 0
        }

        fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> anyhow::Result<Normalized> {
            if run.stdout.contains("GARBAGE") {
                anyhow::bail!("unexpected output");
            }
            let root = ctx.root(std::iter::empty());
            let findings = run
                .stdout
                .lines()
                .filter(|l| !l.trim().is_empty())
                .enumerate()
                .map(|(i, line)| {
                    Finding::new(BANDIT.name, ctx.file_path("src/app.py"), root.as_str())
                        .lines(Some(i as i64 + 1), None)
                        .with("message", line.trim())
                })
                .collect();
            Ok(Normalized {
                scan: ScanMetadata::for_tool(self.name),
                findings,
            })
        }
    }

    fn context(analyzers: Vec<Arc<dyn Analyzer>>) -> ExecutionContext {
        let mut registry = Registry::new();
        for analyzer in analyzers {
            registry.register(analyzer);
        }
        ExecutionContext::new(registry, Sandbox::new(Duration::from_secs(20)))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn recorder() -> (Progress, Arc<Mutex<Vec<LifecycleEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress: Progress = Arc::new(move |e: &LifecycleEvent| sink.lock().unwrap().push(e.clone()));
        (progress, seen)
    }

    #[tokio::test]
    async fn test_stop_on_error_skips_pending_units() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("c-ran");
        let ctx = context(vec![
            Script::new("alpha", "echo one"),
            Script::new("beta", "echo broken >&2; exit 3"),
            Script::new("gamma", &format!("touch '{}'", marker.display())),
        ]);
        let opts = AuditOptions {
            jobs: 1,
            stop_on_error: true,
            anchor: None,
        };
        let (progress, seen) = recorder();

        let err = audit_target(&ctx, dir.path(), &names(&["alpha", "beta", "gamma"]), &opts, Some(&progress))
            .await
            .unwrap_err();

        match err {
            AuditError::StopOnError { tool, kind, message } => {
                assert_eq!(tool, "beta");
                assert_eq!(kind, FailureKind::Failed);
                assert_eq!(message, "broken");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!marker.exists());
        let events = seen.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.tool == "gamma" && e.event == EventKind::Cancelled));
        assert!(!events
            .iter()
            .any(|e| e.tool == "gamma" && e.event == EventKind::Submitted));
    }

    #[tokio::test]
    async fn test_partial_failure_is_summarized() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![
            Script::new("alpha", "echo one; echo two"),
            Script::new("beta", "echo 'no config found' >&2; exit 2"),
        ])
        .with_store(seeded());

        let summary = audit_target(&ctx, dir.path(), &names(&["alpha", "beta"]), &AuditOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(summary.tools_ok, vec!["alpha"]);
        assert_eq!(summary.tools_failed.len(), 1);
        let failure = &summary.tools_failed["beta"];
        assert_eq!(failure.kind, FailureKind::Failed);
        assert_eq!(failure.exit, 2);
        assert_eq!(failure.message, "no config found");
        assert_eq!(summary.rows["alpha"], 2);
        assert_eq!(summary.inserted["alpha"], 2);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![Script::new("alpha", "echo first; echo second")]).with_store(seeded());
        let tools = names(&["alpha"]);

        let first = audit_target(&ctx, dir.path(), &tools, &AuditOptions::default(), None).await.unwrap();
        let second = audit_target(&ctx, dir.path(), &tools, &AuditOptions::default(), None).await.unwrap();

        assert_eq!(first.inserted["alpha"], 2);
        assert_eq!(second.inserted["alpha"], 0);
        let store = ctx.store.as_ref().unwrap().lock().unwrap();
        assert_eq!(store.count_scans().unwrap(), 2);
        assert_eq!(store.count_rows(BANDIT.name).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_parse_error_is_recorded_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![
            Script::new("alpha", "echo GARBAGE"),
            Script::new("beta", "echo fine"),
        ]);
        let (progress, seen) = recorder();

        let summary = audit_target(&ctx, dir.path(), &names(&["alpha", "beta"]), &AuditOptions::default(), Some(&progress))
            .await
            .unwrap();

        assert_eq!(summary.tools_ok, vec!["beta"]);
        assert_eq!(summary.tools_failed["alpha"].kind, FailureKind::ParsingFailed);
        let events = seen.lock().unwrap();
        assert!(events.iter().any(|e| e.event == EventKind::ParsingFailed));
        assert_eq!(events.last().map(|e| e.event), Some(EventKind::CompletedWithErrors));
    }

    #[tokio::test]
    async fn test_parse_error_stops_run_under_stop_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("beta-ran");
        let ctx = context(vec![
            Script::new("alpha", "echo GARBAGE"),
            Script::new("beta", &format!("touch '{}'; echo fine", marker.display())),
        ])
        .with_store(seeded());
        let (progress, seen) = recorder();
        let opts = AuditOptions {
            jobs: 1,
            stop_on_error: true,
            anchor: None,
        };

        let err = audit_target(&ctx, dir.path(), &names(&["alpha", "beta"]), &opts, Some(&progress))
            .await
            .unwrap_err();

        match err {
            AuditError::StopOnError { tool, kind, .. } => {
                assert_eq!(tool, "alpha");
                assert_eq!(kind, FailureKind::ParsingFailed);
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!marker.exists());
        let events = seen.lock().unwrap();
        assert!(events.iter().any(|e| e.tool == "beta" && e.event == EventKind::Cancelled));
        assert_eq!(events.last().map(|e| e.event), Some(EventKind::CompletedWithErrors));
        let store = ctx.store.as_ref().unwrap().lock().unwrap();
        assert_eq!(store.count_rows(BANDIT.name).unwrap(), 0);
    }

    /// Emits a metrics payload after a delay.
    struct Metrics;

    impl Analyzer for Metrics {
        fn name(&self) -> &'static str {
            "metrics"
        }

        fn table(&self) -> &'static TableSpec {
            &BANDIT
        }

        fn build_command(&self, _target: &Path) -> Vec<String> {
            vec!["sh".into(), "-c".into(), r#"sleep 0.3; echo '{"cc": {}}'"#.into()]
        }

        fn provides_complexity(&self) -> bool {
            true
        }

        fn normalize(&self, _run: &RunRecord, _ctx: &PathContext<'_>) -> anyhow::Result<Normalized> {
            Ok(Normalized::empty(self.name()))
        }
    }

    /// Finishes at once but needs the metrics payload to normalize.
    struct Consumer;

    impl Analyzer for Consumer {
        fn name(&self) -> &'static str {
            "consumer"
        }

        fn table(&self) -> &'static TableSpec {
            &BANDIT
        }

        fn build_command(&self, _target: &Path) -> Vec<String> {
            vec!["true".into()]
        }

        fn uses_complexity(&self) -> bool {
            true
        }

        fn normalize(&self, _run: &RunRecord, ctx: &PathContext<'_>) -> anyhow::Result<Normalized> {
            anyhow::ensure!(ctx.complexity.is_some_and(|c| c.get("cc").is_some()), "no metrics");
            Ok(Normalized::empty(self.name()))
        }
    }

    #[tokio::test]
    async fn test_complexity_consumer_waits_for_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(vec![Arc::new(Consumer) as Arc<dyn Analyzer>, Arc::new(Metrics)]);
        let opts = AuditOptions {
            jobs: 2,
            ..AuditOptions::default()
        };

        let summary = audit_target(&ctx, dir.path(), &names(&["consumer", "metrics"]), &opts, None)
            .await
            .unwrap();

        assert!(!summary.has_failures(), "{:?}", summary.tools_failed);
        assert_eq!(summary.tools_ok, vec!["consumer", "metrics"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let ctx = context(vec![Script::new("alpha", &format!("touch '{}'", marker.display()))]);

        let err = audit_target(&ctx, dir.path(), &names(&["alpha", "nope"]), &AuditOptions::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        registry.register(Arc::new(Missing));
        let ctx = ExecutionContext::new(registry, Sandbox::new(Duration::from_secs(5)))
            .with_log_dir(Some(dir.path().join("logs")));

        let summary = audit_target(&ctx, dir.path(), &names(&["missing"]), &AuditOptions::default(), None)
            .await
            .unwrap();
        assert_eq!(summary.tools_failed["missing"].kind, FailureKind::Crashed);
        assert_eq!(summary.tools_failed["missing"].exit, -1);

        let run_dir = dir.path().join("logs").join(&ctx.run_id);
        let project_dir = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap().path();
        assert!(project_dir.join("events.jsonl").is_file());
        assert!(project_dir.join("summary.json").is_file());
    }

    struct Missing;

    impl Analyzer for Missing {
        fn name(&self) -> &'static str {
            "missing"
        }

        fn table(&self) -> &'static TableSpec {
            &BANDIT
        }

        fn build_command(&self, _target: &Path) -> Vec<String> {
            vec!["definitely-not-installed-auditor-tool".into()]
        }

        fn normalize(&self, _run: &RunRecord, _ctx: &PathContext<'_>) -> anyhow::Result<Normalized> {
            Ok(Normalized::empty(self.name()))
        }
    }

    fn seeded() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.seed().unwrap();
        store
    }
}
