//! Fans an audit out over the projects found under a root directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::detector::discover_projects;
use crate::engine::events::{EventKind, LifecycleEvent, Progress, ALL_TOOLS};
use crate::engine::{audit_target, AuditOptions, ExecutionContext};
use crate::error::AuditError;
use crate::models::AuditSummary;

/// How projects are spread out. Tools inside one project always run as
/// separate child processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Strategy {
    /// Same as `thread`.
    #[default]
    Auto,
    /// Projects run concurrently inside this process.
    Thread,
    /// Every project runs in a child `auditor` process.
    Process,
    /// One project after the other.
    None,
}

/// Settings forwarded to child processes under [`Strategy::Process`].
#[derive(Debug, Clone, Default)]
pub struct ChildArgs {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub debug: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub jobs: usize,
    pub stop_on_error: bool,
    pub strategy: Strategy,
    /// Audit the root as one project instead of discovering projects.
    pub single_project: bool,
    pub recursive: bool,
    pub child: ChildArgs,
}

/// What happened to one project.
#[derive(Debug, Clone)]
pub struct ProjectOutcome {
    pub project: PathBuf,
    /// Present when the project ran in this process.
    pub summary: Option<AuditSummary>,
    /// Child exit code under the process strategy, else 0.
    pub exit_code: i32,
}

/// Outer concurrency (projects at once) and inner jobs (tools per project).
pub fn plan(strategy: Strategy, jobs: usize, projects: usize) -> (usize, usize) {
    let jobs = jobs.max(1);
    let outer = if strategy == Strategy::None || projects <= 1 {
        1
    } else {
        jobs.min(projects)
    };
    let inner = if outer > 1 { 1 } else { jobs };
    (outer, inner)
}

pub fn projects_for(root: &Path, opts: &ScheduleOptions) -> Vec<PathBuf> {
    if opts.single_project {
        vec![root.to_path_buf()]
    } else {
        discover_projects(root, opts.recursive)
    }
}

/// Audit every project under `root`.
///
/// Unknown tools are rejected before any project starts. With stop-on-error
/// no project is started after one failed and the failure is returned once
/// the projects already running have finished.
pub async fn audit_projects(
    ctx: Arc<ExecutionContext>,
    root: &Path,
    tools: &[String],
    opts: &ScheduleOptions,
    progress: Option<Progress>,
) -> Result<Vec<ProjectOutcome>, AuditError> {
    ctx.registry.resolve(tools)?;
    let projects = projects_for(root, opts);
    let (outer, inner) = plan(opts.strategy, opts.jobs, projects.len());
    info!(
        projects = projects.len(),
        outer,
        inner,
        strategy = ?opts.strategy,
        "scheduling audit"
    );

    let mut pending: VecDeque<(usize, PathBuf)> = projects.into_iter().enumerate().collect();
    let mut running: JoinSet<(usize, PathBuf, Result<ProjectOutcome, AuditError>)> = JoinSet::new();
    let mut done: Vec<(usize, ProjectOutcome)> = Vec::new();
    let mut first_error: Option<AuditError> = None;

    loop {
        while first_error.is_none() && running.len() < outer {
            let Some((index, project)) = pending.pop_front() else { break };
            let ctx = Arc::clone(&ctx);
            let tools = tools.to_vec();
            let opts = opts.clone();
            let progress = progress.clone();
            debug!(project = %project.display(), "starting project");
            running.spawn(async move {
                let result = match opts.strategy {
                    Strategy::Process => run_child(&project, &tools, &opts, inner, progress.as_ref()).await,
                    _ => run_in_process(&ctx, &project, &tools, &opts, inner, progress.as_ref()).await,
                };
                (index, project, result)
            });
        }

        let Some(joined) = running.join_next().await else { break };
        let (index, project, result) = match joined {
            Ok(triple) => triple,
            Err(e) => {
                warn!("project task lost: {e}");
                continue;
            }
        };
        match result {
            Ok(outcome) => done.push((index, outcome)),
            Err(e) if opts.stop_on_error => {
                warn!(project = %project.display(), "stopping: {e}");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                pending.clear();
            }
            Err(e) => {
                if matches!(e, AuditError::Store(_)) {
                    return Err(e);
                }
                warn!(project = %project.display(), "project failed: {e}");
                done.push((
                    index,
                    ProjectOutcome {
                        project,
                        summary: None,
                        exit_code: e.exit_code(),
                    },
                ));
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    done.sort_by_key(|(index, _)| *index);
    Ok(done.into_iter().map(|(_, outcome)| outcome).collect())
}

async fn run_in_process(
    ctx: &ExecutionContext,
    project: &Path,
    tools: &[String],
    opts: &ScheduleOptions,
    jobs: usize,
    progress: Option<&Progress>,
) -> Result<ProjectOutcome, AuditError> {
    let audit = AuditOptions {
        jobs,
        stop_on_error: opts.stop_on_error,
        anchor: Some(project.to_string_lossy().into_owned()),
    };
    let summary = audit_target(ctx, project, tools, &audit, progress).await?;
    Ok(ProjectOutcome {
        project: project.to_path_buf(),
        summary: Some(summary),
        exit_code: 0,
    })
}

/// Audit one project in a child copy of this executable.
async fn run_child(
    project: &Path,
    tools: &[String],
    opts: &ScheduleOptions,
    jobs: usize,
    progress: Option<&Progress>,
) -> Result<ProjectOutcome, AuditError> {
    let exe = std::env::current_exe()?;
    let argv = child_argv(project, tools, opts, jobs);
    debug!(exe = %exe.display(), args = %argv.join(" "), "spawning project child");

    let status = Command::new(&exe)
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .status()
        .await?;
    let code = status.code().unwrap_or(-1);
    let project_str = project.to_string_lossy().into_owned();

    if let Some(progress) = progress {
        let kind = if code == 0 {
            EventKind::Completed
        } else {
            EventKind::CompletedWithErrors
        };
        let mut event = LifecycleEvent::new(&project_str, ALL_TOOLS, kind);
        event.exit = Some(code);
        event.units = Some(tools.len());
        progress(&event);
    }

    if code != 0 && opts.stop_on_error {
        return Err(AuditError::Project {
            project: project_str,
            code,
        });
    }
    Ok(ProjectOutcome {
        project: project.to_path_buf(),
        summary: None,
        exit_code: code,
    })
}

/// Command line of the child auditing one project.
pub fn child_argv(project: &Path, tools: &[String], opts: &ScheduleOptions, jobs: usize) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(config) = &opts.child.config {
        argv.push("--config".to_string());
        argv.push(config.to_string_lossy().into_owned());
    }
    if let Some(db) = &opts.child.db {
        argv.push("--db".to_string());
        argv.push(db.to_string_lossy().into_owned());
    }
    if opts.child.debug {
        argv.push("--debug".to_string());
    }
    argv.extend([
        "--quiet".to_string(),
        "audit".to_string(),
        project.to_string_lossy().into_owned(),
        "--single-project".to_string(),
        "--parallel".to_string(),
        "none".to_string(),
        "--jobs".to_string(),
        jobs.to_string(),
    ]);
    for tool in tools {
        argv.push("--tool".to_string());
        argv.push(tool.clone());
    }
    if opts.stop_on_error {
        argv.push("--stop-on-error".to_string());
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, PathContext, Registry};
    use crate::models::{Normalized, RunRecord};
    use crate::sandbox::Sandbox;
    use crate::store::schema::{TableSpec, MYPY};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_plan() {
        assert_eq!(plan(Strategy::Auto, 4, 1), (1, 4));
        assert_eq!(plan(Strategy::Thread, 4, 3), (3, 1));
        assert_eq!(plan(Strategy::Thread, 2, 6), (2, 1));
        assert_eq!(plan(Strategy::None, 4, 6), (1, 4));
        assert_eq!(plan(Strategy::Process, 0, 6), (1, 1));
    }

    #[test]
    fn test_child_argv() {
        let opts = ScheduleOptions {
            stop_on_error: true,
            child: ChildArgs {
                db: Some(PathBuf::from("/tmp/a.db")),
                ..Default::default()
            },
            ..Default::default()
        };
        let argv = child_argv(Path::new("/w/api"), &["bandit".into(), "mypy".into()], &opts, 2);
        assert_eq!(
            argv,
            vec![
                "--db", "/tmp/a.db", "--quiet", "audit", "/w/api", "--single-project", "--parallel", "none", "--jobs",
                "2", "--tool", "bandit", "--tool", "mypy", "--stop-on-error"
            ]
        );
    }

    /// Fails in any directory containing a `FAIL` file.
    struct Probe;

    impl Analyzer for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn table(&self) -> &'static TableSpec {
            &MYPY
        }

        fn build_command(&self, _target: &Path) -> Vec<String> {
            vec!["sh".into(), "-c".into(), "test ! -e FAIL".into()]
        }

        fn accepts_exit(&self, code: i32) -> bool {
            code == 0
        }

        fn normalize(&self, _run: &RunRecord, _ctx: &PathContext<'_>) -> anyhow::Result<Normalized> {
            Ok(Normalized::empty(self.name()))
        }
    }

    fn workspace(failing: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["api", "web", "worker"] {
            let project = dir.path().join(name);
            std::fs::create_dir_all(&project).unwrap();
            std::fs::write(project.join("pyproject.toml"), "").unwrap();
            if failing.contains(&name) {
                std::fs::write(project.join("FAIL"), "").unwrap();
            }
        }
        dir
    }

    fn context() -> Arc<ExecutionContext> {
        let mut registry = Registry::new();
        registry.register(Arc::new(Probe));
        Arc::new(ExecutionContext::new(registry, Sandbox::new(Duration::from_secs(20))))
    }

    #[tokio::test]
    async fn test_thread_strategy_audits_every_project() {
        let dir = workspace(&["web"]);
        let opts = ScheduleOptions {
            jobs: 2,
            strategy: Strategy::Thread,
            ..Default::default()
        };
        let credited = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&credited);
        let progress: Progress = Arc::new(move |e: &LifecycleEvent| {
            if e.event.settles_unit() {
                *counter.lock().unwrap() += 1;
            }
        });

        let outcomes = audit_projects(context(), dir.path(), &["probe".into()], &opts, Some(progress))
            .await
            .unwrap();

        let names: Vec<_> = outcomes.iter().map(|o| o.project.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["api", "web", "worker"]);
        let failed: Vec<bool> = outcomes
            .iter()
            .map(|o| o.summary.as_ref().unwrap().has_failures())
            .collect();
        assert_eq!(failed, vec![false, true, false]);
        assert_eq!(*credited.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sequential_stop_on_error() {
        let dir = workspace(&["api"]);
        let opts = ScheduleOptions {
            jobs: 4,
            stop_on_error: true,
            strategy: Strategy::None,
            ..Default::default()
        };
        let started = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&started);
        let progress: Progress = Arc::new(move |e: &LifecycleEvent| {
            if e.event == EventKind::Submitted {
                sink.lock().unwrap().push(e.project.clone());
            }
        });

        let err = audit_projects(context(), dir.path(), &["probe".into()], &opts, Some(progress))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::StopOnError { .. }));
        assert_eq!(started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected_up_front() {
        let dir = workspace(&[]);
        let err = audit_projects(context(), dir.path(), &["nope".into()], &ScheduleOptions::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
