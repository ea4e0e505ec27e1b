//! `auditor`: run static analyzers over projects and keep their findings in
//! one content-addressed SQLite database.
//!
//! # Flow
//! 1. Parse CLI arguments ([`cli`]) and install logging ([`telemetry`]).
//! 2. Load config ([`config::load_config`]), then apply `--db` / `--debug`.
//! 3. Build the analyzer [`analyzer::Registry`] and the process [`sandbox::Sandbox`].
//! 4. `audit`: discover projects ([`detector`]), fan them out ([`scheduler`]),
//!    run every tool per project ([`engine`]), persist findings ([`store`]).
//! 5. Render the run summary ([`report::terminal`]) or export ([`report::json`]).
//! 6. Exit `0` (partial tool failures included), `1` on a stop-on-error abort
//!    or other fatal error, `2` on unknown tool names.

mod analyzer;
mod cli;
mod config;
mod detector;
mod engine;
mod error;
mod models;
mod paths;
mod report;
mod sandbox;
mod scheduler;
mod store;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use analyzer::Registry;
use cli::{AuditArgs, Cli, Command};
use config::{load_config, Config};
use engine::events::{EventKind, LifecycleEvent, Progress};
use engine::ExecutionContext;
use error::AuditError;
use sandbox::Sandbox;
use scheduler::{ChildArgs, ScheduleOptions};
use store::Store;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.debug);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = e.downcast_ref::<AuditError>().map(AuditError::exit_code).unwrap_or(1);
            eprintln!("{} {e:#}", "error:".red().bold());
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let project = match &cli.command {
        Command::Audit(args) => args.path.clone(),
        Command::RunTool { target, .. } => target.clone(),
        _ => PathBuf::from("."),
    };
    let project = project.canonicalize().unwrap_or(project);

    let mut config = load_config(&project, cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    if cli.debug {
        config.logging.debug = true;
    }

    let registry = Registry::builtin(&config.tools);
    let sandbox = build_sandbox(&config);

    match &cli.command {
        Command::SeedDb => {
            open_store(&config)?;
            if !cli.quiet {
                println!("{} schema ready in {}", "✓".green(), config.database.path.display());
            }
            Ok(0)
        }
        Command::Audit(args) => audit(&cli, args, &project, config, registry, sandbox).await,
        Command::Export { output_path, root } => {
            let store = open_store(&config)?;
            let written = report::json::export(&store, output_path, root.as_deref())?;
            for path in &written {
                println!("{} {}", "→".cyan(), path.display());
            }
            if written.is_empty() && !cli.quiet {
                println!("Nothing to export from {}", config.database.path.display());
            }
            Ok(0)
        }
        Command::RunTool { name, json_out, .. } => {
            let analyzer = registry
                .get(name)
                .ok_or_else(|| AuditError::UnknownTools(vec![name.clone()]))?;
            let record = analyzer.execute(&project, &sandbox).await?;
            let json = serde_json::to_string_pretty(&record)?;
            if let Some(out) = json_out {
                std::fs::write(out, &json).with_context(|| format!("writing {}", out.display()))?;
            }
            println!("{json}");
            Ok(0)
        }
        Command::Tools => {
            report::terminal::render_tools(&registry, &sandbox.path_prefix);
            Ok(0)
        }
        Command::Prune { before } => {
            let cutoff = chrono::DateTime::parse_from_rfc3339(before)
                .with_context(|| format!("`{before}` is not an RFC 3339 timestamp"))?
                .with_timezone(&chrono::Utc)
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let store = open_store(&config)?;
            let removed = store.prune_before(&cutoff)?;
            if !cli.quiet {
                println!("Removed {removed} scan(s) older than {cutoff}");
            }
            Ok(0)
        }
    }
}

async fn audit(
    cli: &Cli,
    args: &AuditArgs,
    root: &Path,
    config: Config,
    registry: Registry,
    sandbox: Sandbox,
) -> Result<i32> {
    let tools: Vec<String> = if !args.tools.is_empty() {
        args.tools.clone()
    } else if !config.tools.enabled.is_empty() {
        config.tools.enabled.clone()
    } else {
        registry.names().into_iter().map(String::from).collect()
    };
    registry.resolve(&tools)?;

    let opts = ScheduleOptions {
        jobs: args.jobs.unwrap_or(config.execution.jobs).max(1),
        stop_on_error: args.stop_on_error,
        strategy: args.parallel,
        single_project: args.single_project,
        recursive: args.recursive,
        child: ChildArgs {
            config: cli.config.clone(),
            db: Some(config.database.path.clone()),
            debug: config.logging.debug,
        },
    };

    let store = open_store(&config)?;
    let log_dir = config.logging.debug.then(|| config.logging.dir.clone());
    let ctx = Arc::new(
        ExecutionContext::new(registry, sandbox)
            .with_store(store)
            .with_log_dir(log_dir),
    );

    let units = scheduler::projects_for(root, &opts).len() * tools.len();
    let pb = if cli.quiet { None } else { Some(progress_bar(units as u64)?) };
    let progress = pb.clone().map(|pb| -> Progress {
        Arc::new(move |event: &LifecycleEvent| advance(&pb, event))
    });

    let result = scheduler::audit_projects(ctx, root, &tools, &opts, progress).await;
    match result {
        Ok(outcomes) => {
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            report::terminal::render(&outcomes, root, cli.verbose, cli.quiet);
            Ok(0)
        }
        Err(e) => {
            if let Some(pb) = pb {
                pb.abandon();
            }
            Err(e.into())
        }
    }
}

fn advance(pb: &ProgressBar, event: &LifecycleEvent) {
    if event.event == EventKind::Submitted {
        pb.set_message(event.tool.clone());
    }
    if event.event.settles_unit() {
        pb.inc(1);
    }
    if let Some(units) = event.units {
        pb.inc(units as u64);
    }
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn build_sandbox(config: &Config) -> Sandbox {
    Sandbox::new(Duration::from_secs(config.execution.timeout_secs))
        .with_memory_limit(config.execution.memory_limit_mb)
        .with_path_prefix(config.tools.node.bin_dir.iter().cloned().collect())
}

/// Open the database and make sure the schema exists. An unreachable
/// database is fatal before any tool runs.
fn open_store(config: &Config) -> Result<Store> {
    let path = &config.database.path;
    let store = Store::open(path)
        .with_context(|| format!("opening database {}", path.display()))?
        .with_mode(config.database.insert_mode);
    store.seed().context("creating schema")?;
    Ok(store)
}
