use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::Strategy;

#[derive(Parser, Debug)]
#[command(
    name = "auditor",
    about = "Run static analyzers over projects and keep their findings in one database",
    version
)]
pub struct Cli {
    /// Config file [default: ./.auditor/config.toml, fallback ~/.config/auditor/config.toml]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides config and AUDITOR_DB)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Write event logs, summaries and raw tool output under the log dir
    #[arg(long, global = true)]
    pub debug: bool,

    /// More log output and full failure messages
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only print summary lines, no progress bar
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the database schema (safe to repeat)
    SeedDb,

    /// Run analyzers over the projects under PATH and store their findings
    Audit(AuditArgs),

    /// Write one findings document per stored root
    Export {
        /// Directory receiving `<root>/auditor-findings.json`
        #[arg(long, value_name = "DIR")]
        output_path: PathBuf,

        /// Only export the root whose folder matches
        #[arg(long)]
        root: Option<String>,
    },

    /// Run one analyzer and print its run record; nothing is stored
    RunTool {
        name: String,
        target: PathBuf,

        /// Also write the run record to this file
        #[arg(long, value_name = "PATH")]
        json_out: Option<PathBuf>,
    },

    /// List the registered analyzers and whether they are installed
    Tools,

    /// Delete scans (and their findings) older than a timestamp
    Prune {
        /// RFC 3339 timestamp, e.g. 2026-01-01T00:00:00Z
        #[arg(long)]
        before: String,
    },
}

#[derive(clap::Args, Debug)]
pub struct AuditArgs {
    /// Directory holding the projects to audit
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Tool to run (repeatable) [default: tools.enabled, else all]
    #[arg(long = "tool", value_name = "NAME")]
    pub tools: Vec<String>,

    /// Concurrent analyzer processes [default: execution.jobs]
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Abort on the first failing tool
    #[arg(long)]
    pub stop_on_error: bool,

    /// How projects are spread out
    #[arg(long, value_enum, default_value = "auto")]
    pub parallel: Strategy,

    /// Audit PATH itself instead of discovering projects in it
    #[arg(long)]
    pub single_project: bool,

    /// Discover projects below the immediate children of PATH
    #[arg(long)]
    pub recursive: bool,
}
