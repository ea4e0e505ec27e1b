use std::path::{Path, PathBuf};

use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::analyzer::Registry;
use crate::models::{AuditSummary, FailureKind};
use crate::scheduler::ProjectOutcome;

/// Print the result of an audit run.
pub fn render(outcomes: &[ProjectOutcome], root: &Path, verbose: bool, quiet: bool) {
    let audited = outcomes.iter().filter_map(|o| o.summary.as_ref());
    let ok: usize = audited.clone().map(|s| s.tools_ok.len()).sum();
    let failed: usize = audited.clone().map(|s| s.tools_failed.len()).sum();
    let inserted: usize = audited.flat_map(|s| s.inserted.values()).sum();
    let children_failed = outcomes
        .iter()
        .filter(|o| o.summary.is_none() && o.exit_code != 0)
        .count();

    if quiet {
        println!(
            "Projects: {}  OK: {}  Failed: {}  Inserted: {}",
            outcomes.len(),
            ok.to_string().green(),
            (failed + children_failed).to_string().red(),
            inserted,
        );
        return;
    }

    println!("\n {} v{}", "auditor".bold(), env!("CARGO_PKG_VERSION"));
    println!(" Audited: {}\n", root.display());

    for outcome in outcomes {
        match &outcome.summary {
            Some(summary) => render_summary(summary, verbose),
            None => {
                let status = if outcome.exit_code == 0 {
                    "✓ ok".green()
                } else {
                    format!("✗ exit {}", outcome.exit_code).red()
                };
                println!(" {} {}", outcome.project.display().to_string().bold(), status);
            }
        }
    }

    println!(
        " {} tool runs ok, {} failed, {} new findings\n",
        ok.to_string().green(),
        (failed + children_failed).to_string().red(),
        inserted
    );
}

fn render_summary(summary: &AuditSummary, verbose: bool) {
    println!(
        " {} ({:.1}s)",
        summary.target.bold(),
        summary.elapsed_total_sec
    );

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Tool").add_attribute(Attribute::Bold),
            Cell::new("Status").add_attribute(Attribute::Bold),
            Cell::new("Rows").add_attribute(Attribute::Bold),
            Cell::new("Inserted").add_attribute(Attribute::Bold),
            Cell::new("Duration").add_attribute(Attribute::Bold),
        ]);

    for tool in &summary.tools_requested {
        let (status, color) = match summary.tools_failed.get(tool) {
            None if summary.tools_ok.contains(tool) => ("✓ ok".to_string(), Color::Green),
            None => ("- skipped".to_string(), Color::DarkGrey),
            Some(f) => match f.kind {
                FailureKind::Failed => (format!("✗ failed ({})", f.exit), Color::Red),
                FailureKind::Crashed => ("✗ crashed".to_string(), Color::Magenta),
                FailureKind::ParsingFailed => ("⚠ parsing failed".to_string(), Color::Yellow),
            },
        };
        table.add_row(vec![
            Cell::new(tool),
            Cell::new(status).fg(color),
            count_cell(summary.rows.get(tool).copied()),
            count_cell(summary.inserted.get(tool).copied()),
            Cell::new(
                summary
                    .durations_sec
                    .get(tool)
                    .map(|d| format!("{d:.1}s"))
                    .unwrap_or_default(),
            )
            .set_alignment(CellAlignment::Right),
        ]);
    }
    println!("{table}");

    if summary.has_failures() {
        println!(" {} Tools that did not complete:", "[FAILED]".red().bold());
        for (tool, failure) in &summary.tools_failed {
            let message = if verbose { failure.message.as_str() } else { first_line(&failure.message) };
            println!("   {} {} (exit {}): {}", tool.bold(), failure.kind, failure.exit, message);
        }
    }
    println!();
}

/// Print every registered analyzer with its findings table and whether its
/// executable is installed.
pub fn render_tools(registry: &Registry, extra_dirs: &[PathBuf]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Tool").add_attribute(Attribute::Bold),
            Cell::new("Table").add_attribute(Attribute::Bold),
            Cell::new("Installed").add_attribute(Attribute::Bold),
        ]);
    for analyzer in registry.iter() {
        let installed = if analyzer.is_installed(extra_dirs) {
            Cell::new("✓ yes").fg(Color::Green)
        } else {
            Cell::new("✗ no").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(analyzer.name()),
            Cell::new(analyzer.table().name),
            installed.set_alignment(CellAlignment::Center),
        ]);
    }
    println!("{table}");
}

fn count_cell(count: Option<usize>) -> Cell {
    Cell::new(count.map(|c| c.to_string()).unwrap_or_default()).set_alignment(CellAlignment::Right)
}

fn first_line(message: &str) -> &str {
    let line = message.lines().next().unwrap_or("");
    if line.is_empty() {
        "no output"
    } else {
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("boom\ntrace"), "boom");
        assert_eq!(first_line(""), "no output");
    }
}
