use std::path::Path;

use anyhow::Result;
use regex::Regex;

use super::{Analyzer, PathContext};
use crate::config::VultureConfig;
use crate::models::{Finding, Normalized, RunRecord, ScanMetadata};
use crate::store::schema::{TableSpec, VULTURE};

/// Dead-code finder. Prints plain text lines like
/// `pkg/mod.py:12: unused function 'helper' (60% confidence)` and exits 3
/// when it found anything.
pub struct VultureAnalyzer {
    min_confidence: u8,
}

impl VultureAnalyzer {
    pub fn new(config: &VultureConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
        }
    }
}

impl Analyzer for VultureAnalyzer {
    fn name(&self) -> &'static str {
        "vulture"
    }

    fn table(&self) -> &'static TableSpec {
        &VULTURE
    }

    fn build_command(&self, target: &Path) -> Vec<String> {
        vec![
            "vulture".into(),
            "--min-confidence".into(),
            self.min_confidence.to_string(),
            target.to_string_lossy().into_owned(),
        ]
    }

    fn accepts_exit(&self, code: i32) -> bool {
        matches!(code, 0 | 3)
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized> {
        let lines = parse_lines(&run.stdout)?;
        let root = ctx.root(lines.iter().map(|l| l.file.as_str()));

        let findings = lines
            .into_iter()
            .filter(|l| l.confidence.map_or(true, |c| c >= i64::from(self.min_confidence)))
            .map(|l| {
                Finding::new(VULTURE.name, ctx.file_path(&l.file), root.as_str())
                    .lines(Some(l.line), Some(l.line))
                    .with("message", l.message.clone())
                    .with_opt("confidence", l.confidence)
                    .with_opt("kind", kind_of(&l.message))
            })
            .collect();

        Ok(Normalized {
            scan: ScanMetadata::for_tool(self.name()),
            findings,
        })
    }
}

#[derive(Debug, PartialEq)]
struct VultureLine {
    file: String,
    line: i64,
    message: String,
    confidence: Option<i64>,
}

fn parse_lines(stdout: &str) -> Result<Vec<VultureLine>> {
    let re = Regex::new(r"^(?P<file>.+?):(?P<line>\d+):\s*(?P<message>.*?)(?:\s*\((?P<conf>\d+)%\s+confidence\))?\s*$")?;
    Ok(stdout.lines().filter_map(|line| parse_line(&re, line)).collect())
}

fn parse_line(re: &Regex, raw: &str) -> Option<VultureLine> {
    let caps = re.captures(raw.trim())?;
    Some(VultureLine {
        file: caps.name("file")?.as_str().to_string(),
        line: caps.name("line")?.as_str().parse().ok()?,
        message: caps.name("message")?.as_str().trim().to_string(),
        confidence: caps.name("conf").and_then(|m| m.as_str().parse().ok()),
    })
}

/// `unused function 'x'` -> `unused-function`: the words before the quoted name.
fn kind_of(message: &str) -> Option<String> {
    let head = message.split(['\'', '"']).next()?.trim();
    if head.is_empty() {
        return None;
    }
    Some(head.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-"))
}
