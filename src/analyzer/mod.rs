//! Analyzer plugins: one per supported tool.
//!
//! Each analyzer knows how to build its command line and how to turn the
//! resulting [`RunRecord`] into rows for its own findings table. Paths always
//! go through [`PathContext`] so every table agrees on path format.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::ToolsConfig;
use crate::error::{AuditError, SandboxError};
use crate::models::{Normalized, RunRecord};
use crate::paths;
use crate::sandbox::Sandbox;
use crate::store::schema::TableSpec;

pub mod bandit;
pub mod bearer;
pub mod biome;
pub mod eslint;
pub mod gitleaks;
pub mod jscpd;
pub mod mypy;
pub mod qlty;
pub mod radon;
pub mod sarif;
pub mod semgrep;
pub mod snyk;
pub mod vulture;

#[async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Table the normalized rows are written to.
    fn table(&self) -> &'static TableSpec;

    fn build_command(&self, target: &Path) -> Vec<String>;

    fn working_dir(&self, target: &Path) -> PathBuf {
        if target.is_dir() {
            target.to_path_buf()
        } else {
            target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    /// Exit codes meaning "ran fine" (including "found something").
    fn accepts_exit(&self, code: i32) -> bool {
        matches!(code, 0 | 1)
    }

    async fn execute(&self, target: &Path, sandbox: &Sandbox) -> Result<RunRecord, SandboxError> {
        let argv = self.build_command(target);
        sandbox.run(self.name(), &argv, &self.working_dir(target)).await
    }

    fn normalize(&self, run: &RunRecord, ctx: &PathContext<'_>) -> Result<Normalized>;

    /// Whether `normalize` reads the complexity payload, in which case it
    /// waits until the complexity tool of the same run has settled.
    fn uses_complexity(&self) -> bool {
        false
    }

    /// Whether this tool produces the complexity payload.
    fn provides_complexity(&self) -> bool {
        false
    }

    /// Whether the executable from [`Analyzer::build_command`] can be found.
    fn is_installed(&self, extra_dirs: &[PathBuf]) -> bool {
        self.build_command(Path::new("."))
            .first()
            .map(|exe| executable_on_path(exe, extra_dirs))
            .unwrap_or(false)
    }
}

/// Look `exe` up the way a shell would: as a path when it has a separator,
/// otherwise through `extra_dirs` and `PATH`.
pub fn executable_on_path(exe: &str, extra_dirs: &[PathBuf]) -> bool {
    let candidate = Path::new(exe);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    extra_dirs
        .iter()
        .cloned()
        .chain(std::env::split_paths(&inherited))
        .any(|dir| {
            let full = dir.join(exe);
            full.is_file() || (cfg!(windows) && full.with_extension("exe").is_file())
        })
}

/// Path information handed to `normalize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathContext<'a> {
    /// Working directory the tool ran in.
    pub cwd: Option<&'a str>,
    /// Project path whose folder name file paths are clipped to.
    pub anchor: Option<&'a str>,
    /// Radon payload from the same audit, if radon ran.
    pub complexity: Option<&'a Value>,
}

impl<'a> PathContext<'a> {
    pub fn for_run(run: &'a RunRecord, anchor: Option<&'a str>) -> Self {
        Self {
            cwd: Some(run.cwd.as_str()).filter(|c| !c.is_empty()),
            anchor,
            complexity: None,
        }
    }

    pub fn with_complexity(mut self, payload: Option<&'a Value>) -> Self {
        self.complexity = payload;
        self
    }

    /// Stored form of a tool-reported path: absolute, then clipped to the
    /// anchor folder when there is one.
    pub fn file_path(&self, raw: &str) -> String {
        let absolute = paths::ensure_absolute(raw, self.cwd);
        match self.anchor {
            Some(anchor) => paths::clip_to_anchor(&absolute, &paths::anchor_name(anchor)),
            None => absolute,
        }
    }

    pub fn relative(&self, raw: &str) -> String {
        paths::relativize(raw, self.cwd)
    }

    /// Root stored on every row: the anchor itself, else a label derived
    /// from the working directory or the reported paths.
    pub fn root<'p>(&self, raw_paths: impl IntoIterator<Item = &'p str>) -> String {
        if let Some(anchor) = self.anchor {
            return anchor.to_string();
        }
        let rels: Vec<String> = raw_paths.into_iter().map(|p| self.relative(p)).collect();
        paths::root_label(self.cwd, &rels)
    }
}

/// Startup-populated lookup from tool name to analyzer.
#[derive(Clone, Default)]
pub struct Registry {
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The twelve built-in analyzers, configured from `tools`.
    pub fn builtin(tools: &ToolsConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(bandit::BanditAnalyzer::new()));
        registry.register(Arc::new(mypy::MypyAnalyzer::new(&tools.mypy)));
        registry.register(Arc::new(radon::RadonAnalyzer::new()));
        registry.register(Arc::new(vulture::VultureAnalyzer::new(&tools.vulture)));
        registry.register(Arc::new(semgrep::SemgrepAnalyzer::new(&tools.semgrep)));
        registry.register(Arc::new(eslint::EslintAnalyzer::new()));
        registry.register(Arc::new(gitleaks::GitleaksAnalyzer::new(&tools.gitleaks)));
        registry.register(Arc::new(biome::BiomeAnalyzer::new()));
        registry.register(Arc::new(snyk::SnykAnalyzer::new()));
        registry.register(Arc::new(bearer::BearerAnalyzer::new()));
        registry.register(Arc::new(qlty::QltyAnalyzer::new()));
        registry.register(Arc::new(jscpd::JscpdAnalyzer::new(&tools.jscpd)));
        registry
    }

    /// Add an analyzer, replacing any existing one with the same name.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.retain(|a| a.name() != analyzer.name());
        self.analyzers.push(analyzer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Analyzer>> {
        let name = name.trim().to_ascii_lowercase();
        self.analyzers.iter().find(|a| a.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.analyzers.iter().map(|a| a.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Analyzer>> {
        self.analyzers.iter()
    }

    /// Map requested names to analyzers, in request order without repeats.
    /// Every unknown name is reported at once.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Analyzer>>, AuditError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            match self.get(name) {
                Some(analyzer) => {
                    if seen.insert(analyzer.name()) {
                        resolved.push(analyzer);
                    }
                }
                None => unknown.push(name.clone()),
            }
        }
        if unknown.is_empty() {
            Ok(resolved)
        } else {
            Err(AuditError::UnknownTools(unknown))
        }
    }
}

// ---------------------------------------------------------------------------
// JSON helpers shared by the parsers
// ---------------------------------------------------------------------------

/// Integer from a number or a numeric string.
pub(crate) fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-empty string, with numbers rendered as text.
pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The value unless it is null or an empty container.
pub(crate) fn nested(value: Option<&Value>) -> Option<Value> {
    match value? {
        Value::Null => None,
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Walk a chain of object keys.
pub(crate) fn dig<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    keys.iter().try_fold(value, |cur, key| cur.get(*key))
}

pub(crate) fn array<'v>(value: Option<&'v Value>) -> &'v [Value] {
    value.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_registry_has_twelve_tools() {
        let registry = Registry::builtin(&ToolsConfig::default());
        let names = registry.names();
        assert_eq!(names.len(), 12);
        for tool in ["bandit", "mypy", "radon", "vulture", "semgrep", "eslint", "gitleaks", "biome", "snyk", "bearer", "qlty", "jscpd"] {
            assert!(names.contains(&tool), "{tool} missing");
        }
    }

    #[test]
    fn test_resolve_reports_unknown_names() {
        let registry = Registry::builtin(&ToolsConfig::default());
        let ok = registry
            .resolve(&["Bandit".into(), "mypy".into(), "bandit".into()])
            .unwrap();
        assert_eq!(ok.iter().map(|a| a.name()).collect::<Vec<_>>(), vec!["bandit", "mypy"]);

        match registry.resolve(&["bandit".into(), "pylint".into(), "nope".into()]) {
            Err(AuditError::UnknownTools(names)) => assert_eq!(names, vec!["pylint", "nope"]),
            _ => panic!("expected unknown tools"),
        }
    }

    #[test]
    fn test_tables_match_tool_names() {
        let registry = Registry::builtin(&ToolsConfig::default());
        for analyzer in registry.iter() {
            assert_eq!(analyzer.table().tool, analyzer.name());
        }
    }

    #[test]
    fn test_path_context_clips_to_anchor() {
        let ctx = PathContext {
            cwd: Some("/work/proj"),
            anchor: Some("/work/proj"),
            complexity: None,
        };
        assert_eq!(ctx.file_path("src/a.py"), "proj/src/a.py");
        assert_eq!(ctx.root(["src/a.py"]), "/work/proj");

        let bare = PathContext {
            cwd: Some("/work/proj"),
            ..Default::default()
        };
        assert_eq!(bare.file_path("src/a.py"), "/work/proj/src/a.py");
        assert_eq!(bare.root(["src/a.py"]), "proj");
    }

    #[test]
    fn test_executable_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake-tool"), "").unwrap();
        assert!(executable_on_path("fake-tool", &[dir.path().to_path_buf()]));
        assert!(!executable_on_path("surely-missing-tool-xyz", &[]));
    }

    #[test]
    fn test_json_helpers() {
        let v = json!({"a": {"b": "7"}, "n": 2.0, "e": [], "s": ""});
        assert_eq!(int(dig(&v, &["a", "b"])), Some(7));
        assert_eq!(float(v.get("n")), Some(2.0));
        assert_eq!(text(v.get("s")), None);
        assert_eq!(nested(v.get("e")), None);
        assert!(array(v.get("missing")).is_empty());
    }
}
