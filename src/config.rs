use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::store::InsertMode;

/// Root configuration structure, deserialized from `.auditor/config.toml`.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub execution: ExecutionConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding scans and findings.
    pub path: PathBuf,
    pub insert_mode: InsertMode,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("auditor.db"),
            insert_mode: InsertMode::Bulk,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write events, summaries and raw tool output under `dir`.
    pub debug: bool,
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock limit per analyzer process.
    pub timeout_secs: u64,
    /// Address-space cap per analyzer process (POSIX only).
    pub memory_limit_mb: Option<u64>,
    pub jobs: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            memory_limit_mb: None,
            jobs: 4,
        }
    }
}

/// Which tools run by default, plus per-tool knobs.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    /// Empty means every registered tool.
    pub enabled: Vec<String>,
    pub vulture: VultureConfig,
    pub semgrep: SemgrepConfig,
    pub gitleaks: GitleaksConfig,
    pub jscpd: JscpdConfig,
    pub mypy: MypyConfig,
    pub node: NodeConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VultureConfig {
    pub min_confidence: u8,
}

impl Default for VultureConfig {
    fn default() -> Self {
        Self { min_confidence: 50 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SemgrepConfig {
    /// `--config` values; empty lets semgrep pick `auto`.
    pub configs: Vec<String>,
    /// Per-rule timeout handed to semgrep itself.
    pub timeout: u64,
}

impl Default for SemgrepConfig {
    fn default() -> Self {
        Self {
            configs: Vec::new(),
            timeout: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GitleaksConfig {
    pub redact: bool,
}

impl Default for GitleaksConfig {
    fn default() -> Self {
        Self { redact: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JscpdConfig {
    pub min_tokens: Option<u32>,
    pub min_lines: Option<u32>,
    pub formats: Vec<String>,
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
    pub gitignore: bool,
    /// Keep clones whose two sides live in the same file.
    pub allow_intra_file: bool,
    /// Emit a finding for both sides of every clone.
    pub emit_both_sides: bool,
    /// Include a hash of the duplicated fragment in the pair key, so equal
    /// spans with different code are kept apart.
    pub fragment_in_key: bool,
}

impl Default for JscpdConfig {
    fn default() -> Self {
        Self {
            min_tokens: Some(50),
            min_lines: None,
            formats: Vec::new(),
            patterns: Vec::new(),
            ignore: vec!["**/node_modules/**".into(), "**/dist/**".into(), "**/build/**".into()],
            gitignore: true,
            allow_intra_file: true,
            emit_both_sides: false,
            fragment_in_key: false,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MypyConfig {
    pub strict: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding node tool binaries (eslint, biome, jscpd), put in
    /// front of `PATH` for every analyzer.
    pub bin_dir: Option<PathBuf>,
}

/// Load the configuration, searching in order:
///
/// 1. `config_override` — path passed via `--config`
/// 2. `<project_path>/.auditor/config.toml`
/// 3. `~/.config/auditor/config.toml`
/// 4. Built-in [`Config::default`]
///
/// `AUDITOR_DB` and `AUDITOR_DEBUG` then override the file.
pub fn load_config(project_path: &Path, config_override: Option<&Path>) -> Result<Config> {
    let mut config = read_config(project_path, config_override)?;
    apply_env(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn read_config(project_path: &Path, config_override: Option<&Path>) -> Result<Config> {
    if let Some(path) = config_override {
        return parse_file(path);
    }

    let project_config = project_path.join(".auditor").join("config.toml");
    if project_config.exists() {
        return parse_file(&project_config);
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".config").join("auditor").join("config.toml");
        if home_config.exists() {
            return parse_file(&home_config);
        }
    }

    Ok(Config::default())
}

fn parse_file(path: &Path) -> Result<Config> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
}

fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(db) = lookup("AUDITOR_DB").filter(|v| !v.is_empty()) {
        config.database.path = PathBuf::from(db);
    }
    if let Some(flag) = lookup("AUDITOR_DEBUG") {
        config.logging.debug = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.execution.timeout_secs, 300);
        assert_eq!(cfg.tools.vulture.min_confidence, 50);
        assert!(cfg.tools.jscpd.allow_intra_file);
        assert!(!cfg.tools.jscpd.fragment_in_key);
        assert!(cfg.tools.gitleaks.redact);
        assert!(!cfg.logging.debug);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[execution]").unwrap();
        writeln!(f, "jobs = 8").unwrap();
        writeln!(f, "[tools]").unwrap();
        writeln!(f, "enabled = [\"bandit\", \"mypy\"]").unwrap();
        writeln!(f, "[tools.jscpd]").unwrap();
        writeln!(f, "fragment_in_key = true").unwrap();
        writeln!(f, "[database]").unwrap();
        writeln!(f, "insert_mode = \"per_row\"").unwrap();

        let cfg = load_config(Path::new("/nonexistent"), Some(f.path())).unwrap();
        assert_eq!(cfg.execution.jobs, 8);
        assert_eq!(cfg.execution.timeout_secs, 300);
        assert_eq!(cfg.tools.enabled, vec!["bandit", "mypy"]);
        assert!(cfg.tools.jscpd.fragment_in_key);
        assert_eq!(cfg.tools.jscpd.min_tokens, Some(50));
        assert_eq!(cfg.database.insert_mode, InsertMode::PerRow);
    }

    #[test]
    fn test_project_config_is_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".auditor")).unwrap();
        std::fs::write(
            dir.path().join(".auditor").join("config.toml"),
            "[logging]\ndebug = true\n",
        )
        .unwrap();
        let cfg = read_config(dir.path(), None).unwrap();
        assert!(cfg.logging.debug);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        apply_env(&mut cfg, |key| match key {
            "AUDITOR_DB" => Some("/tmp/x.db".into()),
            "AUDITOR_DEBUG" => Some("TRUE".into()),
            _ => None,
        });
        assert_eq!(cfg.database.path, PathBuf::from("/tmp/x.db"));
        assert!(cfg.logging.debug);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[execution").unwrap();
        assert!(load_config(Path::new("."), Some(f.path())).is_err());
    }
}
