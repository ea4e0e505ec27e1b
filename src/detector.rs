use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Files or directories whose presence makes a directory a project.
const MARKERS: [&str; 9] = [
    ".git",
    "pyproject.toml",
    "package.json",
    "requirements.txt",
    "setup.cfg",
    "setup.py",
    "Pipfile",
    "poetry.lock",
    "tsconfig.json",
];

/// Directory names never treated as projects nor descended into.
const EXCLUDED: [&str; 16] = [
    ".git",
    "node_modules",
    "venv",
    ".venv",
    "env",
    "__pycache__",
    "dist",
    "build",
    "out",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".tox",
    ".idea",
    ".vscode",
    "target",
];

/// How deep a recursive discovery walks below the root.
pub const MAX_DEPTH: usize = 4;

pub fn is_project(path: &Path) -> bool {
    MARKERS.iter().any(|m| path.join(m).exists())
}

fn is_excluded(path: &Path) -> bool {
    path.file_name()
        .map(|n| EXCLUDED.iter().any(|x| n == *x))
        .unwrap_or(false)
}

/// Discover the projects under `root`.
///
/// Looks at the immediate children of `root` (or, with `recursive`, at every
/// directory up to [`MAX_DEPTH`] levels down). `root` itself is the project
/// only when nothing is found below it, so a marked monorepo root does not
/// audit its children twice. The result is sorted and free of duplicates.
pub fn discover_projects(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut projects: Vec<PathBuf> = if recursive {
        WalkDir::new(root)
            .min_depth(1)
            .max_depth(MAX_DEPTH)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_excluded(e.path()))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir() && is_project(e.path()))
            .map(|e| e.into_path())
            .collect()
    } else {
        std::fs::read_dir(root)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && !is_excluded(p) && is_project(p))
            .collect()
    };

    if projects.is_empty() {
        projects.push(root.to_path_buf());
    }
    projects.sort();
    projects.dedup();
    projects
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_children_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("api/pyproject.toml"));
        touch(&root.join("web/package.json"));
        fs::create_dir_all(root.join("docs")).unwrap();
        touch(&root.join("node_modules/pkg/package.json"));

        let found = discover_projects(root, false);
        assert_eq!(found, vec![root.join("api"), root.join("web")]);
    }

    #[test]
    fn test_root_only_when_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("plain")).unwrap();
        assert_eq!(discover_projects(dir.path(), false), vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_marked_root_with_marked_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".git")).unwrap();
        touch(&root.join("setup.py"));
        touch(&root.join("plugin/setup.cfg"));
        touch(&root.join("web/package.json"));

        let found = discover_projects(root, false);
        assert_eq!(found, vec![root.join("plugin"), root.join("web")]);
    }

    #[test]
    fn test_marked_root_alone() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("pyproject.toml"));
        fs::create_dir_all(dir.path().join("src")).unwrap();
        assert_eq!(discover_projects(dir.path(), false), vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_recursive_walk_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("services/billing/requirements.txt"));
        touch(&root.join("services/.venv/lib/pyproject.toml"));
        touch(&root.join("apps/site/tsconfig.json"));

        assert_eq!(discover_projects(root, false), vec![root.to_path_buf()]);
        assert_eq!(
            discover_projects(root, true),
            vec![root.join("apps/site"), root.join("services/billing")]
        );
    }
}
