//! Path and root resolution shared by every analyzer.
//!
//! All helpers here are lexical: they never touch the filesystem, so the same
//! raw tool output always normalizes to the same strings regardless of what is
//! on disk when the parser runs.

use std::path::{Component, Path, PathBuf};

/// Collapse `.` and `..` components without resolving symlinks.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Final segment of `path`, or the whole normalized path when it has none (`/`).
fn label_of(path: &Path) -> String {
    match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => to_slash(path),
    }
}

/// Resolve a possibly-relative `path` against `cwd` (or the process working
/// directory when no `cwd` is supplied).
pub fn ensure_absolute(path: &str, cwd: Option<&str>) -> String {
    let raw = Path::new(path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        match cwd.filter(|c| !c.is_empty()) {
            Some(base) => Path::new(base).join(raw),
            None => std::env::current_dir()
                .map(|dir| dir.join(raw))
                .unwrap_or_else(|_| raw.to_path_buf()),
        }
    };
    to_slash(&normalize(&joined))
}

/// `path` relative to `cwd` when it is absolute and lives under `cwd`;
/// otherwise a normalized form of `path`. Never fails: the input string is
/// returned untouched when nothing better can be produced.
pub fn relativize(path: &str, cwd: Option<&str>) -> String {
    if path.is_empty() {
        return String::new();
    }
    let target = normalize(Path::new(path));

    if let Some(base) = cwd.filter(|c| !c.is_empty()) {
        if target.is_absolute() {
            let base = normalize(Path::new(base));
            if let Ok(rest) = target.strip_prefix(&base) {
                let rel = to_slash(rest);
                return if rel.is_empty() { ".".to_string() } else { rel };
            }
        }
    }

    let normalized = to_slash(&target);
    if normalized.is_empty() {
        path.to_string()
    } else {
        normalized
    }
}

/// Longest common ancestor of `paths`, compared component by component.
///
/// Returns `None` when the paths share nothing at all (for example one
/// relative and one absolute path).
pub fn common_ancestor(paths: &[String]) -> Option<PathBuf> {
    let mut items = paths.iter().filter(|p| !p.is_empty());
    let first = normalize(Path::new(items.next()?));
    let mut prefix: Vec<Component<'_>> = first.components().collect();

    let rest: Vec<PathBuf> = items.map(|p| normalize(Path::new(p))).collect();
    for other in &rest {
        let shared = prefix
            .iter()
            .zip(other.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        prefix.truncate(shared);
    }

    if prefix.is_empty() {
        return None;
    }
    Some(prefix.iter().map(|c| c.as_os_str()).collect())
}

/// Short human-readable label for a scan root.
///
/// With a `cwd` the label is its final segment. Without one it is the final
/// segment of the common ancestor of `paths`, falling back to the parent of
/// the first path when the paths share no ancestor.
pub fn root_label(cwd: Option<&str>, paths: &[String]) -> String {
    if let Some(cwd) = cwd.filter(|c| !c.is_empty()) {
        return label_of(&normalize(Path::new(cwd)));
    }

    match common_ancestor(paths) {
        Some(common) => label_of(&common),
        None => paths
            .iter()
            .find(|p| !p.is_empty())
            .and_then(|first| normalize(Path::new(first)).parent().map(label_of))
            .unwrap_or_default(),
    }
}

/// Final folder name of an anchor such as `/home/me/proj/` -> `proj`.
pub fn anchor_name(anchor: &str) -> String {
    label_of(&normalize(Path::new(anchor.trim_end_matches(['/', '\\']))))
}

/// Drop everything before the right-most segment equal to `anchor`.
///
/// `/a/proj/proj/file.py` clipped to `proj` is `proj/file.py`. Without a
/// matching segment the input comes back unchanged.
pub fn clip_to_anchor(absolute: &str, anchor: &str) -> String {
    if anchor.is_empty() {
        return absolute.to_string();
    }
    let path = Path::new(absolute);
    let parts: Vec<Component<'_>> = path.components().collect();

    let hit = parts
        .iter()
        .rposition(|c| matches!(c, Component::Normal(name) if *name == anchor));

    match hit {
        Some(index) => {
            let clipped: PathBuf = parts[index..].iter().map(|c| c.as_os_str()).collect();
            to_slash(&clipped)
        }
        None => absolute.to_string(),
    }
}

/// Path used inside identity hashes: relative to `root` for absolute paths,
/// the raw path otherwise, always with forward slashes.
pub fn identity_relative(file_path: &str, root: &str) -> String {
    let file = Path::new(file_path);
    if root.is_empty() || !file.is_absolute() {
        return file_path.replace('\\', "/");
    }
    let root = normalize(Path::new(root));
    match normalize(file).strip_prefix(&root) {
        Ok(rest) => to_slash(rest),
        Err(_) => file_path.replace('\\', "/"),
    }
}
