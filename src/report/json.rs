use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::store::extract::{match_root_by_folder, root_folder, ExtractFilter};
use crate::store::Store;

pub const EXPORT_FILE: &str = "auditor-findings.json";

/// Write `<out_dir>/<root folder>/auditor-findings.json` for every stored
/// root, or only for the one matching `folder`. Returns the written files.
///
/// Roots sharing a folder name get a numbered directory (`api`, `api-2`, ...)
/// instead of overwriting each other.
pub fn export(store: &Store, out_dir: &Path, folder: Option<&str>) -> Result<Vec<PathBuf>> {
    let roots = store.roots()?;
    let selected = match folder {
        Some(folder) => match match_root_by_folder(&roots, folder) {
            Some(root) => vec![root],
            None => bail!("no stored root matches `{folder}`"),
        },
        None => roots,
    };

    let mut written = Vec::new();
    let mut taken: HashMap<String, (String, usize)> = HashMap::new();
    for root in selected {
        let doc = store.extract(&ExtractFilter {
            root: Some(root.clone()),
            scan_id: None,
        })?;
        let folder = root_folder(&root);
        let (first, uses) = taken.entry(folder.clone()).or_insert_with(|| (root.clone(), 0));
        *uses += 1;
        let dir_name = if *uses == 1 {
            folder
        } else {
            let renamed = format!("{folder}-{uses}");
            warn!(root = %root, other = %first, dir = %renamed, "export folder name already used");
            renamed
        };
        let dir = out_dir.join(dir_name);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(EXPORT_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(&doc)?)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(root = %root, findings = doc.findings.len(), path = %path.display(), "exported");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Finding, ScanMetadata};
    use crate::store::schema::{BANDIT, SEMGREP};

    fn store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.seed().unwrap();
        store
            .persist(
                &ScanMetadata::for_tool("bandit"),
                vec![
                    Finding::new(BANDIT.name, "api/app.py", "/work/api")
                        .lines(Some(3), Some(3))
                        .with("message", "assert used"),
                    Finding::new(BANDIT.name, "web/x.py", "/work/web")
                        .lines(Some(1), None)
                        .with("message", "exec used"),
                ],
            )
            .unwrap();
        store
            .persist(
                &ScanMetadata::for_tool("semgrep"),
                vec![Finding::new(SEMGREP.name, "api/db.py", "/work/api")
                    .lines(Some(9), Some(10))
                    .with("message", "sql injection")],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_export_every_root() {
        let out = tempfile::tempdir().unwrap();
        let written = export(&store(), out.path(), None).unwrap();
        assert_eq!(
            written,
            vec![
                out.path().join("api").join(EXPORT_FILE),
                out.path().join("web").join(EXPORT_FILE)
            ]
        );

        let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
        assert_eq!(doc["name"], "auditor");
        assert_eq!(doc["root"], "/work/api");
        assert_eq!(doc["findings"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_same_folder_name_does_not_overwrite() {
        let mut store = store();
        store
            .persist(
                &ScanMetadata::for_tool("bandit"),
                vec![Finding::new(BANDIT.name, "api/main.py", "/other/api")
                    .lines(Some(2), None)
                    .with("message", "pickle load")],
            )
            .unwrap();
        let out = tempfile::tempdir().unwrap();

        let written = export(&store, out.path(), None).unwrap();

        assert_eq!(
            written,
            vec![
                out.path().join("api").join(EXPORT_FILE),
                out.path().join("api-2").join(EXPORT_FILE),
                out.path().join("web").join(EXPORT_FILE),
            ]
        );
        let second: serde_json::Value = serde_json::from_slice(&std::fs::read(&written[1]).unwrap()).unwrap();
        assert_eq!(second["root"], "/work/api");
    }

    #[test]
    fn test_export_one_root_by_folder() {
        let out = tempfile::tempdir().unwrap();
        let written = export(&store(), out.path(), Some("web")).unwrap();
        assert_eq!(written.len(), 1);
        assert!(export(&store(), out.path(), Some("missing")).is_err());
    }
}
