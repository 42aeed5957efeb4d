//! Loader for declarative group files.
//!
//! Each YAML file in the groups directory holds a list of group records;
//! the loader applies them to the resource store, which queues one event
//! per group for the worker pool.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use yaml_peg::serde as yaml;

use groupsync_core::resources::GroupSpec;

/// One declared group: the resource name plus its spec fields.
#[derive(Deserialize)]
pub(crate) struct GroupDecl {
    /// Cluster-unique resource name
    pub name: String,
    /// Desired state
    #[serde(flatten)]
    pub spec: GroupSpec,
}

/// Parse every `.yaml`/`.yml` file in the directory.
pub(crate) fn load_groups(dir: &Path) -> Result<Vec<GroupDecl>> {
    let mut declarations = Vec::new();
    if !dir.exists() {
        return Ok(declarations);
    }

    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading groups directory {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading group file {}", path.display()))?;
        let mut parsed = yaml::from_str::<Vec<GroupDecl>>(&raw)
            .with_context(|| format!("parsing group file {}", path.display()))?;
        declarations.append(&mut parsed.pop().unwrap_or_default());
    }
    Ok(declarations)
}
