//! Artifact verification and report collection in a job workspace.

use gantry_core::{Glob, Result};
use indexmap::IndexMap;
use std::io;
use std::path::Path;
use tracing::debug;

/// Declared paths split by whether the job produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactScan {
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

/// Check every declared artifact path. Literal paths must exist; glob
/// patterns must match at least one file. Found globs are expanded.
pub fn verify_paths(workspace: &Path, declared: &[String]) -> Result<ArtifactScan> {
    let mut scan = ArtifactScan::default();
    let mut files = None;

    for path in declared {
        if is_pattern(path) {
            let files = match &mut files {
                Some(files) => files,
                None => files.insert(list_files(workspace)?),
            };
            let glob = Glob::new(path)?;
            let matched: Vec<String> = files.iter().filter(|f| glob.is_match(f)).cloned().collect();
            if matched.is_empty() {
                scan.missing.push(path.clone());
            } else {
                scan.found.extend(matched);
            }
        } else if workspace.join(path.trim_end_matches('/')).exists() {
            scan.found.push(path.clone());
        } else {
            scan.missing.push(path.clone());
        }
    }

    debug!(found = scan.found.len(), missing = scan.missing.len(), "Artifacts verified");
    Ok(scan)
}

/// Resolve declared report globs to the files that exist, per report type.
/// Report types with no files are left out.
pub fn collect_reports(
    workspace: &Path,
    declared: &IndexMap<String, Vec<String>>,
) -> Result<IndexMap<String, Vec<String>>> {
    let mut reports = IndexMap::new();
    for (kind, paths) in declared {
        let scan = verify_paths(workspace, paths)?;
        if !scan.found.is_empty() {
            reports.insert(kind.clone(), scan.found);
        }
    }
    Ok(reports)
}

fn is_pattern(path: &str) -> bool {
    path.contains(['*', '?'])
}

/// Every file under `root`, as `/`-separated paths relative to it, sorted.
fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    walk(root, "", &mut files)?;
    files.sort();
    Ok(files)
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &relative, out)?;
        } else {
            out.push(relative);
        }
    }
    Ok(())
}
