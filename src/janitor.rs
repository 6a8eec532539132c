//! Removal of files nobody downstream is going to read.

use std::collections::{BTreeSet, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cache::{INPUTS_FILE, MARKER_PREFIX, RESULT_PREFIX};
use crate::core::Fields;
use crate::interface::Spec;
use crate::report::REPORT_DIR;
use crate::utils::walk_files;

/// Multi-file formats: keeping one member keeps all of them.
const RELATED: &[&[&str]] = &[
    &["hdr", "img", "mat"],
    &["nii", "mat"],
    &["BRIK", "HEAD"],
];

/// Bookkeeping files that always survive.
fn is_bookkeeping(name: &str) -> bool {
    name.starts_with(MARKER_PREFIX)
        || name.starts_with(RESULT_PREFIX)
        || name == INPUTS_FILE
        || name == "command.txt"
        || name == "batch.sh"
}

/// What the janitor is allowed to look at.
pub(crate) struct Sweep<'a> {
    pub dir: &'a Utf8Path,
    pub spec: &'a Spec,
    pub needed: &'a BTreeSet<String>,
    /// Files staged into the directory for copy-on-run inputs.
    pub staged: &'a [Utf8PathBuf],
    pub keep_inputs: bool,
}

/// Drops output fields no consumer needs and deletes every file under the
/// working directory that isn't reachable from a kept output.
///
/// Returns the deleted files.
pub(crate) fn clean(sweep: &Sweep<'_>, outputs: &mut Fields) -> std::io::Result<Vec<Utf8PathBuf>> {
    outputs.retain(|name, _| sweep.needed.contains(name));

    let mut keep_files = HashSet::new();
    let mut keep_dirs = Vec::new();

    for (name, value) in &*outputs {
        let Some(field) = sweep.spec.get(name) else {
            continue;
        };
        let mut paths = Vec::new();
        field.kind.paths(value, &mut paths);

        for path in paths {
            let path = resolve(sweep.dir, path);
            if !path.starts_with(sweep.dir) {
                continue;
            }
            if path.is_dir() {
                keep_dirs.push(path);
            } else {
                keep_files.extend(related(&path));
                keep_files.insert(path);
            }
        }
    }

    if sweep.keep_inputs {
        keep_files.extend(sweep.staged.iter().cloned());
    }

    let mut deleted = Vec::new();
    for file in walk_files(sweep.dir)? {
        let relative = file.strip_prefix(sweep.dir).unwrap_or(&file);
        let top = relative.components().next().map(|c| c.as_str()).unwrap_or_default();

        let kept = keep_files.contains(&file)
            || keep_dirs.iter().any(|dir| file.starts_with(dir))
            || top == REPORT_DIR
            || (relative.components().count() == 1 && is_bookkeeping(top));

        if !kept {
            fs::remove_file(&file)?;
            deleted.push(file);
        }
    }

    remove_empty_dirs(sweep.dir)?;
    tracing::debug!("janitor removed {} file(s) from {}", deleted.len(), sweep.dir);
    Ok(deleted)
}

fn resolve(dir: &Utf8Path, path: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(path);
    if path.is_relative() && !path.starts_with(dir) {
        dir.join(path)
    } else {
        path.to_path_buf()
    }
}

fn related(path: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Some(ext) = path.extension() else {
        return Vec::new();
    };

    RELATED
        .iter()
        .filter(|group| group.contains(&ext))
        .flat_map(|group| group.iter())
        .filter(|other| **other != ext)
        .map(|other| path.with_extension(other))
        .collect()
}

/// Removes every empty directory below `root`, keeping `root` itself.
fn remove_empty_dirs(root: &Utf8Path) -> std::io::Result<bool> {
    let mut empty = true;

    for entry in root.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if remove_empty_dirs(entry.path())? {
                fs::remove_dir(entry.path())?;
            } else {
                empty = false;
            }
        } else {
            empty = false;
        }
    }

    Ok(empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FieldKind, FieldSpec};

    fn workdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for file in [
            "keep.nii",
            "keep.mat",
            "drop.txt",
            "_0xabc.json",
            "result_n.cbor",
            "_inputs.cbor",
            "_report/report.md",
            "outdir/a.txt",
            "scratch/tmp/b.txt",
        ] {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "x").unwrap();
        }
        (dir, root)
    }

    #[test]
    fn test_clean_keeps_needed_outputs_and_bookkeeping() {
        let (_guard, root) = workdir();
        let spec = Spec::new()
            .field("image", FieldSpec::file())
            .field("log", FieldSpec::file())
            .field("dirs", FieldSpec::list(FieldKind::Directory));
        let needed: BTreeSet<String> = ["image".to_string(), "dirs".to_string()].into();

        let mut outputs = Fields::new()
            .with("image", root.join("keep.nii").as_str())
            .with("log", root.join("drop.txt").as_str())
            .with("dirs", serde_json::json!(["outdir"]));

        let sweep = Sweep {
            dir: &root,
            spec: &spec,
            needed: &needed,
            staged: &[],
            keep_inputs: false,
        };
        let deleted = clean(&sweep, &mut outputs).unwrap();

        assert!(outputs.get("log").is_none());
        assert!(root.join("keep.nii").exists());
        assert!(root.join("keep.mat").exists());
        assert!(root.join("outdir/a.txt").exists());
        assert!(root.join("_0xabc.json").exists());
        assert!(root.join("result_n.cbor").exists());
        assert!(root.join("_inputs.cbor").exists());
        assert!(root.join("_report/report.md").exists());

        assert!(!root.join("drop.txt").exists());
        assert!(!root.join("scratch").exists());
        assert_eq!(deleted.len(), 2);
    }

    #[test]
    fn test_clean_keeps_staged_inputs_on_request() {
        let (_guard, root) = workdir();
        let spec = Spec::new();
        let needed = BTreeSet::new();
        let staged = vec![root.join("drop.txt")];

        let sweep = Sweep {
            dir: &root,
            spec: &spec,
            needed: &needed,
            staged: &staged,
            keep_inputs: true,
        };
        clean(&sweep, &mut Fields::new()).unwrap();
        assert!(root.join("drop.txt").exists());
        assert!(!root.join("keep.nii").exists());
    }
}
