//! Recursive filesystem primitives for the bundle installer.
//!
//! Synchronous; async callers must run these under `spawn_blocking`.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Recursively delete `path`. Missing path is a no-op; a plain file is
/// deleted directly.
pub fn remove_tree(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };

    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("remove tree {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("remove file {}", path.display()))
    }
}

/// Recursively copy `source` to `destination`, creating intermediate
/// directories and overwriting existing files (replace semantics, not merge).
/// Unix permission bits are preserved.
pub fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(source)
        .with_context(|| format!("stat copy source {}", source.display()))?;

    if meta.is_dir() {
        fs::create_dir_all(destination)
            .with_context(|| format!("create dir {}", destination.display()))?;
        for entry in
            fs::read_dir(source).with_context(|| format!("read dir {}", source.display()))?
        {
            let entry = entry.with_context(|| format!("read dir entry in {}", source.display()))?;
            copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
        }
        fs::set_permissions(destination, meta.permissions())
            .with_context(|| format!("set permissions on {}", destination.display()))?;
    } else {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        // fs::copy truncates an existing destination and carries permissions.
        fs::copy(source, destination).with_context(|| {
            format!("copy {} -> {}", source.display(), destination.display())
        })?;
    }

    Ok(())
}

/// Replace `target` with a copy of `source` via a staged sibling and two
/// renames, so a failure partway never leaves `target` half-replaced. The
/// staging and backup siblings live next to `target` to keep the renames on
/// one filesystem.
pub fn replace_tree(source: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("replace target {} has no parent", target.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("replace target {} has no file name", target.display()))?;

    let pid = std::process::id();
    let staged = parent.join(format!(".{name}.staged-{pid}"));
    let displaced = parent.join(format!(".{name}.old-{pid}"));

    // Leftovers from an interrupted earlier run.
    remove_tree(&staged)?;
    remove_tree(&displaced)?;

    copy_tree(source, &staged)
        .with_context(|| format!("stage {} into {}", source.display(), staged.display()))?;

    let had_old = target.exists();
    if had_old {
        fs::rename(target, &displaced).with_context(|| {
            format!("move old {} -> {}", target.display(), displaced.display())
        })?;
    }

    if let Err(e) = fs::rename(&staged, target) {
        if had_old {
            let _ = fs::rename(&displaced, target);
        }
        let _ = remove_tree(&staged);
        return Err(e).with_context(|| format!("swap {} into place", target.display()));
    }

    let _ = remove_tree(&displaced);
    Ok(())
}
