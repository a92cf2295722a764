//! Materializing a version tree from an extracted bundle.
//!
//! A version tree mirrors the bundle's directories, hard-links every file
//! that is neither a template nor a data file, and symlinks data files to
//! their persistent copies under the instance's `data/` directory.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{DeployError, DeployResult};

/// Name of the transient link that is renamed over `current`.
const NEXT_LINK_NAME: &str = "new";

/// Sort data file entries and drop duplicates and entries already covered
/// by a directory entry (`dir/` covers everything below it).
pub fn filter_repeated_paths(paths: &[String]) -> Vec<String> {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();

    let mut kept: Vec<String> = Vec::new();
    for path in sorted {
        let trimmed = path.trim_end_matches('/');
        let covered = kept.iter().any(|k| {
            k.trim_end_matches('/') == trimmed || (k.ends_with('/') && path.starts_with(k.as_str()))
        });
        if !covered {
            kept.push(path.clone());
        }
    }
    kept
}

/// Whether `relative` is one of `excluded` or lies below one of them.
pub fn is_excluded(relative: &str, excluded: &BTreeSet<String>) -> bool {
    excluded.contains(relative)
        || excluded.iter().any(|e| {
            relative
                .strip_prefix(e.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
        })
}

fn relative_str(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn walk<'a>(
    root: &'a Path,
    excluded: &'a BTreeSet<String>,
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| !is_excluded(&relative_str(root, entry.path()), excluded))
}

fn walk_error(root: &Path, err: walkdir::Error) -> DeployError {
    DeployError::at("walking", root, io::Error::from(err))
}

/// Recreate the directory structure of `bundle` under `version`.
pub fn mirror_directories(
    bundle: &Path,
    version: &Path,
    excluded: &BTreeSet<String>,
) -> DeployResult<usize> {
    let mut created = 0;
    for entry in walk(bundle, excluded) {
        let entry = entry.map_err(|e| walk_error(bundle, e))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let dest = version.join(entry.path().strip_prefix(bundle).unwrap_or(entry.path()));
        fs::create_dir_all(&dest).map_err(|e| DeployError::at("creating", &dest, e))?;
        if let Ok(meta) = entry.metadata() {
            let _ = fs::set_permissions(&dest, meta.permissions());
        }
        created += 1;
    }
    Ok(created)
}

/// Hard-link every non-directory entry of `bundle` into `version`.
/// `progress` is called with each linked relative path.
pub fn hard_link_files(
    bundle: &Path,
    version: &Path,
    excluded: &BTreeSet<String>,
    progress: &mut dyn FnMut(&str),
) -> DeployResult<usize> {
    let mut linked = 0;
    for entry in walk(bundle, excluded) {
        let entry = entry.map_err(|e| walk_error(bundle, e))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = relative_str(bundle, entry.path());
        let dest = version.join(&relative);
        fs::hard_link(entry.path(), &dest).map_err(|e| DeployError::at("linking", &dest, e))?;
        progress(&relative);
        linked += 1;
    }
    Ok(linked)
}

/// Copy `src` into `dst` without replacing anything already there.
fn copy_tree_missing(src: &Path, dst: &Path) -> DeployResult<()> {
    fs::create_dir_all(dst).map_err(|e| DeployError::at("creating", dst, e))?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let target = dst.join(entry.path().strip_prefix(src).unwrap_or(entry.path()));
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| DeployError::at("creating", &target, e))?;
        } else if fs::symlink_metadata(&target).is_err() {
            if file_type.is_symlink() {
                let link = fs::read_link(entry.path())
                    .map_err(|e| DeployError::at("reading link", entry.path(), e))?;
                symlink(&link, &target).map_err(|e| DeployError::at("linking", &target, e))?;
            } else {
                fs::copy(entry.path(), &target)
                    .map_err(|e| DeployError::at("copying to", &target, e))?;
            }
        }
    }
    Ok(())
}

fn create_parent(path: &Path) -> DeployResult<()> {
    match path.parent() {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(|e| DeployError::at("creating", parent, e))
        }
        None => Ok(()),
    }
}

/// Point each data file entry of `version` at its persistent copy under
/// `data_root`, seeding the copy from `bundle` on first use. Returns the
/// entries that were linked.
pub fn resolve_data_files(
    bundle: &Path,
    data_root: &Path,
    version: &Path,
    data_files: &[String],
) -> DeployResult<Vec<String>> {
    let mut linked = Vec::new();
    for entry in filter_repeated_paths(data_files) {
        let is_dir_entry = entry.ends_with('/');
        let relative = entry.trim_end_matches('/');
        let src = bundle.join(relative);
        let data = data_root.join(relative);
        let inst = version.join(relative);

        match fs::symlink_metadata(&src) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!(entry = %entry, "data file source is a symlink, skipping");
                continue;
            }
            Ok(meta) if meta.is_dir() => {
                if !is_dir_entry {
                    debug!(entry = %entry, "directory data file declared without trailing slash, skipping");
                    continue;
                }
                copy_tree_missing(&src, &data)?;
            }
            Ok(_) => {
                if is_dir_entry {
                    debug!(entry = %entry, "file data file declared as a directory, skipping");
                    continue;
                }
                create_parent(&data)?;
                if fs::symlink_metadata(&data).is_err() {
                    fs::copy(&src, &data).map_err(|e| DeployError::at("copying to", &data, e))?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if is_dir_entry {
                    fs::create_dir_all(&data).map_err(|e| DeployError::at("creating", &data, e))?;
                } else if relative.contains('/') {
                    create_parent(&data)?;
                }
            }
            Err(e) => return Err(DeployError::at("reading", &src, e)),
        }

        create_parent(&inst)?;
        if fs::symlink_metadata(&inst).is_ok() {
            fs::remove_file(&inst).map_err(|e| DeployError::at("removing", &inst, e))?;
        }
        symlink(&data, &inst).map_err(|e| DeployError::at("linking", &inst, e))?;
        linked.push(entry);
    }
    Ok(linked)
}

/// Atomically point `link` at `target`: a fresh symlink is created beside
/// it and renamed over it.
pub fn swap_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let next = link.with_file_name(NEXT_LINK_NAME);
    if fs::symlink_metadata(&next).is_ok() {
        fs::remove_file(&next)?;
    }
    symlink(target, &next)?;
    if let Err(e) = fs::rename(&next, link) {
        let _ = fs::remove_file(&next);
        return Err(e);
    }
    Ok(())
}

/// Target of a symlink, if `link` is one.
pub fn link_target(link: &Path) -> Option<PathBuf> {
    fs::read_link(link).ok()
}

/// Final component of a symlink's target, e.g. `fooapp@1.0`.
pub fn link_target_name(link: &Path) -> Option<String> {
    link_target(link)?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repeated_paths_are_filtered() {
        let filtered = filter_repeated_paths(&strings(&[
            "logs/",
            "db/store.db",
            "logs/today.log",
            "db/store.db",
            "config.json",
            "db/",
        ]));
        assert_eq!(filtered, strings(&["config.json", "db/", "logs/"]));
    }

    #[test]
    fn exclusion_covers_descendants_only() {
        let excluded = set(&["db", "config.json"]);
        assert!(is_excluded("db", &excluded));
        assert!(is_excluded("db/a/b", &excluded));
        assert!(is_excluded("config.json", &excluded));
        assert!(!is_excluded("dbx", &excluded));
        assert!(!is_excluded("lib/config.json", &excluded));
    }

    fn bundle_tree(root: &Path) {
        fs::create_dir_all(root.join("lib/nested")).unwrap();
        fs::create_dir_all(root.join("db")).unwrap();
        fs::write(root.join("server.js"), "main").unwrap();
        fs::write(root.join("lib/nested/util.js"), "util").unwrap();
        fs::write(root.join("config.json"), "{{ instance.name }}").unwrap();
        fs::write(root.join("db/seed.db"), "seed").unwrap();
    }

    #[test]
    fn mirror_and_link_skip_excluded_paths() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        let version = dir.path().join("version");
        bundle_tree(&bundle);
        fs::create_dir(&version).unwrap();
        let excluded = set(&["config.json", "db"]);

        let dirs = mirror_directories(&bundle, &version, &excluded).unwrap();
        assert_eq!(dirs, 2);
        assert!(version.join("lib/nested").is_dir());
        assert!(!version.join("db").exists());

        let mut seen = Vec::new();
        let linked =
            hard_link_files(&bundle, &version, &excluded, &mut |p| seen.push(p.to_string()))
                .unwrap();
        assert_eq!(linked, 2);
        assert_eq!(seen, vec!["lib/nested/util.js", "server.js"]);
        assert!(!version.join("config.json").exists());

        use std::os::unix::fs::MetadataExt;
        let a = fs::metadata(bundle.join("server.js")).unwrap();
        let b = fs::metadata(version.join("server.js")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn data_files_are_seeded_once_and_linked() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        let data = dir.path().join("data");
        let version = dir.path().join("version");
        bundle_tree(&bundle);
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(&version).unwrap();

        let entries = strings(&["db/", "logs/", "state/counter", "loose", "server.js/"]);
        let linked = resolve_data_files(&bundle, &data, &version, &entries).unwrap();
        assert_eq!(linked, strings(&["db/", "logs/", "loose", "state/counter"]));

        assert_eq!(fs::read_to_string(data.join("db/seed.db")).unwrap(), "seed");
        assert!(data.join("logs").is_dir());
        assert!(data.join("state").is_dir());
        assert_eq!(fs::read_link(version.join("db")).unwrap(), data.join("db"));
        assert_eq!(fs::read_link(version.join("loose")).unwrap(), data.join("loose"));
        assert!(!version.join("server.js").exists());

        // A later version keeps whatever the instance wrote.
        fs::write(data.join("db/seed.db"), "changed").unwrap();
        let next = dir.path().join("next");
        fs::create_dir_all(&next).unwrap();
        resolve_data_files(&bundle, &data, &next, &entries).unwrap();
        assert_eq!(fs::read_to_string(next.join("db/seed.db")).unwrap(), "changed");
    }

    #[test]
    fn symlinked_data_sources_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle");
        let data = dir.path().join("data");
        let version = dir.path().join("version");
        let secret = dir.path().join("secret");
        fs::create_dir_all(&bundle).unwrap();
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(&version).unwrap();
        fs::write(&secret, "host only").unwrap();
        symlink(&secret, bundle.join("state.json")).unwrap();

        let linked = resolve_data_files(&bundle, &data, &version, &strings(&["state.json"])).unwrap();
        assert!(linked.is_empty());
        assert!(fs::symlink_metadata(data.join("state.json")).is_err());
        assert!(fs::symlink_metadata(version.join("state.json")).is_err());
    }

    #[test]
    fn swap_replaces_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("current");
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        swap_symlink(&link, &a).unwrap();
        assert_eq!(link_target(&link), Some(a));
        swap_symlink(&link, &b).unwrap();
        assert_eq!(link_target_name(&link).as_deref(), Some("b"));
        assert!(!dir.path().join(NEXT_LINK_NAME).exists());
    }
}
