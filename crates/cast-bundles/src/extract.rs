//! Gzipped tarball extraction.
//!
//! Bundles are packed with a single top-level directory, which is stripped
//! on extraction so the manifest lands at the root of the target. Entries
//! that would escape the target are rejected, and so are links of either
//! kind: a symlink would let a later entry be written through it.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

/// Extract `tarball` into the new directory `target`. Returns the number of
/// entries written.
pub fn extract_tarball(tarball: &Path, target: &Path) -> io::Result<usize> {
    fs::create_dir(target)?;
    fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;

    let file = File::open(tarball)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);

    let mut written = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = strip_top_level(&path)? else {
            continue;
        };
        let dest = target.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)?;
            }
            EntryType::Link | EntryType::Symlink => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("link entries are not allowed: {}", path.display()),
                ));
            }
            _ => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
            }
        }
        written += 1;
    }

    debug!(tarball = ?tarball, target = ?target, entries = written, "tarball extracted");
    Ok(written)
}

/// Drop the leading directory component. `None` for the top-level entry
/// itself.
fn strip_top_level(path: &Path) -> io::Result<Option<PathBuf>> {
    let mut normal = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normal.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsafe path in tarball: {}", path.display()),
                ));
            }
        }
    }
    if normal.len() < 2 {
        return Ok(None);
    }
    Ok(Some(normal[1..].iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn build_tarball(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn strips_the_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("b.tar.gz");
        build_tarball(
            &tarball,
            &[
                ("fooapp/cast.json", b"{}", 0o644),
                ("fooapp/lib/util.js", b"exports.x = 1;", 0o644),
                ("fooapp/bin/start.sh", b"#!/bin/sh\n", 0o755),
            ],
        );

        let target = dir.path().join("out");
        let written = extract_tarball(&tarball, &target).unwrap();
        assert_eq!(written, 3);
        assert_eq!(fs::read(target.join("cast.json")).unwrap(), b"{}");
        assert!(target.join("lib/util.js").is_file());
        let mode = fs::metadata(target.join("bin/start.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn symlinks_cannot_redirect_later_entries() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();

        let tarball = dir.path().join("b.tar.gz");
        let file = File::create(&tarball).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "app/evil", &outside).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "app/evil/planted", b"x".as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = extract_tarball(&tarball, &dir.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!outside.join("planted").exists());
    }

    #[test]
    fn target_must_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("b.tar.gz");
        build_tarball(&tarball, &[("app/cast.json", b"{}", 0o644)]);
        let err = extract_tarball(&tarball, dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = dir.path().join("b.tar.gz");
        fs::write(&tarball, b"definitely not gzip").unwrap();
        assert!(extract_tarball(&tarball, &dir.path().join("out")).is_err());
    }

    #[test]
    fn strip_rules() {
        assert_eq!(strip_top_level(Path::new("app")).unwrap(), None);
        assert_eq!(strip_top_level(Path::new("./app/")).unwrap(), None);
        assert_eq!(
            strip_top_level(Path::new("app/a/b.js")).unwrap(),
            Some(PathBuf::from("a/b.js"))
        );
        assert!(strip_top_level(Path::new("app/../../etc/passwd")).is_err());
        assert!(strip_top_level(Path::new("/etc/passwd")).is_err());
    }
}
