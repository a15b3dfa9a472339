//! Content fingerprints of function source trees

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Files up to this size are hashed by content as well as metadata, so an
/// edit that keeps size and mtime still registers.
const CONTENT_HASH_LIMIT: u64 = 256 * 1024;

/// SHA-256 over every file under `root` (relative path, size, mtime and, for
/// small files, content). `None` when `root` does not exist. Paths in `skip`
/// and `.git` directories are left out. Blocking.
pub fn fingerprint(root: &Path, skip: &[PathBuf]) -> io::Result<Option<String>> {
    let metadata = match fs::metadata(root) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    if metadata.is_file() {
        files.push((PathBuf::new(), root.to_path_buf()));
    } else {
        collect_files(root, root, skip, &mut files)?;
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (relative, path) in files {
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            // Deleted between listing and hashing; the next poll sees it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(metadata.len().to_le_bytes());
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        hasher.update(mtime.to_le_bytes());
        if metadata.len() <= CONTENT_HASH_LIMIT {
            match fs::read(&path) {
                Ok(content) => hasher.update(&content),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(Some(format!("{:x}", hasher.finalize())))
}

fn collect_files(
    root: &Path,
    dir: &Path,
    skip: &[PathBuf],
    files: &mut Vec<(PathBuf, PathBuf)>,
) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name() == ".git" || skip.iter().any(|s| path.starts_with(s)) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, skip, files)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.push((relative, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_tracks_edits_additions_and_deletions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("app.py"), "return 1").unwrap();
        let first = fingerprint(dir.path(), &[]).unwrap().unwrap();
        assert_eq!(fingerprint(dir.path(), &[]).unwrap().unwrap(), first);

        // Same length, so only the content hash can tell them apart.
        fs::write(dir.path().join("app.py"), "return 2").unwrap();
        let edited = fingerprint(dir.path(), &[]).unwrap().unwrap();
        assert_ne!(edited, first);

        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib").join("util.py"), "").unwrap();
        let added = fingerprint(dir.path(), &[]).unwrap().unwrap();
        assert_ne!(added, edited);

        fs::remove_file(dir.path().join("lib").join("util.py")).unwrap();
        assert_ne!(fingerprint(dir.path(), &[]).unwrap().unwrap(), added);
    }

    #[test]
    fn test_fingerprint_ignores_skipped_paths_and_git() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("index.js"), "x").unwrap();
        let base = fingerprint(dir.path(), &[]).unwrap();

        let staging = dir.path().join(".localfn");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("cache"), "noise").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), "ref").unwrap();

        assert_eq!(fingerprint(dir.path(), &[staging]).unwrap(), base);
    }

    #[test]
    fn test_missing_root_has_no_fingerprint() {
        assert_eq!(fingerprint(Path::new("/no/such/tree"), &[]).unwrap(), None);
    }
}
