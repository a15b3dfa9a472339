//! On-disk staging of function code, layers and bootstrap shims

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A snapshot of one function's code and layers, mounted into its sandboxes.
///
/// The directory is removed when the last holder drops it, which happens once
/// the resolver cache has been invalidated and every sandbox built from it is
/// gone.
#[derive(Debug)]
pub struct StagedLayout {
    root: PathBuf,
    generation: u64,
}

impl StagedLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self) -> PathBuf {
        self.root.join("task")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.root.join("opt")
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for StagedLayout {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                log::debug!("Failed to clean staged layout {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Copy `code_path` into `task/` and merge `layers` into `opt/` under `root`.
/// Nothing under `staging_dir` is copied, since it may sit inside the code
/// tree. Blocking; call from `spawn_blocking`.
pub fn stage(
    root: PathBuf,
    generation: u64,
    code_path: &Path,
    layers: &[PathBuf],
    staging_dir: &Path,
) -> io::Result<StagedLayout> {
    if root.exists() {
        fs::remove_dir_all(&root)?;
    }
    let layout = StagedLayout { root, generation };
    fs::create_dir_all(layout.task_dir())?;
    fs::create_dir_all(layout.opt_dir())?;

    copy_into(code_path, &layout.task_dir(), staging_dir)?;
    for layer in layers {
        copy_into(layer, &layout.opt_dir(), staging_dir)?;
    }
    Ok(layout)
}

/// Copy a file or the contents of a directory into `dest`. Later copies
/// overwrite earlier ones, which gives layers their merge order.
fn copy_into(source: &Path, dest: &Path, skip: &Path) -> io::Result<()> {
    let metadata = fs::metadata(source)?;
    if metadata.is_file() {
        let name = source.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "code path has no file name")
        })?;
        fs::copy(source, dest.join(name))?;
        return Ok(());
    }
    copy_dir(source, dest, skip)
}

fn copy_dir(source: &Path, dest: &Path, skip: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        if path.starts_with(skip) || entry.file_name() == ".git" {
            continue;
        }
        let target = dest.join(entry.file_name());
        let metadata = fs::metadata(&path)?;
        if metadata.is_dir() {
            copy_dir(&path, &target, skip)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

/// Write `contents` to `path` unless it already holds exactly that content.
/// Uses write-then-rename so concurrent writers never expose a partial file.
pub fn write_if_changed(path: &Path, contents: &str) -> io::Result<()> {
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == contents {
            return Ok(());
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stage_copies_code_and_merges_layers_in_order() {
        let src = tempdir().unwrap();
        let code = src.path().join("code");
        fs::create_dir_all(code.join("pkg")).unwrap();
        fs::write(code.join("app.py"), "def handler(e, c): return e").unwrap();
        fs::write(code.join("pkg").join("util.py"), "X = 1").unwrap();

        let base = src.path().join("layer-a");
        let overlay = src.path().join("layer-b");
        fs::create_dir_all(base.join("python")).unwrap();
        fs::create_dir_all(overlay.join("python")).unwrap();
        fs::write(base.join("python").join("shared.py"), "V = 'a'").unwrap();
        fs::write(base.join("python").join("only_a.py"), "").unwrap();
        fs::write(overlay.join("python").join("shared.py"), "V = 'b'").unwrap();

        let staging = tempdir().unwrap();
        let root = staging.path().join("fn").join("0");
        let layout = stage(root.clone(), 0, &code, &[base, overlay], staging.path()).unwrap();

        assert!(layout.task_dir().join("app.py").is_file());
        assert!(layout.task_dir().join("pkg").join("util.py").is_file());
        assert_eq!(
            fs::read_to_string(layout.opt_dir().join("python").join("shared.py")).unwrap(),
            "V = 'b'"
        );
        assert!(layout.opt_dir().join("python").join("only_a.py").is_file());

        drop(layout);
        assert!(!root.exists());
    }

    #[test]
    fn test_stage_single_file_code() {
        let src = tempdir().unwrap();
        let file = src.path().join("index.js");
        fs::write(&file, "exports.handler = async (e) => e;").unwrap();

        let staging = tempdir().unwrap();
        let layout = stage(staging.path().join("s"), 3, &file, &[], staging.path()).unwrap();
        assert!(layout.task_dir().join("index.js").is_file());
        assert_eq!(layout.generation(), 3);
    }

    #[test]
    fn test_stage_skips_staging_dir_nested_in_code() {
        let code = tempdir().unwrap();
        fs::write(code.path().join("app.py"), "").unwrap();
        let staging = code.path().join(".localfn");
        // Another runtime's shim and an older generation already live there.
        let shim = staging.join("runtimes").join("python3.12");
        fs::create_dir_all(&shim).unwrap();
        fs::write(shim.join("bootstrap.py"), "").unwrap();
        let older = stage(staging.join("fn").join("0"), 0, code.path(), &[], &staging).unwrap();

        let layout = stage(staging.join("fn").join("1"), 1, code.path(), &[], &staging).unwrap();
        assert!(layout.task_dir().join("app.py").is_file());
        assert!(!layout.task_dir().join(".localfn").exists());
        assert!(!older.task_dir().join(".localfn").exists());
    }

    #[test]
    fn test_stage_missing_source_fails() {
        let staging = tempdir().unwrap();
        let result = stage(
            staging.path().join("s"),
            0,
            Path::new("/definitely/not/here"),
            &[],
            staging.path(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_write_if_changed_and_sanitize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rt").join("bootstrap.py");
        write_if_changed(&path, "one").unwrap();
        write_if_changed(&path, "one").unwrap();
        write_if_changed(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");

        assert_eq!(sanitize_component("$LATEST"), "_LATEST");
        assert_eq!(sanitize_component("my fn/x"), "my_fn_x");
        assert_eq!(sanitize_component(".."), "_");
    }
}
