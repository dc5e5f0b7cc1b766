use std::fs;
use std::path::Component;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::CtatError;

const WRITE_PROBE_SUFFIX: &str = "write_testfile.txt";

pub trait DiskSpace {
    fn available_bytes(&self, path: &Utf8Path) -> Result<u64, CtatError>;
}

/// Bytes available to unprivileged users on the filesystem holding the path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiskSpace;

impl DiskSpace for FsDiskSpace {
    fn available_bytes(&self, path: &Utf8Path) -> Result<u64, CtatError> {
        fs2::available_space(path.as_std_path())
            .map_err(|err| CtatError::Filesystem(format!("statvfs {path}: {err}")))
    }
}

/// Absolute path with the existing prefix resolved through symlinks.
/// The missing tail, if any, is normalized lexically.
pub fn canonical_destination(path: &Utf8Path) -> Result<Utf8PathBuf, CtatError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().map_err(|err| CtatError::Filesystem(err.to_string()))?;
        Utf8PathBuf::from_path_buf(cwd)
            .map_err(|_| CtatError::Filesystem("non-utf8 working directory".to_string()))?
            .join(path)
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    while !existing.as_std_path().exists() {
        match (existing.parent(), existing.components().next_back()) {
            (Some(parent), Some(last)) => {
                missing.push(last.as_str().to_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let resolved = fs::canonicalize(existing.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("canonicalize {existing}: {err}")))?;
    let mut canonical = Utf8PathBuf::from_path_buf(resolved)
        .map_err(|_| CtatError::Filesystem(format!("non-utf8 path: {existing}")))?;
    for name in missing.iter().rev() {
        match Utf8Path::new(name).as_std_path().components().next() {
            Some(Component::ParentDir) => {
                canonical.pop();
            }
            Some(Component::CurDir) | None => {}
            _ => canonical.push(name),
        }
    }
    Ok(canonical)
}

pub fn prepare_destination(
    path: &Utf8Path,
    required_bytes: u64,
    space: &dyn DiskSpace,
) -> Result<Utf8PathBuf, CtatError> {
    let canonical = canonical_destination(path)?;
    if canonical.as_std_path().exists() && !canonical.as_std_path().is_dir() {
        return Err(CtatError::NotADirectory(canonical));
    }

    ensure_available(&canonical, required_bytes, space)?;

    fs::create_dir_all(canonical.as_std_path()).map_err(|err| CtatError::NotWritable {
        path: canonical.clone(),
        message: err.to_string(),
    })?;

    let probe_name = format!(
        "{}.{WRITE_PROBE_SUFFIX}",
        canonical.file_name().unwrap_or("destination")
    );
    let probe = canonical.join(probe_name);
    fs::write(probe.as_std_path(), b"Testing writing to this file.").map_err(|err| {
        CtatError::NotWritable {
            path: canonical.clone(),
            message: err.to_string(),
        }
    })?;
    fs::remove_file(probe.as_std_path()).map_err(|err| CtatError::NotWritable {
        path: canonical.clone(),
        message: err.to_string(),
    })?;

    Ok(canonical)
}

/// Fails unless the device holding `path` (or its nearest existing
/// ancestor) has `required_bytes` available. Zero skips the check.
pub fn ensure_available(
    path: &Utf8Path,
    required_bytes: u64,
    space: &dyn DiskSpace,
) -> Result<(), CtatError> {
    if required_bytes == 0 {
        return Ok(());
    }
    let available = space.available_bytes(nearest_existing(path))?;
    debug!(path = %path, available, required = required_bytes, "checked free space");
    if available < required_bytes {
        return Err(CtatError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required: required_bytes,
        });
    }
    Ok(())
}

fn nearest_existing(path: &Utf8Path) -> &Utf8Path {
    let mut current = path;
    while !current.as_std_path().exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct FullDisk;

    impl DiskSpace for FullDisk {
        fn available_bytes(&self, _path: &Utf8Path) -> Result<u64, CtatError> {
            Ok(0)
        }
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    #[test]
    fn creates_missing_directories_and_is_idempotent() {
        let (_temp, root) = temp_root();
        let target = root.join("a").join("b");

        let first = prepare_destination(&target, 0, &FsDiskSpace).unwrap();
        let second = prepare_destination(&target, 0, &FsDiskSpace).unwrap();

        assert_eq!(first, second);
        assert!(first.is_absolute());
        assert!(first.as_std_path().is_dir());
        assert!(fs::read_dir(first.as_std_path()).unwrap().next().is_none());
    }

    #[test]
    fn rejects_regular_file() {
        let (_temp, root) = temp_root();
        let file = root.join("not_a_dir");
        fs::write(&file, b"x").unwrap();

        let err = prepare_destination(&file, 0, &FsDiskSpace).unwrap_err();
        assert_matches!(err, CtatError::NotADirectory(_));
    }

    #[test]
    fn full_disk_fails_before_anything_is_written() {
        let (_temp, root) = temp_root();
        let target = root.join("fresh");

        let err = prepare_destination(&target, 1, &FullDisk).unwrap_err();
        assert_matches!(
            err,
            CtatError::InsufficientSpace {
                available: 0,
                required: 1,
                ..
            }
        );
        assert!(!target.as_std_path().exists());
    }

    #[test]
    fn missing_tail_is_normalized() {
        let (_temp, root) = temp_root();
        let canonical = canonical_destination(&root.join("x").join("..").join("y")).unwrap();
        assert!(canonical.ends_with("y"));
        assert!(!canonical.as_str().contains(".."));
    }

    #[test]
    fn parent_of_missing_directory_is_created_at_its_resolved_place() {
        let (_temp, root) = temp_root();
        let target = root.join("new").join("..").join("libs");

        let prepared = prepare_destination(&target, 0, &FsDiskSpace).unwrap();
        assert_eq!(prepared, canonical_destination(&root).unwrap().join("libs"));
        assert!(prepared.as_std_path().is_dir());
        assert!(!root.join("new").as_std_path().exists());
    }
}
