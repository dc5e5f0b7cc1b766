use std::collections::BTreeSet;
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use tempfile::Builder;

use crate::error::CtatError;

pub(crate) const TEMP_PREFIX: &str = ".ctat-dm-";

/// Writes `content` next to `path` and renames it into place.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CtatError> {
    let parent = path
        .parent()
        .ok_or_else(|| CtatError::Filesystem(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CtatError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CtatError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| CtatError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| CtatError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

pub fn dir_names(dir: &Utf8Path) -> Result<BTreeSet<String>, CtatError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("read dir {dir}: {err}")))?;
    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry.map_err(|err| CtatError::Filesystem(err.to_string()))?;
        names.insert(entry.file_name().to_string_lossy().to_string());
    }
    Ok(names)
}

pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, CtatError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(CtatError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<bool, CtatError> {
    if !path.as_std_path().exists() {
        return Ok(false);
    }
    fs::remove_dir_all(path.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("remove {path}: {err}")))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let target = dir.join("record.json");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        let names = dir_names(&dir).unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["record.json"]);
    }

    #[test]
    fn removing_missing_paths_is_not_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        assert!(!remove_file_if_exists(&dir.join("absent.txt")).unwrap());
        assert!(!remove_dir_if_exists(&dir.join("absent")).unwrap());
    }
}
