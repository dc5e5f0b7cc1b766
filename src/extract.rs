//! Archive unpacking and extracted-root discovery.
//!
//! Entries are written natively (tar + flate2, zip). Paths are checked before
//! anything touches the disk: absolute paths, `..` components and link
//! targets leaving the destination abort the extraction.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::destination::{DiskSpace, ensure_available, prepare_destination};
use crate::domain::Stage;
use crate::error::CtatError;
use crate::fs_util::{dir_names, remove_file_if_exists};
use crate::stage::{Completed, StageGuard, StageOutcome, is_guard_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn detect(name: &str) -> Result<Self, CtatError> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else if lower.ends_with(".zip") {
            Ok(ArchiveFormat::Zip)
        } else {
            Err(CtatError::Archive(format!("unsupported archive format: {name}")))
        }
    }
}

pub fn is_archive(name: &str) -> bool {
    ArchiveFormat::detect(name).is_ok()
}

pub fn unpack_archive(
    archive: &Utf8Path,
    dest: &Utf8Path,
    strip_components: usize,
) -> Result<(), CtatError> {
    let format = ArchiveFormat::detect(archive.as_str())?;
    let file = File::open(archive.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("open {archive}: {err}")))?;
    fs::create_dir_all(dest.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("create {dest}: {err}")))?;
    info!(archive = %archive, dest = %dest, "extracting");
    match format {
        ArchiveFormat::TarGz => unpack_tar(
            GzDecoder::new(BufReader::new(file)),
            dest.as_std_path(),
            strip_components,
        ),
        ArchiveFormat::Tar => unpack_tar(BufReader::new(file), dest.as_std_path(), strip_components),
        ArchiveFormat::Zip => unpack_zip(file, dest.as_std_path(), strip_components),
    }
}

fn stripped(path: &Path, strip_components: usize) -> Result<Option<PathBuf>, CtatError> {
    let mut out = PathBuf::new();
    let mut skipped = 0;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                if skipped < strip_components {
                    skipped += 1;
                } else {
                    out.push(part);
                }
            }
            _ => {
                return Err(CtatError::Archive(format!(
                    "entry escapes the destination: {}",
                    path.display()
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(out))
}

fn check_link_target(relative: &Path, target: &Path) -> Result<(), CtatError> {
    let mut depth = relative.components().count().saturating_sub(1) as isize;
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => depth -= 1,
            _ => depth = -1,
        }
        if depth < 0 {
            return Err(CtatError::Archive(format!(
                "link escapes the destination: {} -> {}",
                relative.display(),
                target.display()
            )));
        }
    }
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, dest: &Path, strip_components: usize) -> Result<(), CtatError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|err| CtatError::Archive(err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| CtatError::Archive(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| CtatError::Archive(err.to_string()))?
            .into_owned();
        let Some(relative) = stripped(&path, strip_components)? else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|err| CtatError::Archive(err.to_string()))?
                .ok_or_else(|| {
                    CtatError::Archive(format!("link without target: {}", path.display()))
                })?
                .into_owned();
            if entry_type.is_hard_link() {
                // Hard link targets are archive paths, not relative to the entry.
                let Some(target) = stripped(&target, strip_components)? else {
                    continue;
                };
                let source = dest.join(&target);
                let full = dest.join(&relative);
                create_parent(&full)?;
                match fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        return Err(CtatError::Archive(format!(
                            "replace {}: {err}",
                            full.display()
                        )));
                    }
                }
                fs::hard_link(&source, &full).map_err(|err| {
                    CtatError::Archive(format!("link {}: {err}", full.display()))
                })?;
                continue;
            }
            check_link_target(&relative, &target)?;
        }

        let full = dest.join(&relative);
        create_parent(&full)?;
        entry
            .unpack(&full)
            .map_err(|err| CtatError::Archive(format!("unpack {}: {err}", path.display())))?;
    }
    Ok(())
}

fn unpack_zip(file: File, dest: &Path, strip_components: usize) -> Result<(), CtatError> {
    let mut archive =
        ZipArchive::new(file).map_err(|err| CtatError::Archive(err.to_string()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| CtatError::Archive(err.to_string()))?;
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(CtatError::Archive(format!(
                "entry escapes the destination: {}",
                entry.name()
            )));
        };
        let Some(relative) = stripped(&enclosed, strip_components)? else {
            continue;
        };
        let full = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&full)
                .map_err(|err| CtatError::Filesystem(err.to_string()))?;
            continue;
        }
        create_parent(&full)?;
        let mut out = File::create(&full)
            .map_err(|err| CtatError::Filesystem(format!("create {}: {err}", full.display())))?;
        io::copy(&mut entry, &mut out).map_err(|err| CtatError::Archive(err.to_string()))?;
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<(), CtatError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| CtatError::Filesystem(format!("create {}: {err}", parent.display())))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub archive: &'a Utf8Path,
    pub dest: &'a Utf8Path,
    /// Directory name the archive is expected to produce.
    pub expected: &'a str,
    pub strip_components: usize,
    pub required_bytes: u64,
    pub force: bool,
    pub delete_archive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub root: Utf8PathBuf,
    /// False when a previous extraction was reused.
    pub ran: bool,
}

pub fn extract_archive(
    request: &ExtractRequest<'_>,
    space: &dyn DiskSpace,
) -> Result<Extracted, CtatError> {
    let archive_name = request
        .archive
        .file_name()
        .ok_or_else(|| CtatError::Archive(format!("not an archive path: {}", request.archive)))?;
    let dest = prepare_destination(request.dest, 0, space)?;
    let guard = StageGuard::new(&dest, archive_name, Stage::Extract);

    let outcome = guard.run(request.force, || {
        if !request.archive.as_std_path().is_file() {
            return Err(CtatError::Lookup(format!(
                "archive to extract does not exist: {}",
                request.archive
            )));
        }
        ensure_available(&dest, request.required_bytes, space)?;
        let before = dir_names(&dest)?;
        unpack_archive(request.archive, &dest, request.strip_components)?;
        let after = dir_names(&dest)?;
        let root = resolve_extracted_root(&dest, &before, &after, request.expected, archive_name)?;
        Ok(Completed::new(root.clone())
            .detail(format!("extracted {archive_name}"))
            .output(root.as_str()))
    })?;

    let extracted = match outcome {
        StageOutcome::Ran(root) => Extracted { root, ran: true },
        StageOutcome::Skipped(record) => Extracted {
            root: record
                .output
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| dest.join(request.expected)),
            ran: false,
        },
    };

    if request.delete_archive && remove_file_if_exists(request.archive)? {
        info!(archive = %request.archive, "removed archive");
    }
    Ok(extracted)
}

pub fn resolve_extracted_root(
    dest: &Utf8Path,
    before: &BTreeSet<String>,
    after: &BTreeSet<String>,
    expected: &str,
    archive_name: &str,
) -> Result<Utf8PathBuf, CtatError> {
    let new: Vec<&String> = after
        .difference(before)
        .filter(|name| !is_guard_file(name) && name.as_str() != archive_name)
        .collect();

    if new.iter().any(|name| name.as_str() == expected) {
        return Ok(dest.join(expected));
    }
    if let [only] = new.as_slice() {
        warn!(expected, found = %only, "archive produced a differently named root");
        return Ok(dest.join(only.as_str()));
    }
    let named_dirs: Vec<&&String> = new
        .iter()
        .filter(|name| archive_name.contains(name.as_str()))
        .filter(|name| dest.join(name.as_str()).as_std_path().is_dir())
        .collect();
    if let [only] = named_dirs.as_slice() {
        return Ok(dest.join(only.as_str()));
    }
    if after.contains(expected) {
        return Ok(dest.join(expected));
    }
    Err(CtatError::Lookup(format!(
        "cannot tell which directory {archive_name} extracted into under {dest}"
    )))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    pub(crate) fn write_tar_gz(path: &Utf8Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *body).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    struct Plenty;

    impl DiskSpace for Plenty {
        fn available_bytes(&self, _path: &Utf8Path) -> Result<u64, CtatError> {
            Ok(u64::MAX)
        }
    }

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn strips_leading_components() {
        let (_temp, dir) = temp_dir();
        let archive = dir.join("annotations.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("annotations/hg19/lncrna.gtf", b"gtf"),
                ("annotations/annotations.config", b"cfg"),
            ],
        );
        let dest = dir.join("out");

        unpack_archive(&archive, &dest, 1).unwrap();

        assert_eq!(fs::read(dest.join("hg19/lncrna.gtf")).unwrap(), b"gtf");
        assert!(dest.join("annotations.config").as_std_path().is_file());
    }

    #[test]
    fn rejects_parent_components() {
        assert_matches!(
            stripped(Path::new("../evil"), 0),
            Err(CtatError::Archive(_))
        );
        assert_matches!(
            check_link_target(Path::new("a/link"), Path::new("../../etc/passwd")),
            Err(CtatError::Archive(_))
        );
        assert!(check_link_target(Path::new("a/link"), Path::new("../b")).is_ok());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert_matches!(
            ArchiveFormat::detect("lib.rar"),
            Err(CtatError::Archive(_))
        );
        assert_eq!(ArchiveFormat::detect("x.TGZ").unwrap(), ArchiveFormat::TarGz);
    }

    #[test]
    fn extracts_once_and_finds_root() {
        let (_temp, dir) = temp_dir();
        let archive = dir.join("GRCh38_v27_CTAT_lib_Feb092018.plug-n-play.tar.gz");
        write_tar_gz(
            &archive,
            &[("GRCh38_v27_CTAT_lib_Feb092018/ctat_genome_lib_build_dir/ref_genome.fa", b">1\n")],
        );
        let dest = dir.join("libs");
        let request = ExtractRequest {
            archive: &archive,
            dest: &dest,
            expected: "GRCh38_v27_CTAT_lib_Feb092018",
            strip_components: 0,
            required_bytes: 0,
            force: false,
            delete_archive: false,
        };

        let first = extract_archive(&request, &Plenty).unwrap();
        assert!(first.ran);
        assert!(first.root.ends_with("GRCh38_v27_CTAT_lib_Feb092018"));

        fs::remove_file(&archive).unwrap();
        let second = extract_archive(&request, &Plenty).unwrap();
        assert!(!second.ran);
        assert_eq!(first.root, second.root);
    }

    #[test]
    fn forced_reextraction_replaces_hard_links() {
        let (_temp, dir) = temp_dir();
        let archive = dir.join("lib.tar.gz");
        let file = File::create(&archive).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "lib/a.txt", &b"hello"[..]).unwrap();
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Link);
        link.set_size(0);
        link.set_mode(0o644);
        builder.append_link(&mut link, "lib/b.txt", "lib/a.txt").unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.join("out");
        let mut request = ExtractRequest {
            archive: &archive,
            dest: &dest,
            expected: "lib",
            strip_components: 0,
            required_bytes: 0,
            force: false,
            delete_archive: false,
        };
        extract_archive(&request, &Plenty).unwrap();

        request.force = true;
        let again = extract_archive(&request, &Plenty).unwrap();
        assert!(again.ran);
        assert_eq!(fs::read(dest.join("lib/b.txt")).unwrap(), b"hello");
    }

    #[test]
    fn single_unexpected_root_is_accepted() {
        let dest = Utf8Path::new("/d");
        let root = resolve_extracted_root(
            dest,
            &names(&[]),
            &names(&["GRCh38_lib_renamed"]),
            "GRCh38_lib",
            "GRCh38_lib.plug-n-play.tar.gz",
        )
        .unwrap();
        assert_eq!(root, Utf8PathBuf::from("/d/GRCh38_lib_renamed"));
    }

    #[test]
    fn unrelated_new_files_do_not_hide_expected_root() {
        let dest = Utf8Path::new("/d");
        let root = resolve_extracted_root(
            dest,
            &names(&["old"]),
            &names(&["old", "lib", "stray.log", "lib.tar.gz.extraction_succeeded.txt"]),
            "lib",
            "lib.tar.gz",
        )
        .unwrap();
        assert_eq!(root, Utf8PathBuf::from("/d/lib"));
    }

    #[test]
    fn existing_root_is_reused_on_reextraction() {
        let dest = Utf8Path::new("/d");
        let root = resolve_extracted_root(dest, &names(&["lib"]), &names(&["lib"]), "lib", "lib.tar.gz")
            .unwrap();
        assert_eq!(root, Utf8PathBuf::from("/d/lib"));
    }

    #[test]
    fn ambiguous_listing_is_a_lookup_error() {
        let dest = Utf8Path::new("/d");
        let err = resolve_extracted_root(
            dest,
            &names(&[]),
            &names(&["x", "y"]),
            "lib",
            "lib.tar.gz",
        )
        .unwrap_err();
        assert_matches!(err, CtatError::Lookup(_));
    }
}
