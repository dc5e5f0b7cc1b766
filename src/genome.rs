//! Genome identity and library layout on disk.
//!
//! CTAT library directories are named after the genome they hold, e.g.
//! `GRCh38_v27_CTAT_lib_Feb092018` or `Mouse_M16_CTAT_lib_Feb202018`. The
//! name is recovered from paths and URLs by prefix matching, which is a
//! heuristic: callers get a [`GenomeMatch`] and must decide what an unknown
//! genome means for them.

use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::destination::canonical_destination;
use crate::error::CtatError;

pub const BUILD_DIR_NAME: &str = "ctat_genome_lib_build_dir";
pub const REF_GENOME_FILE: &str = "ref_genome.fa";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenomeName(String);

impl GenomeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GenomeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenomeMatch {
    Found(GenomeName),
    NotFound,
}

impl GenomeMatch {
    pub fn required(self, path: &str) -> Result<GenomeName, CtatError> {
        match self {
            GenomeMatch::Found(name) => Ok(name),
            GenomeMatch::NotFound => Err(CtatError::Lookup(format!(
                "cannot find a genome name in the path: {path}"
            ))),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, GenomeMatch::Found(_))
    }
}

/// Scans `/`-separated segments; the last one starting with a known prefix
/// wins, with everything from its first `.` removed.
pub fn find_genome_name(path: &str, prefixes: &[String]) -> GenomeMatch {
    let mut found = GenomeMatch::NotFound;
    for segment in path.split('/') {
        if prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && segment.starts_with(prefix.as_str()))
        {
            let name = segment.split('.').next().unwrap_or(segment);
            if !name.is_empty() {
                found = GenomeMatch::Found(GenomeName(name.to_string()));
            }
        }
    }
    found
}

pub fn build_directory_from_build_location(
    source: &str,
    build_location: &Utf8Path,
    prefixes: &[String],
) -> Utf8PathBuf {
    let genome = match find_genome_name(source, prefixes) {
        GenomeMatch::Found(name) => GenomeMatch::Found(name),
        GenomeMatch::NotFound => find_genome_name(build_location.as_str(), prefixes),
    };
    let basename = build_location.file_name().unwrap_or_default();
    match genome {
        GenomeMatch::Found(name) if basename == name.as_str() => build_location.join(BUILD_DIR_NAME),
        _ if basename == BUILD_DIR_NAME => build_location.to_path_buf(),
        GenomeMatch::NotFound => build_location.join(BUILD_DIR_NAME),
        GenomeMatch::Found(name) => build_location.join(name.as_str()).join(BUILD_DIR_NAME),
    }
}

/// Locates the built library under `top`: a `ctat_genome_lib_build_dir`
/// at most two levels down, else a unique directory holding `ref_genome.fa`.
pub fn search_for_genome_build_dir(top: &Utf8Path) -> Result<Utf8PathBuf, CtatError> {
    if !top.as_std_path().exists() {
        return Err(CtatError::Lookup(format!(
            "cannot find the CTAT genome resource library, the directory does not exist: {top}"
        )));
    }
    let top = canonical_destination(top)?;
    if !top.as_std_path().is_dir() {
        return Err(CtatError::NotADirectory(top));
    }

    if top.file_name() == Some(BUILD_DIR_NAME) {
        return Ok(top);
    }
    if top.join(BUILD_DIR_NAME).as_std_path().is_dir() {
        return Ok(top.join(BUILD_DIR_NAME));
    }

    let mut build_dirs_1 = Vec::new();
    let mut genome_dirs_1 = Vec::new();
    let mut build_dirs_2 = Vec::new();
    let mut genome_dirs_2 = Vec::new();
    for subdir in subdirectories(&top)? {
        if subdir.join(BUILD_DIR_NAME).as_std_path().is_dir() {
            build_dirs_1.push(subdir.join(BUILD_DIR_NAME));
        }
        if subdir.join(REF_GENOME_FILE).as_std_path().exists() {
            genome_dirs_1.push(subdir.clone());
        }
        for sub_subdir in subdirectories(&subdir)? {
            if sub_subdir.join(BUILD_DIR_NAME).as_std_path().is_dir() {
                build_dirs_2.push(sub_subdir.join(BUILD_DIR_NAME));
            }
            if sub_subdir.join(REF_GENOME_FILE).as_std_path().exists() {
                genome_dirs_2.push(sub_subdir);
            }
        }
    }

    let found = if build_dirs_1.len() + build_dirs_2.len() > 1 {
        return Err(CtatError::Lookup(format!(
            "found multiple CTAT genome resource libraries in {top}"
        )));
    } else if let Some(dir) = build_dirs_1.pop().or_else(|| build_dirs_2.pop()) {
        dir
    } else if genome_dirs_1.len() + genome_dirs_2.len() > 1 {
        return Err(CtatError::Lookup(format!(
            "found several directories containing {REF_GENOME_FILE} in {top}, cannot choose a library"
        )));
    } else if let Some(dir) = genome_dirs_2.pop().or_else(|| genome_dirs_1.pop()) {
        warn!(path = %dir, "no {BUILD_DIR_NAME} found, using the directory holding {REF_GENOME_FILE}");
        dir
    } else if top.join(REF_GENOME_FILE).as_std_path().exists() {
        warn!(path = %top, "no {BUILD_DIR_NAME} found, using the directory holding {REF_GENOME_FILE}");
        top.clone()
    } else {
        return Err(CtatError::Lookup(format!(
            "unable to find a CTAT genome resource library in {top}"
        )));
    };

    if !found.join(REF_GENOME_FILE).as_std_path().exists() {
        warn!(path = %found, "library directory has no {REF_GENOME_FILE}");
    }
    Ok(found)
}

fn subdirectories(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, CtatError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("read dir {dir}: {err}")))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| CtatError::Filesystem(err.to_string()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
