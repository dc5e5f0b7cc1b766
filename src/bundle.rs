//! Single-archive resources: the centrifuge index and the lncRNA annotations.
//!
//! Both are fetched into `<destination>/<root>` and unpacked in place under
//! one `Download` marker, which is only written once the unpacked contents
//! pass a file-count check.

use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::app::{App, ProgressEvent, ProgressSink, RunResult, StageReport, phase, report};
use crate::checksum::verify_remote_md5;
use crate::command::CommandRunner;
use crate::destination::{DiskSpace, canonical_destination, ensure_available, prepare_destination};
use crate::domain::{Stage, logical_name, resolve_url, source_file_name};
use crate::error::CtatError;
use crate::extract::unpack_archive;
use crate::fetch::{Fetcher, download_file};
use crate::fs_util::{dir_names, remove_file_if_exists};
use crate::registry::{DataManagerRecord, TableRow, display_name};
use crate::stage::{Completed, StageGuard, is_guard_file};

pub const LNCRNA_CONFIG_FILE: &str = "annotations.config";
pub const LNCRNA_GENOMES: [&str; 4] = ["mm9", "mm10", "hg19", "hg38"];

const CENTRIFUGE_MIN_FILES: usize = 3;
const LNCRNA_MIN_FILES: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct CentrifugeRequest {
    pub download_url: Option<String>,
    pub destination: Utf8PathBuf,
    pub display_name: Option<String>,
    pub force_download: bool,
    pub no_download: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LncrnaRequest {
    pub download_url: Option<String>,
    pub destination: Utf8PathBuf,
    pub force_download: bool,
    pub no_download: bool,
}

#[derive(Debug, Clone, Copy)]
enum Contents {
    /// At least this many entries whose names contain the root name.
    NamedAfterRoot(usize),
    AtLeast(usize),
}

struct Bundle<'a> {
    url: &'a str,
    required_bytes: u64,
    strip_components: usize,
    contents: Contents,
}

fn content_entries(dir: &Utf8Path, archive_name: &str) -> Result<Vec<String>, CtatError> {
    Ok(dir_names(dir)?
        .into_iter()
        .filter(|name| !is_guard_file(name) && name != archive_name)
        .collect())
}

fn validate_contents(
    dir: &Utf8Path,
    root: &str,
    archive_name: &str,
    contents: Contents,
) -> Result<(), CtatError> {
    let entries = content_entries(dir, archive_name)?;
    let (found, needed) = match contents {
        Contents::NamedAfterRoot(needed) => (
            entries.iter().filter(|name| name.contains(root)).count(),
            needed,
        ),
        Contents::AtLeast(needed) => (entries.len(), needed),
    };
    if found < needed {
        return Err(CtatError::Lookup(format!(
            "could not find the extracted files in {dir}: found {found} of at least {needed} ({})",
            entries.join(", ")
        )));
    }
    Ok(())
}

/// `<destination>/<root>` unless the destination already ends with `root`.
pub fn bundle_directory(destination: &Utf8Path, root: &str) -> Result<Utf8PathBuf, CtatError> {
    let canonical = canonical_destination(destination)?;
    if canonical.file_name() == Some(root) {
        Ok(canonical)
    } else {
        Ok(canonical.join(root))
    }
}

fn existing_directory(path: &Utf8Path, what: &str) -> Result<Utf8PathBuf, CtatError> {
    let canonical = canonical_destination(path)?;
    if !canonical.as_std_path().exists() {
        return Err(CtatError::Lookup(format!(
            "cannot find the {what}, the directory does not exist: {canonical}"
        )));
    }
    if !canonical.as_std_path().is_dir() {
        return Err(CtatError::NotADirectory(canonical));
    }
    Ok(canonical)
}

impl<F: Fetcher, R: CommandRunner, S: DiskSpace> App<F, R, S> {
    fn fetch_bundle(
        &self,
        bundle: &Bundle<'_>,
        destination: &Utf8Path,
        force: bool,
        result_stages: &mut Vec<StageReport>,
    ) -> Result<(Utf8PathBuf, String), CtatError> {
        let archive_name = source_file_name(bundle.url)?;
        let root = logical_name(&archive_name).to_string();
        let dest = prepare_destination(&bundle_directory(destination, &root)?, 0, &self.space)?;

        let guard = StageGuard::new(&dest, &root, Stage::Download);
        let outcome = guard.run(force, || {
            ensure_available(&dest, bundle.required_bytes, &self.space)?;
            let archive = download_file(
                &self.fetcher,
                &self.space,
                bundle.url,
                &dest,
                !force,
                self.settings.download_block_size,
            )?;
            verify_remote_md5(&self.fetcher, bundle.url, &archive)?;
            unpack_archive(&archive, &dest, bundle.strip_components)?;
            if remove_file_if_exists(&archive)? {
                info!(archive = %archive, "removed archive");
            }
            validate_contents(&dest, &root, &archive_name, bundle.contents)?;
            Ok(Completed::new(())
                .detail(format!("downloaded and extracted {}", bundle.url))
                .output(dest.as_str()))
        })?;
        report(result_stages, Stage::Download, bundle.url, &outcome);
        Ok((dest, root))
    }

    pub fn centrifuge(
        &self,
        request: &CentrifugeRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, CtatError> {
        let started = Instant::now();
        let mut stages = Vec::new();
        let url = match &request.download_url {
            Some(raw) => resolve_url(raw, &self.settings.centrifuge_url)?,
            None => self.settings.centrifuge_url.clone(),
        };

        let (index_dir, root) = if request.no_download {
            let root = logical_name(&source_file_name(&url)?).to_string();
            (existing_directory(&request.destination, "centrifuge index")?, root)
        } else {
            phase(sink, format!("phase=Download; {url}"));
            self.fetch_bundle(
                &Bundle {
                    url: &url,
                    required_bytes: self.settings.thresholds.centrifuge_index,
                    strip_components: 0,
                    contents: Contents::NamedAfterRoot(CENTRIFUGE_MIN_FILES),
                },
                &request.destination,
                request.force_download,
                &mut stages,
            )?
        };
        info!(path = %index_dir, "centrifuge index located");

        let name = match request.display_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => display_name(&self.settings.display_prefixes.centrifuge, &root),
        };
        let mut record = DataManagerRecord::new();
        record.add_row(
            &self.settings.tables.centrifuge,
            TableRow::new(root, name).with_path(index_dir.as_str()),
        );
        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(RunResult { record, stages })
    }

    pub fn lncrna(
        &self,
        request: &LncrnaRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, CtatError> {
        let started = Instant::now();
        let mut stages = Vec::new();
        let url = match &request.download_url {
            Some(raw) => resolve_url(raw, &self.settings.lncrna_url)?,
            None => self.settings.lncrna_url.clone(),
        };

        let annotations_dir = if request.no_download {
            let dir = existing_directory(&request.destination, "lncRNA annotations")?;
            let entries = content_entries(&dir, &source_file_name(&url)?)?;
            if entries.len() != LNCRNA_MIN_FILES {
                return Err(CtatError::Lookup(format!(
                    "{dir} holds {} entries, expected exactly {LNCRNA_MIN_FILES}",
                    entries.len()
                )));
            }
            dir
        } else {
            phase(sink, format!("phase=Download; {url}"));
            self.fetch_bundle(
                &Bundle {
                    url: &url,
                    required_bytes: self.settings.thresholds.lncrna_annotations,
                    strip_components: 1,
                    contents: Contents::AtLeast(LNCRNA_MIN_FILES),
                },
                &request.destination,
                request.force_download,
                &mut stages,
            )?
            .0
        };
        info!(path = %annotations_dir, "lncRNA annotations located");

        let config = annotations_dir.join(LNCRNA_CONFIG_FILE);
        let mut record = DataManagerRecord::new();
        for genome in LNCRNA_GENOMES {
            record.add_row(
                &self.settings.tables.lncrna,
                TableRow::new(genome, genome).with_path(config.as_str()),
            );
        }
        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(RunResult { record, stages })
    }
}
