use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::checksum::verify_remote_md5;
use crate::command::{CommandRunner, ExternalStage, run_external_stage};
use crate::config::Settings;
use crate::destination::{DiskSpace, canonical_destination, ensure_available, prepare_destination};
use crate::domain::{LibraryType, Stage, logical_name, resolve_url, source_file_name};
use crate::error::CtatError;
use crate::extract::{ExtractRequest, extract_archive, is_archive};
use crate::fetch::{Fetcher, download_file};
use crate::fs_util::dir_names;
use crate::genome::{
    BUILD_DIR_NAME, GenomeMatch, build_directory_from_build_location, find_genome_name,
    search_for_genome_build_dir,
};
use crate::registry::{DataManagerRecord, TableRow, display_name, load_cravat_tissues, unique_id};
use crate::stage::{Completed, StageGuard, StageOutcome, is_guard_file};
use crate::stages::{GmapBuild, MutationIntegration, PrepGenomeLib, gmap_marker_key};

pub const DEFAULT_GENOME: &str = "Unspecified_Genome";

#[derive(Debug, Clone, Default)]
pub struct GenomeLibRequest {
    pub download_url: Option<String>,
    pub download_location: Option<Utf8PathBuf>,
    pub source_location: Option<Utf8PathBuf>,
    pub build_location: Option<Utf8PathBuf>,
    pub display_name: Option<String>,
    pub gmap_build: bool,
    pub force_gmap_build: bool,
    pub mutation_url: Option<String>,
    pub new_mutation_download: bool,
    pub new_mutation_integration: bool,
    pub cosmic_location: Option<Utf8PathBuf>,
    pub cravat_tissues: Option<Utf8PathBuf>,
    pub new_archive_download: bool,
    pub keep_archive: bool,
    pub new_library_build: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub target: String,
    pub action: StageAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub record: DataManagerRecord,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub(crate) fn phase(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

pub(crate) fn report<T>(
    stages: &mut Vec<StageReport>,
    stage: Stage,
    target: impl Into<String>,
    outcome: &StageOutcome<T>,
) {
    stages.push(StageReport {
        stage,
        target: target.into(),
        action: if outcome.ran() {
            StageAction::Ran
        } else {
            StageAction::Skipped
        },
    });
}

#[derive(Clone)]
pub struct App<F: Fetcher, R: CommandRunner, S: DiskSpace> {
    pub(crate) settings: Settings,
    pub(crate) fetcher: F,
    pub(crate) runner: R,
    pub(crate) space: S,
}

/// Where a genome-lib archive ended up once unpacked.
struct Unpacked {
    extracted: Utf8PathBuf,
    source_dir: Option<Utf8PathBuf>,
    build_dir: Utf8PathBuf,
}

impl<F: Fetcher, R: CommandRunner, S: DiskSpace> App<F, R, S> {
    pub fn new(settings: Settings, fetcher: F, runner: R, space: S) -> Self {
        Self {
            settings,
            fetcher,
            runner,
            space,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn download_guarded(
        &self,
        url: &str,
        dest: &Utf8Path,
        stage: Stage,
        force: bool,
        stages: &mut Vec<StageReport>,
    ) -> Result<Utf8PathBuf, CtatError> {
        let file_name = source_file_name(url)?;
        let guard = StageGuard::new(dest, &file_name, stage);
        let outcome = guard.run(force, || {
            let path = download_file(
                &self.fetcher,
                &self.space,
                url,
                dest,
                !force,
                self.settings.download_block_size,
            )?;
            verify_remote_md5(&self.fetcher, url, &path)?;
            Ok(Completed::new(path.clone())
                .detail(format!("downloaded {url}"))
                .output(path.as_str()))
        })?;
        report(stages, stage, url, &outcome);
        Ok(match outcome {
            StageOutcome::Ran(path) => path,
            StageOutcome::Skipped(record) => record
                .output
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| dest.join(&file_name)),
        })
    }

    pub fn genome_lib(
        &self,
        request: &GenomeLibRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, CtatError> {
        let started = Instant::now();
        let prefixes = &self.settings.genome_prefixes;
        let thresholds = &self.settings.thresholds;
        let mut stages = Vec::new();

        if request.download_url.is_some() && request.source_location.is_some() {
            return Err(CtatError::Config(
                "--source-location cannot be combined with --download-url".to_string(),
            ));
        }
        if request.download_url.is_none()
            && request.source_location.is_none()
            && request.build_location.is_none()
        {
            return Err(CtatError::Config(
                "at least one of --download-url, --source-location or --build-location is required"
                    .to_string(),
            ));
        }

        let mut download_url = None;
        let mut extracted_dir = None;
        let mut source_dir = None;
        let mut build_dir = None;

        if let Some(raw) = &request.download_url {
            let Some(download_location) = &request.download_location else {
                return Err(CtatError::Config(
                    "--download-url requires --download-location".to_string(),
                ));
            };
            let url = resolve_url(raw, &self.settings.resource_lib_base_url)?;
            find_genome_name(&url, prefixes).required(&url)?;

            phase(sink, format!("phase=Download; {url}"));
            let dest = prepare_destination(download_location, 0, &self.space)?;
            let archive = self.download_guarded(
                &url,
                &dest,
                Stage::Download,
                request.new_archive_download,
                &mut stages,
            )?;

            let unpacked = self.unpack_library(
                &archive,
                &dest,
                request,
                !request.keep_archive,
                &mut stages,
                sink,
            )?;
            extracted_dir = Some(unpacked.extracted);
            source_dir = unpacked.source_dir;
            build_dir = Some(unpacked.build_dir);
            download_url = Some(url);
        } else if let Some(source) = &request.source_location {
            let source = canonical_destination(source)?;
            let is_local_archive = source.as_std_path().is_file()
                && source.file_name().is_some_and(is_archive);
            if is_local_archive {
                let parent = source.parent().map(Utf8Path::to_path_buf).ok_or_else(|| {
                    CtatError::Config(format!("invalid source location: {source}"))
                })?;
                let unpacked =
                    self.unpack_library(&source, &parent, request, false, &mut stages, sink)?;
                extracted_dir = Some(unpacked.extracted);
                source_dir = unpacked.source_dir;
                build_dir = Some(unpacked.build_dir);
            } else {
                info!(source = %source, "building from source data");
                build_dir = Some(match &request.build_location {
                    Some(location) => {
                        build_directory_from_build_location(source.as_str(), location, prefixes)
                    }
                    None => source.join(BUILD_DIR_NAME),
                });
                source_dir = Some(source);
            }
        } else if let Some(location) = &request.build_location {
            build_dir = Some(location.clone());
        }

        let build_dir = build_dir.ok_or_else(|| {
            CtatError::Config("no genome library location could be determined".to_string())
        })?;
        let want_gmap = request.gmap_build || request.force_gmap_build;

        let mut lib_was_built = false;
        if let Some(source) = &source_dir {
            phase(sink, format!("phase=Build; {source}"));
            let target = prepare_destination(&build_dir, 0, &self.space)?;
            let prep = PrepGenomeLib {
                source_dir: source.clone(),
                build_dir: target.clone(),
                gmap_build: want_gmap,
            };
            let guard = StageGuard::new(source, &prep.key(), Stage::Build);
            if guard.should_run(request.new_library_build) {
                ensure_available(&target, thresholds.build, &self.space)?;
            }
            let outcome = run_external_stage(&prep, &self.runner, request.new_library_build)?;
            report(&mut stages, Stage::Build, source.as_str(), &outcome);
            if want_gmap {
                if outcome.ran() {
                    StageGuard::new(&target, &gmap_marker_key(&target, prefixes), Stage::Gmap)
                        .mark_done(&format!("gmap of {target} during the build"), None)?;
                } else {
                    self.gmap(&target, request.force_gmap_build, &mut stages, sink)?;
                }
            }
            lib_was_built = true;
        }

        let build_dir = search_for_genome_build_dir(&build_dir)?;
        info!(path = %build_dir, "genome resource library located");

        if want_gmap && !lib_was_built {
            self.gmap(&build_dir, request.force_gmap_build, &mut stages, sink)?;
        }

        if let Some(raw) = &request.mutation_url {
            self.mutation_resources(raw, &build_dir, request, &mut stages, sink)?;
        }

        phase(sink, "phase=Register; writing data table entries".to_string());
        let genome = [
            download_url.as_deref(),
            Some(build_dir.as_str()),
            extracted_dir.as_ref().map(|path| path.as_str()),
            request.source_location.as_ref().map(|path| path.as_str()),
            request.download_location.as_ref().map(|path| path.as_str()),
            request.display_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find_map(|candidate| match find_genome_name(candidate, prefixes) {
            GenomeMatch::Found(name) => Some(name.to_string()),
            GenomeMatch::NotFound => None,
        })
        .unwrap_or_else(|| {
            warn!("no genome name found in any of the given paths, using {DEFAULT_GENOME}");
            DEFAULT_GENOME.to_string()
        });

        let shown = match request.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => genome.as_str(),
        };
        let mut record = DataManagerRecord::new();
        record.add_row(
            &self.settings.tables.genome_lib,
            TableRow::new(
                unique_id(&genome),
                display_name(&self.settings.display_prefixes.genome_lib, shown),
            )
            .with_path(build_dir.as_str()),
        );
        if let Some(tissues) = &request.cravat_tissues {
            let table = &self.settings.tables.cravat_tissues;
            record.add_table(table);
            for row in load_cravat_tissues(tissues)? {
                record.add_row(table, row);
            }
        }

        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(RunResult { record, stages })
    }

    fn unpack_library(
        &self,
        archive: &Utf8Path,
        default_dest: &Utf8Path,
        request: &GenomeLibRequest,
        delete_archive: bool,
        stages: &mut Vec<StageReport>,
        sink: &dyn ProgressSink,
    ) -> Result<Unpacked, CtatError> {
        let prefixes = &self.settings.genome_prefixes;
        let thresholds = &self.settings.thresholds;
        let archive_name = archive
            .file_name()
            .ok_or_else(|| CtatError::Config(format!("not an archive: {archive}")))?;
        let library_type = LibraryType::from_filename(archive_name);
        phase(sink, format!("phase=Extract; {archive_name} ({library_type})"));

        let (dest, required) = match &library_type {
            LibraryType::SourceData => (default_dest, thresholds.source_data_extraction),
            LibraryType::PlugNPlay => (
                request.build_location.as_deref().unwrap_or(default_dest),
                thresholds.plug_n_play_extraction,
            ),
            LibraryType::Unknown(kind) => {
                return Err(CtatError::Config(format!(
                    "unexpected CTAT library type {kind:?}, neither plug-n-play nor source_data: {archive}"
                )));
            }
        };
        let extracted = extract_archive(
            &ExtractRequest {
                archive,
                dest,
                expected: logical_name(archive_name),
                strip_components: 0,
                required_bytes: required,
                force: request.new_archive_download,
                delete_archive,
            },
            &self.space,
        )?;
        stages.push(StageReport {
            stage: Stage::Extract,
            target: archive_name.to_string(),
            action: if extracted.ran {
                StageAction::Ran
            } else {
                StageAction::Skipped
            },
        });
        let root = extracted.root;

        if library_type == LibraryType::SourceData {
            let build_dir = match &request.build_location {
                Some(location) => build_directory_from_build_location(root.as_str(), location, prefixes),
                None => root.join(BUILD_DIR_NAME),
            };
            return Ok(Unpacked {
                source_dir: Some(root.clone()),
                extracted: root,
                build_dir,
            });
        }

        let children: Vec<String> = dir_names(&root)?
            .into_iter()
            .filter(|name| !is_guard_file(name))
            .collect();
        let build_dir = match children.as_slice() {
            [only] if root.join(only).as_std_path().is_dir() => root.join(only),
            _ => search_for_genome_build_dir(&root)?,
        };
        Ok(Unpacked {
            extracted: root,
            source_dir: None,
            build_dir,
        })
    }

    fn gmap(
        &self,
        build_dir: &Utf8Path,
        force: bool,
        stages: &mut Vec<StageReport>,
        sink: &dyn ProgressSink,
    ) -> Result<(), CtatError> {
        phase(sink, format!("phase=Gmap; {build_dir}"));
        let stage = GmapBuild {
            build_dir: build_dir.to_path_buf(),
            prefixes: self.settings.genome_prefixes.clone(),
        };
        let outcome = run_external_stage(&stage, &self.runner, force)?;
        report(stages, Stage::Gmap, build_dir.as_str(), &outcome);
        Ok(())
    }

    fn mutation_resources(
        &self,
        raw_url: &str,
        build_dir: &Utf8Path,
        request: &GenomeLibRequest,
        stages: &mut Vec<StageReport>,
        sink: &dyn ProgressSink,
    ) -> Result<(), CtatError> {
        let url = resolve_url(raw_url, &self.settings.mutation_base_url)?;
        phase(sink, format!("phase=Mutation; {url}"));
        let dest = prepare_destination(build_dir, 0, &self.space)?;
        let archive_name = source_file_name(&url)?;
        let cosmic_dir = match &request.cosmic_location {
            Some(location) => canonical_destination(location)?,
            None => dest.clone(),
        };
        let mut integration =
            MutationIntegration::new(dest.clone(), cosmic_dir, archive_name.clone());
        if let Some(launcher) = &self.settings.mutation_launcher {
            integration = integration.with_launcher(Utf8PathBuf::from(launcher));
        }
        let download_pending = StageGuard::new(&dest, &archive_name, Stage::MutationDownload)
            .should_run(request.new_mutation_download);
        let integration_pending = StageGuard::new(&dest, &archive_name, Stage::MutationIntegrate)
            .should_run(request.new_mutation_integration);
        if download_pending || integration_pending {
            ensure_available(&dest, self.settings.thresholds.mutation_resources, &self.space)?;
        }

        self.download_guarded(
            &url,
            &dest,
            Stage::MutationDownload,
            request.new_mutation_download,
            stages,
        )?;
        let outcome =
            run_external_stage(&integration, &self.runner, request.new_mutation_integration)?;
        report(stages, Stage::MutationIntegrate, url, &outcome);
        Ok(())
    }
}
