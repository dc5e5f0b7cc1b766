//! Durable stage markers.
//!
//! Every long-running step leaves `<dir>/<key>.<suffix>.txt` behind once it
//! has completed and validated. While the step is running only the sibling
//! `<marker>.pending` file exists, so an interrupted run is visible as
//! [`StageState::InProgress`] and is redone on the next invocation.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::Stage;
use crate::error::CtatError;
use crate::fs_util::{TEMP_PREFIX, remove_file_if_exists, write_atomic};

const PENDING_SUFFIX: &str = ".pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    NotStarted,
    InProgress,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub state: StageState,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub completed_at: String,
    #[serde(default)]
    pub tool: String,
}

impl StageRecord {
    fn new(stage: Stage, state: StageState, detail: String, output: Option<String>) -> Self {
        Self {
            stage,
            state,
            detail,
            output,
            completed_at: Local::now().to_rfc3339(),
            tool: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    pub detail: String,
    pub output: Option<String>,
}

impl<T> Completed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            detail: String::new(),
            output: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[derive(Debug)]
pub enum StageOutcome<T> {
    Ran(T),
    Skipped(StageRecord),
}

impl<T> StageOutcome<T> {
    pub fn ran(&self) -> bool {
        matches!(self, StageOutcome::Ran(_))
    }
}

#[derive(Debug, Clone)]
pub struct StageGuard {
    stage: Stage,
    marker: Utf8PathBuf,
    pending: Utf8PathBuf,
}

impl StageGuard {
    pub fn new(dir: &Utf8Path, key: &str, stage: Stage) -> Self {
        let marker = dir.join(format!("{key}.{}.txt", stage.marker_suffix()));
        let pending = Utf8PathBuf::from(format!("{marker}{PENDING_SUFFIX}"));
        Self {
            stage,
            marker,
            pending,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn marker_path(&self) -> &Utf8Path {
        &self.marker
    }

    pub fn pending_path(&self) -> &Utf8Path {
        &self.pending
    }

    pub fn state(&self) -> StageState {
        if self.marker.as_std_path().is_file() {
            StageState::Done
        } else if self.pending.as_std_path().is_file() {
            StageState::InProgress
        } else {
            StageState::NotStarted
        }
    }

    /// The completed record, if any. Plain-text markers from older tools
    /// are reported as `Done` with their text as the detail.
    pub fn record(&self) -> Result<Option<StageRecord>, CtatError> {
        if !self.marker.as_std_path().is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(self.marker.as_std_path())
            .map_err(|err| CtatError::Filesystem(format!("read {}: {err}", self.marker)))?;
        match serde_json::from_str::<StageRecord>(&content) {
            Ok(record) if record.state == StageState::Done => Ok(Some(record)),
            _ => Ok(Some(StageRecord {
                stage: self.stage,
                state: StageState::Done,
                detail: content.trim().to_string(),
                output: None,
                completed_at: String::new(),
                tool: String::new(),
            })),
        }
    }

    pub fn should_run(&self, force: bool) -> bool {
        force || self.state() != StageState::Done
    }

    /// Clears a previous marker when forced and records the stage as in progress.
    pub fn begin(&self, force: bool) -> Result<(), CtatError> {
        if force && remove_file_if_exists(&self.marker)? {
            debug!(marker = %self.marker, "removed previous marker");
        }
        let record = StageRecord::new(self.stage, StageState::InProgress, String::new(), None);
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|err| CtatError::Filesystem(err.to_string()))?;
        write_atomic(&self.pending, &body)
    }

    pub fn mark_done(&self, detail: &str, output: Option<&str>) -> Result<StageRecord, CtatError> {
        let record = StageRecord::new(
            self.stage,
            StageState::Done,
            detail.to_string(),
            output.map(|value| value.to_string()),
        );
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|err| CtatError::Filesystem(err.to_string()))?;
        write_atomic(&self.marker, &body)?;
        remove_file_if_exists(&self.pending)?;
        Ok(record)
    }

    pub fn run<T, F>(&self, force: bool, work: F) -> Result<StageOutcome<T>, CtatError>
    where
        F: FnOnce() -> Result<Completed<T>, CtatError>,
    {
        if !self.should_run(force) {
            info!(stage = %self.stage, marker = %self.marker, "already done, skipping");
            let record = self.record()?.ok_or_else(|| {
                CtatError::Filesystem(format!("marker vanished: {}", self.marker))
            })?;
            return Ok(StageOutcome::Skipped(record));
        }

        self.begin(force)?;
        let completed = work()?;
        self.mark_done(&completed.detail, completed.output.as_deref())?;
        info!(stage = %self.stage, marker = %self.marker, "stage complete");
        Ok(StageOutcome::Ran(completed.value))
    }
}

/// Marker, pending and temp files the pipeline itself leaves in a destination.
pub fn is_guard_file(name: &str) -> bool {
    if name.starts_with(TEMP_PREFIX) {
        return true;
    }
    let name = name.strip_suffix(PENDING_SUFFIX).unwrap_or(name);
    Stage::ALL
        .iter()
        .any(|stage| name.ends_with(&format!(".{}.txt", stage.marker_suffix())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::cell::Cell;

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    #[test]
    fn done_stage_is_skipped_until_forced() {
        let (_temp, dir) = temp_dir();
        let guard = StageGuard::new(&dir, "lib.tar.gz", Stage::Download);
        assert_eq!(guard.state(), StageState::NotStarted);

        guard.mark_done("downloaded", None).unwrap();
        assert_eq!(guard.state(), StageState::Done);
        assert!(!guard.should_run(false));
        assert!(guard.should_run(true));
        assert!(
            guard
                .marker_path()
                .as_str()
                .ends_with("lib.tar.gz.download_succeeded.txt")
        );
    }

    #[test]
    fn forced_run_starts_without_marker() {
        let (_temp, dir) = temp_dir();
        let guard = StageGuard::new(&dir, "genome", Stage::Build);
        guard.mark_done("old", None).unwrap();

        let outcome = guard
            .run(true, || {
                assert!(!guard.marker_path().as_std_path().exists());
                assert_eq!(guard.state(), StageState::InProgress);
                Ok(Completed::new(7).detail("rebuilt"))
            })
            .unwrap();

        assert_matches!(outcome, StageOutcome::Ran(7));
        assert_eq!(guard.record().unwrap().unwrap().detail, "rebuilt");
        assert!(!guard.pending_path().as_std_path().exists());
    }

    #[test]
    fn failed_work_leaves_no_marker() {
        let (_temp, dir) = temp_dir();
        let guard = StageGuard::new(&dir, "genome", Stage::Gmap);

        let err = guard
            .run::<(), _>(false, || Err(CtatError::Integrity("bad".to_string())))
            .unwrap_err();

        assert_matches!(err, CtatError::Integrity(_));
        assert!(!guard.marker_path().as_std_path().exists());
        assert_eq!(guard.state(), StageState::InProgress);
        assert!(guard.should_run(false));
    }

    #[test]
    fn skipped_run_returns_stored_output() {
        let (_temp, dir) = temp_dir();
        let guard = StageGuard::new(&dir, "a.tar.gz", Stage::Extract);
        guard.mark_done("extracted", Some("/data/a")).unwrap();

        let called = Cell::new(false);
        let outcome = guard
            .run(false, || {
                called.set(true);
                Ok(Completed::new(()))
            })
            .unwrap();

        assert!(!called.get());
        assert_matches!(outcome, StageOutcome::Skipped(record) if record.output.as_deref() == Some("/data/a"));
    }

    #[test]
    fn legacy_text_marker_counts_as_done() {
        let (_temp, dir) = temp_dir();
        let guard = StageGuard::new(&dir, "annotations", Stage::Download);
        fs::write(guard.marker_path(), "Download succeeded\n").unwrap();

        assert_eq!(guard.state(), StageState::Done);
        let record = guard.record().unwrap().unwrap();
        assert_eq!(record.state, StageState::Done);
        assert_eq!(record.detail, "Download succeeded");
    }

    #[test]
    fn guard_files_are_recognized() {
        assert!(is_guard_file("x.tar.gz.extraction_succeeded.txt"));
        assert!(is_guard_file("genome.build_succeeded.txt.pending"));
        assert!(is_guard_file(".ctat-dm-abc123"));
        assert!(!is_guard_file("ref_genome.fa"));
        assert!(!is_guard_file("succeeded.txt"));
    }
}
