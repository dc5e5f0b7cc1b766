//! The external programs the genome-lib manager drives.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::command::{CommandOutput, CommandSpec, ExternalStage};
use crate::domain::Stage;
use crate::error::CtatError;
use crate::fs_util::remove_dir_if_exists;
use crate::genome::{BUILD_DIR_NAME, GenomeMatch, REF_GENOME_FILE, find_genome_name};

pub const FUSION_LIB_PREFIX: &str = "CTAT_HumanFusionLib";
pub const COSMIC_MUTANT_FILE: &str = "CosmicMutantExport.tsv.gz";
pub const COSMIC_CODING_FILE: &str = "CosmicCodingMuts.vcf.gz";
pub const MUTATION_LIB_DIR: &str = "ctat_mutation_lib";

const MUTATION_LAUNCHER: &str = "ctat_mutations";

#[derive(Debug, Clone)]
pub struct PrepGenomeLib {
    pub source_dir: Utf8PathBuf,
    pub build_dir: Utf8PathBuf,
    pub gmap_build: bool,
}

impl PrepGenomeLib {
    /// Name of the human fusion library in the source dir, if any. Mouse
    /// libraries ship without one.
    pub fn fusion_library(&self) -> Result<Option<String>, CtatError> {
        let entries = fs::read_dir(self.source_dir.as_std_path())
            .map_err(|err| CtatError::Filesystem(format!("read dir {}: {err}", self.source_dir)))?;
        let mut found: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CtatError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.split('.').next() == Some(FUSION_LIB_PREFIX) {
                found.push(name);
            }
        }
        found.sort();
        Ok(found.pop())
    }
}

impl ExternalStage for PrepGenomeLib {
    fn stage(&self) -> Stage {
        Stage::Build
    }

    fn key(&self) -> String {
        self.source_dir
            .file_name()
            .unwrap_or(self.source_dir.as_str())
            .to_string()
    }

    fn marker_dir(&self) -> &Utf8Path {
        &self.source_dir
    }

    fn check_preconditions(&self) -> Result<(), CtatError> {
        if !self.source_dir.as_std_path().is_dir() {
            return Err(CtatError::Lookup(format!(
                "cannot build the CTAT genome resource library, the source directory does not exist: {}",
                self.source_dir
            )));
        }
        Ok(())
    }

    fn command(&self) -> Result<CommandSpec, CtatError> {
        let mut spec = CommandSpec::new("prep_genome_lib.pl")
            .args(["--genome_fa", REF_GENOME_FILE, "--gtf", "ref_annot.gtf"])
            .args(["--pfam_db", "PFAM.domtblout.dat.gz"])
            .arg("--output_dir")
            .arg(self.build_dir.as_str())
            .current_dir(&self.source_dir);
        if let Some(fusion_lib) = self.fusion_library()? {
            spec = spec
                .arg("--fusion_annot_lib")
                .arg(fusion_lib)
                .args(["--annot_filter_rule", "AnnotFilterRule.pm"]);
        }
        if self.gmap_build {
            spec = spec.arg("--gmap_build");
        }
        Ok(spec)
    }

    fn validate_output(&self, _output: &CommandOutput) -> Result<(), CtatError> {
        if !self.build_dir.as_std_path().is_dir() {
            return Err(CtatError::Lookup(format!(
                "prep_genome_lib.pl finished but {} was not created",
                self.build_dir
            )));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("build of {} into {}", self.source_dir, self.build_dir)
    }
}

/// Key of the gmap marker: the library's genome name, else the directory name.
pub fn gmap_marker_key(build_dir: &Utf8Path, prefixes: &[String]) -> String {
    match find_genome_name(build_dir.as_str(), prefixes) {
        GenomeMatch::Found(name) => name.to_string(),
        GenomeMatch::NotFound => build_dir.file_name().unwrap_or(BUILD_DIR_NAME).to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct GmapBuild {
    pub build_dir: Utf8PathBuf,
    pub prefixes: Vec<String>,
}

impl ExternalStage for GmapBuild {
    fn stage(&self) -> Stage {
        Stage::Gmap
    }

    fn key(&self) -> String {
        gmap_marker_key(&self.build_dir, &self.prefixes)
    }

    fn marker_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    fn check_preconditions(&self) -> Result<(), CtatError> {
        let reference = self.build_dir.join(REF_GENOME_FILE);
        if !reference.as_std_path().is_file() {
            return Err(CtatError::Lookup(format!(
                "cannot run gmap_build, {reference} does not exist"
            )));
        }
        Ok(())
    }

    fn command(&self) -> Result<CommandSpec, CtatError> {
        Ok(CommandSpec::new("gmap_build")
            .arg("-D")
            .arg(self.build_dir.as_str())
            .args(["-d", "ref_genome.fa.gmap", "-k", "13"])
            .arg(self.build_dir.join(REF_GENOME_FILE).as_str()))
    }

    fn describe(&self) -> String {
        format!("gmap of {}", self.build_dir)
    }
}

#[derive(Debug, Clone)]
pub struct MutationIntegration {
    pub build_dir: Utf8PathBuf,
    pub cosmic_dir: Utf8PathBuf,
    /// File name of the mutation resource archive; keys the marker.
    pub archive_name: String,
    launcher: Option<Utf8PathBuf>,
}

impl MutationIntegration {
    pub fn new(build_dir: Utf8PathBuf, cosmic_dir: Utf8PathBuf, archive_name: String) -> Self {
        Self {
            build_dir,
            cosmic_dir,
            archive_name,
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Utf8PathBuf) -> Self {
        self.launcher = Some(launcher);
        self
    }

    fn launcher(&self) -> Result<Utf8PathBuf, CtatError> {
        if let Some(launcher) = &self.launcher {
            return Ok(launcher.clone());
        }
        let path = which::which(MUTATION_LAUNCHER)
            .map_err(|_| CtatError::MissingTool(MUTATION_LAUNCHER.to_string()))?;
        Utf8PathBuf::from_path_buf(path)
            .map_err(|path| CtatError::Filesystem(format!("non-utf8 path: {}", path.display())))
    }

    pub fn cosmic_files(&self) -> (Utf8PathBuf, Utf8PathBuf) {
        (
            self.cosmic_dir.join(COSMIC_MUTANT_FILE),
            self.cosmic_dir.join(COSMIC_CODING_FILE),
        )
    }
}

/// `<prefix>/share` for a launcher installed as `<prefix>/bin/ctat_mutations`.
fn share_dir(launcher: &Utf8Path) -> Result<Utf8PathBuf, CtatError> {
    launcher
        .parent()
        .and_then(Utf8Path::parent)
        .map(|root| root.join("share"))
        .ok_or_else(|| CtatError::Lookup(format!("cannot locate the install prefix of {launcher}")))
}

fn last_entry_containing(dir: &Utf8Path, needle: &str) -> Option<Utf8PathBuf> {
    let entries = fs::read_dir(dir.as_std_path()).ok()?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(needle))
        .collect();
    names.sort();
    names.pop().map(|name| dir.join(name))
}

pub fn integration_script(launcher: &Utf8Path) -> Result<Utf8PathBuf, CtatError> {
    let share = share_dir(launcher)?;
    let home = last_entry_containing(&share, "ctat-mutations").ok_or_else(|| {
        CtatError::MissingTool(format!("ctat-mutations install under {share}"))
    })?;
    Ok(home
        .join("mutation_lib_prep")
        .join("ctat-mutation-lib-integration.py"))
}

/// PICARD_HOME as exported by the launcher script, else a `picard*` dir in share.
pub fn picard_home(launcher: &Utf8Path) -> Result<Utf8PathBuf, CtatError> {
    let script = fs::read_to_string(launcher.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("read {launcher}: {err}")))?;
    let exported = script
        .lines()
        .filter(|line| line.contains("export") && line.contains("PICARD_HOME="))
        .filter_map(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').trim().to_string())
        .filter(|value| !value.is_empty())
        .last();
    if let Some(home) = exported {
        return Ok(Utf8PathBuf::from(home));
    }
    let share = share_dir(launcher)?;
    last_entry_containing(&share, "picard")
        .ok_or_else(|| CtatError::MissingTool(format!("PICARD_HOME (nothing under {share})")))
}

impl ExternalStage for MutationIntegration {
    fn stage(&self) -> Stage {
        Stage::MutationIntegrate
    }

    fn key(&self) -> String {
        self.archive_name.clone()
    }

    fn marker_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    fn check_preconditions(&self) -> Result<(), CtatError> {
        let (mutant, coding) = self.cosmic_files();
        if !mutant.as_std_path().is_file() || !coding.as_std_path().is_file() {
            return Err(CtatError::Lookup(format!(
                "COSMIC resources missing: {mutant} and/or {coding}; place both files in {}",
                self.cosmic_dir
            )));
        }
        self.launcher()?;
        Ok(())
    }

    fn prepare(&self) -> Result<(), CtatError> {
        let mutation_lib = self.build_dir.join(MUTATION_LIB_DIR);
        if remove_dir_if_exists(&mutation_lib)? {
            info!(path = %mutation_lib, "removed previous mutation library");
        }
        Ok(())
    }

    fn command(&self) -> Result<CommandSpec, CtatError> {
        let launcher = self.launcher()?;
        let script = integration_script(&launcher)?;
        let picard = picard_home(&launcher)?;
        let (mutant, coding) = self.cosmic_files();
        Ok(CommandSpec::new("python")
            .arg(script.as_str())
            .arg("--CosmicMutantExport")
            .arg(mutant.as_str())
            .arg("--CosmicCodingMuts")
            .arg(coding.as_str())
            .arg("--genome_lib_dir")
            .arg(self.build_dir.as_str())
            .env("PICARD_HOME", picard.as_str()))
    }

    fn describe(&self) -> String {
        format!(
            "integration of {} into {}",
            self.archive_name, self.build_dir
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::command::run_external_stage;
    use crate::command::tests::FakeRunner;
    use crate::stage::StageGuard;
    use assert_matches::assert_matches;

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    #[test]
    fn prep_adds_fusion_library_for_human_sources() {
        let (_temp, dir) = temp_dir();
        let source = dir.join("GRCh38_v27_CTAT_lib_Feb092018");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("CTAT_HumanFusionLib.v0.1.0.dat.gz"), b"").unwrap();
        let stage = PrepGenomeLib {
            source_dir: source.clone(),
            build_dir: source.join(BUILD_DIR_NAME),
            gmap_build: true,
        };

        let spec = stage.command().unwrap();
        assert_eq!(spec.program, "prep_genome_lib.pl");
        assert_eq!(spec.cwd.as_deref(), Some(source.as_path()));
        assert!(spec.args.windows(2).any(|pair| pair
            == ["--fusion_annot_lib", "CTAT_HumanFusionLib.v0.1.0.dat.gz"]));
        assert_eq!(spec.args.last().map(String::as_str), Some("--gmap_build"));
        assert_eq!(stage.key(), "GRCh38_v27_CTAT_lib_Feb092018");
    }

    #[test]
    fn prep_without_output_dir_fails_validation() {
        let (_temp, dir) = temp_dir();
        let stage = PrepGenomeLib {
            source_dir: dir.clone(),
            build_dir: dir.join(BUILD_DIR_NAME),
            gmap_build: false,
        };
        let runner = FakeRunner::exiting(0);

        let err = run_external_stage(&stage, &runner, false).unwrap_err();
        assert_matches!(err, CtatError::Lookup(_));
        let guard = StageGuard::new(&dir, &stage.key(), Stage::Build);
        assert!(!guard.marker_path().as_std_path().exists());
    }

    #[test]
    fn gmap_marker_uses_genome_name() {
        let build = Utf8PathBuf::from("/libs/Mouse_M16_CTAT_lib_Feb202018/ctat_genome_lib_build_dir");
        let prefixes = vec!["GRCh".to_string(), "Mouse".to_string()];
        assert_eq!(gmap_marker_key(&build, &prefixes), "Mouse_M16_CTAT_lib_Feb202018");
        assert_eq!(
            gmap_marker_key(Utf8Path::new("/libs/custom_lib"), &prefixes),
            "custom_lib"
        );

        let stage = GmapBuild {
            build_dir: build.clone(),
            prefixes,
        };
        assert_eq!(
            stage.command().unwrap().render(),
            format!("gmap_build -D {build} -d ref_genome.fa.gmap -k 13 {build}/ref_genome.fa")
        );
    }

    pub(crate) fn fake_install(root: &Utf8Path, launcher_body: &str) -> Utf8PathBuf {
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(root.join("share/ctat-mutations-2.0.1/mutation_lib_prep")).unwrap();
        fs::create_dir_all(root.join("share/picard-2.18.2-0")).unwrap();
        let launcher = bin.join("ctat_mutations");
        fs::write(&launcher, launcher_body).unwrap();
        launcher
    }

    #[test]
    fn picard_home_from_launcher_export_or_share() {
        let (_temp, dir) = temp_dir();
        let launcher = fake_install(&dir, "#!/bin/bash\nexport PICARD_HOME=\"/opt/picard\"\n");
        assert_eq!(picard_home(&launcher).unwrap(), Utf8PathBuf::from("/opt/picard"));

        fs::write(&launcher, "#!/bin/bash\n").unwrap();
        assert_eq!(
            picard_home(&launcher).unwrap(),
            dir.join("share/picard-2.18.2-0")
        );
        assert!(
            integration_script(&launcher)
                .unwrap()
                .ends_with("ctat-mutations-2.0.1/mutation_lib_prep/ctat-mutation-lib-integration.py")
        );
    }

    #[test]
    fn integration_requires_cosmic_files() {
        let (_temp, dir) = temp_dir();
        let launcher = fake_install(&dir.join("conda"), "#!/bin/bash\n");
        let build = dir.join(BUILD_DIR_NAME);
        fs::create_dir_all(build.join(MUTATION_LIB_DIR)).unwrap();
        let stage = MutationIntegration::new(build.clone(), build.clone(), "mutation_lib.hg38.tar.gz".to_string())
            .with_launcher(launcher);
        let runner = FakeRunner::exiting(0);

        let err = run_external_stage(&stage, &runner, false).unwrap_err();
        assert_matches!(err, CtatError::Lookup(_));
        assert!(runner.calls.borrow().is_empty());

        fs::write(build.join(COSMIC_MUTANT_FILE), b"").unwrap();
        fs::write(build.join(COSMIC_CODING_FILE), b"").unwrap();
        run_external_stage(&stage, &runner, false).unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "python");
        assert_eq!(calls[0].env[0].0, "PICARD_HOME");
        assert!(!build.join(MUTATION_LIB_DIR).as_std_path().exists());
    }
}
