use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::CtatError;

pub const CONFIG_FILE_NAME: &str = "ctat-dm.json";

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub resource_lib_base_url: String,
    pub mutation_base_url: String,
    pub centrifuge_url: String,
    pub lncrna_url: String,
    /// `ctat_mutations` launcher to use instead of the one on `PATH`.
    pub mutation_launcher: Option<String>,
    pub genome_prefixes: Vec<String>,
    pub tables: TableNames,
    pub display_prefixes: DisplayPrefixes,
    pub thresholds: SpaceThresholds,
    pub download_block_size: usize,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableNames {
    pub genome_lib: String,
    pub cravat_tissues: String,
    pub centrifuge: String,
    pub lncrna: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayPrefixes {
    pub genome_lib: String,
    pub centrifuge: String,
}

/// Free bytes required on the destination device before each stage starts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceThresholds {
    pub source_data_extraction: u64,
    pub plug_n_play_extraction: u64,
    pub build: u64,
    pub mutation_resources: u64,
    pub centrifuge_index: u64,
    pub lncrna_annotations: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resource_lib_base_url: "https://data.broadinstitute.org/Trinity/CTAT_RESOURCE_LIB/"
                .to_string(),
            mutation_base_url: "https://data.broadinstitute.org/Trinity/CTAT/mutation/"
                .to_string(),
            centrifuge_url:
                "ftp://ftp.ccb.jhu.edu/pub/infphilo/centrifuge/data/p_compressed+h+v.tar.gz"
                    .to_string(),
            lncrna_url: "https://data.broadinstitute.org/Trinity/CTAT/lncrna/annotations.tar.gz"
                .to_string(),
            mutation_launcher: None,
            genome_prefixes: vec!["GRCh".to_string(), "Mouse".to_string()],
            tables: TableNames::default(),
            display_prefixes: DisplayPrefixes::default(),
            thresholds: SpaceThresholds::default(),
            download_block_size: 1024 * 1024,
            connect_timeout_secs: 60,
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            genome_lib: "ctat_genome_resource_libs".to_string(),
            cravat_tissues: "ctat_cravat_tissues".to_string(),
            centrifuge: "ctat_centrifuge_index".to_string(),
            lncrna: "ctat_lncrna_annotations".to_string(),
        }
    }
}

impl Default for DisplayPrefixes {
    fn default() -> Self {
        Self {
            genome_lib: "CTAT_GenomeResourceLib_".to_string(),
            centrifuge: "CTAT_CentrifugeIndex_".to_string(),
        }
    }
}

impl Default for SpaceThresholds {
    fn default() -> Self {
        Self {
            source_data_extraction: 10 * GIB,
            plug_n_play_extraction: 45 * GIB,
            build: 62 * GIB,
            mutation_resources: 4 * GIB,
            centrifuge_index: 7_400_130_287,
            lncrna_annotations: 2 * GIB,
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn without_space_thresholds(mut self) -> Self {
        self.thresholds = SpaceThresholds {
            source_data_extraction: 0,
            plug_n_play_extraction: 0,
            build: 0,
            mutation_resources: 0,
            centrifuge_index: 0,
            lncrna_annotations: 0,
        };
        self
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path, then `./ctat-dm.json`, then the per-user config dir, then defaults.
    pub fn resolve(path: Option<&str>) -> Result<Settings, CtatError> {
        if let Some(path) = path {
            return Self::load(&Utf8PathBuf::from(path));
        }

        let local = Utf8PathBuf::from(CONFIG_FILE_NAME);
        if local.as_std_path().exists() {
            return Self::load(&local);
        }

        if let Some(user) = user_config_path() {
            if user.as_std_path().exists() {
                return Self::load(&user);
            }
        }

        Ok(Settings::default())
    }

    pub fn load(path: &Utf8PathBuf) -> Result<Settings, CtatError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| CtatError::ConfigRead(path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Settings, CtatError> {
        let settings: Settings = serde_json::from_str(content)
            .map_err(|err| CtatError::ConfigParse(err.to_string()))?;
        if settings.download_block_size == 0 {
            return Err(CtatError::ConfigParse(
                "download_block_size must be greater than zero".to_string(),
            ));
        }
        if settings.genome_prefixes.iter().any(|prefix| prefix.is_empty()) {
            return Err(CtatError::ConfigParse(
                "genome_prefixes must not contain empty entries".to_string(),
            ));
        }
        Ok(settings)
    }
}

fn user_config_path() -> Option<Utf8PathBuf> {
    let dirs = ProjectDirs::from("org", "ctat", "ctat-data-manager")?;
    Utf8PathBuf::from_path_buf(dirs.config_dir().join(CONFIG_FILE_NAME)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let settings = ConfigLoader::parse(
            r#"{"lncrna_url": "https://mirror.example.org/annotations.tar.gz",
                "thresholds": {"build": 1}}"#,
        )
        .unwrap();
        assert_eq!(
            settings.lncrna_url,
            "https://mirror.example.org/annotations.tar.gz"
        );
        assert_eq!(settings.thresholds.build, 1);
        assert_eq!(settings.thresholds.mutation_resources, 4 * GIB);
        assert_eq!(settings.tables.genome_lib, "ctat_genome_resource_libs");
        assert_eq!(settings.download_block_size, 1024 * 1024);
    }

    #[test]
    fn mutation_launcher_is_optional() {
        assert_eq!(Settings::default().mutation_launcher, None);
        let settings = ConfigLoader::parse(
            r#"{"mutation_launcher": "/opt/ctat-mutations/bin/ctat_mutations"}"#,
        )
        .unwrap();
        assert_eq!(
            settings.mutation_launcher.as_deref(),
            Some("/opt/ctat-mutations/bin/ctat_mutations")
        );
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = ConfigLoader::parse(r#"{"mystery": true}"#).unwrap_err();
        assert!(matches!(err, CtatError::ConfigParse(_)));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = ConfigLoader::parse(r#"{"download_block_size": 0}"#).unwrap_err();
        assert!(matches!(err, CtatError::ConfigParse(_)));
    }
}
