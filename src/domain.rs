use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::CtatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Extract,
    Build,
    Gmap,
    MutationDownload,
    MutationIntegrate,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Download,
        Stage::Extract,
        Stage::Build,
        Stage::Gmap,
        Stage::MutationDownload,
        Stage::MutationIntegrate,
    ];

    pub fn marker_suffix(&self) -> &'static str {
        match self {
            Stage::Download => "download_succeeded",
            Stage::Extract => "extraction_succeeded",
            Stage::Build => "build_succeeded",
            Stage::Gmap => "gmap_succeeded",
            Stage::MutationDownload => "mutation_download_succeeded",
            Stage::MutationIntegrate => "mutation_integration_succeeded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Extract => write!(f, "extract"),
            Stage::Build => write!(f, "build"),
            Stage::Gmap => write!(f, "gmap"),
            Stage::MutationDownload => write!(f, "mutation-download"),
            Stage::MutationIntegrate => write!(f, "mutation-integrate"),
        }
    }
}

/// CTAT archives carry their kind in the second dot-separated field,
/// e.g. `GRCh38_v27_CTAT_lib_Feb092018.plug-n-play.tar.gz`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryType {
    PlugNPlay,
    SourceData,
    Unknown(String),
}

impl LibraryType {
    pub fn from_filename(name: &str) -> Self {
        let base = name.rsplit('/').next().unwrap_or(name);
        match base.split('.').nth(1) {
            Some("plug-n-play") => LibraryType::PlugNPlay,
            Some("source_data") => LibraryType::SourceData,
            Some(other) => LibraryType::Unknown(other.to_string()),
            None => LibraryType::Unknown(String::new()),
        }
    }
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryType::PlugNPlay => write!(f, "plug-n-play"),
            LibraryType::SourceData => write!(f, "source_data"),
            LibraryType::Unknown(value) => write!(f, "unknown ({value})"),
        }
    }
}

/// Joins a bare file name onto `base`; absolute URLs pass through unchanged.
pub fn resolve_url(raw: &str, base: &str) -> Result<String, CtatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CtatError::Config("empty URL".to_string()));
    }
    if let Ok(url) = Url::parse(trimmed) {
        return Ok(url.to_string());
    }
    let base = Url::parse(base)
        .map_err(|err| CtatError::Config(format!("invalid base URL {base}: {err}")))?;
    base.join(trimmed)
        .map(|url| url.to_string())
        .map_err(|err| CtatError::Config(format!("invalid URL {trimmed}: {err}")))
}

pub fn source_file_name(source: &str) -> Result<String, CtatError> {
    let path = match Url::parse(source) {
        Ok(url) => url.path().to_string(),
        Err(_) => source.to_string(),
    };
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .ok_or_else(|| CtatError::Config(format!("no file name in source: {source}")))
}

/// File name with every extension stripped: `p_compressed+h+v.tar.gz` -> `p_compressed+h+v`.
pub fn logical_name(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}
