use std::fs::File;
use std::io::Read;

use camino::Utf8Path;
use md5::{Digest, Md5};
use tracing::{info, warn};

use crate::error::CtatError;
use crate::fetch::Fetcher;

const BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Verified(String),
    Unavailable,
}

pub fn md5_hex(path: &Utf8Path) -> Result<String, CtatError> {
    let mut file = File::open(path.as_std_path())
        .map_err(|err| CtatError::Filesystem(format!("open {path}: {err}")))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; BLOCK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| CtatError::Filesystem(format!("read {path}: {err}")))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn parse_md5_listing(listing: &str) -> Option<String> {
    listing
        .split_whitespace()
        .next()
        .map(|token| token.to_ascii_lowercase())
}

pub fn verify_md5(path: &Utf8Path, expected: &str) -> Result<String, CtatError> {
    let actual = md5_hex(path)?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(CtatError::Integrity(format!(
            "md5 of {path} is {actual}, expected {}",
            expected.trim()
        )));
    }
    Ok(actual)
}

pub fn verify_remote_md5(
    fetcher: &dyn Fetcher,
    url: &str,
    path: &Utf8Path,
) -> Result<ChecksumOutcome, CtatError> {
    let md5_url = format!("{url}.md5");
    let Some(listing) = fetcher.fetch_text(&md5_url)? else {
        warn!(url = %md5_url, "no checksum published, skipping verification");
        return Ok(ChecksumOutcome::Unavailable);
    };
    let Some(expected) = parse_md5_listing(&listing) else {
        warn!(url = %md5_url, "checksum file is empty, skipping verification");
        return Ok(ChecksumOutcome::Unavailable);
    };
    let actual = verify_md5(path, &expected)?;
    info!(path = %path, md5 = %actual, "checksum verified");
    Ok(ChecksumOutcome::Verified(actual))
}
