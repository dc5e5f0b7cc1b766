use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::destination::DiskSpace;
use crate::domain::source_file_name;
use crate::error::CtatError;

/// A response body positioned at the requested offset, or at zero when the
/// server ignored the range.
pub struct RemoteBody {
    pub reader: Box<dyn Read + Send>,
    pub resumed: bool,
}

pub trait Fetcher: Send + Sync {
    fn content_length(&self, url: &str) -> Result<u64, CtatError>;
    fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, CtatError>;
    /// `None` when the resource does not exist.
    fn fetch_text(&self, url: &str) -> Result<Option<String>, CtatError>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    curl: Option<PathBuf>,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, CtatError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ctat-dm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CtatError::Http(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout())
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| CtatError::Http(err.to_string()))?;

        Ok(Self {
            client,
            curl: which::which("curl").ok(),
        })
    }

    fn curl(&self) -> Result<&PathBuf, CtatError> {
        self.curl
            .as_ref()
            .ok_or_else(|| CtatError::MissingTool("curl".to_string()))
    }

    fn curl_output(&self, args: &[&str]) -> Result<std::process::Output, CtatError> {
        Command::new(self.curl()?)
            .args(args)
            .output()
            .map_err(|err| CtatError::Http(format!("failed to run curl: {err}")))
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn header_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn status_error(url: &str, status: StatusCode) -> CtatError {
    CtatError::HttpStatus {
        url: url.to_string(),
        status: status.as_u16(),
    }
}

impl Fetcher for HttpFetcher {
    fn content_length(&self, url: &str) -> Result<u64, CtatError> {
        if !is_http(url) {
            let output = self.curl_output(&["-sSIL", url])?;
            if !output.status.success() {
                return Err(CtatError::Http(format!(
                    "{url}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            return parse_curl_length(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
                CtatError::Http(format!("{url}: server did not report a size"))
            });
        }

        let response = self
            .client
            .head(url)
            .send()
            .map_err(|err| CtatError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(url, response.status()));
        }
        if let Some(length) = header_length(response.headers()) {
            return Ok(length);
        }

        debug!(url, "HEAD carried no length, asking with GET");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| CtatError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(url, response.status()));
        }
        header_length(response.headers())
            .ok_or_else(|| CtatError::Http(format!("{url}: server did not report a size")))
    }

    fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, CtatError> {
        if !is_http(url) {
            let range = format!("{offset}-");
            let mut args = vec!["-sSfL"];
            if offset > 0 {
                args.extend(["--range", range.as_str()]);
            }
            args.push(url);
            let mut child = Command::new(self.curl()?)
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|err| CtatError::Http(format!("failed to run curl: {err}")))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| CtatError::Http("curl produced no output stream".to_string()))?;
            return Ok(RemoteBody {
                reader: Box::new(CurlBody {
                    child,
                    stdout,
                    url: url.to_string(),
                }),
                resumed: offset > 0,
            });
        }

        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .map_err(|err| CtatError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        Ok(RemoteBody {
            resumed: offset > 0 && status == StatusCode::PARTIAL_CONTENT,
            reader: Box::new(response),
        })
    }

    fn fetch_text(&self, url: &str) -> Result<Option<String>, CtatError> {
        if !is_http(url) {
            let output = self.curl_output(&["-sSfL", url])?;
            // 22: HTTP error status, 78: remote file not found.
            return match output.status.code() {
                Some(0) => Ok(Some(String::from_utf8_lossy(&output.stdout).to_string())),
                Some(22) | Some(78) => Ok(None),
                _ => Err(CtatError::Http(format!(
                    "{url}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ))),
            };
        }

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| CtatError::Http(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        response
            .text()
            .map(Some)
            .map_err(|err| CtatError::Http(err.to_string()))
    }
}

fn parse_curl_length(headers: &str) -> Option<u64> {
    headers
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .last()
}

/// Streams curl's stdout and surfaces a failed exit as a read error at EOF.
struct CurlBody {
    child: Child,
    stdout: ChildStdout,
    url: String,
}

impl Read for CurlBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.stdout.read(buf)?;
        if read == 0 && !buf.is_empty() {
            let status = self.child.wait()?;
            if !status.success() {
                let mut stderr = String::new();
                if let Some(pipe) = self.child.stderr.as_mut() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Err(io::Error::other(format!(
                    "curl {} exited with {status}: {}",
                    self.url,
                    stderr.trim()
                )));
            }
        }
        Ok(read)
    }
}

pub fn download_file(
    fetcher: &dyn Fetcher,
    space: &dyn DiskSpace,
    url: &str,
    dest_dir: &Utf8Path,
    resume: bool,
    block_size: usize,
) -> Result<Utf8PathBuf, CtatError> {
    let target = dest_dir.join(source_file_name(url)?);
    let total = fetcher.content_length(url)?;

    let existing = if resume {
        fs::metadata(target.as_std_path())
            .map(|meta| meta.len())
            .unwrap_or(0)
    } else {
        0
    };
    if resume && existing == total && target.as_std_path().is_file() {
        info!(path = %target, bytes = total, "file already fully downloaded");
        return Ok(target);
    }
    let offset = if existing > total {
        warn!(path = %target, existing, total, "local file is larger than the remote one, starting over");
        0
    } else {
        existing
    };

    let available = space.available_bytes(dest_dir)?;
    let required = total - offset;
    if available < required {
        return Err(CtatError::InsufficientSpace {
            path: dest_dir.to_path_buf(),
            available,
            required,
        });
    }

    let body = fetcher.open(url, offset)?;
    let mut reader = body.reader;
    let mut file = if offset > 0 && body.resumed {
        info!(url, offset, total, "resuming download");
        OpenOptions::new()
            .append(true)
            .open(target.as_std_path())
            .map_err(|err| CtatError::Filesystem(format!("open {target}: {err}")))?
    } else {
        if offset > 0 {
            warn!(url, "server ignored the range request, downloading from the start");
        }
        info!(url, total, path = %target, "downloading");
        File::create(target.as_std_path())
            .map_err(|err| CtatError::Filesystem(format!("create {target}: {err}")))?
    };

    let mut buffer = vec![0u8; block_size.max(1)];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| CtatError::Http(format!("{url}: {err}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|err| CtatError::Filesystem(format!("write {target}: {err}")))?;
    }
    file.sync_all()
        .map_err(|err| CtatError::Filesystem(err.to_string()))?;
    drop(file);

    let actual = fs::metadata(target.as_std_path())
        .map_err(|err| CtatError::Filesystem(err.to_string()))?
        .len();
    if actual != total {
        return Err(CtatError::Integrity(format!(
            "{target} is {actual} bytes, expected {total} from {url}"
        )));
    }
    info!(path = %target, bytes = actual, "download complete");
    Ok(target)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// In-memory server. `reported` overrides the advertised size.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pub files: HashMap<String, Vec<u8>>,
        pub reported: HashMap<String, u64>,
        pub honor_range: bool,
        pub opened: Mutex<Vec<(String, u64)>>,
    }

    impl FakeFetcher {
        pub(crate) fn with_file(mut self, url: &str, body: &[u8]) -> Self {
            self.files.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl Fetcher for FakeFetcher {
        fn content_length(&self, url: &str) -> Result<u64, CtatError> {
            if let Some(size) = self.reported.get(url) {
                return Ok(*size);
            }
            self.files
                .get(url)
                .map(|body| body.len() as u64)
                .ok_or_else(|| CtatError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                })
        }

        fn open(&self, url: &str, offset: u64) -> Result<RemoteBody, CtatError> {
            self.opened.lock().unwrap().push((url.to_string(), offset));
            let body = self.files.get(url).cloned().ok_or_else(|| CtatError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })?;
            let (bytes, resumed) = if self.honor_range && offset > 0 {
                (body[offset as usize..].to_vec(), true)
            } else {
                (body, false)
            };
            Ok(RemoteBody {
                reader: Box::new(Cursor::new(bytes)),
                resumed,
            })
        }

        fn fetch_text(&self, url: &str) -> Result<Option<String>, CtatError> {
            Ok(self
                .files
                .get(url)
                .map(|body| String::from_utf8_lossy(body).to_string()))
        }
    }

    struct Plenty;

    impl DiskSpace for Plenty {
        fn available_bytes(&self, _path: &Utf8Path) -> Result<u64, CtatError> {
            Ok(u64::MAX)
        }
    }

    struct Tight(u64);

    impl DiskSpace for Tight {
        fn available_bytes(&self, _path: &Utf8Path) -> Result<u64, CtatError> {
            Ok(self.0)
        }
    }

    const URL: &str = "https://example.org/data/lib.tar.gz";

    fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    fn body() -> Vec<u8> {
        (0..10_000u32).map(|value| (value % 251) as u8).collect()
    }

    #[test]
    fn resumes_from_partial_file() {
        let (_temp, dir) = temp_dir();
        let data = body();
        fs::write(dir.join("lib.tar.gz"), &data[..4000]).unwrap();
        let fetcher = FakeFetcher {
            honor_range: true,
            ..FakeFetcher::default()
        }
        .with_file(URL, &data);

        let path = download_file(&fetcher, &Plenty, URL, &dir, true, 1024).unwrap();

        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(fetcher.opened.lock().unwrap()[0], (URL.to_string(), 4000));
    }

    #[test]
    fn ignored_range_restarts_from_zero() {
        let (_temp, dir) = temp_dir();
        let data = body();
        fs::write(dir.join("lib.tar.gz"), b"garbage").unwrap();
        let fetcher = FakeFetcher::default().with_file(URL, &data);

        let path = download_file(&fetcher, &Plenty, URL, &dir, true, 333).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn complete_file_is_not_fetched_again() {
        let (_temp, dir) = temp_dir();
        let data = body();
        fs::write(dir.join("lib.tar.gz"), &data).unwrap();
        let fetcher = FakeFetcher::default().with_file(URL, &data);

        download_file(&fetcher, &Plenty, URL, &dir, true, 1024).unwrap();
        assert!(fetcher.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn oversized_local_file_is_replaced() {
        let (_temp, dir) = temp_dir();
        let data = body();
        fs::write(dir.join("lib.tar.gz"), vec![7u8; 20_000]).unwrap();
        let fetcher = FakeFetcher {
            honor_range: true,
            ..FakeFetcher::default()
        }
        .with_file(URL, &data);

        let path = download_file(&fetcher, &Plenty, URL, &dir, true, 1024).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
        assert_eq!(fetcher.opened.lock().unwrap()[0], (URL.to_string(), 0));
    }

    #[test]
    fn empty_remote_file_downloads_fresh() {
        let (_temp, dir) = temp_dir();
        let fetcher = FakeFetcher::default().with_file(URL, b"");

        let path = download_file(&fetcher, &Plenty, URL, &dir, false, 1024).unwrap();
        assert!(fs::read(&path).unwrap().is_empty());
        assert_eq!(fetcher.opened.lock().unwrap()[0], (URL.to_string(), 0));
    }

    #[test]
    fn short_body_is_an_integrity_error() {
        let (_temp, dir) = temp_dir();
        let mut fetcher = FakeFetcher::default().with_file(URL, &body());
        fetcher.reported.insert(URL.to_string(), 20_000);

        let err = download_file(&fetcher, &Plenty, URL, &dir, false, 1024).unwrap_err();
        assert_matches!(err, CtatError::Integrity(_));
    }

    #[test]
    fn refuses_when_remaining_bytes_do_not_fit() {
        let (_temp, dir) = temp_dir();
        let fetcher = FakeFetcher::default().with_file(URL, &body());

        let err = download_file(&fetcher, &Tight(100), URL, &dir, false, 1024).unwrap_err();
        assert_matches!(
            err,
            CtatError::InsufficientSpace {
                available: 100,
                required: 10_000,
                ..
            }
        );
        assert!(!dir.join("lib.tar.gz").as_std_path().exists());
    }

    #[test]
    fn curl_length_uses_last_header_block() {
        let headers = "HTTP/1.1 302 Found\r\nContent-Length: 0\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 1234\r\n";
        assert_eq!(parse_curl_length(headers), Some(1234));
        assert_eq!(parse_curl_length("Last-Modified: x\r\n"), None);
    }
}
