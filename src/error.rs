use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CtatError {
    #[error("invalid arguments: {0}")]
    #[diagnostic(code(ctat::config))]
    Config(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("the destination is not a directory: {0}")]
    NotADirectory(Utf8PathBuf),

    #[error("the destination directory could not be written into: {path}: {message}")]
    NotWritable { path: Utf8PathBuf, message: String },

    #[error(
        "insufficient space on the device of {path}: {available} bytes available, {required} bytes needed"
    )]
    #[diagnostic(help("free some space or choose another destination"))]
    InsufficientSpace {
        path: Utf8PathBuf,
        available: u64,
        required: u64,
    },

    #[error("integrity check failed: {0}")]
    #[diagnostic(help("remove the partial file or re-run with a forced download"))]
    Integrity(String),

    #[error("command failed ({status}): {command}\n{output}")]
    ExternalCommand {
        command: String,
        status: String,
        output: String,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{0}")]
    Lookup(String),

    #[error("download request failed: {0}")]
    Http(String),

    #[error("{url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

