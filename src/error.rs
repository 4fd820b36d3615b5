use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RarityError {
    #[error("missing required input: {0}")]
    #[diagnostic(help("run `rarity --help` for usage"))]
    MissingInput(String),

    #[error("input file not found: {0}")]
    InputNotFound(Utf8PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("archive {path} is corrupt: {message}")]
    ArchiveCorrupt { path: Utf8PathBuf, message: String },

    #[error("no entry in archive {path} matches {pattern}")]
    EntryNotFound { path: Utf8PathBuf, pattern: String },

    #[error("entry {entry} has no `{column}` column in its header")]
    MissingColumn { entry: String, column: String },

    #[error("row {line}: {message}")]
    RowParse { line: u64, message: String },

    #[error("taxon key {0} is not in the reference mapping")]
    UnresolvedReferenceKey(u64),

    #[error("failed to read reference mapping {path}: {message}")]
    ReferenceRead { path: Utf8PathBuf, message: String },

    #[error("remote call for {key} failed after {attempts} attempt(s): {last_error}")]
    RemoteCallExhausted {
        key: String,
        attempts: u32,
        last_error: String,
    },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("run cancelled before completion")]
    Cancelled,

    #[error("failed to write output {path}: {message}")]
    SinkWrite { path: Utf8PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl RarityError {
    pub(crate) fn archive(path: &camino::Utf8Path, err: impl std::fmt::Display) -> Self {
        RarityError::ArchiveCorrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub(crate) fn sink(path: &camino::Utf8Path, err: impl std::fmt::Display) -> Self {
        RarityError::SinkWrite {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
