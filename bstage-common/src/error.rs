use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid library pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },
    #[error("library '{library}' could not be resolved")]
    UnresolvedLibrary { library: String },
    #[error("unexpected ldd output line: {line}")]
    UnexpectedLddOutput { line: String },
}
