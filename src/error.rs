use serde::Serialize;

/// Failure taxonomy shared by the fetch and load paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Transient,
    Permanent,
    SchemaConflict,
    PartialLoadFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::SchemaConflict => "schema_conflict",
            ErrorKind::PartialLoadFailure => "partial_load_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that the retry loop knows how to classify.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
    fn is_retryable(&self) -> bool;
    /// Server-provided lower bound on the next delay (Retry-After).
    fn retry_after(&self) -> Option<std::time::Duration> { None }
}

/// Why a window ended in FAILED; carried into the run summary.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub stage: &'static str,
    pub message: String,
}

impl FailureReason {
    pub fn new<E: Classify + std::fmt::Display>(stage: &'static str, err: &E) -> Self {
        FailureReason { kind: err.kind(), stage, message: err.to_string() }
    }
}

/// A dataset that could not be examined at all (coverage query failed).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatasetError {
    pub dataset: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl DatasetError {
    pub fn new<E: Classify + std::fmt::Display>(dataset: &str, err: &E) -> Self {
        DatasetError { dataset: dataset.to_string(), kind: err.kind(), message: err.to_string() }
    }
}

/// Startup-time configuration problems; fatal to the whole run.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse { path: String, source: serde_json::Error },
    Invalid { dataset: Option<String>, message: String },
}

impl ConfigError {
    pub fn invalid(dataset: Option<&str>, message: impl Into<String>) -> Self {
        ConfigError::Invalid { dataset: dataset.map(str::to_string), message: message.into() }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read config {path}: {source}"),
            ConfigError::Parse { path, source } => write!(f, "cannot parse config {path}: {source}"),
            ConfigError::Invalid { dataset: Some(ds), message } => write!(f, "invalid dataset {ds}: {message}"),
            ConfigError::Invalid { dataset: None, message } => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}
