use thiserror::Error;

/// Problems in a project's configuration. These are reported when the
/// configuration is loaded and are never corrected silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not the URL of a GitHub project")]
    InvalidUrl(String),
    #[error("action spec is empty")]
    EmptyActionSpec,
    #[error("action `{0}` is given more than once")]
    DuplicateAction(String),
    #[error("action `{0}` requires an argument")]
    MissingArgument(String),
    #[error("invalid glob pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid duration `{0}` (expected e.g. `90s`, `30m`, `12h`, `1d`)")]
    InvalidDuration(String),
}

/// No glob pattern could be found that matches the selection but none of the
/// alternatives. Callers usually fall back to the literal selection.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("could not generate a match pattern for `{selection}`: {reason}")]
pub struct NoPatternError {
    pub selection: String,
    pub reason: String,
}

/// A request answered with a status that is neither success nor `304 Not Modified`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("GET {url} failed with status {status}")]
pub struct HttpStatusError {
    pub url: String,
    pub status: u16,
}
