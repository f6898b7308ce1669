use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

/// Every failure the aggregation pipeline can surface.
///
/// Payloads are plain strings so a single refresh outcome can be cloned out to
/// every caller waiting on the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Repository '{0}' not found")]
    RepositoryNotFound(String),

    #[error("Fetch failed for {url}: {message}")]
    FetchError {
        url: String,
        status: Option<u16>,
        message: String,
        transient: bool,
    },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Decompression error: {0}")]
    DecompressionError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl RepoError {
    pub fn fetch(url: impl Into<String>, message: impl Into<String>) -> Self {
        RepoError::FetchError {
            url: url.into(),
            status: None,
            message: message.into(),
            transient: false,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        RepoError::FetchError {
            url: url.into(),
            status: Some(status),
            message: format!("HTTP {}", status),
            transient: status >= 500 || status == 429,
        }
    }

    /// Whether the fetcher may retry the operation that produced this error.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::FetchError { transient, .. } => *transient,
            RepoError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Decompression failures are reported the same way as malformed documents.
    pub fn is_parse_failure(&self) -> bool {
        matches!(
            self,
            RepoError::ParseError(_) | RepoError::DecompressionError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::RepositoryNotFound(_))
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, RepoError::ConfigError(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            RepoError::FetchError { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for RepoError {
    fn from(err: std::io::Error) -> Self {
        RepoError::Io(err.to_string())
    }
}
impl From<reqwest::Error> for RepoError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        let status = err.status().map(|s| s.as_u16());
        let transient = err.is_timeout()
            || err.is_connect()
            || err.is_request()
            || status.map(|s| s >= 500 || s == 429).unwrap_or(false);
        RepoError::FetchError {
            url,
            status,
            message: err.to_string(),
            transient,
        }
    }
}
impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::ParseError(format!("JSON error: {}", err))
    }
}
impl From<serde_yaml::Error> for RepoError {
    fn from(err: serde_yaml::Error) -> Self {
        RepoError::ConfigError(format!("YAML error: {}", err))
    }
}
impl From<toml::de::Error> for RepoError {
    fn from(err: toml::de::Error) -> Self {
        RepoError::ConfigError(format!("TOML error: {}", err))
    }
}
impl From<quick_xml::Error> for RepoError {
    fn from(err: quick_xml::Error) -> Self {
        RepoError::ParseError(format!("XML error: {}", err))
    }
}
impl From<quick_xml::events::attributes::AttrError> for RepoError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        RepoError::ParseError(format!("XML attribute error: {}", err))
    }
}
impl From<url::ParseError> for RepoError {
    fn from(err: url::ParseError) -> Self {
        RepoError::InvalidUrl(err.to_string())
    }
}
impl From<regex::Error> for RepoError {
    fn from(err: regex::Error) -> Self {
        RepoError::ConfigError(format!("Invalid pattern: {}", err))
    }
}
impl From<tokio::sync::AcquireError> for RepoError {
    fn from(err: tokio::sync::AcquireError) -> Self {
        RepoError::Cancelled(format!("Semaphore closed: {}", err))
    }
}
impl From<tokio::task::JoinError> for RepoError {
    fn from(err: tokio::task::JoinError) -> Self {
        RepoError::Cancelled(format!("Task join error: {}", err))
    }
}
impl From<tokio::time::error::Elapsed> for RepoError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RepoError::Timeout("deadline exceeded".to_string())
    }
}
impl From<tempfile::PersistError> for RepoError {
    fn from(err: tempfile::PersistError) -> Self {
        RepoError::Io(err.error.to_string())
    }
}
impl From<std::string::FromUtf8Error> for RepoError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RepoError::ParseError(format!("UTF-8 conversion error: {}", err))
    }
}
