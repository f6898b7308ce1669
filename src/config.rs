use crate::{
    error::{RepoError, RepoResult},
    REPOSCOPE_CACHE, REPOSCOPE_CONFIG,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide settings. Repository definitions live in YAML documents, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_config_dirs")]
    pub config_dirs: Vec<PathBuf>,

    #[serde(default = "default_include_builtin")]
    pub include_builtin: bool,

    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    #[serde(default = "default_api_cache_ttl_seconds")]
    pub api_cache_ttl_seconds: u64,

    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    #[serde(default = "default_max_bulk_downloads")]
    pub max_bulk_downloads: usize,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_bulk_timeout_seconds")]
    pub bulk_timeout_seconds: u64,

    #[serde(default = "default_search_timeout_seconds")]
    pub search_timeout_seconds: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: u64,

    #[serde(default = "default_max_mirror_attempts")]
    pub max_mirror_attempts: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_arch")]
    pub default_arch: String,
}

impl Config {
    pub fn load(config_path: Option<&Path>) -> RepoResult<Self> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => REPOSCOPE_CONFIG.join("reposcope.toml"),
        };

        if config_path.is_file() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            log::debug!(
                "No settings file at {}, using defaults",
                config_path.display()
            );
            Ok(Config::default())
        }
    }

    pub fn save(&self, path: &Path) -> RepoResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| RepoError::ConfigError(format!("TOML serialization error: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> RepoResult<()> {
        if self.max_concurrent_fetches == 0 || self.max_bulk_downloads == 0 {
            return Err(RepoError::ConfigError(
                "concurrency limits must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl_seconds == 0 {
            return Err(RepoError::ConfigError(
                "default_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        if self.max_decompressed_bytes == 0 {
            return Err(RepoError::ConfigError(
                "max_decompressed_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn api_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.api_cache_ttl_seconds)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            config_dirs: default_config_dirs(),
            include_builtin: default_include_builtin(),
            default_ttl_seconds: default_ttl_seconds(),
            api_cache_ttl_seconds: default_api_cache_ttl_seconds(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_bulk_downloads: default_max_bulk_downloads(),
            request_timeout_seconds: default_request_timeout_seconds(),
            bulk_timeout_seconds: default_bulk_timeout_seconds(),
            search_timeout_seconds: default_search_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
            max_mirror_attempts: default_max_mirror_attempts(),
            user_agent: default_user_agent(),
            default_arch: default_arch(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
    Universal,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Universal => "universal",
        }
    }

    /// Universal repositories serve every platform filter.
    pub fn serves(&self, wanted: Platform) -> bool {
        *self == wanted || *self == Platform::Universal
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "macos" | "darwin" | "osx" => Ok(Platform::Macos),
            "windows" | "win" => Ok(Platform::Windows),
            "universal" | "any" => Ok(Platform::Universal),
            other => Err(RepoError::ConfigError(format!("unknown platform '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    BulkDownload,
    Api,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingConfig {
    pub format: String,

    /// canonical field name -> source field name (dotted paths allowed)
    #[serde(default)]
    pub fields: BTreeMap<String, String>,

    /// dotted path to the record list inside a JSON document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,

    /// line regex for `text_lines`, with named groups matching canonical fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

impl ParsingConfig {
    /// Source key for a canonical field, falling back to the canonical name itself.
    pub fn source_field<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.fields
            .get(canonical)
            .map(|s| s.as_str())
            .unwrap_or(canonical)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(default = "default_limit_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            concurrent_requests: default_concurrent_requests(),
            timeout_seconds: default_limit_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Bearer,
    Token,
    Basic,
    Header,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    /// environment variable holding the secret
    pub credentials_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_env: Option<String>,
    /// header name for `type: header`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryCacheSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_hours: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub repo_type: String,
    pub platform: Platform,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub eol: bool,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub endpoints: Endpoints,
    pub parsing: ParsingConfig,
    #[serde(
        default,
        deserialize_with = "deserialize_version_mapping",
        skip_serializing_if = "Option::is_none"
    )]
    pub version_mapping: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<RepositoryCacheSettings>,
}

impl RepositoryConfig {
    pub fn is_api(&self) -> bool {
        self.query_type == QueryType::Api
    }

    pub fn limits(&self) -> Limits {
        self.limits.clone().unwrap_or_default()
    }

    pub fn ttl(&self, fallback: Duration) -> Duration {
        self.cache
            .as_ref()
            .and_then(|c| c.ttl_hours)
            .map(|h| Duration::from_secs(h * 3600))
            .unwrap_or(fallback)
    }

    pub fn codename_for(&self, version: &str) -> Option<&str> {
        self.version_mapping
            .as_ref()
            .and_then(|m| m.get(version))
            .map(|s| s.as_str())
    }

    pub fn validate(&self) -> RepoResult<()> {
        if self.name.trim().is_empty() {
            return Err(RepoError::ConfigError(
                "repository name must not be empty".to_string(),
            ));
        }
        if self.repo_type.trim().is_empty() {
            return Err(RepoError::ConfigError(format!(
                "repository '{}' has an empty type",
                self.name
            )));
        }
        if self.parsing.format.trim().is_empty() {
            return Err(RepoError::ConfigError(format!(
                "repository '{}' has no parsing.format",
                self.name
            )));
        }
        match self.query_type {
            QueryType::BulkDownload => {
                if self.endpoints.packages.is_none() {
                    return Err(RepoError::ConfigError(format!(
                        "repository '{}' uses bulk_download but has no endpoints.packages",
                        self.name
                    )));
                }
            }
            QueryType::Api => {
                if self.endpoints.search.is_none() && self.endpoints.info.is_none() {
                    return Err(RepoError::ConfigError(format!(
                        "repository '{}' uses api but has neither endpoints.search nor endpoints.info",
                        self.name
                    )));
                }
            }
        }
        if let Some(limits) = &self.limits {
            if limits.requests_per_minute == 0 || limits.concurrent_requests == 0 {
                return Err(RepoError::ConfigError(format!(
                    "repository '{}' has zero-valued limits",
                    self.name
                )));
            }
        }
        if let Some(mapping) = &self.version_mapping {
            if mapping.iter().any(|(k, v)| k.is_empty() || v.is_empty()) {
                return Err(RepoError::ConfigError(format!(
                    "repository '{}' has an empty version_mapping key or value",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One YAML configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryDocument {
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl RepositoryDocument {
    pub fn from_yaml(content: &str, source: &str) -> RepoResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| RepoError::ConfigError(format!("{}: {}", source, e)))
    }
}

// YAML happily reads `22.04` as a float, so reject anything that is not a
// string instead of silently coercing it.
fn deserialize_version_mapping<'de, D>(
    deserializer: D,
) -> Result<Option<BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    let mapping = match value {
        None | Some(serde_yaml::Value::Null) => return Ok(None),
        Some(serde_yaml::Value::Mapping(mapping)) => mapping,
        Some(other) => {
            return Err(D::Error::custom(format!(
                "version_mapping must be a mapping, got {:?}",
                other
            )));
        }
    };

    let mut result = BTreeMap::new();
    for (key, value) in mapping {
        let key = match key {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(D::Error::custom(format!(
                    "version_mapping key must be a string (quote it), got {:?}",
                    other
                )));
            }
        };
        let value = match value {
            serde_yaml::Value::String(s) => s,
            other => {
                return Err(D::Error::custom(format!(
                    "version_mapping value for '{}' must be a string, got {:?}",
                    key, other
                )));
            }
        };
        result.insert(key, value);
    }
    Ok(Some(result))
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_concurrent_requests() -> usize {
    5
}

fn default_limit_timeout_seconds() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    REPOSCOPE_CACHE.clone()
}

fn default_config_dirs() -> Vec<PathBuf> {
    vec![REPOSCOPE_CONFIG.join("repositories")]
}

fn default_include_builtin() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_api_cache_ttl_seconds() -> u64 {
    300
}

fn default_max_concurrent_fetches() -> usize {
    8
}

fn default_max_bulk_downloads() -> usize {
    3
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_bulk_timeout_seconds() -> u64 {
    300
}

fn default_search_timeout_seconds() -> u64 {
    120
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_decompressed_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_mirror_attempts() -> usize {
    3
}

fn default_user_agent() -> String {
    format!(
        "reposcope/{} ({}; {})",
        crate::REPOSCOPE_VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}
