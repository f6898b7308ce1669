use crate::cache::CacheStats;
use crate::config::{Platform, QueryType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Canonical package record, tagged with the repository it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub repository_name: String,
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// provider-specific fields, kept but not interpreted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Package {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repository_name: impl Into<String>,
        platform: Platform,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            homepage: None,
            license: None,
            maintainer: None,
            size: None,
            category: None,
            dependencies: None,
            tags: None,
            checksum: None,
            download_url: None,
            source_url: None,
            repository_name: repository_name.into(),
            platform,
            architecture: None,
            last_updated: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Case-insensitive substring match on name or description.
    pub fn matches(&self, query_lower: &str) -> bool {
        self.name.to_lowercase().contains(query_lower)
            || self
                .description
                .as_deref()
                .map(|d| d.to_lowercase().contains(query_lower))
                .unwrap_or(false)
    }

    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.repository_name, &self.name, &self.version)
    }
}

/// What happened to one repository during a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySource {
    pub name: String,
    pub contributed: usize,
    pub from_cache: bool,
    pub stale: bool,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepositorySource {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub packages: Vec<Package>,
    pub total_results: usize,
    #[serde(with = "duration_millis")]
    pub search_time: Duration,
    /// every repository attempted, including failures
    pub repository_sources: Vec<RepositorySource>,
}

impl SearchResult {
    pub fn source_names(&self) -> Vec<&str> {
        self.repository_sources
            .iter()
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn failed_sources(&self) -> Vec<&RepositorySource> {
        self.repository_sources
            .iter()
            .filter(|s| s.failed())
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        self.repository_sources.iter().any(|s| s.failed())
    }
}

/// Answer to "does this package exist?" that keeps "could not check" distinct
/// from "checked and absent".
#[derive(Debug, Clone, PartialEq)]
pub enum PackageAvailability {
    Found(Box<Package>),
    NotFound,
    CheckFailed { errors: Vec<(String, String)> },
}

impl PackageAvailability {
    pub fn is_found(&self) -> bool {
        matches!(self, PackageAvailability::Found(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, PackageAvailability::CheckFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryStatus {
    Ok,
    Stale,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStatistics {
    pub package_count: usize,
    pub status: RepositoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for RepositoryStatistics {
    fn default() -> Self {
        Self {
            package_count: 0,
            status: RepositoryStatus::Unknown,
            last_updated: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_repositories: usize,
    pub enabled_repositories: usize,
    pub supported_platforms: Vec<String>,
    pub supported_types: Vec<String>,
    pub cache: CacheStats,
    pub per_repository: BTreeMap<String, RepositoryStatistics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub repo_type: String,
    pub platform: Platform,
    pub enabled: bool,
    pub priority: i32,
    pub eol: bool,
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub supported_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub cache_fresh: bool,
}

/// Outcome of one repository in `update_cache`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub name: String,
    pub package_count: usize,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_name_and_description() {
        let pkg = Package::new("nginx", "1.24.0", "apt-ubuntu-jammy", Platform::Linux)
            .with_description("High performance web server");
        assert!(pkg.matches("ngin"));
        assert!(pkg.matches("web server"));
        assert!(!pkg.matches("apache"));
    }

    #[test]
    fn test_extra_fields_survive_serialization() {
        let mut pkg = Package::new("curl", "8.5.0", "brew", Platform::Macos);
        pkg.extra
            .insert("bottle".to_string(), serde_json::json!("arm64_sonoma"));
        let json = serde_json::to_string(&pkg).unwrap();
        let back: Package = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pkg);
        assert!(!json.contains("homepage"));
    }

    #[test]
    fn test_search_result_partial_flag() {
        let result = SearchResult {
            query: "redis".into(),
            packages: vec![],
            total_results: 0,
            search_time: Duration::from_millis(12),
            repository_sources: vec![RepositorySource {
                name: "dnf-fedora-f40".into(),
                contributed: 0,
                from_cache: false,
                stale: false,
                elapsed: Duration::from_millis(5),
                error: Some("Operation timed out: deadline exceeded".into()),
            }],
        };
        assert!(result.is_partial());
        assert_eq!(result.source_names(), vec!["dnf-fedora-f40"]);
    }
}
