pub mod cache;
pub mod codename;
pub mod compression;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod flight;
pub mod mirrors;
pub mod package;
pub mod parsers;
pub mod registry;
pub mod repository;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, CacheStats, CacheStatus, CacheStore};
pub use codename::{resolve_codename, resolve_repository_name};
pub use compression::CompressionFormat;
pub use config::{Config, Platform, QueryType, RepositoryConfig};
pub use error::{RepoError, RepoResult};
pub use fetcher::{Fetch, FetchKind, HttpFetcher, RawPayload};
pub use package::{
    Package, PackageAvailability, RefreshOutcome, RepositoryInfo, RepositorySource,
    RepositoryStatistics, RepositoryStatus, SearchResult, Statistics,
};
pub use parsers::{FormatParser, ParserRegistry};
pub use registry::{ConfigSource, RepositoryRegistry};
pub use repository::{RepositoryManager, SearchOptions};

pub const REPOSCOPE_VERSION: &str = "0.3.0";

use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
    pub static ref REPOSCOPE_HOME: PathBuf = {
        if let Ok(home) = std::env::var("REPOSCOPE_HOME") {
            PathBuf::from(home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".reposcope")
        } else {
            PathBuf::from("/tmp/.reposcope")
        }
    };
    pub static ref REPOSCOPE_CONFIG: PathBuf = {
        if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_home).join("reposcope")
        } else {
            REPOSCOPE_HOME.join("config")
        }
    };
    pub static ref REPOSCOPE_CACHE: PathBuf = {
        if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
            PathBuf::from(cache_home).join("reposcope")
        } else {
            REPOSCOPE_HOME.join("cache")
        }
    };
}
