//! Format parsers: raw repository payloads in, canonical packages out.
//!
//! Every parser follows the same policy. A record that cannot be mapped (no
//! name, no version, wrong shape) is skipped and counted. A payload that is not
//! a valid document of the declared format fails the whole parse with
//! [`RepoError::ParseError`].

pub mod apk;
pub mod debian;
pub mod json;
pub mod repomd;
pub mod text;

use crate::{
    compression::Decompressor,
    config::{ParsingConfig, RepositoryConfig},
    error::{RepoError, RepoResult},
    fetcher::{Fetch, FetchKind, RawPayload},
    package::Package,
    utils::{parse_timestamp, split_list},
};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use apk::ApkIndexParser;
pub use debian::DebianPackagesParser;
pub use json::JsonParser;
pub use repomd::RepomdParser;
pub use text::TextLinesParser;

/// Lets a parser pull the secondary documents a format links to.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, url: &str) -> RepoResult<RawPayload>;
}

/// Fetches linked documents through the repository's own transport and limits.
pub struct RepositoryDocuments<'a> {
    fetcher: &'a dyn Fetch,
    repository: &'a RepositoryConfig,
}

impl<'a> RepositoryDocuments<'a> {
    pub fn new(fetcher: &'a dyn Fetch, repository: &'a RepositoryConfig) -> Self {
        Self {
            fetcher,
            repository,
        }
    }
}

#[async_trait]
impl DocumentSource for RepositoryDocuments<'_> {
    async fn fetch_document(&self, url: &str) -> RepoResult<RawPayload> {
        self.fetcher
            .fetch(self.repository, url, FetchKind::Bulk)
            .await
    }
}

pub struct ParseContext<'a> {
    pub repository: &'a RepositoryConfig,
    pub decompressor: Decompressor,
    pub documents: &'a dyn DocumentSource,
    pub max_mirror_attempts: usize,
}

impl<'a> ParseContext<'a> {
    pub fn new(
        repository: &'a RepositoryConfig,
        decompressor: Decompressor,
        documents: &'a dyn DocumentSource,
    ) -> Self {
        Self {
            repository,
            decompressor,
            documents,
            max_mirror_attempts: 3,
        }
    }

    pub fn with_mirror_attempts(mut self, attempts: usize) -> Self {
        self.max_mirror_attempts = attempts.max(1);
        self
    }

    pub fn parsing(&self) -> &ParsingConfig {
        &self.repository.parsing
    }
}

#[async_trait]
pub trait FormatParser: Send + Sync {
    /// Identifier used in `parsing.format`.
    fn format(&self) -> &'static str;

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>>;
}

pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn FormatParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RepomdParser));
        registry.register(Arc::new(DebianPackagesParser));
        registry.register(Arc::new(JsonParser));
        registry.register(Arc::new(ApkIndexParser));
        registry.register(Arc::new(TextLinesParser));
        registry.alias("repomd", "rpm_metadata");
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn FormatParser>) {
        debug!("Registering parser for {}", parser.format());
        self.parsers.insert(parser.format().to_string(), parser);
    }

    /// Makes `alias` resolve to the parser registered as `format`.
    pub fn alias(&mut self, alias: &str, format: &str) {
        if let Some(parser) = self.parsers.get(format).cloned() {
            self.parsers.insert(alias.to_string(), parser);
        }
    }

    pub fn get(&self, format: &str) -> RepoResult<Arc<dyn FormatParser>> {
        self.parsers
            .get(format)
            .cloned()
            .ok_or_else(|| RepoError::ConfigError(format!("no parser for format '{}'", format)))
    }

    pub fn supports(&self, format: &str) -> bool {
        self.parsers.contains_key(format)
    }

    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = self.parsers.keys().map(|k| k.as_str()).collect();
        formats.sort_unstable();
        formats
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Resolves canonical field names to source keys: the repository's
/// `parsing.fields` first, then the parser's defaults, then the canonical name.
pub struct FieldMapper<'a> {
    ctx: &'a ParseContext<'a>,
    defaults: &'static [(&'static str, &'static str)],
}

const CANONICAL_FIELDS: [&str; 15] = [
    "name",
    "version",
    "description",
    "homepage",
    "license",
    "maintainer",
    "size",
    "category",
    "dependencies",
    "tags",
    "checksum",
    "download_url",
    "source_url",
    "architecture",
    "last_updated",
];

impl<'a> FieldMapper<'a> {
    pub fn new(ctx: &'a ParseContext<'a>, defaults: &'static [(&'static str, &'static str)]) -> Self {
        Self { ctx, defaults }
    }

    pub fn source(&self, canonical: &'a str) -> &'a str {
        let parsing = self.ctx.parsing();
        if parsing.fields.contains_key(canonical) {
            return parsing.source_field(canonical);
        }
        self.defaults
            .iter()
            .find(|(c, _)| *c == canonical)
            .map(|(_, s)| *s)
            .unwrap_or(canonical)
    }

    /// Maps one normalised record. `None` means the record lacks a name or version.
    pub fn map(&self, record: &Map<String, Value>) -> Option<Package> {
        let name = text(lookup(record, self.source("name"))?)?;
        let version = text(lookup(record, self.source("version"))?)?;

        let repo = self.ctx.repository;
        let mut package = Package::new(name, version, repo.name.clone(), repo.platform);
        let field = |canonical: &'a str| lookup(record, self.source(canonical));

        package.description = field("description").and_then(text);
        package.homepage = field("homepage").and_then(text);
        package.license = field("license").and_then(text);
        package.maintainer = field("maintainer").and_then(text);
        package.size = field("size").and_then(number);
        package.category = field("category").and_then(text);
        package.dependencies = field("dependencies").and_then(list);
        package.tags = field("tags").and_then(list);
        package.checksum = field("checksum").and_then(text);
        package.download_url = field("download_url").and_then(text);
        package.source_url = field("source_url").and_then(text);
        package.architecture = field("architecture")
            .and_then(text)
            .or_else(|| repo.architecture.clone());
        package.last_updated = field("last_updated").and_then(|v| match v {
            Value::Number(n) => n.as_i64().and_then(|s| parse_timestamp(&s.to_string())),
            other => text(other).and_then(|s| parse_timestamp(&s)),
        });

        let consumed: HashSet<&str> = CANONICAL_FIELDS
            .iter()
            .map(|c| self.source(c))
            .collect();
        for (key, value) in record {
            if consumed.contains(key.as_str()) {
                continue;
            }
            if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                package.extra.insert(key.clone(), value.clone());
            }
        }
        Some(package)
    }
}

/// Resolves `a.b.c` inside nested objects. A literal key containing dots wins.
pub fn lookup<'v>(record: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    if let Some(value) = record.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() { None } else { Some(s) }
}

fn number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn list(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(text).collect(),
        // dependency maps such as npm's {"dep": "^1.0"}
        Value::Object(map) => map.keys().cloned().collect(),
        Value::String(s) => split_list(s),
        _ => return None,
    };
    if items.is_empty() { None } else { Some(items) }
}

/// Logs the skip summary the same way for every format.
pub(crate) fn report_skipped(format: &str, repository: &str, parsed: usize, skipped: usize) {
    if skipped > 0 {
        warn!(
            "Skipped {} malformed {} records in {} ({} parsed)",
            skipped, format, repository, parsed
        );
    } else {
        debug!("Parsed {} {} records from {}", parsed, format, repository);
    }
}

const ITEMS_PER_YIELD: usize = 512;

/// Hands control back to the runtime every few hundred items so a large
/// index cannot starve timers or sibling repositories.
pub(crate) async fn checkpoint(handled: usize) {
    if handled > 0 && handled % ITEMS_PER_YIELD == 0 {
        tokio::task::yield_now().await;
    }
}
