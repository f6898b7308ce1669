//! Query engine over every configured repository.

use crate::{
    cache::{CacheEntry, CacheStatus, CacheStore},
    codename::resolve_repository_name,
    compression::Decompressor,
    config::{Config, Platform, RepositoryConfig},
    error::{RepoError, RepoResult},
    fetcher::{bulk_url, info_url, search_url, Fetch, FetchKind, HttpFetcher, RawPayload},
    flight::SingleFlight,
    package::{
        Package, PackageAvailability, RefreshOutcome, RepositoryInfo, RepositorySource,
        RepositoryStatistics, RepositoryStatus, SearchResult, Statistics,
    },
    parsers::{ParseContext, ParserRegistry, RepositoryDocuments},
    registry::{RegistrySnapshot, RepositoryRegistry},
    utils::format_duration,
};
use dashmap::DashMap;
use futures::future::join_all;
use fuzzy_matcher::{skim::SkimMatcherV2, FuzzyMatcher};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub platform: Option<Platform>,
    pub repo_type: Option<String>,
    /// explicit target set; enabled repositories matching the filters otherwise
    pub repositories: Option<Vec<String>>,
    pub limit: Option<usize>,
    /// fall back to fuzzy name matching when the substring match fails
    pub fuzzy: bool,
    /// overall deadline, `Config::search_timeout` when unset
    pub timeout: Option<Duration>,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn repo_type(mut self, repo_type: impl Into<String>) -> Self {
        self.repo_type = Some(repo_type.into());
        self
    }

    pub fn repositories<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repositories = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fuzzy(mut self, fuzzy: bool) -> Self {
        self.fuzzy = fuzzy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
enum ApiQuery {
    Search(String),
    Info(String),
}

impl ApiQuery {
    fn memo_key(&self, repository: &str) -> String {
        match self {
            ApiQuery::Search(text) => format!("{}:search:{}", repository, text),
            ApiQuery::Info(name) => format!("{}:info:{}", repository, name),
        }
    }
}

// Owns everything a refresh touches, so a shared in-flight refresh does not
// borrow from whichever caller happened to start it.
struct Pipeline {
    fetcher: Arc<dyn Fetch>,
    parsers: ParserRegistry,
    cache: Arc<CacheStore>,
    decompressor: Decompressor,
    default_arch: String,
    default_ttl: Duration,
    max_mirror_attempts: usize,
}

impl Pipeline {
    async fn parse(&self, repository: &RepositoryConfig, payload: &RawPayload) -> RepoResult<Vec<Package>> {
        let parser = self.parsers.get(&repository.parsing.format)?;
        let documents = RepositoryDocuments::new(self.fetcher.as_ref(), repository);
        let ctx = ParseContext::new(repository, self.decompressor, &documents)
            .with_mirror_attempts(self.max_mirror_attempts);
        parser.parse(payload, &ctx).await
    }

    /// Downloads, parses and stores a bulk index. With `reuse_fresh`, a fresh
    /// entry written since the caller last looked is returned instead.
    async fn refresh(
        &self,
        repository: &RepositoryConfig,
        reuse_fresh: bool,
    ) -> RepoResult<(Arc<CacheEntry>, bool)> {
        if reuse_fresh {
            if let Some(entry) = self.cache.peek(&repository.name).await {
                if !entry.is_expired() {
                    return Ok((entry, true));
                }
            }
        }

        let started = Instant::now();
        let url = bulk_url(repository, &self.default_arch)?;
        info!("Updating repository: {}", repository.name);
        let payload = self.fetcher.fetch(repository, &url, FetchKind::Bulk).await?;
        let packages = self.parse(repository, &payload).await?;
        let entry = self
            .cache
            .put_with_metadata(
                &repository.name,
                packages,
                repository.ttl(self.default_ttl),
                payload.metadata(),
            )
            .await?;
        info!(
            "Updated {} with {} packages in {:.2?}",
            repository.name,
            entry.packages.len(),
            started.elapsed()
        );
        Ok((entry, false))
    }

    async fn query_api(&self, repository: &RepositoryConfig, query: &ApiQuery) -> RepoResult<Vec<Package>> {
        let arch = &self.default_arch;
        let no_endpoint = || {
            RepoError::ConfigError(format!("repository '{}' has no API endpoint", repository.name))
        };
        let (url, by_name) = match query {
            ApiQuery::Search(text) => match search_url(repository, text, arch)? {
                Some(url) => (url, false),
                None => (info_url(repository, text, arch)?.ok_or_else(no_endpoint)?, true),
            },
            ApiQuery::Info(name) => match info_url(repository, name, arch)? {
                Some(url) => (url, true),
                None => (search_url(repository, name, arch)?.ok_or_else(no_endpoint)?, false),
            },
        };

        debug!("Querying {} at {}", repository.name, url);
        let payload = match self.fetcher.fetch(repository, &url, FetchKind::Api).await {
            Ok(payload) => payload,
            // by-name endpoints answer 404 for packages they do not have
            Err(e) if by_name && e.status_code() == Some(404) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        self.parse(repository, &payload).await
    }
}

struct Loaded {
    entry: Arc<CacheEntry>,
    from_cache: bool,
    stale: bool,
}

struct Found {
    packages: Vec<Package>,
    from_cache: bool,
    stale: bool,
}

struct ApiMemo {
    packages: Arc<Vec<Package>>,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
struct RecordedFailure {
    message: String,
}

struct Ranked {
    exact: bool,
    priority: i32,
    package: Package,
}

pub struct RepositoryManager {
    config: Config,
    registry: Arc<RepositoryRegistry>,
    pipeline: Arc<Pipeline>,
    refreshes: SingleFlight<(Arc<CacheEntry>, bool)>,
    api_flights: SingleFlight<Arc<Vec<Package>>>,
    api_memo: DashMap<String, ApiMemo>,
    failures: DashMap<String, RecordedFailure>,
}

impl RepositoryManager {
    /// Production setup: definitions from `config`, HTTP transport and the
    /// on-disk cache under `config.cache_dir`.
    pub async fn new(config: Config) -> RepoResult<Self> {
        config.validate()?;
        let registry = RepositoryRegistry::from_config(&config)?;
        let cache = CacheStore::open(&config.cache_dir).await?;
        let fetcher = HttpFetcher::new(&config)?;
        let manager = Self::with_components(
            config,
            Arc::new(registry),
            Arc::new(cache),
            Arc::new(fetcher),
            ParserRegistry::with_defaults(),
        );
        manager.init()?;
        Ok(manager)
    }

    pub fn with_components(
        config: Config,
        registry: Arc<RepositoryRegistry>,
        cache: Arc<CacheStore>,
        fetcher: Arc<dyn Fetch>,
        parsers: ParserRegistry,
    ) -> Self {
        let pipeline = Pipeline {
            fetcher,
            parsers,
            cache,
            decompressor: Decompressor::new(config.max_decompressed_bytes),
            default_arch: config.default_arch.clone(),
            default_ttl: config.default_ttl(),
            max_mirror_attempts: config.max_mirror_attempts,
        };
        Self {
            config,
            registry,
            pipeline: Arc::new(pipeline),
            refreshes: SingleFlight::new(),
            api_flights: SingleFlight::new(),
            api_memo: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// Checks that every enabled repository names a registered format.
    pub fn init(&self) -> RepoResult<()> {
        let snapshot = self.registry.snapshot();
        check_formats(&self.pipeline.parsers, &snapshot)?;
        info!(
            "Repository manager ready: {} repositories, formats {}",
            snapshot.len(),
            self.pipeline.parsers.formats().join(", ")
        );
        Ok(())
    }

    /// Re-reads repository definitions. The current set stays active on failure.
    pub fn reload(&self) -> RepoResult<usize> {
        let parsers = &self.pipeline.parsers;
        let snapshot = self
            .registry
            .reload_with(|snapshot| check_formats(parsers, snapshot))?;
        self.api_memo.clear();
        self.failures.retain(|name, _| snapshot.contains(name));
        Ok(snapshot.len())
    }

    pub async fn close(&self) -> RepoResult<()> {
        self.pipeline.cache.flush_counters().await?;
        debug!("Repository manager closed");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.pipeline.cache
    }

    fn repository(&self, name: &str) -> RepoResult<Arc<RepositoryConfig>> {
        self.registry
            .get(name)
            .ok_or_else(|| RepoError::RepositoryNotFound(name.to_string()))
    }

    fn record_failure(&self, name: &str, error: &RepoError) {
        self.failures.insert(
            name.to_string(),
            RecordedFailure {
                message: error.to_string(),
            },
        );
    }

    /// Full package list of a bulk repository, in index order.
    pub async fn get_packages(&self, name: &str, use_cache: bool) -> RepoResult<Vec<Package>> {
        let repository = self.repository(name)?;
        if repository.is_api() {
            return Err(RepoError::Unsupported(format!(
                "repository '{}' is queried per package and has no full listing",
                name
            )));
        }
        let loaded = self.load(&repository, use_cache).await?;
        Ok(loaded.entry.packages.clone())
    }

    async fn load(&self, repository: &Arc<RepositoryConfig>, use_cache: bool) -> RepoResult<Loaded> {
        if use_cache {
            if let Some(entry) = self.pipeline.cache.get(&repository.name, None).await {
                return Ok(Loaded {
                    entry,
                    from_cache: true,
                    stale: false,
                });
            }
        }

        let pipeline = self.pipeline.clone();
        let target = repository.clone();
        let result = self
            .refreshes
            .run(&repository.name, move || async move {
                pipeline.refresh(&target, use_cache).await
            })
            .await;

        match result {
            Ok((entry, reused)) => {
                self.failures.remove(&repository.name);
                Ok(Loaded {
                    entry,
                    from_cache: reused,
                    stale: false,
                })
            }
            Err(e) => {
                self.record_failure(&repository.name, &e);
                if use_cache {
                    if let Some(entry) = self.pipeline.cache.peek(&repository.name).await {
                        warn!(
                            "Refreshing {} failed ({}), serving cache from {} ago",
                            repository.name,
                            e,
                            format_duration(entry.age().as_secs())
                        );
                        return Ok(Loaded {
                            entry,
                            from_cache: true,
                            stale: true,
                        });
                    }
                }
                Err(e)
            }
        }
    }

    async fn api_lookup(
        &self,
        repository: &Arc<RepositoryConfig>,
        query: ApiQuery,
    ) -> RepoResult<(Arc<Vec<Package>>, bool)> {
        let key = query.memo_key(&repository.name);
        let ttl = self.config.api_cache_ttl();
        let memo = self
            .api_memo
            .get(&key)
            .map(|m| (m.packages.clone(), m.stored_at));
        if let Some((packages, stored_at)) = memo {
            if stored_at.elapsed() < ttl {
                debug!("API memo hit for {}", key);
                return Ok((packages, true));
            }
        }

        let pipeline = self.pipeline.clone();
        let target = repository.clone();
        let result = self
            .api_flights
            .run(&key, move || async move {
                pipeline.query_api(&target, &query).await.map(Arc::new)
            })
            .await;

        match result {
            Ok(packages) => {
                self.failures.remove(&repository.name);
                self.api_memo.insert(
                    key,
                    ApiMemo {
                        packages: packages.clone(),
                        stored_at: Instant::now(),
                    },
                );
                Ok((packages, false))
            }
            Err(e) => {
                self.record_failure(&repository.name, &e);
                Err(e)
            }
        }
    }

    fn search_targets(
        &self,
        snapshot: &RegistrySnapshot,
        options: &SearchOptions,
    ) -> (Vec<Arc<RepositoryConfig>>, Vec<String>) {
        let repo_type = options.repo_type.as_deref();
        let Some(names) = &options.repositories else {
            let targets = snapshot
                .list(options.platform, repo_type)
                .into_iter()
                .filter(|r| r.enabled)
                .collect();
            return (targets, Vec::new());
        };

        let mut targets = Vec::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match snapshot.get(name) {
                Some(repo) if accepts(repo, options.platform, repo_type) => targets.push(repo.clone()),
                Some(_) => debug!("{} does not match the search filters", name),
                None => missing.push(name.clone()),
            }
        }
        (targets, missing)
    }

    async fn search_repository(
        &self,
        repository: &Arc<RepositoryConfig>,
        query: &str,
        query_lower: &str,
        fuzzy: bool,
    ) -> RepoResult<Found> {
        if repository.is_api() {
            // the endpoint did the matching
            let (packages, memoised) = self
                .api_lookup(repository, ApiQuery::Search(query.to_string()))
                .await?;
            return Ok(Found {
                packages: packages.as_ref().clone(),
                from_cache: memoised,
                stale: false,
            });
        }

        let loaded = self.load(repository, true).await?;
        let matcher = fuzzy.then(SkimMatcherV2::default);
        let packages = loaded
            .entry
            .packages
            .iter()
            .filter(|p| {
                p.matches(query_lower)
                    || matcher
                        .as_ref()
                        .map(|m| m.fuzzy_match(&p.name, query_lower).is_some())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(Found {
            packages,
            from_cache: loaded.from_cache,
            stale: loaded.stale,
        })
    }

    /// Searches every target repository concurrently under one deadline.
    ///
    /// A repository that fails or misses the deadline contributes nothing and
    /// is reported in `repository_sources`; the search itself still succeeds.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> RepoResult<SearchResult> {
        let started = Instant::now();
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResult {
                query: String::new(),
                packages: Vec::new(),
                total_results: 0,
                search_time: started.elapsed(),
                repository_sources: Vec::new(),
            });
        }

        let snapshot = self.registry.snapshot();
        let (targets, missing) = self.search_targets(&snapshot, options);
        let timeout = options.timeout.unwrap_or_else(|| self.config.search_timeout());
        let deadline = tokio::time::Instant::now() + timeout;
        let query_lower = query.to_lowercase();

        debug!("Searching {} repositories for '{}'", targets.len(), query);
        let tasks: Vec<_> = targets
            .iter()
            .map(|repository| {
                let query_lower = query_lower.as_str();
                async move {
                    let started = Instant::now();
                    let search = self.search_repository(repository, query, query_lower, options.fuzzy);
                    let outcome = match tokio::time::timeout_at(deadline, search).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            let error = RepoError::Timeout(format!("search deadline of {:?} exceeded", timeout));
                            self.record_failure(&repository.name, &error);
                            Err(error)
                        }
                    };
                    (repository, outcome, started.elapsed())
                }
            })
            .collect();
        let outcomes = join_all(tasks).await;

        let mut ranked = Vec::new();
        let mut seen = HashSet::new();
        let mut contributed: HashMap<String, usize> = HashMap::new();
        let mut sources = Vec::with_capacity(outcomes.len() + missing.len());

        for (repository, outcome, elapsed) in outcomes {
            match outcome {
                Ok(found) => {
                    for package in found.packages {
                        let (repo, name, version) = package.identity();
                        if !seen.insert((repo.to_string(), name.to_string(), version.to_string())) {
                            continue;
                        }
                        *contributed.entry(repository.name.clone()).or_default() += 1;
                        ranked.push(Ranked {
                            exact: package.name.to_lowercase() == query_lower,
                            priority: repository.priority,
                            package,
                        });
                    }
                    sources.push(RepositorySource {
                        name: repository.name.clone(),
                        contributed: contributed.get(&repository.name).copied().unwrap_or(0),
                        from_cache: found.from_cache,
                        stale: found.stale,
                        elapsed,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Search in {} failed: {}", repository.name, e);
                    sources.push(RepositorySource {
                        name: repository.name.clone(),
                        contributed: 0,
                        from_cache: false,
                        stale: false,
                        elapsed,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        for name in missing {
            let error = RepoError::RepositoryNotFound(name.clone());
            sources.push(RepositorySource {
                name,
                contributed: 0,
                from_cache: false,
                stale: false,
                elapsed: Duration::ZERO,
                error: Some(error.to_string()),
            });
        }

        rank(&mut ranked);
        let total_results = ranked.len();
        let mut packages: Vec<Package> = ranked.into_iter().map(|r| r.package).collect();
        if let Some(limit) = options.limit {
            packages.truncate(limit);
        }

        let search_time = started.elapsed();
        info!(
            "Found {} packages for '{}' in {:.2?}",
            total_results, query, search_time
        );
        Ok(SearchResult {
            query: query.to_string(),
            packages,
            total_results,
            search_time,
            repository_sources: sources,
        })
    }

    async fn find_exact(&self, repository: &Arc<RepositoryConfig>, name: &str, name_lower: &str) -> RepoResult<Vec<Package>> {
        let candidates: Vec<Package> = if repository.is_api() {
            let (packages, _) = self
                .api_lookup(repository, ApiQuery::Info(name.to_string()))
                .await?;
            packages.as_ref().clone()
        } else {
            self.load(repository, true).await?.entry.packages.clone()
        };
        Ok(candidates
            .into_iter()
            .filter(|p| p.name.to_lowercase() == name_lower)
            .collect())
    }

    // exact-name matches across enabled repositories, plus who could not answer
    async fn lookup_exact(
        &self,
        name: &str,
        platform: Option<Platform>,
        repo_type: Option<&str>,
    ) -> (Vec<(i32, Package)>, Vec<(String, RepoError)>) {
        let targets: Vec<Arc<RepositoryConfig>> = self
            .registry
            .list(platform, repo_type)
            .into_iter()
            .filter(|r| r.enabled)
            .collect();
        let name_lower = name.to_lowercase();
        let deadline = tokio::time::Instant::now() + self.config.search_timeout();

        let tasks: Vec<_> = targets
            .iter()
            .map(|repository| {
                let name_lower = name_lower.as_str();
                async move {
                    let lookup = self.find_exact(repository, name, name_lower);
                    let outcome = tokio::time::timeout_at(deadline, lookup)
                        .await
                        .unwrap_or_else(|elapsed| Err(elapsed.into()));
                    (repository, outcome)
                }
            })
            .collect();

        let mut found = Vec::new();
        let mut errors = Vec::new();
        for (repository, outcome) in join_all(tasks).await {
            match outcome {
                Ok(packages) => {
                    found.extend(packages.into_iter().map(|p| (repository.priority, p)));
                }
                Err(e) => {
                    warn!("Looking up {} in {} failed: {}", name, repository.name, e);
                    errors.push((repository.name.clone(), e));
                }
            }
        }
        (found, errors)
    }

    /// Exact (case-insensitive) name lookup. With `version`, a matching version
    /// wins; otherwise the highest-priority repository's entry.
    pub async fn get_package_details(
        &self,
        name: &str,
        version: Option<&str>,
        platform: Option<Platform>,
        repo_type: Option<&str>,
    ) -> RepoResult<Option<Package>> {
        let (candidates, _) = self.lookup_exact(name, platform, repo_type).await;
        Ok(pick(candidates, version))
    }

    /// Like [`get_package_details`](Self::get_package_details), but keeps
    /// "could not check" apart from "not there".
    pub async fn check_package(
        &self,
        name: &str,
        platform: Option<Platform>,
        repo_type: Option<&str>,
    ) -> PackageAvailability {
        let (candidates, errors) = self.lookup_exact(name, platform, repo_type).await;
        if let Some(package) = pick(candidates, None) {
            return PackageAvailability::Found(Box::new(package));
        }
        if errors.is_empty() {
            PackageAvailability::NotFound
        } else {
            PackageAvailability::CheckFailed {
                errors: errors
                    .into_iter()
                    .map(|(name, e)| (name, e.to_string()))
                    .collect(),
            }
        }
    }

    /// Refreshes bulk repositories concurrently. Without `force`, fresh entries
    /// are left alone. API repositories have nothing to refresh.
    pub async fn update_cache(&self, names: Option<&[String]>, force: bool) -> RepoResult<Vec<RefreshOutcome>> {
        let targets: Vec<Arc<RepositoryConfig>> = match names {
            Some(names) => names
                .iter()
                .map(|name| self.repository(name))
                .collect::<RepoResult<_>>()?,
            None => self
                .registry
                .list(None, None)
                .into_iter()
                .filter(|r| r.enabled)
                .collect(),
        };

        info!("Updating {} repositories", targets.len());
        let tasks: Vec<_> = targets
            .iter()
            .map(|repository| self.refresh_one(repository, force))
            .collect();
        let outcomes = join_all(tasks).await;

        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        if failed > 0 {
            warn!("{} of {} repositories failed to update", failed, outcomes.len());
        } else {
            info!("All repositories updated successfully");
        }
        Ok(outcomes)
    }

    async fn refresh_one(&self, repository: &Arc<RepositoryConfig>, force: bool) -> RefreshOutcome {
        let mut outcome = RefreshOutcome {
            name: repository.name.clone(),
            package_count: 0,
            skipped: false,
            error: None,
        };
        if repository.is_api() {
            outcome.skipped = true;
            return outcome;
        }
        if !force {
            if let Some(entry) = self.pipeline.cache.peek(&repository.name).await {
                if !entry.is_expired() {
                    debug!("{} is fresh, skipping", repository.name);
                    outcome.package_count = entry.packages.len();
                    outcome.skipped = true;
                    return outcome;
                }
            }
        }
        match self.load(repository, false).await {
            Ok(loaded) => outcome.package_count = loaded.entry.packages.len(),
            Err(e) => {
                warn!("Failed to update repository {}: {}", repository.name, e);
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Drops expired cache entries and API answers. Returns the number of
    /// cache entries removed.
    pub async fn cleanup_cache(&self) -> RepoResult<usize> {
        let removed = self.pipeline.cache.cleanup_expired().await?;
        let ttl = self.config.api_cache_ttl();
        self.api_memo.retain(|_, memo| memo.stored_at.elapsed() < ttl);
        Ok(removed)
    }

    pub async fn clear_cache(&self) -> RepoResult<usize> {
        let removed = self.pipeline.cache.clear_all().await?;
        self.api_memo.clear();
        self.failures.clear();
        Ok(removed)
    }

    pub async fn cache_status(&self, name: &str) -> RepoResult<Option<CacheStatus>> {
        self.repository(name)?;
        Ok(self.pipeline.cache.peek(name).await.map(|entry| entry.status()))
    }

    /// Repository serving `provider` on `os` `version`, from the live definitions.
    pub fn resolve_repository(&self, provider: &str, os: Option<&str>, version: Option<&str>) -> String {
        let snapshot = self.registry.snapshot();
        resolve_repository_name(provider, os, version, snapshot.iter())
    }

    pub async fn is_available(&self, name: &str) -> RepoResult<bool> {
        let repository = self.repository(name)?;
        Ok(self
            .pipeline
            .fetcher
            .is_available(&repository, &self.pipeline.default_arch)
            .await)
    }

    /// Every configured repository, disabled ones included.
    pub async fn get_all_repository_info(
        &self,
        platform: Option<Platform>,
        repo_type: Option<&str>,
    ) -> Vec<RepositoryInfo> {
        let mut infos = Vec::new();
        for repo in self.registry.list(platform, repo_type) {
            let entry = self.pipeline.cache.peek(&repo.name).await;
            infos.push(RepositoryInfo {
                name: repo.name.clone(),
                repo_type: repo.repo_type.clone(),
                platform: repo.platform,
                enabled: repo.enabled,
                priority: repo.priority,
                eol: repo.eol,
                query_type: repo.query_type,
                description: repo.description.clone(),
                supported_versions: repo
                    .version_mapping
                    .as_ref()
                    .map(|m| m.keys().cloned().collect())
                    .unwrap_or_default(),
                package_count: entry.as_ref().map(|e| e.packages.len()),
                last_updated: entry.as_ref().map(|e| e.fetched_at),
                cache_fresh: entry.as_ref().map(|e| !e.is_expired()).unwrap_or(false),
            });
        }
        infos
    }

    pub async fn get_statistics(&self) -> RepoResult<Statistics> {
        let snapshot = self.registry.snapshot();
        let mut platforms = BTreeSet::new();
        let mut types = BTreeSet::new();
        let mut per_repository = BTreeMap::new();

        for repo in snapshot.iter() {
            platforms.insert(repo.platform.as_str().to_string());
            types.insert(repo.repo_type.clone());
            if !repo.enabled {
                continue;
            }
            let entry = self.pipeline.cache.peek(&repo.name).await;
            let failure = self.failures.get(&repo.name).map(|f| f.value().clone());
            per_repository.insert(
                repo.name.clone(),
                repository_statistics(entry.as_deref(), failure),
            );
        }

        Ok(Statistics {
            total_repositories: snapshot.len(),
            enabled_repositories: snapshot.iter().filter(|r| r.enabled).count(),
            supported_platforms: platforms.into_iter().collect(),
            supported_types: types.into_iter().collect(),
            cache: self.pipeline.cache.stats().await?,
            per_repository,
        })
    }
}

fn check_formats(parsers: &ParserRegistry, snapshot: &RegistrySnapshot) -> RepoResult<()> {
    for repo in snapshot.iter().filter(|r| r.enabled) {
        if !parsers.supports(&repo.parsing.format) {
            return Err(RepoError::ConfigError(format!(
                "repository '{}' uses unknown parsing format '{}'",
                repo.name, repo.parsing.format
            )));
        }
    }
    Ok(())
}

fn accepts(repo: &RepositoryConfig, platform: Option<Platform>, repo_type: Option<&str>) -> bool {
    platform.map(|p| repo.platform.serves(p)).unwrap_or(true)
        && repo_type.map(|t| repo.repo_type == t).unwrap_or(true)
}

// exact name first, then repository priority, then name; stable otherwise
fn rank(ranked: &mut [Ranked]) {
    ranked.sort_by(|a, b| {
        b.exact
            .cmp(&a.exact)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.package.name.cmp(&b.package.name))
    });
}

fn pick(mut candidates: Vec<(i32, Package)>, version: Option<&str>) -> Option<Package> {
    candidates.sort_by(|(a, _), (b, _)| b.cmp(a));
    if let Some(version) = version {
        if let Some(i) = candidates.iter().position(|(_, p)| p.version == version) {
            return Some(candidates.swap_remove(i).1);
        }
    }
    candidates.into_iter().next().map(|(_, p)| p)
}

fn repository_statistics(entry: Option<&CacheEntry>, failure: Option<RecordedFailure>) -> RepositoryStatistics {
    let status = match (entry, &failure) {
        (Some(_), Some(_)) => RepositoryStatus::Stale,
        (Some(entry), None) if entry.is_expired() => RepositoryStatus::Stale,
        (Some(_), None) => RepositoryStatus::Ok,
        (None, Some(_)) => RepositoryStatus::Error,
        (None, None) => RepositoryStatus::Unknown,
    };
    RepositoryStatistics {
        package_count: entry.map(|e| e.packages.len()).unwrap_or(0),
        status,
        last_updated: entry.map(|e| e.fetched_at),
        error: failure.map(|f| f.message),
    }
}
