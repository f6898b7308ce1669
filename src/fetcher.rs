use crate::{
    config::{AuthType, Config, Limits, QueryType, RepositoryConfig},
    error::{RepoError, RepoResult},
    utils::{parse_timestamp, substitute_placeholders},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, warn};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// full index download, shares the bulk pool
    Bulk,
    /// per-query call, subject to the repository's limits
    Api,
}

#[derive(Debug, Clone)]
pub struct RawPayload {
    pub url: String,
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl RawPayload {
    pub fn new(url: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            bytes: bytes.into(),
            content_type: None,
            etag: None,
            last_modified: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Validators worth keeping next to a cache entry.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("source_url".to_string(), self.url.clone());
        if let Some(etag) = &self.etag {
            metadata.insert("etag".to_string(), etag.clone());
        }
        if let Some(last_modified) = &self.last_modified {
            metadata.insert("last_modified".to_string(), last_modified.clone());
        }
        metadata
    }
}

/// Transport seam between the query engine and the network.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        repository: &RepositoryConfig,
        url: &str,
        kind: FetchKind,
    ) -> RepoResult<RawPayload>;

    /// Cheap reachability probe of the repository's primary endpoint.
    ///
    /// `default_arch` fills `{arch}` when the repository does not pin one, the
    /// same way the fetch path builds its URLs.
    async fn is_available(&self, repository: &RepositoryConfig, default_arch: &str) -> bool {
        let url = match probe_url(repository, default_arch) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let kind = match repository.query_type {
            QueryType::BulkDownload => FetchKind::Bulk,
            QueryType::Api => FetchKind::Api,
        };
        self.fetch(repository, &url, kind).await.is_ok()
    }
}

fn url_vars<'a>(repository: &RepositoryConfig, default_arch: &str) -> HashMap<&'a str, String> {
    let mut vars = HashMap::new();
    vars.insert(
        "arch",
        repository
            .architecture
            .clone()
            .unwrap_or_else(|| default_arch.to_string()),
    );
    vars.insert("name", repository.name.clone());
    vars
}

/// The index URL of a bulk repository.
pub fn bulk_url(repository: &RepositoryConfig, default_arch: &str) -> RepoResult<String> {
    let template = repository.endpoints.packages.as_deref().ok_or_else(|| {
        RepoError::ConfigError(format!(
            "repository '{}' has no packages endpoint",
            repository.name
        ))
    })?;
    substitute_placeholders(template, &url_vars(repository, default_arch), &["arch", "name"])
}

pub fn search_url(
    repository: &RepositoryConfig,
    query: &str,
    default_arch: &str,
) -> RepoResult<Option<String>> {
    let Some(template) = repository.endpoints.search.as_deref() else {
        return Ok(None);
    };
    let mut vars = url_vars(repository, default_arch);
    vars.insert("query", query.to_string());
    substitute_placeholders(template, &vars, &["arch", "name"]).map(Some)
}

pub fn info_url(
    repository: &RepositoryConfig,
    package: &str,
    default_arch: &str,
) -> RepoResult<Option<String>> {
    let Some(template) = repository.endpoints.info.as_deref() else {
        return Ok(None);
    };
    let mut vars = url_vars(repository, default_arch);
    vars.insert("package", package.to_string());
    substitute_placeholders(template, &vars, &["arch", "name"]).map(Some)
}

fn probe_url(repository: &RepositoryConfig, default_arch: &str) -> RepoResult<String> {
    match repository.query_type {
        QueryType::BulkDownload => bulk_url(repository, default_arch),
        QueryType::Api => {
            if let Some(url) = search_url(repository, "test", default_arch)? {
                return Ok(url);
            }
            info_url(repository, "test", default_arch)?.ok_or_else(|| {
                RepoError::ConfigError(format!("repository '{}' has no endpoint", repository.name))
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// Per-repository gate for API calls. Rebuilt when the repository's limits change.
struct RepositoryGate {
    limits: Limits,
    limiter: DefaultDirectRateLimiter,
    semaphore: Arc<Semaphore>,
}

impl RepositoryGate {
    fn new(limits: Limits) -> Self {
        let per_minute = NonZeroU32::new(limits.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            semaphore: Arc::new(Semaphore::new(limits.concurrent_requests.max(1))),
            limits,
        }
    }
}

struct Failure {
    error: RepoError,
    retry_after: Option<Duration>,
}

impl From<RepoError> for Failure {
    fn from(error: RepoError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        RepoError::from(err).into()
    }
}

impl From<tokio::sync::AcquireError> for Failure {
    fn from(err: tokio::sync::AcquireError) -> Self {
        RepoError::from(err).into()
    }
}

pub struct HttpFetcher {
    client: Client,
    global: Arc<Semaphore>,
    bulk: Arc<Semaphore>,
    gates: DashMap<String, Arc<RepositoryGate>>,
    retry: RetryPolicy,
    request_timeout: Duration,
    bulk_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> RepoResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| RepoError::ConfigError(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            global: Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1))),
            bulk: Arc::new(Semaphore::new(config.max_bulk_downloads.max(1))),
            gates: DashMap::new(),
            retry: RetryPolicy::from_config(config),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            bulk_timeout: Duration::from_secs(config.bulk_timeout_seconds),
        }
    }

    fn gate(&self, repository: &RepositoryConfig) -> Arc<RepositoryGate> {
        let limits = repository.limits();
        if let Some(gate) = self.gates.get(&repository.name) {
            if gate.limits == limits {
                return gate.clone();
            }
        }
        let gate = Arc::new(RepositoryGate::new(limits));
        self.gates.insert(repository.name.clone(), gate.clone());
        gate
    }

    fn timeout_for(&self, repository: &RepositoryConfig, kind: FetchKind) -> Duration {
        match kind {
            FetchKind::Bulk => self.bulk_timeout,
            FetchKind::Api => repository
                .limits
                .as_ref()
                .map(|l| Duration::from_secs(l.timeout_seconds))
                .unwrap_or(self.request_timeout),
        }
    }

    async fn fetch_once(
        &self,
        repository: &RepositoryConfig,
        url: &str,
        kind: FetchKind,
    ) -> Result<RawPayload, Failure> {
        // rate limit first so a throttled repository does not sit on global permits
        let _repo_permit = match kind {
            FetchKind::Api => {
                let gate = self.gate(repository);
                gate.limiter.until_ready().await;
                Some(gate.semaphore.clone().acquire_owned().await?)
            }
            FetchKind::Bulk => None,
        };
        let _bulk_permit = match kind {
            FetchKind::Bulk => Some(self.bulk.acquire().await?),
            FetchKind::Api => None,
        };
        let _global_permit = self.global.acquire().await?;

        debug!("Fetching {} for {}", url, repository.name);
        let request = self
            .client
            .get(url)
            .timeout(self.timeout_for(repository, kind));
        let response = apply_auth(request, repository).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after)
            } else {
                None
            };
            return Err(Failure {
                error: RepoError::http_status(url, status.as_u16()),
                retry_after,
            });
        }

        let header_value = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_type = header_value(header::CONTENT_TYPE);
        let etag = header_value(header::ETAG);
        let last_modified = header_value(header::LAST_MODIFIED);
        let bytes = response.bytes().await?;

        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(RawPayload {
            url: url.to_string(),
            bytes,
            content_type,
            etag,
            last_modified,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        repository: &RepositoryConfig,
        url: &str,
        kind: FetchKind,
    ) -> RepoResult<RawPayload> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(repository, url, kind).await {
                Ok(payload) => return Ok(payload),
                Err(failure) if failure.error.is_transient() && attempt < self.retry.attempts => {
                    let delay = failure
                        .retry_after
                        .map(|d| d.min(self.retry.max_delay))
                        .unwrap_or_else(|| self.retry.delay_for(attempt));
                    attempt += 1;
                    debug!(
                        "Retrying {} in {:?} (attempt {}/{}): {}",
                        url, delay, attempt, self.retry.attempts, failure.error
                    );
                    sleep(delay).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn is_available(&self, repository: &RepositoryConfig, default_arch: &str) -> bool {
        let url = match probe_url(repository, default_arch) {
            Ok(url) => url,
            Err(e) => {
                debug!("Cannot probe {}: {}", repository.name, e);
                return false;
            }
        };
        let request = self.client.head(&url).timeout(self.request_timeout);
        match apply_auth(request, repository).send().await {
            // some registries refuse HEAD but are otherwise fine
            Ok(response) => {
                response.status().is_success()
                    || response.status() == StatusCode::METHOD_NOT_ALLOWED
            }
            Err(e) => {
                debug!("{} is unreachable: {}", repository.name, e);
                false
            }
        }
    }
}

fn apply_auth(request: RequestBuilder, repository: &RepositoryConfig) -> RequestBuilder {
    let Some(auth) = &repository.auth else {
        return request;
    };
    let secret = match std::env::var(&auth.credentials_env) {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            warn!(
                "Credentials variable {} for {} is not set, sending request unauthenticated",
                auth.credentials_env, repository.name
            );
            return request;
        }
    };

    match auth.auth_type {
        AuthType::Bearer => request.bearer_auth(secret),
        AuthType::Token => request.header(header::AUTHORIZATION, format!("token {}", secret)),
        AuthType::Basic => {
            let username = auth
                .username_env
                .as_ref()
                .and_then(|var| std::env::var(var).ok());
            match username {
                Some(username) => request.basic_auth(username, Some(secret)),
                None => request.basic_auth(secret, None::<&str>),
            }
        }
        AuthType::Header => {
            let name = auth.header.as_deref().unwrap_or("X-API-Key");
            request.header(name, secret)
        }
    }
}

/// `Retry-After` is either delta seconds or an HTTP date.
fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = parse_timestamp(value)?;
    Some((at - Utc::now()).to_std().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, ParsingConfig, Platform};
    use crate::testing::MockFetch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn repo(query_type: QueryType, endpoints: Endpoints) -> RepositoryConfig {
        RepositoryConfig {
            name: "test-repo".to_string(),
            repo_type: "apt".to_string(),
            platform: Platform::Linux,
            enabled: true,
            priority: 0,
            eol: false,
            query_type,
            endpoints,
            parsing: ParsingConfig {
                format: "json".to_string(),
                ..Default::default()
            },
            version_mapping: None,
            limits: None,
            auth: None,
            description: None,
            architecture: None,
            cache: None,
        }
    }

    #[test]
    fn test_bulk_url_substitutes_arch_verbatim() {
        let mut r = repo(
            QueryType::BulkDownload,
            Endpoints {
                packages: Some("https://a.example/dists/jammy/main/binary-{arch}/Packages.gz".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            bulk_url(&r, "x86_64").unwrap(),
            "https://a.example/dists/jammy/main/binary-x86_64/Packages.gz"
        );
        r.architecture = Some("arm64".into());
        assert!(bulk_url(&r, "x86_64").unwrap().contains("binary-arm64"));
    }

    #[test]
    fn test_api_urls_encode_query() {
        let r = repo(
            QueryType::Api,
            Endpoints {
                search: Some("https://r.example/search?q={query}".into()),
                info: Some("https://r.example/pkg/{package}".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            search_url(&r, "left pad", "x86_64").unwrap().unwrap(),
            "https://r.example/search?q=left%20pad"
        );
        assert_eq!(
            info_url(&r, "@types/node", "x86_64").unwrap().unwrap(),
            "https://r.example/pkg/%40types%2Fnode"
        );
        assert!(bulk_url(&r, "x86_64").is_err());
    }

    #[test]
    fn test_missing_endpoint_is_none() {
        let r = repo(
            QueryType::Api,
            Endpoints {
                info: Some("https://r.example/pkg/{package}".into()),
                ..Default::default()
            },
        );
        assert!(search_url(&r, "x", "x86_64").unwrap().is_none());
        assert_eq!(probe_url(&r, "x86_64").unwrap(), "https://r.example/pkg/test");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_retry_after_parsing() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_payload_metadata_keeps_validators() {
        let mut payload = RawPayload::new("https://a.example/Packages.gz", vec![1u8, 2, 3]);
        payload.etag = Some("\"abc\"".into());
        let metadata = payload.metadata();
        assert_eq!(metadata.get("etag").map(|s| s.as_str()), Some("\"abc\""));
        assert!(!metadata.contains_key("last_modified"));
        assert_eq!(payload.len(), 3);
    }

    #[tokio::test]
    async fn test_gate_is_rebuilt_when_limits_change() {
        let fetcher = HttpFetcher::new(&Config::default()).unwrap();
        let mut r = repo(
            QueryType::Api,
            Endpoints {
                search: Some("https://r.example/?q={query}".into()),
                ..Default::default()
            },
        );
        let first = fetcher.gate(&r);
        assert!(Arc::ptr_eq(&first, &fetcher.gate(&r)));
        r.limits = Some(Limits {
            requests_per_minute: 10,
            concurrent_requests: 1,
            timeout_seconds: 5,
        });
        let second = fetcher.gate(&r);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_not_available() {
        let config = Config {
            request_timeout_seconds: 1,
            ..Config::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        let r = repo(
            QueryType::BulkDownload,
            Endpoints {
                packages: Some("http://127.0.0.1:9/Packages.gz".into()),
                ..Default::default()
            },
        );
        assert!(!fetcher.is_available(&r, "x86_64").await);
    }

    #[tokio::test]
    async fn test_availability_check_fills_arch_like_the_fetch_path() {
        let fetch = MockFetch::new();
        fetch.serve("https://a.example/binary-riscv64/Packages", "");
        let mut r = repo(
            QueryType::BulkDownload,
            Endpoints {
                packages: Some("https://a.example/binary-{arch}/Packages".into()),
                ..Default::default()
            },
        );
        assert!(fetch.is_available(&r, "riscv64").await);
        assert!(!fetch.is_available(&r, "x86_64").await);

        r.architecture = Some("riscv64".into());
        assert!(fetch.is_available(&r, "x86_64").await);
    }

    // Minimal HTTP/1.1 server: answers connection N with `script[N]` (the last
    // entry repeats) after holding the request for `hold`.
    struct StubServer {
        url: String,
        hits: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    async fn stub_server(script: Vec<(u16, &'static str)>, hold: Duration) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/index", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (counter, in_flight, high_water) = (hits.clone(), active.clone(), peak.clone());
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, headers) = script[n.min(script.len() - 1)];
                let (in_flight, high_water) = (in_flight.clone(), high_water.clone());
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    sleep(hold).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\n{}Content-Length: 2\r\nConnection: close\r\n\r\nok",
                        status, headers
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        StubServer { url, hits, peak }
    }

    fn quick_retries(attempts: u32) -> Config {
        Config {
            retry_attempts: attempts,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 10,
            ..Config::default()
        }
    }

    fn bulk_repo() -> RepositoryConfig {
        repo(QueryType::BulkDownload, Endpoints::default())
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_until_attempts_run_out() {
        let server = stub_server(vec![(503, "")], Duration::ZERO).await;
        let fetcher = HttpFetcher::new(&quick_retries(2)).unwrap();

        let err = fetcher
            .fetch(&bulk_repo(), &server.url, FetchKind::Bulk)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let server = stub_server(vec![(502, ""), (200, "")], Duration::ZERO).await;
        let fetcher = HttpFetcher::new(&quick_retries(3)).unwrap();

        let payload = fetcher
            .fetch(&bulk_repo(), &server.url, FetchKind::Bulk)
            .await
            .unwrap();
        assert_eq!(&payload.bytes[..], b"ok");
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        for status in [404, 403] {
            let server = stub_server(vec![(status, "")], Duration::ZERO).await;
            let fetcher = HttpFetcher::new(&quick_retries(3)).unwrap();

            let err = fetcher
                .fetch(&bulk_repo(), &server.url, FetchKind::Bulk)
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), Some(status));
            assert!(!err.is_transient());
            assert_eq!(server.hits.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_too_many_requests_waits_for_retry_after() {
        let server = stub_server(vec![(429, "Retry-After: 1\r\n"), (200, "")], Duration::ZERO).await;
        let config = Config {
            retry_max_delay_ms: 5000,
            ..quick_retries(1)
        };
        let fetcher = HttpFetcher::new(&config).unwrap();

        let started = std::time::Instant::now();
        let payload = fetcher
            .fetch(&bulk_repo(), &server.url, FetchKind::Bulk)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(&payload.bytes[..], b"ok");
        assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_limit_caps_api_calls() {
        let server = stub_server(vec![(200, "")], Duration::from_millis(100)).await;
        let fetcher = HttpFetcher::new(&quick_retries(0)).unwrap();
        let mut r = repo(QueryType::Api, Endpoints::default());
        r.limits = Some(Limits {
            requests_per_minute: 6000,
            concurrent_requests: 2,
            timeout_seconds: 5,
        });

        let calls = (0..6).map(|_| fetcher.fetch(&r, &server.url, FetchKind::Api));
        for result in futures::future::join_all(calls).await {
            assert!(result.is_ok());
        }
        assert_eq!(server.hits.load(Ordering::SeqCst), 6);
        assert!(server.peak.load(Ordering::SeqCst) <= 2);
    }
}
