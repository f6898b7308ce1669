//! In-memory transport for engine tests.

use crate::{
    config::RepositoryConfig,
    error::{RepoError, RepoResult},
    fetcher::{Fetch, FetchKind, RawPayload},
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone)]
struct Route {
    response: Result<Bytes, RepoError>,
    delay: Duration,
}

/// Serves canned bodies by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockFetch {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.route(url, Ok(body.into()));
        self
    }

    pub fn fail(&self, url: &str, error: RepoError) -> &Self {
        self.route(url, Err(error));
        self
    }

    /// Holds the response for `url` back by `delay`.
    pub fn delay(&self, url: &str, delay: Duration) -> &Self {
        let mut routes = self.routes.lock();
        let route = routes.entry(url.to_string()).or_insert_with(|| Route {
            response: Err(RepoError::http_status(url, 404)),
            delay: Duration::ZERO,
        });
        route.delay = delay;
        self
    }

    fn route(&self, url: &str, response: Result<Bytes, RepoError>) {
        let mut routes = self.routes.lock();
        let delay = routes.get(url).map(|r| r.delay).unwrap_or_default();
        routes.insert(url.to_string(), Route { response, delay });
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(
        &self,
        _repository: &RepositoryConfig,
        url: &str,
        _kind: FetchKind,
    ) -> RepoResult<RawPayload> {
        self.calls.lock().push(url.to_string());
        let route = self.routes.lock().get(url).cloned();
        let Some(route) = route else {
            return Err(RepoError::http_status(url, 404));
        };
        if !route.delay.is_zero() {
            tokio::time::sleep(route.delay).await;
        }
        route.response.map(|body| RawPayload::new(url, body))
    }
}
