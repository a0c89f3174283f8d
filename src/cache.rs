use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{ApiError, RouterClient};
use crate::model::{ForwardReference, Namespace};

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    cached_at: Instant,
    value: T,
}

/// Fetch-once, reuse-until-invalidated cache. Concurrent callers of
/// `get_or_fetch` share a single fetch.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    inner: Mutex<Option<CacheEntry<T>>>,
}

impl<T> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value, fetching it first when empty. Failed fetches
    /// are not cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.as_ref() {
            return Ok(entry.value.clone());
        }

        let value = fetch().await?;
        *guard = Some(CacheEntry {
            cached_at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }

    pub async fn peek(&self) -> Option<T> {
        let guard = self.inner.lock().await;
        guard.as_ref().map(|entry| entry.value.clone())
    }

    pub async fn age(&self) -> Option<Duration> {
        let guard = self.inner.lock().await;
        guard.as_ref().map(|entry| entry.cached_at.elapsed())
    }

    pub async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        *guard = None;
    }
}

/// Namespace and forward listings, fetched once per session and shared by
/// reference.
#[derive(Debug)]
pub struct CatalogCache {
    client: RouterClient,
    namespaces: SnapshotCache<Vec<Namespace>>,
    forwards: SnapshotCache<Vec<ForwardReference>>,
}

impl CatalogCache {
    pub fn new(client: RouterClient) -> Self {
        Self {
            client,
            namespaces: SnapshotCache::new(),
            forwards: SnapshotCache::new(),
        }
    }

    pub async fn namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        let client = &self.client;
        self.namespaces
            .get_or_fetch(move || async move {
                debug!("fetching namespaces");
                client.list_namespaces().await
            })
            .await
    }

    pub async fn forwards(&self) -> Result<Vec<ForwardReference>, ApiError> {
        let client = &self.client;
        self.forwards
            .get_or_fetch(move || async move {
                debug!("fetching forwards");
                client.list_forwards().await
            })
            .await
    }

    pub async fn namespace_path(&self, id: &str) -> Result<Option<String>, ApiError> {
        let namespaces = self.namespaces().await?;
        Ok(namespaces
            .into_iter()
            .find(|namespace| namespace.id == id)
            .and_then(|namespace| namespace.path))
    }

    pub async fn invalidate_namespaces(&self) {
        self.namespaces.invalidate().await;
    }

    pub async fn invalidate_forwards(&self) {
        self.forwards.invalidate().await;
    }

    pub async fn invalidate_all(&self) {
        self.invalidate_namespaces().await;
        self.invalidate_forwards().await;
    }
}
