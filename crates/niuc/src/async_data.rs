//! Observable request state: status, data and error behind one handle.
//!
//! [`AsyncData`] wraps a fetcher and publishes every state change on a
//! `watch` channel. [`AsyncDataCache`] shares one instance per cache key so
//! every caller asking for the same key sees the same state.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::HttpError;
use crate::http::{HttpClient, RequestContext, RequestOptions};

/// Where an [`AsyncData`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// Never run, cleared, or last run cancelled.
    Idle,
    /// A fetch is running.
    Pending,
    /// The last fetch produced data.
    Success,
    /// The last fetch failed.
    Error,
}

/// Point-in-time view of an [`AsyncData`].
#[derive(Debug)]
pub struct AsyncSnapshot<T> {
    /// Lifecycle position.
    pub status: AsyncStatus,
    /// Last successful value; kept while a refresh is pending.
    pub data: Option<Arc<T>>,
    /// Error of the last fetch, if it failed.
    pub error: Option<Arc<HttpError>>,
}

impl<T> Clone for AsyncSnapshot<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> AsyncSnapshot<T> {
    const fn idle() -> Self {
        Self {
            status: AsyncStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// Produces one fetch.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, HttpError>> + Send + Sync>;

/// A re-runnable fetch with observable state.
pub struct AsyncData<T> {
    fetcher: Fetcher<T>,
    state: watch::Sender<AsyncSnapshot<T>>,
}

impl<T> std::fmt::Debug for AsyncData<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncData")
            .field("status", &self.state.borrow().status)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> AsyncData<T> {
    /// Idle wrapper around `fetcher`.
    #[must_use]
    pub fn new(fetcher: Fetcher<T>) -> Self {
        let (state, _) = watch::channel(AsyncSnapshot::idle());
        Self { fetcher, state }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> AsyncStatus {
        self.state.borrow().status
    }

    /// Last successful value.
    #[must_use]
    pub fn data(&self) -> Option<Arc<T>> {
        self.state.borrow().data.clone()
    }

    /// Error of the last fetch.
    #[must_use]
    pub fn error(&self) -> Option<Arc<HttpError>> {
        self.state.borrow().error.clone()
    }

    /// Full snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AsyncSnapshot<T> {
        self.state.borrow().clone()
    }

    /// State change subscription.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AsyncSnapshot<T>> {
        self.state.subscribe()
    }

    /// Runs the fetcher and records the outcome.
    ///
    /// A cancelled fetch returns to `Idle` and keeps the previous data.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, shared with the stored state.
    pub async fn execute(&self) -> Result<Arc<T>, Arc<HttpError>> {
        self.state.send_modify(|s| {
            s.status = AsyncStatus::Pending;
            s.error = None;
        });
        match (self.fetcher)().await {
            Ok(value) => {
                let value = Arc::new(value);
                self.state.send_modify(|s| {
                    s.status = AsyncStatus::Success;
                    s.data = Some(Arc::clone(&value));
                });
                Ok(value)
            }
            Err(e) => {
                let e = Arc::new(e);
                if e.is_cancelled() {
                    debug!("async data fetch cancelled");
                    self.state.send_modify(|s| s.status = AsyncStatus::Idle);
                } else {
                    self.state.send_modify(|s| {
                        s.status = AsyncStatus::Error;
                        s.error = Some(Arc::clone(&e));
                    });
                }
                Err(e)
            }
        }
    }

    /// Re-runs the fetcher. Same as [`AsyncData::execute`].
    ///
    /// # Errors
    ///
    /// See [`AsyncData::execute`].
    pub async fn refresh(&self) -> Result<Arc<T>, Arc<HttpError>> {
        self.execute().await
    }

    /// Drops data and error and returns to `Idle`.
    pub fn clear(&self) {
        self.state.send_replace(AsyncSnapshot::idle());
    }
}

/// Shares [`AsyncData`] instances by cache key.
#[derive(Default)]
pub struct AsyncDataCache {
    entries: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for AsyncDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDataCache")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl AsyncDataCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Any + Send + Sync>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("async data cache lock poisoned, using recovered data");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the entry for `key`, creating it from `fetcher` when absent.
    /// An entry stored under the same key with another type is replaced.
    pub fn entry<T: Send + Sync + 'static>(
        &self,
        key: &str,
        fetcher: impl FnOnce() -> Fetcher<T>,
    ) -> Arc<AsyncData<T>> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if let Ok(data) = Arc::clone(existing).downcast::<AsyncData<T>>() {
                return data;
            }
            warn!(key, "cache key reused with a different type, replacing");
        }
        let data = Arc::new(AsyncData::new(fetcher()));
        let erased: Arc<dyn Any + Send + Sync> = data.clone();
        entries.insert(key.to_string(), erased);
        data
    }

    /// Removes the entry for `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }
}

impl HttpClient {
    /// Async-data wrapper around a GET, shared through `cache` when
    /// `options.cache_key` is set.
    pub fn async_get<T>(
        &self,
        cache: &AsyncDataCache,
        ctx: &RequestContext,
        path: &str,
        query: Option<Value>,
        options: RequestOptions,
    ) -> Arc<AsyncData<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let key = options.cache_key.clone();
        let (client, ctx, path) = (self.clone(), ctx.clone(), path.to_string());
        let make = move || -> Fetcher<T> {
            Arc::new(move || {
                let (client, ctx, path) = (client.clone(), ctx.clone(), path.clone());
                let (query, options) = (query.clone(), options.clone());
                async move { client.get::<T>(&ctx, &path, query.as_ref(), options).await }.boxed()
            })
        };
        match key {
            Some(key) => cache.entry(&key, make),
            None => Arc::new(AsyncData::new(make())),
        }
    }

    /// Async-data wrapper around a POST, shared through `cache` when
    /// `options.cache_key` is set.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRequest`] if `body` does not serialize.
    pub fn async_post<B, T>(
        &self,
        cache: &AsyncDataCache,
        ctx: &RequestContext,
        path: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<Arc<AsyncData<T>>, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        let key = options.cache_key.clone();
        let (client, ctx, path) = (self.clone(), ctx.clone(), path.to_string());
        let make = move || -> Fetcher<T> {
            Arc::new(move || {
                let (client, ctx, path) = (client.clone(), ctx.clone(), path.clone());
                let (body, options) = (body.clone(), options.clone());
                async move {
                    client
                        .post::<Value, T>(&ctx, &path, body.as_ref(), None, options)
                        .await
                }
                .boxed()
            })
        };
        Ok(match key {
            Some(key) => cache.entry(&key, make),
            None => Arc::new(AsyncData::new(make())),
        })
    }
}
