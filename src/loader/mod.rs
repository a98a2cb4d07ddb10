//! Request batcher: coalesces point lookups issued in one scheduling tick.
//!
//! `load` registers its key synchronously. The first poll of any load
//! future drains every key registered so far into one batch and spawns a
//! task that fetches them with parallel `Provider::get` calls. Loads created
//! before any of them is awaited therefore always share a dispatch, on any
//! runtime flavour. Identical keys share one in-flight future. Settled results (including misses) stay
//! cached until cleared; failures are evicted so a retry reaches the
//! provider again.
//!
//! Loaders are cheap to clone; clones share one cache. A loader is meant to
//! live for one request or one generation run and is passed explicitly.

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::entity::Entity;
use crate::error::{EntigraphError, Result};
use crate::provider::Provider;

/// `(entity_type, id)`
pub type BatchKey = (String, String);

type LoadResult = std::result::Result<Option<Entity>, Arc<EntigraphError>>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// When false every call reaches the provider; nothing is deduplicated.
    pub cache: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { cache: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub cache_size: usize,
    /// Cache entries whose value has settled
    pub settled: usize,
    pub dispatches: usize,
    pub provider_calls: usize,
}

struct CacheEntry {
    generation: u64,
    future: SharedLoad,
}

struct PendingLoad {
    key: BatchKey,
    generation: u64,
    reply: oneshot::Sender<LoadResult>,
}

#[derive(Default)]
struct LoaderState {
    cache: HashMap<BatchKey, CacheEntry>,
    queue: Vec<PendingLoad>,
    next_generation: u64,
}

struct LoaderInner {
    provider: Arc<dyn Provider>,
    options: LoaderOptions,
    state: Mutex<LoaderState>,
    dispatches: AtomicUsize,
    provider_calls: AtomicUsize,
}

impl LoaderInner {
    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Loader {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_options(provider, LoaderOptions::default())
    }

    pub fn with_options(provider: Arc<dyn Provider>, options: LoaderOptions) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                provider,
                options,
                state: Mutex::new(LoaderState::default()),
                dispatches: AtomicUsize::new(0),
                provider_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.inner.provider
    }

    /// Load one entity. The key joins the pending batch as soon as this is
    /// called; the batch is sent when any load future is first polled.
    ///
    /// The returned future must be polled inside a tokio runtime.
    pub fn load(
        &self,
        entity_type: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Entity>>> + Send + 'static {
        let pending = self.register((entity_type.to_string(), id.to_string()));
        let inner = self.inner.clone();
        async move {
            flush(&inner);
            pending.await.map_err(EntigraphError::from_shared)
        }
    }

    /// Load several entities. Results follow `keys` order; misses are `None`.
    /// Fails only if the provider fails for one of the keys.
    pub fn load_many<T, I>(
        &self,
        keys: &[(T, I)],
    ) -> impl Future<Output = Result<Vec<Option<Entity>>>> + Send + 'static
    where
        T: AsRef<str>,
        I: AsRef<str>,
    {
        let pending: Vec<_> = keys
            .iter()
            .map(|(t, i)| self.load(t.as_ref(), i.as_ref()))
            .collect();
        future::try_join_all(pending)
    }

    /// Seed the cache with a known value. No-op when the key is already
    /// cached or caching is disabled. Returns whether the value was stored.
    pub fn prime(&self, entity_type: &str, id: &str, value: Option<Entity>) -> bool {
        if !self.inner.options.cache {
            return false;
        }
        let key = (entity_type.to_string(), id.to_string());
        let mut state = self.inner.state();
        if state.cache.contains_key(&key) {
            return false;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        let ready: BoxFuture<'static, LoadResult> = future::ready(Ok(value)).boxed();
        state.cache.insert(
            key,
            CacheEntry {
                generation,
                future: ready.shared(),
            },
        );
        true
    }

    /// Drop cached entries: one key, every key of a type, or everything.
    /// Returns how many entries were removed.
    pub fn clear(&self, entity_type: Option<&str>, id: Option<&str>) -> usize {
        let mut state = self.inner.state();
        let before = state.cache.len();
        match (entity_type, id) {
            (Some(t), Some(i)) => {
                state.cache.remove(&(t.to_string(), i.to_string()));
            }
            (Some(t), None) => state.cache.retain(|(kt, _), _| kt != t),
            (None, Some(i)) => state.cache.retain(|(_, ki), _| ki != i),
            (None, None) => state.cache.clear(),
        }
        before - state.cache.len()
    }

    pub fn stats(&self) -> LoaderStats {
        let state = self.inner.state();
        LoaderStats {
            cache_size: state.cache.len(),
            settled: state
                .cache
                .values()
                .filter(|entry| entry.future.peek().is_some())
                .count(),
            dispatches: self.inner.dispatches.load(Ordering::SeqCst),
            provider_calls: self.inner.provider_calls.load(Ordering::SeqCst),
        }
    }

    fn register(&self, key: BatchKey) -> SharedLoad {
        let mut state = self.inner.state();

        if self.inner.options.cache {
            if let Some(entry) = state.cache.get(&key) {
                log::debug!("Loader cache hit: {}/{}", key.0, key.1);
                return entry.future.clone();
            }
        }

        let (reply, receiver) = oneshot::channel::<LoadResult>();
        let waiting: BoxFuture<'static, LoadResult> = async move {
            receiver.await.unwrap_or_else(|_| {
                Err(Arc::new(EntigraphError::Provider(
                    "loader dispatch ended without a result".to_string(),
                )))
            })
        }
        .boxed();
        let shared = waiting.shared();

        let generation = state.next_generation;
        state.next_generation += 1;
        if self.inner.options.cache {
            state.cache.insert(
                key.clone(),
                CacheEntry {
                    generation,
                    future: shared.clone(),
                },
            );
        }
        state.queue.push(PendingLoad {
            key,
            generation,
            reply,
        });

        shared
    }
}

/// Send every queued key as one batch. No-op when the queue is empty.
fn flush(inner: &Arc<LoaderInner>) {
    let batch = std::mem::take(&mut inner.state().queue);
    if batch.is_empty() {
        return;
    }
    inner.dispatches.fetch_add(1, Ordering::SeqCst);
    log::debug!("Loader dispatch: {} keys", batch.len());
    tokio::spawn(fetch_batch(inner.clone(), batch));
}

async fn fetch_batch(inner: Arc<LoaderInner>, batch: Vec<PendingLoad>) {
    let fetches = batch.into_iter().map(|pending| {
        let inner = inner.clone();
        async move {
            inner.provider_calls.fetch_add(1, Ordering::SeqCst);
            let (entity_type, id) = &pending.key;
            let result = inner.provider.get(entity_type, id).await.map_err(Arc::new);

            if let Err(e) = &result {
                log::debug!("Loader evicting {}/{} after error: {}", entity_type, id, e);
                let mut state = inner.state();
                let current = state
                    .cache
                    .get(&pending.key)
                    .map(|entry| entry.generation == pending.generation)
                    .unwrap_or(false);
                if current {
                    state.cache.remove(&pending.key);
                }
            }

            // Every waiter may have gone away (timeout); nothing to report then.
            let _ = pending.reply.send(result);
        }
    });
    future::join_all(fetches).await;
}

/// Run `f` with a fresh request-scoped loader.
pub async fn with_loader<F, Fut, T>(provider: Arc<dyn Provider>, f: F) -> T
where
    F: FnOnce(Loader) -> Fut,
    Fut: Future<Output = T>,
{
    let loader = Loader::new(provider);
    let out = f(loader.clone()).await;
    let stats = loader.stats();
    log::debug!(
        "Request loader finished: {} cached, {} dispatches, {} provider calls",
        stats.cache_size,
        stats.dispatches,
        stats.provider_calls
    );
    out
}

/// Load through `loader` when one is in scope, else straight from the provider.
pub async fn load_entity(
    provider: &dyn Provider,
    loader: Option<&Loader>,
    entity_type: &str,
    id: &str,
) -> Result<Option<Entity>> {
    match loader {
        Some(loader) => loader.load(entity_type, id).await,
        None => provider.get(entity_type, id).await,
    }
}
