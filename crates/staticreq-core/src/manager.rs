//! Request coordination: cache-first and network-first retrieval,
//! in-flight deduplication and lifecycle-driven task refresh.
//!
//! # Deduplication
//!
//! At most one network fetch per cache key is outstanding. The first caller
//! for a key starts the fetch; later callers join it and receive the same
//! outcome through a broadcast channel:
//!
//! ```text
//! get_data(A) ─┐
//!              │                           ┌─► compare with cache
//! get_data(B) ─┼──► in_flight[key] ──► fetch ─┤   write cache
//!              │                           └─► broadcast outcome
//! get_data(C) ─┘        ▲                                │
//!                       └──── A, B, C each deliver ◄─────┘
//! ```
//!
//! The outcome ("updated", "unchanged" or "failed") is decided once,
//! against the cache as it was before the fetch, so every caller of a
//! shared fetch sees the same view. Params that can't be keyed are never
//! shared and never touch the byte store.
//!
//! # Callbacks
//!
//! A cache hit in [`StaticRequestManager::get_data`] is delivered
//! synchronously before the call returns. Every post-fetch delivery runs on
//! a tokio worker and may arrive on any thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::coordinator::package;
use crate::cache::{CacheCoordinator, DiskByteStore, ResourceBundle};
use crate::config::Config;
use crate::lifecycle::{LifecycleBus, LifecycleEvent};
use crate::request::{CancelHook, StaticRequest};
use crate::tasks::{StaticTask, TaskRegistry};

/// Capacity of each in-flight outcome channel. Exactly one outcome is sent.
const OUTCOME_BUFFER_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    CacheFirst,
    NetworkFirst,
}

/// Result of one network fetch, shared by every caller that joined it.
#[derive(Debug, Clone)]
enum FetchOutcome {
    /// Differs from the previous cache (or there was none); cache rewritten.
    Updated(Arc<Value>),
    /// Equivalent to the cached value.
    Unchanged(Arc<Value>),
    /// Transport failure, undecodable payload or format rejection.
    Failed,
}

struct InFlightEntry {
    id: u64,
    tx: broadcast::Sender<FetchOutcome>,
    /// Handles attached to this fetch that have not cancelled
    live: usize,
    share: Arc<FetchShare>,
}

/// The network fetch a set of handles is waiting on.
struct FetchShare {
    inner: Weak<Inner>,
    key: Option<String>,
    id: u64,
    request: Arc<dyn CancelHook>,
}

impl FetchShare {
    /// Detaches one live handle. The descriptor is cancelled only when no
    /// live handle remains.
    fn release(&self) {
        let Some(ref key) = self.key else {
            // Unkeyed fetches have exactly one handle
            self.request.cancel();
            return;
        };
        let Some(inner) = self.inner.upgrade() else {
            return;
        };

        // Joins take the same entry lock, so nobody attaches after the last
        // live handle leaves
        let last = match inner.in_flight.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().id == self.id => {
                let remaining = {
                    let entry = entry.get_mut();
                    entry.live = entry.live.saturating_sub(1);
                    entry.live
                };
                if remaining == 0 {
                    entry.remove();
                }
                remaining == 0
            }
            // Already settled
            _ => false,
        };

        if last {
            debug!(key = %key, request = self.request.request_type(), "Cancelling fetch");
            self.request.cancel();
        }
    }
}

/// Statistics for monitoring deduplication.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestStats {
    /// Retrieval calls that needed the network
    pub total_requests: u64,
    /// Calls that joined a fetch already in flight
    pub coalesced_requests: u64,
    /// Fetches actually started
    pub network_fetches: u64,
}

impl RequestStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

/// Handle to an outstanding retrieval.
///
/// Cancelling suppresses this handle's callback. The descriptor's `cancel`
/// is invoked only once every handle sharing the fetch has cancelled, so
/// one caller never takes a result away from another.
#[derive(Clone)]
pub struct RequestHandle {
    key: Option<String>,
    token: CancellationToken,
    done: CancellationToken,
    released: Arc<AtomicBool>,
    leader: bool,
    share: Arc<FetchShare>,
}

impl RequestHandle {
    /// `None` when the params could not be keyed.
    pub fn cache_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// True if this handle started the underlying network fetch.
    pub fn started_fetch(&self) -> bool {
        self.leader
    }

    pub fn cancel(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.share.release();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once delivery for this handle has finished, whether the
    /// callback fired, was suppressed, or the handle was cancelled.
    pub async fn completed(&self) {
        self.done.cancelled().await
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("key", &self.key)
            .field("started_fetch", &self.leader)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Inner {
    cache: CacheCoordinator,
    runtime: Handle,
    bus: LifecycleBus,
    in_flight: DashMap<String, InFlightEntry>,
    next_fetch_id: AtomicU64,
    registry: RwLock<TaskRegistry>,
    listener: Mutex<Option<JoinHandle<()>>>,
    logged_in: AtomicBool,
    offline: AtomicBool,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    network_fetches: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(task) = listener.take() {
                task.abort();
            }
        }
    }
}

/// Coordinates retrieval of static data. Clone is cheap and shares state.
///
/// Construct once at startup and pass it to call sites.
#[derive(Clone)]
pub struct StaticRequestManager {
    inner: Arc<Inner>,
}

impl StaticRequestManager {
    /// Must be called from within a tokio runtime; fetches are spawned on it.
    pub fn new(cache: CacheCoordinator, bus: LifecycleBus) -> Result<Self> {
        let runtime = Handle::try_current()
            .context("StaticRequestManager must be created inside a tokio runtime")?;

        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                runtime,
                bus,
                in_flight: DashMap::new(),
                next_fetch_id: AtomicU64::new(0),
                registry: RwLock::new(TaskRegistry::new()),
                listener: Mutex::new(None),
                logged_in: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                total_requests: AtomicU64::new(0),
                coalesced_requests: AtomicU64::new(0),
                network_fetches: AtomicU64::new(0),
            }),
        })
    }

    /// Disk-backed manager using the configured cache and bundle directories.
    pub fn from_config(config: &Config, bus: LifecycleBus) -> Result<Self> {
        let cache_dir = config.cache_dir()?;
        debug!(?cache_dir, "Cache directory configured");
        let store = DiskByteStore::new(cache_dir).context("Failed to create cache directory")?;

        let bundle = match config.bundle_dir {
            Some(ref dir) => ResourceBundle::from_dir(dir.clone()),
            None => ResourceBundle::empty(),
        };

        let manager = Self::new(CacheCoordinator::new(Arc::new(store), bundle), bus)?;
        manager.set_offline_mode(config.offline_mode);
        Ok(manager)
    }

    pub fn cache(&self) -> &CacheCoordinator {
        &self.inner.cache
    }

    // ===== Retrieval =====

    /// Cache-first retrieval.
    ///
    /// A cached model is delivered synchronously, then a fetch runs. The
    /// callback fires again only if the fetched result differs from the
    /// cache. Fetch failures are silent.
    ///
    /// Returns `None` only in offline mode, where no fetch is started.
    pub fn get_data<D, F>(&self, request: D, params: D::Params, on_done: F) -> Option<RequestHandle>
    where
        D: StaticRequest,
        F: Fn(D::Model) + Send + 'static,
    {
        // Remembered so a shared fetch can't re-deliver the same value
        let mut served = None;
        if let Some(raw) = self.inner.cache.cached_raw_value::<D>(&params) {
            if let Some(model) = package::<D>(&raw, &params) {
                on_done(model);
                served = Some(raw);
            }
        }

        if self.is_offline() {
            debug!(request = D::TYPE_NAME, "Offline - serving cache only");
            return None;
        }

        Some(self.dispatch(request, params, Policy::CacheFirst, served, on_done))
    }

    /// Network-first retrieval.
    ///
    /// The fetched result always overwrites the cache and is delivered once.
    /// On failure the cached model is delivered instead, if there is one.
    ///
    /// Returns `None` only in offline mode, where the cached model (if any)
    /// is delivered synchronously.
    pub fn get_data_ignore_cache<D, F>(
        &self,
        request: D,
        params: D::Params,
        on_done: F,
    ) -> Option<RequestHandle>
    where
        D: StaticRequest,
        F: Fn(D::Model) + Send + 'static,
    {
        if self.is_offline() {
            debug!(request = D::TYPE_NAME, "Offline - serving cache only");
            if let Some(model) = self.inner.cache.cached_model::<D>(&params) {
                on_done(model);
            }
            return None;
        }

        Some(self.dispatch(request, params, Policy::NetworkFirst, None, on_done))
    }

    /// Cached model only; never touches the network.
    pub fn get_cache_only<D: StaticRequest>(&self, params: &D::Params) -> Option<D::Model> {
        self.inner.cache.cached_model::<D>(params)
    }

    /// Cancels delivery for `handle`. See [`RequestHandle::cancel`].
    pub fn cancel(&self, handle: &RequestHandle) {
        handle.cancel();
    }

    fn dispatch<D, F>(
        &self,
        request: D,
        params: D::Params,
        policy: Policy,
        served: Option<Value>,
        on_done: F,
    ) -> RequestHandle
    where
        D: StaticRequest,
        F: Fn(D::Model) + Send + 'static,
    {
        let key = CacheCoordinator::make_cache_key::<D>(&params);
        let inner = &self.inner;
        inner.total_requests.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(request);

        // Decide under the entry lock, spawn after it is released
        let (rx, share, slot) = match key {
            Some(ref key) => match inner.in_flight.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let entry = entry.get_mut();
                    entry.live += 1;
                    inner.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Joining in-flight fetch");
                    (entry.tx.subscribe(), Arc::clone(&entry.share), None)
                }
                Entry::Vacant(entry) => {
                    let (slot, rx) = InFlightSlot::open(inner, Some(key.clone()), request.clone());
                    entry.insert(InFlightEntry {
                        id: slot.id,
                        tx: slot.tx.clone(),
                        live: 1,
                        share: Arc::clone(&slot.share),
                    });
                    debug!(key = %key, ?policy, "Starting fetch");
                    (rx, Arc::clone(&slot.share), Some(slot))
                }
            },
            None => {
                let (slot, rx) = InFlightSlot::open(inner, None, request.clone());
                debug!(request = D::TYPE_NAME, ?policy, "Starting unshared fetch");
                (rx, Arc::clone(&slot.share), Some(slot))
            }
        };

        let leader = slot.is_some();
        if let Some(slot) = slot {
            inner.runtime.spawn(run_fetch(slot, request, params.clone(), policy));
        }

        let handle = RequestHandle {
            key,
            token: CancellationToken::new(),
            done: CancellationToken::new(),
            released: Arc::new(AtomicBool::new(false)),
            leader,
            share,
        };

        inner.runtime.spawn(deliver::<D, F>(
            Arc::clone(inner),
            rx,
            params,
            policy,
            served,
            handle.clone(),
            on_done,
        ));

        handle
    }

    // ===== Tasks =====

    /// Replaces the registered task set and runs it once.
    ///
    /// Launch-only tasks run here and never again. Other tasks re-run on
    /// every [`LifecycleEvent::Foreground`]; login-gated ones only while
    /// logged in, and additionally on every [`LifecycleEvent::Login`].
    ///
    /// Expected to be called once, early. Re-registering while lifecycle
    /// events are being dispatched is not supported.
    pub fn register_tasks(&self, tasks: Vec<StaticTask>, is_logged_in: bool) {
        self.inner.logged_in.store(is_logged_in, Ordering::SeqCst);

        let launch = {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.replace(tasks);
            info!(count = registry.len(), logged_in = is_logged_in, "Registered static request tasks");
            registry.launch_batch(is_logged_in)
        };

        // Subscribe before running anything so no event is missed
        self.start_listener();
        self.run_tasks(&launch, "launch");
    }

    fn start_listener(&self) {
        let mut rx = self.inner.bus.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let task = self.inner.runtime.spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle listener lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                StaticRequestManager { inner }.handle_event(event);
            }
        });

        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = listener.replace(task) {
            previous.abort();
        }
    }

    fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Login => {
                info!("Login observed - refreshing login tasks");
                self.inner.logged_in.store(true, Ordering::SeqCst);
                let batch = self.read_registry(|r| r.login_batch());
                self.run_tasks(&batch, "login");
            }
            LifecycleEvent::Logout => {
                info!("Logout observed - login tasks paused");
                self.inner.logged_in.store(false, Ordering::SeqCst);
            }
            LifecycleEvent::Foreground => {
                let logged_in = self.is_logged_in();
                let batch = self.read_registry(|r| r.foreground_batch(logged_in));
                self.run_tasks(&batch, "foreground");
            }
        }
    }

    fn read_registry<T>(&self, f: impl FnOnce(&TaskRegistry) -> T) -> T {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&registry)
    }

    fn run_tasks(&self, tasks: &[StaticTask], trigger: &str) {
        if self.is_offline() {
            debug!(trigger, count = tasks.len(), "Offline - skipping task run");
            return;
        }
        debug!(trigger, count = tasks.len(), "Running static request tasks");
        for task in tasks {
            task.run(self);
        }
    }

    // ===== State =====

    pub fn is_logged_in(&self) -> bool {
        self.inner.logged_in.load(Ordering::SeqCst)
    }

    pub fn set_offline_mode(&self, offline: bool) {
        let previous = self.inner.offline.swap(offline, Ordering::SeqCst);
        if previous != offline {
            info!(offline, "Offline mode changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Number of keys with a fetch currently outstanding.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.inner.coalesced_requests.load(Ordering::Relaxed),
            network_fetches: self.inner.network_fetches.load(Ordering::Relaxed),
        }
    }
}

/// Ownership of one fetch and, when keyed, its in-flight map entry.
///
/// Dropping without [`InFlightSlot::complete`] (e.g. the fetch panicked)
/// still clears the entry; waiters then see a closed channel.
struct InFlightSlot {
    inner: Arc<Inner>,
    key: Option<String>,
    id: u64,
    tx: broadcast::Sender<FetchOutcome>,
    share: Arc<FetchShare>,
}

impl InFlightSlot {
    /// Must not touch `in_flight`: callers may hold one of its entry locks.
    fn open(
        inner: &Arc<Inner>,
        key: Option<String>,
        request: Arc<dyn CancelHook>,
    ) -> (Self, broadcast::Receiver<FetchOutcome>) {
        let id = inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(OUTCOME_BUFFER_SIZE);
        inner.network_fetches.fetch_add(1, Ordering::Relaxed);

        let share = Arc::new(FetchShare {
            inner: Arc::downgrade(inner),
            key: key.clone(),
            id,
            request,
        });
        let slot = Self {
            inner: Arc::clone(inner),
            key,
            id,
            tx,
            share,
        };
        (slot, rx)
    }

    fn take_entry(&self) {
        if let Some(ref key) = self.key {
            self.inner
                .in_flight
                .remove_if(key, |_, entry| entry.id == self.id);
        }
    }

    fn complete(&self, outcome: FetchOutcome) {
        self.take_entry();
        let waiters = self.tx.receiver_count();
        // Receivers may have been dropped
        let _ = self.tx.send(outcome);
        debug!(key = ?self.key, waiters, "Fetch outcome broadcast");
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.take_entry();
    }
}

async fn run_fetch<D: StaticRequest>(
    slot: InFlightSlot,
    request: Arc<D>,
    params: D::Params,
    policy: Policy,
) {
    let key = slot.key.as_deref();
    let outcome = match request.fetch(&params).await {
        Ok(bytes) => settle::<D>(&slot.inner.cache, key, &bytes, &params, policy),
        Err(e) if e.is_cancelled() => {
            debug!(key = ?key, "Fetch cancelled");
            FetchOutcome::Failed
        }
        Err(e) => {
            debug!(key = ?key, error = %e, "Fetch failed");
            FetchOutcome::Failed
        }
    };
    slot.complete(outcome);
}

/// Compares a fetched payload with the cache and updates the cache.
///
/// Cache-first fetches only write when the result changed, so an
/// equivalent result leaves the stored bytes untouched. Network-first
/// fetches always overwrite. Unkeyed fetches never write.
fn settle<D: StaticRequest>(
    cache: &CacheCoordinator,
    key: Option<&str>,
    bytes: &[u8],
    params: &D::Params,
    policy: Policy,
) -> FetchOutcome {
    let raw: Value = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(key = ?key, error = %e, "Fetched data is not valid JSON");
            return FetchOutcome::Failed;
        }
    };

    if !D::check_format(&raw, params) {
        warn!(key = ?key, "Fetched data failed format check, keeping cache");
        return FetchOutcome::Failed;
    }

    let cached = cache.cached_raw_value::<D>(params);
    let changed = !CacheCoordinator::is_equivalent(&raw, cached.as_ref());

    if key.is_some() && (changed || policy == Policy::NetworkFirst) {
        if let Err(e) = cache.cache_result::<D>(&raw, params) {
            warn!(key = ?key, error = %e, "Failed to write cache");
        }
    }

    debug!(key = ?key, changed, "Fetch settled");
    let raw = Arc::new(raw);
    if changed {
        FetchOutcome::Updated(raw)
    } else {
        FetchOutcome::Unchanged(raw)
    }
}

async fn deliver<D, F>(
    inner: Arc<Inner>,
    mut rx: broadcast::Receiver<FetchOutcome>,
    params: D::Params,
    policy: Policy,
    served: Option<Value>,
    handle: RequestHandle,
    on_done: F,
) where
    D: StaticRequest,
    F: Fn(D::Model) + Send + 'static,
{
    let _done = handle.done.clone().drop_guard();

    let outcome = tokio::select! {
        _ = handle.token.cancelled() => None,
        // A closed channel means the fetch task died without an outcome
        received = rx.recv() => Some(received.unwrap_or(FetchOutcome::Failed)),
    };

    let Some(outcome) = outcome else {
        debug!(key = ?handle.key, "Delivery cancelled");
        return;
    };
    if handle.is_cancelled() {
        return;
    }

    let model = match (policy, outcome) {
        // A caller that read the cache after the leader wrote it was already
        // served this value
        (Policy::CacheFirst, FetchOutcome::Updated(raw))
            if CacheCoordinator::is_equivalent(&raw, served.as_ref()) =>
        {
            debug!(key = ?handle.key, "Update already served from cache");
            None
        }
        (Policy::CacheFirst, FetchOutcome::Updated(raw)) => package::<D>(&raw, &params),
        (Policy::CacheFirst, _) => None,
        (Policy::NetworkFirst, FetchOutcome::Updated(raw))
        | (Policy::NetworkFirst, FetchOutcome::Unchanged(raw)) => package::<D>(&raw, &params),
        (Policy::NetworkFirst, FetchOutcome::Failed) => {
            debug!(key = ?handle.key, "Falling back to cache");
            inner.cache.cached_model::<D>(&params)
        }
    };

    if let Some(model) = model {
        on_done(model);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryByteStore;
    use crate::error::FetchError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Echo;

    #[async_trait]
    impl StaticRequest for Echo {
        type Params = String;
        type Model = Value;
        const TYPE_NAME: &'static str = "Echo";

        async fn fetch(&self, params: &String) -> Result<Vec<u8>, FetchError> {
            Ok(params.as_bytes().to_vec())
        }

        fn package_to_model(raw: &Value, _params: &String) -> anyhow::Result<Value> {
            Ok(raw.clone())
        }
    }

    fn manager() -> StaticRequestManager {
        let cache = CacheCoordinator::new(Arc::new(MemoryByteStore::new()), ResourceBundle::empty());
        StaticRequestManager::new(cache, LifecycleBus::new()).unwrap()
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let cache = CacheCoordinator::new(Arc::new(MemoryByteStore::new()), ResourceBundle::empty());
        assert!(StaticRequestManager::new(cache, LifecycleBus::new()).is_err());
    }

    #[test]
    fn test_coalescing_ratio() {
        assert_eq!(RequestStats::default().coalescing_ratio(), 0.0);
        let stats = RequestStats {
            total_requests: 4,
            coalesced_requests: 3,
            network_fetches: 1,
        };
        assert_eq!(stats.coalescing_ratio(), 0.75);
    }

    #[tokio::test]
    async fn test_settle_rejects_invalid_json() {
        let manager = manager();
        let outcome = settle::<Echo>(
            manager.cache(),
            Some("Echo"),
            b"{not json",
            &"x".to_string(),
            Policy::CacheFirst,
        );
        assert!(matches!(outcome, FetchOutcome::Failed));
    }

    #[tokio::test]
    async fn test_handle_clears_in_flight_entry() {
        let manager = manager();
        let handle = manager
            .get_data(Echo, r#"{"v":1}"#.to_string(), |_| {})
            .expect("online get_data returns a handle");
        assert!(handle.started_fetch());
        handle.completed().await;

        // The fetch task clears its entry before broadcasting
        assert_eq!(manager.in_flight_count(), 0);
        assert_eq!(manager.stats().network_fetches, 1);
    }

    fn joined_handle(manager: &StaticRequestManager) -> RequestHandle {
        let key = Some("Echo".to_string());
        RequestHandle {
            key: key.clone(),
            token: CancellationToken::new(),
            done: CancellationToken::new(),
            released: Arc::new(AtomicBool::new(false)),
            leader: false,
            share: Arc::new(FetchShare {
                inner: Arc::downgrade(&manager.inner),
                key,
                id: 0,
                request: Arc::new(Echo),
            }),
        }
    }

    async fn deliver_updated(served: Option<Value>, fetched: Value) -> usize {
        let manager = manager();
        let (tx, rx) = broadcast::channel(OUTCOME_BUFFER_SIZE);
        tx.send(FetchOutcome::Updated(Arc::new(fetched))).unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        deliver::<Echo, _>(
            Arc::clone(&manager.inner),
            rx,
            "x".to_string(),
            Policy::CacheFirst,
            served,
            joined_handle(&manager),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        delivered.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_update_already_served_is_not_redelivered() {
        // Joined after the leader wrote the cache, so the sync hit was the new value
        assert_eq!(deliver_updated(Some(json!({"v": 2})), json!({"v": 2})).await, 0);
        assert_eq!(deliver_updated(Some(json!({"v": 1})), json!({"v": 2})).await, 1);
        assert_eq!(deliver_updated(None, json!({"v": 2})).await, 1);
    }

    #[tokio::test]
    async fn test_unkeyable_params_fetch_without_dedup() {
        use std::collections::HashMap;

        struct Pairs;

        #[async_trait]
        impl StaticRequest for Pairs {
            type Params = HashMap<(i32, i32), String>;
            type Model = Value;
            const TYPE_NAME: &'static str = "Pairs";

            async fn fetch(&self, params: &Self::Params) -> Result<Vec<u8>, FetchError> {
                let value: Vec<&String> = params.values().collect();
                serde_json::to_vec(&json!({ "for": value }))
                    .map_err(|e| FetchError::Other(e.to_string()))
            }

            fn package_to_model(raw: &Value, _params: &Self::Params) -> anyhow::Result<Value> {
                Ok(raw.clone())
            }
        }

        let manager = manager();
        let a: HashMap<(i32, i32), String> = [((1, 2), "a".to_string())].into_iter().collect();
        let b: HashMap<(i32, i32), String> = [((3, 4), "b".to_string())].into_iter().collect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tx_b = tx.clone();
        let first = manager
            .get_data(Pairs, a, move |v| {
                let _ = tx.send(v);
            })
            .unwrap();
        let second = manager
            .get_data(Pairs, b, move |v| {
                let _ = tx_b.send(v);
            })
            .unwrap();
        assert_eq!(first.cache_key(), None);
        assert!(first.started_fetch() && second.started_fetch());
        assert_eq!(manager.in_flight_count(), 0);

        first.completed().await;
        second.completed().await;

        let mut delivered = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        delivered.sort_by_key(|v| v.to_string());
        assert_eq!(delivered, vec![json!({"for": ["a"]}), json!({"for": ["b"]})]);

        let stats = manager.stats();
        assert_eq!(stats.network_fetches, 2);
        assert_eq!(stats.coalesced_requests, 0);

        // Nothing was written, so a repeat call has no cached hit
        assert!(manager
            .get_cache_only::<Pairs>(&[((1, 2), "a".to_string())].into_iter().collect())
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_get_data_returns_no_handle() {
        let manager = manager();
        manager.set_offline_mode(true);
        assert!(manager.is_offline());
        assert!(manager.get_data(Echo, "1".to_string(), |_| {}).is_none());
        assert!(manager
            .get_data_ignore_cache(Echo, "1".to_string(), |_| {})
            .is_none());
        assert_eq!(manager.stats().total_requests, 0);
    }
}
