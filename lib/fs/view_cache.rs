//! Bounded, expiring cache of container views.
//!
//! Each cached view carries a count of open file handles. The count and the view's lifecycle
//! share one atomic word, so "is anybody using this view?" and "start closing it" are a single
//! compare-and-swap: a view is closed at most once, and never while a handle is open.
//!
//! ```text
//!            lease()/release()
//!               ┌──────┐
//!               ▼      │
//!  insert ──► Open(n) ─┘ ──CAS(0)──► Closing ──ok──► Closed (removed from cache)
//!                ▲                      │
//!                └──────close failed────┘
//! ```
//!
//! Eviction is driven by an [`LruEvictionTracker`]: inserting past capacity culls the least
//! recently used views, and a periodic sweep retires views whose time-to-live ran out. An expired
//! view is also retired when a request touches it. Busy views, and views whose close failed, stay
//! cached and are re-queued for a later attempt.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::cache::async_backed::{FutureBackedCache, Peek};
use crate::cache::eviction::lru::{Deleter, Eviction, Expiring, LruEvictionTracker, Versioned};
use crate::fs::{ContainerView, ReadOnlyFs, ViewProvider};
use crate::path::{ContainerExtension, MountPath};
use crate::registry::ProviderRegistry;
use crate::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const CLOSING: usize = 1 << (usize::BITS - 1);
const CLOSED: usize = 1 << (usize::BITS - 2);
const STATE_MASK: usize = CLOSING | CLOSED;

type ViewMap = FutureBackedCache<MountPath, Arc<CachedView>, io::Error>;

/// Tuning knobs for [`ViewCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewCacheConfig {
    /// Number of views kept before least recently used ones are culled.
    pub capacity: usize,
    /// How long a view stays fresh after it was inserted.
    pub ttl: Duration,
    /// How often expired views are swept. Zero disables the background sweep.
    pub sweep_interval: Duration,
    /// Capacity of the eviction worker's message channel.
    pub channel_size: usize,
}

impl Default for ViewCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl: Duration::from_secs(3 * 60),
            sweep_interval: Duration::from_secs(30),
            channel_size: 256,
        }
    }
}

/// Identity and freshness of one cached view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStamp {
    version: u64,
    expires_at: Instant,
}

impl Versioned for ViewStamp {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Expiring for ViewStamp {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// How an eviction attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The view was closed and removed from the cache.
    Closed,
    /// Handles were open; the view stays cached.
    Busy,
    /// The view failed to close; it stays cached and will be tried again.
    CloseFailed,
    /// Another eviction already owns this view.
    Contended,
}

enum BeginClose {
    Started,
    Busy(usize),
    Contended,
}

/// A live view together with its open-handle count.
pub struct CachedView {
    mount: MountPath,
    view: Arc<dyn ContainerView>,
    stamp: ViewStamp,
    /// Low bits: open handles. High bits: `CLOSING` / `CLOSED`.
    handles: AtomicUsize,
    /// Woken when a close attempt finishes, either way.
    settled: Notify,
}

impl CachedView {
    fn new(mount: MountPath, view: Arc<dyn ContainerView>, stamp: ViewStamp) -> Self {
        Self {
            mount,
            view,
            stamp,
            handles: AtomicUsize::new(0),
            settled: Notify::new(),
        }
    }

    /// The container this view serves.
    #[must_use]
    pub fn mount(&self) -> &MountPath {
        &self.mount
    }

    /// The provider's view.
    #[must_use]
    pub fn view(&self) -> &dyn ContainerView {
        self.view.as_ref()
    }

    /// Distinguishes successive views created for the same mount path.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.stamp.version
    }

    /// Number of handles currently open against this view.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::Acquire) & !STATE_MASK
    }

    /// Whether the view has been closed. A closed view is no longer in the cache.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handles.load(Ordering::Acquire) & CLOSED != 0
    }

    fn is_retiring(&self) -> bool {
        self.handles.load(Ordering::Acquire) & STATE_MASK != 0
    }

    /// After a request against this view failed: whether the failure came from an eviction
    /// closing the view underneath it. Waits out a close that is still in progress.
    pub(crate) async fn was_evicted(&self) -> bool {
        self.wait_settled().await;
        self.is_closed()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.stamp.expires_at <= now
    }

    /// Pin the view for one open handle. Fails once the view started closing.
    #[must_use]
    pub fn lease(self: &Arc<Self>) -> Option<ViewLease> {
        self.handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n & STATE_MASK == 0).then_some(n + 1)
            })
            .ok()
            .map(|_| ViewLease {
                view: Arc::clone(self),
                released: AtomicBool::new(false),
            })
    }

    fn begin_close(&self) -> BeginClose {
        match self
            .handles
            .compare_exchange(0, CLOSING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => BeginClose::Started,
            Err(n) if n & STATE_MASK != 0 => BeginClose::Contended,
            Err(n) => BeginClose::Busy(n),
        }
    }

    fn finish_close(&self, closed: bool) {
        self.handles
            .store(if closed { CLOSED } else { 0 }, Ordering::Release);
        self.settled.notify_waiters();
    }

    /// Wait until no close attempt is in progress.
    async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.handles.load(Ordering::Acquire) & CLOSING == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CachedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedView")
            .field("mount", &self.mount)
            .field("version", &self.stamp.version)
            .field("open_handles", &self.open_handles())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// One open handle's pin on a [`CachedView`].
///
/// Released exactly once: by [`release`](Self::release) or, failing that, on drop.
#[derive(Debug)]
pub struct ViewLease {
    view: Arc<CachedView>,
    released: AtomicBool,
}

impl ViewLease {
    /// The pinned view.
    #[must_use]
    pub fn view(&self) -> &Arc<CachedView> {
        &self.view
    }

    /// Give the pin back. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.view.handles.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

impl Drop for ViewLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Puts a view back into service if a close attempt is abandoned half-way.
struct CloseGuard<'a> {
    view: &'a CachedView,
    armed: bool,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.view.finish_close(false);
        }
    }
}

/// Close `view` if nobody holds it, removing it from `entries` on success.
async fn retire(entries: &ViewMap, view: &Arc<CachedView>) -> EvictionOutcome {
    match view.begin_close() {
        BeginClose::Busy(handles) => {
            info!(mount = %view.mount, handles, "view is busy, deferring eviction");
            EvictionOutcome::Busy
        }
        BeginClose::Contended => EvictionOutcome::Contended,
        BeginClose::Started => {
            let mut guard = CloseGuard { view, armed: true };
            let result = view.view.close().await;
            guard.armed = false;
            match result {
                Ok(()) => {
                    entries.remove_if(&view.mount, |cached| Arc::ptr_eq(cached, view));
                    view.finish_close(true);
                    info!(mount = %view.mount, version = view.stamp.version, "closed cached view");
                    EvictionOutcome::Closed
                }
                Err(e) => {
                    view.finish_close(false);
                    error!(
                        mount = %view.mount,
                        error = %e,
                        "cannot close cached view, keeping it cached"
                    );
                    EvictionOutcome::CloseFailed
                }
            }
        }
    }
}

/// The eviction callback handed to the LRU worker.
#[derive(Clone)]
struct ViewEvictor {
    entries: Arc<ViewMap>,
}

impl Deleter<MountPath, ViewStamp> for ViewEvictor {
    async fn delete(&mut self, mount: MountPath, stamp: ViewStamp) -> Eviction {
        let view = match self.entries.peek(&mount) {
            Peek::Ready(view) if view.version() == stamp.version => view,
            // Replaced by a newer view, which the tracker learns about separately.
            Peek::Ready(_) | Peek::Absent => return Eviction::Removed,
            // Still being created; try again later.
            Peek::Pending => return Eviction::Retained,
        };

        match retire(&self.entries, &view).await {
            EvictionOutcome::Closed => Eviction::Removed,
            EvictionOutcome::Busy | EvictionOutcome::CloseFailed => Eviction::Retained,
            EvictionOutcome::Contended if view.is_closed() => Eviction::Removed,
            EvictionOutcome::Contended => Eviction::Retained,
        }
    }
}

/// Why [`ViewCache`] could not produce a view.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No provider is registered for the extension.
    #[error("no provider registered for {0}")]
    ProviderNotFound(ContainerExtension),
    /// The provider failed to build the view.
    #[error("cannot create view: {0}")]
    Creation(#[source] Arc<io::Error>),
}

/// Mount path to live view map with LRU and time-to-live eviction.
pub struct ViewCache {
    base: Arc<dyn ReadOnlyFs>,
    registry: Arc<ProviderRegistry>,
    entries: Arc<ViewMap>,
    tracker: Arc<LruEvictionTracker<MountPath, ViewStamp>>,
    config: ViewCacheConfig,
    next_version: AtomicU64,
}

impl ViewCache {
    /// Create an empty cache that builds views over `base` using the providers in `registry`.
    ///
    /// Spawns the eviction worker, so this must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        base: Arc<dyn ReadOnlyFs>,
        registry: Arc<ProviderRegistry>,
        config: ViewCacheConfig,
    ) -> Self {
        let entries = Arc::new(ViewMap::default());
        let evictor = ViewEvictor {
            entries: Arc::clone(&entries),
        };
        let mut tracker = LruEvictionTracker::spawn(evictor, config.channel_size.max(1));
        if !config.sweep_interval.is_zero() {
            tracker = tracker.with_expiry_sweep(config.sweep_interval);
        }

        Self {
            base,
            registry,
            entries,
            tracker: Arc::new(tracker),
            config,
            next_version: AtomicU64::new(0),
        }
    }

    /// The live view for `mount`, creating it with the provider for `extension` on a miss.
    ///
    /// Concurrent misses for the same mount path share a single creation. A failed creation
    /// caches nothing. An expired view is retired first if it is idle.
    pub async fn get_or_create(
        &self,
        mount: &MountPath,
        extension: &ContainerExtension,
    ) -> Result<Arc<CachedView>, CacheError> {
        let provider = self
            .registry
            .lookup(extension)
            .ok_or_else(|| CacheError::ProviderNotFound(extension.clone()))?;

        let mut expiry_checked = false;
        loop {
            let view = self
                .entries
                .get_or_try_init(mount.clone(), || {
                    self.create(mount.clone(), Arc::clone(&provider))
                })
                .await
                .map_err(CacheError::Creation)?;

            if !expiry_checked && view.is_expired(Instant::now()) {
                expiry_checked = true;
                debug!(mount = %mount, version = view.version(), "cached view expired");
                if self.retire(&view).await == EvictionOutcome::Closed {
                    continue;
                }
            }

            if view.is_retiring() {
                view.wait_settled().await;
                continue;
            }

            self.tracker.access(mount.clone());
            return Ok(view);
        }
    }

    /// Like [`get_or_create`](Self::get_or_create), and pin the view for one open handle.
    pub async fn lease(
        &self,
        mount: &MountPath,
        extension: &ContainerExtension,
    ) -> Result<ViewLease, CacheError> {
        loop {
            let view = self.get_or_create(mount, extension).await?;
            if let Some(lease) = view.lease() {
                return Ok(lease);
            }
            // Lost the race against an eviction; wait for it to finish and resolve again.
            view.wait_settled().await;
        }
    }

    fn create(
        &self,
        mount: MountPath,
        provider: Arc<dyn ViewProvider>,
    ) -> impl Future<Output = Result<Arc<CachedView>, io::Error>> + Send + 'static {
        let base = Arc::clone(&self.base);
        let entries = Arc::clone(&self.entries);
        let tracker = Arc::clone(&self.tracker);
        let ViewCacheConfig { capacity, ttl, .. } = self.config;
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);

        async move {
            let view = provider
                .create_view(base, &mount)
                .await
                .inspect_err(|e| error!(mount = %mount, error = %e, "cannot create view"))?;

            let now = Instant::now();
            let expires_at = now
                .checked_add(ttl)
                .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60));
            let stamp = ViewStamp {
                version,
                expires_at,
            };
            info!(mount = %mount, version, "cached new view");
            tracker.upsert(mount.clone(), stamp);

            // `entries` still counts this view's in-flight slot, so this is the size after insert.
            let len = entries.len();
            if len > capacity {
                let excess = u32::try_from(len - capacity).unwrap_or(u32::MAX);
                if !tracker.try_cull(excess) {
                    debug!(len, capacity, "eviction channel full, deferring cull");
                }
            }

            Ok(Arc::new(CachedView::new(mount, view, stamp)))
        }
    }

    /// Try to close `view` now. Idle views are closed and removed; busy ones stay.
    pub async fn retire(&self, view: &Arc<CachedView>) -> EvictionOutcome {
        let outcome = retire(&self.entries, view).await;
        if outcome == EvictionOutcome::Closed {
            self.tracker.forget(view.mount.clone(), view.version());
        }
        outcome
    }

    /// The cached view for `mount` without creating one.
    #[must_use]
    pub fn peek(&self, mount: &MountPath) -> Option<Arc<CachedView>> {
        match self.entries.peek(mount) {
            Peek::Ready(view) => Some(view),
            Peek::Absent | Peek::Pending => None,
        }
    }

    /// Whether `mount` has a cached (or in-flight) view.
    #[must_use]
    pub fn contains(&self, mount: &MountPath) -> bool {
        self.entries.contains(mount)
    }

    /// Schedule an eviction attempt for every cached view. Busy views stay cached.
    ///
    /// Returns `false` if the eviction worker's channel is full.
    #[must_use]
    pub fn purge(&self) -> bool {
        self.tracker.try_cull(u32::MAX)
    }

    /// Schedule eviction of every view whose time-to-live has run out, without waiting for the
    /// background sweep.
    #[must_use]
    pub fn sweep_expired(&self) -> bool {
        self.tracker.try_expire(Instant::now())
    }

    /// Whether scheduled evictions are still running.
    #[must_use]
    pub fn has_pending_evictions(&self) -> bool {
        self.tracker.have_pending_culls()
    }

    /// The settings this cache was built with.
    #[must_use]
    pub fn config(&self) -> &ViewCacheConfig {
        &self.config
    }

    /// Number of cached views, including ones still being created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no view is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCache")
            .field("registry", &self.registry)
            .field("len", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
