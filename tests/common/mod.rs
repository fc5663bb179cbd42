#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deep_fs::cache::eviction::lru::{Deleter, Eviction, Expiring, LruEvictionTracker, Versioned};
use deep_fs::fs::view_cache::ViewCache;
use deep_fs::fs::{ContainerView, DirEntry, Metadata, ReadOnlyFs, VfsFile, ViewProvider};
use deep_fs::{MountPath, VfsPath};
use tokio::time::Instant;

/// Minimal versioned, expiring context for LRU tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MockCtx {
    pub version: u64,
    pub expires_at: Instant,
}

impl MockCtx {
    /// A context that does not expire during a test.
    pub fn fresh(version: u64) -> Self {
        Self {
            version,
            expires_at: Instant::now() + Duration::from_secs(3600),
        }
    }

    pub fn expiring_in(version: u64, ttl: Duration) -> Self {
        Self {
            version,
            expires_at: Instant::now() + ttl,
        }
    }
}

impl Versioned for MockCtx {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Expiring for MockCtx {
    fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// A mock deleter that records every (key, ctx) pair it receives. Keys in `pinned` are retained.
#[derive(Clone)]
pub struct MockDeleter {
    pub deleted: Arc<Mutex<Vec<(u64, MockCtx)>>>,
    pub pinned: Arc<Mutex<BTreeSet<u64>>>,
    pub attempts: Arc<AtomicUsize>,
}

impl MockDeleter {
    pub fn new() -> Self {
        Self {
            deleted: Arc::new(Mutex::new(Vec::new())),
            pinned: Arc::new(Mutex::new(BTreeSet::new())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pin(&self, key: u64) {
        self.pinned.lock().unwrap().insert(key);
    }

    pub fn unpin(&self, key: u64) {
        self.pinned.lock().unwrap().remove(&key);
    }

    /// Returns just the keys that were deleted, in deletion order.
    pub fn deleted_keys(&self) -> Vec<u64> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _)| *k)
            .collect()
    }
}

impl Deleter<u64, MockCtx> for MockDeleter {
    async fn delete(&mut self, key: u64, ctx: MockCtx) -> Eviction {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if self.pinned.lock().unwrap().contains(&key) {
            return Eviction::Retained;
        }
        self.deleted.lock().unwrap().push((key, ctx));
        Eviction::Removed
    }
}

/// Poll `have_pending_culls()` until it returns false, or panic after timeout.
pub async fn wait_for_culls(tracker: &LruEvictionTracker<u64, MockCtx>) {
    for _ in 0..200 {
        if !tracker.have_pending_culls() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("culls did not complete within 1 second");
}

/// Like [`wait_for_culls`], for the view cache's tracker.
pub async fn wait_for_evictions(cache: &ViewCache) {
    for _ in 0..200 {
        if !cache.has_pending_evictions() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("evictions did not complete within 1 second");
}

/// Poll `cond` until it holds, or panic after about a second.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// What a [`MemoryFs`] saw.
#[derive(Debug, Default)]
pub struct IoLog {
    pub opened: Mutex<Vec<String>>,
    pub listed: Mutex<Vec<String>>,
    pub closed_handles: AtomicUsize,
    /// Make every handle's `close` fail.
    pub fail_close: AtomicBool,
}

impl IoLog {
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn listed(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }

    pub fn closed_handles(&self) -> usize {
        self.closed_handles.load(Ordering::SeqCst)
    }
}

/// An in-memory read-only filesystem. Directories are implied by file paths.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, Bytes>,
    pub io_log: Arc<IoLog>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: &'static [u8]) -> Self {
        self.files
            .insert(path.to_owned(), Bytes::from_static(data));
        self
    }

    fn is_dir(&self, path: &VfsPath) -> bool {
        path.is_root() || {
            let prefix = format!("{}/", path.as_str());
            self.files.keys().any(|k| k.starts_with(&prefix))
        }
    }

    fn list(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        if !self.is_dir(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{path} is not a directory"),
            ));
        }
        let prefix = if path.is_root() {
            String::new()
        } else {
            format!("{}/", path.as_str())
        };
        let mut children: BTreeMap<String, Metadata> = BTreeMap::new();
        for (key, data) in &self.files {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    children.insert(dir.to_owned(), Metadata::directory(None));
                }
                None => {
                    children.insert(rest.to_owned(), Metadata::file(data.len() as u64, None));
                }
            }
        }
        Ok(children
            .into_iter()
            .map(|(name, metadata)| DirEntry { name, metadata })
            .collect())
    }
}

#[async_trait]
impl ReadOnlyFs for MemoryFs {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        self.io_log
            .opened
            .lock()
            .unwrap()
            .push(path.as_str().to_owned());
        if let Some(data) = self.files.get(path.as_str()) {
            return Ok(Box::new(MemHandle {
                data: Some(data.clone()),
                entries: Vec::new(),
                io_log: Arc::clone(&self.io_log),
            }));
        }
        if self.is_dir(path) {
            return Ok(Box::new(MemHandle {
                data: None,
                entries: self.list(path)?,
                io_log: Arc::clone(&self.io_log),
            }));
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{path} not found"),
        ))
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        self.io_log
            .listed
            .lock()
            .unwrap()
            .push(path.as_str().to_owned());
        self.list(path)
    }
}

struct MemHandle {
    data: Option<Bytes>,
    entries: Vec<DirEntry>,
    io_log: Arc<IoLog>,
}

#[async_trait]
impl VfsFile for MemHandle {
    async fn read(&self, offset: u64, size: u32) -> io::Result<Bytes> {
        let Some(data) = &self.data else {
            return Err(io::Error::new(io::ErrorKind::IsADirectory, "directory"));
        };
        let start = usize::try_from(offset).unwrap().min(data.len());
        let end = (start + size as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn stat(&self) -> io::Result<Metadata> {
        Ok(match &self.data {
            Some(data) => Metadata::file(data.len() as u64, None),
            None => Metadata::directory(None),
        })
    }

    async fn read_dir(&self) -> io::Result<Vec<DirEntry>> {
        if self.data.is_some() {
            return Err(io::Error::new(io::ErrorKind::NotADirectory, "file"));
        }
        Ok(self.entries.clone())
    }

    async fn close(&self) -> io::Result<()> {
        self.io_log.closed_handles.fetch_add(1, Ordering::SeqCst);
        if self.io_log.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("handle close failed"));
        }
        Ok(())
    }
}

/// Counters and switches shared by a [`MockProvider`] and every view it creates.
#[derive(Debug, Default)]
pub struct ProviderStats {
    pub creations: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_close: AtomicBool,
    pub created_mounts: Mutex<Vec<String>>,
    /// Log shared by every view's in-memory contents.
    pub view_io: Arc<IoLog>,
}

impl ProviderStats {
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn created_mounts(&self) -> Vec<String> {
        self.created_mounts.lock().unwrap().clone()
    }
}

/// A provider whose views serve a fixed set of files and count their lifecycle events.
///
/// Creating a view opens the container in the parent, so a missing container fails with
/// `NotFound` just like a real archive would. Once closed, a view rejects every request.
pub struct MockProvider {
    extension: String,
    contents: Vec<(String, &'static [u8])>,
    create_delay: Duration,
    list_delay: Duration,
    pub stats: Arc<ProviderStats>,
}

impl MockProvider {
    pub fn new(extension: &str) -> Self {
        Self {
            extension: extension.to_owned(),
            contents: Vec::new(),
            create_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
            stats: Arc::new(ProviderStats::default()),
        }
    }

    pub fn with_file(mut self, path: &str, data: &'static [u8]) -> Self {
        self.contents.push((path.to_owned(), data));
        self
    }

    /// Stretch view creation to widen race windows.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Stretch every view's `read_dir`, checking for a close only after the delay.
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }
}

#[async_trait]
impl ViewProvider for MockProvider {
    fn extension(&self) -> &str {
        &self.extension
    }

    async fn create_view(
        &self,
        parent: Arc<dyn ReadOnlyFs>,
        mount: &MountPath,
    ) -> io::Result<Arc<dyn ContainerView>> {
        self.stats.creations.fetch_add(1, Ordering::SeqCst);
        self.stats
            .created_mounts
            .lock()
            .unwrap()
            .push(mount.as_str().to_owned());

        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.stats.fail_create.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{mount} is corrupt"),
            ));
        }

        let container = parent.open(&mount.to_vfs_path()).await?;
        container.close().await?;

        let mut fs = MemoryFs {
            files: BTreeMap::new(),
            io_log: Arc::clone(&self.stats.view_io),
        };
        for (path, data) in &self.contents {
            fs = fs.with_file(path, *data);
        }
        Ok(Arc::new(MockView {
            fs,
            stats: Arc::clone(&self.stats),
            list_delay: self.list_delay,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MockView {
    fs: MemoryFs,
    stats: Arc<ProviderStats>,
    list_delay: Duration,
    closed: AtomicBool,
}

impl MockView {
    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::other("view closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ReadOnlyFs for MockView {
    async fn open(&self, path: &VfsPath) -> io::Result<Box<dyn VfsFile>> {
        self.check_open()?;
        self.fs.open(path).await
    }

    async fn read_dir(&self, path: &VfsPath) -> io::Result<Vec<DirEntry>> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        self.check_open()?;
        self.fs.read_dir(path).await
    }
}

#[async_trait]
impl ContainerView for MockView {
    async fn close(&self) -> io::Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("close failed"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
