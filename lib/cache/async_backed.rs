//! Concurrent deduplication cache for fallible async computations.
//!
//! Given a key and an async factory, ensures at most one factory runs per key at a time.
//! Subsequent callers for the same key await the already-in-flight computation via a [`Shared`]
//! future. A factory that fails leaves nothing behind: every caller that joined it receives the
//! error, and the next caller starts over with a fresh factory.
//!
//! Note that this cache does not evict on its own. Owners remove entries explicitly with
//! [`remove_if`](FutureBackedCache::remove_if).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::{fmt::Debug, future::Future, hash::Hash, pin::Pin};

use futures::FutureExt as _;
use futures::future::Shared;

type SharedFut<V, E> = Shared<Pin<Box<dyn Future<Output = Option<Result<V, Arc<E>>>> + Send>>>;

/// Two-state slot: `InFlight` while a factory future is running, then promoted to `Ready` once
/// the future completes successfully.
///
/// The `InFlight` variant yields `None` when the factory panicked (caught by `catch_unwind`).
enum Slot<V, E> {
    InFlight(SharedFut<V, E>),
    Ready(V),
}

/// Non-blocking view of a key's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peek<V> {
    /// Nothing is cached and nothing is being computed.
    Absent,
    /// A factory is running for this key.
    Pending,
    /// The cached value.
    Ready(V),
}

/// Deduplicating async cache.
///
/// If [`get_or_try_init`](Self::get_or_try_init) is called concurrently for the same key, only one
/// invocation of the factory runs. All callers receive a clone of the result.
pub struct FutureBackedCache<K, V, E> {
    map: scc::HashMap<K, Slot<V, E>>,
}

impl<K, V, E> Default for FutureBackedCache<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            map: scc::HashMap::default(),
        }
    }
}

impl<K, V, E> FutureBackedCache<K, V, E>
where
    K: Eq + Hash + Debug + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Get the cached value for `key`, or initialize it by running `factory`.
    ///
    /// If another caller is already computing the value for this key, this awaits the in-flight
    /// computation instead of starting a duplicate. If the factory returns `Err`, **nothing is
    /// cached** and the error is handed to every caller that was waiting on it.
    ///
    /// # Panics
    ///
    /// Panics if this caller joins an in-flight factory that itself panicked (i.e. the caller
    /// lost the race to insert a fresh entry after the poisoned slot was removed).
    pub async fn get_or_try_init<F, Fut>(&self, key: K, factory: F) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        // Fast path: value already cached or being computed.
        let existing = self
            .map
            .read_async(&key, |_, slot| match slot {
                Slot::Ready(v) => Ok(v.clone()),
                Slot::InFlight(shared) => Err(shared.clone()),
            })
            .await;

        match existing {
            Some(Ok(v)) => return Ok(v),
            Some(Err(shared)) => {
                if let Some(result) = self.await_shared(&key, shared).await {
                    return result;
                }
                // Factory panicked; entry removed. Fall through to re-insert below.
            }
            None => {}
        }

        // Slow path: use entry_async for atomic check-and-insert.
        let shared = match self.map.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(occ) => match occ.get() {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::InFlight(shared) => shared.clone(),
            },
            scc::hash_map::Entry::Vacant(vac) => {
                let shared = Self::make_shared(factory);
                let ret = shared.clone();
                vac.insert_entry(Slot::InFlight(shared));
                ret
            }
        };

        if let Some(result) = self.await_shared(&key, shared).await {
            return result;
        }

        panic!("FutureBackedCache: joined an in-flight factory that panicked for key {key:?}");
    }

    /// Get the cached value for `key` if it exists, awaiting an in-flight computation.
    ///
    /// Returns `None` if the key is absent or the in-flight factory failed.
    pub async fn get(&self, key: &K) -> Option<V> {
        let existing = self
            .map
            .read_async(key, |_, slot| match slot {
                Slot::Ready(v) => Ok(v.clone()),
                Slot::InFlight(shared) => Err(shared.clone()),
            })
            .await;

        match existing {
            Some(Ok(v)) => Some(v),
            Some(Err(shared)) => self.await_shared(key, shared).await?.ok(),
            None => None,
        }
    }

    /// Inspect the slot for `key` without waiting.
    #[must_use]
    pub fn peek(&self, key: &K) -> Peek<V> {
        self.map
            .read_sync(key, |_, slot| match slot {
                Slot::Ready(v) => Peek::Ready(v.clone()),
                Slot::InFlight(_) => Peek::Pending,
            })
            .unwrap_or(Peek::Absent)
    }

    /// Remove the ready value for `key` if `pred` accepts it. In-flight slots are never removed.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if(&self, key: &K, pred: impl Fn(&V) -> bool) -> bool {
        self.map
            .remove_if_sync(key, |slot| match slot {
                Slot::Ready(v) => pred(v),
                Slot::InFlight(_) => false,
            })
            .is_some()
    }

    /// Whether `key` has a ready or in-flight slot.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.read_sync(key, |_, _| ()).is_some()
    }

    /// Await a `Shared` future, handle promotion to `Ready`, and clean up after failures.
    ///
    /// Returns `None` if the factory panicked, after removing the poisoned entry from the map.
    /// Promotion and removal only touch the slot if it still holds this very future, so a late
    /// waiter never clobbers a newer factory for the same key.
    async fn await_shared(
        &self,
        key: &K,
        shared: SharedFut<V, E>,
    ) -> Option<Result<V, Arc<E>>> {
        let mut guard = PromoteGuard {
            map: &self.map,
            key,
            shared: shared.clone(),
            value: None,
        };

        let result = shared.clone().await;

        match result {
            Some(Ok(v)) => {
                guard.value = Some(v.clone());

                self.map
                    .update_async(key, |_, slot| {
                        if matches!(slot, Slot::InFlight(s) if s.ptr_eq(&shared)) {
                            *slot = Slot::Ready(v.clone());
                        }
                    })
                    .await;

                guard.value = None;
                Some(Ok(v))
            }
            Some(Err(e)) => {
                self.remove_in_flight(key, &shared);
                Some(Err(e))
            }
            None => {
                // Factory panicked. Remove the poisoned InFlight entry so the next caller
                // can retry.
                self.remove_in_flight(key, &shared);
                None
            }
        }
    }

    fn remove_in_flight(&self, key: &K, shared: &SharedFut<V, E>) {
        drop(
            self.map
                .remove_if_sync(key, |slot| matches!(slot, Slot::InFlight(s) if s.ptr_eq(shared))),
        );
    }

    /// Wrap a factory future in `catch_unwind`, producing a `Shared` whose output is `None` on
    /// panic.
    fn make_shared<F, Fut>(factory: F) -> SharedFut<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fut = AssertUnwindSafe(factory()).catch_unwind();
        let boxed: Pin<Box<dyn Future<Output = Option<Result<V, Arc<E>>>> + Send>> =
            Box::pin(async move { fut.await.ok().map(|r| r.map_err(Arc::new)) });
        boxed.shared()
    }

    /// Returns the number of entries in the cache (both `Ready` and `InFlight`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the cache contains no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Drop guard that synchronously promotes an `InFlight` entry to `Ready` if the caller
/// is cancelled between `shared.await` completing and the async promotion running.
///
/// Set `value = None` to defuse after successful promotion.
struct PromoteGuard<'a, K, V, E>
where
    K: Eq + Hash,
{
    map: &'a scc::HashMap<K, Slot<V, E>>,
    key: &'a K,
    shared: SharedFut<V, E>,
    value: Option<V>,
}

impl<K, V, E> Drop for PromoteGuard<'_, K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            let shared = &self.shared;
            self.map.update_sync(self.key, |_, slot| {
                if matches!(slot, Slot::InFlight(s) if s.ptr_eq(shared)) {
                    *slot = Slot::Ready(v);
                }
            });
        }
    }
}
