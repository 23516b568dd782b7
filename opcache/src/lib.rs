// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_value::{AsyncValue, AsyncValueReceiver, AsyncValueSender};
use parking_lot::Mutex;
use task_executor::Executor;

///
/// A keyed, single-flight, TTL-expiring front for capability calls.
///
/// Keys are `(action, canonical path)`. Each slot is either a completed value with a monotonic
/// expiry, or a pending promise that concurrent requesters join: exactly one underlying call is
/// issued per key, no matter how many callers arrive while it is in flight.
///
/// Contracts:
/// * Failed promises are not cached; the next request retries.
/// * A zero TTL means the completed value is not retained, but in-flight duplicates still
///   coalesce.
/// * `clear` invalidates a path and all of its descendants, for every action. An in-flight
///   promise under a cleared key is aborted; its waiters observe the abort and re-issue.
/// * Expiry uses `Instant` (monotonic): wall-clock changes never evict early.
/// * A caller that abandons its wait merely drops its receiver; the underlying call keeps
///   running for the remaining callers, and is aborted only when the last one is gone.
///
pub struct OpCache<A, V: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<A, V, E>>,
    executor: Executor,
}

impl<A, V: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> Clone
    for OpCache<A, V, E>
{
    fn clone(&self) -> Self {
        OpCache {
            inner: self.inner.clone(),
            executor: self.executor.clone(),
        }
    }
}

struct Inner<A, V: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    slots: Mutex<HashMap<(A, PathBuf), Slot<V, E>>>,
    next_promise_id: AtomicU64,
}

enum Slot<V: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    ///
    /// A promise is being computed. The id distinguishes this promise from any later promise
    /// installed under the same key after an invalidation: a completing promise only writes its
    /// value back if its own id is still current.
    ///
    Pending {
        value: AsyncValue<Result<V, E>>,
        id: u64,
    },
    Resolved {
        value: V,
        expires_at: Instant,
    },
}

enum Lookup<V: Clone + Send + Sync + 'static, E: Clone + Send + Sync + 'static> {
    Hit(V),
    Join(AsyncValueReceiver<Result<V, E>>),
    Fetch {
        sender: AsyncValueSender<Result<V, E>>,
        receiver: AsyncValueReceiver<Result<V, E>>,
        id: u64,
    },
}

impl<A, V, E> OpCache<A, V, E>
where
    A: Copy + Debug + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(executor: Executor) -> OpCache<A, V, E> {
        OpCache {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_promise_id: AtomicU64::new(0),
            }),
            executor,
        }
    }

    ///
    /// Look up `(action, path)`, invoking `fetch` on a miss. `fetch` may be called more than once
    /// if the promise it produces is invalidated mid-flight.
    ///
    /// With `bypass` set, neither reads nor writes touch the cache and no coalescing occurs.
    ///
    pub async fn get<F, Fut>(
        &self,
        action: A,
        path: &Path,
        ttl: Duration,
        bypass: bool,
        fetch: F,
    ) -> Result<V, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if bypass {
            return fetch().await;
        }

        let key = (action, path.to_owned());
        loop {
            let lookup = {
                let mut slots = self.inner.slots.lock();
                let existing = match slots.get(&key) {
                    Some(&Slot::Resolved {
                        ref value,
                        expires_at,
                    }) if Instant::now() < expires_at => Some(Lookup::Hit(value.clone())),
                    // A pending promise whose receivers have all gone away was abandoned before
                    // we could join it: fall through and replace it.
                    Some(Slot::Pending { value, .. }) => value.receiver().map(Lookup::Join),
                    _ => None,
                };
                match existing {
                    Some(lookup) => lookup,
                    None => self.install_promise(&mut slots, &key),
                }
            };

            match lookup {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Join(receiver) => match receiver.recv().await {
                    Some(result) => return result,
                    // Invalidated while we waited: retry against a fresh slot.
                    None => (),
                },
                Lookup::Fetch {
                    sender,
                    receiver,
                    id,
                } => {
                    // NB: the underlying call is spawned (and the subprocess fork happens) outside
                    // of the slot lock.
                    self.drive(key.clone(), id, ttl, sender, fetch());
                    match receiver.recv().await {
                        Some(result) => return result,
                        None => (),
                    }
                }
            }
        }
    }

    fn install_promise(
        &self,
        slots: &mut HashMap<(A, PathBuf), Slot<V, E>>,
        key: &(A, PathBuf),
    ) -> Lookup<V, E> {
        let (value, sender, receiver) = AsyncValue::new();
        let id = self.inner.next_promise_id.fetch_add(1, Ordering::SeqCst);
        slots.insert(key.clone(), Slot::Pending { value, id });
        Lookup::Fetch {
            sender,
            receiver,
            id,
        }
    }

    ///
    /// Drive a promise to completion on the Executor. The result is written back only if this
    /// promise is still the current occupant of its slot, and only if it succeeded with a
    /// positive TTL; it is then broadcast to all joined callers either way.
    ///
    fn drive<Fut>(
        &self,
        key: (A, PathBuf),
        id: u64,
        ttl: Duration,
        mut sender: AsyncValueSender<Result<V, E>>,
        work: Fut,
    ) where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let cache = self.clone();
        let _join = self.executor.native_spawn(async move {
            let result = tokio::select! {
              _ = sender.aborted() => {
                log::trace!("Cache promise for {:?} aborted", key);
                return;
              }
              result = work => result,
            };

            {
                let mut slots = cache.inner.slots.lock();
                if let Some(&Slot::Pending { id: current, .. }) = slots.get(&key) {
                    if current == id {
                        match result {
                            Ok(ref value) if ttl > Duration::ZERO => {
                                slots.insert(
                                    key.clone(),
                                    Slot::Resolved {
                                        value: value.clone(),
                                        expires_at: Instant::now() + ttl,
                                    },
                                );
                            }
                            // Failures and zero-TTL values are not retained.
                            _ => {
                                slots.remove(&key);
                            }
                        }
                    }
                }
            }
            sender.send(result);
        });
    }

    ///
    /// Remove all keys whose path is `path` or a descendant of `path`, regardless of action.
    /// Pending promises under those keys are aborted.
    ///
    pub fn clear(&self, path: &Path) {
        let mut slots = self.inner.slots.lock();
        slots.retain(|(_, key_path), _| !key_path.starts_with(path));
    }

    ///
    /// Remove exactly one key.
    ///
    pub fn clear_key(&self, action: A, path: &Path) {
        let mut slots = self.inner.slots.lock();
        slots.remove(&(action, path.to_owned()));
    }

    pub fn clear_all(&self) {
        self.inner.slots.lock().clear();
    }

    ///
    /// The number of occupied slots, for diagnostics.
    ///
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }
}
