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

use std::sync::{Arc, Weak};

use tokio::sync::{oneshot, watch};

///
/// A value computed by one sender, and broadcast to multiple receivers.
///
/// The work producing the value is canceled either:
///   1. explicitly, if the `AsyncValue` handle is dropped
///   2. implicitly, if all receivers go away
///
/// This is the pending-slot primitive of the operation cache: concurrent requests for one cache
/// key each hold a receiver; the single fetch task holds the sender and aborts the underlying
/// plugin call as soon as nobody is waiting for it anymore.
///
/// NB: This is a `tokio::sync::watch` (which covers the second case), plus a `tokio::sync::oneshot`
/// used purely as a drop-guard (to cover the first case).
///
#[derive(Debug)]
pub struct AsyncValue<T: Clone + Send + Sync + 'static> {
    item_receiver: Weak<watch::Receiver<Option<T>>>,
    _abort_guard: oneshot::Sender<()>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValue<T> {
    pub fn new() -> (AsyncValue<T>, AsyncValueSender<T>, AsyncValueReceiver<T>) {
        let (abort_guard, abort_receiver) = oneshot::channel();
        let (item_sender, item_receiver) = watch::channel(None);
        let item_receiver = Arc::new(item_receiver);
        (
            AsyncValue {
                item_receiver: Arc::downgrade(&item_receiver),
                _abort_guard: abort_guard,
            },
            AsyncValueSender {
                item_sender,
                abort_receiver,
            },
            AsyncValueReceiver { item_receiver },
        )
    }

    ///
    /// Returns an AsyncValueReceiver for this value if the associated work has not already been
    /// canceled or completed.
    ///
    pub fn receiver(&self) -> Option<AsyncValueReceiver<T>> {
        self.item_receiver
            .upgrade()
            .map(|item_receiver| AsyncValueReceiver { item_receiver })
    }
}

pub struct AsyncValueReceiver<T: Clone + Send + Sync + 'static> {
    item_receiver: Arc<watch::Receiver<Option<T>>>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueReceiver<T> {
    ///
    /// Wait for the result of the value, or None if the work producing it was canceled.
    ///
    pub async fn recv(&self) -> Option<T> {
        let mut item_receiver = (*self.item_receiver).clone();
        loop {
            if let Some(ref value) = *item_receiver.borrow() {
                return Some(value.clone());
            }

            if item_receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

pub struct AsyncValueSender<T: Clone + Send + Sync + 'static> {
    item_sender: watch::Sender<Option<T>>,
    abort_receiver: oneshot::Receiver<()>,
}

impl<T: Clone + Send + Sync + 'static> AsyncValueSender<T> {
    pub fn send(self, item: T) {
        let _ = self.item_sender.send(Some(item));
    }

    ///
    /// Resolves when the work driving this sender should stop: either the owning `AsyncValue`
    /// was dropped, or every receiver has gone away.
    ///
    pub async fn aborted(&mut self) {
        tokio::select! {
          _ = &mut self.abort_receiver => {}
          _ = self.item_sender.closed() => {}
        }
    }
}

#[cfg(test)]
mod tests;
