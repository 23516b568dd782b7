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

use tokio::sync::watch;

///
/// An AsyncLatch is a simple condition that can be triggered once to release any tasks that are
/// waiting for it.
///
/// Wash uses it as the cancellation signal carried by a request `Context`: capability calls
/// select on `triggered` while they wait on subprocesses or cache promises.
///
/// All calls to `trigger` after the first one are noops.
///
#[derive(Clone, Debug)]
pub struct AsyncLatch {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(false);
        AsyncLatch { sender, receiver }
    }

    ///
    /// Mark this latch triggered, releasing all tasks that are waiting for it to trigger.
    ///
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    ///
    /// Wait for another task to trigger this latch.
    ///
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                // All senders are clones of ours, so this is unreachable while `self` lives, but
                // treating a closed channel as triggered is the conservative reading.
                return;
            }
        }
    }

    ///
    /// Return true if the latch has been triggered.
    ///
    pub fn poll_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}
