// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::future::Future;
use std::time::Duration;

use async_latch::AsyncLatch;
use journal::JournalId;
use tokio::time::Instant;

use crate::WashError;

///
/// The explicit per-request handle passed to every capability call: the journal id of the
/// originating actor, an optional deadline, a cancellation signal, and the cache-bypass flag.
///
/// Cancellation is cooperative: `run` races a capability future against the signal and the
/// deadline, and dropping the losing future is what tears the underlying work down (including
/// any plugin subprocess). Joined callers on one cache key each race independently: cancelling
/// one does not cancel the others.
///
#[derive(Clone, Debug)]
pub struct Context {
    journal_id: JournalId,
    deadline: Option<Instant>,
    cancel: AsyncLatch,
    cache_bypass: bool,
}

impl Context {
    pub fn new(journal_id: JournalId) -> Context {
        Context {
            journal_id,
            deadline: None,
            cancel: AsyncLatch::new(),
            cache_bypass: false,
        }
    }

    pub fn journal_id(&self) -> &JournalId {
        &self.journal_id
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Context {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Context {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    ///
    /// Disable both reads and writes of the operation cache for calls under this context.
    ///
    pub fn with_cache_bypass(mut self) -> Context {
        self.cache_bypass = true;
        self
    }

    pub fn cache_bypass(&self) -> bool {
        self.cache_bypass
    }

    ///
    /// Signal cancellation to every capability call parameterized with this context.
    ///
    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    ///
    /// A context for work shared between joined callers: same journal id and deadline, but a
    /// fresh cancellation signal. Shared work is cancelled by abandonment (all of its callers
    /// dropping out), not by any single caller's signal.
    ///
    pub fn detached(&self) -> Context {
        Context {
            journal_id: self.journal_id.clone(),
            deadline: self.deadline,
            cancel: AsyncLatch::new(),
            cache_bypass: self.cache_bypass,
        }
    }

    ///
    /// Resolves when this context is cancelled or its deadline has elapsed.
    ///
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                  _ = self.cancel.triggered() => {}
                  _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.triggered().await,
        }
    }

    ///
    /// Race `work` against cancellation. The work future is dropped when cancellation wins,
    /// which aborts whatever it was doing.
    ///
    pub async fn run<T>(
        &self,
        work: impl Future<Output = Result<T, WashError>>,
    ) -> Result<T, WashError> {
        tokio::select! {
          // Check cancellation first, so that an already-cancelled context never performs work.
          biased;
          _ = self.cancelled() => Err(WashError::Cancelled),
          result = work => result,
        }
    }
}
