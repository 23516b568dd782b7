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

mod children;
mod external;
mod script;

pub use crate::children::ManagedChild;
pub use crate::external::ExternalPlugin;
pub use crate::script::{collect_stream, Script, ScriptFile, ScriptHandle};

use std::sync::Arc;

use tokio::sync::Semaphore;

///
/// A shared bound on concurrent external-plugin invocations, to prevent fork storms when many
/// kernel requests fan out at once. Waiting acquirers are cancellable: abandoning the
/// acquisition future releases the queue position.
///
pub fn invocation_limit(bound: usize) -> Arc<Semaphore> {
    Arc::new(Semaphore::new(bound))
}

#[cfg(test)]
mod external_tests;
#[cfg(test)]
mod script_tests;
