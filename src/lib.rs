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

pub mod config;
pub mod find;
pub mod history;
pub mod http;
pub mod tail;

use std::sync::Arc;
use std::time::Duration;

use entries::{Entry, EntryDescriptor, Registry};
use journal::Journal;
use plugin::{ExternalPlugin, ScriptFile};
use task_executor::Executor;

use crate::config::Config;

///
/// The assembled core: the registry (entry tree + cache) and the activity journal it records
/// into. The FUSE adapter, the HTTP surface and the command helpers all run against one of
/// these.
///
pub struct WashCore {
    pub registry: Arc<Registry>,
    pub journal: Journal,
}

///
/// Build the core from configuration: one external plugin root per configured plugin, all
/// sharing an invocation semaphore.
///
pub fn build_core(executor: Executor, config: &Config) -> Result<WashCore, String> {
    let journal_dir = config
        .journal_dir
        .clone()
        .unwrap_or_else(Journal::default_dir);
    let journal = Journal::new(journal_dir)?;

    let limit = plugin::invocation_limit(config.invocation_bound);
    let grace = Duration::from_secs(config.graceful_shutdown_seconds);
    let default_ttls = config.default_ttls();

    let mut roots = Vec::new();
    for plugin_config in &config.plugins {
        let script = Arc::new(ScriptFile::new(plugin_config.script.clone(), grace));
        let invoker = Arc::new(ExternalPlugin::new(script, limit.clone()));
        let mut descriptor = EntryDescriptor::new(
            &plugin_config.name,
            plugin_config.supported_actions.clone(),
        );
        descriptor.state = plugin_config.state.clone();
        descriptor.cache_ttls = plugin_config.cache_ttls;
        roots.push(Entry::root(descriptor, default_ttls, invoker));
    }

    let registry = Registry::new(executor, journal.clone(), roots)?;
    Ok(WashCore {
        registry: Arc::new(registry),
        journal,
    })
}

#[cfg(test)]
mod find_tests;
#[cfg(test)]
mod testutil;
