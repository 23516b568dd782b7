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

use std::fmt;

use serde::{Deserialize, Serialize};

mod context;
mod descriptor;
mod invoker;
mod registry;

pub use crate::context::Context;
pub use crate::descriptor::{
    parse_listing, parse_metadata, parse_mode, unix_seconds_to_time, Attributes, CacheTtls,
    EntryDescriptor,
};
pub use crate::invoker::{ExecOutcome, ExecRequest, Invoker, StreamHandle};
pub use crate::registry::{Entry, Registry};

///
/// The fixed vocabulary of capabilities an entry may support.
///
/// `supported_actions` is fixed for an entry's lifetime; invoking an action outside of the set is
/// a `WashError::CapabilityUnsupported`, never a fallback.
///
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    List,
    Read,
    Stream,
    Exec,
    Metadata,
    Write,
    Delete,
    Signal,
}

impl Action {
    ///
    /// Mutating actions are never cached, and invalidate cached state for the entry they ran
    /// against (and its parent's listing).
    ///
    pub fn is_mutating(self) -> bool {
        matches!(self, Action::Write | Action::Delete | Action::Signal)
    }
}

///
/// The error taxonomy of the core. Every category has a stable name (used in journal records),
/// an errno (used by the FUSE adapter) and an HTTP status (used by the control surface).
///
/// Errors are never cached: a failed capability call leaves its cache slot empty.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WashError {
    /// Path resolution failed at some segment.
    NotFound(String),
    /// The action is not in the entry's supported set.
    CapabilityUnsupported { path: String, action: Action },
    /// Plugin stdout did not conform to the calling convention.
    Decode(String),
    /// The plugin subprocess exited non-zero; the message is its stderr.
    Plugin(String),
    /// Deadline elapsed or the caller cancelled.
    Cancelled,
    /// Lower-level I/O that the caller may retry.
    Transient(String),
}

impl WashError {
    pub fn category(&self) -> &'static str {
        match self {
            WashError::NotFound(_) => "not-found",
            WashError::CapabilityUnsupported { .. } => "capability-unsupported",
            WashError::Decode(_) => "decode",
            WashError::Plugin(_) => "plugin",
            WashError::Cancelled => "cancelled",
            WashError::Transient(_) => "transient",
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            WashError::NotFound(_) => libc::ENOENT,
            WashError::CapabilityUnsupported { .. } => libc::ENOTSUP,
            WashError::Decode(_) => libc::EIO,
            WashError::Plugin(_) => libc::EIO,
            WashError::Cancelled => libc::EINTR,
            WashError::Transient(_) => libc::EIO,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            WashError::NotFound(_) => 404,
            WashError::CapabilityUnsupported { .. } => 405,
            WashError::Decode(_) => 502,
            WashError::Plugin(_) => 500,
            WashError::Cancelled => 499,
            WashError::Transient(_) => 503,
        }
    }
}

impl fmt::Display for WashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WashError::NotFound(path) => write!(f, "no entry at {path}"),
            WashError::CapabilityUnsupported { path, action } => {
                write!(f, "{path} does not support the {action} action")
            }
            WashError::Decode(msg) => write!(f, "failed to decode plugin output: {msg}"),
            WashError::Plugin(msg) => write!(f, "{msg}"),
            WashError::Cancelled => write!(f, "operation cancelled"),
            WashError::Transient(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WashError {}

#[cfg(test)]
mod descriptor_tests;
