// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use journal::{Journal, Outcome, Record};
use opcache::OpCache;
use serde_json::{Map, Value};
use task_executor::Executor;

use crate::{
    Action, Attributes, CacheTtls, Context, EntryDescriptor, ExecOutcome, ExecRequest, Invoker,
    StreamHandle, WashError,
};

///
/// A node in the virtual filesystem: a remote resource or a container thereof.
///
/// Entries are cheap handles (the inner state is behind an `Arc`), materialized lazily by their
/// parent's `list` result. Identity across reconstructions is the canonical path, not the
/// object address: the path is the cache key and the stable handle.
///
/// Entries hold a reference to their plugin root's backend, never to their parent: the tree
/// owns downward only.
///
#[derive(Clone)]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.inner.path == other.inner.path
    }
}

struct EntryInner {
    name: String,
    path: String,
    plugin_root: String,
    supported: BTreeSet<Action>,
    attributes: Attributes,
    ttls: CacheTtls,
    state: Option<String>,
    partial_metadata: Map<String, Value>,
    invoker: Arc<dyn Invoker>,
}

impl Entry {
    ///
    /// Construct a plugin root: a synthetic top-level directory served by the given backend.
    ///
    pub fn root(
        descriptor: EntryDescriptor,
        default_ttls: CacheTtls,
        invoker: Arc<dyn Invoker>,
    ) -> Entry {
        let ttls = descriptor
            .cache_ttls
            .unwrap_or_default()
            .inherit(&default_ttls);
        Entry {
            inner: Arc::new(EntryInner {
                path: format!("/{}", descriptor.name),
                plugin_root: descriptor.name.clone(),
                name: descriptor.name,
                supported: descriptor.supported_actions.into_iter().collect(),
                attributes: descriptor.attributes.unwrap_or_default(),
                ttls,
                state: descriptor.state,
                partial_metadata: descriptor.partial_metadata.unwrap_or_default(),
                invoker,
            }),
        }
    }

    ///
    /// Materialize a child from one element of the parent's listing. Cache TTL slots the
    /// descriptor omits inherit the parent's; the backend and plugin root carry over.
    ///
    pub fn child_of(parent: &Entry, descriptor: EntryDescriptor) -> Entry {
        let ttls = descriptor
            .cache_ttls
            .unwrap_or_default()
            .inherit(parent.ttls());
        Entry {
            inner: Arc::new(EntryInner {
                path: format!("{}/{}", parent.path_str(), descriptor.name),
                plugin_root: parent.inner.plugin_root.clone(),
                name: descriptor.name,
                supported: descriptor.supported_actions.into_iter().collect(),
                attributes: descriptor.attributes.unwrap_or_default(),
                ttls,
                state: descriptor.state,
                partial_metadata: descriptor.partial_metadata.unwrap_or_default(),
                invoker: parent.inner.invoker.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The canonical path: slash-joined names from the root.
    pub fn path(&self) -> &Path {
        Path::new(&self.inner.path)
    }

    pub fn path_str(&self) -> &str {
        &self.inner.path
    }

    pub fn plugin_root(&self) -> &str {
        &self.inner.plugin_root
    }

    pub fn supports(&self, action: Action) -> bool {
        self.inner.supported.contains(&action)
    }

    pub fn supported_actions(&self) -> impl Iterator<Item = Action> + '_ {
        self.inner.supported.iter().copied()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.inner.attributes
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.inner.ttls
    }

    /// The opaque token carried unchanged between invocations of an external plugin.
    pub fn state(&self) -> Option<&str> {
        self.inner.state.as_deref()
    }

    pub fn partial_metadata(&self) -> &Map<String, Value> {
        &self.inner.partial_metadata
    }

    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.inner.invoker
    }

    /// An entry which can be listed projects as a directory; all others as regular files.
    pub fn is_container(&self) -> bool {
        self.supports(Action::List)
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.inner.path)
            .field("supported", &self.inner.supported)
            .finish_non_exhaustive()
    }
}

///
/// Cacheable capability results. `stream` and the mutating actions never produce one of these.
///
#[derive(Clone)]
enum Output {
    Listing(Vec<Entry>),
    Bytes(Bytes),
    Metadata(Map<String, Value>),
}

///
/// The registry: plugin roots, path resolution, and capability dispatch routed through the
/// operation cache and recorded in the activity journal.
///
pub struct Registry {
    roots: BTreeMap<String, Entry>,
    cache: OpCache<Action, Output, WashError>,
    journal: Journal,
}

impl Registry {
    pub fn new(executor: Executor, journal: Journal, roots: Vec<Entry>) -> Result<Registry, String> {
        let mut by_name = BTreeMap::new();
        for root in roots {
            if let Some(existing) = by_name.insert(root.name().to_owned(), root) {
                return Err(format!(
                    "Duplicate plugin root {:?}",
                    existing.name()
                ));
            }
        }
        Ok(Registry {
            roots: by_name,
            cache: OpCache::new(executor),
            journal,
        })
    }

    /// The synthetic top-level directories, one per mounted plugin. Always present.
    pub fn roots(&self) -> impl Iterator<Item = &Entry> {
        self.roots.values()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    ///
    /// Resolve a canonical path to an entry, walking from the root and listing each intermediate
    /// entry through the cache. Resolution never creates entries; a segment that does not match
    /// is `NotFound`, and no capability call is made below the failing segment.
    ///
    pub async fn resolve(&self, context: &Context, path: &str) -> Result<Entry, WashError> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = match segments.next() {
            Some(first) => first,
            None => return Err(WashError::NotFound("/".to_owned())),
        };
        let mut current = self
            .roots
            .get(first)
            .ok_or_else(|| WashError::NotFound(format!("/{first}")))?
            .clone();

        for segment in segments {
            let children = self.children(context, &current).await?;
            current = children
                .into_iter()
                .find(|child| child.name() == segment)
                .ok_or_else(|| {
                    WashError::NotFound(format!("{}/{}", current.path_str(), segment))
                })?;
        }
        Ok(current)
    }

    ///
    /// The ordered children of an entry, through the cache.
    ///
    pub async fn children(&self, context: &Context, entry: &Entry) -> Result<Vec<Entry>, WashError> {
        match self.cached(context, entry, Action::List).await? {
            Output::Listing(children) => Ok(children),
            _ => unreachable!("list produced a non-listing output"),
        }
    }

    ///
    /// The byte contents of an entry, through the cache.
    ///
    pub async fn read(&self, context: &Context, entry: &Entry) -> Result<Bytes, WashError> {
        match self.cached(context, entry, Action::Read).await? {
            Output::Bytes(bytes) => Ok(bytes),
            _ => unreachable!("read produced a non-bytes output"),
        }
    }

    ///
    /// The metadata mapping of an entry, through the cache: the union of the entry's partial
    /// metadata, its inline attributes, and the plugin-supplied mapping (which wins on key
    /// collisions).
    ///
    pub async fn metadata(
        &self,
        context: &Context,
        entry: &Entry,
    ) -> Result<Map<String, Value>, WashError> {
        match self.cached(context, entry, Action::Metadata).await? {
            Output::Metadata(map) => Ok(map),
            _ => unreachable!("metadata produced a non-mapping output"),
        }
    }

    ///
    /// Open a lazy byte stream for an entry. Never cached.
    ///
    pub async fn stream(&self, context: &Context, entry: &Entry) -> Result<StreamHandle, WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, Action::Stream) {
            Err(e) => Err(e),
            Ok(()) => context.run(entry.invoker().stream(context, entry)).await,
        };
        self.record(context, entry.path_str(), Action::Stream, started, &result);
        result
    }

    ///
    /// Run a command against an entry. Never cached.
    ///
    pub async fn exec(
        &self,
        context: &Context,
        entry: &Entry,
        request: ExecRequest,
    ) -> Result<ExecOutcome, WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, Action::Exec) {
            Err(e) => Err(e),
            Ok(()) => context.run(entry.invoker().exec(context, entry, request)).await,
        };
        self.record(context, entry.path_str(), Action::Exec, started, &result);
        result
    }

    pub async fn write(
        &self,
        context: &Context,
        entry: &Entry,
        data: Bytes,
    ) -> Result<(), WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, Action::Write) {
            Err(e) => Err(e),
            Ok(()) => context.run(entry.invoker().write(context, entry, data)).await,
        };
        if result.is_ok() {
            self.invalidate_after_mutation(entry);
        }
        self.record(context, entry.path_str(), Action::Write, started, &result);
        result
    }

    pub async fn delete(&self, context: &Context, entry: &Entry) -> Result<(), WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, Action::Delete) {
            Err(e) => Err(e),
            Ok(()) => context.run(entry.invoker().delete(context, entry)).await,
        };
        if result.is_ok() {
            self.invalidate_after_mutation(entry);
        }
        self.record(context, entry.path_str(), Action::Delete, started, &result);
        result
    }

    pub async fn signal(
        &self,
        context: &Context,
        entry: &Entry,
        signal: &str,
    ) -> Result<(), WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, Action::Signal) {
            Err(e) => Err(e),
            Ok(()) => context.run(entry.invoker().signal(context, entry, signal)).await,
        };
        if result.is_ok() {
            self.invalidate_after_mutation(entry);
        }
        self.record(context, entry.path_str(), Action::Signal, started, &result);
        result
    }

    ///
    /// Invalidate a path and everything beneath it, for every action.
    ///
    pub fn clear(&self, path: &Path) {
        self.cache.clear(path);
    }

    ///
    /// Route a cacheable action through the operation cache, recording the invocation.
    ///
    async fn cached(
        &self,
        context: &Context,
        entry: &Entry,
        action: Action,
    ) -> Result<Output, WashError> {
        let started = Instant::now();
        let result = match self.check_supported(entry, action) {
            Err(e) => Err(e),
            Ok(()) => {
                let ttl = entry.ttls().ttl_for(action);
                let fetch = {
                    // Shared (possibly joined-upon) work runs under a detached context: it is
                    // cancelled by abandonment, not by any single caller's signal.
                    let context = context.detached();
                    let entry = entry.clone();
                    move || {
                        let context = context.clone();
                        let entry = entry.clone();
                        async move { call(context, entry, action).await }
                    }
                };
                context
                    .run(self.cache.get(action, entry.path(), ttl, context.cache_bypass(), fetch))
                    .await
            }
        };
        self.record(context, entry.path_str(), action, started, &result);
        result
    }

    fn check_supported(&self, entry: &Entry, action: Action) -> Result<(), WashError> {
        if entry.supports(action) {
            Ok(())
        } else {
            Err(WashError::CapabilityUnsupported {
                path: entry.path_str().to_owned(),
                action,
            })
        }
    }

    ///
    /// Mutations clear the non-mutating keys at the entry's own path, plus the parent's
    /// listing, before the mutation returns to its caller. Descendants keep their cached
    /// state: invalidating a whole subtree is the explicit `clear` command's job.
    ///
    fn invalidate_after_mutation(&self, entry: &Entry) {
        log::debug!("Invalidating cached keys for {}", entry.path_str());
        for action in [Action::List, Action::Read, Action::Metadata] {
            self.cache.clear_key(action, entry.path());
        }
        if let Some(parent) = entry.path().parent() {
            self.cache.clear_key(Action::List, parent);
        }
    }

    fn record<T>(
        &self,
        context: &Context,
        path: &str,
        action: Action,
        started: Instant,
        result: &Result<T, WashError>,
    ) {
        let outcome = match result {
            Ok(_) => Outcome::Ok,
            Err(e) => Outcome::Error {
                category: e.category().to_owned(),
                message: e.to_string(),
            },
        };
        self.journal.record(Record::new(
            context.journal_id(),
            path,
            &action.to_string(),
            started.elapsed(),
            outcome,
        ));
    }
}

///
/// Perform the underlying capability call for a cacheable action.
///
async fn call(context: Context, entry: Entry, action: Action) -> Result<Output, WashError> {
    match action {
        Action::List => {
            let descriptors = entry.invoker().list(&context, &entry).await?;
            Ok(Output::Listing(build_children(&entry, descriptors)?))
        }
        Action::Read => {
            let bytes = entry.invoker().read(&context, &entry).await?;
            Ok(Output::Bytes(apply_size_policy(&entry, bytes)?))
        }
        Action::Metadata => {
            let supplied = entry.invoker().metadata(&context, &entry).await?;
            Ok(Output::Metadata(metadata_union(&entry, supplied)))
        }
        action => unreachable!("action {action} is not cacheable"),
    }
}

fn build_children(
    parent: &Entry,
    descriptors: Vec<EntryDescriptor>,
) -> Result<Vec<Entry>, WashError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        if !seen.insert(&descriptor.name) {
            return Err(WashError::Decode(format!(
                "listing of {} contains a duplicate entry {:?}",
                parent.path_str(),
                descriptor.name
            )));
        }
    }
    Ok(descriptors
        .into_iter()
        .map(|descriptor| Entry::child_of(parent, descriptor))
        .collect())
}

///
/// The `size` attribute is authoritative when present: longer plugin output is truncated to it,
/// shorter output is an error. See DESIGN.md.
///
fn apply_size_policy(entry: &Entry, mut bytes: Bytes) -> Result<Bytes, WashError> {
    match entry.attributes().size {
        Some(size) if (bytes.len() as u64) > size => {
            bytes.truncate(size as usize);
            Ok(bytes)
        }
        Some(size) if (bytes.len() as u64) < size => Err(WashError::Decode(format!(
            "plugin returned {} bytes for {} whose size attribute is {}",
            bytes.len(),
            entry.path_str(),
            size
        ))),
        _ => Ok(bytes),
    }
}

fn metadata_union(entry: &Entry, supplied: Map<String, Value>) -> Map<String, Value> {
    let mut union = entry.partial_metadata().clone();
    if !entry.attributes().is_empty() {
        if let Ok(value) = serde_json::to_value(*entry.attributes()) {
            union.insert("attributes".to_owned(), value);
        }
    }
    for (key, value) in supplied {
        union.insert(key, value);
    }
    union
}
