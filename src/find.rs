// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use entries::{Action, Context, Entry, Registry, WashError};
use regex::Regex;
use serde_json::Value;

///
/// Predicates for a `find` traversal. Attribute predicates evaluate against the entry handle
/// itself; metadata predicates pull the `metadata` capability lazily, and only when present.
///
#[derive(Default)]
pub struct FindPredicates {
    pub name: Option<Regex>,
    pub min_size: Option<u64>,
    pub max_depth: Option<usize>,
    /// Top-level metadata keys that must equal the given values.
    pub metadata: Vec<(String, Value)>,
}

impl FindPredicates {
    fn needs_metadata(&self) -> bool {
        !self.metadata.is_empty()
    }
}

///
/// Depth-first traversal from `start`, returning the canonical paths of matching entries in
/// visit order. Listing goes through the cache like any other capability call.
///
pub async fn find(
    registry: &Registry,
    context: &Context,
    start: &str,
    predicates: &FindPredicates,
) -> Result<Vec<String>, WashError> {
    let mut stack: Vec<(Entry, usize)> = if start == "/" {
        let mut roots: Vec<_> = registry.roots().cloned().map(|root| (root, 0)).collect();
        roots.reverse();
        roots
    } else {
        vec![(registry.resolve(context, start).await?, 0)]
    };

    let mut matched = Vec::new();
    while let Some((entry, depth)) = stack.pop() {
        if matches(registry, context, &entry, predicates).await? {
            matched.push(entry.path_str().to_owned());
        }

        let descend = entry.is_container()
            && predicates.max_depth.map_or(true, |max| depth < max);
        if descend {
            let mut children = registry.children(context, &entry).await?;
            // Reversed onto the stack, so that children pop in listing order.
            children.reverse();
            for child in children {
                stack.push((child, depth + 1));
            }
        }
    }
    Ok(matched)
}

async fn matches(
    registry: &Registry,
    context: &Context,
    entry: &Entry,
    predicates: &FindPredicates,
) -> Result<bool, WashError> {
    if let Some(ref name) = predicates.name {
        if !name.is_match(entry.name()) {
            return Ok(false);
        }
    }
    if let Some(min_size) = predicates.min_size {
        if entry.attributes().size.unwrap_or(0) < min_size {
            return Ok(false);
        }
    }
    if predicates.needs_metadata() {
        if !entry.supports(Action::Metadata) {
            return Ok(false);
        }
        let metadata = registry.metadata(context, entry).await?;
        for (key, expected) in &predicates.metadata {
            if metadata.get(key) != Some(expected) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
