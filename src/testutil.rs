// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use entries::{
    Action, CacheTtls, Context, Entry, EntryDescriptor, Invoker, Registry, StreamHandle, WashError,
};
use journal::Journal;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::WashCore;

///
/// An in-process backend with canned listings, contents, metadata and streams, used by the
/// helper and HTTP-surface tests.
///
#[derive(Default)]
pub struct FakeInvoker {
    pub listings: Mutex<HashMap<String, Vec<EntryDescriptor>>>,
    pub reads: Mutex<HashMap<String, Bytes>>,
    pub metadata: Mutex<HashMap<String, Map<String, Value>>>,
    pub streams: Mutex<HashMap<String, Vec<Bytes>>>,
    pub writes: Mutex<Vec<(String, Bytes)>>,
    pub deletes: Mutex<Vec<String>>,
    pub list_calls: Mutex<Vec<String>>,
    pub metadata_calls: Mutex<Vec<String>>,
}

impl FakeInvoker {
    pub fn new() -> Arc<FakeInvoker> {
        Arc::new(FakeInvoker::default())
    }
}

#[async_trait]
impl Invoker for FakeInvoker {
    async fn list(
        &self,
        _context: &Context,
        entry: &Entry,
    ) -> Result<Vec<EntryDescriptor>, WashError> {
        self.list_calls.lock().push(entry.path_str().to_owned());
        self.listings
            .lock()
            .get(entry.path_str())
            .cloned()
            .ok_or_else(|| WashError::Plugin(format!("no listing for {}", entry.path_str())))
    }

    async fn read(&self, _context: &Context, entry: &Entry) -> Result<Bytes, WashError> {
        self.reads
            .lock()
            .get(entry.path_str())
            .cloned()
            .ok_or_else(|| WashError::Plugin(format!("no content for {}", entry.path_str())))
    }

    async fn metadata(
        &self,
        _context: &Context,
        entry: &Entry,
    ) -> Result<Map<String, Value>, WashError> {
        self.metadata_calls.lock().push(entry.path_str().to_owned());
        Ok(self
            .metadata
            .lock()
            .get(entry.path_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn stream(&self, _context: &Context, entry: &Entry) -> Result<StreamHandle, WashError> {
        let chunks = self
            .streams
            .lock()
            .get(entry.path_str())
            .cloned()
            .ok_or_else(|| WashError::Plugin(format!("no stream for {}", entry.path_str())))?;
        let (sender, receiver) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in chunks {
                if sender.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(StreamHandle::new(receiver, async_latch::AsyncLatch::new()))
    }

    async fn write(&self, _context: &Context, entry: &Entry, data: Bytes) -> Result<(), WashError> {
        self.writes
            .lock()
            .push((entry.path_str().to_owned(), data));
        Ok(())
    }

    async fn delete(&self, _context: &Context, entry: &Entry) -> Result<(), WashError> {
        self.deletes.lock().push(entry.path_str().to_owned());
        Ok(())
    }
}

///
/// A core with a single fake-backed root named `fake`. The journal directory is kept alive by
/// the returned TempDir.
///
pub fn fake_core(fake: &Arc<FakeInvoker>) -> (Arc<WashCore>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let journal = Journal::new(dir.path().to_owned()).unwrap();
    let root = Entry::root(
        EntryDescriptor::new(
            "fake",
            vec![Action::List, Action::Metadata],
        ),
        CacheTtls::uniform(60),
        fake.clone(),
    );
    let registry =
        Registry::new(task_executor::Executor::new(), journal.clone(), vec![root]).unwrap();
    (
        Arc::new(WashCore {
            registry: Arc::new(registry),
            journal,
        }),
        dir,
    )
}

pub fn file_descriptor(name: &str, size: u64) -> EntryDescriptor {
    let mut descriptor = EntryDescriptor::new(name, vec![Action::Read, Action::Metadata]);
    descriptor.attributes = Some(entries::Attributes {
        size: Some(size),
        ..entries::Attributes::default()
    });
    descriptor
}

pub fn dir_descriptor(name: &str) -> EntryDescriptor {
    EntryDescriptor::new(name, vec![Action::List, Action::Metadata])
}
