// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use async_latch::AsyncLatch;

use crate::registry::Entry;
use crate::{Action, Context, EntryDescriptor, WashError};

///
/// A request to run a command against an entry (e.g. inside a container or on a remote host).
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub args: Vec<String>,
    pub stdin: Option<Bytes>,
    pub tty: bool,
}

impl ExecRequest {
    pub fn new<S: AsRef<str>>(command: S, args: Vec<String>) -> ExecRequest {
        ExecRequest {
            command: command.as_ref().to_owned(),
            args,
            stdin: None,
            tty: false,
        }
    }
}

///
/// The collected result of an exec invocation.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_code: i32,
}

///
/// A live byte stream plus its cancel handle.
///
/// The handle is Live from construction; `cancel` (or dropping the handle) moves it to Closed,
/// which releases whatever is producing the bytes — for external plugins, the subprocess.
/// Closed is terminal.
///
#[derive(Debug)]
pub struct StreamHandle {
    chunks: mpsc::Receiver<Result<Bytes, WashError>>,
    cancel: AsyncLatch,
}

impl StreamHandle {
    ///
    /// Construct a handle over a channel of chunks. The producer must watch `cancel` and stop
    /// (releasing its resources) once it triggers.
    ///
    pub fn new(chunks: mpsc::Receiver<Result<Bytes, WashError>>, cancel: AsyncLatch) -> StreamHandle {
        StreamHandle { chunks, cancel }
    }

    ///
    /// The next chunk of the stream, or None when the stream has ended.
    ///
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, WashError>> {
        self.chunks.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.trigger();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.poll_triggered()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.trigger();
    }
}

///
/// The flat capability interface implemented by every plugin backend.
///
/// Core plugins implement this in-process; external plugins are backed by a subprocess script.
/// Dispatch is gated by the entry's `supported_actions` before any of these methods is called,
/// so a backend only needs to implement the actions its entries declare: the defaults reject.
///
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    async fn list(
        &self,
        context: &Context,
        entry: &Entry,
    ) -> Result<Vec<EntryDescriptor>, WashError> {
        let _ = context;
        Err(unsupported(entry, Action::List))
    }

    async fn read(&self, context: &Context, entry: &Entry) -> Result<Bytes, WashError> {
        let _ = context;
        Err(unsupported(entry, Action::Read))
    }

    async fn metadata(
        &self,
        context: &Context,
        entry: &Entry,
    ) -> Result<Map<String, Value>, WashError> {
        let _ = context;
        Err(unsupported(entry, Action::Metadata))
    }

    async fn stream(&self, context: &Context, entry: &Entry) -> Result<StreamHandle, WashError> {
        let _ = context;
        Err(unsupported(entry, Action::Stream))
    }

    async fn exec(
        &self,
        context: &Context,
        entry: &Entry,
        request: ExecRequest,
    ) -> Result<ExecOutcome, WashError> {
        let _ = (context, request);
        Err(unsupported(entry, Action::Exec))
    }

    async fn write(&self, context: &Context, entry: &Entry, data: Bytes) -> Result<(), WashError> {
        let _ = (context, data);
        Err(unsupported(entry, Action::Write))
    }

    async fn delete(&self, context: &Context, entry: &Entry) -> Result<(), WashError> {
        let _ = context;
        Err(unsupported(entry, Action::Delete))
    }

    async fn signal(
        &self,
        context: &Context,
        entry: &Entry,
        signal: &str,
    ) -> Result<(), WashError> {
        let _ = (context, signal);
        Err(unsupported(entry, Action::Signal))
    }
}

fn unsupported(entry: &Entry, action: Action) -> WashError {
    WashError::CapabilityUnsupported {
        path: entry.path_str().to_owned(),
        action,
    }
}
