// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use async_latch::AsyncLatch;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use entries::{
    parse_listing, parse_metadata, Action, Context, Entry, EntryDescriptor, ExecOutcome,
    ExecRequest, Invoker, StreamHandle, WashError,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::script::{collect_stream, Script, ScriptHandle};

///
/// The capability backend for entries served by an external plugin executable.
///
/// Invocations follow the calling convention `<exe> <action> <path> <state> [action-args...]`:
/// stdout carries the per-action response, stderr is the error channel, and a non-zero exit
/// signals failure. All invocations share a semaphore bounding subprocess concurrency.
///
pub struct ExternalPlugin {
    script: Arc<dyn Script>,
    limit: Arc<Semaphore>,
}

impl ExternalPlugin {
    pub fn new(script: Arc<dyn Script>, limit: Arc<Semaphore>) -> ExternalPlugin {
        ExternalPlugin { script, limit }
    }

    pub fn script(&self) -> &Arc<dyn Script> {
        &self.script
    }

    fn args_for(action: Action, entry: &Entry) -> Vec<String> {
        vec![
            action.to_string(),
            entry.path_str().to_owned(),
            entry.state().unwrap_or("").to_owned(),
        ]
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, WashError> {
        self.limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WashError::Transient("plugin invocation limit was closed".to_owned()))
    }
}

///
/// One line of an exec invocation's multiplexed stdout.
///
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExecEvent {
    Output { stream: ExecStream, data: String },
    Exit { exit_code: i32 },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ExecStream {
    Stdout,
    Stderr,
}

#[async_trait]
impl Invoker for ExternalPlugin {
    async fn list(
        &self,
        context: &Context,
        entry: &Entry,
    ) -> Result<Vec<EntryDescriptor>, WashError> {
        let _permit = self.acquire().await?;
        let stdout = self
            .script
            .invoke_and_wait(context, &Self::args_for(Action::List, entry), None)
            .await?;
        parse_listing(&stdout)
    }

    async fn read(&self, context: &Context, entry: &Entry) -> Result<Bytes, WashError> {
        let _permit = self.acquire().await?;
        self.script
            .invoke_and_wait(context, &Self::args_for(Action::Read, entry), None)
            .await
    }

    async fn metadata(
        &self,
        context: &Context,
        entry: &Entry,
    ) -> Result<Map<String, Value>, WashError> {
        let _permit = self.acquire().await?;
        let stdout = self
            .script
            .invoke_and_wait(context, &Self::args_for(Action::Metadata, entry), None)
            .await?;
        parse_metadata(&stdout)
    }

    async fn write(&self, context: &Context, entry: &Entry, data: Bytes) -> Result<(), WashError> {
        let _permit = self.acquire().await?;
        // The payload travels on stdin; stdout is empty and ignored.
        self.script
            .invoke_and_wait(context, &Self::args_for(Action::Write, entry), Some(data))
            .await?;
        Ok(())
    }

    async fn delete(&self, context: &Context, entry: &Entry) -> Result<(), WashError> {
        let _permit = self.acquire().await?;
        self.script
            .invoke_and_wait(context, &Self::args_for(Action::Delete, entry), None)
            .await?;
        Ok(())
    }

    async fn signal(
        &self,
        context: &Context,
        entry: &Entry,
        signal: &str,
    ) -> Result<(), WashError> {
        let _permit = self.acquire().await?;
        let mut args = Self::args_for(Action::Signal, entry);
        args.push(signal.to_owned());
        self.script.invoke_and_wait(context, &args, None).await?;
        Ok(())
    }

    async fn exec(
        &self,
        context: &Context,
        entry: &Entry,
        request: ExecRequest,
    ) -> Result<ExecOutcome, WashError> {
        let _permit = self.acquire().await?;
        let mut args = Self::args_for(Action::Exec, entry);
        args.push(request.command.clone());
        args.push(serde_json::to_string(&request.args).map_err(|e| {
            WashError::Transient(format!("Failed to encode exec argument vector: {e}"))
        })?);
        if request.tty {
            args.push("--tty".to_owned());
        }

        let mut handle = self
            .script
            .spawn(context, &args, request.stdin.is_some())
            .await?;
        if let Some(data) = request.stdin {
            if let Some(mut writer) = handle.stdin.take() {
                writer.write_all(&data).await.map_err(|e| {
                    WashError::Transient(format!("Failed to write exec stdin: {e}"))
                })?;
                writer.shutdown().await.map_err(|e| {
                    WashError::Transient(format!("Failed to close exec stdin: {e}"))
                })?;
            }
        }

        let ScriptHandle {
            mut stdout,
            stderr,
            exit,
            ..
        } = handle;
        // Drain stderr concurrently so a chatty subprocess cannot deadlock on a full pipe.
        let stderr_drain = tokio::spawn(collect_stream(stderr));

        let mut line_buffer = BytesMut::new();
        let mut collected_stdout = BytesMut::new();
        let mut collected_stderr = BytesMut::new();
        let mut exit_event: Option<i32> = None;

        let mut apply_event = |line: &[u8]| -> Result<Option<i32>, WashError> {
            let event: ExecEvent = serde_json::from_slice(line).map_err(|e| {
                WashError::Decode(format!("plugin stdout line was not an exec event: {e}"))
            })?;
            match event {
                ExecEvent::Output { stream, data } => {
                    let decoded = BASE64.decode(&data).map_err(|e| {
                        WashError::Decode(format!(
                            "plugin stdout exec event carried invalid base64: {e}"
                        ))
                    })?;
                    match stream {
                        ExecStream::Stdout => collected_stdout.extend_from_slice(&decoded),
                        ExecStream::Stderr => collected_stderr.extend_from_slice(&decoded),
                    }
                    Ok(None)
                }
                ExecEvent::Exit { exit_code } => Ok(Some(exit_code)),
            }
        };

        'read: loop {
            while let Some(newline) = line_buffer.iter().position(|b| *b == b'\n') {
                let line = line_buffer.split_to(newline + 1);
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                if let Some(exit_code) = apply_event(line)? {
                    exit_event = Some(exit_code);
                    break 'read;
                }
            }
            match stdout.next().await {
                Some(Ok(chunk)) => line_buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(WashError::Transient(format!(
                        "Failed to read exec output: {e}"
                    )))
                }
                None => break,
            }
        }
        // A final event is valid without a trailing newline.
        if exit_event.is_none() && !line_buffer.is_empty() {
            exit_event = apply_event(&line_buffer.split())?;
        }

        let process_exit = exit.await.map_err(WashError::Transient)?;
        let process_stderr = stderr_drain
            .await
            .map_err(|e| WashError::Transient(format!("Failed to join stderr reader: {e}")))??;

        match exit_event {
            Some(exit_code) => Ok(ExecOutcome {
                stdout: collected_stdout.freeze(),
                stderr: collected_stderr.freeze(),
                exit_code,
            }),
            None if process_exit != 0 => Err(WashError::Plugin(
                String::from_utf8_lossy(&process_stderr).trim().to_owned(),
            )),
            None => Err(WashError::Decode(
                "plugin stdout ended before an exit_code event".to_owned(),
            )),
        }
    }

    async fn stream(&self, context: &Context, entry: &Entry) -> Result<StreamHandle, WashError> {
        let permit = self.acquire().await?;
        let args = Self::args_for(Action::Stream, entry);
        let handle = self.script.spawn(context, &args, false).await?;
        let ScriptHandle {
            mut stdout,
            stderr,
            exit,
            ..
        } = handle;

        // Opening: the first line must be the `200` sentinel, distinguishing setup failures
        // (non-zero exit before the sentinel) from in-stream ones.
        let mut buffer = BytesMut::new();
        let header = loop {
            if let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(newline + 1);
                break String::from_utf8_lossy(&line[..line.len() - 1])
                    .trim()
                    .to_owned();
            }
            match stdout.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(WashError::Transient(format!(
                        "Failed to read stream output: {e}"
                    )))
                }
                None => {
                    let stderr = collect_stream(stderr).await.unwrap_or_default();
                    let exit_code = exit.await.map_err(WashError::Transient)?;
                    return Err(if exit_code != 0 {
                        WashError::Plugin(String::from_utf8_lossy(&stderr).trim().to_owned())
                    } else {
                        WashError::Decode(
                            "plugin stdout ended before the stream header".to_owned(),
                        )
                    });
                }
            }
        };
        if header != "200" {
            return Err(WashError::Decode(format!(
                "plugin stream header on stdout was {header:?}, expected \"200\""
            )));
        }

        // Live: forward every subsequent byte until cancellation, consumer loss, or EOF.
        let (sender, receiver) = mpsc::channel(16);
        let cancel = AsyncLatch::new();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            // Keep stderr drained so the subprocess never blocks on it.
            let _stderr_drain = tokio::spawn(collect_stream(stderr));
            // `exit` owns the subprocess: dropping it when this task returns is what terminates
            // the plugin (SIGTERM, grace period, SIGKILL).
            let _exit = exit;
            if !buffer.is_empty() && sender.send(Ok(buffer.freeze())).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                  _ = pump_cancel.triggered() => break,
                  chunk = stdout.next() => match chunk {
                    Some(Ok(chunk)) => {
                      if sender.send(Ok(chunk)).await.is_err() {
                        break;
                      }
                    }
                    Some(Err(e)) => {
                      let _ = sender
                        .send(Err(WashError::Transient(format!("Failed to read stream output: {e}"))))
                        .await;
                      break;
                    }
                    None => break,
                  },
                }
            }
            drop(permit);
        });

        Ok(StreamHandle::new(receiver, cancel))
    }
}
