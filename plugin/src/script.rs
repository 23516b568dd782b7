// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use entries::{Context, WashError};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryFutureExt, TryStreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::codec::{BytesCodec, FramedRead};

use crate::ManagedChild;

///
/// A spawned plugin invocation: its standard streams and an exit future.
///
/// The exit future owns the underlying process handle, so dropping a ScriptHandle (or just its
/// `exit` field) tears the subprocess down.
///
pub struct ScriptHandle {
    pub stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    pub stdout: BoxStream<'static, std::io::Result<Bytes>>,
    pub stderr: BoxStream<'static, std::io::Result<Bytes>>,
    pub exit: BoxFuture<'static, Result<i32, String>>,
}

///
/// Buffer a byte stream to completion.
///
pub async fn collect_stream(
    mut stream: BoxStream<'static, std::io::Result<Bytes>>,
) -> Result<Bytes, WashError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| WashError::Transient(format!("Failed to read plugin output: {e}")))?;
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

///
/// The runtime's view of an external plugin executable.
///
/// The production implementation (`ScriptFile`) forks the executable; tests substitute an
/// in-memory fake that scripts the subprocess's observable behavior.
///
#[async_trait]
pub trait Script: Send + Sync + 'static {
    fn path(&self) -> &Path;

    ///
    /// Spawn an invocation with the given argument vector. `want_stdin` pipes stdin; otherwise
    /// the subprocess sees an immediately-closed stdin.
    ///
    async fn spawn(
        &self,
        context: &Context,
        args: &[String],
        want_stdin: bool,
    ) -> Result<ScriptHandle, WashError>;

    ///
    /// Invoke synchronously: write `stdin` (if any), collect stdout, and wait for exit. A
    /// non-zero exit is a `PluginError` carrying the subprocess's stderr as its message.
    ///
    async fn invoke_and_wait(
        &self,
        context: &Context,
        args: &[String],
        stdin: Option<Bytes>,
    ) -> Result<Bytes, WashError> {
        let mut handle = self.spawn(context, args, stdin.is_some()).await?;
        if let Some(data) = stdin {
            if let Some(mut writer) = handle.stdin.take() {
                writer.write_all(&data).await.map_err(|e| {
                    WashError::Transient(format!("Failed to write plugin stdin: {e}"))
                })?;
                writer.shutdown().await.map_err(|e| {
                    WashError::Transient(format!("Failed to close plugin stdin: {e}"))
                })?;
            }
        }

        let ScriptHandle {
            stdout, stderr, exit, ..
        } = handle;
        let (stdout, stderr, exit_code) = futures::try_join!(
            collect_stream(stdout),
            collect_stream(stderr),
            exit.map_err(WashError::Transient),
        )?;

        if exit_code == 0 {
            Ok(stdout)
        } else {
            let message = String::from_utf8_lossy(&stderr).trim().to_owned();
            Err(WashError::Plugin(message))
        }
    }
}

///
/// A plugin backed by a single executable on disk.
///
pub struct ScriptFile {
    path: PathBuf,
    graceful_shutdown_timeout: Duration,
}

impl ScriptFile {
    pub fn new(path: PathBuf, graceful_shutdown_timeout: Duration) -> ScriptFile {
        ScriptFile {
            path,
            graceful_shutdown_timeout,
        }
    }
}

#[async_trait]
impl Script for ScriptFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn spawn(
        &self,
        _context: &Context,
        args: &[String],
        want_stdin: bool,
    ) -> Result<ScriptHandle, WashError> {
        let mut command = Command::new(&self.path);
        command
            .args(args)
            .stdin(if want_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = ManagedChild::spawn(&mut command, self.graceful_shutdown_timeout)
            .map_err(WashError::Transient)?;
        log::debug!(
            "Spawned plugin process {} as {:?} with args {:?}",
            self.path.display(),
            child.id(),
            args
        );

        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::pin(stdin) as Pin<Box<dyn AsyncWrite + Send>>);
        let stdout = FramedRead::new(child.stdout.take().unwrap(), BytesCodec::new())
            .map_ok(BytesMut::freeze)
            .boxed();
        let stderr = FramedRead::new(child.stderr.take().unwrap(), BytesCodec::new())
            .map_ok(BytesMut::freeze)
            .boxed();
        let exit = async move { child.wait_for_exit().await }.boxed();

        Ok(ScriptHandle {
            stdin,
            stdout,
            stderr,
            exit,
        })
    }
}
