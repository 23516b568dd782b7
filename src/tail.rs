// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use entries::{Context, Registry, WashError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

///
/// Follow the given entries' byte streams, multiplexed onto one writer with `==> path <==`
/// banners whenever the source changes (the shape `tail -f` uses for multiple files).
///
/// Runs until every stream ends or the context is cancelled; stream handles are cancelled on
/// the way out either way.
///
pub async fn tail_follow<W: AsyncWrite + Unpin>(
    registry: &Registry,
    context: &Context,
    paths: &[String],
    out: &mut W,
) -> Result<(), WashError> {
    let (sender, mut receiver) = mpsc::channel::<(usize, Result<bytes::Bytes, WashError>)>(16);

    let mut forwarders = Vec::new();
    for (index, path) in paths.iter().enumerate() {
        let entry = registry.resolve(context, path).await?;
        let mut handle = registry.stream(context, &entry).await?;
        let sender = sender.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(chunk) = handle.next_chunk().await {
                if sender.send((index, chunk)).await.is_err() {
                    break;
                }
            }
            // Dropping the handle cancels the stream and releases the subprocess.
        }));
    }
    drop(sender);

    let write_error =
        |e: std::io::Error| WashError::Transient(format!("Failed to write tail output: {e}"));

    let mut current: Option<usize> = None;
    let result = loop {
        let received = tokio::select! {
          _ = context.cancelled() => break Ok(()),
          received = receiver.recv() => received,
        };
        match received {
            Some((index, Ok(chunk))) => {
                if current != Some(index) {
                    out.write_all(format!("\n==> {} <==\n", paths[index]).as_bytes())
                        .await
                        .map_err(write_error)?;
                    current = Some(index);
                }
                out.write_all(&chunk).await.map_err(write_error)?;
                out.flush().await.map_err(write_error)?;
            }
            Some((index, Err(e))) => {
                log::warn!("Stream for {} failed: {}", paths[index], e);
            }
            // All streams have ended.
            None => break Ok(()),
        }
    };

    for forwarder in forwarders {
        forwarder.abort();
    }
    result
}
