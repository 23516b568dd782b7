// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use entries::{Action, CacheTtls, Context, Entry, EntryDescriptor, ExecRequest, Invoker, WashError};
use journal::JournalId;

use crate::{invocation_limit, ExternalPlugin, Script, ScriptFile};

const GRACE: Duration = Duration::from_secs(1);

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("plugin.sh");
    std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn context() -> Context {
    Context::new(JournalId::new("test"))
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| (*s).to_owned()).collect()
}

#[tokio::test]
async fn invoke_and_wait_collects_stdout() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = ScriptFile::new(write_script(dir.path(), "echo -n hello"), GRACE);

    let stdout = script
        .invoke_and_wait(&context(), &args(&["read", "/x", ""]), None)
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"hello"), stdout);
}

#[tokio::test]
async fn arguments_reach_the_script() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = ScriptFile::new(write_script(dir.path(), r#"echo -n "$1:$2:$3""#), GRACE);

    let stdout = script
        .invoke_and_wait(&context(), &args(&["read", "/aws/vm1", "state"]), None)
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"read:/aws/vm1:state"), stdout);
}

#[tokio::test]
async fn nonzero_exit_is_a_plugin_error_with_stderr() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = ScriptFile::new(
        write_script(dir.path(), "echo boom >&2\nexit 2"),
        GRACE,
    );

    assert_eq!(
        Err(WashError::Plugin("boom".to_owned())),
        script
            .invoke_and_wait(&context(), &args(&["read", "/x", ""]), None)
            .await
    );
}

#[tokio::test]
async fn stdin_reaches_the_script() {
    let dir = tempfile::TempDir::new().unwrap();
    let script = ScriptFile::new(write_script(dir.path(), "cat"), GRACE);

    let stdout = script
        .invoke_and_wait(
            &context(),
            &args(&["write", "/x", ""]),
            Some(Bytes::from_static(b"payload")),
        )
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"payload"), stdout);
}

#[tokio::test]
async fn exec_chunks_roundtrip_through_a_real_subprocess() {
    let dir = tempfile::TempDir::new().unwrap();
    // "aGk=" is base64 for "hi".
    let body = r#"echo '{"stream":"stdout","data":"aGk="}'
echo '{"exit_code":7}'"#;
    let script = Arc::new(ScriptFile::new(write_script(dir.path(), body), GRACE));
    let plugin = Arc::new(ExternalPlugin::new(script, invocation_limit(4)));
    let entry = Entry::root(
        EntryDescriptor::new("host", vec![Action::Exec]),
        CacheTtls::default(),
        plugin.clone(),
    );

    let outcome = plugin
        .exec(&context(), &entry, ExecRequest::new("uname", vec![]))
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"hi"), outcome.stdout);
    assert_eq!(7, outcome.exit_code);
}

#[tokio::test]
async fn cancelled_stream_terminates_the_subprocess_within_the_grace_period() {
    let dir = tempfile::TempDir::new().unwrap();
    let marker = dir.path().join("terminated");
    // The script emits the stream header and then hangs; on SIGTERM it drops a marker file so
    // the test can observe that cancellation reached the process group.
    let body = format!(
        r#"trap 'touch {marker}; exit 0' TERM
echo 200
echo streaming
sleep 300 &
wait"#,
        marker = marker.display()
    );
    let script = Arc::new(ScriptFile::new(write_script(dir.path(), &body), GRACE));
    let plugin = Arc::new(ExternalPlugin::new(script, invocation_limit(4)));
    let entry = Entry::root(
        EntryDescriptor::new("logs", vec![Action::Stream]),
        CacheTtls::default(),
        plugin.clone(),
    );

    let mut handle = plugin.stream(&context(), &entry).await.unwrap();
    let mut streamed = Vec::new();
    while streamed != b"streaming\n" {
        let chunk = handle.next_chunk().await.unwrap().unwrap();
        streamed.extend_from_slice(&chunk);
    }

    handle.cancel();
    let next = tokio::time::timeout(Duration::from_secs(5), handle.next_chunk())
        .await
        .expect("Producer should stop after cancellation");
    assert!(next.is_none());

    // SIGTERM reached the subprocess and it shut down gracefully.
    for _ in 0..100 {
        if marker.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Subprocess was not terminated within the grace period");
}
