// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use entries::{Action, CacheTtls, Context, Entry, EntryDescriptor, ExecRequest, Invoker, WashError};
use futures::{FutureExt, StreamExt};
use journal::JournalId;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite};

use crate::script::{Script, ScriptHandle};
use crate::{invocation_limit, ExternalPlugin};

///
/// Scripts the observable behavior of a plugin subprocess, keyed by action name.
///
#[derive(Default)]
struct FakeScript {
    path: PathBuf,
    responses: Mutex<HashMap<String, Canned>>,
    calls: Mutex<Vec<Vec<String>>>,
    stdin_seen: Arc<Mutex<BytesMut>>,
}

#[derive(Clone, Default)]
struct Canned {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: i32,
    /// Emit stdout, then never finish (until the handle is dropped).
    hang_after_stdout: bool,
}

impl FakeScript {
    fn new() -> Arc<FakeScript> {
        Arc::new(FakeScript {
            path: PathBuf::from("/fake/plugin"),
            ..FakeScript::default()
        })
    }

    fn respond(&self, action: &str, canned: Canned) {
        self.responses.lock().insert(action.to_owned(), canned);
    }

    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    fn stdin_seen(&self) -> Bytes {
        self.stdin_seen.lock().clone().freeze()
    }
}

#[async_trait]
impl Script for FakeScript {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn spawn(
        &self,
        _context: &Context,
        args: &[String],
        want_stdin: bool,
    ) -> Result<ScriptHandle, WashError> {
        self.calls.lock().push(args.to_vec());
        let canned = self
            .responses
            .lock()
            .get(&args[0])
            .cloned()
            .unwrap_or_default();

        let stdin = if want_stdin {
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            let seen = self.stdin_seen.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = server.read_to_end(&mut buffer).await;
                seen.lock().extend_from_slice(&buffer);
            });
            Some(Box::pin(client) as Pin<Box<dyn AsyncWrite + Send>>)
        } else {
            None
        };

        let stdout_chunk = futures::stream::iter(vec![Ok(Bytes::from(canned.stdout))]);
        let stdout = if canned.hang_after_stdout {
            stdout_chunk.chain(futures::stream::pending()).boxed()
        } else {
            stdout_chunk.boxed()
        };
        let stderr = futures::stream::iter(vec![Ok(Bytes::from(canned.stderr))]).boxed();
        let exit = futures::future::ready(Ok(canned.exit)).boxed();

        Ok(ScriptHandle {
            stdin,
            stdout,
            stderr,
            exit,
        })
    }
}

fn entry_for(fake: &Arc<FakeScript>, name: &str, actions: Vec<Action>, state: Option<&str>) -> Entry {
    let plugin = Arc::new(ExternalPlugin::new(fake.clone(), invocation_limit(4)));
    let mut descriptor = EntryDescriptor::new(name, actions);
    descriptor.state = state.map(str::to_owned);
    Entry::root(descriptor, CacheTtls::default(), plugin)
}

fn invoker_for(fake: &Arc<FakeScript>) -> ExternalPlugin {
    ExternalPlugin::new(fake.clone(), invocation_limit(4))
}

fn context() -> Context {
    Context::new(JournalId::new("test"))
}

#[tokio::test]
async fn argument_vector_positions() {
    let fake = FakeScript::new();
    fake.respond("read", Canned::default());
    fake.respond("signal", Canned::default());
    let plugin = invoker_for(&fake);

    let entry = entry_for(&fake, "aws", vec![Action::Read, Action::Signal], Some("tok"));
    plugin.read(&context(), &entry).await.unwrap();
    plugin.signal(&context(), &entry, "TERM").await.unwrap();

    let calls = fake.calls();
    assert_eq!(vec!["read", "/aws", "tok"], calls[0]);
    assert_eq!(vec!["signal", "/aws", "tok", "TERM"], calls[1]);
}

#[tokio::test]
async fn missing_state_is_an_empty_argument() {
    let fake = FakeScript::new();
    fake.respond("read", Canned::default());
    let plugin = invoker_for(&fake);

    let entry = entry_for(&fake, "aws", vec![Action::Read], None);
    plugin.read(&context(), &entry).await.unwrap();
    assert_eq!(vec!["read", "/aws", ""], fake.calls()[0]);
}

#[tokio::test]
async fn list_decodes_descriptors() {
    let fake = FakeScript::new();
    fake.respond(
        "list",
        Canned {
            stdout: br#"[{"name":"vm1","supported_actions":["list"]},
                         {"name":"vm2","supported_actions":["read"],"state":"s2"}]"#
                .to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "aws", vec![Action::List], None);

    let listing = plugin.list(&context(), &entry).await.unwrap();
    assert_eq!(2, listing.len());
    assert_eq!("vm1", listing[0].name);
    assert_eq!(Some("s2"), listing[1].state.as_deref());
}

#[tokio::test]
async fn undecodable_listing_mentions_stdout() {
    let fake = FakeScript::new();
    fake.respond(
        "list",
        Canned {
            stdout: b"ERROR: region unreachable".to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "aws", vec![Action::List], None);

    let err = plugin.list(&context(), &entry).await.expect_err("Expected failure");
    assert!(matches!(err, WashError::Decode(_)));
    assert!(err.to_string().contains("stdout"), "was: {err}");
}

#[tokio::test]
async fn nonzero_exit_surfaces_stderr() {
    let fake = FakeScript::new();
    fake.respond(
        "read",
        Canned {
            stderr: b"credentials expired\n".to_vec(),
            exit: 1,
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "aws", vec![Action::Read], None);

    assert_eq!(
        Err(WashError::Plugin("credentials expired".to_owned())),
        plugin.read(&context(), &entry).await
    );
}

#[tokio::test]
async fn write_sends_payload_on_stdin() {
    let fake = FakeScript::new();
    fake.respond("write", Canned::default());
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "aws", vec![Action::Write], None);

    plugin
        .write(&context(), &entry, Bytes::from_static(b"new contents"))
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"new contents"), fake.stdin_seen());
    assert_eq!(vec!["write", "/aws", ""], fake.calls()[0]);
}

#[tokio::test]
async fn exec_decodes_multiplexed_chunks() {
    let fake = FakeScript::new();
    // "aGk=" is "hi"; "b29wcw==" is "oops".
    fake.respond(
        "exec",
        Canned {
            stdout: b"{\"stream\":\"stdout\",\"data\":\"aGk=\"}\n{\"stream\":\"stderr\",\"data\":\"b29wcw==\"}\n{\"exit_code\":3}\n"
                .to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "host", vec![Action::Exec], None);

    let outcome = plugin
        .exec(
            &context(),
            &entry,
            ExecRequest::new("uname", vec!["-a".to_owned()]),
        )
        .await
        .unwrap();
    assert_eq!(Bytes::from_static(b"hi"), outcome.stdout);
    assert_eq!(Bytes::from_static(b"oops"), outcome.stderr);
    assert_eq!(3, outcome.exit_code);

    // The command and its argv (as a JSON array) follow the standard positions.
    assert_eq!(
        vec!["exec", "/host", "", "uname", "[\"-a\"]"],
        fake.calls()[0]
    );
}

#[tokio::test]
async fn exec_subprocess_failure_is_a_plugin_error() {
    let fake = FakeScript::new();
    fake.respond(
        "exec",
        Canned {
            stderr: b"boom".to_vec(),
            exit: 2,
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "host", vec![Action::Exec], None);

    assert_eq!(
        Err(WashError::Plugin("boom".to_owned())),
        plugin
            .exec(&context(), &entry, ExecRequest::new("true", vec![]))
            .await
    );
}

#[tokio::test]
async fn exec_rejects_unrecognized_lines() {
    let fake = FakeScript::new();
    fake.respond(
        "exec",
        Canned {
            stdout: b"complete garbage\n".to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "host", vec![Action::Exec], None);

    let err = plugin
        .exec(&context(), &entry, ExecRequest::new("true", vec![]))
        .await
        .expect_err("Expected failure");
    assert!(matches!(err, WashError::Decode(_)));
    assert!(err.to_string().contains("stdout"), "was: {err}");
}

#[tokio::test]
async fn exec_requires_an_exit_event() {
    let fake = FakeScript::new();
    fake.respond(
        "exec",
        Canned {
            stdout: b"{\"stream\":\"stdout\",\"data\":\"aGk=\"}\n".to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "host", vec![Action::Exec], None);

    let err = plugin
        .exec(&context(), &entry, ExecRequest::new("true", vec![]))
        .await
        .expect_err("Expected failure");
    assert!(err.to_string().contains("exit_code"), "was: {err}");
}

#[tokio::test]
async fn stream_hands_over_after_the_sentinel() {
    let fake = FakeScript::new();
    fake.respond(
        "stream",
        Canned {
            stdout: b"200\nfirst bytes".to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "logs", vec![Action::Stream], None);

    let mut handle = plugin.stream(&context(), &entry).await.unwrap();
    assert_eq!(
        Bytes::from_static(b"first bytes"),
        handle.next_chunk().await.unwrap().unwrap()
    );
    assert_eq!(None, handle.next_chunk().await.transpose().unwrap());
}

#[tokio::test]
async fn stream_with_wrong_header_is_a_decode_error() {
    let fake = FakeScript::new();
    fake.respond(
        "stream",
        Canned {
            stdout: b"500\n".to_vec(),
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "logs", vec![Action::Stream], None);

    let err = plugin
        .stream(&context(), &entry)
        .await
        .err()
        .expect("Expected failure");
    assert!(matches!(err, WashError::Decode(_)));
}

#[tokio::test]
async fn stream_setup_failure_surfaces_stderr() {
    let fake = FakeScript::new();
    fake.respond(
        "stream",
        Canned {
            stderr: b"no credentials".to_vec(),
            exit: 3,
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "logs", vec![Action::Stream], None);

    assert_eq!(
        Err(WashError::Plugin("no credentials".to_owned())),
        plugin.stream(&context(), &entry).await.map(|_| ())
    );
}

#[tokio::test]
async fn stream_cancellation_closes_the_handle() {
    let fake = FakeScript::new();
    fake.respond(
        "stream",
        Canned {
            stdout: b"200\nhello".to_vec(),
            hang_after_stdout: true,
            ..Canned::default()
        },
    );
    let plugin = invoker_for(&fake);
    let entry = entry_for(&fake, "logs", vec![Action::Stream], None);

    let mut handle = plugin.stream(&context(), &entry).await.unwrap();
    assert_eq!(
        Bytes::from_static(b"hello"),
        handle.next_chunk().await.unwrap().unwrap()
    );

    // Live -> Closed: after cancellation the producer stops within the test timeout, even
    // though the underlying "subprocess" never finishes on its own.
    handle.cancel();
    let next = tokio::time::timeout(Duration::from_secs(5), handle.next_chunk())
        .await
        .expect("Producer should stop after cancellation");
    assert!(next.is_none());
}
