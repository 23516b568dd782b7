// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use entries::{Action, Attributes, Context, Entry, ExecRequest, WashError};
use journal::JournalId;
use serde::{Deserialize, Serialize};

use crate::WashCore;

///
/// The HTTP control surface: the same capability calls as the FUSE adapter, over GET/POST
/// endpoints keyed by path and action, plus cache invalidation and journal access. Thin over
/// the core: every request goes through the same cache and journal.
///
pub fn router(core: Arc<WashCore>) -> Router {
    Router::new()
        .route("/fs/*path", get(get_entry).post(post_entry))
        .route("/cache/clear", post(clear_cache))
        .route("/history", get(list_history))
        .route("/history/:id", get(show_history))
        .with_state(core)
}

const JOURNAL_HEADER: &str = "x-wash-journal-id";

///
/// Requests are tagged with the id the client supplies, so that a multi-request client command
/// lands in one journal; clients that don't supply one get a synthesized id.
///
fn context_for(headers: &HeaderMap, bypass: bool) -> Context {
    let id = headers
        .get(JOURNAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(JournalId::new)
        .unwrap_or_else(JournalId::synthesized);
    let context = Context::new(id);
    if bypass {
        context.with_cache_bypass()
    } else {
        context
    }
}

fn error_response(error: &WashError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string()).into_response()
}

#[derive(Deserialize)]
struct GetParams {
    action: GetAction,
    #[serde(default)]
    bypass: bool,
}

#[derive(Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum GetAction {
    List,
    Read,
    Metadata,
}

///
/// The wire form of an entry in `list` responses.
///
#[derive(Serialize)]
struct EntryView {
    name: String,
    path: String,
    supported_actions: Vec<Action>,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    attributes: Attributes,
}

impl EntryView {
    fn of(entry: &Entry) -> EntryView {
        EntryView {
            name: entry.name().to_owned(),
            path: entry.path_str().to_owned(),
            supported_actions: entry.supported_actions().collect(),
            attributes: *entry.attributes(),
        }
    }
}

async fn get_entry(
    State(core): State<Arc<WashCore>>,
    Path(path): Path<String>,
    Query(params): Query<GetParams>,
    headers: HeaderMap,
) -> Response {
    let context = context_for(&headers, params.bypass);
    let path = format!("/{path}");
    let entry = match core.registry.resolve(&context, &path).await {
        Ok(entry) => entry,
        Err(e) => return error_response(&e),
    };
    match params.action {
        GetAction::List => match core.registry.children(&context, &entry).await {
            Ok(children) => {
                Json(children.iter().map(EntryView::of).collect::<Vec<_>>()).into_response()
            }
            Err(e) => error_response(&e),
        },
        GetAction::Read => match core.registry.read(&context, &entry).await {
            Ok(bytes) => bytes.into_response(),
            Err(e) => error_response(&e),
        },
        GetAction::Metadata => match core.registry.metadata(&context, &entry).await {
            Ok(map) => Json(map).into_response(),
            Err(e) => error_response(&e),
        },
    }
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum PostBody {
    Exec {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        stdin: Option<String>,
        #[serde(default)]
        tty: bool,
    },
    Write {
        data: String,
    },
    Delete {},
    Signal {
        signal: String,
    },
}

#[derive(Serialize)]
struct ExecView {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

async fn post_entry(
    State(core): State<Arc<WashCore>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PostBody>,
) -> Response {
    let context = context_for(&headers, false);
    let path = format!("/{path}");
    let entry = match core.registry.resolve(&context, &path).await {
        Ok(entry) => entry,
        Err(e) => return error_response(&e),
    };
    match body {
        PostBody::Exec {
            command,
            args,
            stdin,
            tty,
        } => {
            let mut request = ExecRequest::new(command, args);
            request.tty = tty;
            request.stdin = stdin.map(|s| Bytes::from(s.into_bytes()));
            match core.registry.exec(&context, &entry, request).await {
                Ok(outcome) => Json(ExecView {
                    stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
                    exit_code: outcome.exit_code,
                })
                .into_response(),
                Err(e) => error_response(&e),
            }
        }
        PostBody::Write { data } => {
            match core
                .registry
                .write(&context, &entry, Bytes::from(data.into_bytes()))
                .await
            {
                Ok(()) => StatusCode::OK.into_response(),
                Err(e) => error_response(&e),
            }
        }
        PostBody::Delete {} => match core.registry.delete(&context, &entry).await {
            Ok(()) => StatusCode::OK.into_response(),
            Err(e) => error_response(&e),
        },
        PostBody::Signal { signal } => {
            match core.registry.signal(&context, &entry, &signal).await {
                Ok(()) => StatusCode::OK.into_response(),
                Err(e) => error_response(&e),
            }
        }
    }
}

#[derive(Deserialize)]
struct ClearParams {
    path: String,
}

async fn clear_cache(
    State(core): State<Arc<WashCore>>,
    Query(params): Query<ClearParams>,
) -> Response {
    core.registry.clear(std::path::Path::new(&params.path));
    (StatusCode::OK, format!("cleared {}\n", params.path)).into_response()
}

async fn list_history(State(core): State<Arc<WashCore>>) -> Response {
    match core.journal.list() {
        Ok(ids) => Json(
            ids.iter()
                .map(|id| id.as_str().to_owned())
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

async fn show_history(
    State(core): State<Arc<WashCore>>,
    Path(id): Path<String>,
) -> Response {
    match core.journal.read_raw(&JournalId::new(&id)) {
        Ok(raw) => raw.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e).into_response(),
    }
}
