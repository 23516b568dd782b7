// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use entries::Context;
use futures::FutureExt;
use journal::JournalId;
use log::{debug, error, warn};
use regex::Regex;
use serde_json::Value;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamExt;
use wash::config::Config;
use wash::find::{find, FindPredicates};
use wash::{build_core, history, http, tail, WashCore};
use washfs::WashFsEvent;

fn cli() -> Command {
    Command::new("wash")
        .about("Wide-area shell: remote infrastructure as a navigable filesystem")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to the YAML config file (default: ./wash.yaml when present)"),
        )
        .subcommand(
            Command::new("serve")
                .about("Mount the filesystem and serve the HTTP control surface")
                .arg(
                    Arg::new("mount-path")
                        .long("mount-path")
                        .value_name("PATH")
                        .help("Override the configured mount path"),
                ),
        )
        .subcommand(
            Command::new("find")
                .about("Depth-first search over entries with predicates")
                .arg(Arg::new("path").required(true))
                .arg(Arg::new("name").long("name").value_name("REGEX"))
                .arg(
                    Arg::new("min-size")
                        .long("min-size")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("maxdepth")
                        .long("maxdepth")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("meta")
                        .long("meta")
                        .value_name("KEY=VALUE")
                        .action(ArgAction::Append)
                        .help("Require a metadata key to equal a value (JSON or bare string)"),
                ),
        )
        .subcommand(
            Command::new("exec")
                .about("Run a command against an entry")
                .arg(Arg::new("path").required(true))
                .arg(Arg::new("command").required(true))
                .arg(Arg::new("args").num_args(0..).trailing_var_arg(true)),
        )
        .subcommand(
            Command::new("tail")
                .about("Follow the byte streams of one or more entries")
                .arg(Arg::new("paths").required(true).num_args(1..)),
        )
        .subcommand(
            Command::new("history")
                .about("List journals of past activity, or stream one journal")
                .arg(Arg::new("id")),
        )
        .subcommand(
            Command::new("clear")
                .about("Invalidate cached results for a path and everything beneath it")
                .arg(Arg::new("path").required(true)),
        )
}

fn load_config(matches: &ArgMatches) -> Result<Config, String> {
    match matches.get_one::<String>("config") {
        Some(path) => Config::load(Path::new(path)),
        None => {
            let default = PathBuf::from("wash.yaml");
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn cli_context() -> Context {
    Context::new(JournalId::for_process(std::process::id()))
}

///
/// Serve: attach the FUSE mount and the HTTP surface against one core, and run until a signal
/// arrives or the filesystem is externally unmounted. Exits 255 when the mount cannot attach.
///
async fn serve(core: Arc<WashCore>, config: &Config, mount_override: Option<&String>) -> i32 {
    let mount_path = mount_override
        .map(PathBuf::from)
        .unwrap_or_else(|| config.mount_path.clone());
    if let Err(e) = std::fs::create_dir_all(&mount_path) {
        error!("Failed to create mount path {}: {}", mount_path.display(), e);
        return 1;
    }

    let executor = task_executor::Executor::new();
    let (_session, receiver) =
        match washfs::mount(&mount_path, core.registry.clone(), executor.clone()) {
            Ok(mounted) => mounted,
            Err(e) => {
                error!(
                    "Failed to attach the filesystem at {}: {}",
                    mount_path.display(),
                    e
                );
                return 255;
            }
        };
    match receiver.recv() {
        Ok(WashFsEvent::Init) => debug!("Mounted at {}", mount_path.display()),
        Ok(WashFsEvent::Destroy) | Err(_) => {
            warn!("Externally unmounted before we could mount.");
            return 255;
        }
    }

    let listener = match tokio::net::TcpListener::bind(&config.http_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.http_address, e);
            return 1;
        }
    };
    debug!("Control surface listening on {}", config.http_address);

    let server = {
        let app = http::router(core.clone());
        async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP surface failed: {e}");
            }
            Some(Sig::Server)
        }
        .into_stream()
    };

    let sigint = install_handler(SignalKind::interrupt, Sig::Int);
    let sigterm = install_handler(SignalKind::terminate, Sig::Term);
    let unmount = task::spawn_blocking(move || {
        match receiver.recv().unwrap_or(WashFsEvent::Destroy) {
            WashFsEvent::Destroy => Some(Sig::Unmount),
            event => {
                warn!("Received unexpected event {:?}", event);
                None
            }
        }
    })
    .map(|res| res.unwrap_or(None))
    .into_stream();

    let mut shutdown = sigint
        .merge(sigterm)
        .merge(unmount)
        .merge(server)
        .filter_map(|x| x);
    debug!("Awaiting shutdown signal ...");
    if let Some(sig) = shutdown.next().await {
        match sig {
            Sig::Unmount => debug!("Externally unmounted"),
            sig => debug!("Received {:?}", sig),
        }
    }
    core.journal.flush();
    0
}

#[derive(Clone, Copy, Debug)]
enum Sig {
    Int,
    Term,
    Unmount,
    Server,
}

fn install_handler<F>(install_fn: F, sig: Sig) -> impl StreamExt<Item = Option<Sig>>
where
    F: Fn() -> SignalKind,
{
    SignalStream::new(
        signal(install_fn()).unwrap_or_else(|_| panic!("Failed to install {sig:?} handler")),
    )
    .map(move |_| Some(sig))
}

fn parse_meta_predicates(matches: &ArgMatches) -> Result<Vec<(String, Value)>, String> {
    let mut predicates = Vec::new();
    if let Some(values) = matches.get_many::<String>("meta") {
        for raw in values {
            let (key, value) = raw
                .split_once('=')
                .ok_or_else(|| format!("--meta {raw:?} is not of the form KEY=VALUE"))?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| Value::String(value.to_owned()));
            predicates.push((key.to_owned(), value));
        }
    }
    Ok(predicates)
}

async fn run(matches: ArgMatches) -> Result<i32, String> {
    let config = load_config(&matches)?;
    let executor = task_executor::Executor::new();
    let core = Arc::new(build_core(executor, &config)?);

    match matches.subcommand() {
        Some(("serve", sub)) => Ok(serve(core, &config, sub.get_one::<String>("mount-path")).await),
        Some(("find", sub)) => {
            let start = sub.get_one::<String>("path").unwrap();
            let name = sub
                .get_one::<String>("name")
                .map(|raw| Regex::new(raw).map_err(|e| format!("Invalid --name regex: {e}")))
                .transpose()?;
            let predicates = FindPredicates {
                name,
                min_size: sub.get_one::<u64>("min-size").copied(),
                max_depth: sub.get_one::<usize>("maxdepth").copied(),
                metadata: parse_meta_predicates(sub)?,
            };
            let matched = find(&core.registry, &cli_context(), start, &predicates)
                .await
                .map_err(|e| e.to_string())?;
            for path in matched {
                println!("{path}");
            }
            Ok(0)
        }
        Some(("exec", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            let command = sub.get_one::<String>("command").unwrap();
            let args: Vec<String> = sub
                .get_many::<String>("args")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();

            let context = cli_context();
            let entry = core
                .registry
                .resolve(&context, path)
                .await
                .map_err(|e| e.to_string())?;
            let outcome = core
                .registry
                .exec(&context, &entry, entries::ExecRequest::new(command, args))
                .await
                .map_err(|e| e.to_string())?;
            use std::io::Write;
            std::io::stdout().write_all(&outcome.stdout).ok();
            std::io::stderr().write_all(&outcome.stderr).ok();
            Ok(outcome.exit_code)
        }
        Some(("tail", sub)) => {
            let paths: Vec<String> = sub
                .get_many::<String>("paths")
                .unwrap()
                .cloned()
                .collect();
            let context = cli_context();
            let mut stdout = tokio::io::stdout();
            tail::tail_follow(&core.registry, &context, &paths, &mut stdout)
                .await
                .map_err(|e| e.to_string())?;
            Ok(0)
        }
        Some(("history", sub)) => {
            match sub.get_one::<String>("id") {
                Some(id) => print!("{}", history::show(&core.journal, id)?),
                None => {
                    for id in history::list(&core.journal)? {
                        println!("{id}");
                    }
                }
            }
            Ok(0)
        }
        Some(("clear", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            core.registry.clear(Path::new(path));
            println!("cleared {path}");
            Ok(0)
        }
        _ => unreachable!("subcommand is required"),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let matches = cli().get_matches();
    let code = match run(matches).await {
        Ok(code) => code,
        Err(message) => {
            error!("{message}");
            1
        }
    };
    std::process::exit(code);
}
