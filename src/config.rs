// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::path::{Path, PathBuf};

use entries::{Action, CacheTtls};
use serde::Deserialize;

///
/// Host configuration, loaded from a YAML file. Everything has a default except the plugin
/// table, so a minimal config is just a list of plugins.
///
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the FUSE filesystem is attached.
    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,

    /// Listen address of the HTTP control surface.
    #[serde(default = "default_http_address")]
    pub http_address: String,

    /// Override the journal directory (default: `<user-cache>/wash/activity`).
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,

    /// Bound on concurrent external-plugin subprocesses.
    #[serde(default = "default_invocation_bound")]
    pub invocation_bound: usize,

    /// Grace period between SIGTERM and SIGKILL when cancelling a plugin subprocess.
    #[serde(default = "default_graceful_shutdown_seconds")]
    pub graceful_shutdown_seconds: u64,

    /// Default TTL (seconds) applied to every cacheable action of roots that do not configure
    /// their own. Absent means uncached until plugins say otherwise.
    #[serde(default)]
    pub default_ttl_seconds: Option<u64>,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    /// The name of the synthetic top-level directory serving this plugin.
    pub name: String,

    /// The plugin executable.
    pub script: PathBuf,

    /// Actions the plugin root itself supports.
    #[serde(default = "default_root_actions")]
    pub supported_actions: Vec<Action>,

    /// Initial opaque state token passed on invocations of the root.
    #[serde(default)]
    pub state: Option<String>,

    /// TTL overrides for the root (children inherit per-slot).
    #[serde(default)]
    pub cache_ttls: Option<CacheTtls>,
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/tmp/wash")
}

fn default_http_address() -> String {
    "127.0.0.1:4950".to_owned()
}

fn default_invocation_bound() -> usize {
    16
}

fn default_graceful_shutdown_seconds() -> u64 {
    2
}

fn default_root_actions() -> Vec<Action> {
    vec![Action::List]
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mount_path: default_mount_path(),
            http_address: default_http_address(),
            journal_dir: None,
            invocation_bound: default_invocation_bound(),
            graceful_shutdown_seconds: default_graceful_shutdown_seconds(),
            default_ttl_seconds: None,
            plugins: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| format!("Failed to parse config {}: {e}", path.display()))
    }

    pub fn default_ttls(&self) -> CacheTtls {
        match self.default_ttl_seconds {
            Some(secs) => CacheTtls::uniform(secs),
            None => CacheTtls::default(),
        }
    }
}
