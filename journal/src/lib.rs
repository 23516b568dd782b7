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

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

///
/// The identity of the external actor a capability invocation is performed on behalf of.
///
/// One user command should yield one journal: ids are derived from stable identifiers of the
/// originating actor, so that every syscall issued by a single `ls` lands in a single file.
///
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JournalId(String);

impl JournalId {
    ///
    /// Construct an id from an arbitrary string (e.g. an HTTP header), retaining only
    /// filename-safe characters so that the id can name a file on disk.
    ///
    pub fn new<S: AsRef<str>>(raw: S) -> JournalId {
        let sanitized: String = raw
            .as_ref()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if sanitized.is_empty() {
            JournalId("unknown".to_owned())
        } else {
            JournalId(sanitized)
        }
    }

    ///
    /// Derive an id for a kernel-originated request: `<pid>-<executable>`, falling back to the
    /// pid alone when the executable cannot be determined.
    ///
    pub fn for_process(pid: u32) -> JournalId {
        let exe = std::fs::read_link(format!("/proc/{pid}/exe"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        match exe {
            Some(exe) => JournalId::new(format!("{pid}-{exe}")),
            None => JournalId::new(format!("{pid}")),
        }
    }

    ///
    /// Synthesize a fresh id for an actor which provided no identifier of its own.
    ///
    pub fn synthesized() -> JournalId {
        JournalId::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JournalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// The result of a capability invocation, as recorded in the journal.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error { category: String, message: String },
}

///
/// One journal line: a capability invocation performed for a journal id.
///
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Wall clock time of the invocation, as a duration since the unix epoch.
    pub time: concrete_time::Duration,
    pub journal_id: String,
    pub path: String,
    pub action: String,
    pub duration: concrete_time::Duration,
    pub outcome: Outcome,
}

impl Record {
    pub fn new(
        journal_id: &JournalId,
        path: &str,
        action: &str,
        duration: Duration,
        outcome: Outcome,
    ) -> Record {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Record {
            time: time.into(),
            journal_id: journal_id.as_str().to_owned(),
            path: path.to_owned(),
            action: action.to_owned(),
            duration: duration.into(),
            outcome,
        }
    }
}

struct JournalWriter {
    writer: BufWriter<File>,
    written: u64,
    opened: Instant,
    last_used: Instant,
}

struct Inner {
    dir: PathBuf,
    writers: Mutex<HashMap<JournalId, JournalWriter>>,
    max_bytes: u64,
    max_age: Duration,
    idle_close: Duration,
}

///
/// The activity journal: newline-delimited JSON records, one file per journal id, under a
/// per-process-group directory on disk.
///
/// Writes are buffered and flushed best-effort; a crash loses the tail but not earlier records.
/// Files rotate to `<id>.log.1` at size or age limits. Writers are opened on first use and
/// closed once idle.
///
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Inner>,
}

const DEFAULT_MAX_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_IDLE_CLOSE: Duration = Duration::from_secs(30);

impl Journal {
    pub fn new(dir: PathBuf) -> Result<Journal, String> {
        Journal::with_limits(dir, DEFAULT_MAX_BYTES, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(dir: PathBuf, max_bytes: u64, max_age: Duration) -> Result<Journal, String> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create journal directory {}: {e}", dir.display()))?;
        Ok(Journal {
            inner: Arc::new(Inner {
                dir,
                writers: Mutex::new(HashMap::new()),
                max_bytes,
                max_age,
                idle_close: DEFAULT_IDLE_CLOSE,
            }),
        })
    }

    ///
    /// The conventional journal location: `<user-cache>/wash/activity`.
    ///
    pub fn default_dir() -> PathBuf {
        dirs_next::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("wash")
            .join("activity")
    }

    pub fn dir(&self) -> &PathBuf {
        &self.inner.dir
    }

    pub fn path_for(&self, id: &JournalId) -> PathBuf {
        self.inner.dir.join(format!("{id}.log"))
    }

    ///
    /// Append one record to the file for its journal id. Best-effort: failures are logged and
    /// swallowed, because journaling must never fail the request it is describing.
    ///
    pub fn record(&self, record: Record) {
        if let Err(e) = self.record_inner(&record) {
            log::warn!(
                "Failed to journal {} for {}: {}",
                record.action,
                record.journal_id,
                e
            );
        }
    }

    fn record_inner(&self, record: &Record) -> Result<(), String> {
        let id = JournalId::new(&record.journal_id);
        let line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        let mut writers = self.inner.writers.lock();
        self.close_idle(&mut writers);

        let rotate = writers.get(&id).map(|w| {
            w.written + line.len() as u64 + 1 > self.inner.max_bytes
                || w.opened.elapsed() > self.inner.max_age
        });
        if rotate == Some(true) {
            writers.remove(&id);
            self.rotate(&id).map_err(|e| e.to_string())?;
        }

        let writer = match writers.entry(id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path_for(e.key()))
                    .map_err(|err| err.to_string())?;
                let written = file.metadata().map(|m| m.len()).unwrap_or(0);
                e.insert(JournalWriter {
                    writer: BufWriter::new(file),
                    written,
                    opened: Instant::now(),
                    last_used: Instant::now(),
                })
            }
        };

        writer.last_used = Instant::now();
        writer.written += line.len() as u64 + 1;
        writeln!(writer.writer, "{line}").map_err(|e| e.to_string())
    }

    fn rotate(&self, id: &JournalId) -> std::io::Result<()> {
        let current = self.path_for(id);
        let aged = self.inner.dir.join(format!("{id}.log.1"));
        if current.exists() {
            std::fs::rename(&current, aged)?;
        }
        Ok(())
    }

    fn close_idle(&self, writers: &mut HashMap<JournalId, JournalWriter>) {
        // Dropping a JournalWriter flushes its BufWriter.
        writers.retain(|_, w| w.last_used.elapsed() < self.inner.idle_close);
    }

    ///
    /// Flush all open writers.
    ///
    pub fn flush(&self) {
        let mut writers = self.inner.writers.lock();
        for writer in writers.values_mut() {
            if let Err(e) = writer.writer.flush() {
                log::warn!("Failed to flush journal: {e}");
            }
        }
    }

    ///
    /// Enumerate the ids which have journal files on disk, most recently modified first.
    ///
    pub fn list(&self) -> Result<Vec<JournalId>, String> {
        self.flush();
        let mut entries = Vec::new();
        let dir = std::fs::read_dir(&self.inner.dir)
            .map_err(|e| format!("Failed to list journals: {e}"))?;
        for entry in dir {
            let entry = entry.map_err(|e| e.to_string())?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".log") {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(UNIX_EPOCH);
                entries.push((modified, JournalId::new(id)));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    ///
    /// Read all records for the given id, skipping lines that fail to parse (a crashed writer
    /// may leave a truncated tail).
    ///
    pub fn read(&self, id: &JournalId) -> Result<Vec<Record>, String> {
        self.flush();
        let path = self.path_for(id);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("No journal for {id}: {e}"))?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Record>(line).ok())
            .collect())
    }

    ///
    /// The raw journal file contents for the given id, for streaming to a user.
    ///
    pub fn read_raw(&self, id: &JournalId) -> Result<String, String> {
        self.flush();
        std::fs::read_to_string(self.path_for(id)).map_err(|e| format!("No journal for {id}: {e}"))
    }
}
