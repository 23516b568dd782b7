// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use journal::{Journal, JournalId};

///
/// `whistory`: enumerate the journals of past activity, most recent first.
///
pub fn list(journal: &Journal) -> Result<Vec<String>, String> {
    Ok(journal
        .list()?
        .into_iter()
        .map(|id| id.as_str().to_owned())
        .collect())
}

///
/// `whistory <id>`: the raw journal for one actor, ready to stream to a terminal.
///
pub fn show(journal: &Journal, id: &str) -> Result<String, String> {
    journal.read_raw(&JournalId::new(id))
}
