//! A record of every exchange on the control channel.
//!
//! Entries are kept in memory for the lifetime of the session and, if a
//! journal directory is configured, written out as JSON when the session
//! closes.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: Option<u64>,
    pub message: String,
    /// The last reply received, or `None` if the drone never answered.
    pub reply: Option<String>,
    pub outcome: String,
    pub attempts: u32,
    pub sent_at: DateTime<Local>,
    pub resolved_at: DateTime<Local>,
}

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Writes the journal to `<dir>/<timestamp>-cmd.json` and returns the
    /// path.
    pub async fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        if !dir.exists() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("failed to create journal directory")?;
        }

        let path = dir.join(format!("{}-cmd.json", Local::now().format("%FT%H-%M-%S")));
        let data = serde_json::to_vec_pretty(&self.entries())?;

        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write journal to {}", path.display()))?;

        Ok(path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Vec<JournalEntry>> {
        let data = std::fs::read(path).context("failed to read journal")?;
        serde_json::from_slice(&data).context("invalid journal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saved_journal_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new();
        let now = Local::now();

        journal.record(JournalEntry {
            seq: Some(0),
            message: "takeoff".into(),
            reply: Some("ok".into()),
            outcome: "ok".into(),
            attempts: 1,
            sent_at: now,
            resolved_at: now,
        });
        journal.record(JournalEntry {
            seq: Some(1),
            message: "land".into(),
            reply: None,
            outcome: "no acknowledgment after 3 attempts".into(),
            attempts: 3,
            sent_at: now,
            resolved_at: now,
        });

        let path = journal.save(&dir.path().join("logs")).await.unwrap();
        let loaded = Journal::load(&path).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].message, "takeoff");
        assert_eq!(loaded[1].reply, None);
        assert_eq!(loaded[1].attempts, 3);
    }
}
