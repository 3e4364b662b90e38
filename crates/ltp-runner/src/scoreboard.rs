use crate::harness::Report;
use crate::job::JobId;
use crate::lock::FileLock;
use crate::{atomic_write_json_pretty, ensure_dir, load_json_file};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Exception,
    /// Anything else found in a hand-edited or foreign document.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreboardEntry {
    pub status: EntryStatus,
    #[serde(default)]
    pub result: Value,
}

impl ScoreboardEntry {
    pub fn success(report: Report) -> Self {
        Self {
            status: EntryStatus::Success,
            result: report.into_value(),
        }
    }

    pub fn exception(diagnostic: impl Into<String>) -> Self {
        Self {
            status: EntryStatus::Exception,
            result: Value::String(diagnostic.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoreboardSummary {
    pub jobs: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Durable `{bug_id: {tag: entry}}` ledger of a batch.
///
/// Every update rereads the document under an exclusive lock and merges a
/// single key before writing it back atomically, so concurrent recorders
/// (threads or processes) never drop each other's entries.
#[derive(Debug)]
pub struct Scoreboard {
    path: PathBuf,
    lock_path: PathBuf,
    doc: Map<String, Value>,
}

impl Scoreboard {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let lock_path = lock_path_for(path);
        let doc = {
            let _lock = FileLock::acquire(&lock_path)
                .with_context(|| format!("failed to lock {}", lock_path.display()))?;
            if !path.exists() {
                atomic_write_json_pretty(path, &Value::Object(Map::new()))?;
            }
            read_document(path)?
        };
        Ok(Self {
            path: path.to_path_buf(),
            lock_path,
            doc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &JobId) -> Option<ScoreboardEntry> {
        self.doc
            .get(&id.bug_id)
            .and_then(|tags| tags.get(&id.tag))
            .map(parse_entry)
    }

    pub fn succeeded(&self, id: &JobId) -> bool {
        matches!(
            self.get(id),
            Some(ScoreboardEntry {
                status: EntryStatus::Success,
                ..
            })
        )
    }

    /// Upserts one entry and persists the whole document.
    pub fn record(&mut self, id: &JobId, entry: ScoreboardEntry) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)
            .with_context(|| format!("failed to lock {}", self.lock_path.display()))?;
        let mut doc = if self.path.exists() {
            read_document(&self.path)?
        } else {
            Map::new()
        };
        let tags = doc
            .entry(id.bug_id.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !tags.is_object() {
            *tags = Value::Object(Map::new());
        }
        if let Value::Object(tags) = tags {
            tags.insert(id.tag.clone(), serde_json::to_value(&entry)?);
        }
        let doc = Value::Object(doc);
        atomic_write_json_pretty(&self.path, &doc)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        if let Value::Object(doc) = doc {
            self.doc = doc;
        }
        Ok(())
    }

    /// All entries in key order.
    pub fn entries(&self) -> Vec<(JobId, ScoreboardEntry)> {
        let mut out = Vec::new();
        for (bug_id, tags) in &self.doc {
            let Some(tags) = tags.as_object() else {
                continue;
            };
            for (tag, raw) in tags {
                out.push((JobId::new(bug_id.clone(), tag.clone()), parse_entry(raw)));
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.doc
            .values()
            .filter_map(Value::as_object)
            .map(|tags| tags.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> ScoreboardSummary {
        let mut summary = ScoreboardSummary::default();
        for (_, entry) in self.entries() {
            summary.jobs += 1;
            match entry.status {
                EntryStatus::Success => summary.succeeded += 1,
                EntryStatus::Exception => summary.failed += 1,
                EntryStatus::Unknown => {}
            }
        }
        summary
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "scoreboard.json".to_string());
    path.with_file_name(format!("{}.lock", name))
}

fn read_document(path: &Path) -> Result<Map<String, Value>> {
    let value = load_json_file(path)
        .with_context(|| format!("failed to read scoreboard {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("scoreboard {} is not a JSON object", path.display())),
    }
}

fn parse_entry(raw: &Value) -> ScoreboardEntry {
    serde_json::from_value(raw.clone()).unwrap_or_else(|_| ScoreboardEntry {
        status: EntryStatus::Unknown,
        result: raw.clone(),
    })
}
