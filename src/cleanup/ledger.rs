//! Record of containers that were created and not yet removed.
//!
//! The orchestrator registers every container right after Create succeeds,
//! before the run moves on. Cleanup releases the entry once the container is
//! gone. When the ledger is persistent, the entries are mirrored to a JSON
//! file after every change, so a process that dies between Create and
//! cleanup leaves behind a list `lth sweep` can reclaim.
//!
//! # File Format
//!
//! ```json
//! [
//!   {
//!     "resource_id": "4f1c...",
//!     "name": "lth-nodejs_20-0",
//!     "image": "public.ecr.aws/lambda/nodejs:20",
//!     "batch_id": "6c2b...",
//!     "created_at": "2026-10-18T09:12:44.120Z"
//!   }
//! ]
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors while reading or writing the ledger file.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// One created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub resource_id: String,
    pub name: String,
    pub image: String,
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        resource_id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        batch_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            name: name.into(),
            image: image.into(),
            batch_id: batch_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Thread-safe set of outstanding containers, optionally backed by a file.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    path: Option<PathBuf>,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl ResourceLedger {
    /// A ledger that lives only in process memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a ledger mirrored to `path`.
    ///
    /// Entries already in the file (left by an earlier process) are loaded
    /// and kept. A missing file is an empty ledger.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let entries = Self::read_file(&path)?;
        if !entries.is_empty() {
            tracing::warn!(
                "Ledger {} lists {} container(s) from an earlier run; `lth sweep` removes them",
                path.display(),
                entries.len()
            );
        }
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Reads the entries stored in a ledger file without opening it for
    /// writing.
    pub fn read_file(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Records a created container.
    ///
    /// The entry is kept in memory even if writing the file fails.
    pub fn register(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.lock();
        entries.retain(|e| e.resource_id != entry.resource_id);
        entries.push(entry);
        self.persist(&entries)
    }

    /// Forgets a container after it was removed.
    ///
    /// Returns whether an entry was present.
    pub fn release(&self, resource_id: &str) -> Result<bool, LedgerError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.resource_id != resource_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.lock().iter().any(|e| e.resource_id == resource_id)
    }

    /// Snapshot of the outstanding entries.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the entries next to the ledger file and renames it into place.
    fn persist(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
