//! On-disk snapshot of the clearance cache.
//!
//! The file is a plain JSON object mapping cache keys to entries. It is
//! rewritten wholesale through [`write_atomic`] and only ever contains entries
//! that were still valid when it was written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::ClearanceEntry;
use crate::utils::fs::{io_error, write_atomic};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ClearanceStore {
    path: PathBuf,
}

impl ClearanceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load entries valid at `now`.
    ///
    /// A missing file is an empty cache. Records that fail to decode or are
    /// already expired are dropped individually.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, ClearanceEntry>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No clearance snapshot on disk");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(io_error("reading", &self.path, e)),
        };

        let records: serde_json::Map<String, Value> = serde_json::from_str(&raw)?;
        let mut entries = BTreeMap::new();
        let mut dropped = 0usize;

        for (key, value) in records {
            match serde_json::from_value::<ClearanceEntry>(value) {
                Ok(entry) if entry.is_valid_at(now) => {
                    entries.insert(key, entry);
                }
                Ok(_) => dropped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable clearance record");
                    dropped += 1;
                }
            }
        }

        info!(
            loaded = entries.len(),
            dropped,
            path = %self.path.display(),
            "Loaded clearance snapshot"
        );
        Ok(entries)
    }

    /// Write the entries valid at `now`, replacing the previous snapshot.
    pub async fn save<'a, I>(&self, entries: I, now: DateTime<Utc>) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a ClearanceEntry)>,
    {
        let snapshot: BTreeMap<&str, &ClearanceEntry> = entries
            .into_iter()
            .filter(|(_, entry)| entry.is_valid_at(now))
            .collect();

        let json = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.path, &json).await?;

        debug!(count = snapshot.len(), "Saved clearance snapshot");
        Ok(snapshot.len())
    }
}
