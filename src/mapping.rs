//! Destination path derivation and the bucket-override table.
//!
//! Every source file lands in a date-derived bucket (`YYYY/YYYY-MM-DD`
//! from its modification time, local clock). The override table lets the
//! user redirect whole buckets elsewhere; a bucket maps to exactly one
//! destination sub-path at any instant.

use chrono::{DateTime, Datelike, Local, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::file_ops::FileEntry;

/// Compute the bucket key for a modification timestamp.
pub fn bucket_key(modified: DateTime<Utc>) -> String {
    let local = modified.with_timezone(&Local);
    format!(
        "{}/{:04}-{:02}-{:02}",
        local.year(),
        local.year(),
        local.month(),
        local.day()
    )
}

/// Override table from bucket key to the actual destination sub-path.
///
/// Defaults to the identity mapping; resolving a bucket for the first
/// time inserts `key -> key`. The table is append/overwrite only while a
/// batch runs, never structurally pruned, so it can be read concurrently
/// behind a lock.
#[derive(Debug, Clone, Default)]
pub struct PathMapping {
    entries: BTreeMap<String, String>,
}

impl PathMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Self {
        Self {
            entries: overrides.clone(),
        }
    }

    pub fn overrides(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Destination sub-path for one source file: `mappedBucket/baseName`.
    /// Grows the table with an identity entry when the bucket is new.
    /// Always succeeds.
    pub fn resolve(&mut self, entry: &FileEntry) -> PathBuf {
        let key = bucket_key(entry.modified);
        let mapped = self
            .entries
            .entry(key.clone())
            .or_insert(key)
            .clone();
        PathBuf::from(mapped).join(entry.file_name())
    }

    /// Render the table for the external mapping editor, one sorted
    /// `bucketKey => destinationPath` line per entry.
    pub fn editor_text(&self) -> String {
        let mut lines = String::new();
        for (key, value) in &self.entries {
            lines.push_str(key);
            lines.push_str(" => ");
            lines.push_str(value);
            lines.push('\n');
        }
        lines
    }

    /// Apply the editor's returned text verbatim. Keys absent from the
    /// text keep their prior values; preserving them was the editor's
    /// call to make, not ours. Lines without a `=>` separator are
    /// ignored.
    pub fn apply_editor_text(&mut self, text: &str) {
        for line in text.lines() {
            if let Some(pos) = line.find("=>") {
                let key = line[..pos].trim();
                let value = line[pos + 2..].trim();
                if !key.is_empty() && !value.is_empty() {
                    self.entries.insert(key.to_string(), value.to_string());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
