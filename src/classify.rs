//! Sync classification: decides what each source file is and whether it
//! already exists at the destination.
//!
//! Pure logic over the already-built destination index; no I/O happens
//! here.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::SyncResult;
use crate::file_ops::{DestinationIndex, FileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Other,
}

/// Policy flags that influence classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPolicy {
    pub overwrite: bool,
}

/// Per-file outcome of comparing source and destination inventories.
/// Recomputed whenever the inventories, the mapping or the policy flags
/// change; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncDecision {
    pub selected_for_copy: bool,
    pub already_synced: bool,
    pub kind: MediaKind,
}

/// Case-insensitive suffix matcher built from a `|`-delimited extension
/// list such as `wmv|avi|mp4`.
#[derive(Debug, Clone)]
pub struct ExtensionSet {
    set: GlobSet,
}

impl ExtensionSet {
    pub fn parse(list: &str) -> SyncResult<Self> {
        let mut builder = GlobSetBuilder::new();
        for ext in list.split('|') {
            let ext = ext.trim();
            if ext.is_empty() {
                continue;
            }
            let glob = GlobBuilder::new(&format!("*.{}", ext))
                .case_insensitive(true)
                .build()?;
            builder.add(glob);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

pub fn media_kind(path: &Path, video: &ExtensionSet, photo: &ExtensionSet) -> MediaKind {
    if photo.matches(path) {
        MediaKind::Photo
    } else if video.matches(path) {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

/// Classify one source file against the destination index.
///
/// A file counts as synced iff some destination entry shares its base
/// name and exact size; the overwrite policy forces that to false so the
/// default selection re-transfers everything.
pub fn classify(
    entry: &FileEntry,
    dest_index: &DestinationIndex,
    policy: SyncPolicy,
    video: &ExtensionSet,
    photo: &ExtensionSet,
) -> SyncDecision {
    let mut already_synced = dest_index
        .get(&entry.file_name())
        .map(|candidates| candidates.iter().any(|c| c.size == entry.size))
        .unwrap_or(false);

    if policy.overwrite {
        already_synced = false;
    }

    SyncDecision {
        selected_for_copy: !already_synced,
        already_synced,
        kind: media_kind(&entry.path, video, photo),
    }
}

/// Narrow a selection to photos and videos, for the media-only setting.
pub fn filter_media_only(
    entries: Vec<FileEntry>,
    video: &ExtensionSet,
    photo: &ExtensionSet,
) -> Vec<FileEntry> {
    entries
        .into_iter()
        .filter(|e| media_kind(&e.path, video, photo) != MediaKind::Other)
        .collect()
}
