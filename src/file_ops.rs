//! Filesystem operations: inventory scanning and the copy primitive.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{SyncError, SyncResult};

pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;

const SIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

/// Snapshot of one regular file taken at scan time.
///
/// Size and modification time are read once and treated as ground truth
/// for the remainder of a sync pass; a later operation may fail with a
/// not-found or size-mismatch error if the filesystem changed underneath.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileEntry {
    /// Base file name, lossily converted.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Counters reported after a scan, for status display and logging.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InventorySummary {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Mapping from base file name to every destination entry carrying that
/// name; several same-named files may live in different sub-trees.
pub type DestinationIndex = HashMap<String, Vec<FileEntry>>;

pub fn metadata_to_datetime(metadata: &fs::Metadata) -> SyncResult<DateTime<Utc>> {
    let modified = metadata.modified()?;
    let duration = modified
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| SyncError::Internal(format!("Time error: {}", e)))?;

    Utc.timestamp_opt(duration.as_secs() as i64, duration.subsec_nanos())
        .single()
        .ok_or_else(|| SyncError::Internal("Invalid timestamp".into()))
}

pub(crate) fn check_root(path: &Path) -> SyncResult<()> {
    if !path.exists() {
        return Err(SyncError::SourceNotFound(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(SyncError::InvalidPath(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

fn entry_snapshot(path: &Path) -> SyncResult<FileEntry> {
    let metadata = fs::metadata(path)?;
    Ok(FileEntry {
        path: path.to_path_buf(),
        size: metadata.len(),
        modified: metadata_to_datetime(&metadata)?,
    })
}

/// Recursively enumerate the source tree into a flat, path-ordered list
/// of regular files. Per-file stat failures are logged and skipped; they
/// never abort the scan.
pub fn scan_source(root: &Path) -> SyncResult<Vec<FileEntry>> {
    check_root(root)?;

    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        match entry_snapshot(entry.path()) {
            Ok(info) => entries.push(info),
            Err(e) => warn!("Skipping unreadable source file {}: {}", entry.path().display(), e),
        }
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Recursively enumerate the destination tree into a base-name index.
pub fn scan_destination(root: &Path) -> SyncResult<DestinationIndex> {
    check_root(root)?;

    let mut index: DestinationIndex = HashMap::new();
    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        match entry_snapshot(entry.path()) {
            Ok(info) => index.entry(info.file_name()).or_default().push(info),
            Err(e) => warn!(
                "Skipping unreadable destination file {}: {}",
                entry.path().display(),
                e
            ),
        }
    }

    Ok(index)
}

pub fn summarize(entries: &[FileEntry]) -> InventorySummary {
    InventorySummary {
        file_count: entries.len(),
        total_bytes: entries.iter().map(|e| e.size).sum(),
    }
}

pub fn summarize_index(index: &DestinationIndex) -> InventorySummary {
    let mut summary = InventorySummary::default();
    for entries in index.values() {
        summary.file_count += entries.len();
        summary.total_bytes += entries.iter().map(|e| e.size).sum::<u64>();
    }
    summary
}

/// Attribute-preserving byte copy. Carries the source permissions and
/// modification time onto the destination and returns the bytes written.
/// A copy either completes or is abandoned; there is no resume.
pub fn copy_file_preserving(source: &Path, dest: &Path) -> SyncResult<u64> {
    let src_file = File::open(source)?;
    let src_metadata = src_file.metadata()?;

    let dest_file = File::create(dest)?;

    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, src_file);
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, &dest_file);

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes_copied: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        writer.write_all(&buffer[..bytes_read])?;
        bytes_copied += bytes_read as u64;
    }

    writer.flush()?;
    drop(writer);
    dest_file.sync_all()?;

    let _ = fs::set_permissions(dest, src_metadata.permissions());
    let _ = filetime::set_file_mtime(
        dest,
        filetime::FileTime::from_system_time(src_metadata.modified()?),
    );

    Ok(bytes_copied)
}

/// Render a byte count for log lines and status labels, e.g. `1.5 MB`.
pub fn human_size(nbytes: u64) -> String {
    if nbytes == 0 {
        return "0 B".to_string();
    }
    let rank = ((nbytes as f64).log10() / 3.0) as usize;
    let rank = rank.min(SIZE_UNITS.len() - 1);
    let human = nbytes as f64 / 1024f64.powi(rank as i32);
    let formatted = format!("{:.2}", human);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SIZE_UNITS[rank])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn scan_source_collects_regular_files_sorted() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "b/beta.jpg", b"12345");
        write_file(dir.path(), "a/alpha.mp4", b"123");
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let entries = scan_source(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_name(), "alpha.mp4");
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[1].file_name(), "beta.jpg");
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn scan_is_idempotent_on_unchanged_tree() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "x.jpg", b"xx");
        write_file(dir.path(), "sub/y.mp4", b"yyy");

        let first = scan_source(dir.path()).unwrap();
        let second = scan_source(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn scan_missing_root_is_a_precondition_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            scan_source(&missing),
            Err(SyncError::SourceNotFound(_))
        ));

        let file = write_file(dir.path(), "plain.txt", b"z");
        assert!(matches!(
            scan_destination(&file),
            Err(SyncError::InvalidPath(_))
        ));
    }

    #[test]
    fn destination_index_groups_same_names() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "2021/img.jpg", b"aaa");
        write_file(dir.path(), "2022/img.jpg", b"bbbb");

        let index = scan_destination(dir.path()).unwrap();
        assert_eq!(index.get("img.jpg").unwrap().len(), 2);
        assert_eq!(summarize_index(&index).total_bytes, 7);
    }

    #[test]
    fn copy_preserves_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let src = write_file(dir.path(), "src/video.mp4", b"0123456789");
        let dst = dir.path().join("dst/video.mp4");
        fs::create_dir_all(dst.parent().unwrap()).unwrap();

        let copied = copy_file_preserving(&src, &dst).unwrap();
        assert_eq!(copied, 10);

        let src_meta = fs::metadata(&src).unwrap();
        let dst_meta = fs::metadata(&dst).unwrap();
        assert_eq!(dst_meta.len(), src_meta.len());
        assert_eq!(
            metadata_to_datetime(&dst_meta).unwrap().timestamp(),
            metadata_to_datetime(&src_meta).unwrap().timestamp()
        );
    }

    #[test]
    fn human_size_rendering() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2 KB");
        assert_eq!(human_size(1536), "1.5 KB");
    }
}
