//! Engine state and the copy orchestrator.
//!
//! One `SyncEngine` instance owns the inventories, the bucket mapping,
//! the per-batch cancellation controls and the live encoder process
//! handle; all mutation goes through its methods. A batch runs strictly
//! serially on a blocking worker while the caller observes progress
//! through an mpsc channel and may signal cancellation at any time.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{self, ExtensionSet, SyncDecision, SyncPolicy};
use crate::encoder::{self, CodecProfile};
use crate::errors::{SyncError, SyncResult};
use crate::file_ops::{self, DestinationIndex, FileEntry, InventorySummary};
use crate::mapping::PathMapping;
use crate::settings::Settings;

/// Cancellation flag shared between a batch worker and the caller.
/// Polled between files only; an in-flight copy or encode is never
/// preempted.
pub struct BatchControl {
    cancelled: AtomicBool,
}

impl BatchControl {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative progress emitted after each file in a copy batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub batch_id: String,
    pub current_file: String,
    pub current_file_size: u64,
    pub bytes_copied: u64,
    pub bytes_total: u64,
    pub files_completed: usize,
    pub files_total: usize,
}

/// Aggregate outcome of one copy or transcode batch. Per-file detail
/// goes to the log, not to the caller.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_copied: u64,
    pub was_cancelled: bool,
    pub duration_ms: u64,
}

impl BatchResult {
    pub fn any_failures(&self) -> bool {
        self.failed > 0
    }
}

pub struct SyncEngine {
    pub(crate) settings: RwLock<Settings>,
    settings_path: Option<PathBuf>,
    source_inventory: RwLock<Vec<FileEntry>>,
    dest_index: RwLock<DestinationIndex>,
    pub(crate) mapping: Arc<RwLock<PathMapping>>,
    controls: RwLock<HashMap<String, Arc<BatchControl>>>,
    pub(crate) active_process: Arc<Mutex<Option<Child>>>,
    encoder_features: RwLock<Option<Vec<String>>>,
}

impl SyncEngine {
    pub fn new(settings: Settings) -> Self {
        let mapping = PathMapping::from_overrides(&settings.path_overrides);
        Self {
            settings: RwLock::new(settings),
            settings_path: None,
            source_inventory: RwLock::new(Vec::new()),
            dest_index: RwLock::new(DestinationIndex::new()),
            mapping: Arc::new(RwLock::new(mapping)),
            controls: RwLock::new(HashMap::new()),
            active_process: Arc::new(Mutex::new(None)),
            encoder_features: RwLock::new(None),
        }
    }

    /// Engine that persists settings (and mapping edits) to the given
    /// file.
    pub fn with_settings_path(settings: Settings, path: PathBuf) -> Self {
        let mut engine = Self::new(settings);
        engine.settings_path = Some(path);
        engine
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, apply: impl FnOnce(&mut Settings)) -> SyncResult<()> {
        {
            let mut settings = self.settings.write();
            apply(&mut settings);
        }
        self.save_settings()
    }

    fn save_settings(&self) -> SyncResult<()> {
        if let Some(path) = &self.settings_path {
            self.settings.read().save(path)?;
        }
        Ok(())
    }

    fn extension_sets(&self) -> SyncResult<(ExtensionSet, ExtensionSet)> {
        let settings = self.settings.read();
        Ok((
            ExtensionSet::parse(&settings.video_extensions)?,
            ExtensionSet::parse(&settings.photo_extensions)?,
        ))
    }

    /// Rebuild both inventories wholesale. Both roots are validated
    /// before either scan starts; a bad root fails the whole operation
    /// and leaves the previous inventories untouched.
    pub fn refresh_inventories(&self) -> SyncResult<(InventorySummary, InventorySummary)> {
        let (source_root, dest_root) = {
            let settings = self.settings.read();
            (settings.source_dir.clone(), settings.dest_dir.clone())
        };

        // Both roots must pass before either scan starts.
        file_ops::check_root(&source_root)?;
        file_ops::check_root(&dest_root)?;

        let source = file_ops::scan_source(&source_root)?;
        let dest = file_ops::scan_destination(&dest_root)?;

        let source_summary = file_ops::summarize(&source);
        let dest_summary = file_ops::summarize_index(&dest);
        info!(
            "Inventories rebuilt: {} source files ({}), {} destination files ({})",
            source_summary.file_count,
            file_ops::human_size(source_summary.total_bytes),
            dest_summary.file_count,
            file_ops::human_size(dest_summary.total_bytes),
        );

        *self.source_inventory.write() = source;
        *self.dest_index.write() = dest;
        Ok((source_summary, dest_summary))
    }

    pub fn source_inventory(&self) -> Vec<FileEntry> {
        self.source_inventory.read().clone()
    }

    /// Classify the current source inventory against the destination
    /// index under the current policy flags.
    pub fn decisions(&self) -> SyncResult<Vec<(FileEntry, SyncDecision)>> {
        let (video, photo) = self.extension_sets()?;
        let policy = SyncPolicy {
            overwrite: self.settings.read().overwrite_destination,
        };
        let index = self.dest_index.read();
        Ok(self
            .source_inventory
            .read()
            .iter()
            .map(|entry| {
                (
                    entry.clone(),
                    classify::classify(entry, &index, policy, &video, &photo),
                )
            })
            .collect())
    }

    /// Entries selected for copy by default, honoring the media-only
    /// setting.
    pub fn default_selection(&self) -> SyncResult<Vec<FileEntry>> {
        let selected: Vec<FileEntry> = self
            .decisions()?
            .into_iter()
            .filter(|(_, decision)| decision.selected_for_copy)
            .map(|(entry, _)| entry)
            .collect();

        let media_only = self.settings.read().media_only;
        if media_only {
            let (video, photo) = self.extension_sets()?;
            Ok(classify::filter_media_only(selected, &video, &photo))
        } else {
            Ok(selected)
        }
    }

    /// Destination sub-path for one entry; grows the mapping table.
    pub fn resolve_destination(&self, entry: &FileEntry) -> PathBuf {
        self.mapping.write().resolve(entry)
    }

    pub fn mapping_editor_text(&self) -> String {
        self.mapping.read().editor_text()
    }

    /// Apply the mapping editor's output and persist the table.
    pub fn apply_mapping_text(&self, text: &str) -> SyncResult<()> {
        self.mapping.write().apply_editor_text(text);
        self.persist_mapping()
    }

    pub fn clear_mapping(&self) -> SyncResult<()> {
        self.mapping.write().clear();
        self.persist_mapping()
    }

    pub(crate) fn persist_mapping(&self) -> SyncResult<()> {
        {
            let mapping = self.mapping.read();
            self.settings.write().path_overrides = mapping.overrides().clone();
        }
        self.save_settings()
    }

    /// Signal cancellation of a running batch. The flag is honored
    /// between files; cancelling a transcode batch additionally requires
    /// terminating the live encoder process.
    pub fn cancel_batch(&self, batch_id: &str) -> SyncResult<()> {
        let controls = self.controls.read();
        let control = controls
            .get(batch_id)
            .ok_or_else(|| SyncError::BatchNotFound(batch_id.to_string()))?;
        control.cancel();
        info!("Batch {} cancelled by caller", batch_id);
        Ok(())
    }

    pub(crate) fn register_batch(&self) -> (String, Arc<BatchControl>) {
        let batch_id = Uuid::new_v4().to_string();
        let control = Arc::new(BatchControl::new());
        self.controls
            .write()
            .insert(batch_id.clone(), control.clone());
        (batch_id, control)
    }

    pub(crate) fn unregister_batch(&self, batch_id: &str) {
        self.controls.write().remove(batch_id);
    }

    /// Serially copy the selected files to their resolved destination
    /// paths. One per-file failure never aborts the batch; cancellation
    /// stops before the next file and returns partial results.
    pub async fn run_copy_batch(
        &self,
        files: Vec<FileEntry>,
        progress_tx: mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<BatchResult> {
        let (batch_id, control) = self.register_batch();
        let (dest_root, delete_source) = {
            let settings = self.settings.read();
            (
                settings.dest_dir.clone(),
                settings.delete_source_after_copy,
            )
        };

        let bytes_total: u64 = files.iter().map(|f| f.size).sum();
        info!(
            "Copy batch {}: {} files ({})",
            batch_id,
            files.len(),
            file_ops::human_size(bytes_total)
        );

        let _ = progress_tx
            .send(ProgressEvent {
                batch_id: batch_id.clone(),
                current_file: String::new(),
                current_file_size: 0,
                bytes_copied: 0,
                bytes_total,
                files_completed: 0,
                files_total: files.len(),
            })
            .await;

        let mapping = self.mapping.clone();
        let worker_control = control.clone();
        let worker_id = batch_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            copy_batch_worker(
                &worker_id,
                &files,
                &dest_root,
                delete_source,
                &mapping,
                &worker_control,
                &progress_tx,
            )
        })
        .await
        .map_err(|e| SyncError::Internal(e.to_string()))?;

        self.unregister_batch(&batch_id);
        self.persist_mapping()?;

        info!(
            "Copy batch {} finished: {} ok, {} failed{}",
            batch_id,
            result.succeeded,
            result.failed,
            if result.was_cancelled { ", cancelled" } else { "" }
        );
        Ok(result)
    }

    /// Cached one-time capability probe of the configured encoder.
    pub fn encoder_features(&self) -> SyncResult<Vec<String>> {
        if let Some(features) = self.encoder_features.read().as_ref() {
            return Ok(features.clone());
        }
        let exe = self.locate_encoder()?;
        let features = encoder::detect_features(&exe)?;
        *self.encoder_features.write() = Some(features.clone());
        Ok(features)
    }

    /// Profiles the encoder build supports; the session cannot offer
    /// re-encoding when this is empty.
    pub fn available_profiles(&self) -> SyncResult<Vec<&'static CodecProfile>> {
        Ok(encoder::available_profiles(&self.encoder_features()?))
    }

    /// The profile picked by the configured codec index.
    pub fn selected_profile(&self) -> SyncResult<&'static CodecProfile> {
        let profiles = self.available_profiles()?;
        let index = self.settings.read().codec_index;
        profiles
            .get(index)
            .copied()
            .ok_or_else(|| SyncError::Internal(format!("Codec index {} out of range", index)))
    }

    /// Resolve the configured encoder executable; unresolved means the
    /// session cannot offer re-encoding until the caller fixes the path.
    pub fn locate_encoder(&self) -> SyncResult<PathBuf> {
        let configured = self.settings.read().encoder_path.clone();
        encoder::locate(&configured).ok_or(SyncError::EncoderNotFound(configured))
    }

    /// Condensed media details for one file, for display next to the
    /// inventory when show_media_info is on.
    pub fn media_details(&self, path: &Path) -> SyncResult<String> {
        let exe = self.locate_encoder()?;
        encoder::media_details(&exe, path)
    }
}

fn copy_batch_worker(
    batch_id: &str,
    files: &[FileEntry],
    dest_root: &Path,
    delete_source: bool,
    mapping: &Arc<RwLock<PathMapping>>,
    control: &BatchControl,
    progress_tx: &mpsc::Sender<ProgressEvent>,
) -> BatchResult {
    let start = std::time::Instant::now();
    let bytes_total: u64 = files.iter().map(|f| f.size).sum();
    let mut result = BatchResult::default();

    for entry in files {
        if control.is_cancelled() {
            result.was_cancelled = true;
            info!("Copy batch {} stopping before {}", batch_id, entry.file_name());
            break;
        }

        let rel = mapping.write().resolve(entry);
        let dest = dest_root.join(&rel);
        debug!("Copying {} -> {}", entry.path.display(), dest.display());

        match copy_one(entry, &dest, delete_source) {
            Ok(bytes) => {
                result.succeeded += 1;
                result.bytes_copied += bytes;
            }
            Err(e) => {
                result.failed += 1;
                warn!("Failed to copy {}: {}", entry.path.display(), e);
            }
        }

        let _ = progress_tx.blocking_send(ProgressEvent {
            batch_id: batch_id.to_string(),
            current_file: entry.file_name(),
            current_file_size: entry.size,
            bytes_copied: result.bytes_copied,
            bytes_total,
            files_completed: result.succeeded,
            files_total: files.len(),
        });
    }

    result.duration_ms = start.elapsed().as_millis() as u64;
    result
}

fn copy_one(entry: &FileEntry, dest: &Path, delete_source: bool) -> SyncResult<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = file_ops::copy_file_preserving(&entry.path, dest)?;
    if bytes != entry.size {
        return Err(SyncError::SizeMismatch {
            path: entry.path.display().to_string(),
            expected: entry.size,
            actual: bytes,
        });
    }

    if delete_source {
        if let Err(e) = fs::remove_file(&entry.path) {
            warn!(
                "Failed to remove source {} after copy: {}",
                entry.path.display(),
                e
            );
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use filetime::FileTime;
    use tempfile::TempDir;

    fn write_with_date(dir: &Path, rel: &str, size: usize, date: (i32, u32, u32)) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![b'x'; size]).unwrap();
        let stamp = Local
            .with_ymd_and_hms(date.0, date.1, date.2, 12, 0, 0)
            .unwrap()
            .timestamp();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(stamp, 0)).unwrap();
        path
    }

    fn engine_for(source: &Path, dest: &Path) -> SyncEngine {
        let mut settings = Settings::default();
        settings.source_dir = source.to_path_buf();
        settings.dest_dir = dest.to_path_buf();
        SyncEngine::new(settings)
    }

    #[tokio::test]
    async fn copy_batch_lands_files_in_date_buckets() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_with_date(source.path(), "a.jpg", 10, (2023, 5, 1));
        write_with_date(source.path(), "b.jpg", 20, (2023, 5, 1));
        write_with_date(source.path(), "c.mp4", 30, (2023, 6, 15));

        let engine = engine_for(source.path(), dest.path());
        engine.refresh_inventories().unwrap();

        let decisions = engine.decisions().unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(decisions.iter().all(|(_, d)| !d.already_synced));

        let selection = engine.default_selection().unwrap();
        assert_eq!(selection.len(), 3);

        let (tx, mut rx) = mpsc::channel(1024);
        let result = engine.run_copy_batch(selection, tx).await.unwrap();
        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed, 0);
        assert!(!result.was_cancelled);
        assert_eq!(result.bytes_copied, 60);

        for rel in [
            "2023/2023-05-01/a.jpg",
            "2023/2023-05-01/b.jpg",
            "2023/2023-06-15/c.mp4",
        ] {
            assert!(dest.path().join(rel).is_file(), "missing {}", rel);
        }
        assert_eq!(fs::metadata(dest.path().join("2023/2023-06-15/c.mp4")).unwrap().len(), 30);

        // Progress is monotone and terminates at the declared total.
        let mut last = 0u64;
        let mut final_bytes = 0u64;
        while let Ok(event) = rx.try_recv() {
            assert!(event.bytes_copied >= last);
            assert_eq!(event.bytes_total, 60);
            last = event.bytes_copied;
            final_bytes = event.bytes_copied;
        }
        assert_eq!(final_bytes, 60);
    }

    #[tokio::test]
    async fn synced_files_are_deselected_unless_overwriting() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_with_date(source.path(), "img.jpg", 10, (2023, 5, 1));
        write_with_date(dest.path(), "old/img.jpg", 10, (2022, 1, 1));

        let engine = engine_for(source.path(), dest.path());
        engine.refresh_inventories().unwrap();

        // Scenario B: same name and size at the destination.
        let decisions = engine.decisions().unwrap();
        assert!(decisions[0].1.already_synced);
        assert!(engine.default_selection().unwrap().is_empty());

        // Scenario C: overwrite policy forces a re-copy.
        engine.update_settings(|s| s.overwrite_destination = true).unwrap();
        let decisions = engine.decisions().unwrap();
        assert!(!decisions[0].1.already_synced);

        let selection = engine.default_selection().unwrap();
        assert_eq!(selection.len(), 1);
        let (tx, _rx) = mpsc::channel(64);
        let result = engine.run_copy_batch(selection, tx).await.unwrap();
        assert_eq!(result.succeeded, 1);
        assert!(dest.path().join("2023/2023-05-01/img.jpg").is_file());
    }

    #[tokio::test]
    async fn cancelled_batch_copies_nothing_further() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_with_date(source.path(), "a.jpg", 10, (2023, 5, 1));
        write_with_date(source.path(), "b.jpg", 20, (2023, 5, 1));

        let engine = engine_for(source.path(), dest.path());
        engine.refresh_inventories().unwrap();
        let selection = engine.default_selection().unwrap();

        // Cancel before the worker starts: no file may be touched.
        let (batch_id, control) = engine.register_batch();
        control.cancel();
        let files = selection.clone();
        let (tx, _rx) = mpsc::channel(64);
        let result = copy_batch_worker(
            &batch_id,
            &files,
            dest.path(),
            false,
            &engine.mapping,
            &control,
            &tx,
        );
        assert!(result.was_cancelled);
        assert_eq!(result.succeeded, 0);
        assert!(!dest.path().join("2023/2023-05-01/a.jpg").exists());
    }

    #[tokio::test]
    async fn failed_file_does_not_abort_the_batch() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let doomed = write_with_date(source.path(), "gone.jpg", 10, (2023, 5, 1));
        write_with_date(source.path(), "kept.jpg", 20, (2023, 5, 1));

        let engine = engine_for(source.path(), dest.path());
        engine.refresh_inventories().unwrap();
        let selection = engine.default_selection().unwrap();

        // Remove one source after the scan so its snapshot is stale.
        fs::remove_file(&doomed).unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let result = engine.run_copy_batch(selection, tx).await.unwrap();
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed, 1);
        assert!(result.any_failures());
        assert!(dest.path().join("2023/2023-05-01/kept.jpg").is_file());
    }

    #[tokio::test]
    async fn delete_source_after_copy_moves_the_file() {
        let source = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let src = write_with_date(source.path(), "move.jpg", 10, (2023, 5, 1));

        let engine = engine_for(source.path(), dest.path());
        engine.update_settings(|s| s.delete_source_after_copy = true).unwrap();
        engine.refresh_inventories().unwrap();
        let selection = engine.default_selection().unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let result = engine.run_copy_batch(selection, tx).await.unwrap();
        assert_eq!(result.succeeded, 1);
        assert!(!src.exists());
        assert!(dest.path().join("2023/2023-05-01/move.jpg").is_file());
    }

    #[test]
    fn refresh_rejects_missing_roots() {
        let dest = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.source_dir = PathBuf::from("/definitely/not/here");
        settings.dest_dir = dest.path().to_path_buf();

        let engine = SyncEngine::new(settings);
        assert!(matches!(
            engine.refresh_inventories(),
            Err(SyncError::SourceNotFound(_))
        ));
    }

    #[test]
    fn mapping_edits_persist_into_settings() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let engine = SyncEngine::with_settings_path(Settings::default(), settings_path.clone());

        engine
            .apply_mapping_text("2023/2023-05-01 => trips/rome\n")
            .unwrap();

        let reloaded = Settings::load(&settings_path).unwrap();
        assert_eq!(
            reloaded.path_overrides.get("2023/2023-05-01").unwrap(),
            "trips/rome"
        );

        // A fresh engine picks the override back up.
        let engine2 = SyncEngine::new(reloaded);
        assert!(engine2.mapping_editor_text().contains("trips/rome"));
    }

    #[test]
    fn cancel_unknown_batch_is_an_error() {
        let engine = SyncEngine::new(Settings::default());
        assert!(matches!(
            engine.cancel_batch("nope"),
            Err(SyncError::BatchNotFound(_))
        ));
    }
}
