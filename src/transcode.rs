//! Re-encode pipeline: encoder subprocess lifecycle and progress
//! parsing.
//!
//! The encoder reports everything on stderr. A `Duration:` header line
//! gives the clip length; periodic `frame=...time=...` lines give the
//! elapsed output position. Elapsed over total is the per-file progress
//! fraction, emitted as parsed and never clamped.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::Arc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::encoder::{self, CodecProfile};
use crate::errors::{SyncError, SyncResult};
use crate::file_ops::{self, FileEntry};
use crate::sync_engine::{BatchControl, BatchResult, SyncEngine};

/// Lifecycle of a single re-encode job. Probing and Encoding both
/// happen inside one encoder invocation; the clip duration is read from
/// the same stream that later reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Probing,
    Encoding,
    Done,
    Failed,
    Cancelled,
}

/// Per-file progress emitted while an encode runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeProgress {
    pub batch_id: String,
    pub current_file: String,
    pub files_completed: usize,
    pub files_total: usize,
    /// Elapsed over total clip seconds; not clamped, so a stream whose
    /// header under-reports its duration may exceed 1.0.
    pub fraction: f64,
    pub status: JobStatus,
}

/// Parse an `HH:MM:SS` stamp into whole seconds.
pub fn timestamp_to_secs(stamp: &str) -> Option<u64> {
    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.trim().parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Total clip length from a stream-header line, truncated to whole
/// seconds. A matched header with an unparsable stamp is logged and
/// skipped.
pub fn parse_duration_line(line: &str) -> Option<u64> {
    let rest = &line[line.find("Duration: ")? + "Duration: ".len()..];
    let stamp = rest.split('.').next()?;
    match timestamp_to_secs(stamp) {
        Some(secs) => Some(secs),
        None => {
            warn!("Unparsable duration stamp {:?}", stamp);
            None
        }
    }
}

/// Elapsed output position from a periodic progress line. A matched
/// line with an unparsable stamp is logged and skipped.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let line = line.trim_start();
    if !line.starts_with("frame=") {
        return None;
    }
    let rest = &line[line.find("time=")? + "time=".len()..];
    let stamp = rest.split('.').next()?;
    match timestamp_to_secs(stamp) {
        Some(secs) => Some(secs),
        None => {
            warn!("Unparsable progress stamp {:?}", stamp);
            None
        }
    }
}

impl SyncEngine {
    /// Serially re-encode the destination copies of the given files
    /// with the currently selected codec profile. Resolution of the
    /// encoder and profile happens up front and fails the whole batch;
    /// per-file trouble is recorded and skipped.
    pub async fn run_transcode_batch(
        &self,
        files: Vec<FileEntry>,
        progress_tx: mpsc::Sender<TranscodeProgress>,
    ) -> SyncResult<BatchResult> {
        let exe = self.locate_encoder()?;
        let profile = self.selected_profile()?;
        let (dest_root, delete_copy) = {
            let settings = self.settings.read();
            (
                settings.dest_dir.clone(),
                settings.delete_copy_after_transcode,
            )
        };

        let (batch_id, control) = self.register_batch();
        info!(
            "Transcode batch {}: {} files with {}",
            batch_id,
            files.len(),
            profile.name
        );

        let mapping = self.mapping.clone();
        let process_slot = self.active_process.clone();
        let worker_control = control.clone();
        let worker_id = batch_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut result = BatchResult::default();
            let start = std::time::Instant::now();
            let files_total = files.len();

            for entry in &files {
                if worker_control.is_cancelled() {
                    result.was_cancelled = true;
                    break;
                }

                let rel = mapping.write().resolve(entry);
                let input = dest_root.join(&rel);
                match transcode_one(
                    &worker_id,
                    &exe,
                    &input,
                    profile,
                    delete_copy,
                    &process_slot,
                    &worker_control,
                    &progress_tx,
                    result.succeeded,
                    files_total,
                ) {
                    Ok(JobStatus::Done) => result.succeeded += 1,
                    Ok(JobStatus::Cancelled) => {
                        result.was_cancelled = true;
                        break;
                    }
                    Ok(_) => result.failed += 1,
                    Err(e) => {
                        result.failed += 1;
                        warn!("Failed to transcode {}: {}", input.display(), e);
                    }
                }
            }

            result.duration_ms = start.elapsed().as_millis() as u64;
            result
        })
        .await
        .map_err(|e| SyncError::Internal(e.to_string()))?;

        self.unregister_batch(&batch_id);
        info!(
            "Transcode batch {} finished: {} ok, {} failed{}",
            batch_id,
            result.succeeded,
            result.failed,
            if result.was_cancelled { ", cancelled" } else { "" }
        );
        Ok(result)
    }

    /// Kill the encoder process currently running, if any. A process
    /// that already exited is not an error.
    pub fn terminate_active_encode(&self) {
        let mut slot = self.active_process.lock();
        if let Some(child) = slot.as_mut() {
            info!("Terminating active encoder process");
            if let Err(e) = child.kill() {
                debug!("Encoder process already gone: {}", e);
            }
        }
    }

    /// Cancel a transcode batch: stop before the next file and bring
    /// down the in-flight encode.
    pub fn cancel_transcode_batch(&self, batch_id: &str) -> SyncResult<()> {
        self.cancel_batch(batch_id)?;
        self.terminate_active_encode();
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn transcode_one(
    batch_id: &str,
    exe: &Path,
    input: &Path,
    profile: &CodecProfile,
    delete_copy: bool,
    process_slot: &Arc<Mutex<Option<Child>>>,
    control: &BatchControl,
    progress_tx: &mpsc::Sender<TranscodeProgress>,
    files_completed: usize,
    files_total: usize,
) -> SyncResult<JobStatus> {
    if !input.is_file() {
        warn!("Transcode input missing: {}", input.display());
        return Ok(JobStatus::Failed);
    }

    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SyncError::InvalidPath(input.display().to_string()))?;
    let _ = progress_tx.blocking_send(TranscodeProgress {
        batch_id: batch_id.to_string(),
        current_file: file_name.clone(),
        files_completed,
        files_total,
        fraction: 0.0,
        status: JobStatus::Pending,
    });

    let output = input.with_file_name(encoder::output_name(&file_name, profile));
    debug!("Encoding {} -> {}", input.display(), output.display());

    // A stale target from an earlier run must not linger.
    if output.exists() {
        fs::remove_file(&output)?;
    }

    let mut cmd = encoder::transcode_command(exe, input, profile, &output);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    // Take the stderr pipe before parking the child in the shared slot,
    // so the reader never touches the handle the kill path locks.
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SyncError::Internal("Encoder stderr not captured".into()))?;
    *process_slot.lock() = Some(child);

    let _ = progress_tx.blocking_send(TranscodeProgress {
        batch_id: batch_id.to_string(),
        current_file: file_name.clone(),
        files_completed,
        files_total,
        fraction: 0.0,
        status: JobStatus::Probing,
    });

    let mut total_secs: Option<u64> = None;
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        // Progress lines are carriage-return separated.
        let chunk = String::from_utf8_lossy(&buf);
        for line in chunk.split('\r') {
            if total_secs.is_none() {
                if let Some(secs) = parse_duration_line(line) {
                    total_secs = Some(secs);
                    continue;
                }
            }
            if let Some(elapsed) = parse_progress_line(line) {
                match total_secs {
                    Some(total) if total > 0 && elapsed > 0 => {
                        let _ = progress_tx.blocking_send(TranscodeProgress {
                            batch_id: batch_id.to_string(),
                            current_file: file_name.clone(),
                            files_completed,
                            files_total,
                            fraction: elapsed as f64 / total as f64,
                            status: JobStatus::Encoding,
                        });
                    }
                    _ => debug!("Progress sample before any duration header"),
                }
            }
        }
    }

    // Pipe EOF means the process has exited or is exiting; reap it.
    let status = match process_slot.lock().take() {
        Some(mut child) => child.wait()?,
        None => return Err(SyncError::Internal("Encoder process handle lost".into())),
    };

    if control.is_cancelled() {
        if output.exists() {
            if let Err(e) = fs::remove_file(&output) {
                warn!("Failed to remove partial output {}: {}", output.display(), e);
            }
        }
        let _ = progress_tx.blocking_send(TranscodeProgress {
            batch_id: batch_id.to_string(),
            current_file: file_name,
            files_completed,
            files_total,
            fraction: 0.0,
            status: JobStatus::Cancelled,
        });
        return Ok(JobStatus::Cancelled);
    }

    let original = fs::metadata(input).ok().map(|m| m.len());
    let produced = fs::metadata(&output).ok().map(|m| m.len());
    if let Some(bytes) = original {
        info!("Original {}: {}", file_name, file_ops::human_size(bytes));
    }
    if let Some(bytes) = produced {
        info!(
            "Produced {}: {}",
            output.display(),
            file_ops::human_size(bytes)
        );
    }

    if !status.success() || !output.is_file() {
        return Err(SyncError::ProcessFailed(format!(
            "{} (exit {:?}, output present: {})",
            file_name,
            status.code(),
            output.is_file()
        )));
    }

    if delete_copy {
        if let Err(e) = fs::remove_file(input) {
            warn!(
                "Failed to remove copy {} after transcode: {}",
                input.display(),
                e
            );
        }
    }

    let _ = progress_tx.blocking_send(TranscodeProgress {
        batch_id: batch_id.to_string(),
        current_file: file_name,
        files_completed: files_completed + 1,
        files_total,
        fraction: 1.0,
        status: JobStatus::Done,
    });
    Ok(JobStatus::Done)
}
