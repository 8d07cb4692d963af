//! Media sync and transcode engine: inventory scanning, date-bucket
//! destination mapping, sync-state classification, a serial copy
//! pipeline and an encoder-driven re-encode pipeline.

pub mod classify;
pub mod encoder;
pub mod errors;
pub mod file_ops;
pub mod mapping;
pub mod settings;
pub mod sync_engine;
pub mod transcode;

pub use classify::{MediaKind, SyncDecision, SyncPolicy};
pub use encoder::{CodecProfile, CODEC_PROFILES};
pub use errors::{SyncError, SyncResult};
pub use file_ops::{FileEntry, InventorySummary};
pub use mapping::PathMapping;
pub use settings::Settings;
pub use sync_engine::{BatchControl, BatchResult, ProgressEvent, SyncEngine};
pub use transcode::{JobStatus, TranscodeProgress};
