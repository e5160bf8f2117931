mod bandwidth;
mod config;
mod download;
mod item;
mod journal;
mod ops;
mod paths;
mod progress;
mod propagator;
mod upload;

pub use bandwidth::BandwidthLimiter;
pub use config::EngineConfig;
pub use item::{Direction, EMPTY_ETAG, Instruction, JobStatus, SyncItem};
pub use journal::{
    DownloadInfo, FileRecord, Journal, JournalError, MemoryJournal, RecordKind, UploadInfo,
};
pub use paths::{PathError, conflict_backup_path, hidden_temp_name, local_path_for};
pub use progress::{ProgressEvent, ProgressKind, ProgressSender};
pub use propagator::{ItemOutcome, PropagateReport, Propagator};
