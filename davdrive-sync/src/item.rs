use davdrive_core::ErrorClass;
use serde::{Deserialize, Serialize};

/// Sentinel the reconciler stores when the server never reported an etag.
pub const EMPTY_ETAG: &str = "empty_etag";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    New,
    Sync,
    Remove,
    Rename,
    Conflict,
    Ignore,
}

/// One reconciled path, as handed over by the diff stage. The engine only
/// writes back `etag` and `file_id` as it learns them from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Forward-slash path relative to the sync root, same on both sides.
    pub path: String,
    /// Pre-rename path; equals `path` when the item was not renamed.
    pub original_path: String,
    /// Destination path when the instruction is `Rename`.
    pub rename_target: String,
    pub direction: Direction,
    pub instruction: Instruction,
    pub is_directory: bool,
    pub size: u64,
    pub modtime: i64,
    pub etag: String,
    pub file_id: String,
}

impl SyncItem {
    pub fn has_usable_etag(&self) -> bool {
        !self.etag.is_empty() && self.etag != EMPTY_ETAG
    }
}

/// Terminal outcome of one propagation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Success,
    /// Download succeeded but the previous local file was renamed aside.
    Conflict,
    /// Item-level, re-drivable next run.
    SoftError,
    /// Item-level failure; the rest of the sync continues.
    NormalError,
    /// Session-level failure; aborts the whole run.
    FatalError,
}

impl JobStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            JobStatus::SoftError | JobStatus::NormalError | JobStatus::FatalError
        )
    }
}

impl From<ErrorClass> for JobStatus {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Success => JobStatus::Success,
            ErrorClass::Soft => JobStatus::SoftError,
            ErrorClass::Normal => JobStatus::NormalError,
            ErrorClass::Fatal => JobStatus::FatalError,
        }
    }
}
