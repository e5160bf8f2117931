use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    StartUpload,
    /// Incremental progress of a running transfer.
    Context,
    EndUpload,
    StartDownload,
    EndDownload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub path: String,
    pub done: u64,
    pub total: u64,
}

pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;
