use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::SyncItem;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    File,
    Directory,
}

/// Snapshot persisted after an item propagates successfully. Filesystem
/// identity fields are read from the local copy, best effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub modtime: i64,
    pub kind: RecordKind,
    pub etag: String,
    pub file_id: String,
}

impl FileRecord {
    pub fn from_item(item: &SyncItem, local_path: &Path) -> Self {
        let meta = std::fs::metadata(local_path).ok();
        #[cfg(unix)]
        let (inode, uid, gid, mode) = {
            use std::os::unix::fs::MetadataExt;
            meta.as_ref()
                .map(|m| (m.ino(), m.uid(), m.gid(), m.mode()))
                .unwrap_or_default()
        };
        #[cfg(not(unix))]
        let (inode, uid, gid, mode) = (0, 0, 0, 0);
        Self {
            path: item.path.clone(),
            inode,
            uid,
            gid,
            mode,
            modtime: item.modtime,
            kind: if item.is_directory {
                RecordKind::Directory
            } else {
                RecordKind::File
            },
            etag: item.etag.clone(),
            file_id: item.file_id.clone(),
        }
    }
}

/// Resume state of an in-flight chunked upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub valid: bool,
    /// Next chunk index to send.
    pub chunk: u32,
    pub transfer_id: u32,
    /// Source modtime at the time the checkpoint was written; resume is
    /// only honored while it still matches the item.
    pub modtime: i64,
}

/// Resume state of an in-flight download.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub valid: bool,
    /// Remote etag at the start of the download.
    pub etag: String,
    /// Hidden temp path relative to the sync root.
    pub tmpfile: String,
}

/// The narrow contract the engine has with the sync journal. Absent
/// entries read back as invalid/default records. Writes must be durable
/// before the next I/O step that depends on them.
pub trait Journal: Send {
    fn set_file_record(&mut self, record: FileRecord) -> Result<(), JournalError>;
    fn delete_file_record(&mut self, path: &str, is_directory: bool) -> Result<(), JournalError>;
    fn get_upload_info(&self, path: &str) -> Result<UploadInfo, JournalError>;
    fn set_upload_info(&mut self, path: &str, info: UploadInfo) -> Result<(), JournalError>;
    fn get_download_info(&self, path: &str) -> Result<DownloadInfo, JournalError>;
    fn set_download_info(&mut self, path: &str, info: DownloadInfo) -> Result<(), JournalError>;
}

/// HashMap-backed journal for tests and embedders that bring no store of
/// their own. Not a persistence layer.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: HashMap<String, FileRecord>,
    uploads: HashMap<String, UploadInfo>,
    downloads: HashMap<String, DownloadInfo>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_record(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Journal for MemoryJournal {
    fn set_file_record(&mut self, record: FileRecord) -> Result<(), JournalError> {
        self.records.insert(record.path.clone(), record);
        Ok(())
    }

    fn delete_file_record(&mut self, path: &str, is_directory: bool) -> Result<(), JournalError> {
        self.records.remove(path);
        if is_directory {
            let prefix = format!("{path}/");
            self.records.retain(|key, _| !key.starts_with(&prefix));
        }
        Ok(())
    }

    fn get_upload_info(&self, path: &str) -> Result<UploadInfo, JournalError> {
        Ok(self.uploads.get(path).cloned().unwrap_or_default())
    }

    fn set_upload_info(&mut self, path: &str, info: UploadInfo) -> Result<(), JournalError> {
        self.uploads.insert(path.to_string(), info);
        Ok(())
    }

    fn get_download_info(&self, path: &str) -> Result<DownloadInfo, JournalError> {
        Ok(self.downloads.get(path).cloned().unwrap_or_default())
    }

    fn set_download_info(&mut self, path: &str, info: DownloadInfo) -> Result<(), JournalError> {
        self.downloads.insert(path.to_string(), info);
        Ok(())
    }
}
