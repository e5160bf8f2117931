use std::path::Path;
use std::time::Duration;

use davdrive_core::{ChunkMeta, classify_error, classify_status, mtime_accepted, response_etag, response_file_id};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::{debug, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::item::SyncItem;
use crate::journal::{FileRecord, Journal, UploadInfo};
use crate::paths::local_path_for;
use crate::progress::ProgressKind;
use crate::propagator::{JobOutcome, Propagator};

// TODO: consider exponential backoff with a lower cap; thirty flat retries
// is what the desktop clients shipped with.
const SOURCE_CHANGE_MAX_ATTEMPTS: u32 = 30;
const SOURCE_CHANGE_RETRY_DELAY: Duration = Duration::from_secs(2);

enum UploadAttempt {
    Done(JobOutcome),
    /// The local file changed while we were sending it; re-split and retry.
    SourceChanged,
}

struct SourceSnapshot {
    size: u64,
    modtime: i64,
}

impl SourceSnapshot {
    async fn take(path: &Path) -> std::io::Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        let modtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            modtime,
        })
    }

    fn differs_from(&self, other: &SourceSnapshot) -> bool {
        self.size != other.size || self.modtime != other.modtime
    }
}

fn chunk_count(size: u64, chunk_size: u64) -> u32 {
    size.div_ceil(chunk_size).max(1) as u32
}

impl<J: Journal> Propagator<J> {
    pub(crate) async fn propagate_upload(&mut self, item: &mut SyncItem) -> JobOutcome {
        self.notify_progress(ProgressKind::StartUpload, &item.path, 0, item.size);
        let local = match local_path_for(&self.local_root, &item.path) {
            Ok(local) => local,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };

        let mut attempts = 0u32;
        loop {
            match self.upload_once(item, &local).await {
                UploadAttempt::Done(outcome) => return outcome,
                UploadAttempt::SourceChanged => {
                    attempts += 1;
                    if attempts >= SOURCE_CHANGE_MAX_ATTEMPTS {
                        return JobOutcome::normal(format!(
                            "local file {} kept changing during upload",
                            item.path
                        ));
                    }
                    debug!(
                        path = %item.path,
                        attempt = attempts,
                        "source file changed during upload, retrying in two seconds"
                    );
                    tokio::time::sleep(SOURCE_CHANGE_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn upload_once(&mut self, item: &mut SyncItem, local: &Path) -> UploadAttempt {
        let mut file = match tokio::fs::File::open(local).await {
            Ok(file) => file,
            Err(err) => return UploadAttempt::Done(JobOutcome::normal(err.to_string())),
        };
        let source = match SourceSnapshot::take(local).await {
            Ok(source) => source,
            Err(err) => return UploadAttempt::Done(JobOutcome::normal(err.to_string())),
        };

        let chunk_size = self.config.chunk_size.max(1);
        let count = chunk_count(source.size, chunk_size);
        let mut transfer_id: u32 = rand::random();
        let mut start_chunk = 0u32;
        match self.journal.get_upload_info(&item.path) {
            // Resume only while the source still is what the checkpoint saw.
            Ok(info) if info.valid && info.modtime == item.modtime => {
                start_chunk = info.chunk;
                transfer_id = info.transfer_id;
            }
            Ok(_) => {}
            Err(err) => return UploadAttempt::Done(JobOutcome::normal(err.to_string())),
        }

        let previous_etag = item.has_usable_etag().then(|| item.etag.clone());
        let mut limiter = BandwidthLimiter::new(self.config.upload_limit);
        let mut done = u64::from(start_chunk)
            .saturating_mul(chunk_size)
            .min(source.size);
        let mut final_response = None;

        debug!(
            path = %item.path,
            size = source.size,
            chunks = count,
            start_chunk,
            transfer_id,
            "starting PUT sequence"
        );

        for index in start_chunk..count {
            if self.abort_requested() {
                return UploadAttempt::Done(JobOutcome::normal("sync aborted by user"));
            }
            match SourceSnapshot::take(local).await {
                Ok(now) if now.differs_from(&source) => return UploadAttempt::SourceChanged,
                Ok(_) => {}
                Err(_) => return UploadAttempt::SourceChanged,
            }

            let offset = u64::from(index) * chunk_size;
            let len = chunk_size.min(source.size - offset) as usize;
            let mut buf = vec![0u8; len];
            if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
                return UploadAttempt::Done(JobOutcome::normal(err.to_string()));
            }
            if file.read_exact(&mut buf).await.is_err() {
                // Short read: the file shrank under us.
                return UploadAttempt::SourceChanged;
            }

            let meta = ChunkMeta {
                transfer_id,
                index,
                count,
            };
            let response = match self
                .client
                .put_chunk(&item.path, meta, buf, previous_etag.as_deref(), item.modtime)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    return UploadAttempt::Done(JobOutcome::from_classified(classify_error(
                        &err, None,
                    )));
                }
            };
            let classified = classify_status(response.status(), None);
            if !classified.is_success() {
                return UploadAttempt::Done(JobOutcome::from_classified(classified));
            }

            done += len as u64;
            self.notify_progress(ProgressKind::Context, &item.path, done, source.size);
            limiter.throttle(done).await;

            // Single-chunk transfers need no resume state.
            if count > 1 {
                let info = UploadInfo {
                    valid: true,
                    chunk: index + 1,
                    transfer_id,
                    modtime: source.modtime,
                };
                if let Err(err) = self.journal.set_upload_info(&item.path, info) {
                    return UploadAttempt::Done(JobOutcome::normal(err.to_string()));
                }
            }
            final_response = Some(response);
        }

        match SourceSnapshot::take(local).await {
            Ok(now) if now.differs_from(&source) => return UploadAttempt::SourceChanged,
            _ => {}
        }

        let Some(response) = final_response else {
            return UploadAttempt::Done(JobOutcome::normal("upload sent no chunks"));
        };

        // The file id should only be missing for files new to the server.
        let reported = response_file_id(&response);
        if item.file_id.is_empty() && reported.as_deref().is_none_or(str::is_empty) {
            self.fetch_file_id(item).await;
        } else {
            self.adopt_file_id(item, reported);
        }

        if mtime_accepted(&response) {
            if let Some(etag) = response_etag(&response) {
                item.etag = etag;
            }
        } else {
            let path = item.path.clone();
            if let Err(err) = self.update_mtime_and_etag(item, &path).await {
                warn!(path = %item.path, %err, "could not refresh etag after upload");
            }
        }

        if let Err(err) = self
            .journal
            .set_file_record(FileRecord::from_item(item, local))
        {
            return UploadAttempt::Done(JobOutcome::normal(err.to_string()));
        }
        if let Err(err) = self.journal.set_upload_info(&item.path, UploadInfo::default()) {
            return UploadAttempt::Done(JobOutcome::normal(err.to_string()));
        }
        self.notify_progress(ProgressKind::EndUpload, &item.path, 0, item.size);
        UploadAttempt::Done(JobOutcome::success())
    }
}
