use std::io::Write;
use std::path::Path;

use davdrive_core::{DavError, classify_error, classify_status, response_etag};
use filetime::FileTime;
use flate2::write::GzDecoder;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::item::{Instruction, JobStatus, SyncItem};
use crate::journal::{DownloadInfo, FileRecord, Journal};
use crate::paths::{conflict_backup_path, files_equal, hidden_temp_name, local_path_for};
use crate::progress::ProgressKind;
use crate::propagator::{JobOutcome, Propagator};

const TIMEOUT_RETRIES: u32 = 3;

enum DownloadFailure {
    Timeout(String),
    Failed(JobOutcome),
}

/// Writes the response body into the temp file, decompressing when the
/// server answered with a gzip content encoding.
enum BodySink {
    Plain(std::fs::File),
    Gzip(GzDecoder<std::fs::File>),
}

impl BodySink {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            BodySink::Plain(file) => file.write_all(buf),
            BodySink::Gzip(decoder) => decoder.write_all(buf),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            BodySink::Plain(mut file) => {
                file.flush()?;
                file.sync_all()
            }
            BodySink::Gzip(decoder) => decoder.finish()?.sync_all(),
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
}

impl<J: Journal> Propagator<J> {
    pub(crate) async fn propagate_download(&mut self, item: &mut SyncItem) -> JobOutcome {
        self.notify_progress(ProgressKind::StartDownload, &item.path, 0, item.size);
        let destination = match local_path_for(&self.local_root, &item.path) {
            Ok(destination) => destination,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };

        // Reuse the temp file of an earlier attempt, unless the remote has
        // moved on since then.
        let mut tmp_name = None;
        match self.journal.get_download_info(&item.path) {
            Ok(info) if info.valid => {
                if info.etag != item.etag {
                    if let Ok(stale) = local_path_for(&self.local_root, &info.tmpfile) {
                        let _ = tokio::fs::remove_file(&stale).await;
                    }
                    if let Err(err) = self
                        .journal
                        .set_download_info(&item.path, DownloadInfo::default())
                    {
                        return JobOutcome::normal(err.to_string());
                    }
                } else {
                    tmp_name = Some(info.tmpfile);
                }
            }
            Ok(_) => {}
            Err(err) => return JobOutcome::normal(err.to_string()),
        }
        let tmp_name = tmp_name.unwrap_or_else(|| hidden_temp_name(&item.path));
        let tmp_path = match local_path_for(&self.local_root, &tmp_name) {
            Ok(tmp_path) => tmp_path,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };

        // Prove the temp file is writable before journaling it.
        if let Err(err) = open_append(&tmp_path) {
            return JobOutcome::normal(err.to_string());
        }
        let info = DownloadInfo {
            valid: true,
            etag: item.etag.clone(),
            tmpfile: tmp_name,
        };
        if let Err(err) = self.journal.set_download_info(&item.path, info) {
            return JobOutcome::normal(err.to_string());
        }

        let mut retries = 0u32;
        let etag = loop {
            if self.abort_requested() {
                let aborted = JobOutcome::normal("sync aborted by user");
                return self.download_failed(item, &tmp_path, aborted).await;
            }
            match self.download_attempt(item, &tmp_path).await {
                Ok(etag) => break etag,
                Err(DownloadFailure::Timeout(message)) => {
                    retries += 1;
                    if retries < TIMEOUT_RETRIES {
                        debug!(path = %item.path, retries, "download timed out, retrying");
                        continue;
                    }
                    let outcome = JobOutcome::with_status(JobStatus::FatalError, message);
                    return self.download_failed(item, &tmp_path, outcome).await;
                }
                Err(DownloadFailure::Failed(outcome)) => {
                    return self.download_failed(item, &tmp_path, outcome).await;
                }
            }
        };
        item.etag = etag;

        // Only a byte-wise difference makes a real conflict; the reconciler
        // flags suspicion, we verify.
        let is_conflict = item.instruction == Instruction::Conflict
            && !files_equal(&destination, &tmp_path).await;
        if is_conflict {
            let backup_name = conflict_backup_path(&item.path, item.modtime);
            let backup = match local_path_for(&self.local_root, &backup_name) {
                Ok(backup) => backup,
                Err(err) => return JobOutcome::normal(err.to_string()),
            };
            debug!(path = %item.path, backup = %backup_name, "keeping conflicted copy aside");
            if let Err(err) = tokio::fs::rename(&destination, &backup).await {
                // If the rename fails, do not replace the local file.
                return JobOutcome::normal(err.to_string());
            }
        }

        // Same-directory rename, atomic and overwriting on the platforms
        // this runs on.
        if let Err(err) = tokio::fs::rename(&tmp_path, &destination).await {
            return JobOutcome::normal(err.to_string());
        }

        let stamp = FileTime::from_unix_time(item.modtime, 0);
        if let Err(err) = filetime::set_file_times(&destination, stamp, stamp) {
            warn!(path = %item.path, %err, "could not set file times");
        }

        if let Err(err) = self
            .journal
            .set_file_record(FileRecord::from_item(item, &destination))
        {
            return JobOutcome::normal(err.to_string());
        }
        if let Err(err) = self
            .journal
            .set_download_info(&item.path, DownloadInfo::default())
        {
            return JobOutcome::normal(err.to_string());
        }
        self.notify_progress(ProgressKind::EndDownload, &item.path, 0, item.size);
        if is_conflict {
            JobOutcome::conflict()
        } else {
            JobOutcome::success()
        }
    }

    async fn download_attempt(
        &mut self,
        item: &SyncItem,
        tmp_path: &Path,
    ) -> Result<String, DownloadFailure> {
        let offset = tokio::fs::metadata(tmp_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let response = match self.client.get(&item.path, (offset > 0).then_some(offset)).await {
            Ok(response) => response,
            Err(err) => {
                if let DavError::Request(req_err) = &err
                    && req_err.is_timeout()
                {
                    return Err(DownloadFailure::Timeout(err.to_string()));
                }
                return Err(DownloadFailure::Failed(JobOutcome::from_classified(
                    classify_error(&err, None),
                )));
            }
        };
        let classified = classify_status(response.status(), None);
        if !classified.is_success() {
            return Err(DownloadFailure::Failed(JobOutcome::from_classified(
                classified,
            )));
        }

        let etag = response_etag(&response).unwrap_or_default();
        let gzipped = response
            .headers()
            .get("Content-Encoding")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));
        debug!(path = %item.path, gzipped, offset, "receiving response body");

        let file = open_append(tmp_path)
            .map_err(|err| DownloadFailure::Failed(JobOutcome::normal(err.to_string())))?;
        let mut sink = if gzipped {
            BodySink::Gzip(GzDecoder::new(file))
        } else {
            BodySink::Plain(file)
        };

        let mut limiter = BandwidthLimiter::new(self.config.download_limit);
        let mut received = offset;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) if err.is_timeout() => {
                    return Err(DownloadFailure::Timeout(err.to_string()));
                }
                Err(err) => {
                    return Err(DownloadFailure::Failed(JobOutcome::from_classified(
                        classify_error(&err.into(), None),
                    )));
                }
            };
            if self.abort_requested() {
                return Err(DownloadFailure::Failed(JobOutcome::normal(
                    "sync aborted by user",
                )));
            }
            sink.write_all(&chunk)
                .map_err(|err| DownloadFailure::Failed(JobOutcome::normal(err.to_string())))?;
            received += chunk.len() as u64;
            self.notify_progress(ProgressKind::Context, &item.path, received, item.size);
            limiter.throttle(received).await;
        }
        sink.finish()
            .map_err(|err| DownloadFailure::Failed(JobOutcome::normal(err.to_string())))?;
        Ok(etag)
    }

    /// Failure epilogue: a zero-byte temp artifact is worthless, so drop it
    /// and the resume record; anything partial survives for the next run.
    async fn download_failed(
        &mut self,
        item: &SyncItem,
        tmp_path: &Path,
        outcome: JobOutcome,
    ) -> JobOutcome {
        let empty = tokio::fs::metadata(tmp_path)
            .await
            .map(|meta| meta.len() == 0)
            .unwrap_or(false);
        if empty {
            let _ = tokio::fs::remove_file(tmp_path).await;
            if let Err(err) = self
                .journal
                .set_download_info(&item.path, DownloadInfo::default())
            {
                warn!(path = %item.path, %err, "could not clear download resume record");
            }
        }
        outcome
    }
}
