use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use davdrive_core::{Classified, DavClient, response_etag, response_file_id};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::item::{Direction, Instruction, JobStatus, SyncItem};
use crate::journal::{FileRecord, Journal};
use crate::paths::local_path_for;
use crate::progress::{ProgressEvent, ProgressKind, ProgressSender};

/// Outcome of one leaf job, as handed upward to the directory job.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobOutcome {
    pub status: JobStatus,
    pub message: Option<String>,
}

impl JobOutcome {
    pub(crate) fn success() -> Self {
        Self {
            status: JobStatus::Success,
            message: None,
        }
    }

    pub(crate) fn conflict() -> Self {
        Self {
            status: JobStatus::Conflict,
            message: None,
        }
    }

    pub(crate) fn normal(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::NormalError,
            message: Some(message.into()),
        }
    }

    pub(crate) fn with_status(status: JobStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    pub(crate) fn from_classified(classified: Classified) -> Self {
        Self {
            status: JobStatus::from(classified.class),
            message: classified.message,
        }
    }
}

/// Per-item result surfaced to the caller after the run.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub item: SyncItem,
    pub status: JobStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropagateReport {
    pub status: JobStatus,
    pub items: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Upload,
    Download,
    LocalRemove,
    RemoteRemove,
    LocalMkdir,
    RemoteMkdir,
    LocalRename,
    RemoteRename,
    Ignore,
}

pub(crate) struct ItemJob {
    pub kind: JobKind,
    pub item: SyncItem,
}

pub(crate) enum PropagatorJob {
    Directory(DirectoryJob),
    Item(ItemJob),
}

/// One directory level of the job tree: the directory's own job first,
/// then the children strictly in input order.
pub(crate) struct DirectoryJob {
    pub item: Option<SyncItem>,
    pub first_job: Option<ItemJob>,
    pub jobs: Vec<PropagatorJob>,
}

impl DirectoryJob {
    fn root() -> Self {
        Self {
            item: None,
            first_job: None,
            jobs: Vec::new(),
        }
    }
}

/// The run context: one shared HTTP session, one journal, one abort flag.
/// Everything a job needs arrives through here rather than via globals.
pub struct Propagator<J: Journal> {
    pub(crate) client: DavClient,
    pub(crate) journal: J,
    pub(crate) local_root: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) progress: Option<ProgressSender>,
    outcomes: Vec<ItemOutcome>,
}

impl<J: Journal> Propagator<J> {
    pub fn new(client: DavClient, journal: J, local_root: PathBuf) -> Self {
        Self {
            client,
            journal,
            local_root,
            config: EngineConfig::default(),
            abort: Arc::new(AtomicBool::new(false)),
            progress: None,
            outcomes: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Monotonic abort flag; settable from outside the run. Transfers stop
    /// at the next chunk boundary, leaving resume records in place.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut J {
        &mut self.journal
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    pub(crate) fn notify_progress(&self, kind: ProgressKind, path: &str, done: u64, total: u64) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(ProgressEvent {
                kind,
                path: path.to_string(),
                done,
                total,
            });
        }
    }

    /// Executes the reconciler's instructions. The input is expected to be
    /// sorted by path so that every directory precedes its descendants; it
    /// is re-sorted here as a guard.
    pub async fn run(&mut self, mut items: Vec<SyncItem>) -> PropagateReport {
        items.sort_by(|a, b| a.path.cmp(&b.path));
        let mut root = build_job_tree(items);
        self.outcomes.clear();
        let status = self.run_directory(&mut root).await;
        PropagateReport {
            status,
            items: mem::take(&mut self.outcomes),
        }
    }

    fn run_directory<'a>(&'a mut self, dir: &'a mut DirectoryJob) -> BoxFuture<'a, JobStatus> {
        Box::pin(async move {
            let mut has_error = false;

            if let Some(first) = dir.first_job.as_mut() {
                match self.run_item(first).await {
                    JobStatus::FatalError => return JobStatus::FatalError,
                    JobStatus::NormalError => has_error = true,
                    _ => {}
                }
            }

            for child in dir.jobs.iter_mut() {
                let status = match child {
                    PropagatorJob::Directory(sub) => self.run_directory(sub).await,
                    PropagatorJob::Item(job) => self.run_item(job).await,
                };
                match status {
                    JobStatus::FatalError => return JobStatus::FatalError,
                    JobStatus::NormalError => has_error = true,
                    _ => {}
                }
            }

            // A cleanly finished directory gets its own journal record;
            // removed directories had theirs deleted by their first job.
            if let Some(item) = dir.item.as_ref()
                && !has_error
                && item.instruction != Instruction::Remove
            {
                match local_path_for(&self.local_root, &item.path) {
                    Ok(local) => {
                        if let Err(err) = self
                            .journal
                            .set_file_record(FileRecord::from_item(item, &local))
                        {
                            warn!(path = %item.path, %err, "failed to journal directory record");
                            has_error = true;
                        }
                    }
                    Err(err) => {
                        warn!(path = %item.path, %err, "directory path does not map locally");
                        has_error = true;
                    }
                }
            }

            if has_error {
                JobStatus::NormalError
            } else {
                JobStatus::Success
            }
        })
    }

    async fn run_item(&mut self, job: &mut ItemJob) -> JobStatus {
        let outcome = if self.abort_requested() {
            JobOutcome::normal("sync aborted by user")
        } else {
            match job.kind {
                JobKind::Upload => self.propagate_upload(&mut job.item).await,
                JobKind::Download => self.propagate_download(&mut job.item).await,
                JobKind::LocalRemove => self.propagate_local_remove(&job.item).await,
                JobKind::RemoteRemove => self.propagate_remote_remove(&job.item).await,
                JobKind::LocalMkdir => self.propagate_local_mkdir(&job.item).await,
                JobKind::RemoteMkdir => self.propagate_remote_mkdir(&job.item).await,
                JobKind::LocalRename => self.propagate_local_rename(&mut job.item).await,
                JobKind::RemoteRename => self.propagate_remote_rename(&mut job.item).await,
                JobKind::Ignore => JobOutcome::success(),
            }
        };
        self.outcomes.push(ItemOutcome {
            item: job.item.clone(),
            status: outcome.status,
            message: outcome.message,
        });
        outcome.status
    }

    /// PROPPATCH the modtime, then HEAD back the resulting etag and file
    /// id. The server drops mtimes on MOVE, so every rename-like job ends
    /// here.
    pub(crate) async fn update_mtime_and_etag(
        &mut self,
        item: &mut SyncItem,
        path: &str,
    ) -> Result<(), String> {
        match self.client.proppatch_mtime(path, item.modtime).await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(path, status = %response.status(), "PROPPATCH of modified date failed");
            }
            Err(err) => {
                warn!(path, %err, "PROPPATCH of modified date failed");
            }
        }

        let response = match self.client.head(path).await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return Err(format!("HEAD for etag returned {}", response.status()));
            }
            Err(err) => return Err(format!("HEAD for etag failed: {err}")),
        };

        if let Some(etag) = response_etag(&response) {
            item.etag = etag;
        }
        self.adopt_file_id(item, response_file_id(&response));
        Ok(())
    }

    /// HEAD just for the file id, used when the upload response carried
    /// none. Failure is logged, not fatal.
    pub(crate) async fn fetch_file_id(&mut self, item: &mut SyncItem) {
        let path = item.path.clone();
        match self.client.head(&path).await {
            Ok(response) if response.status().is_success() => {
                self.adopt_file_id(item, response_file_id(&response));
            }
            Ok(response) => {
                debug!(path = %path, status = %response.status(), "HEAD for file id failed");
            }
            Err(err) => {
                debug!(path = %path, %err, "HEAD for file id failed");
            }
        }
    }

    /// File ids are write-once per path: adopt when unset, otherwise keep
    /// the original and log a mismatch.
    pub(crate) fn adopt_file_id(&self, item: &mut SyncItem, reported: Option<String>) {
        let Some(reported) = reported.filter(|id| !id.is_empty()) else {
            return;
        };
        if item.file_id.is_empty() {
            debug!(path = %item.path, file_id = %reported, "adopted file id");
            item.file_id = reported;
        } else if item.file_id != reported {
            warn!(
                path = %item.path,
                kept = %item.file_id,
                reported = %reported,
                "file id changed on the server; keeping the original"
            );
        }
    }
}

/// Leaf-job factory; `None` means the item needs no job of its own (a
/// directory that merely syncs).
fn create_job(item: &SyncItem) -> Option<JobKind> {
    match item.instruction {
        Instruction::Remove => Some(if item.direction == Direction::Down {
            JobKind::LocalRemove
        } else {
            JobKind::RemoteRemove
        }),
        Instruction::New if item.is_directory => Some(if item.direction == Direction::Down {
            JobKind::LocalMkdir
        } else {
            JobKind::RemoteMkdir
        }),
        Instruction::New | Instruction::Sync | Instruction::Conflict => {
            if item.is_directory {
                None
            } else if item.direction != Direction::Up {
                Some(JobKind::Download)
            } else {
                Some(JobKind::Upload)
            }
        }
        Instruction::Rename => Some(if item.direction == Direction::Up {
            JobKind::RemoteRename
        } else {
            JobKind::LocalRename
        }),
        Instruction::Ignore => Some(JobKind::Ignore),
    }
}

struct StackEntry {
    prefix: String,
    dir: DirectoryJob,
    deferred_removal: bool,
}

fn pop_entry(stack: &mut Vec<StackEntry>, deferred: &mut Vec<DirectoryJob>) {
    let entry = stack.pop().expect("job stack never empties below root");
    if entry.deferred_removal {
        deferred.push(entry.dir);
    } else {
        stack
            .last_mut()
            .expect("root entry is never popped")
            .dir
            .jobs
            .push(PropagatorJob::Directory(entry.dir));
    }
}

/// Builds the job tree from the sorted item sequence: each directory is a
/// `DirectoryJob` holding the files in it; directory removals are deferred
/// to the end of the root so contents go first.
fn build_job_tree(items: Vec<SyncItem>) -> DirectoryJob {
    let mut stack = vec![StackEntry {
        prefix: String::new(),
        dir: DirectoryJob::root(),
        deferred_removal: false,
    }];
    let mut deferred = Vec::new();
    let mut removed_prefix = String::new();

    for item in items {
        // Descendant removals are already taken care of by the removal of
        // the ancestor directory.
        if item.instruction == Instruction::Remove
            && !removed_prefix.is_empty()
            && item.path.starts_with(&removed_prefix)
        {
            continue;
        }

        while !item
            .path
            .starts_with(&stack.last().expect("root entry").prefix)
        {
            pop_entry(&mut stack, &mut deferred);
        }

        if item.is_directory {
            let deferred_removal = item.instruction == Instruction::Remove;
            if deferred_removal {
                removed_prefix = format!("{}/", item.path);
            }
            let prefix = format!("{}/", item.path);
            let first_job = create_job(&item).map(|kind| ItemJob {
                kind,
                item: item.clone(),
            });
            stack.push(StackEntry {
                prefix,
                dir: DirectoryJob {
                    item: Some(item),
                    first_job,
                    jobs: Vec::new(),
                },
                deferred_removal,
            });
        } else if let Some(kind) = create_job(&item) {
            stack
                .last_mut()
                .expect("root entry")
                .dir
                .jobs
                .push(PropagatorJob::Item(ItemJob { kind, item }));
        }
    }

    while stack.len() > 1 {
        pop_entry(&mut stack, &mut deferred);
    }
    let mut root = stack.pop().expect("root entry").dir;
    for dir in deferred {
        root.jobs.push(PropagatorJob::Directory(dir));
    }
    root
}
