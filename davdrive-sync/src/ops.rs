use davdrive_core::{classify_error, classify_status};
use reqwest::StatusCode;
use tracing::debug;

use crate::item::{JobStatus, SyncItem};
use crate::journal::{FileRecord, Journal};
use crate::paths::local_path_for;
use crate::propagator::{JobOutcome, Propagator};

/// The server-managed top-level share folder; renaming it client-side is
/// always refused.
const SHARED_FOLDER: &str = "Shared";

impl<J: Journal> Propagator<J> {
    pub(crate) async fn propagate_local_remove(&mut self, item: &SyncItem) -> JobOutcome {
        let local = match local_path_for(&self.local_root, &item.path) {
            Ok(local) => local,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };
        // An already-absent target is fine; the journal entry still goes.
        if tokio::fs::metadata(&local).await.is_ok() {
            let removed = if item.is_directory {
                tokio::fs::remove_dir_all(&local).await
            } else {
                tokio::fs::remove_file(&local).await
            };
            if let Err(err) = removed {
                return JobOutcome::normal(format!(
                    "could not remove {}: {err}",
                    local.display()
                ));
            }
        }
        if let Err(err) = self.journal.delete_file_record(&item.original_path, false) {
            return JobOutcome::normal(err.to_string());
        }
        JobOutcome::success()
    }

    pub(crate) async fn propagate_local_mkdir(&mut self, item: &SyncItem) -> JobOutcome {
        let local = match local_path_for(&self.local_root, &item.path) {
            Ok(local) => local,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };
        if let Err(err) = tokio::fs::create_dir_all(&local).await {
            return JobOutcome::normal(format!(
                "could not create directory {}: {err}",
                local.display()
            ));
        }
        JobOutcome::success()
    }

    pub(crate) async fn propagate_remote_remove(&mut self, item: &SyncItem) -> JobOutcome {
        debug!(path = %item.path, "DELETE");
        // 404 means it is already gone.
        let classified = match self.client.delete(&item.path).await {
            Ok(response) => classify_status(response.status(), Some(StatusCode::NOT_FOUND)),
            Err(err) => classify_error(&err, Some(StatusCode::NOT_FOUND)),
        };
        if !classified.is_success() {
            return JobOutcome::from_classified(classified);
        }
        if let Err(err) = self
            .journal
            .delete_file_record(&item.original_path, item.is_directory)
        {
            return JobOutcome::normal(err.to_string());
        }
        JobOutcome::success()
    }

    pub(crate) async fn propagate_remote_mkdir(&mut self, item: &SyncItem) -> JobOutcome {
        // MKCOL answers 405 when the collection already exists.
        let classified = match self.client.mkcol(&item.path).await {
            Ok(response) => {
                classify_status(response.status(), Some(StatusCode::METHOD_NOT_ALLOWED))
            }
            Err(err) => classify_error(&err, Some(StatusCode::METHOD_NOT_ALLOWED)),
        };
        if !classified.is_success() {
            return JobOutcome::from_classified(classified);
        }
        JobOutcome::success()
    }

    pub(crate) async fn propagate_local_rename(&mut self, item: &mut SyncItem) -> JobOutcome {
        if item.path != item.rename_target {
            let from = match local_path_for(&self.local_root, &item.path) {
                Ok(from) => from,
                Err(err) => return JobOutcome::normal(err.to_string()),
            };
            let to = match local_path_for(&self.local_root, &item.rename_target) {
                Ok(to) => to,
                Err(err) => return JobOutcome::normal(err.to_string()),
            };
            debug!(from = %from.display(), to = %to.display(), "local MOVE");
            if let Err(err) = tokio::fs::rename(&from, &to).await {
                return JobOutcome::normal(err.to_string());
            }
        }
        self.journal_rename(item)
    }

    pub(crate) async fn propagate_remote_rename(&mut self, item: &mut SyncItem) -> JobOutcome {
        if item.path == item.rename_target {
            // The parent was renamed already, so there is nothing to move;
            // still fetch fresh metadata because the server does not keep
            // mtimes across moves.
            if !item.is_directory {
                let target = item.rename_target.clone();
                if let Err(message) = self.update_mtime_and_etag(item, &target).await {
                    return JobOutcome::with_status(self.rename_refresh_status(), message);
                }
            }
        } else if item.path == SHARED_FOLDER {
            let renamed_back = match (
                local_path_for(&self.local_root, &item.rename_target),
                local_path_for(&self.local_root, SHARED_FOLDER),
            ) {
                (Ok(from), Ok(to)) => tokio::fs::rename(&from, &to).await.is_ok(),
                _ => false,
            };
            let message = if renamed_back {
                "This folder must not be renamed. It is renamed back to its original name."
            } else {
                "This folder must not be renamed. Please name it back to Shared."
            };
            return JobOutcome::normal(message);
        } else {
            let classified = match self.client.move_to(&item.path, &item.rename_target).await {
                Ok(response) => classify_status(response.status(), None),
                Err(err) => classify_error(&err, None),
            };
            if !classified.is_success() {
                return JobOutcome::from_classified(classified);
            }
            let target = item.rename_target.clone();
            if let Err(message) = self.update_mtime_and_etag(item, &target).await {
                return JobOutcome::with_status(self.rename_refresh_status(), message);
            }
        }
        self.journal_rename(item)
    }

    /// Rename bookkeeping: the record moves from the original path to the
    /// rename target.
    fn journal_rename(&mut self, item: &SyncItem) -> JobOutcome {
        if let Err(err) = self.journal.delete_file_record(&item.original_path, false) {
            return JobOutcome::normal(err.to_string());
        }
        let local = match local_path_for(&self.local_root, &item.rename_target) {
            Ok(local) => local,
            Err(err) => return JobOutcome::normal(err.to_string()),
        };
        let mut record = FileRecord::from_item(item, &local);
        record.path = item.rename_target.clone();
        if let Err(err) = self.journal.set_file_record(record) {
            return JobOutcome::normal(err.to_string());
        }
        JobOutcome::success()
    }

    fn rename_refresh_status(&self) -> JobStatus {
        if self.config.soft_rename_metadata {
            JobStatus::SoftError
        } else {
            JobStatus::NormalError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::item::{Direction, Instruction};
    use crate::journal::{MemoryJournal, RecordKind};
    use davdrive_core::DavClient;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_propagator(server: &MockServer, root: &Path) -> Propagator<MemoryJournal> {
        let client = DavClient::new(&server.uri(), "u", "p").unwrap();
        Propagator::new(client, MemoryJournal::new(), root.to_path_buf())
    }

    fn item(path: &str, instruction: Instruction, is_dir: bool) -> SyncItem {
        SyncItem {
            path: path.to_string(),
            original_path: path.to_string(),
            rename_target: String::new(),
            direction: Direction::Up,
            instruction,
            is_directory: is_dir,
            size: 0,
            modtime: 1_400_000_000,
            etag: "tag".into(),
            file_id: "fid".into(),
        }
    }

    fn seed_record(propagator: &mut Propagator<MemoryJournal>, path: &str) {
        propagator
            .journal
            .set_file_record(FileRecord {
                path: path.to_string(),
                inode: 0,
                uid: 0,
                gid: 0,
                mode: 0,
                modtime: 0,
                kind: RecordKind::File,
                etag: "old".into(),
                file_id: "fid".into(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn local_remove_deletes_recursively_including_hidden_entries() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("gone/sub")).unwrap();
        std::fs::write(dir.path().join("gone/.hidden"), b"x").unwrap();
        std::fs::write(dir.path().join("gone/sub/file"), b"x").unwrap();

        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "gone");
        let outcome = propagator
            .propagate_local_remove(&item("gone", Instruction::Remove, true))
            .await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert!(!dir.path().join("gone").exists());
        assert!(propagator.journal().file_record("gone").is_none());
    }

    #[tokio::test]
    async fn local_remove_of_missing_target_still_clears_the_record() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "never-there.txt");

        let outcome = propagator
            .propagate_local_remove(&item("never-there.txt", Instruction::Remove, false))
            .await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert!(propagator.journal().file_record("never-there.txt").is_none());
    }

    #[tokio::test]
    async fn local_mkdir_creates_missing_parents() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());

        let outcome = propagator
            .propagate_local_mkdir(&item("a/b/c", Instruction::New, true))
            .await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn remote_remove_treats_404_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/gone.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "gone.txt");

        let outcome = propagator
            .propagate_remote_remove(&item("gone.txt", Instruction::Remove, false))
            .await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert!(propagator.journal().file_record("gone.txt").is_none());
    }

    #[tokio::test]
    async fn remote_remove_failure_keeps_the_record() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/locked.txt"))
            .respond_with(ResponseTemplate::new(423))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "locked.txt");

        let outcome = propagator
            .propagate_remote_remove(&item("locked.txt", Instruction::Remove, false))
            .await;

        assert_eq!(outcome.status, JobStatus::NormalError);
        assert!(propagator.journal().file_record("locked.txt").is_some());
    }

    #[tokio::test]
    async fn remote_mkdir_treats_405_as_already_there() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path("/Docs"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        let outcome = propagator
            .propagate_remote_mkdir(&item("Docs", Instruction::New, true))
            .await;
        assert_eq!(outcome.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn local_rename_moves_the_file_and_its_record() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), b"data").unwrap();

        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "old.txt");
        let mut renamed = item("old.txt", Instruction::Rename, false);
        renamed.rename_target = "new.txt".into();

        let outcome = propagator.propagate_local_rename(&mut renamed).await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"data");
        assert!(propagator.journal().file_record("old.txt").is_none());
        assert_eq!(
            propagator.journal().file_record("new.txt").unwrap().path,
            "new.txt"
        );
    }

    #[tokio::test]
    async fn remote_rename_moves_then_refreshes_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("MOVE"))
            .and(path("/old.txt"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PROPPATCH"))
            .and(path("/new.txt"))
            .respond_with(ResponseTemplate::new(207))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"moved\"")
                    .insert_header("OC-FileId", "fid"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        seed_record(&mut propagator, "old.txt");
        let mut renamed = item("old.txt", Instruction::Rename, false);
        renamed.rename_target = "new.txt".into();

        let outcome = propagator.propagate_remote_rename(&mut renamed).await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(renamed.etag, "moved");
        assert!(propagator.journal().file_record("old.txt").is_none());
        assert_eq!(
            propagator.journal().file_record("new.txt").unwrap().etag,
            "moved"
        );
    }

    #[tokio::test]
    async fn same_path_rename_only_refreshes_the_new_uri() {
        let server = MockServer::start().await;
        Mock::given(method("MOVE"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PROPPATCH"))
            .and(path("/dir/leaf.txt"))
            .respond_with(ResponseTemplate::new(207))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dir/leaf.txt"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"fresh\""))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        let mut moved = item("dir/leaf.txt", Instruction::Rename, false);
        moved.rename_target = "dir/leaf.txt".into();

        let outcome = propagator.propagate_remote_rename(&mut moved).await;

        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(moved.etag, "fresh");
    }

    #[tokio::test]
    async fn renaming_the_shared_folder_is_refused_and_undone() {
        let server = MockServer::start().await;
        Mock::given(method("MOVE"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Public")).unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        let mut renamed = item("Shared", Instruction::Rename, true);
        renamed.rename_target = "Public".into();

        let outcome = propagator.propagate_remote_rename(&mut renamed).await;

        assert_eq!(outcome.status, JobStatus::NormalError);
        assert_eq!(
            outcome.message.as_deref(),
            Some("This folder must not be renamed. It is renamed back to its original name.")
        );
        assert!(dir.path().join("Shared").is_dir());
        assert!(!dir.path().join("Public").exists());
    }

    #[tokio::test]
    async fn failed_refresh_after_move_is_soft_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("MOVE"))
            .and(path("/old.txt"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("PROPPATCH"))
            .respond_with(ResponseTemplate::new(207))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut propagator = make_propagator(&server, dir.path());
        let mut renamed = item("old.txt", Instruction::Rename, false);
        renamed.rename_target = "new.txt".into();

        let outcome = propagator.propagate_remote_rename(&mut renamed).await;
        assert_eq!(outcome.status, JobStatus::SoftError);

        let mut strict = make_propagator(&server, dir.path()).with_config(EngineConfig {
            soft_rename_metadata: false,
            ..EngineConfig::default()
        });
        let mut renamed = item("old.txt", Instruction::Rename, false);
        renamed.rename_target = "new.txt".into();
        let outcome = strict.propagate_remote_rename(&mut renamed).await;
        assert_eq!(outcome.status, JobStatus::NormalError);
    }
}
