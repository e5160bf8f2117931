use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("sync path is empty")]
    Empty,
    #[error("sync path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a `/`-separated sync path under the local root.
pub fn local_path_for(root: &Path, sync_path: &str) -> Result<PathBuf, PathError> {
    if sync_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(sync_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Hidden temp name for an in-progress download, in the same directory as
/// the destination so the publish rename stays on one filesystem.
pub fn hidden_temp_name(sync_path: &str) -> String {
    let suffix: u32 = rand::random();
    match sync_path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/.{name}.~{suffix:x}"),
        None => format!(".{sync_path}.~{suffix:x}"),
    }
}

/// Backup name for a conflicted local file: `_conflict-<stamp>` goes in
/// front of the extension, or at the very end when the name has none (the
/// last `.` in `foo.bar/file` or `.hidden` does not count).
pub fn conflict_backup_path(sync_path: &str, modtime: i64) -> String {
    let stamp = conflict_stamp(modtime);
    let after_slash = sync_path.rfind('/').map_or(0, |slash| slash + 1);
    let dot = match sync_path.rfind('.') {
        Some(dot) if dot > after_slash => dot,
        _ => sync_path.len(),
    };
    format!(
        "{}_conflict-{}{}",
        &sync_path[..dot],
        stamp,
        &sync_path[dot..]
    )
}

fn conflict_stamp(modtime: i64) -> String {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    OffsetDateTime::from_unix_timestamp(modtime)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&format)
        .unwrap_or_default()
}

/// Byte-for-byte comparison; an unreadable side counts as different.
pub async fn files_equal(a: &Path, b: &Path) -> bool {
    let (Ok(mut fa), Ok(mut fb)) = (
        tokio::fs::File::open(a).await,
        tokio::fs::File::open(b).await,
    ) else {
        tracing::debug!(?a, ?b, "files_equal: failed to open one side");
        return false;
    };
    let (Ok(ma), Ok(mb)) = (fa.metadata().await, fb.metadata().await) else {
        return false;
    };
    if ma.len() != mb.len() {
        return false;
    }

    let mut buf_a = vec![0u8; 16 * 1024];
    let mut buf_b = vec![0u8; 16 * 1024];
    loop {
        let Ok(read_a) = fa.read(&mut buf_a).await else {
            return false;
        };
        if read_a == 0 {
            return true;
        }
        let Ok(_) = fb.read_exact(&mut buf_b[..read_a]).await else {
            return false;
        };
        if buf_a[..read_a] != buf_b[..read_a] {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_sync_path_under_root() {
        let root = PathBuf::from("/sync");
        let mapped = local_path_for(&root, "Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/sync/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir_components() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(local_path_for(&root, ""), Err(PathError::Empty)));
    }

    #[test]
    fn temp_name_hides_the_basename_in_place() {
        let name = hidden_temp_name("a/b.txt");
        assert!(name.starts_with("a/.b.txt.~"), "got {name}");
        let flat = hidden_temp_name("b.txt");
        assert!(flat.starts_with(".b.txt.~"), "got {flat}");
    }

    #[test]
    fn conflict_suffix_goes_before_the_extension() {
        assert_eq!(
            conflict_backup_path("a/b.txt", 1388577600),
            "a/b_conflict-20140101-120000.txt"
        );
    }

    #[test]
    fn conflict_suffix_appends_when_there_is_no_extension() {
        assert_eq!(
            conflict_backup_path("x", 1388577600),
            "x_conflict-20140101-120000"
        );
        assert_eq!(
            conflict_backup_path("a/.hidden", 1388577600),
            "a/.hidden_conflict-20140101-120000"
        );
        assert_eq!(
            conflict_backup_path("foo.bar/file", 1388577600),
            "foo.bar/file_conflict-20140101-120000"
        );
    }

    #[tokio::test]
    async fn files_equal_compares_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        std::fs::write(&c, b"other byte").unwrap();

        assert!(files_equal(&a, &b).await);
        assert!(!files_equal(&a, &c).await);
        assert!(!files_equal(&a, &dir.path().join("missing")).await);
    }
}
