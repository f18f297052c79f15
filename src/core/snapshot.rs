//! Pre-change snapshots of the `filter` table
//!
//! Before any mutation the applier saves the current table to a fixed backup
//! path (default [`DEFAULT_BACKUP_PATH`]) and keeps a timestamped copy in the
//! state directory. Restoring from one of these files is the only recovery
//! path after a failed apply.

use crate::core::error::{Error, Result, SnapshotError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Fixed location of the most recent pre-change backup
pub const DEFAULT_BACKUP_PATH: &str = "/tmp/iptables-backup.rules";

/// Timestamped copies kept in the state directory
pub const DEFAULT_RETENTION: usize = 5;

/// A snapshot written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub checksum: String,
}

/// Checks that text looks like `iptables-save` output for the filter table.
///
/// # Errors
///
/// Returns `Err` if:
/// - Snapshot is empty
/// - Snapshot has no `*filter` table header
/// - Snapshot has no `COMMIT` line
pub fn validate_snapshot(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(SnapshotError::Empty.into());
    }

    let mut lines = text.lines().map(str::trim);

    if !lines.clone().any(|l| l == "*filter") {
        return Err(SnapshotError::Corrupted("missing *filter table".to_string()).into());
    }

    if !lines.any(|l| l == "COMMIT") {
        return Err(SnapshotError::Corrupted("missing COMMIT line".to_string()).into());
    }

    Ok(())
}

/// Computes SHA-256 checksum of snapshot text.
pub fn compute_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Writes a file readable only by its owner.
///
/// The content goes to a fresh temp file in the same directory, which is then
/// renamed over `path`. A symlink or foreign file already at `path` is
/// replaced, never written through.
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Path of the `sha256sum`-style sidecar stored next to a snapshot
pub fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Writes `text` to `path` and its checksum to the sidecar.
fn write_with_checksum(text: &str, path: &Path) -> Result<SnapshotInfo> {
    write_private(path, text)?;

    let checksum = compute_checksum(text);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    write_private(&checksum_path(path), &format!("{checksum}  {file_name}\n"))?;

    Ok(SnapshotInfo {
        path: path.to_path_buf(),
        checksum,
    })
}

/// Writes the pre-change backup to `path`.
///
/// # Errors
///
/// Returns `Err` if the file cannot be written. An empty snapshot is still
/// written: a pristine table is a legitimate thing to go back to.
pub fn write_backup(text: &str, path: &Path) -> Result<SnapshotInfo> {
    let info = write_with_checksum(text, path)?;
    info!("Backup written to {:?} (sha256 {})", path, info.checksum);
    Ok(info)
}

/// Saves a timestamped copy into `dir`, keeping the newest `retention` copies.
pub fn archive_snapshot(text: &str, dir: &Path, retention: usize) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
    let path = dir.join(format!("snapshot_{timestamp}.rules"));
    write_with_checksum(text, &path)?;
    info!("Snapshot archived to {:?}", path);

    cleanup_old_snapshots(dir, retention)?;
    Ok(path)
}

/// Lists archived snapshots in `dir`, newest first.
pub fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("snapshot_") && n.ends_with(".rules"))
        })
        .collect();

    // Names embed a sortable timestamp
    snapshots.sort();
    snapshots.reverse();
    Ok(snapshots)
}

fn cleanup_old_snapshots(dir: &Path, retention: usize) -> Result<()> {
    let mut snapshots = list_snapshots(dir)?;

    if snapshots.len() > retention {
        for snapshot in snapshots.drain(retention..) {
            if let Err(e) = std::fs::remove_file(&snapshot) {
                warn!("Failed to remove old snapshot {:?}: {}", snapshot, e);
                continue;
            }
            info!("Removed old snapshot: {:?}", snapshot);

            let sidecar = checksum_path(&snapshot);
            if let Err(e) = std::fs::remove_file(&sidecar)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove {:?}: {}", sidecar, e);
            }
        }
    }

    Ok(())
}

/// Reads a file only if no one but the current user could have written it.
///
/// Symlinks, non-regular files, files owned by another uid and files writable
/// by group or others are refused. Checks run on the opened descriptor.
fn read_trusted(path: &Path) -> Result<String> {
    use std::io::Read;
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

    let untrusted = |reason: String| -> Error {
        SnapshotError::Untrusted {
            path: path.display().to_string(),
            reason,
        }
        .into()
    };

    let mut file = match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::fcntl::OFlag::O_NOFOLLOW.bits())
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::NotFound(path.display().to_string()).into());
        }
        Err(e) if e.raw_os_error() == Some(nix::libc::ELOOP) => {
            return Err(untrusted("it is a symbolic link".to_string()));
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let meta = file.metadata()?;
    if !meta.file_type().is_file() {
        return Err(untrusted("it is not a regular file".to_string()));
    }

    let euid = nix::unistd::geteuid().as_raw();
    if meta.uid() != euid {
        return Err(untrusted(format!(
            "it is owned by uid {}, not {euid}",
            meta.uid()
        )));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(untrusted(format!(
            "it is writable by group or others (mode {:o})",
            meta.mode() & 0o777
        )));
    }

    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

/// Reads and validates a snapshot file.
///
/// # Errors
///
/// Returns `SnapshotError::NotFound` when the file does not exist,
/// `SnapshotError::Untrusted` when someone else could have modified it, or a
/// validation error when its contents are not a filter table.
pub fn load_snapshot(path: &Path) -> Result<String> {
    let text = read_trusted(path)?;
    validate_snapshot(&text)?;
    Ok(text)
}

/// Like [`load_snapshot`], and also checks the sidecar checksum when one exists.
///
/// Snapshots from elsewhere have no sidecar; those load with a warning.
pub fn load_verified_snapshot(path: &Path) -> Result<String> {
    let text = load_snapshot(path)?;

    match read_trusted(&checksum_path(path)) {
        Ok(sidecar) => {
            let expected = sidecar.split_whitespace().next().unwrap_or_default();
            verify_checksum(&text, expected)?;
        }
        Err(Error::Snapshot(SnapshotError::NotFound(_))) => {
            warn!("No checksum file for {:?}; restoring unverified", path);
        }
        Err(e) => return Err(e),
    }

    Ok(text)
}

/// Verifies snapshot text against an expected checksum.
pub fn verify_checksum(text: &str, expected: &str) -> Result<()> {
    let actual = compute_checksum(text);
    if actual == expected {
        Ok(())
    } else {
        Err(SnapshotError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\nCOMMIT\n";

    #[test]
    fn test_validate_snapshot_valid() {
        assert!(validate_snapshot(SAMPLE).is_ok());
    }

    #[test]
    fn test_validate_snapshot_empty() {
        assert!(matches!(
            validate_snapshot("  \n"),
            Err(Error::Snapshot(SnapshotError::Empty))
        ));
    }

    #[test]
    fn test_validate_snapshot_missing_table() {
        let text = ":INPUT ACCEPT [0:0]\nCOMMIT\n";
        assert!(matches!(
            validate_snapshot(text),
            Err(Error::Snapshot(SnapshotError::Corrupted(_)))
        ));
    }

    #[test]
    fn test_validate_snapshot_missing_commit() {
        let text = "*filter\n:INPUT ACCEPT [0:0]\n";
        assert!(validate_snapshot(text).is_err());
    }

    #[test]
    fn test_compute_checksum_deterministic() {
        let checksum1 = compute_checksum(SAMPLE);
        let checksum2 = compute_checksum(SAMPLE);

        assert_eq!(checksum1, checksum2);
        assert_eq!(checksum1.len(), 64); // SHA-256 hex string length
        assert_ne!(checksum1, compute_checksum("*filter\nCOMMIT\n"));
    }

    #[test]
    fn test_verify_checksum() {
        let checksum = compute_checksum(SAMPLE);
        assert!(verify_checksum(SAMPLE, &checksum).is_ok());
        assert!(matches!(
            verify_checksum("*filter\nCOMMIT\n", &checksum),
            Err(Error::Snapshot(SnapshotError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_write_backup_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.rules");

        let info = write_backup(SAMPLE, &path).unwrap();
        assert_eq!(info.path, path);
        assert_eq!(info.checksum, compute_checksum(SAMPLE));
        assert_eq!(load_snapshot(&path).unwrap(), SAMPLE);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_write_backup_replaces_planted_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim.conf");
        std::fs::write(&victim, "important\n").unwrap();
        let path = dir.path().join("iptables-backup.rules");
        std::os::unix::fs::symlink(&victim, &path).unwrap();

        write_backup(SAMPLE, &path).unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "important\n");
        assert!(!std::fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        assert_eq!(load_snapshot(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn test_write_backup_resets_loose_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.rules");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        write_backup(SAMPLE, &path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_refuses_writable_by_others() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.rules");
        std::fs::write(&path, SAMPLE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(Error::Snapshot(SnapshotError::Untrusted { .. }))
        ));
    }

    #[test]
    fn test_load_refuses_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real.rules");
        write_backup(SAMPLE, &target).unwrap();
        let link = dir.path().join("link.rules");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(matches!(
            load_snapshot(&link),
            Err(Error::Snapshot(SnapshotError::Untrusted { .. }))
        ));
    }

    #[test]
    fn test_backup_sidecar_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.rules");

        let info = write_backup(SAMPLE, &path).unwrap();
        let sidecar = std::fs::read_to_string(checksum_path(&path)).unwrap();

        assert_eq!(sidecar, format!("{}  backup.rules\n", info.checksum));
        assert_eq!(load_verified_snapshot(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn test_tampered_backup_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.rules");
        write_backup(SAMPLE, &path).unwrap();

        // Still a valid table and still 0600, but not what was saved
        let tampered = SAMPLE.replace(
            "COMMIT",
            "-A INPUT -p tcp -m tcp --dport 4444 -j ACCEPT\nCOMMIT",
        );
        std::fs::write(&path, tampered).unwrap();

        assert!(load_snapshot(&path).is_ok());
        assert!(matches!(
            load_verified_snapshot(&path),
            Err(Error::Snapshot(SnapshotError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_snapshot_without_sidecar_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hand-made.rules");
        write_private(&path, SAMPLE).unwrap();

        assert_eq!(load_verified_snapshot(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn test_load_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_snapshot(&dir.path().join("nope.rules"));
        assert!(matches!(
            result,
            Err(Error::Snapshot(SnapshotError::NotFound(_)))
        ));
    }

    #[test]
    fn test_archive_rotation() {
        let dir = tempfile::tempdir().unwrap();

        // Pre-seed older snapshots with sortable names
        for i in 0..4 {
            let name = format!("snapshot_20200101_00000{i}_000.rules");
            std::fs::write(dir.path().join(name), SAMPLE).unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), "keep").unwrap();

        let newest = archive_snapshot(SAMPLE, dir.path(), 3).unwrap();
        let snapshots = list_snapshots(dir.path()).unwrap();

        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0], newest);
        assert!(dir.path().join("unrelated.txt").exists());
        assert!(checksum_path(&newest).exists());
        assert!(!dir.path().join("snapshot_20200101_000000_000.rules").exists());
    }
}
