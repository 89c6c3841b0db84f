//! Data directory creation and permission gate
//!
//! The data directory holds tokens and the IPC socket, so it must not be
//! readable by other users. The gate runs before any listener opens; a loose
//! mode is fatal (exit code 5 at the CLI boundary).

use std::path::Path;

use crate::error::{StorageError, StorageResult};

/// Create the data directory if missing and verify its permissions
///
/// On Unix the directory must be mode `0700`; anything looser is rejected.
/// Subdirectories used by the index and log rings are created alongside.
pub fn ensure_data_dir(path: &Path) -> StorageResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        #[cfg(unix)]
        set_mode(path, 0o700)?;
    }

    #[cfg(unix)]
    check_mode(path)?;

    std::fs::create_dir_all(path.join("index"))?;
    std::fs::create_dir_all(path.join("logs"))?;

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(unix)]
fn check_mode(path: &Path) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(StorageError::InsecureDataDir {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_dir_is_created_secure() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        ensure_data_dir(&dir).unwrap();

        assert!(dir.join("index").is_dir());
        assert!(dir.join("logs").is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_mode_rejected_with_chmod_hint() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = ensure_data_dir(&dir).unwrap_err();
        assert!(matches!(err, StorageError::InsecureDataDir { .. }));
        assert!(err.to_string().contains("chmod 0700"));
    }
}
