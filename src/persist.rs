//! Atomic artifact persistence
//!
//! Tunnel daemons re-read their config files at unpredictable moments, so
//! every artifact write goes through `write_atomic`: content lands in a
//! `.tmp` sibling, permissions are set while the file is still invisible
//! under its final name, then a same-directory rename makes it appear whole.
//! Readers observe either the old complete content or the new complete
//! content, never a truncation.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::error::{VpnError, VpnResult};

/// Owner-only mode for secret-bearing artifacts.
pub const MODE_SECRET: u32 = 0o600;
/// World-readable mode for non-secret server configs.
pub const MODE_PUBLIC: u32 = 0o644;

/// Write `content` to `path` atomically with the given permission mode.
///
/// Errors are reduced to the path and an `io::ErrorKind`. Artifact content
/// regularly includes PSKs and private keys, so the underlying error text
/// is never propagated.
pub async fn write_atomic(path: &Path, content: &str, mode: u32) -> VpnResult<()> {
    let tmp = tmp_sibling(path);

    match stage_and_rename(path, &tmp, content, mode).await {
        Ok(()) => {
            debug!("Wrote {:?} ({} bytes, mode {:o})", path, content.len(), mode);
            Ok(())
        }
        Err(kind) => {
            // Best effort; the tmp file may never have been created.
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(VpnError::PersistenceFailure {
                path: path.display().to_string(),
                kind,
            })
        }
    }
}

async fn stage_and_rename(
    path: &Path,
    tmp: &Path,
    content: &str,
    mode: u32,
) -> Result<(), io::ErrorKind> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(tmp, content).await.map_err(|e| e.kind())?;

    // Permissions must be final before the rename makes the file visible.
    let perms = std::fs::Permissions::from_mode(mode);
    tokio::fs::set_permissions(tmp, perms)
        .await
        .map_err(|e| e.kind())?;

    tokio::fs::rename(tmp, path).await.map_err(|e| e.kind())?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_os_string();
    staged.push(".tmp");
    PathBuf::from(staged)
}

/// Ensure a directory exists, creating it if necessary.
pub async fn ensure_directory_exists(path: &Path) -> VpnResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| {
                VpnError::ServiceError(format!("Failed to create directory {:?}: {}", path, e))
            })?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Permission bits of an existing file, if it exists.
pub async fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|m| m.permissions().mode() & 0o777)
}

/// Modification time of a file, if it exists and the filesystem reports one.
pub async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_tmp_sibling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipsec.conf");

        write_atomic(&path, "config setup\n", MODE_PUBLIC).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "config setup\n");
        let tmp = dir.path().join("ipsec.conf.tmp");
        assert!(!tmp.exists(), "tmp sibling must not survive a successful write");
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_whole_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wg0.conf");

        write_atomic(&path, "first version with a long tail\n", MODE_SECRET)
            .await
            .unwrap();
        write_atomic(&path, "second\n", MODE_SECRET).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[tokio::test]
    async fn test_secret_mode_applied_before_visibility() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipsec.secrets");

        write_atomic(&path, ": PSK \"abc\"\n", MODE_SECRET).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_public_mode_for_server_configs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.conf");

        write_atomic(&path, "port 1194\n", MODE_PUBLIC).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[tokio::test]
    async fn test_failure_is_generic_and_cleans_tmp() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no-such-dir").join("ipsec.secrets");

        let secret = "PSK-SUPER-SECRET-VALUE";
        let err = write_atomic(&missing, secret, MODE_SECRET).await.unwrap_err();

        let msg = err.to_string();
        assert!(!msg.contains(secret), "error text must never carry content");
        assert!(msg.contains("ipsec.secrets"), "error names the target path");
        assert!(matches!(err, VpnError::PersistenceFailure { .. }));

        let tmp = dir.path().join("no-such-dir").join("ipsec.secrets.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_rapid_successive_writes_stay_consistent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");

        for i in 0..20 {
            let content = format!("{{\"generation\": {}}}\n", i);
            write_atomic(&path, &content, MODE_PUBLIC).await.unwrap();
            assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
        }
    }

    #[tokio::test]
    async fn test_file_mode_and_mtime_helpers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("airports.json");

        assert_eq!(file_mode(&path).await, None);
        assert!(file_mtime(&path).await.is_none());

        write_atomic(&path, "{}", MODE_SECRET).await.unwrap();
        assert_eq!(file_mode(&path).await, Some(0o600));
        assert!(file_mtime(&path).await.is_some());
    }
}
